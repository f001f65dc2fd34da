use std::sync::LazyLock;

use regex::Regex;

static BRACKETED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"《(.+?)》|"(.+?)"|\[(.+?)\]"#).expect("bracketed title pattern compiles")
});

/// Derives a display title from a file name: text inside `《》`, `""` or
/// `[]` wins, otherwise the name without its extension.
pub fn parse_title(file_name: &str) -> String {
    let name = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);

    let bracketed = BRACKETED.captures(name).and_then(|caps| {
        caps.iter()
            .skip(1)
            .flatten()
            .map(|m| m.as_str().trim())
            .find(|text| !text.is_empty())
            .map(str::to_string)
    });

    bracketed.unwrap_or_else(|| fallback_title(name))
}

fn fallback_title(name: &str) -> String {
    let stem = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name).trim();
    if stem.is_empty() {
        "untitled".to_string()
    } else {
        stem.to_string()
    }
}
