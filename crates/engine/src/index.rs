//! Chapter boundary indexing with exact byte accounting.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::LazyLock;

use encoding_rs::{Encoding, GB18030, GBK};
use log::{debug, warn};
use regex::Regex;
use scrollbook_core::{ChapterIndexEntry, FRONT_MATTER_TITLE, Result, Settings};

/// Optional `第`, a run of Arabic or CJK numerals, then a unit word
/// (章节回集部卷), whitespace or a dot. Whitespace is the ASCII set.
pub const DEFAULT_CHAPTER_PATTERN: &str = r"^[ \t\n\x0B\f\r]*(第?[ \t\n\x0B\f\r]*[0-9一二三四五六七八九十百千万]+[ \t\n\x0B\f\r]*[章节回集部卷 \t\n\x0B\f\r.].*)";

static DEFAULT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(DEFAULT_CHAPTER_PATTERN).expect("built-in chapter pattern compiles")
});

const READ_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ChapterIndexer {
    pattern: Regex,
}

impl Default for ChapterIndexer {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_PATTERN.clone(),
        }
    }
}

impl ChapterIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pattern(pattern: &str) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    /// Uses the configured override when it compiles, the built-in pattern otherwise.
    pub fn from_settings(settings: &Settings) -> Self {
        match settings.chapter_pattern.as_deref() {
            Some(pattern) => Self::with_pattern(pattern).unwrap_or_else(|err| {
                warn!("ignoring chapter pattern {pattern:?}: {err}");
                Self::default()
            }),
            None => Self::default(),
        }
    }

    pub fn is_heading(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }

    pub fn index_file(
        &self,
        path: impl AsRef<Path>,
        encoding: &'static Encoding,
        line_terminator_width: u8,
    ) -> Result<Vec<ChapterIndexEntry>> {
        let file = File::open(path.as_ref())?;
        let total_bytes = file.metadata()?.len();
        let reader = BufReader::with_capacity(READ_BUFFER_BYTES, file);
        self.index(reader, encoding, line_terminator_width, total_bytes)
    }

    /// Streams `reader` line by line and partitions `[0, total_bytes)` into
    /// chapters. The last entry always ends at `total_bytes`.
    pub fn index(
        &self,
        mut reader: impl BufRead,
        encoding: &'static Encoding,
        line_terminator_width: u8,
        total_bytes: u64,
    ) -> Result<Vec<ChapterIndexEntry>> {
        let mut entries = Vec::new();
        let mut cursor = 0u64;
        let mut title = FRONT_MATTER_TITLE.to_string();
        let mut start = 0u64;
        let mut raw = Vec::with_capacity(256);

        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            let line = decode_line(&raw, encoding);
            let advance = line_byte_len(&line, encoding, line_terminator_width);

            if self.is_heading(&line) {
                if cursor > 0 {
                    entries.push(ChapterIndexEntry {
                        ordinal: entries.len() as u32,
                        title: std::mem::take(&mut title),
                        start_byte: start.min(total_bytes),
                        end_byte: cursor.min(total_bytes),
                    });
                }
                title = line.trim().to_string();
                start = cursor;
            }
            cursor += advance;
        }

        let drift = cursor.abs_diff(total_bytes);
        if drift != 0 && drift != u64::from(line_terminator_width) {
            warn!(
                "byte cursor ended at {cursor} for a {total_bytes} byte document; line endings are probably mixed"
            );
        }

        entries.push(ChapterIndexEntry {
            ordinal: entries.len() as u32,
            title,
            start_byte: start.min(total_bytes),
            end_byte: total_bytes,
        });
        debug!("indexed {} chapters over {total_bytes} bytes", entries.len());
        Ok(entries)
    }
}

/// Decodes one raw line, dropping its LF or CR-LF terminator.
pub fn decode_line<'a>(raw: &'a [u8], encoding: &'static Encoding) -> Cow<'a, str> {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    encoding.decode_without_bom_handling(raw).0
}

/// How far a decoded line moves the byte cursor.
pub fn line_byte_len(line: &str, encoding: &'static Encoding, line_terminator_width: u8) -> u64 {
    let (bytes, _, unmappable) = encoding.encode(line);
    let len = if unmappable && encoding == GBK {
        gbk_source_len(line)
    } else {
        bytes.len() as u64
    };
    len + u64::from(line_terminator_width)
}

/// The GBK decoder also accepts four-byte GB18030 sequences, which the GBK
/// encoder cannot produce. Characters it can't map are measured as GB18030.
fn gbk_source_len(line: &str) -> u64 {
    let mut buf = [0u8; 4];
    line.chars()
        .map(|ch| {
            let ch = ch.encode_utf8(&mut buf);
            let (bytes, _, unmappable) = GBK.encode(ch);
            if unmappable {
                GB18030.encode(ch).0.len() as u64
            } else {
                bytes.len() as u64
            }
        })
        .sum()
}
