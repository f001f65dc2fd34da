//! Random-access chapter retrieval and paragraph normalization.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use encoding_rs::Encoding;
use scrollbook_core::{ChapterIndexEntry, Document, LoadedChapter, ReaderError, Result};

/// Looks up the decoder recorded for a document at import time.
pub fn document_encoding(document: &Document) -> Option<&'static Encoding> {
    Encoding::for_label(document.encoding.as_bytes())
}

/// Holds one read-only handle on a document so that a session's sequential
/// loads don't reopen the file each time.
#[derive(Debug)]
pub struct ChapterReader {
    file: File,
    encoding: &'static Encoding,
    encoding_label: String,
    indent: String,
}

impl ChapterReader {
    pub fn open(document: &Document, indent: impl Into<String>) -> Result<Self> {
        let encoding = document_encoding(document).ok_or_else(|| ReaderError::DecodeFailure {
            encoding: document.encoding.clone(),
            start_byte: 0,
            end_byte: document.size,
        })?;
        let file = File::open(&document.path)?;
        Ok(Self {
            file,
            encoding,
            encoding_label: document.encoding.clone(),
            indent: indent.into(),
        })
    }

    /// Reads and strictly decodes exactly the entry's byte range.
    pub fn read_raw(&mut self, entry: &ChapterIndexEntry) -> Result<String> {
        let bytes = self.read_range(entry)?;
        self.encoding
            .decode_without_bom_handling_and_without_replacement(&bytes)
            .map(|text| text.into_owned())
            .ok_or_else(|| ReaderError::DecodeFailure {
                encoding: self.encoding_label.clone(),
                start_byte: entry.start_byte,
                end_byte: entry.end_byte,
            })
    }

    pub fn load(&mut self, entry: &ChapterIndexEntry) -> Result<LoadedChapter> {
        let raw = self.read_raw(entry)?;
        Ok(LoadedChapter {
            ordinal: entry.ordinal,
            title: entry.title.clone(),
            text: normalize_chapter_text(&raw, &entry.title, &self.indent),
        })
    }

    fn read_range(&mut self, entry: &ChapterIndexEntry) -> Result<Vec<u8>> {
        if entry.end_byte <= entry.start_byte {
            return Err(ReaderError::NotFound(format!(
                "chapter {} has an empty byte range {}..{}",
                entry.ordinal, entry.start_byte, entry.end_byte
            )));
        }
        let len = usize::try_from(entry.byte_len()).map_err(|_| {
            ReaderError::Io(std::io::Error::other(format!(
                "chapter {} is too large to load",
                entry.ordinal
            )))
        })?;
        self.file.seek(SeekFrom::Start(entry.start_byte))?;
        let mut bytes = vec![0u8; len];
        self.file.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}

/// One-shot load: opens the document, reads the entry, normalizes it.
pub fn load_chapter(document: &Document, entry: &ChapterIndexEntry, indent: &str) -> Result<String> {
    let mut reader = ChapterReader::open(document, indent)?;
    Ok(reader.load(entry)?.text)
}

/// Drops blank lines and a leading line that repeats the title, then indents
/// each remaining line and separates them with blank lines.
pub fn normalize_chapter_text(raw: &str, title: &str, indent: &str) -> String {
    let mut lines: Vec<&str> = raw
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect();

    if let Some(first) = lines.first().map(|line| line.trim())
        && (first.contains(title) || title.contains(first))
    {
        lines.remove(0);
    }

    lines
        .iter()
        .map(|line| format!("{indent}{}", line.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ChapterIndexer;
    use encoding_rs::GBK;
    use scrollbook_core::{DEFAULT_PARAGRAPH_INDENT, DocumentId};

    fn document_at(path: &std::path::Path, encoding: &str, size: u64) -> Document {
        Document {
            id: DocumentId(1),
            title: "book".to_string(),
            path: path.to_string_lossy().to_string(),
            format: "txt".to_string(),
            encoding: encoding.to_string(),
            size,
            added_at: 0,
            last_read_at: None,
        }
    }

    #[test]
    fn normalize_strips_duplicate_title_and_indents() {
        let raw = "第一章 开始\n\n正文甲   \n   \n正文乙\n";
        let text = normalize_chapter_text(raw, "第一章 开始", "  ");
        assert_eq!(text, "  正文甲\n\n  正文乙");
    }

    #[test]
    fn normalize_title_check_is_bidirectional() {
        assert_eq!(normalize_chapter_text("第一章\n甲", "第一章 开始", ">"), ">甲");
        assert_eq!(normalize_chapter_text("第一章 开始 上\n甲", "开始", ">"), ">甲");
        assert_eq!(normalize_chapter_text("乙\n甲", "第一章", ">"), ">乙\n\n>甲");
    }

    #[test]
    fn normalize_handles_crlf_and_empty_input() {
        assert_eq!(normalize_chapter_text("标题\r\n甲\r\n", "标题", ""), "甲");
        assert_eq!(normalize_chapter_text("", "标题", ">"), "");
        assert_eq!(normalize_chapter_text("标题\n\n", "标题", ">"), "");
    }

    #[test]
    fn every_entry_round_trips_through_the_reader() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gbk.txt");
        let text = "序\n第一章 起\n甲甲甲\n第二章 承\n乙乙\n第三章 转\n丙\n";
        let (bytes, _, _) = GBK.encode(text);
        std::fs::write(&path, &bytes)?;

        let entries = ChapterIndexer::new().index_file(&path, GBK, 1)?;
        let document = document_at(&path, "GBK", bytes.len() as u64);
        let mut reader = ChapterReader::open(&document, DEFAULT_PARAGRAPH_INDENT)?;

        let mut rebuilt = String::new();
        for entry in &entries {
            let raw = reader.read_raw(entry)?;
            assert_eq!(GBK.encode(&raw).0.len() as u64, entry.byte_len());
            rebuilt.push_str(&raw);
        }
        assert_eq!(rebuilt, text);

        let chapter = reader.load(&entries[2])?;
        assert_eq!(chapter.ordinal, 2);
        assert_eq!(chapter.title, "第二章 承");
        assert_eq!(chapter.text, format!("{DEFAULT_PARAGRAPH_INDENT}乙乙"));
        Ok(())
    }

    #[test]
    fn one_shot_load_matches_reader() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("utf8.txt");
        let text = "第一章 起\n甲\n第二章 承\n乙\n";
        std::fs::write(&path, text)?;
        let entries = ChapterIndexer::new().index_file(&path, encoding_rs::UTF_8, 1)?;
        let document = document_at(&path, "UTF-8", text.len() as u64);
        assert_eq!(load_chapter(&document, &entries[1], "")?, "乙");
        Ok(())
    }

    #[test]
    fn invalid_bytes_are_a_decode_failure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.txt");
        std::fs::write(&path, [b'a', 0xff, 0xfe, b'\n'])?;
        let document = document_at(&path, "UTF-8", 4);
        let entry = ChapterIndexEntry {
            ordinal: 0,
            title: "x".to_string(),
            start_byte: 0,
            end_byte: 4,
        };
        let err = ChapterReader::open(&document, "")?.read_raw(&entry).unwrap_err();
        assert!(matches!(err, ReaderError::DecodeFailure { start_byte: 0, end_byte: 4, .. }));
        Ok(())
    }

    #[test]
    fn range_past_end_is_an_io_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("short.txt");
        std::fs::write(&path, "abc\n")?;
        let document = document_at(&path, "UTF-8", 4);
        let entry = ChapterIndexEntry {
            ordinal: 0,
            title: "x".to_string(),
            start_byte: 2,
            end_byte: 40,
        };
        let err = ChapterReader::open(&document, "")?.read_raw(&entry).unwrap_err();
        assert!(matches!(err, ReaderError::Io(_)));
        Ok(())
    }

    #[test]
    fn unknown_encoding_label_cannot_open() {
        let document = document_at(std::path::Path::new("/tmp/none.txt"), "no-such-charset", 1);
        let err = ChapterReader::open(&document, "").unwrap_err();
        assert!(matches!(err, ReaderError::DecodeFailure { .. }));
    }
}
