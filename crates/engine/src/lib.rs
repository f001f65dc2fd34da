//! Plain-text engine: encoding detection, chapter indexing, chapter loading.

use std::path::Path;

use scrollbook_core::{ChapterIndexEntry, Document, Result, Settings};

pub mod detect;
pub mod index;
pub mod load;

pub use detect::{CharsetMatcher, ChardetMatcher, Detection, EncodingDetector, SAMPLE_BYTES};
pub use index::{ChapterIndexer, DEFAULT_CHAPTER_PATTERN, decode_line, line_byte_len};
pub use load::{ChapterReader, document_encoding, load_chapter, normalize_chapter_text};

/// Bundles the detector and indexer configured from [`Settings`].
#[derive(Debug, Clone)]
pub struct Engine {
    detector: EncodingDetector,
    indexer: ChapterIndexer,
    indent: String,
}

/// What the engine learns about a document on import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub detection: Detection,
    pub entries: Vec<ChapterIndexEntry>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(&Settings::default())
    }
}

impl Engine {
    pub fn new(settings: &Settings) -> Self {
        Self {
            detector: EncodingDetector::new(),
            indexer: ChapterIndexer::from_settings(settings),
            indent: settings.paragraph_indent.clone(),
        }
    }

    pub fn detect_file(&self, path: impl AsRef<Path>) -> Detection {
        self.detector.detect_file(path)
    }

    pub fn analyze(&self, path: impl AsRef<Path>) -> Result<Analysis> {
        let path = path.as_ref();
        let detection = self.detector.detect_file(path);
        let entries = self.indexer.index_file(
            path,
            detection.encoding,
            detection.line_terminator_width,
        )?;
        Ok(Analysis { detection, entries })
    }

    pub fn open_reader(&self, document: &Document) -> Result<ChapterReader> {
        ChapterReader::open(document, self.indent.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrollbook_core::is_partition;

    #[test]
    fn analyze_detects_and_indexes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("novel.txt");
        let text = "第一章 风起\r\n天色渐晚，山路上行人稀少。\r\n第二章 云涌\r\n远处传来钟声。\r\n";
        std::fs::write(&path, text)?;

        let analysis = Engine::new(&Settings::default()).analyze(&path)?;
        assert_eq!(analysis.detection.encoding, encoding_rs::UTF_8);
        assert_eq!(analysis.detection.line_terminator_width, 2);
        assert_eq!(analysis.entries.len(), 2);
        assert!(is_partition(&analysis.entries, text.len() as u64));
        Ok(())
    }
}
