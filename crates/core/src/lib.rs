//! Core domain types for Scrollbook.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Title given to everything before the first detected chapter heading.
pub const FRONT_MATTER_TITLE: &str = "前言";

/// Two ideographic spaces, the customary paragraph indent for CJK prose.
pub const DEFAULT_PARAGRAPH_INDENT: &str = "\u{3000}\u{3000}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub i64);

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DocumentId {
    type Err = &'static str;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        value
            .trim()
            .parse::<i64>()
            .map(DocumentId)
            .map_err(|_| "invalid document id")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub path: String,
    pub format: String,
    pub encoding: String,
    pub size: u64,
    pub added_at: i64,
    pub last_read_at: Option<i64>,
}

/// A document as it is handed to the store, before it has an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDocument {
    pub title: String,
    pub path: String,
    pub format: String,
    pub encoding: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterIndexEntry {
    pub ordinal: u32,
    pub title: String,
    pub start_byte: u64,
    pub end_byte: u64,
}

impl ChapterIndexEntry {
    pub fn byte_len(&self) -> u64 {
        self.end_byte.saturating_sub(self.start_byte)
    }
}

/// Checks that `entries` exactly cover `[0, total_bytes)` in ordinal order.
pub fn is_partition(entries: &[ChapterIndexEntry], total_bytes: u64) -> bool {
    let Some(first) = entries.first() else {
        return false;
    };
    if first.start_byte != 0 {
        return false;
    }
    let contiguous = entries.windows(2).all(|pair| {
        pair[0].end_byte == pair[1].start_byte && pair[0].ordinal + 1 == pair[1].ordinal
    });
    contiguous && entries.last().is_some_and(|last| last.end_byte == total_bytes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedChapter {
    pub ordinal: u32,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub document_id: DocumentId,
    pub chapter_ordinal: u32,
    pub intra_offset: u64,
    pub updated_at: i64,
}

impl ProgressRecord {
    pub fn new(document_id: DocumentId, chapter_ordinal: u32, intra_offset: u64) -> Self {
        Self {
            document_id,
            chapter_ordinal,
            intra_offset,
            updated_at: unix_now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentWithProgress {
    pub document: Document,
    pub progress: Option<ProgressRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyState {
    pub chapters: Vec<LoadedChapter>,
    pub total_chapters: u32,
    pub active_ordinal: u32,
    pub active_title: String,
    pub initial_offset: u64,
}

impl ReadyState {
    pub fn first_ordinal(&self) -> Option<u32> {
        self.chapters.first().map(|c| c.ordinal)
    }

    pub fn last_ordinal(&self) -> Option<u32> {
        self.chapters.last().map(|c| c.ordinal)
    }

    pub fn contains(&self, ordinal: u32) -> bool {
        self.chapters.iter().any(|c| c.ordinal == ordinal)
    }
}

/// What a reading session publishes to whoever renders it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Loading,
    Ready(ReadyState),
    Failed { reason: String },
}

impl SessionState {
    pub fn as_ready(&self) -> Option<&ReadyState> {
        match self {
            SessionState::Ready(ready) => Some(ready),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, SessionState::Loading)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("document {0} has no chapter index")]
    Unparsed(DocumentId),

    #[error("bytes {start_byte}..{end_byte} do not decode as {encoding}")]
    DecodeFailure {
        encoding: String,
        start_byte: u64,
        end_byte: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("\"{title}\" ({size} bytes) is already in the library")]
    DuplicateImport { title: String, size: u64 },

    #[error("{0} is empty")]
    EmptyDocument(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, ReaderError>;

/// Persistence collaborator for documents, chapter indexes and progress.
///
/// Implementations must be shareable with a session worker thread.
pub trait ReadingStore: Send + Sync {
    fn insert_document(&self, document: &NewDocument) -> Result<DocumentId>;

    fn find_document_by_key(&self, title: &str, size: u64) -> Result<Option<Document>>;

    fn get_document(&self, id: DocumentId) -> Result<Option<Document>>;

    /// Removes the document together with its chapters and progress.
    fn delete_document(&self, id: DocumentId) -> Result<()>;

    fn list_documents_with_progress(&self) -> Result<Vec<DocumentWithProgress>>;

    fn insert_chapter_index(&self, id: DocumentId, entries: &[ChapterIndexEntry]) -> Result<()>;

    fn get_chapter_index(&self, id: DocumentId) -> Result<Vec<ChapterIndexEntry>>;

    fn save_progress(&self, record: &ProgressRecord) -> Result<()>;

    fn get_progress(&self, id: DocumentId) -> Result<Option<ProgressRecord>>;

    fn get_document_with_progress(&self, id: DocumentId) -> Result<Option<DocumentWithProgress>>;

    fn touch_last_read(&self, id: DocumentId, at: i64) -> Result<()>;

    /// Inserts the document, its chapter index and a zeroed progress row as
    /// one unit; either all of it lands or none of it does.
    fn import_document(
        &self,
        document: &NewDocument,
        entries: &[ChapterIndexEntry],
    ) -> Result<DocumentId>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// How many chapters before the window edge a scroll event starts a prefetch.
    pub prefetch_margin: usize,
    pub paragraph_indent: String,
    pub restore_previous_chapter: bool,
    pub chapter_pattern: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            prefetch_margin: 1,
            paragraph_indent: DEFAULT_PARAGRAPH_INDENT.to_string(),
            restore_previous_chapter: true,
            chapter_pattern: None,
        }
    }
}

impl Settings {
    pub fn normalize(&mut self) {
        self.prefetch_margin = self.prefetch_margin.min(8);
        if self.paragraph_indent.chars().count() > 8 {
            self.paragraph_indent = self.paragraph_indent.chars().take(8).collect();
        }
        self.chapter_pattern = self
            .chapter_pattern
            .take()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
