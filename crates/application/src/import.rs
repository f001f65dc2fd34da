//! Import workflow: copy, detect, index, persist.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use scrollbook_core::{Document, DocumentId, NewDocument, ReaderError, ReadingStore, Result};
use scrollbook_engine::Engine;

use crate::title::parse_title;

pub struct Importer {
    store: Arc<dyn ReadingStore>,
    engine: Engine,
    library_dir: PathBuf,
}

impl Importer {
    pub fn new(store: Arc<dyn ReadingStore>, engine: Engine, library_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            engine,
            library_dir: library_dir.into(),
        }
    }

    pub fn library_dir(&self) -> &Path {
        &self.library_dir
    }

    /// Imports `source` into the library. Nothing is persisted, and the
    /// library copy is removed again, unless every step succeeds.
    pub fn import(&self, source: impl AsRef<Path>) -> Result<Document> {
        let source = source.as_ref();
        let file_name = source
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| ReaderError::NotFound(source.display().to_string()))?;
        let size = fs::metadata(source)?.len();
        if size == 0 {
            return Err(ReaderError::EmptyDocument(source.display().to_string()));
        }

        let title = parse_title(&file_name);
        if self.store.find_document_by_key(&title, size)?.is_some() {
            return Err(ReaderError::DuplicateImport { title, size });
        }

        fs::create_dir_all(&self.library_dir)?;
        let target = free_target(&self.library_dir, &file_name);
        fs::copy(source, &target)?;

        match self.store_copy(&target, title, size) {
            Ok(document) => {
                info!(
                    "imported {:?} as document {} ({})",
                    document.title, document.id, document.encoding
                );
                Ok(document)
            }
            Err(err) => {
                if let Err(remove_err) = fs::remove_file(&target) {
                    warn!("remove {} after failed import: {remove_err}", target.display());
                }
                Err(err)
            }
        }
    }

    fn store_copy(&self, target: &Path, title: String, size: u64) -> Result<Document> {
        let format = target
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_else(|| "txt".to_string());

        let (encoding, entries) = if format == "txt" {
            let analysis = self.engine.analyze(target)?;
            (analysis.detection.encoding_name(), analysis.entries)
        } else {
            (self.engine.detect_file(target).encoding_name(), Vec::new())
        };

        let document = NewDocument {
            title,
            path: target.to_string_lossy().to_string(),
            format,
            encoding: encoding.to_string(),
            size,
        };
        let id = self.store.import_document(&document, &entries)?;
        self.store
            .get_document(id)?
            .ok_or_else(|| ReaderError::NotFound(format!("document {id}")))
    }

    /// Deletes the document, its index and progress, and the library copy.
    pub fn delete(&self, id: DocumentId) -> Result<()> {
        let document = self
            .store
            .get_document(id)?
            .ok_or_else(|| ReaderError::NotFound(format!("document {id}")))?;
        self.store.delete_document(id)?;
        match fs::remove_file(&document.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn free_target(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) => (stem, format!(".{ext}")),
        None => (file_name, String::new()),
    };
    (1..)
        .map(|n| dir.join(format!("{stem}-{n}{ext}")))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}
