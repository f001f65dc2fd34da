//! Sqlite-backed persistence.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context as _;
use log::debug;
use rusqlite::{Connection, OptionalExtension as _, Row};
use scrollbook_core::{
    ChapterIndexEntry, Document, DocumentId, DocumentWithProgress, NewDocument, ProgressRecord,
    ReaderError, ReadingStore, Settings,
};

/// Process-wide database handle. Open it once, share it behind an `Arc`,
/// and [`close`](Storage::close) it on shutdown.
#[derive(Debug)]
pub struct Storage {
    conn: Mutex<Connection>,
}

const DOCUMENT_COLUMNS: &str =
    "id, title, path, format, encoding, size, added_at, last_read_at";

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("open sqlite db at {}", path.as_ref().display()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::with_connection(Connection::open_in_memory().context("open in-memory sqlite db")?)
    }

    fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.migrate()?;
        Ok(storage)
    }

    pub fn close(self) -> anyhow::Result<()> {
        let conn = self
            .conn
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        conn.close()
            .map_err(|(_, err)| err)
            .context("close sqlite db")
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn migrate(&self) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                prefetch_margin INTEGER NOT NULL,
                paragraph_indent TEXT NOT NULL
            );
            INSERT OR IGNORE INTO settings (id, prefetch_margin, paragraph_indent)
            VALUES (1, 1, '　　');

            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                path TEXT NOT NULL,
                format TEXT NOT NULL,
                encoding TEXT NOT NULL,
                size INTEGER NOT NULL,
                added_at INTEGER NOT NULL DEFAULT (unixepoch()),
                last_read_at INTEGER,
                UNIQUE (title, size)
            );

            CREATE TABLE IF NOT EXISTS chapters (
                id INTEGER PRIMARY KEY,
                document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                start_byte INTEGER NOT NULL,
                end_byte INTEGER NOT NULL,
                ordinal INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS chapters_by_document ON chapters(document_id, ordinal);

            CREATE TABLE IF NOT EXISTS progress (
                document_id INTEGER PRIMARY KEY REFERENCES documents(id) ON DELETE CASCADE,
                chapter_ordinal INTEGER NOT NULL,
                intra_offset INTEGER NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (unixepoch())
            );
            "#,
        )?;

        add_column(
            &conn,
            "ALTER TABLE settings ADD COLUMN restore_previous_chapter INTEGER NOT NULL DEFAULT 1",
            "add settings.restore_previous_chapter column",
        )?;
        add_column(
            &conn,
            "ALTER TABLE settings ADD COLUMN chapter_pattern TEXT",
            "add settings.chapter_pattern column",
        )?;

        Ok(())
    }

    pub fn load_settings(&self) -> anyhow::Result<Settings> {
        let row = self
            .conn()
            .query_row(
                "SELECT prefetch_margin, paragraph_indent, restore_previous_chapter, chapter_pattern FROM settings WHERE id = 1",
                [],
                |row| {
                    let prefetch_margin: i64 = row.get(0)?;
                    let paragraph_indent: String = row.get(1)?;
                    let restore_previous_chapter: bool = row.get(2)?;
                    let chapter_pattern: Option<String> = row.get(3)?;
                    Ok((prefetch_margin, paragraph_indent, restore_previous_chapter, chapter_pattern))
                },
            )
            .optional()?;

        let Some((prefetch_margin, paragraph_indent, restore_previous_chapter, chapter_pattern)) =
            row
        else {
            return Ok(Settings::default());
        };

        let mut settings = Settings {
            prefetch_margin: usize::try_from(prefetch_margin).unwrap_or(1),
            paragraph_indent,
            restore_previous_chapter,
            chapter_pattern,
        };
        settings.normalize();
        Ok(settings)
    }

    pub fn save_settings(&self, settings: &Settings) -> anyhow::Result<()> {
        let mut settings = settings.clone();
        settings.normalize();

        self.conn().execute(
            "UPDATE settings SET prefetch_margin = ?, paragraph_indent = ?, restore_previous_chapter = ?, chapter_pattern = ? WHERE id = 1",
            (
                settings.prefetch_margin as i64,
                &settings.paragraph_indent,
                settings.restore_previous_chapter,
                &settings.chapter_pattern,
            ),
        )?;
        Ok(())
    }

    pub fn insert_document(&self, document: &NewDocument) -> anyhow::Result<DocumentId> {
        let conn = self.conn();
        insert_document_row(&conn, document)
    }

    pub fn find_document_by_key(&self, title: &str, size: u64) -> anyhow::Result<Option<Document>> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE title = ? AND size = ? LIMIT 1");
        let document = self
            .conn()
            .query_row(&sql, (title, size as i64), row_to_document)
            .optional()?;
        Ok(document)
    }

    pub fn get_document(&self, id: DocumentId) -> anyhow::Result<Option<Document>> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?");
        let document = self
            .conn()
            .query_row(&sql, [id.0], row_to_document)
            .optional()?;
        Ok(document)
    }

    pub fn delete_document(&self, id: DocumentId) -> anyhow::Result<()> {
        self.conn()
            .execute("DELETE FROM documents WHERE id = ?", [id.0])?;
        Ok(())
    }

    pub fn list_documents_with_progress(&self) -> anyhow::Result<Vec<DocumentWithProgress>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY COALESCE(last_read_at, 0) DESC, added_at DESC, id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let documents = stmt
            .query_map([], row_to_document)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(documents.len());
        for document in documents {
            let progress = progress_row(&conn, document.id)?;
            out.push(DocumentWithProgress { document, progress });
        }
        Ok(out)
    }

    pub fn insert_chapter_index(
        &self,
        id: DocumentId,
        entries: &[ChapterIndexEntry],
    ) -> anyhow::Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        insert_chapter_rows(&tx, id, entries)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_chapter_index(&self, id: DocumentId) -> anyhow::Result<Vec<ChapterIndexEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT ordinal, title, start_byte, end_byte FROM chapters WHERE document_id = ? ORDER BY ordinal ASC",
        )?;
        let rows = stmt.query_map([id.0], |row| {
            let ordinal: i64 = row.get(0)?;
            let start_byte: i64 = row.get(2)?;
            let end_byte: i64 = row.get(3)?;
            Ok(ChapterIndexEntry {
                ordinal: u32::try_from(ordinal).unwrap_or(0),
                title: row.get(1)?,
                start_byte: u64::try_from(start_byte).unwrap_or(0),
                end_byte: u64::try_from(end_byte).unwrap_or(0),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn save_progress(&self, record: &ProgressRecord) -> anyhow::Result<()> {
        let conn = self.conn();
        upsert_progress(&conn, record)
    }

    pub fn get_progress(&self, id: DocumentId) -> anyhow::Result<Option<ProgressRecord>> {
        progress_row(&self.conn(), id)
    }

    pub fn get_document_with_progress(
        &self,
        id: DocumentId,
    ) -> anyhow::Result<Option<DocumentWithProgress>> {
        let Some(document) = self.get_document(id)? else {
            return Ok(None);
        };
        let progress = self.get_progress(id)?;
        Ok(Some(DocumentWithProgress { document, progress }))
    }

    pub fn touch_last_read(&self, id: DocumentId, at: i64) -> anyhow::Result<()> {
        self.conn().execute(
            "UPDATE documents SET last_read_at = ? WHERE id = ?",
            (at, id.0),
        )?;
        Ok(())
    }

    pub fn import_document(
        &self,
        document: &NewDocument,
        entries: &[ChapterIndexEntry],
    ) -> anyhow::Result<DocumentId> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let id = insert_document_row(&tx, document)?;
        insert_chapter_rows(&tx, id, entries)?;
        upsert_progress(&tx, &ProgressRecord::new(id, 0, 0))?;
        tx.commit().context("commit document import")?;
        debug!("stored document {id} with {} chapters", entries.len());
        Ok(id)
    }
}

fn add_column(conn: &Connection, sql: &str, what: &'static str) -> anyhow::Result<()> {
    match conn.execute(sql, []) {
        Ok(_) => Ok(()),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains("duplicate column name") {
                Ok(())
            } else {
                Err(err).context(what)
            }
        }
    }
}

fn insert_document_row(conn: &Connection, document: &NewDocument) -> anyhow::Result<DocumentId> {
    conn.execute(
        "INSERT INTO documents (title, path, format, encoding, size) VALUES (?, ?, ?, ?, ?)",
        (
            &document.title,
            &document.path,
            &document.format,
            &document.encoding,
            document.size as i64,
        ),
    )
    .with_context(|| format!("insert document {:?}", document.title))?;
    Ok(DocumentId(conn.last_insert_rowid()))
}

fn insert_chapter_rows(
    conn: &Connection,
    id: DocumentId,
    entries: &[ChapterIndexEntry],
) -> anyhow::Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO chapters (document_id, title, start_byte, end_byte, ordinal) VALUES (?, ?, ?, ?, ?)",
    )?;
    for entry in entries {
        stmt.execute((
            id.0,
            &entry.title,
            entry.start_byte as i64,
            entry.end_byte as i64,
            i64::from(entry.ordinal),
        ))?;
    }
    Ok(())
}

fn upsert_progress(conn: &Connection, record: &ProgressRecord) -> anyhow::Result<()> {
    conn.execute(
        r#"
        INSERT INTO progress (document_id, chapter_ordinal, intra_offset, updated_at) VALUES (?, ?, ?, ?)
        ON CONFLICT(document_id) DO UPDATE SET
            chapter_ordinal = excluded.chapter_ordinal,
            intra_offset = excluded.intra_offset,
            updated_at = excluded.updated_at
        "#,
        (
            record.document_id.0,
            i64::from(record.chapter_ordinal),
            record.intra_offset as i64,
            record.updated_at,
        ),
    )?;
    Ok(())
}

fn progress_row(conn: &Connection, id: DocumentId) -> anyhow::Result<Option<ProgressRecord>> {
    let record = conn
        .query_row(
            "SELECT chapter_ordinal, intra_offset, updated_at FROM progress WHERE document_id = ?",
            [id.0],
            |row| {
                let chapter_ordinal: i64 = row.get(0)?;
                let intra_offset: i64 = row.get(1)?;
                Ok(ProgressRecord {
                    document_id: id,
                    chapter_ordinal: u32::try_from(chapter_ordinal).unwrap_or(0),
                    intra_offset: u64::try_from(intra_offset).unwrap_or(0),
                    updated_at: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<Document> {
    let size: i64 = row.get(5)?;
    Ok(Document {
        id: DocumentId(row.get(0)?),
        title: row.get(1)?,
        path: row.get(2)?,
        format: row.get(3)?,
        encoding: row.get(4)?,
        size: u64::try_from(size).unwrap_or(0),
        added_at: row.get(6)?,
        last_read_at: row.get(7)?,
    })
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(code, _))
                if code.code == rusqlite::ErrorCode::ConstraintViolation
                    && code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        )
    })
}

fn store_error(err: anyhow::Error) -> ReaderError {
    ReaderError::Storage(format!("{err:#}"))
}

impl ReadingStore for Storage {
    fn insert_document(&self, document: &NewDocument) -> scrollbook_core::Result<DocumentId> {
        Storage::insert_document(self, document).map_err(|err| {
            if is_unique_violation(&err) {
                ReaderError::DuplicateImport {
                    title: document.title.clone(),
                    size: document.size,
                }
            } else {
                store_error(err)
            }
        })
    }

    fn find_document_by_key(
        &self,
        title: &str,
        size: u64,
    ) -> scrollbook_core::Result<Option<Document>> {
        Storage::find_document_by_key(self, title, size).map_err(store_error)
    }

    fn get_document(&self, id: DocumentId) -> scrollbook_core::Result<Option<Document>> {
        Storage::get_document(self, id).map_err(store_error)
    }

    fn delete_document(&self, id: DocumentId) -> scrollbook_core::Result<()> {
        Storage::delete_document(self, id).map_err(store_error)
    }

    fn list_documents_with_progress(&self) -> scrollbook_core::Result<Vec<DocumentWithProgress>> {
        Storage::list_documents_with_progress(self).map_err(store_error)
    }

    fn insert_chapter_index(
        &self,
        id: DocumentId,
        entries: &[ChapterIndexEntry],
    ) -> scrollbook_core::Result<()> {
        Storage::insert_chapter_index(self, id, entries).map_err(store_error)
    }

    fn get_chapter_index(&self, id: DocumentId) -> scrollbook_core::Result<Vec<ChapterIndexEntry>> {
        Storage::get_chapter_index(self, id).map_err(store_error)
    }

    fn save_progress(&self, record: &ProgressRecord) -> scrollbook_core::Result<()> {
        Storage::save_progress(self, record).map_err(store_error)
    }

    fn get_progress(&self, id: DocumentId) -> scrollbook_core::Result<Option<ProgressRecord>> {
        Storage::get_progress(self, id).map_err(store_error)
    }

    fn get_document_with_progress(
        &self,
        id: DocumentId,
    ) -> scrollbook_core::Result<Option<DocumentWithProgress>> {
        Storage::get_document_with_progress(self, id).map_err(store_error)
    }

    fn touch_last_read(&self, id: DocumentId, at: i64) -> scrollbook_core::Result<()> {
        Storage::touch_last_read(self, id, at).map_err(store_error)
    }

    fn import_document(
        &self,
        document: &NewDocument,
        entries: &[ChapterIndexEntry],
    ) -> scrollbook_core::Result<DocumentId> {
        Storage::import_document(self, document, entries).map_err(|err| {
            if is_unique_violation(&err) {
                ReaderError::DuplicateImport {
                    title: document.title.clone(),
                    size: document.size,
                }
            } else {
                store_error(err)
            }
        })
    }
}
