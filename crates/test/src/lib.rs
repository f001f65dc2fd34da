//! Test helpers and fixtures.

use std::path::{Path, PathBuf};

const BODY: [&str; 4] = [
    "山路上行人稀少，远处的村庄升起了炊烟。",
    "他停下脚步，回头望了一眼来时的方向。",
    "夜色渐深，客栈里的灯火一盏接一盏地亮了起来。",
    "掌柜的拨着算盘，头也不抬地问他要住几晚。",
];

/// A novel with a short preface and `chapters` headed chapters.
pub fn novel_text(chapters: usize, crlf: bool) -> String {
    let newline = if crlf { "\r\n" } else { "\n" };
    let mut text = format!("这是一部用于测试的小说。{newline}");
    for n in 1..=chapters {
        text.push_str(&format!("第{n}章 第{n}回目{newline}"));
        for line in BODY.iter().cycle().skip(n % BODY.len()).take(3) {
            text.push_str(line);
            text.push_str(newline);
        }
    }
    text
}

pub fn gbk_bytes(text: &str) -> Vec<u8> {
    encoding_rs::GBK.encode(text).0.into_owned()
}

pub fn write_fixture(dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, bytes)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use std::sync::Arc;

    use scrollbook_application::{Dispatch, Importer, SessionHandle};
    use scrollbook_core::{
        FRONT_MATTER_TITLE, ProgressRecord, ReaderError, SessionState, Settings, is_partition,
    };
    use scrollbook_engine::{ChapterIndexer, Engine, EncodingDetector};
    use scrollbook_storage::Storage;

    struct Library {
        dir: tempfile::TempDir,
        storage: Arc<Storage>,
        importer: Importer,
    }

    fn library() -> anyhow::Result<Library> {
        let dir = tempfile::tempdir()?;
        let storage = Arc::new(Storage::open_in_memory()?);
        let importer = Importer::new(
            storage.clone(),
            Engine::new(&Settings::default()),
            dir.path().join("library"),
        );
        Ok(Library {
            dir,
            storage,
            importer,
        })
    }

    fn read_range(path: &str, start: u64, end: u64) -> anyhow::Result<Vec<u8>> {
        let mut file = std::fs::File::open(path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut bytes = vec![0u8; (end - start) as usize];
        file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    #[test]
    fn gbk_novel_imports_and_reads() -> anyhow::Result<()> {
        let lib = library()?;
        let text = novel_text(12, false);
        let bytes = gbk_bytes(&text);
        let source = write_fixture(lib.dir.path(), "《山路》.txt", &bytes)?;

        let document = lib.importer.import(&source)?;
        assert_eq!(document.title, "山路");
        assert_eq!(document.encoding, "GBK");

        let entries = lib.storage.get_chapter_index(document.id)?;
        assert_eq!(entries.len(), 13);
        assert_eq!(entries[0].title, FRONT_MATTER_TITLE);
        assert_eq!(entries[1].title, "第1章 第1回目");
        assert!(is_partition(&entries, bytes.len() as u64));

        let mut rebuilt = Vec::new();
        for entry in &entries {
            rebuilt.extend(read_range(&document.path, entry.start_byte, entry.end_byte)?);
        }
        assert_eq!(rebuilt, bytes);

        let handle = SessionHandle::open(
            lib.storage.clone(),
            Engine::default(),
            &Settings::default(),
            document.id,
        )?;
        handle.flush();
        let state = handle.state();
        let ready = state.as_ready().expect("ready");
        assert_eq!(ready.total_chapters, 13);
        assert_eq!(ready.chapters[0].title, FRONT_MATTER_TITLE);
        assert!(ready.chapters[0].text.starts_with("\u{3000}\u{3000}这是一部"));
        Ok(())
    }

    #[test]
    fn crlf_novel_keeps_exact_offsets() -> anyhow::Result<()> {
        let lib = library()?;
        let text = novel_text(5, true);
        let source = write_fixture(lib.dir.path(), "crlf.txt", text.as_bytes())?;

        let document = lib.importer.import(&source)?;
        let entries = lib.storage.get_chapter_index(document.id)?;
        assert_eq!(entries.len(), 6);
        assert!(is_partition(&entries, text.len() as u64));

        let heading = "第3章 第3回目\r\n";
        let offset = text.find(heading).expect("heading") as u64;
        assert_eq!(entries[3].start_byte, offset);
        let chapter = read_range(&document.path, entries[3].start_byte, entries[3].end_byte)?;
        assert!(chapter.starts_with(heading.as_bytes()));
        Ok(())
    }

    #[test]
    fn reading_resumes_where_it_stopped() -> anyhow::Result<()> {
        let lib = library()?;
        let source = write_fixture(lib.dir.path(), "resume.txt", novel_text(8, false).as_bytes())?;
        let document = lib.importer.import(&source)?;

        let handle = SessionHandle::open(
            lib.storage.clone(),
            Engine::default(),
            &Settings::default(),
            document.id,
        )?;
        handle.flush();
        assert_eq!(handle.load_chapter(6, 0, false), Dispatch::Queued);
        handle.flush();
        handle.stop(88);

        let handle = SessionHandle::open(
            lib.storage.clone(),
            Engine::default(),
            &Settings::default(),
            document.id,
        )?;
        handle.flush();
        let state = handle.state();
        let ready = state.as_ready().expect("ready");
        assert_eq!(ready.active_ordinal, 6);
        assert_eq!(ready.initial_offset, 88);
        let ordinals: Vec<u32> = ready.chapters.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, vec![5, 6]);
        Ok(())
    }

    #[test]
    fn scenario_a_unheaded_text_is_one_front_matter_chapter() -> anyhow::Result<()> {
        let lib = library()?;
        let text = "一段没有章节标题的文字。\n又一段。\n";
        let source = write_fixture(lib.dir.path(), "plain.txt", text.as_bytes())?;
        let document = lib.importer.import(&source)?;

        let entries = lib.storage.get_chapter_index(document.id)?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ordinal, 0);
        assert_eq!(entries[0].title, FRONT_MATTER_TITLE);
        assert_eq!((entries[0].start_byte, entries[0].end_byte), (0, text.len() as u64));
        Ok(())
    }

    #[test]
    fn scenario_b_boundary_at_third_line() -> anyhow::Result<()> {
        let text = "第一章 开始\n正文甲\n第二章 continued\n正文乙\n";
        let boundary = text.find("第二章").expect("boundary") as u64;
        let entries = ChapterIndexer::new().index(
            text.as_bytes(),
            encoding_rs::UTF_8,
            1,
            text.len() as u64,
        )?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "第一章 开始");
        assert_eq!((entries[0].start_byte, entries[0].end_byte), (0, boundary));
        assert_eq!(entries[1].title, "第二章 continued");
        assert_eq!(
            (entries[1].start_byte, entries[1].end_byte),
            (boundary, text.len() as u64)
        );
        Ok(())
    }

    #[test]
    fn scenario_c_duplicate_title_and_size() -> anyhow::Result<()> {
        let lib = library()?;
        let mut bytes = vec![b'x'; 12344];
        bytes.push(b'\n');
        let source = write_fixture(lib.dir.path(), "MyBook.txt", &bytes)?;

        let document = lib.importer.import(&source)?;
        let found = lib
            .storage
            .find_document_by_key("MyBook", 12345)?
            .expect("existing record");
        assert_eq!(found.id, document.id);

        let err = lib.importer.import(&source).unwrap_err();
        assert!(matches!(
            err,
            ReaderError::DuplicateImport { ref title, size: 12345 } if title == "MyBook"
        ));
        assert_eq!(lib.storage.list_documents_with_progress()?.len(), 1);
        Ok(())
    }

    #[test]
    fn scenario_d_jump_persists_position() -> anyhow::Result<()> {
        let lib = library()?;
        let source = write_fixture(lib.dir.path(), "ten.txt", novel_text(9, false).as_bytes())?;
        let document = lib.importer.import(&source)?;
        assert_eq!(lib.storage.get_chapter_index(document.id)?.len(), 10);

        let handle = SessionHandle::open(
            lib.storage.clone(),
            Engine::default(),
            &Settings::default(),
            document.id,
        )?;
        handle.flush();
        handle.load_chapter(1, 0, true);
        handle.flush();
        assert_eq!(handle.load_chapter(5, 120, false), Dispatch::Queued);
        handle.flush();

        let SessionState::Ready(ready) = handle.state() else {
            panic!("expected ready");
        };
        let ordinals: Vec<u32> = ready.chapters.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, vec![5]);
        assert_eq!(ready.active_ordinal, 5);
        assert_eq!(ready.initial_offset, 120);

        let progress = lib.storage.get_progress(document.id)?.expect("progress");
        assert_eq!(
            progress,
            ProgressRecord {
                updated_at: progress.updated_at,
                ..ProgressRecord::new(document.id, 5, 120)
            }
        );
        Ok(())
    }

    #[test]
    fn scenario_e_unmatched_sample_falls_back_to_gbk() {
        let detector = EncodingDetector::new();
        assert_eq!(detector.detect_bytes(b"").encoding, encoding_rs::GBK);
        assert_eq!(
            detector.detect_bytes(b"plain ascii only\n").encoding,
            encoding_rs::GBK
        );
    }
}
