use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use directories::ProjectDirs;
use log::info;
use scrollbook_application::{Dispatch, Importer, SessionHandle, percent_read};
use scrollbook_core::{DocumentId, SessionState, Settings};
use scrollbook_engine::{ChapterIndexer, Engine};
use scrollbook_storage::Storage;

const USAGE: &str = "usage: scrollbook <command>

commands:
  import <file>                     copy a text file into the library and index it
  list [--json]                     list documents with reading progress
  chapters <id>                     print the chapter index of a document
  read <id> [--chapter N] [--count K]
                                    print chapters from the saved position or chapter N
  delete <id>                       remove a document and its library copy
  settings [--margin N] [--indent S] [--pattern RE] [--no-restore-previous]
                                    show or change settings";

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let project_dirs =
        ProjectDirs::from("dev", "scrollbook", "scrollbook").context("resolve project dirs")?;

    let config_dir = project_dirs.config_dir();
    fs::create_dir_all(config_dir)
        .with_context(|| format!("create config dir {}", config_dir.display()))?;
    let library_dir = project_dirs.data_dir().join("library");

    let storage = Arc::new(Storage::open(config_dir.join("scrollbook.db"))?);
    let settings = storage.load_settings()?;

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_default();
    let rest: Vec<String> = args.collect();
    let ctx = Ctx {
        storage: storage.clone(),
        engine: Engine::new(&settings),
        settings,
        library_dir,
    };

    match command.as_str() {
        "import" => ctx.import(&rest)?,
        "list" => ctx.list(&rest)?,
        "chapters" => ctx.chapters(&rest)?,
        "read" => ctx.read(&rest)?,
        "delete" => ctx.delete(&rest)?,
        "settings" => ctx.update_settings(&rest)?,
        "" | "help" | "--help" | "-h" => println!("{USAGE}"),
        other => anyhow::bail!("unknown command: {other}\n\n{USAGE}"),
    }

    drop(ctx);
    match Arc::try_unwrap(storage) {
        Ok(storage) => storage.close(),
        Err(_) => Ok(()),
    }
}

struct Ctx {
    storage: Arc<Storage>,
    engine: Engine,
    settings: Settings,
    library_dir: PathBuf,
}

impl Ctx {
    fn importer(&self) -> Importer {
        Importer::new(self.storage.clone(), self.engine.clone(), &self.library_dir)
    }

    fn import(&self, args: &[String]) -> anyhow::Result<()> {
        let source = args.first().context("missing <file>")?;
        let document = self.importer().import(source)?;
        let chapters = self.storage.get_chapter_index(document.id)?.len();
        println!(
            "{}\t{}\t{}\t{} chapters",
            document.id, document.title, document.encoding, chapters
        );
        Ok(())
    }

    fn list(&self, args: &[String]) -> anyhow::Result<()> {
        let documents = self.storage.list_documents_with_progress()?;
        if args.iter().any(|arg| arg == "--json") {
            println!("{}", serde_json::to_string_pretty(&documents)?);
            return Ok(());
        }
        for entry in &documents {
            let total = self.storage.get_chapter_index(entry.document.id)?.len();
            println!(
                "{}\t{}\t{:.0}%\t{}",
                entry.document.id,
                entry.document.title,
                percent_read(entry.progress.as_ref(), total),
                entry.document.encoding
            );
        }
        Ok(())
    }

    fn chapters(&self, args: &[String]) -> anyhow::Result<()> {
        let id = parse_id(args.first())?;
        for entry in self.storage.get_chapter_index(id)? {
            println!(
                "{}\t{}\t{}..{}",
                entry.ordinal, entry.title, entry.start_byte, entry.end_byte
            );
        }
        Ok(())
    }

    fn read(&self, args: &[String]) -> anyhow::Result<()> {
        let id = parse_id(args.first())?;
        let mut chapter: Option<u32> = None;
        let mut count: usize = 1;

        let mut iter = args.iter().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--chapter" => {
                    let value = iter.next().context("missing value for --chapter")?;
                    chapter = Some(
                        value
                            .parse::<u32>()
                            .with_context(|| format!("invalid --chapter value: {value}"))?,
                    );
                }
                "--count" => {
                    let value = iter.next().context("missing value for --count")?;
                    count = value
                        .parse::<usize>()
                        .with_context(|| format!("invalid --count value: {value}"))?
                        .max(1);
                }
                other => anyhow::bail!("unknown arg: {other}"),
            }
        }

        let session = SessionHandle::open(
            self.storage.clone(),
            self.engine.clone(),
            &self.settings,
            id,
        )?;
        session.flush();

        if let Some(ordinal) = chapter {
            if session.load_chapter(ordinal, 0, false) == Dispatch::Ignored {
                anyhow::bail!("chapter {ordinal} is out of range");
            }
            session.flush();
        }

        let ready = match session.state() {
            SessionState::Ready(ready) => ready,
            SessionState::Failed { reason } => anyhow::bail!(reason),
            SessionState::Loading => anyhow::bail!("session did not finish loading"),
        };

        let start = ready.active_ordinal;
        let mut active = start;
        let mut printed = 0;
        loop {
            let state = session.state();
            let Some(ready) = state.as_ready() else {
                break;
            };
            let Some(current) = ready.chapters.iter().find(|c| c.ordinal == active) else {
                break;
            };
            println!("{}\n\n{}\n", current.title, current.text);
            session.update_active_chapter(active);
            printed += 1;
            if printed >= count || active + 1 >= ready.total_chapters {
                break;
            }
            session.on_scroll(active, active);
            session.flush();
            active += 1;
        }

        info!("read {printed} chapter(s) of document {id}");
        session.stop(if active == start { ready.initial_offset } else { 0 });
        Ok(())
    }

    fn delete(&self, args: &[String]) -> anyhow::Result<()> {
        let id = parse_id(args.first())?;
        self.importer().delete(id)?;
        println!("deleted {id}");
        Ok(())
    }

    fn update_settings(&self, args: &[String]) -> anyhow::Result<()> {
        let mut settings = self.settings.clone();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--margin" => {
                    let value = iter.next().context("missing value for --margin")?;
                    settings.prefetch_margin = value
                        .parse::<usize>()
                        .with_context(|| format!("invalid --margin value: {value}"))?;
                }
                "--indent" => {
                    settings.paragraph_indent =
                        iter.next().context("missing value for --indent")?.clone();
                }
                "--pattern" => {
                    let value = iter.next().context("missing value for --pattern")?;
                    ChapterIndexer::with_pattern(value)
                        .with_context(|| format!("invalid --pattern value: {value}"))?;
                    settings.chapter_pattern = Some(value.clone());
                }
                "--no-restore-previous" => settings.restore_previous_chapter = false,
                "--restore-previous" => settings.restore_previous_chapter = true,
                other => anyhow::bail!("unknown arg: {other}"),
            }
        }

        settings.normalize();
        if settings != self.settings {
            self.storage.save_settings(&settings)?;
        }
        println!("{}", serde_json::to_string_pretty(&settings)?);
        Ok(())
    }
}

fn parse_id(arg: Option<&String>) -> anyhow::Result<DocumentId> {
    let value = arg.context("missing <id>")?;
    value
        .parse::<DocumentId>()
        .map_err(|_| anyhow::anyhow!("invalid document id: {value}"))
}
