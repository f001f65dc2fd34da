//! Reading session controller.
//!
//! A session owns a sliding window of loaded chapters. Every mutation of the
//! window runs on one worker thread fed by a queue, and at most one chapter
//! load is in flight at a time; requests that arrive meanwhile are dropped
//! because the scroll event that caused them fires again if still relevant.
//! Readers of the session only ever see cloned [`SessionState`] snapshots.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use scrollbook_core::{
    ChapterIndexEntry, DocumentId, LoadedChapter, ProgressRecord, ReadyState, ReaderError,
    ReadingStore, Result, SessionState, Settings,
};
use scrollbook_engine::{ChapterReader, Engine};

type SessionTask = Box<dyn FnOnce(&mut Session) + Send + 'static>;

enum Command {
    Run(SessionTask),
    Shutdown,
}

/// Outcome of a request made through a [`SessionHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to the worker.
    Queued,
    /// Another load was in flight.
    Dropped,
    /// Out of range, already loaded, or the session is not usable
    /// (failed to open, or its worker has stopped).
    Ignored,
}

impl Dispatch {
    fn from_queued(queued: bool) -> Self {
        if queued { Self::Queued } else { Self::Ignored }
    }
}

struct Shared {
    state: Mutex<SessionState>,
    /// First and last ordinal of the published window, while `Ready`.
    bounds: Mutex<Option<(u32, u32)>>,
    subscribers: Mutex<Vec<mpsc::Sender<SessionState>>>,
    loading: AtomicBool,
    terminal: AtomicBool,
    total_chapters: AtomicU32,
}

impl Shared {
    fn snapshot(&self) -> SessionState {
        lock(&self.state).clone()
    }

    fn publish(&self, state: SessionState) {
        *lock(&self.bounds) = state
            .as_ready()
            .and_then(|ready| Some((ready.first_ordinal()?, ready.last_ordinal()?)));
        *lock(&self.state) = state.clone();
        lock(&self.subscribers).retain(|tx| tx.send(state.clone()).is_ok());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Presentation-side handle on one reading session.
pub struct SessionHandle {
    document_id: DocumentId,
    shared: Arc<Shared>,
    sender: mpsc::Sender<Command>,
    worker: Option<JoinHandle<()>>,
    prefetch_margin: u32,
}

impl SessionHandle {
    /// Starts the worker and queues initialization. The session begins in
    /// [`SessionState::Loading`].
    pub fn open(
        store: Arc<dyn ReadingStore>,
        engine: Engine,
        settings: &Settings,
        document_id: DocumentId,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::Loading),
            bounds: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            loading: AtomicBool::new(true),
            terminal: AtomicBool::new(false),
            total_chapters: AtomicU32::new(0),
        });

        let mut session = Session {
            document_id,
            store,
            engine,
            restore_previous: settings.restore_previous_chapter,
            shared: shared.clone(),
            reader: None,
            index: Vec::new(),
            window: VecDeque::new(),
            active_ordinal: 0,
            initial_offset: 0,
            last_offset: 0,
            last_saved: None,
        };

        let (sender, receiver) = mpsc::channel::<Command>();
        let worker = thread::Builder::new()
            .name(format!("session-{document_id}"))
            .spawn(move || {
                session.initialize();
                session.shared.loading.store(false, Ordering::Release);
                while let Ok(command) = receiver.recv() {
                    match command {
                        Command::Run(task) => task(&mut session),
                        Command::Shutdown => break,
                    }
                }
                session.persist_last();
                debug!("session {} worker stopped", session.document_id);
            })?;

        Ok(Self {
            document_id,
            shared,
            sender,
            worker: Some(worker),
            prefetch_margin: settings.prefetch_margin as u32,
        })
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn state(&self) -> SessionState {
        self.shared.snapshot()
    }

    /// Receives the current state right away and every published state after it.
    pub fn subscribe(&self) -> mpsc::Receiver<SessionState> {
        let (tx, rx) = mpsc::channel();
        let mut subscribers = lock(&self.shared.subscribers);
        let _ = tx.send(self.shared.snapshot());
        subscribers.push(tx);
        rx
    }

    /// Loads `ordinal`. With `append` it joins the end of the window,
    /// otherwise the window is replaced by it (an explicit jump) and
    /// progress is saved with `offset`.
    pub fn load_chapter(&self, ordinal: u32, offset: u64, append: bool) -> Dispatch {
        if !self.in_range(ordinal) {
            return Dispatch::Ignored;
        }
        if append && self.window_contains(ordinal) {
            return Dispatch::Ignored;
        }
        self.submit_load(move |session| {
            if append {
                session.append(ordinal);
            } else {
                session.jump(ordinal, offset);
            }
        })
    }

    pub fn load_prepend_chapter(&self, ordinal: u32) -> Dispatch {
        if !self.in_range(ordinal) || self.window_contains(ordinal) {
            return Dispatch::Ignored;
        }
        self.submit_load(move |session| session.prepend(ordinal))
    }

    /// Scroll settle report: the first and last chapter ordinals that are
    /// at least partly visible. Prefetches past whichever window edge is
    /// within the margin, the trailing edge first.
    pub fn on_scroll(&self, first_visible: u32, last_visible: u32) -> Dispatch {
        let Some((first, last)) = *lock(&self.shared.bounds) else {
            return Dispatch::Ignored;
        };
        let total = self.shared.total_chapters.load(Ordering::Acquire);

        if last.saturating_sub(last_visible) <= self.prefetch_margin && last + 1 < total {
            return self.load_chapter(last + 1, 0, true);
        }
        if first_visible.saturating_sub(first) <= self.prefetch_margin && first > 0 {
            return self.load_prepend_chapter(first - 1);
        }
        Dispatch::Ignored
    }

    /// Marks a loaded chapter as the one being read; nothing is fetched.
    pub fn update_active_chapter(&self, ordinal: u32) -> Dispatch {
        Dispatch::from_queued(self.submit(move |session| session.set_active(ordinal)))
    }

    pub fn save_progress(&self, ordinal: u32, offset: u64) -> Dispatch {
        Dispatch::from_queued(self.submit(move |session| session.persist(ordinal, offset)))
    }

    /// Persists the active chapter with the reported scroll offset.
    pub fn pause(&self, offset: u64) -> Dispatch {
        Dispatch::from_queued(
            self.submit(move |session| session.persist(session.active_ordinal, offset)),
        )
    }

    pub fn stop(mut self, offset: u64) {
        self.pause(offset);
        self.shutdown();
    }

    /// Blocks until every task queued before this call has run.
    pub fn flush(&self) {
        let (tx, rx) = mpsc::channel();
        self.submit(move |_| {
            let _ = tx.send(());
        });
        let _ = rx.recv();
    }

    fn in_range(&self, ordinal: u32) -> bool {
        !self.shared.terminal.load(Ordering::Acquire)
            && ordinal < self.shared.total_chapters.load(Ordering::Acquire)
    }

    fn window_contains(&self, ordinal: u32) -> bool {
        lock(&self.shared.bounds).is_some_and(|(first, last)| (first..=last).contains(&ordinal))
    }

    fn submit(&self, task: impl FnOnce(&mut Session) + Send + 'static) -> bool {
        self.sender.send(Command::Run(Box::new(task))).is_ok()
    }

    fn submit_load(&self, task: impl FnOnce(&mut Session) + Send + 'static) -> Dispatch {
        if self
            .shared
            .loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("session {}: load already in flight, dropping request", self.document_id);
            return Dispatch::Dropped;
        }

        let queued = self.submit(move |session| {
            task(session);
            session.shared.loading.store(false, Ordering::Release);
        });
        if !queued {
            self.shared.loading.store(false, Ordering::Release);
        }
        Dispatch::from_queued(queued)
    }

    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if let Err(err) = self.sender.send(Command::Shutdown) {
            error!("send shutdown to session worker: {err}");
        }
        if let Err(join_err) = worker.join() {
            error!("join session worker: {join_err:?}");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker-owned session state.
struct Session {
    document_id: DocumentId,
    store: Arc<dyn ReadingStore>,
    engine: Engine,
    restore_previous: bool,
    shared: Arc<Shared>,
    reader: Option<ChapterReader>,
    index: Vec<ChapterIndexEntry>,
    window: VecDeque<LoadedChapter>,
    active_ordinal: u32,
    initial_offset: u64,
    last_offset: u64,
    last_saved: Option<(u32, u64)>,
}

impl Session {
    fn initialize(&mut self) {
        if let Err(err) = self.try_initialize() {
            warn!("session {} failed to open: {err}", self.document_id);
            self.shared.terminal.store(true, Ordering::Release);
            self.shared.publish(SessionState::Failed {
                reason: err.to_string(),
            });
        }
    }

    fn try_initialize(&mut self) -> Result<()> {
        let Some(found) = self.store.get_document_with_progress(self.document_id)? else {
            return Err(ReaderError::NotFound(format!("document {}", self.document_id)));
        };
        let index = self.store.get_chapter_index(self.document_id)?;
        if index.is_empty() {
            return Err(ReaderError::Unparsed(self.document_id));
        }

        let total = index.len() as u32;
        let (mut start, mut offset) = found
            .progress
            .map(|p| (p.chapter_ordinal, p.intra_offset))
            .unwrap_or((0, 0));
        if start >= total {
            warn!(
                "session {}: saved chapter {start} is past the last chapter, clamping",
                self.document_id
            );
            start = total - 1;
            offset = 0;
        }

        self.reader = Some(self.engine.open_reader(&found.document)?);
        self.index = index;
        self.shared.total_chapters.store(total, Ordering::Release);
        self.active_ordinal = start;
        self.initial_offset = offset;
        self.last_offset = offset;
        self.last_saved = Some((start, offset));

        // A bad starting chapter leaves the session open for a jump elsewhere.
        match self.fetch(start) {
            Ok(chapter) => self.window.push_back(chapter),
            Err(err) => {
                self.publish_failure(start, err);
                return Ok(());
            }
        }
        self.publish_ready();
        info!(
            "session {} opened at chapter {start}/{total}, offset {offset}",
            self.document_id
        );

        if self.restore_previous && start > 0 {
            self.prepend(start - 1);
        }
        Ok(())
    }

    fn fetch(&mut self, ordinal: u32) -> Result<LoadedChapter> {
        let entry = self
            .index
            .get(ordinal as usize)
            .ok_or_else(|| ReaderError::NotFound(format!("chapter {ordinal}")))?;
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| ReaderError::NotFound(format!("document {}", self.document_id)))?;
        reader.load(entry)
    }

    fn append(&mut self, ordinal: u32) {
        let Some(last) = self.window.back().map(|c| c.ordinal) else {
            return;
        };
        if ordinal != last + 1 {
            debug!("session {}: stale append of {ordinal} after {last}", self.document_id);
            return;
        }
        match self.fetch(ordinal) {
            Ok(chapter) => {
                self.window.push_back(chapter);
                self.publish_ready();
            }
            Err(err) => self.publish_failure(ordinal, err),
        }
    }

    fn prepend(&mut self, ordinal: u32) {
        let Some(first) = self.window.front().map(|c| c.ordinal) else {
            return;
        };
        if ordinal + 1 != first {
            debug!("session {}: stale prepend of {ordinal} before {first}", self.document_id);
            return;
        }
        match self.fetch(ordinal) {
            Ok(chapter) => {
                self.window.push_front(chapter);
                self.publish_ready();
            }
            Err(err) => self.publish_failure(ordinal, err),
        }
    }

    fn jump(&mut self, ordinal: u32, offset: u64) {
        match self.fetch(ordinal) {
            Ok(chapter) => {
                self.window.clear();
                self.window.push_back(chapter);
                self.active_ordinal = ordinal;
                self.initial_offset = offset;
                self.publish_ready();
                self.persist(ordinal, offset);
            }
            Err(err) => self.publish_failure(ordinal, err),
        }
    }

    fn set_active(&mut self, ordinal: u32) {
        if ordinal == self.active_ordinal || !self.window.iter().any(|c| c.ordinal == ordinal) {
            return;
        }
        self.active_ordinal = ordinal;
        self.publish_ready();
    }

    fn persist(&mut self, ordinal: u32, offset: u64) {
        if self.window.is_empty() {
            return;
        }
        self.last_offset = offset;
        let record = ProgressRecord::new(self.document_id, ordinal, offset);
        if let Err(err) = self.store.save_progress(&record) {
            warn!("session {}: save progress: {err}", self.document_id);
            return;
        }
        if let Err(err) = self.store.touch_last_read(self.document_id, record.updated_at) {
            warn!("session {}: touch last read: {err}", self.document_id);
        }
        self.last_saved = Some((ordinal, offset));
    }

    /// Saves the active position on shutdown unless it is already stored.
    fn persist_last(&mut self) {
        let position = (self.active_ordinal, self.last_offset);
        if self.last_saved != Some(position) {
            self.persist(position.0, position.1);
        }
    }

    fn publish_ready(&self) {
        let active_title = self
            .window
            .iter()
            .find(|c| c.ordinal == self.active_ordinal)
            .map(|c| c.title.clone())
            .unwrap_or_default();
        self.shared.publish(SessionState::Ready(ReadyState {
            chapters: self.window.iter().cloned().collect(),
            total_chapters: self.index.len() as u32,
            active_ordinal: self.active_ordinal,
            active_title,
            initial_offset: self.initial_offset,
        }));
    }

    fn publish_failure(&self, ordinal: u32, err: ReaderError) {
        warn!("session {}: load chapter {ordinal}: {err}", self.document_id);
        self.shared.publish(SessionState::Failed {
            reason: err.to_string(),
        });
    }
}

/// Picks the chapter with the largest visible extent; ties go to the
/// earlier ordinal.
pub fn dominant_chapter(visible: &[(u32, u32)]) -> Option<u32> {
    visible
        .iter()
        .copied()
        .filter(|&(_, extent)| extent > 0)
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(ordinal, _)| ordinal)
}
