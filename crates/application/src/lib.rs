//! Application orchestration layer for Scrollbook.

pub mod import;
pub mod session;
pub mod title;

pub use import::Importer;
pub use session::{Dispatch, SessionHandle, dominant_chapter};
pub use title::parse_title;

use scrollbook_core::ProgressRecord;

/// Share of the book read so far, counted in whole chapters.
pub fn percent_read(progress: Option<&ProgressRecord>, total_chapters: usize) -> f32 {
    match progress {
        Some(progress) if total_chapters > 0 => {
            let done = (progress.chapter_ordinal as usize + 1).min(total_chapters);
            done as f32 * 100.0 / total_chapters as f32
        }
        _ => 0.0,
    }
}
