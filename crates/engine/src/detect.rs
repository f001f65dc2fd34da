//! Best-effort character encoding detection.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use encoding_rs::{Encoding, GBK, UTF_8};
use log::{debug, warn};

/// Size of the prefix that is sampled for detection.
pub const SAMPLE_BYTES: usize = 4096;

/// Statistical matcher that turns a byte sample into an encoding label.
///
/// `complete` is true when the sample holds the entire document, so a
/// truncated multi-byte sequence at its end is a real error rather than an
/// artifact of sampling.
pub trait CharsetMatcher {
    fn best_label(&self, sample: &[u8], complete: bool) -> Option<String>;
}

/// `chardetng`-backed matcher. Reports no label when the sample carries no
/// statistical signal (empty or pure ASCII).
#[derive(Debug, Default, Clone, Copy)]
pub struct ChardetMatcher;

impl CharsetMatcher for ChardetMatcher {
    fn best_label(&self, sample: &[u8], complete: bool) -> Option<String> {
        if sample.is_empty() || sample.is_ascii() {
            return None;
        }
        let mut detector = chardetng::EncodingDetector::new();
        detector.feed(sample, complete);
        Some(detector.guess(None, true).name().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub encoding: &'static Encoding,
    pub line_terminator_width: u8,
}

impl Detection {
    pub fn encoding_name(&self) -> &'static str {
        self.encoding.name()
    }
}

#[derive(Debug, Default, Clone)]
pub struct EncodingDetector<M = ChardetMatcher> {
    matcher: M,
}

impl EncodingDetector<ChardetMatcher> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M: CharsetMatcher> EncodingDetector<M> {
    pub fn with_matcher(matcher: M) -> Self {
        Self { matcher }
    }

    /// Never fails: an unreadable file is treated like an empty sample.
    pub fn detect_file(&self, path: impl AsRef<Path>) -> Detection {
        match File::open(path.as_ref()) {
            Ok(file) => self.detect(file),
            Err(err) => {
                warn!("sample {} for detection: {err}", path.as_ref().display());
                self.detect_bytes(&[])
            }
        }
    }

    pub fn detect(&self, mut reader: impl Read) -> Detection {
        let mut sample = vec![0u8; SAMPLE_BYTES];
        let mut filled = 0usize;
        while filled < SAMPLE_BYTES {
            match reader.read(&mut sample[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("read detection sample: {err}");
                    break;
                }
            }
        }
        sample.truncate(filled);
        let complete = filled < SAMPLE_BYTES;
        self.detect_sample(&sample, complete)
    }

    pub fn detect_bytes(&self, bytes: &[u8]) -> Detection {
        let sample = &bytes[..bytes.len().min(SAMPLE_BYTES)];
        self.detect_sample(sample, bytes.len() <= SAMPLE_BYTES)
    }

    fn detect_sample(&self, sample: &[u8], complete: bool) -> Detection {
        let encoding = match self.matcher.best_label(sample, complete) {
            Some(label) => resolve_label(&label),
            None => {
                debug!("no confident encoding for {} byte sample, using GBK", sample.len());
                GBK
            }
        };
        Detection {
            encoding,
            line_terminator_width: line_terminator_width(sample, encoding),
        }
    }
}

/// Maps a label to a decoder usable for line-by-line byte accounting.
/// Labels that don't resolve, or resolve to an encoding that can't be
/// re-encoded into itself (UTF-16, replacement), fall back to UTF-8.
pub fn resolve_label(label: &str) -> &'static Encoding {
    match Encoding::for_label(label.trim().as_bytes()) {
        Some(encoding) if encoding.output_encoding() == encoding => encoding,
        Some(encoding) => {
            warn!("encoding {} cannot round-trip bytes, using UTF-8", encoding.name());
            UTF_8
        }
        None => {
            warn!("unknown encoding label {label:?}, using UTF-8");
            UTF_8
        }
    }
}

fn line_terminator_width(sample: &[u8], encoding: &'static Encoding) -> u8 {
    let (text, _) = encoding.decode_without_bom_handling(sample);
    if text.contains("\r\n") { 2 } else { 1 }
}
