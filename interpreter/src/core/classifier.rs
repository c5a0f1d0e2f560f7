//! Line classification for runtime process output.

use crate::core::harness::{Language, SENTINEL};
use crate::core::types::OutputRecord;

/// Which pipe a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Records produced by one line, and whether that line ends the run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Classified {
    pub records: Vec<OutputRecord>,
    /// Run number carried by an end-of-run line (`Some("")` if untagged).
    pub end_tag: Option<String>,
    pub interrupted: bool,
}

impl Classified {
    pub fn completes_run(&self) -> bool {
        self.end_tag.is_some() || self.interrupted
    }
}

/// Classify one line read from `stream` of a `language` runtime.
///
/// Empty lines produce no records.
pub fn classify_line(language: Language, stream: Stream, line: &str) -> Classified {
    let line = line.trim_end_matches('\r');
    match stream {
        Stream::Stderr => {
            let cleaned = language.clean_stderr(line);
            if cleaned.trim().is_empty() {
                return Classified::default();
            }
            if language.is_interrupt(cleaned) {
                return Classified {
                    records: vec![OutputRecord::interrupt(cleaned)],
                    end_tag: None,
                    interrupted: true,
                };
            }
            Classified {
                records: vec![OutputRecord::error(language.restore_line_numbers(cleaned))],
                ..Classified::default()
            }
        }
        Stream::Stdout => {
            if let Some(pos) = line.find(SENTINEL) {
                let before = &line[..pos];
                let after = &line[pos + SENTINEL.len()..];
                let tag = after.strip_prefix(':').unwrap_or(after).trim().to_string();
                let mut records = Vec::with_capacity(2);
                if !before.trim().is_empty() {
                    records.push(OutputRecord::output(before));
                }
                records.push(OutputRecord::end(tag.clone()));
                return Classified {
                    records,
                    end_tag: Some(tag),
                    interrupted: false,
                };
            }
            if line.trim().is_empty() {
                return Classified::default();
            }
            Classified {
                records: vec![OutputRecord::output(line)],
                ..Classified::default()
            }
        }
    }
}
