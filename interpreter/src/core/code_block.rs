//! Fenced code block extraction for plain-text model replies.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::harness::Language;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```([A-Za-z0-9_+-]*)[ \t]*\r?\n(.*?)```").expect("fenced block regex")
});

/// A runnable block found in a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub language: Language,
    pub code: String,
}

/// Returns the first complete fenced block tagged with a supported language.
///
/// Blocks tagged with anything else (`sh`, `json`, untagged) are skipped.
pub fn extract_code_block(reply: &str) -> Option<CodeBlock> {
    FENCED_BLOCK.captures_iter(reply).find_map(|caps| {
        let language = Language::parse(caps.get(1)?.as_str())?;
        let code = caps.get(2)?.as_str().trim_end_matches(['\n', '\r']);
        Some(CodeBlock {
            language,
            code: code.to_string(),
        })
    })
}
