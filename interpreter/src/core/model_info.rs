//! Token limits and calling style of known chat models.

/// Tokenizer encoding used to count tokens for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Cl100kBase,
    O200kBase,
}

/// Budget constants and capabilities of one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelProfile {
    pub name: String,
    pub token_limit: usize,
    pub tokens_per_message: i64,
    pub tokens_per_name: i64,
    pub encoding: Encoding,
    pub function_calling: bool,
}

struct KnownModel {
    name: &'static str,
    token_limit: usize,
    tokens_per_message: i64,
    tokens_per_name: i64,
    encoding: Encoding,
    function_calling: bool,
}

const fn model(
    name: &'static str,
    token_limit: usize,
    encoding: Encoding,
    function_calling: bool,
) -> KnownModel {
    KnownModel {
        name,
        token_limit,
        tokens_per_message: 3,
        tokens_per_name: 1,
        encoding,
        function_calling,
    }
}

const KNOWN_MODELS: &[KnownModel] = &[
    model("gpt-4o", 128_000, Encoding::O200kBase, true),
    model("gpt-4o-mini", 128_000, Encoding::O200kBase, true),
    model("gpt-4-turbo", 128_000, Encoding::Cl100kBase, true),
    model("gpt-4-1106-preview", 128_000, Encoding::Cl100kBase, true),
    model("gpt-4-0125-preview", 128_000, Encoding::Cl100kBase, true),
    model("gpt-4", 8_192, Encoding::Cl100kBase, true),
    model("gpt-4-0613", 8_192, Encoding::Cl100kBase, true),
    model("gpt-4-0314", 8_192, Encoding::Cl100kBase, false),
    model("gpt-4-32k", 32_768, Encoding::Cl100kBase, true),
    model("gpt-4-32k-0613", 32_768, Encoding::Cl100kBase, true),
    model("gpt-3.5-turbo", 4_096, Encoding::Cl100kBase, true),
    model("gpt-3.5-turbo-0613", 4_096, Encoding::Cl100kBase, true),
    model("gpt-3.5-turbo-16k", 16_385, Encoding::Cl100kBase, true),
    model("gpt-3.5-turbo-1106", 16_385, Encoding::Cl100kBase, true),
    model("gpt-3.5-turbo-0125", 16_385, Encoding::Cl100kBase, true),
    KnownModel {
        name: "gpt-3.5-turbo-0301",
        token_limit: 4_096,
        tokens_per_message: 4,
        tokens_per_name: -1,
        encoding: Encoding::Cl100kBase,
        function_calling: false,
    },
];

/// Normalizes Azure aliases (`gpt-35-turbo`) and case.
pub fn canonical_model_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.strip_prefix("gpt-35") {
        Some(rest) => format!("gpt-3.5{rest}"),
        None => lower,
    }
}

/// Look up a model by name.
///
/// Exact names win; otherwise the longest known name that prefixes `name`
/// followed by `-` is used, so dated snapshots resolve to their family.
pub fn lookup(name: &str) -> Option<ModelProfile> {
    let canonical = canonical_model_name(name);
    let known = KNOWN_MODELS
        .iter()
        .find(|known| known.name == canonical)
        .or_else(|| {
            KNOWN_MODELS
                .iter()
                .filter(|known| {
                    canonical
                        .strip_prefix(known.name)
                        .is_some_and(|rest| rest.starts_with('-'))
                })
                .max_by_key(|known| known.name.len())
        })?;
    Some(ModelProfile {
        name: canonical,
        token_limit: known.token_limit,
        tokens_per_message: known.tokens_per_message,
        tokens_per_name: known.tokens_per_name,
        encoding: known.encoding,
        function_calling: known.function_calling,
    })
}

/// Profile for a model missing from the table, with an explicit limit.
pub fn custom(name: &str, token_limit: usize) -> ModelProfile {
    ModelProfile {
        name: canonical_model_name(name),
        token_limit,
        tokens_per_message: 3,
        tokens_per_name: 1,
        encoding: Encoding::O200kBase,
        function_calling: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn azure_alias_resolves() {
        let profile = lookup("GPT-35-Turbo-16k").expect("known");
        assert_eq!(profile.name, "gpt-3.5-turbo-16k");
        assert_eq!(profile.token_limit, 16_385);
    }

    #[test]
    fn legacy_model_uses_its_own_constants() {
        let profile = lookup("gpt-3.5-turbo-0301").expect("known");
        assert_eq!(profile.tokens_per_message, 4);
        assert_eq!(profile.tokens_per_name, -1);
        assert!(!profile.function_calling);
    }

    #[test]
    fn dated_snapshot_resolves_to_longest_family() {
        let profile = lookup("gpt-4o-mini-2024-07-18").expect("known");
        assert_eq!(profile.token_limit, 128_000);
        assert_eq!(profile.encoding, Encoding::O200kBase);
        assert_eq!(profile.name, "gpt-4o-mini-2024-07-18");
    }

    #[test]
    fn unknown_model_is_none() {
        assert_eq!(lookup("llama-3"), None);
        assert_eq!(lookup("gpt-4oops"), None);
    }
}
