//! Language-keyed registry of runtime processes.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::core::harness::Language;
use crate::core::types::{ExecutionResult, OutputKind, OutputRecord, is_cancelled};
use crate::io::runtime::{RuntimeOptions, RuntimeProcess};

pub const NOT_SUPPORTED: &str = "Language not supported.";
pub const NOT_FOUND: &str = "Language not found on path.";
pub const RUN_CANCELLED: &str = "Code run cancelled.";
pub const VERSION_NOT_FOUND: &str = "Executable not found on PATH";

/// Owns at most one [`RuntimeProcess`] per supported language.
pub struct RuntimeRegistry {
    options: RuntimeOptions,
    runtimes: BTreeMap<Language, RuntimeProcess>,
}

impl RuntimeRegistry {
    pub fn new(options: RuntimeOptions) -> Self {
        Self {
            options,
            runtimes: BTreeMap::new(),
        }
    }

    /// Number of languages with a live interpreter session.
    pub fn running_count(&self) -> usize {
        self.runtimes.values().filter(|r| r.is_running()).count()
    }

    fn runtime(&mut self, language: Language) -> &mut RuntimeProcess {
        let options = &self.options;
        self.runtimes
            .entry(language)
            .or_insert_with(|| RuntimeProcess::new(language, options.clone()))
    }

    /// Run `code` in the runtime for `language`.
    ///
    /// Unsupported or missing languages return an error result without
    /// touching any process. Cancellation and interpreter interrupts return a
    /// result marked `cancelled`.
    #[instrument(skip_all, fields(language = language_name))]
    pub async fn run(
        &mut self,
        language_name: &str,
        code: &str,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let Some(language) = Language::parse(language_name) else {
            info!("unsupported language requested");
            return ExecutionResult::rejected(language_name, code, NOT_SUPPORTED);
        };
        let runtime = self.runtime(language);
        if !runtime.is_available() {
            info!("interpreter not found on search path");
            return ExecutionResult::rejected(language.id(), code, NOT_FOUND);
        }

        match runtime.run(code, cancel).await {
            Ok(records) => fold_records(language, code, records),
            Err(err) if is_cancelled(&err) => ExecutionResult {
                language: language.id().to_string(),
                code: code.to_string(),
                output: RUN_CANCELLED.to_string(),
                is_error: false,
                cancelled: true,
                tool_call_id: None,
            },
            Err(err) => ExecutionResult::rejected(language.id(), code, format!("{err:#}")),
        }
    }

    /// Markdown list of interpreter versions for every supported language.
    pub async fn language_versions(&mut self) -> String {
        let mut lines = Vec::with_capacity(Language::ALL.len());
        for language in Language::ALL {
            let runtime = self.runtime(language);
            let version = if runtime.is_available() {
                match runtime.version().await {
                    Ok(version) if !version.is_empty() => version,
                    Ok(_) => "unknown version".to_string(),
                    Err(err) => {
                        debug!(language = %language, err = %format!("{err:#}"), "version query failed");
                        VERSION_NOT_FOUND.to_string()
                    }
                }
            } else {
                VERSION_NOT_FOUND.to_string()
            };
            lines.push(format!("- **{}**: {version}", language.id()));
        }
        lines.join("\n")
    }

    /// Terminate every running interpreter.
    pub async fn terminate(&mut self) {
        for runtime in self.runtimes.values_mut() {
            runtime.terminate().await;
        }
    }
}

/// Fold run records into one result. `End` records carry no text.
fn fold_records(language: Language, code: &str, records: Vec<OutputRecord>) -> ExecutionResult {
    let mut result = ExecutionResult {
        language: language.id().to_string(),
        code: code.to_string(),
        ..ExecutionResult::default()
    };
    for record in records {
        match record.kind {
            OutputKind::End => continue,
            OutputKind::Error => result.is_error = true,
            OutputKind::Interrupt => {
                result.is_error = true;
                result.cancelled = true;
            }
            OutputKind::Output => {}
        }
        result.output.push_str(&record.content);
        result.output.push('\n');
    }
    result
}
