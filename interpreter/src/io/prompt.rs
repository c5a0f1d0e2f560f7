//! System prompt assembly from embedded templates.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::harness::Language;
use crate::core::tool_calls::EXECUTE_TOOL;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const RULES_FUNCTION_TEMPLATE: &str = include_str!("prompts/rules_function.md");
const RULES_TEXT_TEMPLATE: &str = include_str!("prompts/rules_text.md");
const EXAMPLES_TEMPLATE: &str = include_str!("prompts/examples.md");

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        env.add_template("rules_function", RULES_FUNCTION_TEMPLATE)
            .expect("function rules template should be valid");
        env.add_template("rules_text", RULES_TEXT_TEMPLATE)
            .expect("text rules template should be valid");
        env.add_template("examples", EXAMPLES_TEMPLATE)
            .expect("examples template should be valid");
        Self { env }
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let rendered = self.env.get_template(name)?.render(ctx)?;
        Ok(rendered.trim().to_string())
    }
}

/// Inputs for the system prompt.
#[derive(Debug, Clone)]
pub struct SystemPromptInputs<'a> {
    /// Markdown list produced by the runtime registry.
    pub versions: &'a str,
    pub function_calling: bool,
    pub os: &'a str,
}

/// Render the leading system messages: base prompt with runtime versions,
/// response rules of the calling style, and worked examples.
pub fn render_system_prompt(inputs: &SystemPromptInputs<'_>) -> Result<Vec<String>> {
    let engine = PromptEngine::new();
    let languages: Vec<&str> = Language::ALL.iter().map(|language| language.id()).collect();
    let base = engine.render(
        "system",
        context! {
            os => inputs.os,
            versions => inputs.versions.trim(),
        },
    )?;
    let rules = if inputs.function_calling {
        engine.render(
            "rules_function",
            context! { tool => EXECUTE_TOOL, languages => languages },
        )?
    } else {
        engine.render("rules_text", context! { languages => languages })?
    };
    let examples = engine.render("examples", context! {})?;
    Ok(vec![base, rules, examples])
}

/// Operating system name shown to the model.
pub fn os_name() -> &'static str {
    match std::env::consts::OS {
        "windows" => "Windows",
        "macos" => "macOS",
        "linux" => "Linux",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(function_calling: bool) -> SystemPromptInputs<'static> {
        SystemPromptInputs {
            versions: "- **python**: Python 3.12.1\n",
            function_calling,
            os: "Linux",
        }
    }

    #[test]
    fn system_prompt_carries_versions_and_os() {
        let messages = render_system_prompt(&inputs(true)).expect("render");
        assert_eq!(messages.len(), 3);
        assert!(messages[0].contains("`Linux`"));
        assert!(messages[0].ends_with("- **python**: Python 3.12.1"));
    }

    #[test]
    fn function_rules_name_the_execute_tool() {
        let messages = render_system_prompt(&inputs(true)).expect("render");
        assert!(messages[1].starts_with("## Your Response Rules (Function Calling):"));
        assert!(messages[1].contains("`execute(language, code)`"));
        assert!(messages[1].contains("powershell, python"));
    }

    #[test]
    fn text_rules_list_fence_tags() {
        let messages = render_system_prompt(&inputs(false)).expect("render");
        assert!(messages[1].starts_with("## Your Response Rules (Text Based):"));
        assert!(messages[1].contains("```powershell or ```python."));
    }

    /// Verifies both calling styles warn off multi-line string literals,
    /// which the python harness re-indents.
    #[test]
    fn rules_warn_about_triple_quoted_strings() {
        for function_calling in [true, false] {
            let messages = render_system_prompt(&inputs(function_calling)).expect("render");
            assert!(messages[1].contains("multi-line triple-quoted strings"));
        }
    }
}
