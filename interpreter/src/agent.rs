//! Interpreter agent: settings, chat history, runtimes and the active protocol.
//!
//! One agent serves one interactive session. [`InterpreterAgent::chat`] runs a
//! whole task for one user request; [`InterpreterAgent::refresh`] starts a new
//! session with freshly loaded settings.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::chat::ChatService;
use crate::core::budget::{TiktokenCounter, TokenCounter};
use crate::core::types::ChatMessage;
use crate::io::backend::{ChatBackend, OpenAiBackend};
use crate::io::config::{Settings, load_settings};
use crate::io::host::Host;
use crate::io::prompt::{SystemPromptInputs, os_name, render_system_prompt};
use crate::io::registry::RuntimeRegistry;
use crate::protocol::function::FunctionProtocol;
use crate::protocol::text::TextProtocol;
use crate::protocol::{ExecutionOptions, TurnContext, TurnProtocol};
use crate::task::{TaskLimits, TaskOutcome, run_task};

pub struct InterpreterAgent {
    settings: Settings,
    /// Source of `settings`; `None` when built from in-memory settings.
    settings_path: Option<PathBuf>,
    chat: ChatService,
    runtimes: RuntimeRegistry,
    protocol: Box<dyn TurnProtocol>,
}

impl InterpreterAgent {
    /// Load settings from `path` and connect to the configured endpoint.
    pub fn new(path: &Path) -> Result<Self> {
        let settings = load_settings(path)?;
        let (backend, counter) = connect(&settings)?;
        let mut agent = Self::from_settings(settings, backend, counter)?;
        agent.settings_path = Some(path.to_path_buf());
        Ok(agent)
    }

    /// Build an agent around an existing backend and token counter.
    pub fn from_settings(
        settings: Settings,
        backend: Arc<dyn ChatBackend>,
        counter: Arc<dyn TokenCounter>,
    ) -> Result<Self> {
        settings.validate()?;
        let profile = settings.model_profile()?;
        let protocol: Box<dyn TurnProtocol> = if profile.function_calling {
            Box::new(FunctionProtocol)
        } else {
            Box::new(TextProtocol)
        };
        info!(
            model = %profile.name,
            function_calling = profile.function_calling,
            "agent configured"
        );
        let chat = ChatService::new(backend, counter, profile, settings.max_response_tokens);
        let runtimes = RuntimeRegistry::new(settings.runtime_options());
        Ok(Self {
            settings,
            settings_path: None,
            chat,
            runtimes,
            protocol,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn history(&self) -> &[ChatMessage] {
        self.chat.history()
    }

    pub fn is_function_based(&self) -> bool {
        self.protocol.is_function_based()
    }

    /// Override auto-execution for this session.
    pub fn set_auto_execution(&mut self, auto_execution: bool) {
        self.settings.auto_execution = auto_execution;
    }

    /// Markdown list of interpreter versions.
    pub async fn language_versions(&mut self) -> String {
        self.runtimes.language_versions().await
    }

    /// Run one user request to completion.
    #[instrument(skip_all)]
    pub async fn chat(
        &mut self,
        input: &str,
        host: &dyn Host,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome> {
        if !self.chat.has_system_prompt() {
            let versions = self.runtimes.language_versions().await;
            let messages = render_system_prompt(&SystemPromptInputs {
                versions: &versions,
                function_calling: self.protocol.is_function_based(),
                os: os_name(),
            })?;
            self.chat.set_system_prompt(messages);
        }

        let limits = TaskLimits {
            mode: self.settings.rendering_mode(),
            max_turns: self.settings.max_turns as usize,
        };
        let mut ctx = TurnContext {
            chat: &mut self.chat,
            runtimes: &mut self.runtimes,
            host,
            options: ExecutionOptions {
                auto_execution: self.settings.auto_execution,
                display_errors: self.settings.display_errors,
            },
        };
        run_task(self.protocol.as_ref(), &mut ctx, input, limits, cancel).await
    }

    /// Start a new session: forget the conversation and stop every runtime.
    ///
    /// Settings are reloaded from disk when the agent was loaded from a file;
    /// the endpoint is reconnected when they changed or `force` is set.
    pub async fn refresh(&mut self, force: bool) -> Result<()> {
        self.runtimes.terminate().await;
        let Some(path) = self.settings_path.clone() else {
            self.chat.clear();
            self.runtimes = RuntimeRegistry::new(self.settings.runtime_options());
            return Ok(());
        };

        let mut settings = load_settings(&path)
            .with_context(|| format!("reload settings from {}", path.display()))?;
        // Session overrides survive a plain refresh.
        if !force {
            settings.auto_execution = self.settings.auto_execution;
        }
        if force || settings != self.settings {
            debug!(force, "reconnecting with reloaded settings");
            let (backend, counter) = connect(&settings)?;
            *self = Self::from_settings(settings, backend, counter)?;
            self.settings_path = Some(path);
        } else {
            self.chat.clear();
            self.runtimes = RuntimeRegistry::new(self.settings.runtime_options());
        }
        Ok(())
    }

    /// Stop every interpreter process.
    pub async fn shutdown(&mut self) {
        self.runtimes.terminate().await;
    }
}

fn connect(settings: &Settings) -> Result<(Arc<dyn ChatBackend>, Arc<dyn TokenCounter>)> {
    let profile = settings.model_profile()?;
    let backend = OpenAiBackend::from_settings(settings)?;
    let counter = TiktokenCounter::for_encoding(profile.encoding)?;
    Ok((Arc::new(backend), Arc::new(counter)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Role;
    use crate::task::TaskStop;
    use crate::test_support::{ScriptedBackend, ScriptedHost, WordCounter, text_reply};

    fn agent(function_calling: bool, replies: Vec<crate::io::backend::ChatReply>) -> InterpreterAgent {
        let settings = Settings {
            function_calling: Some(function_calling),
            ..Settings::default()
        };
        InterpreterAgent::from_settings(
            settings,
            Arc::new(ScriptedBackend::new(replies)),
            Arc::new(WordCounter),
        )
        .expect("agent")
    }

    #[test]
    fn protocol_follows_function_calling() {
        assert!(agent(true, Vec::new()).is_function_based());
        assert!(!agent(false, Vec::new()).is_function_based());
    }

    /// Verifies the first request carries the three leading system messages.
    #[tokio::test]
    async fn first_chat_builds_system_prompt() {
        let mut agent = agent(false, vec![text_reply("Hi! How can I help?")]);
        let host = ScriptedHost::new(Vec::new());

        let outcome = agent
            .chat("hello", &host, &CancellationToken::new())
            .await
            .expect("chat");

        assert_eq!(outcome.stop, TaskStop::NoCode);
        let roles: Vec<Role> = agent.history().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::System, Role::System, Role::User, Role::Assistant]
        );
        assert!(agent.history()[1].content.contains("Text Based"));
    }

    #[tokio::test]
    async fn refresh_without_file_clears_history() {
        let mut agent = agent(true, vec![text_reply("Hello.")]);
        let host = ScriptedHost::new(Vec::new());
        agent
            .chat("hello", &host, &CancellationToken::new())
            .await
            .expect("chat");

        agent.refresh(false).await.expect("refresh");

        assert!(agent.history().is_empty());
    }

    #[test]
    fn unknown_model_without_limit_is_rejected() {
        let settings = Settings {
            model_name: "my-local-model".to_string(),
            ..Settings::default()
        };
        let result = InterpreterAgent::from_settings(
            settings,
            Arc::new(ScriptedBackend::new(Vec::new())),
            Arc::new(WordCounter),
        );
        assert!(result.is_err());
    }
}
