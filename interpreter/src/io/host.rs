//! Host surface the agent renders to and asks for confirmation.
//!
//! The [`Host`] trait decouples the turn protocols from the terminal. Tests use
//! a scripted host that records what was rendered and answers confirmations
//! from a queue.

use std::io::Write;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::types::Cancelled;

/// UI callbacks used while a task runs.
#[async_trait]
pub trait Host: Send + Sync {
    /// Render a complete piece of markdown.
    async fn render_full(&self, text: &str) -> Result<()>;

    /// Render one fragment of a streaming reply.
    async fn render_delta(&self, delta: &str) -> Result<()>;

    /// A streaming reply has ended.
    async fn end_stream(&self) -> Result<()>;

    /// Ask a yes/no question. Cancellation returns a [`Cancelled`] error.
    async fn confirm(&self, prompt: &str, cancel: &CancellationToken) -> Result<bool>;

    /// Show a transient status line.
    async fn status(&self, text: &str);
}

/// Plain stdout/stdin host.
pub struct TerminalHost {
    input: Mutex<Lines<BufReader<Stdin>>>,
}

impl Default for TerminalHost {
    fn default() -> Self {
        Self {
            input: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

impl TerminalHost {
    /// Read one line of user input. `None` at end of input.
    pub async fn read_line(&self, prompt: &str, cancel: &CancellationToken) -> Result<Option<String>> {
        print_flush(prompt)?;
        let mut input = self.input.lock().await;
        tokio::select! {
            () = cancel.cancelled() => Err(Cancelled.into()),
            line = input.next_line() => line.context("read stdin"),
        }
    }
}

fn print_flush(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes()).context("write stdout")?;
    stdout.flush().context("flush stdout")
}

#[async_trait]
impl Host for TerminalHost {
    async fn render_full(&self, text: &str) -> Result<()> {
        print_flush(&format!("{text}\n"))
    }

    async fn render_delta(&self, delta: &str) -> Result<()> {
        print_flush(delta)
    }

    async fn end_stream(&self) -> Result<()> {
        print_flush("\n")
    }

    async fn confirm(&self, prompt: &str, cancel: &CancellationToken) -> Result<bool> {
        let answer = self.read_line(&format!("{prompt} [y/N] "), cancel).await?;
        Ok(answer.is_some_and(|answer| is_yes(&answer)))
    }

    async fn status(&self, text: &str) {
        eprintln!("{text}");
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
