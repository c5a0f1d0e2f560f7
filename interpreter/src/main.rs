//! Interpreter CLI.
//!
//! Sends a request to the configured model and runs the code it proposes in
//! persistent PowerShell and Python sessions, asking before every run unless
//! auto-execution is on.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use interpreter::agent::InterpreterAgent;
use interpreter::core::types::is_cancelled;
use interpreter::exit_codes;
use interpreter::io::config::{Settings, default_settings_path, load_settings, write_settings};
use interpreter::io::host::TerminalHost;
use interpreter::io::registry::RuntimeRegistry;
use interpreter::logging;
use interpreter::task::TaskStop;

const REPL_PROMPT: &str = "> ";

#[derive(Parser)]
#[command(
    name = "interpreter",
    version,
    about = "Let a language model run PowerShell and Python code to finish a task"
)]
struct Cli {
    /// Settings file. Defaults to `<config dir>/interpreter/settings.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run code without asking.
    #[arg(long, global = true)]
    auto_execute: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one request until the model stops proposing code.
    Run {
        /// The request, e.g. `interpreter run list the largest files here`.
        #[arg(required = true, num_args = 1..)]
        request: Vec<String>,
    },
    /// Interactive session. `/refresh` starts over, `/exit` quits.
    Repl,
    /// Print the interpreter versions found on PATH.
    Versions,
    /// Write a settings file with default values.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let path = match cli.config {
        Some(path) => path,
        None => default_settings_path()?,
    };
    match cli.command {
        Command::Run { request } => cmd_run(&path, cli.auto_execute, &request.join(" ")).await,
        Command::Repl => cmd_repl(&path, cli.auto_execute).await,
        Command::Versions => cmd_versions(&path).await,
        Command::InitConfig { force } => cmd_init_config(&path, force),
    }
}

async fn cmd_run(path: &Path, auto_execute: bool, request: &str) -> Result<i32> {
    let mut agent = InterpreterAgent::new(path)?;
    if auto_execute {
        agent.set_auto_execution(true);
    }
    let host = TerminalHost::default();
    let cancel = CancellationToken::new();
    let outcome = with_interrupt(&cancel, agent.chat(request, &host, &cancel)).await;
    agent.shutdown().await;
    let outcome = outcome?;
    Ok(match outcome.stop {
        TaskStop::Cancelled => exit_codes::CANCELLED,
        TaskStop::MaxTurns => exit_codes::TURN_LIMIT,
        TaskStop::NoInput | TaskStop::NoCode | TaskStop::Declined => exit_codes::OK,
    })
}

async fn cmd_repl(path: &Path, auto_execute: bool) -> Result<i32> {
    let mut agent = InterpreterAgent::new(path)?;
    if auto_execute {
        agent.set_auto_execution(true);
    }
    let host = TerminalHost::default();
    loop {
        let cancel = CancellationToken::new();
        let line = match with_interrupt(&cancel, host.read_line(REPL_PROMPT, &cancel)).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) if is_cancelled(&err) => break,
            Err(err) => return Err(err),
        };
        match line.trim() {
            "" => continue,
            "/exit" | "exit" | "quit" => break,
            "/refresh" => {
                agent.refresh(false).await?;
                println!("Started a new session.");
                continue;
            }
            "/versions" => {
                println!("{}", agent.language_versions().await);
                continue;
            }
            _ => {}
        }
        let cancel = CancellationToken::new();
        // A failed request leaves the session usable.
        if let Err(err) = with_interrupt(&cancel, agent.chat(&line, &host, &cancel)).await {
            eprintln!("{:#}", err);
        }
    }
    agent.shutdown().await;
    Ok(exit_codes::OK)
}

async fn cmd_versions(path: &Path) -> Result<i32> {
    let settings = load_settings(path)?;
    let mut runtimes = RuntimeRegistry::new(settings.runtime_options());
    println!("{}", runtimes.language_versions().await);
    runtimes.terminate().await;
    Ok(exit_codes::OK)
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", path.display());
        return Ok(exit_codes::OK);
    }
    write_settings(path, &Settings::default())
        .with_context(|| format!("write {}", path.display()))?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

/// Cancel `cancel` on Ctrl-C while `work` runs.
async fn with_interrupt<F: Future>(cancel: &CancellationToken, work: F) -> F::Output {
    let token = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    let output = work.await;
    watcher.abort();
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_joins_words() {
        let cli = Cli::parse_from(["interpreter", "run", "list", "the", "files"]);
        assert!(!cli.auto_execute);
        match cli.command {
            Command::Run { request } => assert_eq!(request.join(" "), "list the files"),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_global_config_after_subcommand() {
        let cli = Cli::parse_from(["interpreter", "repl", "--auto-execute", "--config", "s.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("s.toml")));
        assert!(cli.auto_execute);
        assert!(matches!(cli.command, Command::Repl));
    }

    #[test]
    fn parse_init_config_force() {
        let cli = Cli::parse_from(["interpreter", "init-config", "--force"]);
        assert!(matches!(cli.command, Command::InitConfig { force: true }));
    }

    #[test]
    fn run_requires_a_request() {
        assert!(Cli::try_parse_from(["interpreter", "run"]).is_err());
    }
}
