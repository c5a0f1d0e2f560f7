//! Persistent interactive interpreter processes.
//!
//! A [`RuntimeProcess`] keeps one interpreter alive across runs. Its stdout
//! and stderr are read by background tasks for the whole process lifetime;
//! every line is classified as it arrives and pushed into the slot of the
//! current run. A run ends when the tagged sentinel shows up on stdout or an
//! interrupt is reported on stderr.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{Classified, Stream, classify_line};
use crate::core::harness::Language;
use crate::core::types::{Cancelled, OutputKind, OutputRecord};

/// Error record pushed when the interpreter dies while a run is pending.
pub const EXITED_MESSAGE: &str = "runtime process exited unexpectedly";

/// stderr is drained by its own task; give it a moment to catch up once the
/// sentinel has been seen on stdout.
const OUTPUT_SETTLE: Duration = Duration::from_millis(25);

/// Options shared by every runtime of a registry.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    /// Search path used instead of `PATH` to resolve interpreters.
    pub search_path: Option<OsString>,
    /// Upper bound on one run. `None` waits for the sentinel or cancellation.
    pub run_timeout: Option<Duration>,
}

#[derive(Default)]
struct RunSlot {
    run_id: u64,
    records: Vec<OutputRecord>,
    done: Option<oneshot::Sender<()>>,
    exited: bool,
    /// A run that stopped waiting before its sentinel was read. Its remaining
    /// output is dropped until that sentinel arrives.
    abandoned: Option<u64>,
}

impl RunSlot {
    fn abandon(&mut self, run_id: u64) {
        self.done = None;
        if !self.records.iter().any(|record| record.kind == OutputKind::End) {
            self.abandoned = Some(run_id);
        }
    }
}

type SharedSlot = Arc<Mutex<RunSlot>>;

fn lock(slot: &SharedSlot) -> MutexGuard<'_, RunSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Session {
    child: Child,
    stdin: ChildStdin,
    slot: SharedSlot,
    readers: Vec<JoinHandle<()>>,
}

impl Session {
    fn has_exited(&self) -> bool {
        lock(&self.slot).exited
    }
}

/// One long-lived interpreter for a single language.
pub struct RuntimeProcess {
    language: Language,
    options: RuntimeOptions,
    program: Option<PathBuf>,
    session: Option<Session>,
    next_run_id: u64,
}

impl RuntimeProcess {
    pub fn new(language: Language, options: RuntimeOptions) -> Self {
        Self {
            language,
            options,
            program: None,
            session: None,
            next_run_id: 0,
        }
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// Is an interactive session currently running?
    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Is the interpreter resolvable on the search path? Does not start it.
    pub fn is_available(&mut self) -> bool {
        self.resolve_program().is_some()
    }

    fn resolve_program(&mut self) -> Option<PathBuf> {
        if self.program.is_none() {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            self.program = self
                .language
                .program_candidates()
                .iter()
                .find_map(|candidate| match &self.options.search_path {
                    Some(paths) => which::which_in(candidate, Some(paths), &cwd).ok(),
                    None => which::which(candidate).ok(),
                });
            debug!(language = %self.language, program = ?self.program, "resolved interpreter");
        }
        self.program.clone()
    }

    /// Version string from a one-shot invocation, separate from the session.
    #[instrument(skip_all, fields(language = %self.language))]
    pub async fn version(&mut self) -> Result<String> {
        let program = self
            .resolve_program()
            .ok_or_else(|| anyhow!("{} executable not found on PATH", self.language))?;
        let output = Command::new(&program)
            .args(self.language.version_args())
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("run {} version query", program.display()))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let text = if stdout.trim().is_empty() {
            String::from_utf8_lossy(&output.stderr).into_owned()
        } else {
            stdout.into_owned()
        };
        Ok(text.trim().to_string())
    }

    #[instrument(skip_all, fields(language = %self.language))]
    fn start(&mut self) -> Result<()> {
        let program = self
            .resolve_program()
            .ok_or_else(|| anyhow!("{} executable not found on PATH", self.language))?;
        let mut cmd = Command::new(&program);
        cmd.args(self.language.session_args())
            .env("NO_COLOR", "1")
            .env("__SuppressAnsiEscapeSequences", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %program.display(), "spawning runtime process");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", program.display()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let slot = SharedSlot::default();
        let readers = vec![
            tokio::spawn(pump(stdout, Stream::Stdout, self.language, slot.clone())),
            tokio::spawn(pump(stderr, Stream::Stderr, self.language, slot.clone())),
        ];
        self.session = Some(Session {
            child,
            stdin,
            slot,
            readers,
        });
        info!(pid = ?self.session.as_ref().and_then(|s| s.child.id()), "runtime process started");
        Ok(())
    }

    /// Run `code` and return every record produced until the run ended.
    ///
    /// Start and write failures come back as a single `Error` record.
    /// Cancellation returns a [`Cancelled`] error and leaves the process
    /// running.
    #[instrument(skip_all, fields(language = %self.language, run_id = tracing::field::Empty))]
    pub async fn run(&mut self, code: &str, cancel: &CancellationToken) -> Result<Vec<OutputRecord>> {
        if self.session.as_ref().is_some_and(Session::has_exited) {
            warn!("runtime process had exited, restarting");
            self.terminate().await;
        }
        if self.session.is_none() {
            if let Err(err) = self.start() {
                warn!(err = %format!("{err:#}"), "runtime failed to start");
                return Ok(vec![OutputRecord::error(format!("{err:#}"))]);
            }
        }

        self.next_run_id += 1;
        let run_id = self.next_run_id;
        tracing::Span::current().record("run_id", run_id);
        let processed = self.language.preprocess(code, run_id);

        let Some(session) = self.session.as_mut() else {
            return Ok(vec![OutputRecord::error("runtime process is not running")]);
        };
        let slot = session.slot.clone();
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut guard = lock(&slot);
            guard.run_id = run_id;
            guard.records.clear();
            guard.done = Some(done_tx);
        }

        let written = async {
            session.stdin.write_all(processed.as_bytes()).await?;
            session.stdin.flush().await
        }
        .await;
        if let Err(err) = written {
            warn!(err = %err, "write to runtime failed");
            self.terminate().await;
            return Ok(vec![OutputRecord::error(format!(
                "write code to {} runtime: {err}",
                self.language
            ))]);
        }
        debug!(bytes = processed.len(), "code submitted");

        let run_timeout = self.options.run_timeout;
        let completion = async {
            match run_timeout {
                Some(limit) => tokio::time::timeout(limit, done_rx).await.is_ok(),
                None => {
                    // A dropped sender means the session was torn down.
                    let _ = done_rx.await;
                    true
                }
            }
        };
        let completed = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                lock(&slot).abandon(run_id);
                info!("code run cancelled, runtime kept alive");
                return Err(Cancelled.into());
            }
            completed = completion => completed,
        };

        if completed {
            tokio::time::sleep(OUTPUT_SETTLE).await;
        }
        let mut records = {
            let mut guard = lock(&slot);
            if completed {
                // An interrupt ends the run before its sentinel is printed.
                guard.abandon(run_id);
            }
            std::mem::take(&mut guard.records)
        };
        if !completed {
            let secs = run_timeout.map(|limit| limit.as_secs()).unwrap_or_default();
            warn!(timeout_secs = secs, "code run timed out, discarding runtime");
            records.push(OutputRecord::error(format!("code run timed out after {secs}s")));
            self.terminate().await;
        }
        debug!(records = records.len(), "code run finished");
        Ok(records)
    }

    /// Unblock any waiter, kill the process and forget the session.
    pub async fn terminate(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Some(done) = lock(&session.slot).done.take() {
            let _ = done.send(());
        }
        if let Err(err) = session.child.kill().await {
            debug!(err = %err, "kill runtime process");
        }
        for reader in session.readers {
            reader.abort();
        }
        info!(language = %self.language, "runtime process terminated");
    }
}

async fn pump<R: AsyncRead + Unpin>(reader: R, stream: Stream, language: Language, slot: SharedSlot) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                deliver(&slot, classify_line(language, stream, line));
            }
            Err(err) => {
                warn!(?stream, err = %err, "read runtime output");
                break;
            }
        }
    }
    if stream == Stream::Stdout {
        let mut guard = lock(&slot);
        guard.exited = true;
        if let Some(done) = guard.done.take() {
            guard.records.push(OutputRecord::error(EXITED_MESSAGE));
            let _ = done.send(());
        }
        debug!(?stream, "runtime output closed");
    }
}

fn deliver(slot: &SharedSlot, classified: Classified) {
    if classified.records.is_empty() {
        return;
    }
    let mut guard = lock(slot);
    let tag = classified
        .end_tag
        .as_deref()
        .and_then(|tag| tag.parse::<u64>().ok());
    if let Some(abandoned) = guard.abandoned {
        match tag {
            Some(id) if id == abandoned => {
                debug!(abandoned, "abandoned run drained");
                guard.abandoned = None;
                return;
            }
            // The abandoned sentinel was lost; the current run still ends.
            Some(id) if id == guard.run_id => guard.abandoned = None,
            _ => {
                debug!(abandoned, "dropping output of an abandoned run");
                return;
            }
        }
    }
    if let Some(id) = tag.filter(|id| *id != guard.run_id) {
        debug!(tag = id, current = guard.run_id, "ignoring sentinel of an abandoned run");
        return;
    }
    let completes = classified.completes_run();
    guard.records.extend(classified.records);
    if completes {
        if let Some(done) = guard.done.take() {
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_for_run(run_id: u64) -> (SharedSlot, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let slot = SharedSlot::default();
        {
            let mut guard = lock(&slot);
            guard.run_id = run_id;
            guard.done = Some(tx);
        }
        (slot, rx)
    }

    #[test]
    fn sentinel_of_current_run_completes() {
        let (slot, mut rx) = slot_for_run(3);
        deliver(&slot, classify_line(Language::Python, Stream::Stdout, "hi"));
        assert!(rx.try_recv().is_err());
        deliver(&slot, classify_line(Language::Python, Stream::Stdout, "##end_of_execution##:3"));
        assert!(rx.try_recv().is_ok());
        let kinds: Vec<_> = lock(&slot).records.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![OutputKind::Output, OutputKind::End]);
    }

    /// Verifies a late sentinel from a cancelled run cannot end the next run.
    #[test]
    fn stale_sentinel_is_ignored() {
        let (slot, mut rx) = slot_for_run(5);
        deliver(&slot, classify_line(Language::Python, Stream::Stdout, "##end_of_execution##:4"));
        assert!(rx.try_recv().is_err());
        assert!(lock(&slot).records.is_empty());
    }

    /// Verifies output still arriving from a cancelled run is dropped until
    /// that run's sentinel, and the next run only sees its own lines.
    #[test]
    fn output_of_abandoned_run_is_dropped() {
        let (slot, mut rx) = slot_for_run(5);
        lock(&slot).abandoned = Some(4);

        deliver(&slot, classify_line(Language::Python, Stream::Stdout, "late"));
        deliver(&slot, classify_line(Language::Python, Stream::Stderr, "ValueError: late"));
        deliver(&slot, classify_line(Language::Python, Stream::Stdout, "##end_of_execution##:4"));
        assert!(rx.try_recv().is_err());
        assert!(lock(&slot).records.is_empty());
        assert_eq!(lock(&slot).abandoned, None);

        deliver(&slot, classify_line(Language::Python, Stream::Stdout, "next"));
        deliver(&slot, classify_line(Language::Python, Stream::Stdout, "##end_of_execution##:5"));
        assert!(rx.try_recv().is_ok());
        let kinds: Vec<_> = lock(&slot).records.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![OutputKind::Output, OutputKind::End]);
        assert_eq!(lock(&slot).records[0].content, "next");
    }

    #[test]
    fn current_sentinel_ends_run_when_abandoned_one_never_came() {
        let (slot, mut rx) = slot_for_run(7);
        lock(&slot).abandoned = Some(6);

        deliver(&slot, classify_line(Language::Python, Stream::Stdout, "##end_of_execution##:7"));

        assert!(rx.try_recv().is_ok());
        assert_eq!(lock(&slot).abandoned, None);
    }

    #[test]
    fn abandon_after_sentinel_keeps_nothing_pending() {
        let (slot, _rx) = slot_for_run(2);
        deliver(&slot, classify_line(Language::Python, Stream::Stdout, "##end_of_execution##:2"));

        lock(&slot).abandon(2);

        assert_eq!(lock(&slot).abandoned, None);
    }

    #[test]
    fn errors_accumulate_without_completing() {
        let (slot, mut rx) = slot_for_run(1);
        deliver(&slot, classify_line(Language::Python, Stream::Stderr, "NameError: x"));
        assert!(rx.try_recv().is_err());
        deliver(&slot, classify_line(Language::Python, Stream::Stderr, "KeyboardInterrupt"));
        assert!(rx.try_recv().is_ok());
        assert_eq!(lock(&slot).records.len(), 2);
    }

    #[tokio::test]
    async fn unavailable_interpreter_reports_error_record_without_spawning() {
        let empty = tempfile::tempdir().expect("tempdir");
        let mut runtime = RuntimeProcess::new(
            Language::Python,
            RuntimeOptions {
                search_path: Some(empty.path().as_os_str().to_owned()),
                run_timeout: None,
            },
        );
        assert!(!runtime.is_available());
        let records = runtime
            .run("print(1)", &CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, OutputKind::Error);
        assert!(!runtime.is_running());
    }
}
