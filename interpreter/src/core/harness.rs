//! Supported languages and the harness that wraps submitted code.
//!
//! Every submission is wrapped so that:
//! - any raised error (with its chain of causes) is written to stderr;
//! - a sentinel line tagged with the run number is printed on stdout once the
//!   submission has finished, whether it succeeded, failed or did not parse.
//!
//! The sentinel literal is split in the generated source so that an echo of
//! the submitted text can never contain it.

use std::borrow::Cow;
use std::fmt;
use std::sync::LazyLock;

use regex::{Captures, Regex};

/// End-of-run marker printed on stdout after every submission.
pub const SENTINEL: &str = "##end_of_execution##";

/// Lines the python harness puts in front of the submitted code.
const PYTHON_PREFIX_LINES: u64 = 1;

static STDIN_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"File "<stdin>", line (\d+)"#).expect("stdin frame regex must compile")
});

/// A language with a persistent interactive runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Language {
    PowerShell,
    Python,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::PowerShell, Language::Python];

    /// Stable identifier used by the model and in fenced code blocks.
    pub fn id(self) -> &'static str {
        match self {
            Language::PowerShell => "powershell",
            Language::Python => "python",
        }
    }

    /// Case-insensitive lookup by identifier.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|language| language.id().eq_ignore_ascii_case(name))
    }

    /// Executable names tried in order on the search path.
    pub fn program_candidates(self) -> &'static [&'static str] {
        match self {
            Language::PowerShell => &["pwsh"],
            Language::Python => &["python3", "python"],
        }
    }

    /// Arguments for the long-lived interactive session.
    pub fn session_args(self) -> &'static [&'static str] {
        match self {
            Language::PowerShell => &["-NoProfile", "-NoLogo", "-Command", "-"],
            Language::Python => &["-q", "-u", "-i"],
        }
    }

    /// Arguments for the one-shot version query.
    pub fn version_args(self) -> &'static [&'static str] {
        match self {
            Language::PowerShell => &["--version"],
            Language::Python => &["-V"],
        }
    }

    /// Wraps `code` in the language harness for run number `run_id`.
    pub fn preprocess(self, code: &str, run_id: u64) -> String {
        match self {
            Language::PowerShell => powershell_harness(code, run_id),
            Language::Python => python_harness(code, run_id),
        }
    }

    /// Does this stderr line report that the submission was interrupted?
    pub fn is_interrupt(self, line: &str) -> bool {
        match self {
            Language::PowerShell => {
                line.contains("PipelineStoppedException")
                    || line.contains("The pipeline has been stopped")
            }
            Language::Python => line.contains("KeyboardInterrupt"),
        }
    }

    /// Removes interactive prompt noise from a stderr line.
    pub fn clean_stderr<'a>(self, line: &'a str) -> &'a str {
        match self {
            Language::PowerShell => line,
            Language::Python => {
                let mut rest = line;
                loop {
                    let trimmed = rest
                        .strip_prefix(">>> ")
                        .or_else(|| rest.strip_prefix("... "));
                    match trimmed {
                        Some(next) => rest = next,
                        None => break,
                    }
                }
                if rest == ">>>" || rest == "..." {
                    ""
                } else {
                    rest
                }
            }
        }
    }

    /// Maps `<stdin>` line numbers in a traceback line back to the lines of
    /// the submitted code.
    pub fn restore_line_numbers(self, line: &str) -> Cow<'_, str> {
        match self {
            Language::PowerShell => Cow::Borrowed(line),
            Language::Python => STDIN_FRAME.replace_all(line, |caps: &Captures<'_>| {
                match caps[1].parse::<u64>() {
                    Ok(number) => {
                        let number = number.saturating_sub(PYTHON_PREFIX_LINES).max(1);
                        format!(r#"File "<stdin>", line {number}"#)
                    }
                    Err(_) => caps[0].to_string(),
                }
            }),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Splits the sentinel into two string literals joined by `+`.
fn split_sentinel(quote: char) -> String {
    let (head, tail) = SENTINEL.split_at(SENTINEL.len() / 2);
    format!("{quote}{head}{quote} + {quote}{tail}{quote}")
}

fn python_harness(code: &str, run_id: u64) -> String {
    let mut out = String::from("try:\n");
    if code.trim().is_empty() {
        out.push_str("    pass\n");
    } else {
        for line in code.lines() {
            let line = line.trim_end_matches('\r');
            // An empty line closes the compound statement in the interactive
            // reader; indentation alone keeps it open.
            if line.trim().is_empty() {
                out.push_str("    \n");
                continue;
            }
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push_str("except BaseException:\n");
    out.push_str("    __import__('traceback').print_exc()\n");
    out.push('\n');
    out.push_str(&format!(
        "print('\\n' + {} + ':{run_id}', flush=True)\n",
        split_sentinel('\'')
    ));
    out.push('\n');
    out
}

fn powershell_harness(code: &str, run_id: u64) -> String {
    let mut out = String::from("try {\n    $ErrorActionPreference = 'Stop'\n");
    for line in code.lines() {
        if line.trim().is_empty() {
            continue;
        }
        out.push_str("    ");
        out.push_str(line.trim_end_matches('\r'));
        out.push('\n');
    }
    out.push_str(concat!(
        "} catch {\n",
        "    $e = $_.Exception\n",
        "    $depth = 0\n",
        "    while ($null -ne $e) {\n",
        "        [Console]::Error.WriteLine(('---> ' * $depth) + $e.Message)\n",
        "        $e = $e.InnerException\n",
        "        $depth++\n",
        "    }\n",
        "    [Console]::Error.WriteLine($_.InvocationInfo.PositionMessage)\n",
        "}\n",
        "\n",
    ));
    out.push_str(&format!(
        "Write-Host ({} + ':{run_id}')\n",
        split_sentinel('\'')
    ));
    out.push('\n');
    out
}
