use std::fmt;
use std::path::PathBuf;

use color_eyre::eyre::eyre;
use color_eyre::{Section, SectionExt};

use crate::shell::ShellFailure;

/// Raised by a script to request a full re-run from the top of the document.
#[derive(Debug, Clone, Copy)]
pub struct RestartRequest;

impl fmt::Display for RestartRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("restart requested")
    }
}

impl std::error::Error for RestartRequest {}

/// Errors raised inside host operations. These cross the Lua boundary as
/// external errors and resurface in [`Error::Script`] messages, except for
/// shell failures which are picked out of the chain and reported with their
/// captured output.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("recall '{target}': source '{missing}' does not exist (sources: {})", .sources.join(", "))]
    MissingDependency {
        target: String,
        missing: String,
        sources: Vec<String>,
    },
    #[error("import '{name}' not found; searched: {}", join_paths(.searched))]
    ImportNotFound { name: String, searched: Vec<PathBuf> },
    #[error("'target' requires exactly one name, got {0}")]
    ImportTarget(usize),
    #[error("keep directory '{}' is not an absolute path", .path.display())]
    KeepDirectory { path: PathBuf },
    #[error("cannot keep '{0}', which is neither a file nor a directory")]
    KeepTarget(String),
    #[error("unknown component '{0}'")]
    UnknownComponent(String),
    #[error("{name} version {required} is required, but only {actual} is available")]
    VersionUnmet {
        name: String,
        required: String,
        actual: String,
    },
    #[error("cannot spell check a document read from standard input")]
    SpellCheckStdin,
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| format!("'{}'", path.display()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Everything that can abort a run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The embedded runtime failed; the message carries the precise
    /// source position reported by Lua.
    #[error("{origin}: {message}")]
    Script { origin: String, message: String },
    #[error("Shell command '{command}' failed")]
    Shell {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("({file}, line {line}): include '{name}' not found; searched: {}", join_paths(.searched))]
    IncludeNotFound {
        file: String,
        line: u32,
        name: String,
        searched: Vec<PathBuf>,
    },
    #[error("({file}, line {line}): {message}")]
    IncludeParse {
        file: String,
        line: u32,
        message: String,
    },
    #[error("({file}, line {line}): cannot read include: {source}")]
    IncludeRead {
        file: String,
        line: u32,
        source: std::io::Error,
    },
}

impl Error {
    /// Render for the user, attaching captured output where there is some.
    pub fn into_report(self) -> color_eyre::Report {
        match self {
            Error::Shell {
                command,
                code,
                stdout,
                stderr,
            } => {
                let mut report = match code {
                    Some(code) => {
                        eyre!("Shell command '{command}' failed with exit code {code}")
                    }
                    None => eyre!("Shell command '{command}' was terminated by a signal"),
                };
                if !stdout.trim().is_empty() {
                    report = report.section(stdout.trim().to_owned().header("Stdout:"));
                }
                if !stderr.trim().is_empty() {
                    report = report.section(stderr.trim().to_owned().header("Stderr:"));
                }
                report
            }
            other => color_eyre::Report::new(other),
        }
    }

    pub(crate) fn from_failure(failure: &ShellFailure) -> Self {
        Error::Shell {
            command: failure.command.clone(),
            code: failure.code,
            stdout: failure.stdout.clone(),
            stderr: failure.stderr.clone(),
        }
    }
}
