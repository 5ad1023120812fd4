//! Captured shell execution with resource accounting.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::resource::{getrusage, UsageWho};
use nix::sys::time::TimeVal;

use common::shell::Shell;

/// Wall-clock guard for child commands. Generous on purpose: builds block
/// on LaTeX and friends, and runaway children are the failure this catches.
const TIMEOUT: Duration = Duration::from_secs(60_000);

/// What a completed shell command handed back.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub returncode: i32,
    /// User CPU seconds spent in children during this call.
    pub user_time: f64,
    /// System CPU seconds spent in children during this call.
    pub sys_time: f64,
}

/// A command that ran and exited non-zero, with its captured streams.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Shell command '{command}' failed with return code {code:?}")]
pub struct ShellFailure {
    pub command: String,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("executable '{0}' not found on PATH")]
    MissingExecutable(String),
    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("lost contact with '{command}': {source}")]
    Io {
        command: String,
        source: std::io::Error,
    },
    #[error("'{command}' did not finish within {} seconds", TIMEOUT.as_secs())]
    Timeout { command: String },
    #[error("{0}")]
    Failed(#[from] ShellFailure),
}

pub(crate) struct ShellDriver {
    shell: Shell,
    build: PathBuf,
    /// Executables already confirmed to be on PATH.
    checked: RefCell<HashSet<String>>,
}

impl ShellDriver {
    pub fn new(shell: Shell, build: PathBuf) -> Self {
        Self {
            shell,
            build,
            checked: RefCell::new(HashSet::new()),
        }
    }

    /// Run `cmd` through the configured shell with the build directory as
    /// its working directory, capturing both output streams.
    pub fn run(
        &self,
        cmd: &str,
        stdin: Option<&str>,
        check: bool,
    ) -> Result<ShellOutput, ShellError> {
        if check {
            self.check_executable(cmd)?;
        }

        let (user_before, sys_before) = rusage_children();
        tracing::info!("(shell) {cmd}");

        let mut command = Command::new(self.shell.program());
        command
            .args(self.shell.argv(cmd))
            .current_dir(&self.build)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| ShellError::Spawn {
            command: cmd.to_owned(),
            source,
        })?;

        // Feed stdin and drain both outputs on their own threads so a chatty
        // child cannot deadlock against a full pipe.
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let input = input.to_owned();
            std::thread::spawn(move || {
                let _ = pipe.write_all(input.as_bytes());
            });
        }
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_reader = std::thread::spawn(move || read_pipe(stdout_pipe));
        let stderr_reader = std::thread::spawn(move || read_pipe(stderr_pipe));

        let status = self.wait(cmd, &mut child)?;
        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        let (user_after, sys_after) = rusage_children();

        if !status.success() {
            return Err(ShellFailure {
                command: cmd.to_owned(),
                code: status.code(),
                stdout,
                stderr,
            }
            .into());
        }

        Ok(ShellOutput {
            stdout,
            stderr,
            returncode: status.code().unwrap_or(0),
            user_time: user_after - user_before,
            sys_time: sys_after - sys_before,
        })
    }

    fn wait(&self, cmd: &str, child: &mut Child) -> Result<std::process::ExitStatus, ShellError> {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if started.elapsed() > TIMEOUT {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(ShellError::Timeout {
                            command: cmd.to_owned(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(source) => {
                    return Err(ShellError::Io {
                        command: cmd.to_owned(),
                        source,
                    })
                }
            }
        }
    }

    /// Fail early when the command's executable is not installed, rather
    /// than drowning the author in the shell's own complaint mid-build.
    fn check_executable(&self, cmd: &str) -> Result<(), ShellError> {
        let program = cmd.split_whitespace().next().unwrap_or_default();
        if self.checked.borrow().contains(program) {
            return Ok(());
        }

        let found = if program.contains('/') {
            is_executable(Path::new(program))
        } else {
            std::env::var_os("PATH")
                .map(|path| {
                    std::env::split_paths(&path).any(|dir| is_executable(&dir.join(program)))
                })
                .unwrap_or(false)
        };

        if !found {
            return Err(ShellError::MissingExecutable(program.to_owned()));
        }
        self.checked.borrow_mut().insert(program.to_owned());
        Ok(())
    }
}

fn read_pipe<R: Read>(pipe: Option<R>) -> String {
    let mut out = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut out);
    }
    out
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn rusage_children() -> (f64, f64) {
    match getrusage(UsageWho::RUSAGE_CHILDREN) {
        Ok(usage) => (seconds(usage.user_time()), seconds(usage.system_time())),
        Err(_) => (0.0, 0.0),
    }
}

fn seconds(time: TimeVal) -> f64 {
    time.tv_sec() as f64 + time.tv_usec() as f64 / 1e6
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn driver(build: &Path) -> ShellDriver {
        ShellDriver::new(Shell::default(), build.to_owned())
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let dir = tempdir().expect("Failed to create tempdir");
        let output = driver(dir.path())
            .run("echo out; echo err >&2", None, true)
            .expect("Failed to run command");
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.returncode, 0);
    }

    #[test]
    fn stdin_is_fed_to_the_child() {
        let dir = tempdir().expect("Failed to create tempdir");
        let output = driver(dir.path())
            .run("tr a-z A-Z", Some("hello"), true)
            .expect("Failed to run command");
        assert_eq!(output.stdout, "HELLO");
    }

    #[test]
    fn runs_in_the_build_directory() {
        let dir = tempdir().expect("Failed to create tempdir");
        let output = driver(dir.path())
            .run("pwd", None, true)
            .expect("Failed to run command");
        let reported = std::path::PathBuf::from(output.stdout.trim());
        assert_eq!(
            reported.canonicalize().expect("Failed to canonicalize"),
            dir.path().canonicalize().expect("Failed to canonicalize")
        );
    }

    #[test]
    fn nonzero_exit_is_a_failure_with_captured_output() {
        let dir = tempdir().expect("Failed to create tempdir");
        let err = driver(dir.path())
            .run("echo doomed >&2; exit 3", None, true)
            .expect_err("Expected a failure");
        let ShellError::Failed(failure) = err else {
            panic!("Expected ShellError::Failed, got {err:?}");
        };
        assert_eq!(failure.code, Some(3));
        assert_eq!(failure.stderr, "doomed\n");
    }

    #[test]
    fn missing_executable_is_rejected_up_front() {
        let dir = tempdir().expect("Failed to create tempdir");
        let err = driver(dir.path())
            .run("definitely-not-a-real-binary --flag", None, true)
            .expect_err("Expected a missing-executable error");
        assert!(matches!(err, ShellError::MissingExecutable(_)));
    }

    #[test]
    fn check_can_be_disabled() {
        let dir = tempdir().expect("Failed to create tempdir");
        // The shell itself then reports the miss as a plain failure.
        let err = driver(dir.path())
            .run("definitely-not-a-real-binary", None, false)
            .expect_err("Expected a failure");
        assert!(matches!(err, ShellError::Failed(_)));
    }

    #[test]
    fn path_checks_are_memoized() {
        let dir = tempdir().expect("Failed to create tempdir");
        let driver = driver(dir.path());
        driver.run("echo one", None, true).expect("Failed to run command");
        assert!(driver.checked.borrow().contains("echo"));
        driver.run("echo two", None, true).expect("Failed to run command");
    }

    #[test]
    fn rusage_accounting_moves_forward() {
        let dir = tempdir().expect("Failed to create tempdir");
        let output = driver(dir.path())
            .run("true", None, true)
            .expect("Failed to run command");
        assert!(output.user_time >= 0.0);
        assert!(output.sys_time >= 0.0);
    }
}
