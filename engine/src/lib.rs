//! The document execution engine.
//!
//! A parsed frame tree is driven depth-first: a frame executes exactly once,
//! at the moment its closing delimiter is reached, so children always run
//! before their enclosing frame. All frames share one Lua global
//! environment, which is how definitions travel from one frame to the next;
//! a restart throws the whole environment away and the caller re-enters
//! from the top.

pub mod error;
mod frame;
mod runtime;
mod shell;
mod stdlib;
pub mod workspace;

use std::cell::Cell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Context as _;

use parser::{Frame, Node};

pub use crate::error::Error;
use crate::frame::FrameHandle;
use crate::runtime::LuaRuntime;
use crate::shell::{ShellDriver, ShellFailure};
use crate::stdlib::HostState;
use crate::workspace::Workspace;

/// Name used for documents read from standard input.
pub const STDIN_NAME: &str = "<stdin>";

/// The command/text separator inside a frame. The first occurrence in the
/// assembled contents splits script from payload.
const SEPARATOR: &str = "|||";

#[derive(Debug, Clone)]
pub struct Config {
    /// The invocation directory; the workspace lives beneath it.
    pub origin: PathBuf,
    /// Where `keep` puts finished outputs. Validated to be absolute when
    /// `keep` is actually called.
    pub keep_dir: PathBuf,
    /// Directories searched by `include` and `imprt`, in order.
    pub import_dirs: Vec<PathBuf>,
    pub shell: common::shell::Shell,
}

impl Config {
    /// A configuration with everything rooted at `origin`.
    pub fn new(origin: PathBuf) -> Self {
        Self {
            keep_dir: origin.clone(),
            import_dirs: vec![origin.clone()],
            origin,
            shell: Default::default(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Tally {
    pub frames: Cell<usize>,
    pub includes: Cell<usize>,
    pub shells: Cell<usize>,
}

/// What a finished run produced.
#[derive(Debug)]
pub struct RunSummary {
    pub frames: usize,
    pub includes: usize,
    pub shells: usize,
    /// The root frame's assembled contents.
    pub output: String,
}

/// How a run ended, short of an error.
#[derive(Debug)]
pub enum Outcome {
    Done(RunSummary),
    /// A script asked for a fresh run from the top. The caller rebuilds the
    /// engine and goes again.
    Restart,
}

enum Interrupt {
    Restart,
    Fail(Error),
}

pub struct Engine {
    runtime: LuaRuntime,
    host: Rc<HostState>,
    tally: Rc<Tally>,
}

impl Engine {
    /// Rotate the workspace and install the host library into a fresh
    /// runtime. Every run, including each re-entry after a restart, starts
    /// here.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let Config {
            origin,
            keep_dir,
            import_dirs,
            shell,
        } = config;

        let workspace = Workspace::new(origin);
        workspace.rotate().context("Failed to prepare the workspace")?;

        let runtime = LuaRuntime::new();
        let tally = Rc::new(Tally::default());
        let host = Rc::new(HostState {
            driver: ShellDriver::new(shell, workspace.build().to_owned()),
            workspace,
            import_dirs,
            keep_dir,
            tally: tally.clone(),
        });
        stdlib::register(runtime.lua(), host.clone())
            .map_err(|err| anyhow::anyhow!("Failed to install the host library: {err}"))?;

        Ok(Self {
            runtime,
            host,
            tally,
        })
    }

    /// Drive a parsed document to completion. The root frame is all text;
    /// only its descendants carry commands.
    pub fn execute(&self, root: &Frame, file_name: &str) -> Result<Outcome, Error> {
        let file: Rc<str> = Rc::from(file_name);
        let handle = FrameHandle::new(file.clone(), root.start.line, None);

        let result = self
            .assemble(root, &handle, &file)
            .and_then(|()| self.at_end());
        match result {
            Ok(()) => Ok(Outcome::Done(RunSummary {
                frames: self.tally.frames.get(),
                includes: self.tally.includes.get(),
                shells: self.tally.shells.get(),
                output: handle.state().contents.clone(),
            })),
            Err(Interrupt::Restart) => Ok(Outcome::Restart),
            Err(Interrupt::Fail(error)) => Err(error),
        }
    }

    /// Build up a frame's contents: literal text goes straight in, child
    /// frames execute at their closing delimiter, includes are inlined.
    fn assemble(
        &self,
        node: &Frame,
        handle: &FrameHandle,
        file: &Rc<str>,
    ) -> Result<(), Interrupt> {
        for child in &node.children {
            match child {
                Node::Text(text) => handle.push_contents(text),
                Node::Frame(frame) => {
                    let child_handle =
                        FrameHandle::new(file.clone(), frame.start.line, Some(handle.clone()));
                    self.assemble(frame, &child_handle, file)?;
                    self.close(&child_handle)?;
                }
                Node::Include { name, location } => {
                    self.include(name, location.line, handle, file)?
                }
            }
        }
        Ok(())
    }

    /// A frame executes exactly once, when its closing delimiter is
    /// consumed: split commands from text, bind the frame, run the hooks
    /// and the commands.
    fn close(&self, handle: &FrameHandle) -> Result<(), Interrupt> {
        self.tally.frames.set(self.tally.frames.get() + 1);

        let (file, line) = {
            let mut state = handle.state_mut();
            let (commands, text) = match state.contents.find(SEPARATOR) {
                Some(at) => (
                    state.contents[..at].to_owned(),
                    state.contents[at + SEPARATOR.len()..].to_owned(),
                ),
                None => (state.contents.clone(), String::new()),
            };
            state.commands = stdlib::unindent(&commands);
            state.text = text;
            (state.file.clone(), state.line)
        };
        let origin = format!("({file}, line {line})");

        self.runtime
            .lua()
            .globals()
            .set("frame", handle.clone())
            .map_err(|err| interpret(err, &origin))?;

        self.hook("before_frame_hook", handle, &origin)?;

        // Blank padding keeps Lua's reported positions aligned with the
        // author's document.
        let commands = handle.state().commands.clone();
        let chunk = "\n".repeat(line.saturating_sub(1) as usize) + &commands;
        self.runtime
            .exec(&chunk, &file)
            .map_err(|err| interpret(err, &origin))?;

        self.hook("after_frame_hook", handle, &origin)
    }

    fn hook(&self, name: &str, handle: &FrameHandle, origin: &str) -> Result<(), Interrupt> {
        if let Some(func) = self.runtime.global_function(name) {
            func.call::<()>(handle.clone())
                .map_err(|err| interpret(err, origin))?;
        }
        Ok(())
    }

    /// Inline an included document: parse it and run its children as if
    /// they had been written at the directive's position.
    fn include(
        &self,
        name: &str,
        line: u32,
        handle: &FrameHandle,
        file: &Rc<str>,
    ) -> Result<(), Interrupt> {
        self.tally.includes.set(self.tally.includes.get() + 1);

        let Some(path) = self.host.find_import(name) else {
            return Err(Interrupt::Fail(Error::IncludeNotFound {
                file: file.to_string(),
                line,
                name: name.to_owned(),
                searched: self.host.import_dirs.clone(),
            }));
        };
        tracing::debug!("including {}", path.display());

        let source = fs::read_to_string(&path).map_err(|source| {
            Interrupt::Fail(Error::IncludeRead {
                file: file.to_string(),
                line,
                source,
            })
        })?;
        let root = parser::parse(&source).map_err(|errors| {
            let error = &errors[0];
            Interrupt::Fail(Error::IncludeParse {
                file: name.to_owned(),
                line: error.location().line,
                message: error.message(),
            })
        })?;

        let sub_file: Rc<str> = Rc::from(name);
        self.assemble(&root, handle, &sub_file)
    }

    /// Documents may define `at_end` to run after the whole tree.
    fn at_end(&self) -> Result<(), Interrupt> {
        if let Some(func) = self.runtime.global_function("at_end") {
            tracing::debug!("running at_end");
            func.call::<()>(())
                .map_err(|err| interpret(err, "(at_end)"))?;
        }
        Ok(())
    }
}

fn interpret(err: mlua::Error, origin: &str) -> Interrupt {
    if runtime::is_restart(&err) {
        return Interrupt::Restart;
    }
    if let Some(failure) = runtime::find_in_chain::<ShellFailure>(&err) {
        return Interrupt::Fail(Error::from_failure(failure));
    }
    Interrupt::Fail(Error::Script {
        origin: origin.to_owned(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::time::{Duration, UNIX_EPOCH};

    use tempfile::tempdir;

    use super::*;
    use crate::workspace::{mtime, set_times};

    fn run(dir: &Path, text: &str) -> Result<Outcome, Error> {
        let root = parser::parse(text).expect("Failed to parse document");
        let engine = Engine::new(Config::new(dir.to_owned())).expect("Failed to create engine");
        engine.execute(&root, "test.mash")
    }

    fn summary(outcome: Outcome) -> RunSummary {
        match outcome {
            Outcome::Done(summary) => summary,
            Outcome::Restart => panic!("Unexpected restart"),
        }
    }

    fn output(result: Result<Outcome, Error>) -> String {
        summary(result.expect("Run failed")).output
    }

    #[test]
    fn push_injects_into_the_parent() {
        let dir = tempdir().expect("Failed to create tempdir");
        assert_eq!(output(run(dir.path(), "A[[[ push(\"B\") ]]]C")), "ABC");
    }

    #[test]
    fn child_text_stays_isolated_without_push() {
        let dir = tempdir().expect("Failed to create tempdir");
        assert_eq!(output(run(dir.path(), "A[[[ x = 1 ||| B ]]]C")), "AC");
    }

    #[test]
    fn definitions_persist_across_frames() {
        let dir = tempdir().expect("Failed to create tempdir");
        assert_eq!(
            output(run(dir.path(), "[[[ x = 3 ]]][[[ push(tostring(x)) ]]]")),
            "3"
        );
    }

    #[test]
    fn later_frames_shadow_earlier_definitions() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = "[[[ x = 3 ]]][[[ x = 4 ]]][[[ push(tostring(x)) ]]]";
        assert_eq!(output(run(dir.path(), doc)), "4");
    }

    #[test]
    fn nested_frames_execute_inside_out() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = "[[[ push(order) ||| [[[ order = (order or '') .. 'inner ' ]]] ]]]";
        let out = output(run(dir.path(), doc));
        assert_eq!(out, "inner ");
    }

    #[test]
    fn minimal_document_runs_and_creates_the_workspace() {
        let dir = tempdir().expect("Failed to create tempdir");
        let result = run(dir.path(), "[[[ print(\"hi\") ]]]\n");
        let summary = summary(result.expect("Run failed"));
        assert_eq!(summary.frames, 1);
        assert!(dir.path().join(workspace::BUILD_DIR).is_dir());
    }

    #[test]
    fn frame_origin_is_visible_to_scripts() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = "\n[[[ push(frame.file .. \":\" .. frame.line) ]]]";
        assert_eq!(output(run(dir.path(), doc)), "test.mash:2");
    }

    #[test]
    fn single_line_frame_saves_its_text() {
        let dir = tempdir().expect("Failed to create tempdir");
        run(dir.path(), "[[[ save(\"x.txt\") ||| hello ]]]").expect("Run failed");
        assert_eq!(
            fs::read_to_string(dir.path().join(".mash/x.txt")).expect("Failed to read file"),
            " hello "
        );
    }

    #[test]
    fn indented_commands_execute() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = "text\n    [[[\n        x = 4\n        push(tostring(x))\n    ]]]\n";
        let out = output(run(dir.path(), doc));
        assert!(out.contains('4'), "got: {out}");
    }

    #[test]
    fn rerun_preserves_timestamps_of_unchanged_saves() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = "[[[ save(\"x.txt\") ||| hello ]]]";
        run(dir.path(), doc).expect("First run failed");

        let built = dir.path().join(".mash/x.txt");
        let old = UNIX_EPOCH + Duration::new(1_600_000_000, 987_654_321);
        set_times(&built, old, old).expect("Failed to set times");

        run(dir.path(), doc).expect("Second run failed");
        assert_eq!(mtime(&built).expect("Failed to stat"), old);
    }

    #[test]
    fn recall_misses_then_hits_across_runs() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = concat!(
            "[[[\n",
            "    save(\"src\", \"s\")\n",
            "    save(\"out\", \"o\")\n",
            "    if recall(\"out\", \"src\") then push(\"hit\") else push(\"miss\") end\n",
            "]]]"
        );
        assert_eq!(output(run(dir.path(), doc)), "miss");
        assert_eq!(output(run(dir.path(), doc)), "hit");
    }

    #[test]
    fn include_inlines_the_file_contents() {
        let dir = tempdir().expect("Failed to create tempdir");
        fs::write(dir.path().join("b.mash"), "X").expect("Failed to write file");
        assert_eq!(output(run(dir.path(), "[[[ include b.mash ]]]")), "X");
    }

    #[test]
    fn included_definitions_are_visible_afterwards() {
        let dir = tempdir().expect("Failed to create tempdir");
        fs::write(
            dir.path().join("b.mash"),
            "[[[ function foo() return \"bar\" end ]]]",
        )
        .expect("Failed to write file");
        let doc = "[[[ include b.mash ]]][[[ push(foo()) ]]]";
        assert_eq!(output(run(dir.path(), doc)), "bar");
    }

    #[test]
    fn missing_include_is_fatal_with_the_search_path() {
        let dir = tempdir().expect("Failed to create tempdir");
        let err = run(dir.path(), "[[[ include ghost.mash ]]]").expect_err("Expected an error");
        let message = err.to_string();
        assert!(message.contains("ghost.mash"), "got: {message}");
        assert!(message.contains("line 1"), "got: {message}");
        assert!(matches!(err, Error::IncludeNotFound { .. }));
    }

    #[test]
    fn broken_include_reports_a_parse_error() {
        let dir = tempdir().expect("Failed to create tempdir");
        fs::write(dir.path().join("b.mash"), "a\n]]]").expect("Failed to write file");
        let err = run(dir.path(), "[[[ include b.mash ]]]").expect_err("Expected an error");
        let message = err.to_string();
        assert!(message.contains("b.mash"), "got: {message}");
        assert!(message.contains("top level"), "got: {message}");
    }

    #[test]
    fn runtime_errors_point_at_the_document_line() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = "line one\n[[[\n  x = 1\n  error('sadness')\n]]]\n";
        let err = run(dir.path(), doc).expect_err("Expected an error");
        let Error::Script { origin, message } = &err else {
            panic!("Expected a script error, got {err:?}");
        };
        assert_eq!(origin, "(test.mash, line 2)");
        assert!(message.contains("test.mash:4"), "got: {message}");
        assert!(message.contains("sadness"), "got: {message}");
    }

    #[test]
    fn syntax_errors_point_at_the_document_line() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = "\n\n[[[ print 'x' ]]]";
        let err = run(dir.path(), doc).expect_err("Expected an error");
        let Error::Script { message, .. } = &err else {
            panic!("Expected a script error, got {err:?}");
        };
        assert!(message.contains("test.mash:3"), "got: {message}");
    }

    #[test]
    fn failed_shell_commands_carry_their_output() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = "[[[ shell(\"echo broken >&2; exit 9\") ]]]";
        let err = run(dir.path(), doc).expect_err("Expected an error");
        let Error::Shell {
            code, stderr, ..
        } = &err
        else {
            panic!("Expected a shell error, got {err:?}");
        };
        assert_eq!(*code, Some(9));
        assert_eq!(stderr, "broken\n");
    }

    #[test]
    fn missing_executables_fail_before_running() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = "[[[ shell(\"mash-no-such-binary --help\") ]]]";
        let err = run(dir.path(), doc).expect_err("Expected an error");
        assert!(
            err.to_string().contains("not found on PATH"),
            "got: {err}"
        );
    }

    #[test]
    fn shell_results_are_visible_to_scripts() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = "[[[ r = shell(\"echo hi\"); push(r.stdout); push(tostring(r.returncode)) ]]]";
        assert_eq!(output(run(dir.path(), doc)), "hi\n0");
    }

    #[test]
    fn shell_filter_replaces_the_frame_text() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = "[[[ shell_filter(\"tr a-z A-Z\"); push() ||| hello ]]]";
        assert_eq!(output(run(dir.path(), doc)), " HELLO ");
    }

    #[test]
    fn at_rewrite_imports_and_renames() {
        let dir = tempdir().expect("Failed to create tempdir");
        fs::create_dir(dir.path().join("figs")).expect("Failed to create dir");
        fs::write(dir.path().join("figs/fig.dot"), "graph {}").expect("Failed to write file");
        let doc = "[[[ push() ||| see @@figs/fig.dot ]]]";
        assert_eq!(output(run(dir.path(), doc)), " see fig.dot ");
        assert!(dir.path().join(".mash/fig.dot").exists());
    }

    #[test]
    fn keep_copies_out_of_the_workspace() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = "[[[ save(\"out.txt\"); keep(\"out.txt\") ||| payload ]]]";
        run(dir.path(), doc).expect("Run failed");
        assert_eq!(
            fs::read_to_string(dir.path().join("out.txt")).expect("Failed to read file"),
            " payload "
        );
    }

    #[test]
    fn anon_is_a_pure_function_of_the_text() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = "[[[ push(anon(\"test\")) ]]]";
        assert_eq!(output(run(dir.path(), doc)), "a94a8fe");
    }

    #[test]
    fn read_appends_to_the_frame_text() {
        let dir = tempdir().expect("Failed to create tempdir");
        fs::write(dir.path().join("note.txt"), "N").expect("Failed to write file");
        let doc = "[[[ imprt(\"note.txt\"); read(\"note.txt\"); push() ]]]";
        assert_eq!(output(run(dir.path(), doc)), "N");
    }

    #[test]
    fn require_versions_accepts_and_rejects() {
        let dir = tempdir().expect("Failed to create tempdir");
        run(dir.path(), "[[[ require_versions{lua=\"5.4\", mash=\"0.1\"} ]]]")
            .expect("Run failed");

        let err = run(dir.path(), "[[[ require_versions{mash=\"99\"} ]]]")
            .expect_err("Expected an error");
        assert!(err.to_string().contains("99"), "got: {err}");
    }

    #[test]
    fn restart_discards_the_context_and_reruns() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = concat!(
            "[[[\n",
            "    local r = shell(\"test -e ../flag; echo $?\", {check=false})\n",
            "    if r.stdout ~= \"0\\n\" then\n",
            "        leak = \"yes\"\n",
            "        shell(\"touch ../flag\", {check=false})\n",
            "        restart()\n",
            "    elseif leak == nil then\n",
            "        push(\"fresh\")\n",
            "    else\n",
            "        push(\"stale\")\n",
            "    end\n",
            "]]]"
        );

        let first = run(dir.path(), doc).expect("First run failed");
        assert!(matches!(first, Outcome::Restart));
        assert!(dir.path().join("flag").exists());

        assert_eq!(output(run(dir.path(), doc)), "fresh");
    }

    #[test]
    fn at_end_runs_after_the_tree() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = "A[[[ function at_end() push(\"!\") end ]]]B";
        assert_eq!(output(run(dir.path(), doc)), "AB!");
    }

    #[test]
    fn at_end_failures_are_fatal() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = "[[[ function at_end() error(\"boom\") end ]]]";
        let err = run(dir.path(), doc).expect_err("Expected an error");
        assert!(err.to_string().contains("boom"), "got: {err}");
    }

    #[test]
    fn a_run_is_tallied() {
        let dir = tempdir().expect("Failed to create tempdir");
        let doc = "[[[ shell(\"true\") ]]][[[ x = 1 ]]]";
        let summary = summary(run(dir.path(), doc).expect("Run failed"));
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.shells, 1);
        assert_eq!(summary.includes, 0);
    }
}
