//! The standard host library: the operations every document script sees.
//!
//! Each operation is a Rust closure registered in the Lua globals. They read
//! the currently-executing frame back out of the reserved `frame` global, so
//! the same function values stay valid across the whole run.

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use mlua::prelude::*;
use regex::Regex;
use sha1::{Digest, Sha1};

use crate::error::{HostError, RestartRequest};
use crate::frame::{self, FrameHandle};
use crate::shell::ShellDriver;
use crate::workspace::{self, Workspace};
use crate::Tally;

/// Versions scripts can pin with `require_versions`.
const COMPONENTS: &[(&str, &str)] = &[("mash", env!("CARGO_PKG_VERSION")), ("lua", "5.4")];

/// Everything the host operations share: the workspace, the shell driver,
/// the import search path, and the keep destination.
pub(crate) struct HostState {
    pub workspace: Workspace,
    pub driver: ShellDriver,
    pub import_dirs: Vec<PathBuf>,
    pub keep_dir: PathBuf,
    pub tally: Rc<Tally>,
}

pub(crate) fn register(lua: &Lua, host: Rc<HostState>) -> LuaResult<()> {
    let globals = lua.globals();

    // save(target, contents?)
    {
        let host = host.clone();
        globals.set(
            "save",
            lua.create_function(move |lua, (target, contents): (String, Option<String>)| {
                let contents = match contents {
                    Some(contents) => contents,
                    None => frame::current(lua)?.text(),
                };
                host.save(&target, &contents).map_err(LuaError::external)
            })?,
        )?;
    }

    // recall(target, source...) -> bool
    {
        let host = host.clone();
        globals.set(
            "recall",
            lua.create_function(
                move |_, (target, sources): (String, LuaVariadic<String>)| {
                    host.recall(&target, &sources).map_err(LuaError::external)
                },
            )?,
        )?;
    }

    // keep(src, target?)
    {
        let host = host.clone();
        globals.set(
            "keep",
            lua.create_function(move |_, (src, target): (String, Option<String>)| {
                host.keep(&src, target.as_deref()).map_err(LuaError::external)
            })?,
        )?;
    }

    // imprt(name...) or imprt{name..., target=, conditional=}
    {
        let host = host.clone();
        globals.set(
            "imprt",
            lua.create_function(move |lua, args: LuaMultiValue| {
                let (names, target, conditional) = imprt_spec(lua, args)?;
                host.import(&names, target.as_deref(), conditional)
                    .map_err(LuaError::external)
            })?,
        )?;
    }

    // shell(cmd, {stdin=, check=}?) -> {stdout, stderr, returncode, user_time, sys_time}
    {
        let host = host.clone();
        globals.set(
            "shell",
            lua.create_function(move |lua, (cmd, opts): (String, Option<LuaTable>)| {
                let mut stdin: Option<String> = None;
                let mut check = true;
                if let Some(opts) = opts {
                    stdin = opts.get("stdin")?;
                    check = opts.get::<Option<bool>>("check")?.unwrap_or(true);
                }
                host.tally.shells.set(host.tally.shells.get() + 1);
                let output = host
                    .driver
                    .run(&cmd, stdin.as_deref(), check)
                    .map_err(LuaError::external)?;

                let result = lua.create_table()?;
                result.set("stdout", output.stdout)?;
                result.set("stderr", output.stderr)?;
                result.set("returncode", output.returncode)?;
                result.set("user_time", output.user_time)?;
                result.set("sys_time", output.sys_time)?;
                Ok(result)
            })?,
        )?;
    }

    // shell_filter(cmd): pipe the frame text through a command
    {
        let host = host.clone();
        globals.set(
            "shell_filter",
            lua.create_function(move |lua, cmd: String| {
                let frame = frame::current(lua)?;
                let text = frame.text();
                host.tally.shells.set(host.tally.shells.get() + 1);
                let output = host
                    .driver
                    .run(&cmd, Some(&text), true)
                    .map_err(LuaError::external)?;
                frame.set_text(output.stdout);
                Ok(())
            })?,
        )?;
    }

    // push(text?): inject into the enclosing frame
    globals.set(
        "push",
        lua.create_function(move |lua, text: Option<String>| {
            let frame = frame::current(lua)?;
            let text = text.unwrap_or_else(|| frame.text());
            let parent = frame
                .state()
                .parent
                .clone()
                .ok_or_else(|| LuaError::runtime("push: the root frame has no parent"))?;
            parent.push_contents(&text);
            Ok(())
        })?,
    )?;

    // read(fname): append a file to the frame text
    {
        let host = host.clone();
        globals.set(
            "read",
            lua.create_function(move |lua, fname: String| {
                let frame = frame::current(lua)?;
                let path = host.workspace.resolve(&fname);
                let contents = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read '{}'", path.display()))
                    .map_err(LuaError::external)?;
                frame.state_mut().text.push_str(&contents);
                Ok(())
            })?,
        )?;
    }

    // anon(content?) -> deterministic short name
    globals.set(
        "anon",
        lua.create_function(move |lua, content: Option<String>| {
            let content = match content {
                Some(content) => content,
                None => frame::current(lua)?.text(),
            };
            Ok(short_hash(&content))
        })?,
    )?;

    // unindent(): reindent the frame text to column zero
    globals.set(
        "unindent",
        lua.create_function(move |lua, ()| {
            let frame = frame::current(lua)?;
            let text = unindent(&frame.text());
            frame.set_text(text);
            Ok(())
        })?,
    )?;

    // strip(): trim surrounding whitespace off the frame text
    globals.set(
        "strip",
        lua.create_function(move |lua, ()| {
            let frame = frame::current(lua)?;
            let text = frame.text().trim().to_owned();
            frame.set_text(text);
            Ok(())
        })?,
    )?;

    // ext(fname, ext) -> fname with its extension replaced
    globals.set(
        "ext",
        lua.create_function(move |_, (fname, ext): (String, String)| {
            Ok(replace_ext(&fname, &ext))
        })?,
    )?;

    // spell_check(): interactively correct the source document, restarting
    // if it changed
    {
        let host = host.clone();
        globals.set(
            "spell_check",
            lua.create_function(move |lua, ()| {
                let frame = frame::current(lua)?;
                let changed = host.spell_check(&frame).map_err(LuaError::external)?;
                if changed {
                    // The document on disk is now different from the one
                    // being executed; only a fresh run can pick that up.
                    return Err(LuaError::external(RestartRequest));
                }
                Ok(())
            })?,
        )?;
    }

    // require_versions{component=version, ...}
    globals.set(
        "require_versions",
        lua.create_function(move |_, spec: LuaTable| {
            for pair in spec.pairs::<String, String>() {
                let (name, required) = pair?;
                check_version(&name, &required).map_err(LuaError::external)?;
            }
            Ok(())
        })?,
    )?;

    // restart(): rewind the whole run
    globals.set(
        "restart",
        lua.create_function(move |_, ()| -> LuaResult<()> {
            Err(LuaError::external(RestartRequest))
        })?,
    )?;

    // The default pre-frame hook rewrites @@path tokens in both the
    // commands and the text. Documents may replace it.
    {
        let host = host.clone();
        globals.set(
            "before_frame_hook",
            lua.create_function(move |_, frame_arg: LuaAnyUserData| {
                let frame = frame_arg.borrow::<FrameHandle>()?.clone();
                let commands = host
                    .rewrite_imports(&frame.state().commands.clone())
                    .map_err(LuaError::external)?;
                let text = host
                    .rewrite_imports(&frame.state().text.clone())
                    .map_err(LuaError::external)?;
                let mut state = frame.state_mut();
                state.commands = commands;
                state.text = text;
                Ok(())
            })?,
        )?;
    }

    Ok(())
}

fn imprt_spec(lua: &Lua, args: LuaMultiValue) -> LuaResult<(Vec<String>, Option<String>, bool)> {
    let values: Vec<LuaValue> = args.into_iter().collect();

    if values.len() == 1 {
        if let LuaValue::Table(table) = &values[0] {
            let mut names = Vec::new();
            for value in table.clone().sequence_values::<String>() {
                names.push(value?);
            }
            let target: Option<String> = table.get("target")?;
            let conditional = table.get::<Option<bool>>("conditional")?.unwrap_or(false);
            return Ok((names, target, conditional));
        }
    }

    let mut names = Vec::new();
    for value in values {
        names.push(String::from_lua(value, lua)?);
    }
    Ok((names, None, false))
}

impl HostState {
    /// Write `contents` to `target` in the build directory, reusing the
    /// archive copy (and its timestamp) when the bytes already match.
    fn save(&self, target: &str, contents: &str) -> Result<()> {
        let dest = self.workspace.resolve(target);
        let prev = self.workspace.archive_entry(target);

        if workspace::file_equals(&prev, contents.as_bytes()) {
            tracing::info!("using {target} from the previous build");
            workspace::copy_preserving(&prev, &dest)
        } else {
            tracing::info!("writing {} bytes to {target}", contents.len());
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create '{}'", parent.display()))?;
            }
            fs::write(&dest, contents)
                .with_context(|| format!("Failed to write '{}'", dest.display()))
        }
    }

    /// Copy the archive entry for `target` back into the build directory if
    /// its modification time dominates every listed source.
    fn recall(&self, target: &str, sources: &[String]) -> Result<bool> {
        let mut deps: Vec<&String> = Vec::new();
        for source in sources {
            if !deps.contains(&source) {
                deps.push(source);
            }
        }

        let prev = self.workspace.archive_entry(target);
        if !prev.exists() {
            tracing::debug!("{target} is not available from the previous build");
            return Ok(false);
        }
        let target_time = workspace::mtime(&prev)?;

        for source in &deps {
            let path = self.workspace.resolve(source);
            if !path.exists() {
                return Err(HostError::MissingDependency {
                    target: target.to_owned(),
                    missing: (*source).clone(),
                    sources: deps.iter().map(|s| (*s).clone()).collect(),
                }
                .into());
            }
            if workspace::mtime(&path)? > target_time {
                tracing::debug!("{source} is newer than {target}");
                return Ok(false);
            }
        }

        tracing::info!("recalled {target} from the previous build");
        workspace::copy_entry(&prev, &self.workspace.resolve(target))?;
        Ok(true)
    }

    /// Copy a finished build product out to the keep directory.
    fn keep(&self, src: &str, target: Option<&str>) -> Result<()> {
        if !self.keep_dir.is_absolute() {
            return Err(HostError::KeepDirectory {
                path: self.keep_dir.clone(),
            }
            .into());
        }

        let source = self.workspace.resolve(src);
        let dest = self.keep_dir.join(target.unwrap_or(src));
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create '{}'", parent.display()))?;
        }

        if source.is_file() {
            workspace::copy_preserving(&source, &dest)?;
        } else if source.is_dir() {
            workspace::copy_tree(&source, &dest)?;
        } else {
            return Err(HostError::KeepTarget(src.to_owned()).into());
        }
        tracing::info!("kept {src} as {}", dest.display());
        Ok(())
    }

    pub(crate) fn find_import(&self, name: &str) -> Option<PathBuf> {
        self.import_dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|path| path.exists())
    }

    /// Bring files from the import search path into the build directory.
    fn import(&self, names: &[String], target: Option<&str>, conditional: bool) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        if target.is_some() && names.len() != 1 {
            return Err(HostError::ImportTarget(names.len()).into());
        }

        for name in names {
            let Some(source) = self.find_import(name) else {
                if conditional {
                    tracing::debug!("skipping missing import {name}");
                    continue;
                }
                return Err(HostError::ImportNotFound {
                    name: name.clone(),
                    searched: self.import_dirs.clone(),
                }
                .into());
            };

            let base = match target {
                Some(target) => target.to_owned(),
                None => basename(name),
            };
            let dest = self.workspace.resolve(&base);

            let unchanged = match (fs::File::open(&source), fs::File::open(&dest)) {
                (Ok(a), Ok(b)) => workspace::contents_equal(a, b),
                _ => false,
            };
            if unchanged {
                tracing::debug!("import {name} is unchanged");
                continue;
            }
            workspace::copy_preserving(&source, &dest)?;
            tracing::debug!("imported {} as {base}", source.display());
        }
        Ok(())
    }

    /// Replace every `@@path` token by importing the file and substituting
    /// its basename.
    fn rewrite_imports(&self, s: &str) -> Result<String> {
        static AT_IMPORT: OnceLock<Regex> = OnceLock::new();
        let re = AT_IMPORT.get_or_init(|| Regex::new(r"@@([A-Za-z0-9_./+-]*)").unwrap());

        let mut out = String::with_capacity(s.len());
        let mut last = 0;
        for caps in re.captures_iter(s) {
            let all = caps.get(0).unwrap();
            let name = &caps[1];
            out.push_str(&s[last..all.start()]);
            if name.is_empty() {
                out.push_str(all.as_str());
            } else {
                self.import(&[name.to_owned()], None, false)?;
                out.push_str(&basename(name));
            }
            last = all.end();
        }
        out.push_str(&s[last..]);
        Ok(out)
    }

    /// Interactive spelling pass over the frame's source document. Returns
    /// whether the file changed, in which case the run is stale.
    fn spell_check(&self, frame: &FrameHandle) -> Result<bool> {
        let file = frame.state().file.to_string();
        if file == crate::STDIN_NAME {
            return Err(HostError::SpellCheckStdin.into());
        }
        let path = self.workspace.origin().join(&file);
        let before = workspace::mtime(&path)?;

        let status = std::process::Command::new("aspell")
            .arg("check")
            .arg(&path)
            .current_dir(self.workspace.origin())
            .status()
            .context("Failed to run aspell")?;
        if !status.success() {
            anyhow::bail!("aspell exited with {status}");
        }

        let changed = workspace::mtime(&path)? != before;
        if changed {
            tracing::info!("{file} changed during spell check");
        }
        Ok(changed)
    }
}

fn basename(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_owned())
}

/// First 7 hex characters of the SHA-1 of `content`.
pub(crate) fn short_hash(content: &str) -> String {
    let digest = Sha1::digest(content.as_bytes());
    digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>()[..7]
        .to_owned()
}

/// Remove the whitespace prefix of the first non-blank character from the
/// start of every line, so embedded code can sit at the document's indent.
pub(crate) fn unindent(s: &str) -> String {
    static PREFIX: OnceLock<Regex> = OnceLock::new();
    let re = PREFIX.get_or_init(|| Regex::new(r"(?m)^([ \t]*)[^ \t\n]").unwrap());

    let Some(caps) = re.captures(s) else {
        return s.to_owned();
    };
    let prefix = caps.get(1).unwrap().as_str();
    if prefix.is_empty() {
        return s.to_owned();
    }
    s.split('\n')
        .map(|line| line.strip_prefix(prefix).unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn replace_ext(fname: &str, ext: &str) -> String {
    Path::new(fname)
        .with_extension(ext.trim_start_matches('.'))
        .to_string_lossy()
        .into_owned()
}

fn check_version(name: &str, required: &str) -> Result<(), HostError> {
    let actual = COMPONENTS
        .iter()
        .find(|(component, _)| *component == name)
        .map(|(_, version)| *version)
        .ok_or_else(|| HostError::UnknownComponent(name.to_owned()))?;
    if !version_at_least(actual, required) {
        return Err(HostError::VersionUnmet {
            name: name.to_owned(),
            required: required.to_owned(),
            actual: actual.to_owned(),
        });
    }
    Ok(())
}

fn version_at_least(actual: &str, required: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.trim().parse().unwrap_or(0))
            .collect()
    };
    let actual = parse(actual);
    let required = parse(required);
    for i in 0..actual.len().max(required.len()) {
        let a = actual.get(i).copied().unwrap_or(0);
        let r = required.get(i).copied().unwrap_or(0);
        if a != r {
            return a > r;
        }
    }
    true
}
