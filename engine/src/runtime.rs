//! The embedded Lua 5.4 runtime, hosted through `mlua`.
//!
//! The engine treats the scripting language as a black box: it loads chunks
//! with a document-derived name (so error positions point into the author's
//! file), and installs or reads names in the global environment. Everything
//! else about the language is Lua's business.

use mlua::prelude::*;

use crate::error::RestartRequest;

pub(crate) struct LuaRuntime {
    lua: Lua,
}

impl LuaRuntime {
    pub fn new() -> Self {
        Self { lua: Lua::new() }
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Execute a chunk. `name` becomes the chunk name, so Lua's error
    /// messages read `name:line: ...`.
    pub fn exec(&self, chunk: &str, name: &str) -> LuaResult<()> {
        self.lua.load(chunk).set_name(format!("@{name}")).exec()
    }

    /// Look up a global, returning it only if it is a function.
    pub fn global_function(&self, name: &str) -> Option<LuaFunction> {
        match self.lua.globals().get::<LuaValue>(name) {
            Ok(LuaValue::Function(func)) => Some(func),
            _ => None,
        }
    }
}

/// Peel mlua's callback and context layers off an error, down to the host
/// value that was raised with `mlua::Error::external`.
fn external_of(err: &LuaError) -> Option<&(dyn std::error::Error + 'static)> {
    match err {
        LuaError::CallbackError { cause, .. } => external_of(cause),
        LuaError::WithContext { cause, .. } => external_of(cause),
        LuaError::ExternalError(inner) => Some(&**inner),
        _ => None,
    }
}

/// Search an error for a host-side value of type `T`.
///
/// Host operations raise typed errors through `mlua::Error::external`; by
/// the time they surface from `exec` they are wrapped in callback layers,
/// and the external value may itself carry a context chain. Walk both.
pub(crate) fn find_in_chain<'a, T: std::error::Error + 'static>(
    err: &'a LuaError,
) -> Option<&'a T> {
    let mut current = external_of(err)?;
    loop {
        if let Some(found) = current.downcast_ref::<T>() {
            return Some(found);
        }
        current = current.source()?;
    }
}

pub(crate) fn is_restart(err: &LuaError) -> bool {
    find_in_chain::<RestartRequest>(err).is_some()
}
