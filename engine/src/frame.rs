//! The live frame context that scripts see.

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use mlua::prelude::*;

/// Execution state of a single frame.
///
/// `contents` is assembled incrementally while the frame's children run;
/// `commands` and `text` are derived from it when the frame closes. A child
/// injecting into its parent (`push`) appends to the parent's `contents`
/// mid-assembly, which is why the buffer is shared behind a handle.
#[derive(Debug)]
pub(crate) struct FrameState {
    pub file: Rc<str>,
    pub line: u32,
    pub contents: String,
    pub commands: String,
    pub text: String,
    pub parent: Option<FrameHandle>,
}

/// Shared handle to a frame, exposed to Lua as the reserved `frame` global.
#[derive(Debug, Clone)]
pub(crate) struct FrameHandle(pub Rc<RefCell<FrameState>>);

impl FrameHandle {
    pub fn new(file: Rc<str>, line: u32, parent: Option<FrameHandle>) -> Self {
        Self(Rc::new(RefCell::new(FrameState {
            file,
            line,
            contents: String::new(),
            commands: String::new(),
            text: String::new(),
            parent,
        })))
    }

    pub fn state(&self) -> Ref<'_, FrameState> {
        self.0.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, FrameState> {
        self.0.borrow_mut()
    }

    pub fn text(&self) -> String {
        self.state().text.clone()
    }

    pub fn set_text(&self, text: String) {
        self.state_mut().text = text;
    }

    pub fn push_contents(&self, text: &str) {
        self.state_mut().contents.push_str(text);
    }
}

impl LuaUserData for FrameHandle {
    fn add_fields<F: LuaUserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("text", |_, this| Ok(this.state().text.clone()));
        fields.add_field_method_set("text", |_, this, value: String| {
            this.set_text(value);
            Ok(())
        });
        // `content` is the traditional alias for the text part.
        fields.add_field_method_get("content", |_, this| Ok(this.state().text.clone()));
        fields.add_field_method_set("content", |_, this, value: String| {
            this.set_text(value);
            Ok(())
        });
        fields.add_field_method_get("contents", |_, this| Ok(this.state().contents.clone()));
        fields.add_field_method_set("contents", |_, this, value: String| {
            this.state_mut().contents = value;
            Ok(())
        });
        fields.add_field_method_get("commands", |_, this| Ok(this.state().commands.clone()));
        fields.add_field_method_set("commands", |_, this, value: String| {
            this.state_mut().commands = value;
            Ok(())
        });
        fields.add_field_method_get("file", |_, this| Ok(this.state().file.to_string()));
        fields.add_field_method_get("line", |_, this| Ok(this.state().line));
        fields.add_field_method_get("parent", |_, this| Ok(this.state().parent.clone()));
    }
}

/// The frame currently executing, read back out of the global environment.
pub(crate) fn current(lua: &Lua) -> LuaResult<FrameHandle> {
    let ud: LuaAnyUserData = lua.globals().get("frame")?;
    let handle = ud.borrow::<FrameHandle>()?;
    Ok(handle.clone())
}
