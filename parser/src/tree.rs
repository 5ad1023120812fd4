use crate::lexer::{SpannedTok, Tok};
use crate::location::{Lines, Location};
use crate::Error;

/// A child of a frame: literal text, a nested frame, or an include directive
/// to be inlined by whoever drives the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Text(String),
    Frame(Frame),
    Include { name: String, location: Location },
}

/// A `[[[ ... ]]]` region of the document. The root frame spans the whole
/// document and has no delimiters of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub children: Vec<Node>,
    /// The opening delimiter; its line anchors script error messages.
    pub start: Location,
}

impl Frame {
    fn new(start: Location) -> Self {
        Self {
            children: Vec::new(),
            start,
        }
    }

    /// Render the tree for inspection, two spaces of indent per level.
    pub fn as_indented_string(&self) -> String {
        let mut out = String::new();
        self.dump(0, &mut out);
        out
    }

    fn dump(&self, depth: usize, out: &mut String) {
        let pad = "  ".repeat(depth);
        out.push_str(&format!("{pad}[[[ line {}\n", self.start.line));
        for child in &self.children {
            match child {
                Node::Text(text) => out.push_str(&format!("{pad}  . {text:?}\n")),
                Node::Frame(frame) => frame.dump(depth + 1, out),
                Node::Include { name, location } => {
                    out.push_str(&format!("{pad}  include {name} (line {})\n", location.line))
                }
            }
        }
        out.push_str(&format!("{pad}]]]\n"));
    }
}

/// An `include <name>` directive is a frame whose whole body is that one
/// line of text.
fn include_directive(frame: &Frame) -> Option<String> {
    let [Node::Text(text)] = frame.children.as_slice() else {
        return None;
    };
    let rest = text.trim().strip_prefix("include")?;
    if !rest.starts_with([' ', '\t']) {
        return None;
    }
    let name = rest.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some(name.to_owned())
}

pub(crate) fn build(tokens: Vec<SpannedTok>, lines: &Lines) -> Result<Frame, Error> {
    let mut stack: Vec<Frame> = Vec::new();
    let mut current = Frame::new(lines.locate(0..0));

    for (tok, span) in tokens {
        match tok {
            Tok::Text(text) => match current.children.last_mut() {
                Some(Node::Text(prev)) => prev.push_str(&text),
                _ => current.children.push(Node::Text(text)),
            },
            Tok::Open => {
                stack.push(current);
                current = Frame::new(lines.locate(span));
            }
            Tok::Close => {
                let mut parent = stack
                    .pop()
                    .ok_or_else(|| Error::StrayClose(lines.locate(span)))?;
                match include_directive(&current) {
                    Some(name) => parent.children.push(Node::Include {
                        name,
                        location: current.start,
                    }),
                    None => parent.children.push(Node::Frame(current)),
                }
                current = parent;
            }
        }
    }

    if !stack.is_empty() {
        return Err(Error::Unclosed(current.start));
    }
    Ok(current)
}
