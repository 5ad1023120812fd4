mod lexer;
mod location;
mod tree;

use std::ops::Range;

use ariadne::{Color, Fmt, Label, Report, ReportKind};

use crate::location::Lines;
pub use crate::{
    location::Location,
    tree::{Frame, Node},
};

#[derive(Debug)]
pub enum Error {
    /// A `]]]` with no open frame to close.
    StrayClose(Location),
    /// A frame still open at the end of input; the location is its `[[[`.
    Unclosed(Location),
    /// The lexer rejected the input.
    Lex { message: String, location: Location },
}

impl Error {
    pub fn location(&self) -> Location {
        match self {
            Error::StrayClose(location) | Error::Unclosed(location) => *location,
            Error::Lex { location, .. } => *location,
        }
    }

    /// A one-line description, for places that cannot render a full report.
    pub fn message(&self) -> String {
        match self {
            Error::StrayClose(_) => "Closing delimiter (]]]) found at top level".to_owned(),
            Error::Unclosed(_) => "Frame was never closed".to_owned(),
            Error::Lex { message, .. } => message.clone(),
        }
    }

    pub fn into_report<'a>(self, filename: &'a str) -> Report<(&'a str, Range<usize>)> {
        let location = self.location();
        let label = match &self {
            Error::StrayClose(_) => format!(
                "This {} has no matching {}",
                "]]]".fg(Color::Red),
                "[[[".fg(Color::Red)
            ),
            Error::Unclosed(_) => "The frame opened here has no closing ]]]".to_owned(),
            Error::Lex { .. } => "Cannot lex this input".to_owned(),
        };
        Report::build(ReportKind::Error, filename, location.start)
            .with_message(self.message())
            .with_label(
                Label::new((filename, location.range()))
                    .with_message(label)
                    .with_color(Color::Red),
            )
            .finish()
    }
}

/// Parse a document into its frame tree.
pub fn parse(source: &str) -> Result<Frame, Vec<Error>> {
    let lines = Lines::new(source);
    let tokens = chumsky::Parser::parse(&lexer::lexer(), source).map_err(|errors| {
        errors
            .into_iter()
            .map(|err| Error::Lex {
                message: err.to_string(),
                location: lines.locate(err.span()),
            })
            .collect::<Vec<_>>()
    })?;
    tree::build(tokens, &lines).map_err(|err| vec![err])
}
