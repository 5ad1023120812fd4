use std::ops::Range;

use chumsky::prelude::*;

/// Open and close delimiters are the only structure the lexer knows about;
/// everything between them is literal text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Tok {
    Open,
    Close,
    Text(String),
}

/// A token with its span in character offsets, chumsky's native unit when
/// streaming from `&str`.
pub(crate) type SpannedTok = (Tok, Range<usize>);

pub(crate) fn lexer() -> impl Parser<char, Vec<SpannedTok>, Error = Simple<char>> {
    let open = just("[[[").to(Tok::Open);
    let close = just("]]]").to(Tok::Close);

    // A run of characters that cannot start a delimiter.
    let text = filter(|c: &char| *c != '[' && *c != ']')
        .repeated()
        .at_least(1)
        .collect()
        .map(Tok::Text);

    // A bracket that does not form a delimiter is literal text too.
    let stray = one_of("[]").map(|c: char| Tok::Text(c.to_string()));

    choice((open, close, text, stray))
        .map_with_span(|tok, span| (tok, span))
        .repeated()
        .then_ignore(end())
}
