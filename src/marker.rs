//! Rewrites the `=>` sigil into `= MARKER` so the token stream parses as
//! ordinary Python, with the marker call standing in for the late-bound default.

use std::borrow::Cow;
use std::iter::Peekable;

use crate::error::Position;
use crate::lexer::{Token, TokenKind};

/// Column adjustment applied to the rest of a row after a sigil.
#[derive(Debug, Clone, Copy)]
struct Shift {
    row: usize,
    delta: isize,
}

impl Shift {
    fn apply(self, pos: Position) -> Position {
        if pos.row != self.row {
            return pos;
        }
        let col = (pos.col as isize + self.delta).max(0) as usize;
        Position::new(pos.row, col)
    }
}

/// Iterator adapter that replaces each `=` `>` pair with `=` followed by a
/// synthetic marker name token.
pub struct MarkerInjector<'a, 'm, I: Iterator<Item = Token<'a>>> {
    tokens: Peekable<I>,
    marker: &'m str,
    pending: Option<Token<'a>>,
    shift: Option<Shift>,
    injected: usize,
}

impl<'a, 'm, I: Iterator<Item = Token<'a>>> MarkerInjector<'a, 'm, I> {
    pub fn new(tokens: I, marker: &'m str) -> Self {
        Self {
            tokens: tokens.peekable(),
            marker,
            pending: None,
            shift: None,
            injected: 0,
        }
    }

    /// Number of sigils rewritten so far.
    pub fn injected(&self) -> usize {
        self.injected
    }

    fn shifted(&mut self, mut token: Token<'a>) -> Token<'a> {
        let Some(shift) = self.shift else {
            return token;
        };
        if token.start.row != shift.row {
            self.shift = None;
            return token;
        }
        token.start = shift.apply(token.start);
        token.end = shift.apply(token.end);
        token
    }

    fn starts_sigil(&mut self, token: &Token<'a>) -> bool {
        token.is_op("=")
            && self
                .tokens
                .peek()
                .is_some_and(|next| next.is_op(">") && next.start == token.end)
    }
}

impl<'a, I: Iterator<Item = Token<'a>>> Iterator for MarkerInjector<'a, '_, I> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(marker) = self.pending.take() {
            return Some(marker);
        }

        let token = self.tokens.next()?;
        if !self.starts_sigil(&token) {
            return Some(self.shifted(token));
        }

        let eq = self.shifted(token);
        let gt = self.tokens.next()?;
        let row = gt.start.row;
        let offset = self.shift.map_or(0, |shift| shift.delta);

        // The marker sits one column past the `>` so a space separates it from `=`.
        let start_col = (gt.start.col as isize + offset) as usize + 1;
        let start = Position::new(row, start_col);
        let end = Position::new(row, start_col + self.marker.chars().count());
        self.pending = Some(Token::new(
            TokenKind::Name,
            Cow::Owned(self.marker.to_owned()),
            start,
            end,
        ));

        // The next token on this row abuts the marker; the rest of the row follows it.
        self.shift = match self.tokens.peek() {
            Some(next) if next.start.row == row => Some(Shift {
                row,
                delta: end.col as isize - next.start.col as isize,
            }),
            _ => None,
        };
        self.injected += 1;
        Some(eq)
    }
}

/// Rewrite every sigil in `tokens`, returning the new stream and the number
/// of markers injected.
pub fn inject_markers<'a>(tokens: Vec<Token<'a>>, marker: &str) -> (Vec<Token<'a>>, usize) {
    let mut injector = MarkerInjector::new(tokens.into_iter(), marker);
    let rewritten: Vec<Token<'a>> = injector.by_ref().collect();
    (rewritten, injector.injected())
}
