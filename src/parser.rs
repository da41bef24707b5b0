use std::iter::Peekable;
use std::vec::IntoIter;

use crate::ast::*;
use crate::error::{Error, Position, Result};
use crate::lexer::{Token, TokenKind};

/// Builds a [`Module`] from a token stream.
///
/// Only the structure needed for late binding is parsed: statement nesting,
/// function headers and parameter lists. Everything else stays as tokens.
pub struct Parser<'a> {
    tokens: Peekable<IntoIter<Token<'a>>>,
    last: Position,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: Vec<Token<'a>>) -> Self {
        Self {
            tokens: tokens.into_iter().peekable(),
            last: Position::new(1, 0),
        }
    }

    /// Parse a whole token stream into a module.
    pub fn parse_module(tokens: Vec<Token<'a>>) -> Result<Module<'a>> {
        let mut parser = Parser::new(tokens);
        let body = parser.statements(false)?;
        Ok(Module { body })
    }

    fn peek_kind(&mut self) -> Option<TokenKind> {
        self.tokens.peek().map(|t| t.kind)
    }

    fn bump(&mut self) -> Option<Token<'a>> {
        let token = self.tokens.next()?;
        self.last = token.start;
        Some(token)
    }

    fn statements(&mut self, in_block: bool) -> Result<Vec<Stmt<'a>>> {
        let mut body = Vec::new();
        loop {
            let Some(kind) = self.peek_kind() else {
                if in_block {
                    return Err(Error::parse("unexpected end of input in block", self.last));
                }
                break;
            };
            match kind {
                TokenKind::Comment | TokenKind::Nl => body.push(Stmt::Trivia(self.trivia())),
                TokenKind::Dedent if in_block => {
                    self.bump();
                    break;
                }
                TokenKind::EndMarker if !in_block => {
                    self.bump();
                    break;
                }
                TokenKind::Indent => {
                    let position = self.tokens.peek().map_or(self.last, |t| t.start);
                    return Err(Error::parse("unexpected indent", position));
                }
                TokenKind::Dedent | TokenKind::EndMarker => {
                    let position = self.tokens.peek().map_or(self.last, |t| t.start);
                    return Err(Error::parse("unexpected end of block", position));
                }
                _ => body.push(self.statement()?),
            }
        }
        Ok(body)
    }

    fn trivia(&mut self) -> Vec<Token<'a>> {
        let mut tokens = Vec::new();
        while self.tokens.peek().is_some_and(Token::is_trivia) {
            tokens.extend(self.bump());
        }
        tokens
    }

    /// Tokens up to and including the `Newline` ending the logical line.
    fn logical_line(&mut self) -> Result<Vec<Token<'a>>> {
        let mut tokens = Vec::new();
        loop {
            let Some(token) = self.bump() else {
                return Err(Error::parse("unexpected end of input", self.last));
            };
            match token.kind {
                TokenKind::Newline => {
                    tokens.push(token);
                    return Ok(tokens);
                }
                TokenKind::Indent | TokenKind::Dedent | TokenKind::EndMarker => {
                    return Err(Error::parse("unexpected end of line", token.start));
                }
                _ => tokens.push(token),
            }
        }
    }

    fn statement(&mut self) -> Result<Stmt<'a>> {
        let tokens = self.logical_line()?;
        if starts_function(&tokens) {
            return self.function(tokens).map(Stmt::Function);
        }
        if ends_with_colon(&tokens) {
            let body = self.block()?;
            return Ok(Stmt::Compound(Compound {
                header: Line { tokens },
                body,
            }));
        }
        Ok(Stmt::Simple(Line { tokens }))
    }

    fn block(&mut self) -> Result<Block<'a>> {
        let leading = self.trivia();
        match self.bump() {
            Some(indent) if indent.kind == TokenKind::Indent => {
                let body = self.statements(true)?;
                Ok(Block {
                    leading,
                    indent: Some(indent),
                    body,
                })
            }
            Some(token) => Err(Error::parse("expected an indented block", token.start)),
            None => Err(Error::parse("expected an indented block", self.last)),
        }
    }

    fn function(&mut self, tokens: Vec<Token<'a>>) -> Result<FunctionDef<'a>> {
        let start = tokens[0].start;
        let is_async = tokens[0].is_name("async");
        let name_index = if is_async { 2 } else { 1 };
        let name = match tokens.get(name_index) {
            Some(token) if token.kind == TokenKind::Name => token.text.to_string(),
            _ => return Err(Error::parse("expected a function name", start)),
        };

        // Type parameters (`def f[T](...)`) sit between the name and `(`.
        let mut open = name_index + 1;
        if tokens.get(open).is_some_and(|t| t.is_op("[")) {
            open = closing_index(&tokens, open)
                .ok_or_else(|| Error::parse("unclosed type parameter list", start))?
                + 1;
        }
        if !tokens.get(open).is_some_and(|t| t.is_op("(")) {
            return Err(Error::parse("expected `(` after function name", start));
        }
        let close = closing_index(&tokens, open)
            .ok_or_else(|| Error::parse("unclosed parameter list", start))?;
        let colon = tokens
            .iter()
            .enumerate()
            .skip(close)
            .scan(0usize, |depth, (index, token)| {
                if token.opens_bracket() {
                    *depth += 1;
                } else if token.closes_bracket() {
                    *depth = depth.saturating_sub(1);
                }
                Some((index, *depth, token))
            })
            .find(|(_, depth, token)| *depth == 0 && token.is_op(":"))
            .map(|(index, _, _)| index)
            .ok_or_else(|| Error::parse("expected `:` after function signature", start))?;

        let mut tokens = tokens;
        let mut rest = tokens.split_off(colon + 1);
        let tail = tokens.split_off(close);
        let inner = tokens.split_off(open + 1);
        let head = tokens;
        let parameters = parse_parameters(inner, start)?;

        let inline = rest
            .iter()
            .any(|t| !t.is_trivia() && t.kind != TokenKind::Newline);
        let (tail, body) = if inline {
            (tail, Suite::Inline(Line { tokens: rest }))
        } else {
            let mut tail = tail;
            tail.append(&mut rest);
            (tail, Suite::Block(self.block()?))
        };

        Ok(FunctionDef {
            name,
            is_async,
            head,
            parameters,
            tail,
            body,
        })
    }
}

fn starts_function(tokens: &[Token<'_>]) -> bool {
    match tokens {
        [first, ..] if first.is_name("def") => true,
        [first, second, ..] => first.is_name("async") && second.is_name("def"),
        _ => false,
    }
}

/// The last significant token of the line is `:`, so an indented block follows.
fn ends_with_colon(tokens: &[Token<'_>]) -> bool {
    tokens
        .iter()
        .rev()
        .find(|t| !t.is_trivia() && t.kind != TokenKind::Newline)
        .is_some_and(|t| t.is_op(":"))
}

fn closing_index(tokens: &[Token<'_>], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (index, token) in tokens.iter().enumerate().skip(open) {
        if token.opens_bracket() {
            depth += 1;
        } else if token.closes_bracket() {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(index);
            }
        }
    }
    None
}

/// One comma-separated entry of a parameter list.
struct RawItem<'a> {
    tokens: Vec<Token<'a>>,
    suffix: Vec<Token<'a>>,
}

fn split_items<'a>(inner: Vec<Token<'a>>) -> (Vec<Token<'a>>, Vec<RawItem<'a>>) {
    let mut inner = inner.into_iter().peekable();
    let mut leading = Vec::new();
    while inner.peek().is_some_and(Token::is_trivia) {
        leading.extend(inner.next());
    }

    let mut items = Vec::new();
    let mut current = Vec::new();
    let mut splitter = ItemSplitter::default();
    while let Some(token) = inner.next() {
        if splitter.is_separator(&token) {
            let mut suffix = trailing_trivia(&mut current);
            suffix.push(token);
            while inner.peek().is_some_and(Token::is_trivia) {
                suffix.extend(inner.next());
            }
            items.push(RawItem {
                tokens: std::mem::take(&mut current),
                suffix,
            });
            continue;
        }
        current.push(token);
    }
    if !current.is_empty() {
        let suffix = trailing_trivia(&mut current);
        items.push(RawItem {
            tokens: current,
            suffix,
        });
    }
    (leading, items)
}

/// Split trailing comments and line breaks off `tokens`.
fn trailing_trivia<'a>(tokens: &mut Vec<Token<'a>>) -> Vec<Token<'a>> {
    let keep = tokens
        .iter()
        .rposition(|t| !t.is_trivia())
        .map_or(0, |index| index + 1);
    tokens.split_off(keep)
}

fn parse_parameters<'a>(inner: Vec<Token<'a>>, function: Position) -> Result<Parameters<'a>> {
    let (leading, raw_items) = split_items(inner);
    let mut items = Vec::with_capacity(raw_items.len());
    let mut kind = ParamKind::PositionalOrKeyword;
    let mut seen_default = false;

    for raw in raw_items {
        let RawItem { tokens, suffix } = raw;
        let Some(first) = tokens.first() else {
            let position = suffix.first().map_or(function, |t| t.start);
            return Err(Error::parse("empty parameter", position));
        };
        let position = first.start;

        if tokens.len() == 1 && first.is_op("/") {
            if kind != ParamKind::PositionalOrKeyword {
                return Err(Error::parse("`/` must precede `*` and keyword-only parameters", position));
            }
            for item in &mut items {
                if let ParamItem::Param(param) = item {
                    param.kind = ParamKind::PositionalOnly;
                }
            }
            items.push(ParamItem::Separator(Separator {
                kind: SeparatorKind::PositionalOnly,
                token: tokens.into_iter().next().ok_or_else(|| Error::parse("empty parameter", position))?,
                suffix,
            }));
            continue;
        }
        if tokens.len() == 1 && first.is_op("*") {
            kind = ParamKind::KeywordOnly;
            items.push(ParamItem::Separator(Separator {
                kind: SeparatorKind::KeywordOnly,
                token: tokens.into_iter().next().ok_or_else(|| Error::parse("empty parameter", position))?,
                suffix,
            }));
            continue;
        }

        let mut tokens = tokens.into_iter().peekable();
        let mut prefix = Vec::new();
        let own_kind = match tokens.peek() {
            Some(t) if t.is_op("*") => {
                prefix.extend(tokens.next());
                kind = ParamKind::KeywordOnly;
                ParamKind::VarPositional
            }
            Some(t) if t.is_op("**") => {
                prefix.extend(tokens.next());
                ParamKind::VarKeyword
            }
            _ => kind,
        };
        let name = match tokens.next() {
            Some(token) if token.kind == TokenKind::Name => token,
            _ => return Err(Error::parse("expected a parameter name", position)),
        };

        let mut annotation = Vec::new();
        let mut eq = None;
        let mut depth = 0usize;
        for token in tokens.by_ref() {
            if depth == 0 && token.is_op("=") {
                eq = Some(token);
                break;
            }
            if token.opens_bracket() {
                depth += 1;
            } else if token.closes_bracket() {
                depth = depth.saturating_sub(1);
            }
            annotation.push(token);
        }
        if annotation.first().is_some_and(|t| !t.is_op(":")) {
            return Err(Error::parse("expected `:`, `=` or `,` after parameter name", name.start));
        }

        let default = match eq {
            Some(eq) => {
                let value: Vec<Token<'a>> = tokens.collect();
                if value.iter().all(Token::is_trivia) {
                    return Err(Error::parse("expected a default value", eq.start));
                }
                if !matches!(own_kind, ParamKind::PositionalOnly | ParamKind::PositionalOrKeyword | ParamKind::KeywordOnly) {
                    return Err(Error::parse("variadic parameters cannot have a default", eq.start));
                }
                Some(ParamDefault {
                    eq,
                    value: DefaultValue::Expression(value),
                })
            }
            None => None,
        };

        if own_kind.is_positional() {
            if default.is_some() {
                seen_default = true;
            } else if seen_default {
                return Err(Error::parse(
                    "parameter without a default follows parameter with a default",
                    name.start,
                ));
            }
        }

        items.push(ParamItem::Param(Parameter {
            kind: own_kind,
            prefix,
            name,
            annotation,
            default,
            suffix,
        }));
    }

    Ok(Parameters { leading, items })
}
