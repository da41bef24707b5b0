use crate::error::Position;
use crate::lexer::{Token, TokenKind};

/// A parsed source unit. Every source token is kept so the tree can be
/// emitted again with its original layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Module<'a> {
    pub body: Vec<Stmt<'a>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt<'a> {
    /// Comment and blank lines between statements.
    Trivia(Vec<Token<'a>>),
    /// One logical line of simple statements, ending with its `Newline` token.
    Simple(Line<'a>),
    /// A compound statement header (`if x:`, `class C:`) and its block.
    Compound(Compound<'a>),
    Function(FunctionDef<'a>),
    /// Synthesized: resolves the function's deferred parameters.
    Prologue(Prologue),
    /// Synthesized: makes the runtime support names resolvable.
    RuntimeImport,
}

impl Stmt<'_> {
    pub fn is_trivia(&self) -> bool {
        matches!(self, Stmt::Trivia(_))
    }

    /// A standalone string literal expression.
    pub fn is_docstring(&self) -> bool {
        match self {
            Stmt::Simple(line) => line.is_docstring(),
            _ => false,
        }
    }

    /// `from __future__ import ...`
    pub fn is_future_import(&self) -> bool {
        match self {
            Stmt::Simple(line) => {
                let mut significant = line.significant();
                significant.next().is_some_and(|t| t.is_name("from"))
                    && significant.next().is_some_and(|t| t.is_name("__future__"))
                    && significant.next().is_some_and(|t| t.is_name("import"))
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Line<'a> {
    pub tokens: Vec<Token<'a>>,
}

impl<'a> Line<'a> {
    /// Tokens other than comments and line breaks.
    pub fn significant(&self) -> impl Iterator<Item = &Token<'a>> {
        self.tokens.iter().filter(|t| {
            !matches!(
                t.kind,
                TokenKind::Comment
                    | TokenKind::Nl
                    | TokenKind::Newline
                    | TokenKind::Indent
                    | TokenKind::Dedent
                    | TokenKind::EndMarker
            )
        })
    }

    pub fn is_docstring(&self) -> bool {
        let significant: Vec<&Token<'a>> = self.significant().collect();
        let mut inner = significant.as_slice();
        while let [first, rest @ .., last] = inner {
            if first.is_op("(") && last.is_op(")") {
                inner = rest;
            } else {
                break;
            }
        }
        !inner.is_empty() && inner.iter().all(|t| is_text_literal(t))
    }
}

/// A string literal that evaluates to `str` (not bytes, not an f-string).
fn is_text_literal(token: &Token<'_>) -> bool {
    if token.kind != TokenKind::String {
        return false;
    }
    let prefix: String = token
        .text
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_lowercase();
    !prefix.contains('b') && !prefix.contains('f')
}

#[derive(Debug, Clone, PartialEq)]
pub struct Compound<'a> {
    pub header: Line<'a>,
    pub body: Block<'a>,
}

/// An indented suite of statements.
#[derive(Debug, Clone, PartialEq)]
pub struct Block<'a> {
    /// Comment and blank lines between the header and the first indented line.
    pub leading: Vec<Token<'a>>,
    /// `None` for a block synthesized from an inline suite; it is indented one
    /// level deeper than its parent.
    pub indent: Option<Token<'a>>,
    pub body: Vec<Stmt<'a>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Suite<'a> {
    /// Statements on the same line as the header: `def f(): return 1`.
    Inline(Line<'a>),
    Block(Block<'a>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef<'a> {
    pub name: String,
    pub is_async: bool,
    /// `async`, `def`, the name, any type parameters and the opening `(`.
    pub head: Vec<Token<'a>>,
    pub parameters: Parameters<'a>,
    /// The closing `)`, return annotation and `:`; for a block suite also the
    /// rest of the header line.
    pub tail: Vec<Token<'a>>,
    pub body: Suite<'a>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    PositionalOnly,
    PositionalOrKeyword,
    VarPositional,
    KeywordOnly,
    VarKeyword,
}

impl ParamKind {
    pub fn is_positional(self) -> bool {
        matches!(self, ParamKind::PositionalOnly | ParamKind::PositionalOrKeyword)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Parameters<'a> {
    /// Trivia after the opening parenthesis.
    pub leading: Vec<Token<'a>>,
    pub items: Vec<ParamItem<'a>>,
}

impl<'a> Parameters<'a> {
    pub fn params(&self) -> impl Iterator<Item = &Parameter<'a>> {
        self.items.iter().filter_map(|item| match item {
            ParamItem::Param(param) => Some(param),
            ParamItem::Separator(_) => None,
        })
    }

    pub fn params_mut(&mut self) -> impl Iterator<Item = &mut Parameter<'a>> {
        self.items.iter_mut().filter_map(|item| match item {
            ParamItem::Param(param) => Some(param),
            ParamItem::Separator(_) => None,
        })
    }

    /// Names of the given kinds, in declaration order.
    pub fn names(&self, kinds: &[ParamKind]) -> Vec<String> {
        self.params()
            .filter(|p| kinds.contains(&p.kind))
            .map(|p| p.name.text.to_string())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamItem<'a> {
    Param(Parameter<'a>),
    Separator(Separator<'a>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeparatorKind {
    /// `/`
    PositionalOnly,
    /// bare `*`
    KeywordOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Separator<'a> {
    pub kind: SeparatorKind,
    pub token: Token<'a>,
    pub suffix: Vec<Token<'a>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter<'a> {
    pub kind: ParamKind,
    /// `*` or `**` for variadic parameters.
    pub prefix: Vec<Token<'a>>,
    pub name: Token<'a>,
    /// `:` and the annotation expression, kept verbatim.
    pub annotation: Vec<Token<'a>>,
    pub default: Option<ParamDefault<'a>>,
    /// Separating comma and any trivia around it.
    pub suffix: Vec<Token<'a>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDefault<'a> {
    pub eq: Token<'a>,
    pub value: DefaultValue<'a>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue<'a> {
    /// An ordinary default, evaluated once at definition time.
    Expression(Vec<Token<'a>>),
    Deferred(DeferredComputation<'a>),
}

/// A `MARKER(args...)` call occupying a default slot.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerCall<'a> {
    pub name: Token<'a>,
    /// Comments and line breaks between the name and `(`.
    pub gap: Vec<Token<'a>>,
    pub open: Token<'a>,
    pub args: Vec<Argument<'a>>,
    /// Trivia after the last argument.
    pub trailing: Vec<Token<'a>>,
    pub close: Token<'a>,
}

impl<'a> MarkerCall<'a> {
    /// Recognize `tokens` as a call to `marker` spanning the whole expression.
    /// The tokens are handed back unchanged when they are anything else.
    pub fn from_tokens(tokens: Vec<Token<'a>>, marker: &str) -> Result<Self, Vec<Token<'a>>> {
        let Some(open) = marker_open(&tokens, marker) else {
            return Err(tokens);
        };

        let mut tokens = tokens.into_iter();
        let (Some(name), Some(close)) = (tokens.next(), tokens.next_back()) else {
            return Err(Vec::new());
        };
        let gap: Vec<Token<'a>> = tokens.by_ref().take(open - 1).collect();
        let Some(open) = tokens.next() else {
            return Err(Vec::new());
        };

        let mut args = Vec::new();
        let mut current = Vec::new();
        let mut items = ItemSplitter::default();
        for token in tokens {
            if items.is_separator(&token) {
                args.push(Argument {
                    value: std::mem::take(&mut current),
                    comma: Some(token),
                });
                continue;
            }
            current.push(token);
        }
        let trailing = if current.iter().all(Token::is_trivia) {
            current
        } else {
            args.push(Argument {
                value: current,
                comma: None,
            });
            Vec::new()
        };

        Ok(Self {
            name,
            gap,
            open,
            args,
            trailing,
            close,
        })
    }

    pub fn position(&self) -> Position {
        self.name.start
    }
}

/// `tokens` is exactly one call to `marker`.
pub fn is_marker_call(tokens: &[Token<'_>], marker: &str) -> bool {
    marker_open(tokens, marker).is_some()
}

/// Index of the call's `(` when `tokens` is exactly one call to `marker`.
/// Comments and line breaks may separate the name from the parenthesis.
fn marker_open(tokens: &[Token<'_>], marker: &str) -> Option<usize> {
    if !tokens.first()?.is_name(marker) {
        return None;
    }
    let open = tokens.iter().skip(1).position(|t| !t.is_trivia())? + 1;
    (tokens[open].is_op("(") && matching_close(tokens, open) == Some(tokens.len() - 1)).then_some(open)
}

/// Finds the commas that separate the items of a parameter or argument list.
///
/// Commas inside brackets belong to a nested expression, and commas between
/// `lambda` and its `:` belong to the lambda's own parameters.
#[derive(Debug, Default)]
pub struct ItemSplitter {
    depth: usize,
    lambdas: usize,
}

impl ItemSplitter {
    /// Feed the next token; true when it separates two items.
    pub fn is_separator(&mut self, token: &Token<'_>) -> bool {
        if token.opens_bracket() {
            self.depth += 1;
        } else if token.closes_bracket() {
            self.depth = self.depth.saturating_sub(1);
        } else if self.depth == 0 {
            if token.is_name("lambda") {
                self.lambdas += 1;
            } else if self.lambdas > 0 && token.is_op(":") {
                self.lambdas -= 1;
            } else if token.is_op(",") {
                return self.lambdas == 0;
            }
        }
        false
    }
}

/// Index of the bracket closing the one at `open`.
fn matching_close(tokens: &[Token<'_>], open: usize) -> Option<usize> {
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

#[derive(Debug, Clone, PartialEq)]
pub struct Argument<'a> {
    pub value: Vec<Token<'a>>,
    pub comma: Option<Token<'a>>,
}

/// A late-bound default: the names it may read and the expression computing it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredComputation<'a> {
    pub dependencies: Vec<String>,
    pub call: MarkerCall<'a>,
}

impl DeferredComputation<'_> {
    /// Several marker arguments evaluate to a tuple.
    pub fn is_tuple(&self) -> bool {
        self.call.args.len() > 1
    }
}

/// Resolution of one deferred parameter, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub name: String,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Prologue {
    pub resolutions: Vec<Resolution>,
}

impl<'a> Module<'a> {
    /// Default slots still holding an untransformed call to `marker`.
    pub fn marker_count(&self, marker: &str) -> usize {
        count_markers(&self.body, marker)
    }

    pub fn into_owned(self) -> Module<'static> {
        Module {
            body: self.body.into_iter().map(Stmt::into_owned).collect(),
        }
    }
}

fn count_markers(body: &[Stmt<'_>], marker: &str) -> usize {
    body.iter()
        .map(|stmt| match stmt {
            Stmt::Function(function) => {
                let own = function
                    .parameters
                    .params()
                    .filter(|p| match &p.default {
                        Some(ParamDefault {
                            value: DefaultValue::Expression(tokens),
                            ..
                        }) => is_marker_call(tokens, marker),
                        _ => false,
                    })
                    .count();
                let nested = match &function.body {
                    Suite::Block(block) => count_markers(&block.body, marker),
                    Suite::Inline(_) => 0,
                };
                own + nested
            }
            Stmt::Compound(compound) => count_markers(&compound.body.body, marker),
            _ => 0,
        })
        .sum()
}

fn owned_tokens(tokens: Vec<Token<'_>>) -> Vec<Token<'static>> {
    tokens.into_iter().map(Token::into_owned).collect()
}

impl Stmt<'_> {
    pub fn into_owned(self) -> Stmt<'static> {
        match self {
            Stmt::Trivia(tokens) => Stmt::Trivia(owned_tokens(tokens)),
            Stmt::Simple(line) => Stmt::Simple(line.into_owned()),
            Stmt::Compound(compound) => Stmt::Compound(Compound {
                header: compound.header.into_owned(),
                body: compound.body.into_owned(),
            }),
            Stmt::Function(function) => Stmt::Function(function.into_owned()),
            Stmt::Prologue(prologue) => Stmt::Prologue(prologue),
            Stmt::RuntimeImport => Stmt::RuntimeImport,
        }
    }
}

impl Line<'_> {
    pub fn into_owned(self) -> Line<'static> {
        Line {
            tokens: owned_tokens(self.tokens),
        }
    }
}

impl Block<'_> {
    pub fn into_owned(self) -> Block<'static> {
        Block {
            leading: owned_tokens(self.leading),
            indent: self.indent.map(Token::into_owned),
            body: self.body.into_iter().map(Stmt::into_owned).collect(),
        }
    }
}

impl FunctionDef<'_> {
    pub fn into_owned(self) -> FunctionDef<'static> {
        FunctionDef {
            name: self.name,
            is_async: self.is_async,
            head: owned_tokens(self.head),
            parameters: Parameters {
                leading: owned_tokens(self.parameters.leading),
                items: self
                    .parameters
                    .items
                    .into_iter()
                    .map(ParamItem::into_owned)
                    .collect(),
            },
            tail: owned_tokens(self.tail),
            body: match self.body {
                Suite::Inline(line) => Suite::Inline(line.into_owned()),
                Suite::Block(block) => Suite::Block(block.into_owned()),
            },
        }
    }
}

impl ParamItem<'_> {
    pub fn into_owned(self) -> ParamItem<'static> {
        match self {
            ParamItem::Separator(sep) => ParamItem::Separator(Separator {
                kind: sep.kind,
                token: sep.token.into_owned(),
                suffix: owned_tokens(sep.suffix),
            }),
            ParamItem::Param(param) => ParamItem::Param(Parameter {
                kind: param.kind,
                prefix: owned_tokens(param.prefix),
                name: param.name.into_owned(),
                annotation: owned_tokens(param.annotation),
                default: param.default.map(|default| ParamDefault {
                    eq: default.eq.into_owned(),
                    value: match default.value {
                        DefaultValue::Expression(tokens) => DefaultValue::Expression(owned_tokens(tokens)),
                        DefaultValue::Deferred(deferred) => DefaultValue::Deferred(DeferredComputation {
                            dependencies: deferred.dependencies,
                            call: MarkerCall {
                                name: deferred.call.name.into_owned(),
                                gap: owned_tokens(deferred.call.gap),
                                open: deferred.call.open.into_owned(),
                                args: deferred
                                    .call
                                    .args
                                    .into_iter()
                                    .map(|arg| Argument {
                                        value: owned_tokens(arg.value),
                                        comma: arg.comma.map(Token::into_owned),
                                    })
                                    .collect(),
                                trailing: owned_tokens(deferred.call.trailing),
                                close: deferred.call.close.into_owned(),
                            },
                        }),
                    },
                }),
                suffix: owned_tokens(param.suffix),
            }),
        }
    }
}
