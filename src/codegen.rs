//! Renders a transformed [`Module`] back to source text.
//!
//! Original tokens keep their layout: gaps between tokens on one row become
//! spaces and row jumps inside a logical line become backslash continuations.
//! Synthesized text (the wrapper call, prologue lines and the runtime import)
//! is written without moving the layout cursor.

use crate::ast::*;
use crate::config::{PrologueStyle, TransformOptions};
use crate::error::Position;
use crate::lexer::{Token, TokenKind};

const INLINE_INDENT: &str = "    ";

pub struct Emitter<'o> {
    options: &'o TransformOptions,
    out: String,
    /// End of the last original token written on the current line.
    cursor: Option<Position>,
}

impl<'o> Emitter<'o> {
    pub fn new(options: &'o TransformOptions) -> Self {
        Self {
            options,
            out: String::new(),
            cursor: None,
        }
    }

    pub fn finish(self) -> String {
        self.out
    }

    pub fn module(&mut self, module: &Module<'_>) {
        self.statements(&module.body, "");
    }

    fn statements(&mut self, body: &[Stmt<'_>], indent: &str) {
        for stmt in body {
            self.statement(stmt, indent);
        }
    }

    fn statement(&mut self, stmt: &Stmt<'_>, indent: &str) {
        match stmt {
            Stmt::Trivia(tokens) => self.tokens(tokens),
            Stmt::Simple(line) => self.line(&line.tokens, indent),
            Stmt::Compound(compound) => {
                self.line(&compound.header.tokens, indent);
                self.block(&compound.body, indent);
            }
            Stmt::Function(function) => self.function(function, indent),
            Stmt::Prologue(prologue) => self.prologue(prologue, indent),
            Stmt::RuntimeImport => {
                let line = self.options.import_line();
                self.synthetic_line(indent, &line);
            }
        }
    }

    fn function(&mut self, function: &FunctionDef<'_>, indent: &str) {
        self.line(&function.head, indent);
        self.tokens(&function.parameters.leading);
        for item in &function.parameters.items {
            match item {
                ParamItem::Separator(separator) => {
                    self.token(&separator.token);
                    self.tokens(&separator.suffix);
                }
                ParamItem::Param(param) => self.parameter(param),
            }
        }
        self.tokens(&function.tail);
        match &function.body {
            Suite::Block(block) if block.indent.is_none() => match self.inline_line(block) {
                Some(line) => self.tokens(&line.tokens),
                None => {
                    self.out.push('\n');
                    self.cursor = None;
                    self.block(block, indent);
                }
            },
            Suite::Block(block) => self.block(block, indent),
            Suite::Inline(line) => self.tokens(&line.tokens),
        }
    }

    fn parameter(&mut self, param: &Parameter<'_>) {
        self.tokens(&param.prefix);
        self.token(&param.name);
        self.tokens(&param.annotation);
        if let Some(default) = &param.default {
            self.token(&default.eq);
            match &default.value {
                DefaultValue::Expression(tokens) => self.tokens(tokens),
                DefaultValue::Deferred(deferred) => self.deferred(deferred),
            }
        }
        self.tokens(&param.suffix);
    }

    /// `MARKER(args)` becomes `WRAPPER(lambda deps: args)`.
    fn deferred(&mut self, deferred: &DeferredComputation<'_>) {
        let call = &deferred.call;
        self.pad_to(call.name.start);
        self.out.push_str(&self.options.wrapper_name);
        self.out.push_str("(lambda");
        if !deferred.dependencies.is_empty() {
            self.out.push(' ');
            self.out.push_str(&deferred.dependencies.join(", "));
        }
        self.out.push(':');
        if !call.gap.first().is_some_and(|t| t.kind == TokenKind::Nl) {
            self.out.push(' ');
        }
        if !call.gap.is_empty() {
            self.cursor = Some(call.name.end);
            self.tokens(&call.gap);
            self.pad_to(call.open.start);
        }
        self.cursor = Some(call.open.end);

        let tuple = deferred.is_tuple();
        if tuple {
            self.out.push('(');
        }
        for arg in &call.args {
            self.tokens(&arg.value);
            match &arg.comma {
                Some(comma) if tuple => self.token(comma),
                // A lone argument's trailing comma is dropped.
                Some(comma) if self.cursor.is_some() => self.cursor = Some(comma.end),
                _ => {}
            }
        }
        self.tokens(&call.trailing);
        if tuple {
            self.out.push(')');
        }
        self.token(&call.close);
    }

    /// The original line of an expanded inline suite, when everything added
    /// to it renders as nothing and it can stay on the header line.
    fn inline_line<'b, 'a>(&self, block: &'b Block<'a>) -> Option<&'b Line<'a>> {
        let mut line = None;
        for stmt in &block.body {
            match stmt {
                Stmt::Prologue(prologue) if self.renders_empty(prologue) => {}
                Stmt::Simple(simple) if line.is_none() => line = Some(simple),
                _ => return None,
            }
        }
        line
    }

    fn renders_empty(&self, prologue: &Prologue) -> bool {
        self.options.prologue == PrologueStyle::Assignments && prologue.resolutions.is_empty()
    }

    fn prologue(&mut self, prologue: &Prologue, indent: &str) {
        match self.options.prologue {
            PrologueStyle::Evaluator => {
                let line = format!("{}(locals())", self.options.evaluator_name);
                self.synthetic_line(indent, &line);
            }
            PrologueStyle::Assignments => {
                for resolution in &prologue.resolutions {
                    let line = format!(
                        "if isinstance({name}, {wrapper}): {name} = {name}({args})",
                        name = resolution.name,
                        wrapper = self.options.wrapper_name,
                        args = resolution.dependencies.join(", "),
                    );
                    self.synthetic_line(indent, &line);
                }
            }
        }
    }

    fn block(&mut self, block: &Block<'_>, parent: &str) {
        self.tokens(&block.leading);
        let indent = match &block.indent {
            Some(token) => token.text.to_string(),
            None => format!("{parent}{INLINE_INDENT}"),
        };
        self.statements(&block.body, &indent);
        if block.indent.is_none() {
            self.ensure_line_start();
        }
    }

    /// Start a logical line at `indent`, then write its tokens.
    fn line(&mut self, tokens: &[Token<'_>], indent: &str) {
        let Some(first) = tokens.first() else {
            return;
        };
        self.ensure_line_start();
        self.out.push_str(indent);
        self.cursor = Some(first.start);
        self.tokens(tokens);
    }

    fn synthetic_line(&mut self, indent: &str, text: &str) {
        self.ensure_line_start();
        self.out.push_str(indent);
        self.out.push_str(text);
        self.out.push('\n');
        self.cursor = None;
    }

    fn ensure_line_start(&mut self) {
        if !self.out.is_empty() && !self.out.ends_with('\n') {
            self.out.push('\n');
            self.cursor = None;
        }
    }

    fn tokens(&mut self, tokens: &[Token<'_>]) {
        for token in tokens {
            self.token(token);
        }
    }

    fn token(&mut self, token: &Token<'_>) {
        match token.kind {
            TokenKind::Indent | TokenKind::Dedent | TokenKind::EndMarker => {}
            TokenKind::Newline | TokenKind::Nl => {
                self.pad_to(token.start);
                self.out.push_str(&token.text);
                self.cursor = None;
            }
            _ => {
                self.pad_to(token.start);
                self.out.push_str(&token.text);
                self.cursor = Some(token.end);
            }
        }
    }

    fn pad_to(&mut self, start: Position) {
        let spaces = match self.cursor {
            None => start.col,
            Some(prev) if start.row > prev.row => {
                self.out.push_str(&"\\\n".repeat(start.row - prev.row));
                start.col
            }
            Some(prev) => start.col.saturating_sub(prev.col),
        };
        self.out.extend(std::iter::repeat_n(' ', spaces));
    }
}

/// Render `module` as source text.
pub fn emit(module: &Module<'_>, options: &TransformOptions) -> String {
    let mut emitter = Emitter::new(options);
    emitter.module(module);
    emitter.finish()
}
