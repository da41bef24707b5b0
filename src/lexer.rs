use std::borrow::Cow;

use pest::{Parser, iterators::Pair};
use pest_derive::Parser;

use crate::error::{Error, Position, Result};

#[derive(Parser)]
#[grammar = "src/python.pest"]
pub struct PythonLexer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Name,
    Number,
    String,
    /// Operator or delimiter.
    Op,
    Comment,
    /// End of a logical line.
    Newline,
    /// Line break that does not end a logical line (blank line, comment line,
    /// or a break inside brackets).
    Nl,
    Indent,
    Dedent,
    EndMarker,
    ErrorToken,
}

/// A lexical unit with its text and source span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: Cow<'a, str>,
    pub start: Position,
    pub end: Position,
}

impl<'a> Token<'a> {
    pub fn new(kind: TokenKind, text: impl Into<Cow<'a, str>>, start: Position, end: Position) -> Self {
        Self {
            kind,
            text: text.into(),
            start,
            end,
        }
    }

    pub fn is_op(&self, op: &str) -> bool {
        self.kind == TokenKind::Op && self.text == op
    }

    pub fn is_name(&self, name: &str) -> bool {
        self.kind == TokenKind::Name && self.text == name
    }

    /// Comments and non-logical line breaks carry no syntax.
    pub fn is_trivia(&self) -> bool {
        matches!(self.kind, TokenKind::Comment | TokenKind::Nl)
    }

    pub fn opens_bracket(&self) -> bool {
        self.kind == TokenKind::Op && matches!(self.text.as_ref(), "(" | "[" | "{")
    }

    pub fn closes_bracket(&self) -> bool {
        self.kind == TokenKind::Op && matches!(self.text.as_ref(), ")" | "]" | "}")
    }

    pub fn into_owned(self) -> Token<'static> {
        Token {
            kind: self.kind,
            text: Cow::Owned(self.text.into_owned()),
            start: self.start,
            end: self.end,
        }
    }
}

/// Split source text into tokens, including layout tokens.
pub fn tokenize(source: &str) -> Result<Vec<Token<'_>>> {
    let mut pairs = PythonLexer::parse(Rule::stream, source).map_err(Box::new)?;
    let mut layout = Layout::default();
    if let Some(stream) = pairs.next() {
        for pair in stream.into_inner() {
            layout.push(pair)?;
        }
    }
    layout.finish()
}

/// Tracks the state needed to turn raw lexemes into positioned tokens.
struct Layout<'a> {
    tokens: Vec<Token<'a>>,
    row: usize,
    col: usize,
    depth: usize,
    indents: Vec<usize>,
    at_line_start: bool,
    line_has_code: bool,
    indent_text: &'a str,
    indent_width: usize,
}

impl Default for Layout<'_> {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            row: 1,
            col: 0,
            depth: 0,
            indents: vec![0],
            at_line_start: true,
            line_has_code: false,
            indent_text: "",
            indent_width: 0,
        }
    }
}

impl<'a> Layout<'a> {
    fn position(&self) -> Position {
        Position::new(self.row, self.col)
    }

    fn push(&mut self, pair: Pair<'a, Rule>) -> Result<()> {
        let text = pair.as_str();
        match pair.as_rule() {
            Rule::EOI => {}
            Rule::space => {
                if self.at_line_start && self.col == 0 {
                    self.indent_text = text;
                    self.indent_width = indentation_width(text);
                }
                self.col += text.chars().count();
            }
            Rule::continuation => {
                self.row += 1;
                self.col = 0;
            }
            Rule::newline => {
                let kind = if self.depth > 0 || !self.line_has_code {
                    TokenKind::Nl
                } else {
                    TokenKind::Newline
                };
                let start = self.position();
                let end = Position::new(start.row, start.col + text.chars().count());
                self.tokens.push(Token::new(kind, text, start, end));
                self.row += 1;
                self.col = 0;
                if kind == TokenKind::Newline {
                    self.at_line_start = true;
                    self.line_has_code = false;
                }
                if self.at_line_start {
                    self.indent_text = "";
                    self.indent_width = 0;
                }
            }
            Rule::comment => self.emit(TokenKind::Comment, text),
            Rule::unterminated_string => {
                return Err(Error::lex("unterminated string literal", self.position()));
            }
            rule => {
                if self.at_line_start {
                    self.indent()?;
                    self.at_line_start = false;
                }
                self.line_has_code = true;
                let kind = match rule {
                    Rule::string => TokenKind::String,
                    Rule::number => TokenKind::Number,
                    Rule::name => TokenKind::Name,
                    Rule::operator => TokenKind::Op,
                    _ => TokenKind::ErrorToken,
                };
                if kind == TokenKind::Op {
                    match text {
                        "(" | "[" | "{" => self.depth += 1,
                        ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
                        _ => {}
                    }
                }
                self.emit(kind, text);
            }
        }
        Ok(())
    }

    /// Push a token starting at the cursor and advance the cursor past it.
    fn emit(&mut self, kind: TokenKind, text: &'a str) {
        let start = self.position();
        let mut chars = text.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '\r' | '\n' => {
                    if ch == '\r' && chars.peek() == Some(&'\n') {
                        chars.next();
                    }
                    self.row += 1;
                    self.col = 0;
                }
                _ => self.col += 1,
            }
        }
        let end = self.position();
        self.tokens.push(Token::new(kind, text, start, end));
    }

    /// Compare the current line's indentation against the indentation stack.
    fn indent(&mut self) -> Result<()> {
        let top = self.indents.last().copied().unwrap_or(0);
        if self.indent_width > top {
            self.indents.push(self.indent_width);
            let start = Position::new(self.row, 0);
            self.tokens.push(Token::new(TokenKind::Indent, self.indent_text, start, self.position()));
            return Ok(());
        }
        while self.indents.last().is_some_and(|&width| width > self.indent_width) {
            self.indents.pop();
            let here = self.position();
            self.tokens.push(Token::new(TokenKind::Dedent, "", here, here));
        }
        if self.indents.last().copied().unwrap_or(0) != self.indent_width {
            return Err(Error::lex(
                "unindent does not match any outer indentation level",
                self.position(),
            ));
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<Token<'a>>> {
        if self.depth > 0 {
            return Err(Error::lex("unexpected end of input inside brackets", self.position()));
        }
        if self.line_has_code {
            let here = self.position();
            let end = Position::new(here.row, here.col + 1);
            self.tokens.push(Token::new(TokenKind::Newline, "", here, end));
            self.row += 1;
            self.col = 0;
        }
        let here = Position::new(self.row, 0);
        for _ in 1..self.indents.len() {
            self.tokens.push(Token::new(TokenKind::Dedent, "", here, here));
        }
        self.tokens.push(Token::new(TokenKind::EndMarker, "", here, here));
        Ok(self.tokens)
    }
}

fn indentation_width(whitespace: &str) -> usize {
    whitespace.chars().fold(0, |width, ch| match ch {
        '\t' => (width / 8 + 1) * 8,
        '\u{0C}' => 0,
        _ => width + 1,
    })
}

/// Re-linearize a token stream into source text using token positions.
///
/// Indentation is restored from `Indent` tokens, column gaps become spaces and
/// row jumps outside line breaks become backslash continuations. Positions
/// must be monotonic.
pub fn untokenize(tokens: &[Token<'_>]) -> Result<String> {
    let mut out = String::new();
    let mut indents: Vec<&str> = Vec::new();
    let mut prev = Position::new(1, 0);
    let mut startline = false;

    for token in tokens {
        match token.kind {
            TokenKind::EndMarker => break,
            TokenKind::Indent => {
                indents.push(token.text.as_ref());
                continue;
            }
            TokenKind::Dedent => {
                indents.pop();
                prev = token.end;
                continue;
            }
            TokenKind::Newline | TokenKind::Nl => startline = true,
            _ => {
                if startline {
                    if let Some(indent) = indents.last() {
                        let width = indent.chars().count();
                        if token.start.col >= width {
                            out.push_str(indent);
                            prev.col = width;
                        }
                        startline = false;
                    }
                }
            }
        }

        let start = token.start;
        if start < prev {
            return Err(Error::Untokenize { position: start });
        }
        let row_offset = start.row - prev.row;
        if row_offset > 0 {
            out.push_str(&"\\\n".repeat(row_offset));
            prev.col = 0;
        }
        out.push_str(&" ".repeat(start.col.saturating_sub(prev.col)));
        out.push_str(&token.text);
        prev = token.end;
        if matches!(token.kind, TokenKind::Newline | TokenKind::Nl) {
            prev = Position::new(prev.row + 1, 0);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(source: &str) -> Vec<(TokenKind, String)> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|t| (t.kind, t.text.into_owned()))
            .collect()
    }

    #[test]
    fn test_simple_statement() {
        use TokenKind::*;
        assert_eq!(
            kinds("x = 1\n"),
            vec![
                (Name, "x".to_string()),
                (Op, "=".to_string()),
                (Number, "1".to_string()),
                (Newline, "\n".to_string()),
                (EndMarker, "".to_string()),
            ]
        );
    }

    #[test]
    fn test_positions() {
        let tokens = tokenize("def f(a):\n    return a\n").unwrap();
        let ret = tokens.iter().find(|t| t.is_name("return")).unwrap();
        assert_eq!(ret.start, Position::new(2, 4));
        assert_eq!(ret.end, Position::new(2, 10));
        let indent = tokens.iter().find(|t| t.kind == TokenKind::Indent).unwrap();
        assert_eq!(indent.text, "    ");
        assert_eq!(indent.end, Position::new(2, 4));
    }

    #[test]
    fn test_indent_dedent() {
        use TokenKind::*;
        let source = "if x:\n    if y:\n        z\nw\n";
        let layout: Vec<TokenKind> = tokenize(source)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .filter(|k| matches!(k, Indent | Dedent))
            .collect();
        assert_eq!(layout, vec![Indent, Indent, Dedent, Dedent]);
    }

    #[test]
    fn test_sigil_is_two_tokens() {
        let tokens = tokenize("def f(a=>(1)): pass").unwrap();
        let eq = tokens.iter().position(|t| t.is_op("=")).unwrap();
        assert!(tokens[eq + 1].is_op(">"));
        assert_eq!(tokens[eq].end, tokens[eq + 1].start);
    }

    #[test]
    fn test_longest_operator() {
        let tokens = tokenize("a >= b == c -> d\n").unwrap();
        let ops: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Op)
            .map(|t| t.text.as_ref())
            .collect();
        assert_eq!(ops, vec![">=", "==", "->"]);
    }

    #[test]
    fn test_brackets_produce_nl() {
        use TokenKind::*;
        let tokens = tokenize("f(\n    1,\n)\n").unwrap();
        let breaks: Vec<TokenKind> = tokens
            .iter()
            .map(|t| t.kind)
            .filter(|k| matches!(k, Newline | Nl))
            .collect();
        assert_eq!(breaks, vec![Nl, Nl, Newline]);
    }

    #[test]
    fn test_strings_and_numbers() {
        use TokenKind::*;
        let tokens = kinds("s = rb'x' + f\"{y}\" + '''a\nb''' + 0x_ff + 1.5e-3j\n");
        let strings: Vec<&str> = tokens
            .iter()
            .filter(|(k, _)| *k == String)
            .map(|(_, t)| t.as_str())
            .collect();
        assert_eq!(strings, vec!["rb'x'", "f\"{y}\"", "'''a\nb'''"]);
        let numbers: Vec<&str> = tokens
            .iter()
            .filter(|(k, _)| *k == Number)
            .map(|(_, t)| t.as_str())
            .collect();
        assert_eq!(numbers, vec!["0x_ff", "1.5e-3j"]);
    }

    #[test]
    fn test_multiline_string_advances_rows() {
        let tokens = tokenize("x = '''a\nbc''' + y\n").unwrap();
        let y = tokens.iter().find(|t| t.is_name("y")).unwrap();
        assert_eq!(y.start, Position::new(2, 8));
    }

    #[test]
    fn test_missing_trailing_newline() {
        let tokens = tokenize("x").unwrap();
        assert_eq!(tokens[1].kind, TokenKind::Newline);
        assert_eq!(tokens[1].text, "");
        assert_eq!(tokens[2].kind, TokenKind::EndMarker);
        assert_eq!(tokens[2].start, Position::new(2, 0));
    }

    #[test]
    fn test_comment_lines_are_nl() {
        use TokenKind::*;
        assert_eq!(
            kinds("# hello\n\nx\n"),
            vec![
                (Comment, "# hello".to_string()),
                (Nl, "\n".to_string()),
                (Nl, "\n".to_string()),
                (Name, "x".to_string()),
                (Newline, "\n".to_string()),
                (EndMarker, "".to_string()),
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("x = 'abc\n").unwrap_err();
        assert!(matches!(err, Error::Lex { position, .. } if position == Position::new(1, 4)));
    }

    #[test]
    fn test_bad_dedent() {
        let err = tokenize("if x:\n        y\n    z\n").unwrap_err();
        assert!(matches!(err, Error::Lex { .. }));
    }

    #[test]
    fn test_unclosed_bracket() {
        assert!(matches!(tokenize("f(1,\n"), Err(Error::Lex { .. })));
    }

    #[test]
    fn test_untokenize_round_trip() {
        let source = "\
# leading comment
def f(
    a,
    b = 1,  # trailing
):
    if a:
        return [a,
                b]

    return b
x = f(1)
";
        let tokens = tokenize(source).unwrap();
        assert_eq!(untokenize(&tokens).unwrap(), source);
    }

    #[test]
    fn test_untokenize_continuation() {
        let tokens = tokenize("x = 1 + \\\n    2\n").unwrap();
        assert_eq!(untokenize(&tokens).unwrap(), "x = 1 +\\\n    2\n");
    }

    #[test]
    fn test_untokenize_rejects_overlap() {
        let mut tokens = tokenize("a b\n").unwrap();
        tokens[1].start = Position::new(1, 0);
        assert!(matches!(untokenize(&tokens), Err(Error::Untokenize { .. })));
    }
}
