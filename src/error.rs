use std::fmt;

use thiserror::Error;

use crate::lexer::Rule;

/// A (row, column) location in source text. Rows are 1-based, columns are
/// 0-based character offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub row: usize,
    pub col: usize,
}

impl Position {
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.row, self.col)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("tokenizer grammar error: {0}")]
    Grammar(#[from] Box<pest::error::Error<Rule>>),
    #[error("{position}: {message}")]
    Lex { message: String, position: Position },
    #[error("{position}: syntax error: {message}")]
    Parse { message: String, position: Position },
    #[error("{position}: token starts before the end of the previous token")]
    Untokenize { position: Position },
    #[error("{position}: invalid late-bound default for `{name}`: {reason}")]
    InvalidLateBound {
        name: String,
        reason: String,
        position: Position,
    },
    #[error("source is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid options: {0}")]
    Config(#[from] toml::de::Error),
    #[error("unknown source codec `{0}`")]
    UnknownCodec(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl Error {
    pub(crate) fn lex(message: impl Into<String>, position: Position) -> Self {
        Error::Lex {
            message: message.into(),
            position,
        }
    }

    pub(crate) fn parse(message: impl Into<String>, position: Position) -> Self {
        Error::Parse {
            message: message.into(),
            position,
        }
    }
}

/// Failures raised while resolving late-bound defaults for one call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("late-bound default `{name}` takes {expected} argument(s) but {given} were given")]
    Arity {
        name: String,
        expected: usize,
        given: usize,
    },
    #[error("name `{0}` is not defined")]
    UnboundName(String),
    #[error("{function}() takes {expected} positional argument(s) but {given} were given")]
    TooManyPositional {
        function: String,
        expected: usize,
        given: usize,
    },
    #[error("{function}() got an unexpected keyword argument `{keyword}`")]
    UnexpectedKeyword { function: String, keyword: String },
    #[error("{function}() got multiple values for argument `{parameter}`")]
    DuplicateArgument { function: String, parameter: String },
    #[error("{function}() missing required argument `{parameter}`")]
    MissingArgument { function: String, parameter: String },
    #[error("invalid signature for {function}(): {reason}")]
    InvalidSignature { function: String, reason: String },
    #[error("binding `{0}` still holds an unevaluated late-bound default")]
    Unresolved(String),
    #[error("{0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
