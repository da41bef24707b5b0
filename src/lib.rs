//! Late-bound function defaults (`name => (expr)`) for Python source.
//!
//! The `=>` sigil is rewritten into a marker call at the token level, the
//! marker is replaced in the syntax tree by a deferred computation over the
//! parameters declared before it, and each function gains a prologue that
//! resolves its deferred parameters on every call. [`runtime`] holds the
//! call-time counterpart.

pub mod ast;
pub mod codec;
pub mod codegen;
pub mod config;
pub mod error;
pub mod lexer;
pub mod loader;
pub mod marker;
pub mod parser;
pub mod pipeline;
pub mod runtime;
pub mod transform;

pub use codec::{CODEC_NAME, Codec, CodecRegistry, DecodingReader};
pub use config::{PrologueStyle, TransformOptions};
pub use error::{Error, Position, Result, RuntimeError};
pub use loader::{CompiledModule, LateBoundLoader};
pub use pipeline::{Compiled, Pipeline};

/// Transform `source` with the default options.
pub fn transform_source(source: &str) -> Result<String> {
    Pipeline::default().run(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_source() {
        let output = transform_source("def f(a, *, b => (a + 1)):\n    return b\n").unwrap();
        assert!(output.starts_with("from experimental_late_bound_defaults import _defer, _evaluate_late_binding\n"));
        assert!(output.contains("b = _defer(lambda a: a + 1)"));
        assert!(output.contains("    if isinstance(b, _defer): b = b(a)\n"));
    }
}
