use tracing::debug;

use crate::ast::Module;
use crate::codegen;
use crate::config::TransformOptions;
use crate::error::Result;
use crate::lexer::{Token, tokenize, untokenize};
use crate::marker::inject_markers;
use crate::parser::Parser;
use crate::transform::LateBindingTransformer;

/// Output of the loader path: the transformed tree and the code rendered
/// from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled<'a> {
    pub module: Module<'a>,
    pub code: String,
}

/// The source-to-source transform, stage by stage.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    options: TransformOptions,
}

impl Pipeline {
    pub fn new(options: TransformOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TransformOptions {
        &self.options
    }

    /// Stage 1: tokenize and replace every `=>` sigil with a marker call.
    pub fn rewrite<'a>(&self, source: &'a str) -> Result<Vec<Token<'a>>> {
        let (tokens, injected) = inject_markers(tokenize(source)?, &self.options.marker_name);
        debug!(tokens = tokens.len(), injected, "injected markers");
        Ok(tokens)
    }

    /// Stage 1, re-linearized to text.
    pub fn rewrite_source(&self, source: &str) -> Result<String> {
        untokenize(&self.rewrite(source)?)
    }

    pub fn parse<'a>(&self, tokens: Vec<Token<'a>>) -> Result<Module<'a>> {
        Parser::parse_module(tokens)
    }

    /// Stage 2.
    pub fn transform(&self, module: &mut Module<'_>) -> Result<()> {
        LateBindingTransformer::new(&self.options).transform_module(module)
    }

    pub fn emit(&self, module: &Module<'_>) -> String {
        codegen::emit(module, &self.options)
    }

    /// Decoding path: stage 1 is re-linearized and re-tokenized before the
    /// tree is built.
    pub fn run(&self, source: &str) -> Result<String> {
        let rewritten = self.rewrite_source(source)?;
        let mut module = self.parse(tokenize(&rewritten)?)?;
        self.transform(&mut module)?;
        Ok(self.emit(&module))
    }

    /// Loader path: the stage 1 token stream is parsed directly.
    pub fn compile<'a>(&self, source: &'a str) -> Result<Compiled<'a>> {
        let mut module = self.parse(self.rewrite(source)?)?;
        self.transform(&mut module)?;
        let code = self.emit(&module);
        debug!(bytes = code.len(), "compiled module");
        Ok(Compiled { module, code })
    }
}
