use tracing::{debug, trace};

use crate::ast::*;
use crate::config::TransformOptions;
use crate::error::{Error, Result};
use crate::lexer::TokenKind;

/// Replaces marker calls in default slots with deferred computations, gives
/// every function an evaluation prologue, and imports the runtime support
/// names into the module.
pub struct LateBindingTransformer<'o> {
    options: &'o TransformOptions,
    functions: usize,
    deferred: usize,
}

impl<'o> LateBindingTransformer<'o> {
    pub fn new(options: &'o TransformOptions) -> Self {
        Self {
            options,
            functions: 0,
            deferred: 0,
        }
    }

    pub fn transform_module(&mut self, module: &mut Module<'_>) -> Result<()> {
        self.transform_body(&mut module.body)?;
        let index = import_index(&module.body);
        module.body.insert(index, Stmt::RuntimeImport);
        debug!(
            functions = self.functions,
            deferred = self.deferred,
            "transformed module"
        );
        Ok(())
    }

    fn transform_body(&mut self, body: &mut [Stmt<'_>]) -> Result<()> {
        for stmt in body {
            match stmt {
                Stmt::Function(function) => self.transform_function(function)?,
                Stmt::Compound(compound) => self.transform_body(&mut compound.body.body)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn transform_function(&mut self, function: &mut FunctionDef<'_>) -> Result<()> {
        let resolutions = self.replace_markers(function)?;
        trace!(function = %function.name, ?resolutions, "late-bound defaults");
        self.functions += 1;
        self.deferred += resolutions.len();

        let prologue = Stmt::Prologue(Prologue { resolutions });
        match &mut function.body {
            Suite::Block(block) => {
                let index = prologue_index(&block.body);
                block.body.insert(index, prologue);
                self.transform_body(&mut block.body)
            }
            Suite::Inline(line) => {
                let line = std::mem::replace(line, Line { tokens: Vec::new() });
                let mut body = vec![Stmt::Simple(line)];
                let index = prologue_index(&body);
                body.insert(index, prologue);
                function.body = Suite::Block(Block {
                    leading: Vec::new(),
                    indent: None,
                    body,
                });
                Ok(())
            }
        }
    }

    /// Turn every marker default into a deferred computation over the
    /// parameters it may read, returning the resolutions in declaration order.
    fn replace_markers(&self, function: &mut FunctionDef<'_>) -> Result<Vec<Resolution>> {
        let marker = self.options.marker_name.as_str();
        let positional = function
            .parameters
            .names(&[ParamKind::PositionalOnly, ParamKind::PositionalOrKeyword]);
        let keyword_only = function.parameters.names(&[ParamKind::KeywordOnly]);
        let all_with_kw: Vec<String> = positional.iter().chain(&keyword_only).cloned().collect();

        // Positional defaults trail the required parameters.
        let defaults = function
            .parameters
            .params()
            .filter(|p| p.kind.is_positional() && p.default.is_some())
            .count();
        let offset = positional.len() - defaults;

        let mut resolutions = Vec::new();
        let mut default_index = 0;
        let mut kw_index = 0;
        for param in function.parameters.params_mut() {
            let dependencies = match param.kind {
                ParamKind::PositionalOnly | ParamKind::PositionalOrKeyword => {
                    if param.default.is_none() {
                        continue;
                    }
                    default_index += 1;
                    &positional[..offset + default_index - 1]
                }
                ParamKind::KeywordOnly => {
                    kw_index += 1;
                    &all_with_kw[..positional.len() + kw_index - 1]
                }
                ParamKind::VarPositional | ParamKind::VarKeyword => continue,
            };
            let Some(default) = param.default.as_mut() else {
                continue;
            };
            if defer(&mut default.value, marker, dependencies, &param.name.text)? {
                resolutions.push(Resolution {
                    name: param.name.text.to_string(),
                    dependencies: dependencies.to_vec(),
                });
            }
        }
        Ok(resolutions)
    }
}

/// Replace a marker default with a deferred computation. Returns whether the
/// slot held a marker.
fn defer(value: &mut DefaultValue<'_>, marker: &str, dependencies: &[String], name: &str) -> Result<bool> {
    let DefaultValue::Expression(tokens) = value else {
        return Ok(false);
    };
    let call = match MarkerCall::from_tokens(std::mem::take(tokens), marker) {
        Ok(call) => call,
        Err(original) => {
            *tokens = original;
            if let Some(first) = tokens.first().filter(|t| t.is_name(marker)) {
                return Err(Error::InvalidLateBound {
                    name: name.to_string(),
                    reason: "expected a parenthesized expression after `=>`".to_string(),
                    position: first.start,
                });
            }
            return Ok(false);
        }
    };

    if call.args.is_empty() {
        return Err(Error::InvalidLateBound {
            name: name.to_string(),
            reason: "expected an expression after `=>`".to_string(),
            position: call.position(),
        });
    }
    let keyword = call.args.iter().find(|arg| {
        let mut significant = arg.value.iter().filter(|t| !t.is_trivia());
        matches!(
            (significant.next(), significant.next()),
            (Some(first), Some(second)) if first.kind == TokenKind::Name && second.is_op("=")
        )
    });
    if let Some(arg) = keyword {
        return Err(Error::InvalidLateBound {
            name: name.to_string(),
            reason: "keyword arguments are not allowed".to_string(),
            position: arg.value.first().map_or(call.position(), |t| t.start),
        });
    }

    *value = DefaultValue::Deferred(DeferredComputation {
        dependencies: dependencies.to_vec(),
        call,
    });
    Ok(true)
}

/// Index of the first non-trivia statement.
fn first_statement(body: &[Stmt<'_>]) -> Option<usize> {
    body.iter().position(|stmt| !stmt.is_trivia())
}

/// The prologue goes first, or second when the body opens with a docstring.
fn prologue_index(body: &[Stmt<'_>]) -> usize {
    match first_statement(body) {
        Some(index) if body[index].is_docstring() => index + 1,
        Some(index) => index,
        None => body.len(),
    }
}

/// After a leading docstring and any `from __future__` imports.
fn import_index(body: &[Stmt<'_>]) -> usize {
    let mut index = prologue_index(body);
    while let Some(next) = body[index..].iter().position(|stmt| !stmt.is_trivia()) {
        if !body[index + next].is_future_import() {
            break;
        }
        index += next + 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::marker::inject_markers;
    use crate::parser::Parser;

    fn transform(source: &str) -> Module<'_> {
        let options = TransformOptions::default();
        let (tokens, _) = inject_markers(tokenize(source).unwrap(), &options.marker_name);
        let mut module = Parser::parse_module(tokens).unwrap();
        LateBindingTransformer::new(&options).transform_module(&mut module).unwrap();
        module
    }

    fn transform_err(source: &str) -> Error {
        let options = TransformOptions::default();
        let (tokens, _) = inject_markers(tokenize(source).unwrap(), &options.marker_name);
        let mut module = Parser::parse_module(tokens).unwrap();
        LateBindingTransformer::new(&options)
            .transform_module(&mut module)
            .unwrap_err()
    }

    fn functions<'m, 'a>(body: &'m [Stmt<'a>]) -> Vec<&'m FunctionDef<'a>> {
        body.iter()
            .filter_map(|stmt| match stmt {
                Stmt::Function(function) => Some(function),
                _ => None,
            })
            .collect()
    }

    fn block<'m, 'a>(function: &'m FunctionDef<'a>) -> &'m Block<'a> {
        match &function.body {
            Suite::Block(block) => block,
            Suite::Inline(_) => panic!("expected a block"),
        }
    }

    fn prologue<'m>(function: &'m FunctionDef<'_>) -> &'m Prologue {
        block(function)
            .body
            .iter()
            .find_map(|stmt| match stmt {
                Stmt::Prologue(prologue) => Some(prologue),
                _ => None,
            })
            .unwrap()
    }

    fn resolution(name: &str, dependencies: &[&str]) -> Resolution {
        Resolution {
            name: name.to_string(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn test_positional_and_keyword_dependencies() {
        let module = transform(
            "def test_func(z, a=1, b => ([a] * a), /, c => ({str(a): b}), *, d => (str(a) + str(c))):\n    return b\n",
        );
        let function = functions(&module.body)[0];
        assert_eq!(
            prologue(function).resolutions,
            vec![
                resolution("b", &["z", "a"]),
                resolution("c", &["z", "a", "b"]),
                resolution("d", &["z", "a", "b", "c"]),
            ]
        );
        assert_eq!(module.marker_count("_PEP671_MARKER"), 0);
    }

    #[test]
    fn test_keyword_only_sees_all_positional() {
        let module = transform(
            "def f(a, b=1.0, /, ex='hello', *, c => ([a, b, ex]), d=False, e => (len(c))):\n    return c, e\n",
        );
        let function = functions(&module.body)[0];
        assert_eq!(
            prologue(function).resolutions,
            vec![
                resolution("c", &["a", "b", "ex"]),
                resolution("e", &["a", "b", "ex", "c", "d"]),
            ]
        );
    }

    #[test]
    fn test_variadics_are_not_dependencies() {
        let module = transform("def f(a, *args, b => (a), **kw):\n    pass\n");
        let function = functions(&module.body)[0];
        assert_eq!(prologue(function).resolutions, vec![resolution("b", &["a"])]);
    }

    #[test]
    fn test_deferred_slot_holds_dependencies() {
        let module = transform("def f(a, b => (a, a + 1)):\n    pass\n");
        let function = functions(&module.body)[0];
        let b = function.parameters.params().nth(1).unwrap();
        let Some(ParamDefault {
            value: DefaultValue::Deferred(deferred),
            ..
        }) = &b.default
        else {
            panic!("expected a deferred default");
        };
        assert_eq!(deferred.dependencies, vec!["a".to_string()]);
        assert!(deferred.is_tuple());
    }

    #[test]
    fn test_plain_function_gets_empty_prologue() {
        let module = transform("def f(a, b=2):\n    return a\n");
        let function = functions(&module.body)[0];
        let body = &block(function).body;
        assert_eq!(body.len(), 2);
        assert_eq!(body[0], Stmt::Prologue(Prologue::default()));
        assert_eq!(module.body[0], Stmt::RuntimeImport);
        assert_eq!(module.body.len(), 2);
    }

    #[test]
    fn test_prologue_after_docstring() {
        let module = transform("def f(a, b => (a)):\n    \"\"\"Doc.\"\"\"\n    return b\n");
        let body = &block(functions(&module.body)[0]).body;
        assert!(body[0].is_docstring());
        assert!(matches!(body[1], Stmt::Prologue(_)));
    }

    #[test]
    fn test_module_import_after_docstring() {
        let module = transform("\"\"\"Module.\"\"\"\ndef f():\n    pass\n");
        assert!(module.body[0].is_docstring());
        assert_eq!(module.body[1], Stmt::RuntimeImport);
    }

    #[test]
    fn test_module_import_after_future_import() {
        let module = transform("from __future__ import annotations\ndef f():\n    pass\n");
        assert!(module.body[0].is_future_import());
        assert_eq!(module.body[1], Stmt::RuntimeImport);
    }

    #[test]
    fn test_module_import_after_docstring_and_future_import() {
        let module = transform(
            "\"\"\"Module.\"\"\"\n# note\nfrom __future__ import annotations\nfrom __future__ import division\nx = 1\n",
        );
        assert!(module.body[0].is_docstring());
        assert!(module.body[1].is_trivia());
        assert!(module.body[2].is_future_import());
        assert!(module.body[3].is_future_import());
        assert_eq!(module.body[4], Stmt::RuntimeImport);
    }

    #[test]
    fn test_future_import_before_docstring() {
        // A string after a `__future__` import is not a docstring.
        let module = transform("from __future__ import annotations\n\"\"\"Text.\"\"\"\n");
        assert!(module.body[0].is_future_import());
        assert_eq!(module.body[1], Stmt::RuntimeImport);
        assert!(matches!(module.body[2], Stmt::Simple(_)));
    }

    #[test]
    fn test_import_below_header_comments() {
        let module = transform("# coding: experimental-late-bound-defaults\n\ndef f():\n    pass\n");
        assert!(module.body[0].is_trivia());
        assert_eq!(module.body[1], Stmt::RuntimeImport);
    }

    #[test]
    fn test_nested_functions_and_methods() {
        let source = "\
class C:
    def m(self, x => (self.default)):
        def inner(y => (x)):
            return y
        return inner()
";
        let module = transform(source);
        let Stmt::Compound(class) = &module.body[1] else {
            panic!("expected a class");
        };
        let method = functions(&class.body.body)[0];
        assert_eq!(prologue(method).resolutions, vec![resolution("x", &["self"])]);
        let inner = functions(&block(method).body)[0];
        assert_eq!(prologue(inner).resolutions, vec![resolution("y", &[])]);
    }

    #[test]
    fn test_inline_suite_becomes_block() {
        let module = transform("def f(a, b => (a)): return b\n");
        let block = block(functions(&module.body)[0]);
        assert!(block.indent.is_none());
        assert!(matches!(block.body[0], Stmt::Prologue(_)));
        assert!(matches!(block.body[1], Stmt::Simple(_)));
    }

    #[test]
    fn test_marker_inside_larger_expression_is_left_alone() {
        let module = transform("def f(a, b=g(_PEP671_MARKER(a))):\n    pass\n");
        let function = functions(&module.body)[0];
        assert!(prologue(function).resolutions.is_empty());
    }

    #[test]
    fn test_late_bound_default_on_following_line() {
        let module = transform("def f(a, b =>  # doubled\n        (a * 2)):\n    return b\n");
        let function = functions(&module.body)[0];
        assert_eq!(prologue(function).resolutions, vec![resolution("b", &["a"])]);
        let b = function.parameters.params().nth(1).unwrap();
        let Some(ParamDefault { value: DefaultValue::Deferred(deferred), .. }) = &b.default else {
            panic!("expected a deferred default");
        };
        let gap: Vec<TokenKind> = deferred.call.gap.iter().map(|t| t.kind).collect();
        assert_eq!(gap, vec![TokenKind::Comment, TokenKind::Nl]);
        assert_eq!(deferred.call.args.len(), 1);
    }

    #[test]
    fn test_lambda_inside_late_bound_default() {
        let module = transform("def f(a, key => (lambda x, y: x + a)):\n    return key\n");
        let function = functions(&module.body)[0];
        let key = function.parameters.params().nth(1).unwrap();
        assert!(matches!(
            &key.default,
            Some(ParamDefault { value: DefaultValue::Deferred(deferred), .. }) if !deferred.is_tuple()
        ));
    }

    #[test]
    fn test_sigil_without_parenthesized_expression() {
        assert!(matches!(
            transform_err("def f(a, b => (a) + 1):\n    pass\n"),
            Error::InvalidLateBound { name, .. } if name == "b"
        ));
        assert!(matches!(
            transform_err("def f(a, b => a):\n    pass\n"),
            Error::InvalidLateBound { .. }
        ));
    }

    #[test]
    fn test_empty_late_bound_default() {
        assert!(matches!(
            transform_err("def f(a => ()):\n    pass\n"),
            Error::InvalidLateBound { name, .. } if name == "a"
        ));
    }

    #[test]
    fn test_keyword_argument_in_late_bound_default() {
        assert!(matches!(
            transform_err("def f(a => (x=1)):\n    pass\n"),
            Error::InvalidLateBound { .. }
        ));
    }
}
