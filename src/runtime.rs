//! Call-time resolution of late-bound defaults.
//!
//! A [`Signature`] describes a function's parameters. Binding a call produces
//! declaration-ordered [`Bindings`] in which each omitted late-bound parameter
//! holds a fresh [`Deferred`] wrapper; [`evaluate`] then resolves those
//! wrappers in declaration order, each over the values resolved before it.
//!
//! Nothing here is shared mutably: a [`DeferredComputation`] is created once
//! and only read afterwards, and every call owns its bindings and wrappers.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::trace;

use crate::ast::ParamKind;
use crate::error::RuntimeError;

pub type Body<V> = Arc<dyn Fn(&[V]) -> Result<V, RuntimeError> + Send + Sync>;

/// The definition-time half of a late-bound default: the names it reads and
/// the closure computing it from their values.
pub struct DeferredComputation<V> {
    dependencies: Arc<[String]>,
    body: Body<V>,
}

impl<V> DeferredComputation<V> {
    pub fn new<I, S, F>(dependencies: I, body: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&[V]) -> Result<V, RuntimeError> + Send + Sync + 'static,
    {
        Self {
            dependencies: dependencies.into_iter().map(Into::into).collect(),
            body: Arc::new(body),
        }
    }

    fn from_body(dependencies: Vec<String>, body: Body<V>) -> Self {
        Self {
            dependencies: dependencies.into(),
            body,
        }
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// A fresh wrapper for one call.
    pub fn defer(&self, name: impl Into<String>) -> Deferred<V> {
        Deferred {
            name: name.into(),
            computation: self.clone(),
        }
    }
}

impl<V> Clone for DeferredComputation<V> {
    fn clone(&self) -> Self {
        Self {
            dependencies: Arc::clone(&self.dependencies),
            body: Arc::clone(&self.body),
        }
    }
}

impl<V> fmt::Debug for DeferredComputation<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredComputation")
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// An unevaluated late-bound default occupying a binding slot.
pub struct Deferred<V> {
    name: String,
    computation: DeferredComputation<V>,
}

impl<V> Deferred<V> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[String] {
        self.computation.dependencies()
    }

    /// Run the closure. `args` must match the dependency list exactly.
    pub fn call(&self, args: &[V]) -> Result<V, RuntimeError> {
        let expected = self.computation.dependencies.len();
        if args.len() != expected {
            return Err(RuntimeError::Arity {
                name: self.name.clone(),
                expected,
                given: args.len(),
            });
        }
        (self.computation.body)(args)
    }
}

impl<V> Clone for Deferred<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            computation: self.computation.clone(),
        }
    }
}

impl<V> fmt::Debug for Deferred<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("name", &self.name)
            .field("dependencies", &self.computation.dependencies)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum Slot<V> {
    Value(V),
    Deferred(Deferred<V>),
}

impl<V> Slot<V> {
    pub fn value(&self) -> Option<&V> {
        match self {
            Slot::Value(value) => Some(value),
            Slot::Deferred(_) => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Slot::Deferred(_))
    }
}

/// Parameter name to slot, in declaration order.
#[derive(Debug, Clone)]
pub struct Bindings<V> {
    slots: IndexMap<String, Slot<V>>,
}

impl<V> Default for Bindings<V> {
    fn default() -> Self {
        Self {
            slots: IndexMap::new(),
        }
    }
}

impl<V> Bindings<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append (or replace) a binding. New names go last.
    pub fn insert(&mut self, name: impl Into<String>, slot: Slot<V>) {
        self.slots.insert(name.into(), slot);
    }

    pub fn get(&self, name: &str) -> Option<&Slot<V>> {
        self.slots.get(name)
    }

    /// The resolved value bound to `name`.
    pub fn value(&self, name: &str) -> Result<&V, RuntimeError> {
        match self.slots.get(name) {
            Some(Slot::Value(value)) => Ok(value),
            Some(Slot::Deferred(_)) => Err(RuntimeError::Unresolved(name.to_string())),
            None => Err(RuntimeError::UnboundName(name.to_string())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Slot<V>)> {
        self.slots.iter().map(|(name, slot)| (name.as_str(), slot))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The leading run of resolved values, stopping at the first deferred slot.
    fn resolved_prefix(&self) -> impl Iterator<Item = &V> {
        self.slots.values().map_while(Slot::value)
    }

    /// Unwrap every slot, failing on any still-deferred binding.
    pub fn into_values(self) -> Result<IndexMap<String, V>, RuntimeError> {
        self.slots
            .into_iter()
            .map(|(name, slot)| match slot {
                Slot::Value(value) => Ok((name, value)),
                Slot::Deferred(_) => Err(RuntimeError::Unresolved(name)),
            })
            .collect()
    }
}

/// Resolve every deferred binding in declaration order.
///
/// Each wrapper receives the run of already-resolved values that precede it.
/// Results are collected in a copy and written back once all have succeeded.
pub fn evaluate<V: Clone>(bindings: &mut Bindings<V>) -> Result<(), RuntimeError> {
    let mut resolved = bindings.clone();
    for (name, slot) in &bindings.slots {
        let Slot::Deferred(deferred) = slot else {
            continue;
        };
        let args: Vec<V> = resolved.resolved_prefix().cloned().collect();
        trace!(name = %name, args = args.len(), "resolving late-bound default");
        let value = deferred.call(&args)?;
        resolved.insert(name.clone(), Slot::Value(value));
    }
    *bindings = resolved;
    Ok(())
}

/// How an omitted argument is filled in.
pub enum ParamDefault<V> {
    Required,
    /// Evaluated once, when the signature is built.
    Eager(V),
    /// Evaluated on every call from the parameters declared before it.
    Late(Body<V>),
}

impl<V> ParamDefault<V> {
    pub fn late<F>(body: F) -> Self
    where
        F: Fn(&[V]) -> Result<V, RuntimeError> + Send + Sync + 'static,
    {
        ParamDefault::Late(Arc::new(body))
    }
}

#[derive(Debug, Clone)]
enum Fill<V> {
    Required,
    Eager(V),
    Late(DeferredComputation<V>),
}

#[derive(Debug, Clone)]
struct Param<V> {
    name: String,
    kind: ParamKind,
    fill: Fill<V>,
}

/// A parameter list with eager and late-bound defaults.
#[derive(Debug, Clone)]
pub struct Signature<V> {
    name: String,
    params: Vec<Param<V>>,
}

pub struct SignatureBuilder<V> {
    name: String,
    params: Vec<(String, ParamKind, ParamDefault<V>)>,
}

impl<V> SignatureBuilder<V> {
    pub fn positional_only(self, name: impl Into<String>, default: ParamDefault<V>) -> Self {
        self.param(name, ParamKind::PositionalOnly, default)
    }

    pub fn positional(self, name: impl Into<String>, default: ParamDefault<V>) -> Self {
        self.param(name, ParamKind::PositionalOrKeyword, default)
    }

    pub fn keyword_only(self, name: impl Into<String>, default: ParamDefault<V>) -> Self {
        self.param(name, ParamKind::KeywordOnly, default)
    }

    fn param(mut self, name: impl Into<String>, kind: ParamKind, default: ParamDefault<V>) -> Self {
        self.params.push((name.into(), kind, default));
        self
    }

    /// Check parameter order and give each late default its dependency names.
    pub fn build(self) -> Result<Signature<V>, RuntimeError> {
        let invalid = |reason: String| RuntimeError::InvalidSignature {
            function: self.name.clone(),
            reason,
        };

        let mut seen: Vec<&str> = Vec::with_capacity(self.params.len());
        let mut last_kind = ParamKind::PositionalOnly;
        let mut seen_default = false;
        for (name, kind, default) in &self.params {
            if seen.contains(&name.as_str()) {
                return Err(invalid(format!("duplicate parameter `{name}`")));
            }
            if rank(*kind) < rank(last_kind) {
                return Err(invalid(format!("parameter `{name}` is out of order")));
            }
            if kind.is_positional() {
                match default {
                    ParamDefault::Required if seen_default => {
                        return Err(invalid(format!(
                            "required parameter `{name}` follows a parameter with a default"
                        )));
                    }
                    ParamDefault::Required => {}
                    _ => seen_default = true,
                }
            }
            seen.push(name);
            last_kind = *kind;
        }

        let positional: Vec<String> = self
            .params
            .iter()
            .filter(|(_, kind, _)| kind.is_positional())
            .map(|(name, _, _)| name.clone())
            .collect();
        let all_with_kw: Vec<String> = self.params.iter().map(|(name, _, _)| name.clone()).collect();

        let mut params = Vec::with_capacity(self.params.len());
        for (index, (name, kind, default)) in self.params.into_iter().enumerate() {
            // Keyword-only parameters follow every positional one, so both
            // groups see exactly the parameters declared before them.
            let visible = if kind.is_positional() {
                &positional[..index]
            } else {
                &all_with_kw[..index]
            };
            let fill = match default {
                ParamDefault::Required => Fill::Required,
                ParamDefault::Eager(value) => Fill::Eager(value),
                ParamDefault::Late(body) => Fill::Late(DeferredComputation::from_body(visible.to_vec(), body)),
            };
            params.push(Param { name, kind, fill });
        }
        Ok(Signature {
            name: self.name,
            params,
        })
    }
}

fn rank(kind: ParamKind) -> u8 {
    match kind {
        ParamKind::PositionalOnly => 0,
        ParamKind::PositionalOrKeyword => 1,
        ParamKind::VarPositional => 2,
        ParamKind::KeywordOnly => 3,
        ParamKind::VarKeyword => 4,
    }
}

impl<V: Clone> Signature<V> {
    pub fn builder(name: impl Into<String>) -> SignatureBuilder<V> {
        SignatureBuilder {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dependency names of a late-bound parameter.
    pub fn dependencies(&self, name: &str) -> Option<&[String]> {
        self.params.iter().find(|p| p.name == name).and_then(|p| match &p.fill {
            Fill::Late(computation) => Some(computation.dependencies()),
            _ => None,
        })
    }

    /// Match arguments to parameters. Omitted late-bound parameters get a
    /// fresh deferred wrapper.
    pub fn bind<K>(&self, args: Vec<V>, kwargs: K) -> Result<Bindings<V>, RuntimeError>
    where
        K: IntoIterator<Item = (String, V)>,
    {
        let positional = self.params.iter().filter(|p| p.kind.is_positional()).count();
        if args.len() > positional {
            return Err(RuntimeError::TooManyPositional {
                function: self.name.clone(),
                expected: positional,
                given: args.len(),
            });
        }

        let mut slots: Vec<Option<V>> = vec![None; self.params.len()];
        for (slot, value) in slots.iter_mut().zip(args) {
            *slot = Some(value);
        }
        for (keyword, value) in kwargs {
            let index = self
                .params
                .iter()
                .position(|p| p.name == keyword && p.kind != ParamKind::PositionalOnly)
                .ok_or_else(|| RuntimeError::UnexpectedKeyword {
                    function: self.name.clone(),
                    keyword: keyword.clone(),
                })?;
            if slots[index].is_some() {
                return Err(RuntimeError::DuplicateArgument {
                    function: self.name.clone(),
                    parameter: keyword,
                });
            }
            slots[index] = Some(value);
        }

        let mut bindings = Bindings::new();
        for (param, supplied) in self.params.iter().zip(slots) {
            let slot = match (supplied, &param.fill) {
                (Some(value), _) => Slot::Value(value),
                (None, Fill::Eager(value)) => Slot::Value(value.clone()),
                (None, Fill::Late(computation)) => Slot::Deferred(computation.defer(&param.name)),
                (None, Fill::Required) => {
                    return Err(RuntimeError::MissingArgument {
                        function: self.name.clone(),
                        parameter: param.name.clone(),
                    });
                }
            };
            bindings.insert(param.name.clone(), slot);
        }
        Ok(bindings)
    }

    /// Bind a call and resolve its late-bound defaults.
    pub fn call<K>(&self, args: Vec<V>, kwargs: K) -> Result<Bindings<V>, RuntimeError>
    where
        K: IntoIterator<Item = (String, V)>,
    {
        let mut bindings = self.bind(args, kwargs)?;
        evaluate(&mut bindings)?;
        Ok(bindings)
    }
}
