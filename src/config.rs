use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How a function's deferred parameters are resolved on entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrologueStyle {
    /// One conditional reassignment per deferred parameter.
    #[default]
    Assignments,
    /// A single call handing `locals()` to the runtime evaluator.
    Evaluator,
}

/// Names and styles used by the transform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TransformOptions {
    /// Identifier injected in place of the `=>` sigil.
    pub marker_name: String,
    /// Module the generated import pulls the support names from.
    pub runtime_module: String,
    pub wrapper_name: String,
    pub evaluator_name: String,
    pub prologue: PrologueStyle,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            marker_name: "_PEP671_MARKER".to_string(),
            runtime_module: "experimental_late_bound_defaults".to_string(),
            wrapper_name: "_defer".to_string(),
            evaluator_name: "_evaluate_late_binding".to_string(),
            prologue: PrologueStyle::default(),
        }
    }
}

impl TransformOptions {
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load options from a TOML file. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// `from MODULE import WRAPPER, EVALUATOR`
    pub fn import_line(&self) -> String {
        format!(
            "from {} import {}, {}",
            self.runtime_module, self.wrapper_name, self.evaluator_name
        )
    }
}
