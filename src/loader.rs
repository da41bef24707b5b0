//! Import-time hook: compiles matching source files through the transform
//! without re-linearizing the rewritten token stream.

use std::path::{Path, PathBuf};
use std::sync::{OnceLock, PoisonError, RwLock};

use tracing::{debug, info};

use crate::ast::Module;
use crate::codec;
use crate::config::TransformOptions;
use crate::error::Result;
use crate::pipeline::Pipeline;

/// A compiled source file.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledModule {
    pub path: PathBuf,
    /// The transformed tree.
    pub module: Module<'static>,
    /// Source text rendered from `module`.
    pub code: String,
}

#[derive(Debug, Clone)]
pub struct LateBoundLoader {
    pipeline: Pipeline,
    suffixes: Vec<String>,
}

impl Default for LateBoundLoader {
    fn default() -> Self {
        Self::new(TransformOptions::default())
    }
}

impl LateBoundLoader {
    pub fn new(options: TransformOptions) -> Self {
        Self {
            pipeline: Pipeline::new(options),
            suffixes: vec![".py".to_string()],
        }
    }

    pub fn with_suffixes<I, S>(mut self, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suffixes = suffixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn suffixes(&self) -> &[String] {
        &self.suffixes
    }

    /// Whether `path` names a source file this loader handles.
    pub fn matches(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return false;
        };
        self.suffixes
            .iter()
            .any(|suffix| name.len() > suffix.len() && name.ends_with(suffix.as_str()))
    }

    /// Decode raw source and compile it. Only the UTF-8 layer of the source
    /// encoding is applied; the transform runs on the token stream directly.
    pub fn source_to_code(&self, data: &[u8], path: &Path) -> Result<CompiledModule> {
        let source = std::str::from_utf8(data)?;
        let compiled = self.pipeline.compile(source)?;
        debug!(path = %path.display(), "compiled source file");
        Ok(CompiledModule {
            path: path.to_path_buf(),
            module: compiled.module.into_owned(),
            code: compiled.code,
        })
    }

    pub fn load(&self, path: &Path) -> Result<CompiledModule> {
        let data = std::fs::read(path)?;
        self.source_to_code(&data, path)
    }
}

fn installed() -> &'static RwLock<Option<LateBoundLoader>> {
    static INSTALLED: OnceLock<RwLock<Option<LateBoundLoader>>> = OnceLock::new();
    INSTALLED.get_or_init(|| RwLock::new(None))
}

/// Install `loader` process-wide, returning the one it replaces.
pub fn install(loader: LateBoundLoader) -> Option<LateBoundLoader> {
    info!(suffixes = ?loader.suffixes(), "installing late-bound loader");
    installed()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(loader)
}

pub fn uninstall() -> Option<LateBoundLoader> {
    let previous = installed()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if previous.is_some() {
        info!("uninstalled late-bound loader");
    }
    previous
}

pub fn is_installed() -> bool {
    installed()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

/// Compile `path` with the installed loader when it matches; other files are
/// only decoded.
pub fn compile_path(path: &Path) -> Result<String> {
    let loader = installed()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    match loader {
        Some(loader) if loader.matches(path) => Ok(loader.load(path)?.code),
        _ => codec::decode_source(&std::fs::read(path)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::fs;
    use tempfile::TempDir;

    const SOURCE: &str = "def f(a, b => (a * 2)):\n    return b\n";

    #[test]
    fn test_matches_suffix() {
        let loader = LateBoundLoader::default();
        assert!(loader.matches(Path::new("pkg/module.py")));
        assert!(!loader.matches(Path::new("pkg/module.pyc")));
        assert!(!loader.matches(Path::new(".py")));
        assert!(!loader.matches(Path::new("pkg/")));

        let loader = loader.with_suffixes([".pyl", ".py"]);
        assert!(loader.matches(Path::new("late.pyl")));
    }

    #[test]
    fn test_source_to_code() {
        let loader = LateBoundLoader::default();
        let compiled = loader.source_to_code(SOURCE.as_bytes(), Path::new("<string>")).unwrap();
        assert_eq!(
            compiled.code,
            "\
from experimental_late_bound_defaults import _defer, _evaluate_late_binding
def f(a, b = _defer(lambda a: a * 2)):
    if isinstance(b, _defer): b = b(a)
    return b
"
        );
        assert_eq!(compiled.module.marker_count("_PEP671_MARKER"), 0);
        assert_eq!(compiled.path, PathBuf::from("<string>"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("late.py");
        fs::write(&path, SOURCE).unwrap();

        let compiled = LateBoundLoader::default().load(&path).unwrap();
        assert!(compiled.code.contains("_defer(lambda a: a * 2)"));
        assert_eq!(compiled.path, path);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = LateBoundLoader::default()
            .load(&dir.path().join("missing.py"))
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_install_and_compile_path() {
        let dir = TempDir::new().unwrap();
        let late = dir.path().join("late.py");
        let other = dir.path().join("notes.txt");
        fs::write(&late, SOURCE).unwrap();
        fs::write(&other, "plain text\n").unwrap();

        assert!(install(LateBoundLoader::default()).is_none());
        assert!(is_installed());
        assert!(compile_path(&late).unwrap().contains("_defer(lambda a: a * 2)"));
        assert_eq!(compile_path(&other).unwrap(), "plain text\n");

        assert!(uninstall().is_some());
        assert!(!is_installed());
        assert_eq!(compile_path(&late).unwrap(), SOURCE);
    }
}
