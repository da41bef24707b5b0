//! Source decoding hook selected by a `coding:` header comment.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::{OnceLock, PoisonError, RwLock};

use regex::bytes::Regex;
use tracing::{debug, info};

use crate::config::TransformOptions;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;

/// Name to declare in a source header to opt a file into the transform.
pub const CODEC_NAME: &str = "experimental-late-bound-defaults";

fn coding_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[ \t\f]*#.*?coding[:=][ \t]*([-\w.]+)").expect("coding regex is valid")
    })
}

/// The encoding named by a `coding[:=]name` comment on the first or second
/// line. The second line only counts when the first is blank or a comment.
pub fn coding_declaration(source: &[u8]) -> Option<String> {
    for line in source.split(|&b| b == b'\n').take(2) {
        if let Some(name) = coding_pattern().captures(line).and_then(|caps| caps.get(1)) {
            return Some(String::from_utf8_lossy(name.as_bytes()).into_owned());
        }
        let first = line.iter().find(|b| !matches!(b, b' ' | b'\t' | b'\x0c' | b'\r'));
        if first.is_some_and(|&b| b != b'#') {
            break;
        }
    }
    None
}

/// Codec names compare case-insensitively, with `_` and spaces equal to `-`.
fn normalize(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            '_' | ' ' => '-',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

fn is_utf8_name(name: &str) -> bool {
    matches!(normalize(name).as_str(), "utf-8" | "utf8")
}

/// Decodes UTF-8 source and runs it through the late-binding transform.
#[derive(Debug, Clone)]
pub struct Codec {
    name: String,
    pipeline: Pipeline,
}

impl Codec {
    pub fn new(name: &str, pipeline: Pipeline) -> Self {
        Self {
            name: normalize(name),
            pipeline,
        }
    }

    pub fn late_bound(options: TransformOptions) -> Self {
        Self::new(CODEC_NAME, Pipeline::new(options))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the transformed text and the number of bytes consumed.
    pub fn decode(&self, input: &[u8]) -> Result<(String, usize)> {
        let source = std::str::from_utf8(input)?;
        let text = self.pipeline.run(source)?;
        debug!(codec = %self.name, consumed = input.len(), "decoded source");
        Ok((text, input.len()))
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::late_bound(TransformOptions::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<String, Codec>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `codec`, replacing any codec registered under the same name.
    pub fn register(&mut self, codec: Codec) -> Option<Codec> {
        self.codecs.insert(codec.name.clone(), codec)
    }

    pub fn unregister(&mut self, name: &str) -> Option<Codec> {
        self.codecs.remove(&normalize(name))
    }

    pub fn lookup(&self, name: &str) -> Option<&Codec> {
        self.codecs.get(&normalize(name))
    }

    /// Decode `source` with the codec its header declares, or as plain UTF-8
    /// when it declares none.
    pub fn decode_source(&self, source: &[u8]) -> Result<String> {
        match coding_declaration(source) {
            Some(name) if is_utf8_name(&name) => Ok(std::str::from_utf8(source)?.to_string()),
            Some(name) => {
                let codec = self.lookup(&name).ok_or(Error::UnknownCodec(name))?;
                Ok(codec.decode(source)?.0)
            }
            None => Ok(std::str::from_utf8(source)?.to_string()),
        }
    }
}

fn registry() -> &'static RwLock<CodecRegistry> {
    static REGISTRY: OnceLock<RwLock<CodecRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(CodecRegistry::new()))
}

/// Make the late-binding codec available process-wide.
pub fn register() {
    register_codec(Codec::default());
}

pub fn register_codec(codec: Codec) {
    info!(codec = %codec.name(), "registering source codec");
    registry()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .register(codec);
}

/// Remove the late-binding codec. Returns whether it was registered.
pub fn unregister() -> bool {
    let removed = registry()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .unregister(CODEC_NAME)
        .is_some();
    if removed {
        info!(codec = CODEC_NAME, "unregistered source codec");
    }
    removed
}

pub fn lookup(name: &str) -> Option<Codec> {
    registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .lookup(name)
        .cloned()
}

/// Decode `source` using the process-wide registry.
pub fn decode_source(source: &[u8]) -> Result<String> {
    registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .decode_source(source)
}

/// A reader yielding the decoded form of another reader's source.
///
/// The whole input is read and decoded on the first call to `read`.
pub struct DecodingReader<R: Read> {
    inner: R,
    codec: Option<Codec>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    done: bool,
}

impl<R: Read> DecodingReader<R> {
    /// Decode with the codec the source declares, looked up process-wide.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            codec: None,
            buffer: Vec::new(),
            buffer_pos: 0,
            done: false,
        }
    }

    /// Always decode with `codec`, whatever the header says.
    pub fn with_codec(inner: R, codec: Codec) -> Self {
        Self {
            codec: Some(codec),
            ..Self::new(inner)
        }
    }

    fn fill_buffer(&mut self) -> io::Result<()> {
        let mut input = Vec::new();
        self.inner.read_to_end(&mut input)?;
        let decoded = match &self.codec {
            Some(codec) => codec.decode(&input).map(|(text, _)| text),
            None => decode_source(&input),
        };
        self.buffer = decoded
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            .into_bytes();
        self.buffer_pos = 0;
        self.done = true;
        Ok(())
    }
}

impl<R: Read> Read for DecodingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.done {
            self.fill_buffer()?;
        }

        let available = &self.buffer[self.buffer_pos..];
        let to_copy = available.len().min(buf.len());
        buf[..to_copy].copy_from_slice(&available[..to_copy]);
        self.buffer_pos += to_copy;
        Ok(to_copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CODEC_IN_ACTION: &str = "\
# coding: experimental-late-bound-defaults

def example_func(
    a: int,
    b: float = 1.0,
    /,
    ex: str = \"hello\",
    *,
    c: list[object] => ([\"Preceding args\", a, b, ex]),
    d: bool = False,
    e: int => (len(c)),
) -> tuple[list[object], int]:
    return c, e
";

    const DECODED: &str = "\
# coding: experimental-late-bound-defaults

from experimental_late_bound_defaults import _defer, _evaluate_late_binding
def example_func(
    a: int,
    b: float = 1.0,
    /,
    ex: str = \"hello\",
    *,
    c: list[object] = _defer(lambda a, b, ex: [\"Preceding args\", a, b, ex]),
    d: bool = False,
    e: int = _defer(lambda a, b, ex, c, d: len(c)),
) -> tuple[list[object], int]:
    if isinstance(c, _defer): c = c(a, b, ex)
    if isinstance(e, _defer): e = e(a, b, ex, c, d)
    return c, e
";

    #[test]
    fn test_coding_declaration() {
        assert_eq!(
            coding_declaration(b"# coding: experimental-late-bound-defaults\n").as_deref(),
            Some(CODEC_NAME)
        );
        assert_eq!(
            coding_declaration(b"#!/usr/bin/env python\n# -*- coding: utf-8 -*-\n").as_deref(),
            Some("utf-8")
        );
        assert_eq!(
            coding_declaration(b"# vim: set fileencoding=latin-1 :\n").as_deref(),
            Some("latin-1")
        );
        assert_eq!(coding_declaration(b"\n# coding=utf8\n").as_deref(), Some("utf8"));
    }

    #[test]
    fn test_coding_declaration_must_lead() {
        assert_eq!(coding_declaration(b"import os\n# coding: utf-8\n"), None);
        assert_eq!(coding_declaration(b"# one\n# two\n# coding: utf-8\n"), None);
        assert_eq!(coding_declaration(b"x = '# coding: utf-8'\n"), None);
    }

    #[test]
    fn test_decode() {
        let (text, consumed) = Codec::default().decode(CODEC_IN_ACTION.as_bytes()).unwrap();
        assert_eq!(text, DECODED);
        assert_eq!(consumed, CODEC_IN_ACTION.len());
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        assert!(matches!(Codec::default().decode(b"x = '\xff'\n"), Err(Error::Utf8(_))));
    }

    #[test]
    fn test_registry_lookup_is_normalized() {
        let mut registry = CodecRegistry::new();
        assert!(registry.register(Codec::default()).is_none());
        assert!(registry.lookup("Experimental_Late_Bound_Defaults").is_some());
        assert!(registry.register(Codec::default()).is_some());
        assert!(registry.unregister(CODEC_NAME).is_some());
        assert!(registry.lookup(CODEC_NAME).is_none());
    }

    #[test]
    fn test_registry_decode_source() {
        let mut registry = CodecRegistry::new();
        let plain = "# -*- coding: utf-8 -*-\ndef f(a => (1)): pass\n";
        assert_eq!(registry.decode_source(plain.as_bytes()).unwrap(), plain);
        assert!(matches!(
            registry.decode_source(CODEC_IN_ACTION.as_bytes()),
            Err(Error::UnknownCodec(name)) if name == CODEC_NAME
        ));
        registry.register(Codec::default());
        assert_eq!(registry.decode_source(CODEC_IN_ACTION.as_bytes()).unwrap(), DECODED);
    }

    #[test]
    fn test_global_registration() {
        register();
        assert!(lookup(CODEC_NAME).is_some());
        assert_eq!(decode_source(CODEC_IN_ACTION.as_bytes()).unwrap(), DECODED);
        assert!(unregister());
        assert!(!unregister());
        assert!(matches!(
            decode_source(CODEC_IN_ACTION.as_bytes()),
            Err(Error::UnknownCodec(_))
        ));
    }

    #[test]
    fn test_decoding_reader() {
        let mut reader = DecodingReader::with_codec(CODEC_IN_ACTION.as_bytes(), Codec::default());
        let mut output = String::new();
        reader.read_to_string(&mut output).unwrap();
        assert_eq!(output, DECODED);
    }

    #[test]
    fn test_decoding_reader_small_reads() {
        let mut reader = DecodingReader::with_codec(CODEC_IN_ACTION.as_bytes(), Codec::default());
        let mut output = Vec::new();
        let mut chunk = [0u8; 7];
        loop {
            let n = reader.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            output.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(String::from_utf8(output).unwrap(), DECODED);
    }

    #[test]
    fn test_decoding_reader_error() {
        let mut reader = DecodingReader::with_codec(&b"def f(a => ()):\n    pass\n"[..], Codec::default());
        let err = reader.read_to_string(&mut String::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
