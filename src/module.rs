//! IR modules handed to the compiler
//!
//! The cache never inspects a module's structure. It only needs the symbolic
//! name (for logs and dump file names), a readable text form (for dumps) and a
//! stable binary form (for compilation and cache keys).

use std::fmt;

/// A compiler input program
pub trait IrModule: Send + Sync {
    /// Symbolic name of the module (its `sym_name`)
    fn name(&self) -> &str;

    /// Human-readable text form including debug info
    fn to_text(&self) -> String;

    /// Compact binary form; identical modules must produce identical bytes
    fn to_bytecode(&self) -> Vec<u8>;
}

/// Module held as its textual IR
///
/// Bytecode is the UTF-8 text preceded by a magic tag, which is stable and
/// sufficient for backends that parse the textual form themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextModule {
    name: String,
    text: String,
}

/// Magic prefix of [`TextModule`] bytecode
pub const TEXT_BYTECODE_MAGIC: &[u8; 4] = b"HIR\x01";

impl TextModule {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    /// Parse a module, taking its name from the first `@name` symbol
    ///
    /// Falls back to `fallback_name` when no symbol is present.
    pub fn parse(text: impl Into<String>, fallback_name: &str) -> Self {
        let text = text.into();
        let name = find_sym_name(&text).unwrap_or(fallback_name).to_string();
        Self { name, text }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Decode bytecode produced by [`IrModule::to_bytecode`]
    pub fn from_bytecode(name: impl Into<String>, bytes: &[u8]) -> Option<Self> {
        let body = bytes.strip_prefix(TEXT_BYTECODE_MAGIC.as_slice())?;
        let text = String::from_utf8(body.to_vec()).ok()?;
        Some(Self::new(name, text))
    }
}

fn find_sym_name(text: &str) -> Option<&str> {
    let line = text.lines().find(|l| l.trim_start().starts_with("module @"))?;
    let rest = line.trim_start().strip_prefix("module @")?;
    let end = rest
        .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.' || c == '-'))
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

impl IrModule for TextModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn to_text(&self) -> String {
        self.text.clone()
    }

    fn to_bytecode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(TEXT_BYTECODE_MAGIC.len() + self.text.len());
        bytes.extend_from_slice(TEXT_BYTECODE_MAGIC);
        bytes.extend_from_slice(self.text.as_bytes());
        bytes
    }
}

impl fmt::Display for TextModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
