//! IR dumps for offline debugging
//!
//! Each compile request can write its input module as text to
//! `<dir>/jax_ir<N>_<name>.mlir`, where `N` increases for every dump made
//! through the same counter.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Keep only `[A-Za-z0-9_.() -]`
pub fn make_string_safe_for_filename(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '(' | ')' | ' ' | '-'))
        .collect()
}

/// Writes module text into a dump directory
#[derive(Debug, Clone)]
pub struct IrDumper {
    dir: PathBuf,
    counter: Arc<AtomicUsize>,
}

impl IrDumper {
    /// Dumper with its own counter starting at 0
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_counter(dir, Arc::new(AtomicUsize::new(0)))
    }

    /// Dumper sharing `counter` with other dumpers
    pub fn with_counter(dir: impl Into<PathBuf>, counter: Arc<AtomicUsize>) -> Self {
        Self {
            dir: dir.into(),
            counter,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn counter(&self) -> &Arc<AtomicUsize> {
        &self.counter
    }

    /// File name for dump number `id`
    pub fn file_name(id: usize, module_name: &str) -> String {
        format!("jax_ir{}_{}.mlir", id, make_string_safe_for_filename(module_name))
    }

    /// Write `text` and return the path written
    ///
    /// A number is consumed even when the write fails.
    pub fn dump(&self, module_name: &str, text: &str) -> std::io::Result<PathBuf> {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(Self::file_name(id, module_name));
        std::fs::write(&path, text)?;
        log::debug!("Dumped IR for '{}' to {}", module_name, path.display());
        Ok(path)
    }
}
