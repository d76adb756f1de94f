//! harp-compile-cache: persistent compilation cache for accelerator compilers
//!
//! Compiling a module for an accelerator can take minutes. This crate sits in
//! front of a compiler backend and stores its executables keyed by a
//! fingerprint of everything that influences the result, so identical
//! requests skip compilation.
//!
//! # Architecture
//!
//! - **config**: process-wide knobs, read from the environment or a file
//! - **options**: builds validated [`CompileOptions`] from a request
//! - **compiler**: the [`Backend`] trait and the raw compile call
//! - **cache**: key derivation plus in-memory and on-disk stores
//! - **orchestrator**: compile-or-get-cached policy
//! - **dump** / **metrics**: IR dumps and duration events
//!
//! ```
//! use std::sync::Arc;
//! use harp_compile_cache::prelude::*;
//!
//! let cache = Arc::new(CompilationCache::with_store(Arc::new(InMemoryStore::new())));
//! let orchestrator = CompileOrchestrator::new(CompilerConfig::default(), cache);
//! assert!(orchestrator.uses_compilation_cache(&Platform::Gpu));
//! assert!(!orchestrator.uses_compilation_cache(&Platform::Cpu));
//! ```

// ============================================================================
// Core Modules
// ============================================================================

pub mod cache;
pub mod compiler;
pub mod config;
pub mod device;
pub mod error;
pub mod module;
pub mod options;
pub mod orchestrator;
pub mod profile;

// ============================================================================
// Side Channels
// ============================================================================

pub mod dump;
pub mod metrics;

// ============================================================================
// Re-exports
// ============================================================================

pub use cache::{CacheKey, CacheStore, CompilationCache, DiskStore, InMemoryStore};
pub use compiler::{Backend, CompileInput, HostCallback, backend_compile};
pub use config::CompilerConfig;
pub use device::{Device, DeviceAssignment, DeviceId, Platform};
pub use error::{BoxError, CacheError, ConfigError, Error, Result};
pub use module::{IrModule, TextModule};
pub use options::{CompileOptions, CompileOptionsBuilder, CompileOptionsRequest};
pub use orchestrator::{CompileOrchestrator, OrchestratorStats};

// ============================================================================
// Prelude
// ============================================================================

/// Prelude module with commonly used types and traits
pub mod prelude {
    // Configuration and options
    pub use crate::config::CompilerConfig;
    pub use crate::options::{
        CompileOptions, CompileOptionsBuilder, CompileOptionsRequest, DeviceAssignmentInput,
    };

    // Compiler seam
    pub use crate::compiler::{Backend, CompileInput, HostCallback};
    pub use crate::device::{Device, DeviceAssignment, Platform};
    pub use crate::module::{IrModule, TextModule};

    // Cache
    pub use crate::cache::{CacheStore, CompilationCache, DiskStore, InMemoryStore};
    pub use crate::orchestrator::CompileOrchestrator;

    // Errors
    pub use crate::error::{Error, Result};
}
