//! Native compiler wrapper
//!
//! A [`Backend`] is the opaque accelerator compiler. [`backend_compile`] is the
//! one place the (expensive) native compile entry point is called from.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::device::Platform;
use crate::error::{BoxError, Error, Result};
use crate::module::IrModule;
use crate::options::CompileOptions;

/// Program representation handed to the native compiler
pub enum CompileInput<'a> {
    /// The module object itself, for backends that accept it directly
    Module(&'a dyn IrModule),
    /// Serialized module bytecode
    Bytecode(Vec<u8>),
}

impl fmt::Debug for CompileInput<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileInput::Module(module) => write!(f, "Module({})", module.name()),
            CompileInput::Bytecode(bytes) => write!(f, "Bytecode({} bytes)", bytes.len()),
        }
    }
}

/// Host-side code reachable from a compiled program (debug prints, breakpoints)
#[derive(Clone)]
pub struct HostCallback {
    name: String,
    handle: Arc<dyn Any + Send + Sync>,
}

impl HostCallback {
    pub fn new(name: impl Into<String>, handle: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.handle
    }
}

impl fmt::Debug for HostCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCallback").field("name", &self.name).finish()
    }
}

/// An accelerator compiler client
pub trait Backend: Send + Sync {
    /// Loaded executable produced by this backend
    type Executable: Send + Sync;

    /// Platform this backend targets
    fn platform(&self) -> Platform;

    /// Backend version string; part of the cache key
    fn platform_version(&self) -> String {
        String::new()
    }

    /// Whether the module must be serialized before compilation
    fn needs_str_ir(&self) -> bool {
        true
    }

    /// Compile a program
    fn compile(
        &self,
        input: CompileInput<'_>,
        options: &CompileOptions,
    ) -> Result<Self::Executable, BoxError>;

    /// Compile a program that calls back into the host
    ///
    /// Backends without host callback support keep the default, which fails.
    fn compile_with_host_callbacks(
        &self,
        input: CompileInput<'_>,
        options: &CompileOptions,
        host_callbacks: &[HostCallback],
    ) -> Result<Self::Executable, BoxError> {
        let _ = (input, options);
        Err(format!(
            "{} backend does not support host callbacks ({} given)",
            self.platform(),
            host_callbacks.len()
        )
        .into())
    }

    /// Serialize an executable for the persistent cache
    fn serialize_executable(&self, executable: &Self::Executable) -> Result<Vec<u8>, BoxError>;

    /// Load an executable previously produced by [`Backend::serialize_executable`]
    fn deserialize_executable(
        &self,
        bytes: &[u8],
        options: &CompileOptions,
    ) -> Result<Self::Executable, BoxError>;
}

/// Compile `module` with `backend`
///
/// Errors from the native compiler are returned as [`Error::Compile`]
/// unchanged; they are never retried.
pub fn backend_compile<B: Backend + ?Sized>(
    backend: &B,
    module: &dyn IrModule,
    options: &CompileOptions,
    host_callbacks: &[HostCallback],
) -> Result<B::Executable> {
    let input = if backend.needs_str_ir() {
        CompileInput::Bytecode(module.to_bytecode())
    } else {
        CompileInput::Module(module)
    };

    log::debug!(
        "Compiling '{}' for {} ({:?}, {} host callbacks)",
        module.name(),
        backend.platform(),
        input,
        host_callbacks.len()
    );

    let result = if host_callbacks.is_empty() {
        backend.compile(input, options)
    } else {
        backend.compile_with_host_callbacks(input, options, host_callbacks)
    };
    result.map_err(Error::Compile)
}
