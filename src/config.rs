//! Compiler and cache configuration
//!
//! All process-wide switches are collected in [`CompilerConfig`], which is
//! passed to the options builder and the orchestrator at construction.
//!
//! Environment variables read by [`CompilerConfig::from_env`]:
//! - `HARP_DISABLE_MOST_OPTIMIZATIONS`: try not to do much optimization work
//! - `HARP_DUMP_IR_TO`: directory to dump compiler input IR to (empty = off)
//! - `HARP_XLA_PROFILE_VERSION`: explicit FDO profile version (0 = unset)
//! - `HARP_RAISE_PERSISTENT_CACHE_ERRORS`: turn cache faults into hard errors
//! - `HARP_PERSISTENT_CACHE_MIN_COMPILE_TIME_SECS`: admission threshold
//! - `HARP_USE_ORIGINAL_CACHE_KEY_GENERATION`: select the original key scheme
//! - `XLA_FLAGS`: backend compiler flags
//! - `CUDA_PATH`: CUDA installation handed to GPU backends

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::ConfigError;

/// Flag in `XLA_FLAGS` that makes CPU executables cacheable
pub const CPU_RUNTIME_FLAG: &str = "--xla_cpu_use_xla_runtime=true";

/// Process-wide compiler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct CompilerConfig {
    /// Zero the optimization level and skip expensive passes
    #[builder(default)]
    pub disable_most_optimizations: bool,

    /// Directory to which compiler input IR is dumped as text
    #[builder(default, setter(strip_option, into))]
    pub dump_ir_to: Option<PathBuf>,

    /// Explicit FDO profile version; values <= 0 mean unset
    #[builder(default)]
    pub xla_profile_version: i64,

    /// Propagate persistent cache errors instead of warning
    #[builder(default)]
    pub raise_persistent_cache_errors: bool,

    /// Compiles faster than this many seconds are not cached; 0 disables
    #[builder(default)]
    pub persistent_cache_min_compile_time_secs: f64,

    /// Derive cache keys with the original scheme
    #[builder(default)]
    pub use_original_compilation_cache_key_generation: bool,

    /// Raw backend compiler flags (the contents of `XLA_FLAGS`)
    #[builder(default, setter(into))]
    pub backend_flags: String,

    /// CUDA installation directory for GPU backends
    #[builder(default, setter(strip_option, into))]
    pub cuda_data_dir: Option<PathBuf>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CompilerConfig {
    /// Build a configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    ///
    /// Unset and empty variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(v) = get("HARP_DISABLE_MOST_OPTIMIZATIONS") {
            config.disable_most_optimizations = parse_bool("HARP_DISABLE_MOST_OPTIMIZATIONS", &v)?;
        }
        if let Some(v) = get("HARP_DUMP_IR_TO") {
            config.dump_ir_to = Some(PathBuf::from(v));
        }
        if let Some(v) = get("HARP_XLA_PROFILE_VERSION") {
            config.xla_profile_version = v.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: "HARP_XLA_PROFILE_VERSION",
                value: v.clone(),
            })?;
        }
        if let Some(v) = get("HARP_RAISE_PERSISTENT_CACHE_ERRORS") {
            config.raise_persistent_cache_errors =
                parse_bool("HARP_RAISE_PERSISTENT_CACHE_ERRORS", &v)?;
        }
        if let Some(v) = get("HARP_PERSISTENT_CACHE_MIN_COMPILE_TIME_SECS") {
            let secs: f64 = v.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: "HARP_PERSISTENT_CACHE_MIN_COMPILE_TIME_SECS",
                value: v.clone(),
            })?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(ConfigError::InvalidEnv {
                    name: "HARP_PERSISTENT_CACHE_MIN_COMPILE_TIME_SECS",
                    value: v,
                });
            }
            config.persistent_cache_min_compile_time_secs = secs;
        }
        if let Some(v) = get("HARP_USE_ORIGINAL_CACHE_KEY_GENERATION") {
            config.use_original_compilation_cache_key_generation =
                parse_bool("HARP_USE_ORIGINAL_CACHE_KEY_GENERATION", &v)?;
        }
        if let Some(v) = get("XLA_FLAGS") {
            config.backend_flags = v;
        }
        if let Some(v) = get("CUDA_PATH") {
            config.cuda_data_dir = Some(PathBuf::from(v));
        }

        log::debug!("Compiler config: {:?}", config);
        Ok(config)
    }

    /// Load a configuration from a JSON file; missing fields keep defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Whether the backend flags enable the cacheable CPU runtime
    pub fn cpu_cache_enabled(&self) -> bool {
        self.backend_flags.contains(CPU_RUNTIME_FLAG)
    }

    /// The IR dump directory, if dumping is enabled
    pub fn dump_dir(&self) -> Option<&Path> {
        self.dump_ir_to
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            name,
            value: value.to_string(),
        }),
    }
}
