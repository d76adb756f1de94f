//! Compile options
//!
//! [`CompileOptionsBuilder`] derives an immutable [`CompileOptions`] record
//! from a [`CompileOptionsRequest`] and the process-wide [`CompilerConfig`].
//!
//! # Example
//!
//! ```
//! use harp_compile_cache::config::CompilerConfig;
//! use harp_compile_cache::options::{CompileOptionsBuilder, CompileOptionsRequest};
//!
//! let config = CompilerConfig::default();
//! let request = CompileOptionsRequest::builder()
//!     .num_replicas(2)
//!     .num_partitions(1)
//!     .device_assignment(vec![0i64, 1])
//!     .build();
//! let options = CompileOptionsBuilder::new(&config).build(request).unwrap();
//! assert_eq!(options.device_assignment.unwrap().replica_count(), 2);
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::config::CompilerConfig;
use crate::device::{AsDeviceId, DeviceAssignment, DeviceId};
use crate::error::ConfigError;
use crate::profile::{self, NO_PROFILE_DONT_RETRIEVE, ProfileVersionProvider, SharedProfileProvider};

/// Backend optimization level used unless optimizations are disabled
pub const DEFAULT_OPTIMIZATION_LEVEL: u32 = 2;

/// Debug and tuning knobs passed to the backend compiler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugOptions {
    pub backend_optimization_level: u32,
    pub llvm_disable_expensive_passes: bool,
    pub test_all_input_layouts: bool,
    /// CUDA installation used by GPU code generation
    pub cuda_data_dir: Option<PathBuf>,
    /// Directory the backend dumps its own artifacts to; informational only
    pub dump_to: Option<PathBuf>,
}

impl Default for DebugOptions {
    fn default() -> Self {
        Self {
            backend_optimization_level: DEFAULT_OPTIMIZATION_LEVEL,
            llvm_disable_expensive_passes: false,
            test_all_input_layouts: true,
            cuda_data_dir: None,
            dump_to: None,
        }
    }
}

/// Options describing how the executable is built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableBuildOptions {
    pub use_spmd_partitioning: bool,
    pub use_auto_spmd_partitioning: bool,
    pub auto_spmd_partitioning_mesh_shape: Vec<i64>,
    pub auto_spmd_partitioning_mesh_ids: Vec<i64>,
    /// Feedback-directed optimization profile, passed through verbatim
    pub fdo_profile: Option<Vec<u8>>,
    pub debug_options: DebugOptions,
}

impl Default for ExecutableBuildOptions {
    fn default() -> Self {
        Self {
            use_spmd_partitioning: true,
            use_auto_spmd_partitioning: false,
            auto_spmd_partitioning_mesh_shape: Vec::new(),
            auto_spmd_partitioning_mesh_ids: Vec::new(),
            fdo_profile: None,
            debug_options: DebugOptions::default(),
        }
    }
}

/// Complete compile configuration for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileOptions {
    pub num_replicas: usize,
    pub num_partitions: usize,
    pub device_assignment: Option<DeviceAssignment>,
    /// Compiler environment overrides in insertion order
    pub env_option_overrides: Vec<(String, String)>,
    /// FDO profile version; -1 means no profile should be retrieved
    pub profile_version: i64,
    pub executable_build_options: ExecutableBuildOptions,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            num_replicas: 1,
            num_partitions: 1,
            device_assignment: None,
            env_option_overrides: Vec::new(),
            profile_version: 0,
            executable_build_options: ExecutableBuildOptions::default(),
        }
    }
}

/// Device assignment as supplied by the caller, before validation
///
/// Holds a 1-D or 2-D array of device ids. Device objects are converted to
/// their ids on construction.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAssignmentInput(ArrayD<DeviceId>);

impl DeviceAssignmentInput {
    /// Convert an array of devices (or anything exposing an id)
    pub fn from_devices<D: AsDeviceId>(devices: &ArrayD<D>) -> Self {
        Self(devices.map(|d| d.device_id()))
    }

    /// Build a 2-D input from nested rows
    pub fn from_rows(rows: &[Vec<DeviceId>]) -> Result<Self, ConfigError> {
        let assignment = DeviceAssignment::from_rows(rows)?;
        Ok(Self(assignment.as_array().clone().into_dyn()))
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }
}

impl From<ArrayD<DeviceId>> for DeviceAssignmentInput {
    fn from(ids: ArrayD<DeviceId>) -> Self {
        Self(ids)
    }
}

impl From<Vec<DeviceId>> for DeviceAssignmentInput {
    fn from(ids: Vec<DeviceId>) -> Self {
        Self(ndarray::Array1::from(ids).into_dyn())
    }
}

impl From<ndarray::Array2<DeviceId>> for DeviceAssignmentInput {
    fn from(ids: ndarray::Array2<DeviceId>) -> Self {
        Self(ids.into_dyn())
    }
}

/// Parameters of a compile options request
#[derive(Debug, Clone, TypedBuilder)]
pub struct CompileOptionsRequest {
    pub num_replicas: usize,
    pub num_partitions: usize,
    #[builder(default, setter(strip_option, into))]
    pub device_assignment: Option<DeviceAssignmentInput>,
    #[builder(default = true)]
    pub use_spmd_partitioning: bool,
    #[builder(default)]
    pub use_auto_spmd_partitioning: bool,
    #[builder(default, setter(strip_option))]
    pub auto_spmd_partitioning_mesh_shape: Option<Vec<i64>>,
    #[builder(default, setter(strip_option))]
    pub auto_spmd_partitioning_mesh_ids: Option<Vec<i64>>,
    /// Overrides as ordered key/value pairs
    #[builder(default, setter(strip_option))]
    pub env_options_overrides: Option<Vec<(String, String)>>,
    #[builder(default, setter(strip_option))]
    pub fdo_profile: Option<Vec<u8>>,
}

/// Derives [`CompileOptions`] from requests and configuration
#[derive(Clone)]
pub struct CompileOptionsBuilder {
    config: CompilerConfig,
    profile_provider: SharedProfileProvider,
}

impl CompileOptionsBuilder {
    pub fn new(config: &CompilerConfig) -> Self {
        Self {
            config: config.clone(),
            profile_provider: profile::default_provider(),
        }
    }

    /// Replace the latest-profile-version provider
    pub fn with_profile_provider<P: ProfileVersionProvider + 'static>(
        mut self,
        provider: P,
    ) -> Self {
        self.profile_provider = Arc::new(provider);
        self
    }

    /// Replace the provider with an already shared one
    pub fn with_shared_profile_provider(mut self, provider: SharedProfileProvider) -> Self {
        self.profile_provider = provider;
        self
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Build the compile options for a request
    pub fn build(&self, request: CompileOptionsRequest) -> Result<CompileOptions, ConfigError> {
        let CompileOptionsRequest {
            num_replicas,
            num_partitions,
            device_assignment,
            use_spmd_partitioning,
            use_auto_spmd_partitioning,
            auto_spmd_partitioning_mesh_shape,
            auto_spmd_partitioning_mesh_ids,
            env_options_overrides,
            fdo_profile,
        } = request;

        if num_replicas == 0 {
            return Err(ConfigError::InvalidCount {
                what: "num_replicas",
                value: num_replicas,
            });
        }
        if num_partitions == 0 {
            return Err(ConfigError::InvalidCount {
                what: "num_partitions",
                value: num_partitions,
            });
        }

        let mut options = CompileOptions {
            num_replicas,
            num_partitions,
            ..CompileOptions::default()
        };

        let build_options = &mut options.executable_build_options;
        build_options.use_spmd_partitioning = use_spmd_partitioning;
        build_options.use_auto_spmd_partitioning = use_auto_spmd_partitioning;
        if fdo_profile.is_some() {
            build_options.fdo_profile = fdo_profile;
        }
        if use_auto_spmd_partitioning {
            build_options.auto_spmd_partitioning_mesh_shape =
                auto_spmd_partitioning_mesh_shape.unwrap_or_default();
            build_options.auto_spmd_partitioning_mesh_ids =
                auto_spmd_partitioning_mesh_ids.unwrap_or_default();
        }

        if let Some(input) = device_assignment {
            log::debug!(
                "compile options: num_replicas={} num_partitions={} device_assignment={}",
                num_replicas,
                num_partitions,
                input.0
            );
            options.device_assignment =
                Some(normalize_device_assignment(input, num_replicas, num_partitions)?);
        }

        if let Some(overrides) = env_options_overrides {
            options.env_option_overrides = overrides;
        }

        let debug_options = &mut options.executable_build_options.debug_options;
        debug_options.cuda_data_dir = self.config.cuda_data_dir.clone();
        if self.config.disable_most_optimizations {
            debug_options.backend_optimization_level = 0;
            debug_options.llvm_disable_expensive_passes = true;
            debug_options.test_all_input_layouts = false;
        }

        options.profile_version = self.resolve_profile_version();
        Ok(options)
    }

    /// Configured version first, then the provider, then "don't retrieve"
    fn resolve_profile_version(&self) -> i64 {
        let configured = self.config.xla_profile_version;
        if configured > 0 {
            log::debug!("FDO profile: using profile version {} from config", configured);
            return configured;
        }

        let latest = self.profile_provider.latest_profile_version();
        if latest != 0 {
            log::debug!("FDO profile: using profile version {}", latest);
            latest
        } else {
            log::error!("FDO profile: profile version is 0; this should not happen");
            NO_PROFILE_DONT_RETRIEVE
        }
    }
}

fn normalize_device_assignment(
    input: DeviceAssignmentInput,
    num_replicas: usize,
    num_partitions: usize,
) -> Result<DeviceAssignment, ConfigError> {
    let mut ids = input.0;

    // 1-D assignment is a column when there is a single partition
    if ids.ndim() == 1 && num_partitions == 1 {
        ids.insert_axis_inplace(Axis(1));
    }

    let shape = ids.shape().to_vec();
    if shape.len() != 2 || shape[0] != num_replicas || shape[1] != num_partitions {
        return Err(ConfigError::DeviceAssignmentShape {
            actual: shape,
            replicas: num_replicas,
            partitions: num_partitions,
        });
    }

    let assignment = DeviceAssignment::create(ids)?;
    if assignment.replica_count() != num_replicas
        || assignment.computation_count() != num_partitions
    {
        return Err(ConfigError::Internal(format!(
            "device assignment {}x{} disagrees with requested {}x{}",
            assignment.replica_count(),
            assignment.computation_count(),
            num_replicas,
            num_partitions
        )));
    }
    Ok(assignment)
}
