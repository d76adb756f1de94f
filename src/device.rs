//! Devices and device assignments
//!
//! A [`DeviceAssignment`] maps each (replica, partition) pair to a physical
//! device id. It is always a rectangular `num_replicas x num_partitions` grid.

use std::fmt;

use ndarray::{Array2, ArrayD, Ix2};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Physical device identifier
pub type DeviceId = i64;

/// Accelerator platform of a backend or device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    Cpu,
    Gpu,
    Tpu,
    Other(String),
}

impl Platform {
    /// Lowercase platform name ("cpu", "gpu", "tpu", ...)
    pub fn name(&self) -> &str {
        match self {
            Platform::Cpu => "cpu",
            Platform::Gpu => "gpu",
            Platform::Tpu => "tpu",
            Platform::Other(name) => name,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&str> for Platform {
    fn from(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "cpu" => Platform::Cpu,
            "gpu" | "cuda" | "rocm" => Platform::Gpu,
            "tpu" => Platform::Tpu,
            other => Platform::Other(other.to_string()),
        }
    }
}

/// A physical device visible to a backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub platform: Platform,
    /// Hardware kind, e.g. "TPU v4" or "NVIDIA A100"
    pub kind: String,
}

impl Device {
    pub fn new(id: DeviceId, platform: Platform, kind: impl Into<String>) -> Self {
        Self {
            id,
            platform,
            kind: kind.into(),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.id)
    }
}

/// Anything that can stand in for a device inside a device assignment
pub trait AsDeviceId {
    fn device_id(&self) -> DeviceId;
}

impl AsDeviceId for DeviceId {
    fn device_id(&self) -> DeviceId {
        *self
    }
}

impl AsDeviceId for Device {
    fn device_id(&self) -> DeviceId {
        self.id
    }
}

impl<T: AsDeviceId> AsDeviceId for &T {
    fn device_id(&self) -> DeviceId {
        (**self).device_id()
    }
}

/// Validated replica x partition grid of device ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAssignment {
    grid: Array2<DeviceId>,
}

impl DeviceAssignment {
    /// Create an assignment from an id grid of any rank-2 shape
    pub fn create(ids: ArrayD<DeviceId>) -> Result<Self, ConfigError> {
        let shape = ids.shape().to_vec();
        let grid = ids
            .into_dimensionality::<Ix2>()
            .map_err(|_| {
                ConfigError::Internal(format!("device assignment of shape {:?} is not 2-D", shape))
            })?;
        Ok(Self { grid })
    }

    /// Create an assignment from nested rows; rows must all be the same length
    pub fn from_rows(rows: &[Vec<DeviceId>]) -> Result<Self, ConfigError> {
        let width = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|row| row.len() != width) {
            return Err(ConfigError::RaggedDeviceAssignment(format!("{:?}", rows)));
        }
        let flat: Vec<DeviceId> = rows.iter().flatten().copied().collect();
        let grid = Array2::from_shape_vec((rows.len(), width), flat)
            .map_err(|e| ConfigError::RaggedDeviceAssignment(e.to_string()))?;
        Ok(Self { grid })
    }

    /// Number of replicas (rows)
    pub fn replica_count(&self) -> usize {
        self.grid.nrows()
    }

    /// Number of partitions per replica (columns)
    pub fn computation_count(&self) -> usize {
        self.grid.ncols()
    }

    /// Device id for a replica/partition pair
    pub fn get(&self, replica: usize, partition: usize) -> Option<DeviceId> {
        self.grid.get((replica, partition)).copied()
    }

    pub fn as_array(&self) -> &Array2<DeviceId> {
        &self.grid
    }
}

impl fmt::Display for DeviceAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{IxDyn, array};

    #[test]
    fn test_platform_display_and_parse() {
        assert_eq!(Platform::Tpu.to_string(), "tpu");
        assert_eq!(Platform::from("GPU"), Platform::Gpu);
        assert_eq!(Platform::from("cuda"), Platform::Gpu);
        assert_eq!(Platform::from("metal"), Platform::Other("metal".to_string()));
    }

    #[test]
    fn test_device_as_id() {
        let device = Device::new(3, Platform::Gpu, "A100");
        assert_eq!(device.device_id(), 3);
        assert_eq!((&device).device_id(), 3);
        assert_eq!(7i64.device_id(), 7);
        assert_eq!(device.to_string(), "gpu:3");
    }

    #[test]
    fn test_create_counts() {
        let ids = array![[0i64, 1], [2, 3], [4, 5]].into_dyn();
        let assignment = DeviceAssignment::create(ids).unwrap();
        assert_eq!(assignment.replica_count(), 3);
        assert_eq!(assignment.computation_count(), 2);
        assert_eq!(assignment.get(1, 1), Some(3));
        assert_eq!(assignment.get(3, 0), None);
    }

    #[test]
    fn test_create_rejects_1d() {
        let ids = ArrayD::from_shape_vec(IxDyn(&[4]), vec![0i64, 1, 2, 3]).unwrap();
        assert!(DeviceAssignment::create(ids).is_err());
    }

    #[test]
    fn test_from_rows() {
        let assignment = DeviceAssignment::from_rows(&[vec![0, 1], vec![2, 3]]).unwrap();
        assert_eq!(assignment.replica_count(), 2);
        assert_eq!(assignment.computation_count(), 2);

        let ragged = DeviceAssignment::from_rows(&[vec![0, 1], vec![2]]);
        assert!(matches!(ragged, Err(ConfigError::RaggedDeviceAssignment(_))));
    }
}
