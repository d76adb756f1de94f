//! Latest FDO profile version lookup
//!
//! The options builder asks a [`ProfileVersionProvider`] for the newest
//! feedback-directed-optimization profile version when no explicit version is
//! configured. Deployments that host profiles plug in their own provider.

use std::sync::Arc;

/// Version meaning "no profile, do not try to fetch one later"
pub const NO_PROFILE_DONT_RETRIEVE: i64 = -1;

/// Source of the latest FDO profile version
pub trait ProfileVersionProvider: Send + Sync {
    fn latest_profile_version(&self) -> i64;
}

impl<F> ProfileVersionProvider for F
where
    F: Fn() -> i64 + Send + Sync,
{
    fn latest_profile_version(&self) -> i64 {
        self()
    }
}

/// Provider used when nothing else is configured; always reports no profile
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProfile;

impl ProfileVersionProvider for NoProfile {
    fn latest_profile_version(&self) -> i64 {
        NO_PROFILE_DONT_RETRIEVE
    }
}

/// Provider returning a fixed version
#[derive(Debug, Clone, Copy)]
pub struct FixedProfileVersion(pub i64);

impl ProfileVersionProvider for FixedProfileVersion {
    fn latest_profile_version(&self) -> i64 {
        self.0
    }
}

/// Shared handle to a provider
pub type SharedProfileProvider = Arc<dyn ProfileVersionProvider>;

pub fn default_provider() -> SharedProfileProvider {
    Arc::new(NoProfile)
}
