use crate::types::Origin;
use async_trait::async_trait;
use std::collections::HashSet;

/// Decides which origins may have their reports leave the device.
#[async_trait]
pub trait PermissionOracle: Send + Sync {
    /// Returns the subset of `origins` that are allowed to report.
    async fn allowed_origins(&self, origins: HashSet<Origin>) -> HashSet<Origin>;
}

pub struct AllowAll;

#[async_trait]
impl PermissionOracle for AllowAll {
    async fn allowed_origins(&self, origins: HashSet<Origin>) -> HashSet<Origin> {
        origins
    }
}

/// Allows only a fixed set of origins.
pub struct OriginAllowList {
    allowed: HashSet<Origin>,
}

impl OriginAllowList {
    pub fn new<I: IntoIterator<Item = Origin>>(allowed: I) -> Self {
        OriginAllowList {
            allowed: allowed.into_iter().collect(),
        }
    }
}

#[async_trait]
impl PermissionOracle for OriginAllowList {
    async fn allowed_origins(&self, origins: HashSet<Origin>) -> HashSet<Origin> {
        origins
            .into_iter()
            .filter(|origin| self.allowed.contains(origin))
            .collect()
    }
}
