//! Statistics collection collaborator
//!
//! The agent only schedules collection; measurement itself (cgroup parsing
//! or container-API sampling, depending on `container.stats-type`) lives
//! behind this interface.

use async_trait::async_trait;
use tracing::debug;

use crate::config::StatsType;
use crate::types::ContainerId;

/// Periodic node/container statistics collector.
#[async_trait]
pub trait StatCollector: Send + Sync {
    async fn collect_node_stat(&self) -> crate::Result<()>;

    async fn collect_container_stat(&self, container_id: &ContainerId) -> crate::Result<()>;
}

/// Collector stub for deployments without a metrics sink and for tests.
pub struct NullStatCollector {
    mode: StatsType,
}

impl NullStatCollector {
    pub fn new(mode: StatsType) -> Self {
        Self { mode }
    }
}

#[async_trait]
impl StatCollector for NullStatCollector {
    async fn collect_node_stat(&self) -> crate::Result<()> {
        debug!(mode = ?self.mode, "node stat collection skipped");
        Ok(())
    }

    async fn collect_container_stat(&self, container_id: &ContainerId) -> crate::Result<()> {
        debug!(mode = ?self.mode, %container_id, "container stat collection skipped");
        Ok(())
    }
}
