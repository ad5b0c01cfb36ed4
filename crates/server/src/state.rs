// crates/server/src/state.rs
//! Application state for the Axum server.

use std::sync::Arc;
use std::time::Instant;

use charart_core::{AppConfig, JobRunner, ProgressHub};
use charart_relay::{RelayClient, RelayError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::temp::TempDirRegistry;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    pub config: AppConfig,
    pub hub: Arc<ProgressHub>,
    /// Background job runner; every submitted job ends with exactly one close.
    pub runner: Arc<JobRunner>,
    /// `None` when no remote worker is configured.
    pub relay: Option<RelayClient>,
    /// Per-job scratch directories, removed by the hub's cleanup hook.
    pub temp: Arc<TempDirRegistry>,
}

impl AppState {
    /// Build the hub, wire the temp-dir cleanup hook into it, and connect the
    /// relay client if a remote worker is configured.
    pub fn new(config: AppConfig) -> Arc<Self> {
        let hub = Arc::new(ProgressHub::new(config.hub.clone()));
        let temp = Arc::new(TempDirRegistry::new(config.server.temp_root()));
        let hook_dirs = Arc::clone(&temp);
        hub.set_cleanup_hook(move |job_id: &str| {
            hook_dirs.remove(job_id);
        });

        let relay = match RelayClient::new(Arc::clone(&hub), config.relay.clone()) {
            Ok(client) => {
                info!(remote = client.base_url(), "remote worker delegation enabled");
                Some(client)
            }
            Err(RelayError::NotConfigured) => None,
            Err(e) => {
                warn!(error = %e, "remote worker client unavailable");
                None
            }
        };

        Arc::new(Self {
            start_time: Instant::now(),
            runner: Arc::new(JobRunner::new(Arc::clone(&hub))),
            hub,
            relay,
            temp,
            config,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Arc<Self> {
        let mut config = AppConfig::default();
        config.server.temp_dir = Some(std::env::temp_dir().join("charart-server-tests"));
        Self::new(config)
    }

    /// Start the periodic temp-dir sweep. Directories of running jobs are
    /// never swept.
    pub fn spawn_temp_sweeper(&self) -> JoinHandle<()> {
        let runner = Arc::clone(&self.runner);
        Arc::clone(&self.temp).spawn_sweeper(
            self.config.server.temp_retention,
            self.config.server.temp_sweep_interval,
            move |job_id: &str| runner.is_running(job_id),
        )
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
