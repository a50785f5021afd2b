// Background host-stats sampler. Refreshes the shared snapshot every 5s;
// /health/detailed reads the cache instead of touching sysinfo inline.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tokio::sync::RwLock;

use crate::state::SystemSnapshot;

const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

pub fn spawn(snapshot: Arc<RwLock<SystemSnapshot>>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut system = System::new();
        loop {
            system.refresh_cpu_usage();
            system.refresh_memory();

            let cpus = system.cpus();
            let cpu_usage_percent = if cpus.is_empty() {
                0.0
            } else {
                cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
            };

            {
                let mut guard = snapshot.write().await;
                guard.cpu_usage_percent = cpu_usage_percent;
                guard.memory_used_mb = system.used_memory() as f64 / 1024.0 / 1024.0;
                guard.memory_total_mb = system.total_memory() as f64 / 1024.0 / 1024.0;
            }

            tokio::time::sleep(REFRESH_INTERVAL).await;
        }
    })
}
