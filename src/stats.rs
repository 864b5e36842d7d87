use crate::conntable;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    pub cpu_usage_percent: u8,
    pub memory_usage_percent: u8,
    pub active_listening_ports: usize,
}

/// Sample host CPU, memory and the number of distinct listening ports.
///
/// CPU usage needs two refreshes, so this takes at least
/// `sysinfo::MINIMUM_CPU_UPDATE_INTERVAL`.
pub async fn collect() -> SystemStats {
    let (cpu, memory) = sample_host().await;

    let active_listening_ports = match tokio::task::spawn_blocking(conntable::snapshot).await {
        Ok(Ok(table)) => table.listening_ports().len(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "connection table unavailable for stats");
            0
        }
        Err(e) => {
            tracing::warn!(error = %e, "connection table task failed");
            0
        }
    };

    SystemStats {
        cpu_usage_percent: cpu,
        memory_usage_percent: memory,
        active_listening_ports,
    }
}

async fn sample_host() -> (u8, u8) {
    let mut system = sysinfo::System::new();
    system.refresh_cpu_usage();
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    system.refresh_cpu_usage();
    system.refresh_memory();

    let cpu = to_percent(f64::from(system.global_cpu_usage()));
    let memory = ratio_percent(system.used_memory(), system.total_memory());
    (cpu, memory)
}

fn to_percent(value: f64) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

fn ratio_percent(used: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    to_percent(used as f64 * 100.0 / total as f64)
}
