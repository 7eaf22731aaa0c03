//! Structured throughput/elapsed metrics emitted at the end of a backup or
//! restore run (§4.11) — logged, not persisted anywhere.

use b2s_api_types::ManifestKind;
use b2s_tools::format::render_throughput;

pub struct RunMetrics<'a> {
    pub subvol: &'a str,
    pub kind: ManifestKind,
    pub total_bytes: u64,
    pub elapsed_seconds: f64,
}

impl RunMetrics<'_> {
    fn throughput(&self) -> String {
        let bytes_per_sec = if self.elapsed_seconds > 0.0 {
            self.total_bytes as f64 / self.elapsed_seconds
        } else {
            self.total_bytes as f64
        };
        render_throughput(bytes_per_sec)
    }
}

/// Logs one `backup` completion record.
pub fn backup_metrics(metrics: &RunMetrics<'_>) {
    log::info!(
        "backup_metrics subvol={} kind={} total_bytes={} elapsed={:.1}s throughput={}",
        metrics.subvol,
        metrics.kind,
        metrics.total_bytes,
        metrics.elapsed_seconds,
        metrics.throughput()
    );
}

/// Logs one `restore` completion record.
pub fn restore_metrics(metrics: &RunMetrics<'_>) {
    log::info!(
        "restore_metrics subvol={} kind={} total_bytes={} elapsed={:.1}s throughput={}",
        metrics.subvol,
        metrics.kind,
        metrics.total_bytes,
        metrics.elapsed_seconds,
        metrics.throughput()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_handles_zero_elapsed_without_dividing_by_zero() {
        let m = RunMetrics {
            subvol: "data",
            kind: ManifestKind::Full,
            total_bytes: 1024,
            elapsed_seconds: 0.0,
        };
        assert!(!m.throughput().is_empty());
    }

    #[test]
    fn throughput_renders_mib_for_typical_run() {
        let m = RunMetrics {
            subvol: "data",
            kind: ManifestKind::Incremental,
            total_bytes: 100 * 1024 * 1024,
            elapsed_seconds: 20.0,
        };
        assert_eq!(m.throughput(), "5.0 MiB/s");
    }
}
