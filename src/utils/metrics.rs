// Process-wide metrics: counters, per-provider breakdown, latency percentiles
//
// Counters are lock-free atomics; the latency reservoir sits behind a
// parking_lot RwLock and is capped so an unbounded run cannot grow it.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const LATENCY_RESERVOIR_CAP: usize = 10_000;

#[derive(Default)]
struct ProviderCounters {
    calls: AtomicU64,
    failures: AtomicU64,
}

pub struct Metrics {
    started_at: Instant,
    api_calls_total: AtomicU64,
    api_calls_failed: AtomicU64,
    batches_total: AtomicU64,
    images_processed: AtomicU64,
    images_failed: AtomicU64,
    latencies_ms: RwLock<Vec<f64>>,
    per_provider: DashMap<String, ProviderCounters>,
    endpoint_hits: DashMap<String, AtomicU64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderCallStats {
    pub calls: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub api_calls_total: u64,
    pub api_calls_failed: u64,
    pub batches_total: u64,
    pub images_processed: u64,
    pub images_failed: u64,
    pub latency_avg_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub per_provider: std::collections::HashMap<String, ProviderCallStats>,
    pub endpoint_hits: std::collections::HashMap<String, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            api_calls_total: AtomicU64::new(0),
            api_calls_failed: AtomicU64::new(0),
            batches_total: AtomicU64::new(0),
            images_processed: AtomicU64::new(0),
            images_failed: AtomicU64::new(0),
            latencies_ms: RwLock::new(Vec::new()),
            per_provider: DashMap::new(),
            endpoint_hits: DashMap::new(),
        }
    }

    pub fn record_api_call(&self, provider: &str, success: bool, latency: Duration) {
        self.api_calls_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.api_calls_failed.fetch_add(1, Ordering::Relaxed);
        }

        let counters = self.per_provider.entry(provider.to_string()).or_default();
        counters.calls.fetch_add(1, Ordering::Relaxed);
        if !success {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        drop(counters);

        let mut latencies = self.latencies_ms.write();
        if latencies.len() >= LATENCY_RESERVOIR_CAP {
            latencies.remove(0);
        }
        latencies.push(latency.as_secs_f64() * 1_000.0);
    }

    pub fn record_batch(&self, images: usize, failed: usize) {
        self.batches_total.fetch_add(1, Ordering::Relaxed);
        self.images_processed
            .fetch_add(images as u64, Ordering::Relaxed);
        self.images_failed.fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn record_endpoint(&self, path: &str) {
        self.endpoint_hits
            .entry(path.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let rank = (p * (sorted.len() - 1) as f64).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut sorted = self.latencies_ms.read().clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let avg = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };

        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            api_calls_total: self.api_calls_total.load(Ordering::Relaxed),
            api_calls_failed: self.api_calls_failed.load(Ordering::Relaxed),
            batches_total: self.batches_total.load(Ordering::Relaxed),
            images_processed: self.images_processed.load(Ordering::Relaxed),
            images_failed: self.images_failed.load(Ordering::Relaxed),
            latency_avg_ms: avg,
            latency_p50_ms: Self::percentile(&sorted, 0.50),
            latency_p95_ms: Self::percentile(&sorted, 0.95),
            latency_p99_ms: Self::percentile(&sorted, 0.99),
            per_provider: self
                .per_provider
                .iter()
                .map(|e| {
                    (
                        e.key().clone(),
                        ProviderCallStats {
                            calls: e.calls.load(Ordering::Relaxed),
                            failures: e.failures.load(Ordering::Relaxed),
                        },
                    )
                })
                .collect(),
            endpoint_hits: self
                .endpoint_hits
                .iter()
                .map(|e| (e.key().clone(), e.load(Ordering::Relaxed)))
                .collect(),
        }
    }

    /// Prometheus text exposition of the snapshot.
    pub fn to_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::new();

        out.push_str("# TYPE stockmeta_uptime_seconds gauge\n");
        out.push_str(&format!("stockmeta_uptime_seconds {}\n", snap.uptime_secs));
        out.push_str("# TYPE stockmeta_api_calls_total counter\n");
        out.push_str(&format!("stockmeta_api_calls_total {}\n", snap.api_calls_total));
        out.push_str("# TYPE stockmeta_api_calls_failed_total counter\n");
        out.push_str(&format!(
            "stockmeta_api_calls_failed_total {}\n",
            snap.api_calls_failed
        ));
        out.push_str("# TYPE stockmeta_batches_total counter\n");
        out.push_str(&format!("stockmeta_batches_total {}\n", snap.batches_total));
        out.push_str("# TYPE stockmeta_images_processed_total counter\n");
        out.push_str(&format!(
            "stockmeta_images_processed_total {}\n",
            snap.images_processed
        ));
        out.push_str("# TYPE stockmeta_images_failed_total counter\n");
        out.push_str(&format!("stockmeta_images_failed_total {}\n", snap.images_failed));

        out.push_str("# TYPE stockmeta_api_latency_ms summary\n");
        out.push_str(&format!(
            "stockmeta_api_latency_ms{{quantile=\"0.5\"}} {:.3}\n",
            snap.latency_p50_ms
        ));
        out.push_str(&format!(
            "stockmeta_api_latency_ms{{quantile=\"0.95\"}} {:.3}\n",
            snap.latency_p95_ms
        ));
        out.push_str(&format!(
            "stockmeta_api_latency_ms{{quantile=\"0.99\"}} {:.3}\n",
            snap.latency_p99_ms
        ));

        out.push_str("# TYPE stockmeta_provider_calls_total counter\n");
        for (provider, stats) in &snap.per_provider {
            out.push_str(&format!(
                "stockmeta_provider_calls_total{{provider=\"{provider}\"}} {}\n",
                stats.calls
            ));
            out.push_str(&format!(
                "stockmeta_provider_failures_total{{provider=\"{provider}\"}} {}\n",
                stats.failures
            ));
        }

        out.push_str("# TYPE stockmeta_endpoint_hits_total counter\n");
        for (path, hits) in &snap.endpoint_hits {
            out.push_str(&format!(
                "stockmeta_endpoint_hits_total{{path=\"{path}\"}} {hits}\n"
            ));
        }

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_percentiles() {
        let metrics = Metrics::new();
        for i in 1..=100u64 {
            metrics.record_api_call("gemini", i % 10 != 0, Duration::from_millis(i));
        }
        metrics.record_batch(100, 10);

        let snap = metrics.snapshot();
        assert_eq!(snap.api_calls_total, 100);
        assert_eq!(snap.api_calls_failed, 10);
        assert_eq!(snap.batches_total, 1);
        assert_eq!(snap.images_processed, 100);
        assert_eq!(snap.per_provider["gemini"].calls, 100);
        assert!(snap.latency_p50_ms >= 45.0 && snap.latency_p50_ms <= 55.0);
        assert!(snap.latency_p99_ms >= 95.0);
        assert!(snap.latency_p95_ms <= snap.latency_p99_ms);
    }

    #[test]
    fn prometheus_output_names_providers() {
        let metrics = Metrics::new();
        metrics.record_api_call("openrouter", true, Duration::from_millis(5));
        metrics.record_endpoint("/generate");

        let text = metrics.to_prometheus();
        assert!(text.contains("stockmeta_api_calls_total 1"));
        assert!(text.contains("provider=\"openrouter\""));
        assert!(text.contains("path=\"/generate\""));
    }
}
