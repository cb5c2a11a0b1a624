use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::warn;

use crate::error::ReinitStep;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub const PENDING_TO_INITIATED: &str = "pending_to_initiated";
pub const INITIATED_TO_COMPLETE: &str = "initiated_to_complete";

const LATENCY_BUCKETS_MS: &[f64] = &[
    10.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0, 60_000.0,
];

/// Failover and liveness collectors. Each instance owns its collectors so
/// tests can read them in isolation; [`FailoverMetrics::registered`] also
/// exposes them through [`REGISTRY`].
#[derive(Clone)]
pub struct FailoverMetrics {
    reinit_failures: IntCounterVec,
    signals: IntCounterVec,
    latency: HistogramVec,
    liveness_timeouts: IntCounterVec,
}

impl Default for FailoverMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FailoverMetrics {
    pub fn new() -> Self {
        let reinit_failures = IntCounterVec::new(
            Opts::new(
                "failover_reinit_failure_total",
                "active region reinitialisation sub-steps that failed",
            ),
            &["step"],
        )
        .unwrap();
        let signals = IntCounterVec::new(
            Opts::new(
                "failover_signal_total",
                "failover signals handled by the sequencer by outcome",
            ),
            &["signal", "outcome"],
        )
        .unwrap();
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "failover_latency_ms",
                "latency between failover lifecycle signals",
            )
            .buckets(LATENCY_BUCKETS_MS.to_vec()),
            &["phase"],
        )
        .unwrap();
        let liveness_timeouts = IntCounterVec::new(
            Opts::new(
                "liveness_timeout_total",
                "liveness ack deadlines missed by connection role",
            ),
            &["role"],
        )
        .unwrap();
        Self {
            reinit_failures,
            signals,
            latency,
            liveness_timeouts,
        }
    }

    /// New collectors, also registered with the process-wide registry.
    pub fn registered() -> Self {
        let metrics = Self::new();
        if let Err(err) = metrics.register(&REGISTRY) {
            warn!(error = %err, "failover metrics already registered");
        }
        metrics
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.reinit_failures.clone()))?;
        registry.register(Box::new(self.signals.clone()))?;
        registry.register(Box::new(self.latency.clone()))?;
        registry.register(Box::new(self.liveness_timeouts.clone()))?;
        Ok(())
    }

    pub fn record_reinit_failure(&self, step: ReinitStep) {
        self.reinit_failures.with_label_values(&[step.as_str()]).inc();
    }

    pub fn record_signal(&self, signal: &str, outcome: &str) {
        self.signals.with_label_values(&[signal, outcome]).inc();
    }

    pub fn observe_latency(&self, phase: &str, elapsed: Duration) {
        self.latency
            .with_label_values(&[phase])
            .observe(elapsed.as_secs_f64() * 1_000.0);
    }

    pub fn record_liveness_timeout(&self, role: &str) {
        self.liveness_timeouts.with_label_values(&[role]).inc();
    }

    pub fn reinit_failures(&self, step: ReinitStep) -> u64 {
        self.reinit_failures.with_label_values(&[step.as_str()]).get()
    }

    pub fn signals(&self, signal: &str, outcome: &str) -> u64 {
        self.signals.with_label_values(&[signal, outcome]).get()
    }

    pub fn latency_samples(&self, phase: &str) -> u64 {
        self.latency.with_label_values(&[phase]).get_sample_count()
    }

    pub fn latency_sum_ms(&self, phase: &str) -> f64 {
        self.latency.with_label_values(&[phase]).get_sample_sum()
    }

    pub fn liveness_timeouts(&self, role: &str) -> u64 {
        self.liveness_timeouts.with_label_values(&[role]).get()
    }
}

/// Text exposition of everything in `registry`.
pub fn gather(registry: &Registry) -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %err, "metrics encode error");
    }
    buffer
}
