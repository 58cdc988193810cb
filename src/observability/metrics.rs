// Service metrics
//
// Counters, gauges and histograms for:
// - Requests accepted and rejected (busy, exhausted, invalid, unauthorized)
// - Execution statuses (OK, TLE, MLE, RE, SIG, IE)
// - Per-test verdict outcomes
// - Sandbox teardown failures
// - Pool occupancy and evaluation latency

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::types::{ExecutionStatus, Outcome};

/// Counter metric (monotonically increasing)
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64, // upper bound in seconds
    pub count: AtomicU64,
}

/// Histogram metric for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum: AtomicU64, // microseconds
    count: AtomicU64,
}

impl Histogram {
    /// Buckets sized for evaluations: tens of milliseconds to a minute
    pub fn new_latency() -> Self {
        let bucket_bounds = vec![0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

        let buckets = bucket_bounds
            .into_iter()
            .map(|le| HistogramBucket {
                le,
                count: AtomicU64::new(0),
            })
            .collect();

        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 0.0001)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Why a request was turned away before evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Busy,
    Exhausted,
    Invalid,
    Unauthorized,
}

#[derive(Debug)]
pub struct MetricsRegistry {
    pub requests_total: Counter,
    pub evaluations_completed: Counter,

    pub rejected_busy: Counter,
    pub rejected_exhausted: Counter,
    pub rejected_invalid: Counter,
    pub rejected_unauthorized: Counter,
    pub internal_failures: Counter,

    pub executions_ok: Counter,
    pub executions_tle: Counter,
    pub executions_mle: Counter,
    pub executions_re: Counter,
    pub executions_sig: Counter,
    pub executions_ie: Counter,

    pub verdicts_pass: Counter,
    pub verdicts_fail: Counter,
    pub verdicts_error: Counter,
    pub verdicts_timeout: Counter,

    pub acquire_retries: Counter,
    pub teardown_failures: Counter,

    pub active_sandboxes: Gauge,
    pub queued_requests: Gauge,

    pub evaluation_duration: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            requests_total: Counter::new(),
            evaluations_completed: Counter::new(),

            rejected_busy: Counter::new(),
            rejected_exhausted: Counter::new(),
            rejected_invalid: Counter::new(),
            rejected_unauthorized: Counter::new(),
            internal_failures: Counter::new(),

            executions_ok: Counter::new(),
            executions_tle: Counter::new(),
            executions_mle: Counter::new(),
            executions_re: Counter::new(),
            executions_sig: Counter::new(),
            executions_ie: Counter::new(),

            verdicts_pass: Counter::new(),
            verdicts_fail: Counter::new(),
            verdicts_error: Counter::new(),
            verdicts_timeout: Counter::new(),

            acquire_retries: Counter::new(),
            teardown_failures: Counter::new(),

            active_sandboxes: Gauge::new(),
            queued_requests: Gauge::new(),

            evaluation_duration: Histogram::new_latency(),
        }
    }

    pub fn record_execution(&self, status: ExecutionStatus) {
        match status {
            ExecutionStatus::Ok => self.executions_ok.inc(),
            ExecutionStatus::TimeLimit => self.executions_tle.inc(),
            ExecutionStatus::MemoryLimit => self.executions_mle.inc(),
            ExecutionStatus::RuntimeError => self.executions_re.inc(),
            ExecutionStatus::Signaled => self.executions_sig.inc(),
            ExecutionStatus::InternalError => self.executions_ie.inc(),
        }
    }

    pub fn record_verdict(&self, outcome: Outcome) {
        match outcome {
            Outcome::Pass => self.verdicts_pass.inc(),
            Outcome::Fail => self.verdicts_fail.inc(),
            Outcome::Error => self.verdicts_error.inc(),
            Outcome::Timeout => self.verdicts_timeout.inc(),
        }
    }

    pub fn record_rejection(&self, rejection: Rejection) {
        match rejection {
            Rejection::Busy => self.rejected_busy.inc(),
            Rejection::Exhausted => self.rejected_exhausted.inc(),
            Rejection::Invalid => self.rejected_invalid.inc(),
            Rejection::Unauthorized => self.rejected_unauthorized.inc(),
        }
    }

    fn push_counter(output: &mut String, name: &str, help: &str, value: u64) {
        output.push_str(&format!("# HELP testbox_{} {}\n", name, help));
        output.push_str(&format!("# TYPE testbox_{} counter\n", name));
        output.push_str(&format!("testbox_{} {}\n", name, value));
    }

    fn push_labeled(
        output: &mut String,
        name: &str,
        kind: &str,
        help: &str,
        label: &str,
        values: &[(&str, u64)],
    ) {
        output.push_str(&format!("# HELP testbox_{} {}\n", name, help));
        output.push_str(&format!("# TYPE testbox_{} {}\n", name, kind));
        for (value_label, value) in values {
            output.push_str(&format!(
                "testbox_{}{{{}=\"{}\"}} {}\n",
                name, label, value_label, value
            ));
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        Self::push_counter(
            &mut output,
            "requests_total",
            "Evaluation requests received",
            self.requests_total.get(),
        );
        Self::push_counter(
            &mut output,
            "evaluations_completed_total",
            "Evaluations that produced verdicts",
            self.evaluations_completed.get(),
        );
        Self::push_labeled(
            &mut output,
            "requests_rejected_total",
            "counter",
            "Requests rejected before evaluation",
            "reason",
            &[
                ("service_busy", self.rejected_busy.get()),
                ("resource_exhausted", self.rejected_exhausted.get()),
                ("invalid_request", self.rejected_invalid.get()),
                ("unauthorized", self.rejected_unauthorized.get()),
            ],
        );
        Self::push_counter(
            &mut output,
            "internal_failures_total",
            "Requests failed by internal errors",
            self.internal_failures.get(),
        );
        Self::push_labeled(
            &mut output,
            "executions_total",
            "counter",
            "Sandbox executions by status",
            "status",
            &[
                ("OK", self.executions_ok.get()),
                ("TLE", self.executions_tle.get()),
                ("MLE", self.executions_mle.get()),
                ("RE", self.executions_re.get()),
                ("SIG", self.executions_sig.get()),
                ("IE", self.executions_ie.get()),
            ],
        );
        Self::push_labeled(
            &mut output,
            "verdicts_total",
            "counter",
            "Test verdicts by outcome",
            "outcome",
            &[
                ("pass", self.verdicts_pass.get()),
                ("fail", self.verdicts_fail.get()),
                ("error", self.verdicts_error.get()),
                ("timeout", self.verdicts_timeout.get()),
            ],
        );
        Self::push_counter(
            &mut output,
            "acquire_retries_total",
            "Sandbox acquisitions retried after a transient failure",
            self.acquire_retries.get(),
        );
        Self::push_counter(
            &mut output,
            "teardown_failures_total",
            "Sandbox teardowns that left residue",
            self.teardown_failures.get(),
        );

        output.push_str("# HELP testbox_active_sandboxes Sandboxes currently executing\n");
        output.push_str("# TYPE testbox_active_sandboxes gauge\n");
        output.push_str(&format!(
            "testbox_active_sandboxes {}\n",
            self.active_sandboxes.get()
        ));
        output.push_str("# HELP testbox_queued_requests Requests waiting for a sandbox slot\n");
        output.push_str("# TYPE testbox_queued_requests gauge\n");
        output.push_str(&format!(
            "testbox_queued_requests {}\n",
            self.queued_requests.get()
        ));

        output.push_str("# HELP testbox_evaluation_duration_seconds Evaluation latency\n");
        output.push_str("# TYPE testbox_evaluation_duration_seconds histogram\n");
        for bucket in &self.evaluation_duration.buckets {
            output.push_str(&format!(
                "testbox_evaluation_duration_seconds_bucket{{le=\"{}\"}} {}\n",
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "testbox_evaluation_duration_seconds_bucket{{le=\"+Inf\"}} {}\n",
            self.evaluation_duration.get_count()
        ));
        output.push_str(&format!(
            "testbox_evaluation_duration_seconds_sum {}\n",
            self.evaluation_duration.get_sum_micros() as f64 / 1_000_000.0
        ));
        output.push_str(&format!(
            "testbox_evaluation_duration_seconds_count {}\n",
            self.evaluation_duration.get_count()
        ));

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

/// Process-wide registry
pub fn get_metrics() -> Arc<MetricsRegistry> {
    Arc::clone(&METRICS)
}
