// End-to-end evaluation latency: acquire, write workspace, run the harness,
// interpret, release. In-process, process backend, no HTTP.
// Budget: p50 < 150ms, p95 < 300ms for a small submission.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use testbox::config::config::{BackendSection, ServerSection};
use testbox::core::process::ProcessBackend;
use testbox::server::{EvaluationRequest, Evaluator};
use testbox::{Check, ResourceLimits, Submission, TestCase};

const ITERATIONS: usize = 50;
const WARMUP_ITERATIONS: usize = 5;

/// Latency percentiles
struct LatencyStats {
    p50: Duration,
    p95: Duration,
    p99: Duration,
    min: Duration,
    max: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();

        let p50_idx = (len as f64 * 0.50) as usize;
        let p95_idx = (len as f64 * 0.95) as usize;
        let p99_idx = (len as f64 * 0.99) as usize;

        let sum: Duration = samples.iter().sum();
        let mean = sum / len as u32;

        Self {
            p50: samples[p50_idx],
            p95: samples[p95_idx],
            p99: samples[p99_idx.min(len - 1)],
            min: samples[0],
            max: samples[len - 1],
            mean,
        }
    }

    fn print(&self, label: &str) {
        println!("\n{}", label);
        println!("  p50: {:?}", self.p50);
        println!("  p95: {:?}", self.p95);
        println!("  p99: {:?}", self.p99);
        println!("  min: {:?}", self.min);
        println!("  max: {:?}", self.max);
        println!("  mean: {:?}", self.mean);
    }
}

fn request(tests: usize) -> EvaluationRequest {
    EvaluationRequest {
        submission: Submission {
            task_id: "bench".to_string(),
            code: "def identity(x):\n    return x\n".to_string(),
            language: "python".to_string(),
        },
        test_cases: (0..tests)
            .map(|i| TestCase {
                id: format!("t{}", i),
                fixture: None,
                check: Check::Assertion {
                    code: format!("assert identity({0}) == {0}", i),
                },
            })
            .collect(),
    }
}

fn measure(evaluator: &Evaluator, request: &EvaluationRequest) -> LatencyStats {
    let cancel = AtomicBool::new(false);
    for _ in 0..WARMUP_ITERATIONS {
        let _ = evaluator.evaluate(request, "warmup", &cancel);
    }

    let mut samples = Vec::with_capacity(ITERATIONS);
    for i in 0..ITERATIONS {
        let start = Instant::now();
        if let Err(e) = evaluator.evaluate(request, &format!("bench-{}", i), &cancel) {
            eprintln!("evaluation failed: {}", e);
        }
        samples.push(start.elapsed());
    }
    LatencyStats::from_samples(samples)
}

fn main() {
    let python = std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !python {
        println!("python3 not found; skipping evaluation benchmark");
        return;
    }

    let root = match tempfile::tempdir() {
        Ok(root) => root,
        Err(e) => {
            eprintln!("cannot create work root: {}", e);
            std::process::exit(1);
        }
    };
    let config = BackendSection {
        work_root: root.path().to_path_buf(),
        ..BackendSection::default()
    };
    let backend = match ProcessBackend::new(&config, 1) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            eprintln!("cannot create backend: {}", e);
            std::process::exit(1);
        }
    };
    let limits = ResourceLimits {
        max_processes: 4096,
        ..ResourceLimits::default()
    };
    let evaluator = Evaluator::new(backend, limits, &ServerSection::default());

    println!("=== testbox evaluation benchmark ===");
    println!("Iterations: {} (after {} warmup)", ITERATIONS, WARMUP_ITERATIONS);

    let mut passed = true;
    for tests in [1, 25] {
        let stats = measure(&evaluator, &request(tests));
        stats.print(&format!("{} test(s)", tests));
        if stats.p50 >= Duration::from_millis(150) || stats.p95 >= Duration::from_millis(300) {
            println!("❌ p50={:?} (target <150ms), p95={:?} (target <300ms)", stats.p50, stats.p95);
            passed = false;
        } else {
            println!("✅ PASS");
        }
    }

    if !passed {
        std::process::exit(1);
    }
}
