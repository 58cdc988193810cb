/// Bounded output collection
///
/// stdout and stderr are drained concurrently on reader threads so the
/// sandboxed process never blocks on a full pipe. Bytes past a stream's
/// cap are read and discarded, and the stream is marked truncated.
use crate::config::types::{OutputIntegrity, ResourceLimits};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::io::Read;
use std::thread;
use std::time::{Duration, Instant};

/// Output limits configuration
#[derive(Debug, Clone)]
pub struct OutputLimits {
    /// Combined stdout+stderr limit (bytes)
    pub combined_limit: usize,
    /// Per-stream stdout limit (bytes)
    pub stdout_limit: usize,
    /// Per-stream stderr limit (bytes)
    pub stderr_limit: usize,
    /// How long to wait for EOF once the process is gone (milliseconds)
    pub collection_timeout_ms: u64,
}

impl Default for OutputLimits {
    fn default() -> Self {
        OutputLimits {
            combined_limit: 1280 * 1024,
            stdout_limit: 1024 * 1024,
            stderr_limit: 256 * 1024,
            collection_timeout_ms: 2000,
        }
    }
}

impl OutputLimits {
    pub fn from_resource_limits(limits: &ResourceLimits) -> Self {
        let stdout_limit = limits.max_output_bytes as usize;
        let stderr_limit = limits.max_stderr_bytes as usize;
        OutputLimits {
            combined_limit: stdout_limit.saturating_add(stderr_limit),
            stdout_limit,
            stderr_limit,
            ..OutputLimits::default()
        }
    }
}

/// Output collection result
#[derive(Debug, Clone)]
pub struct OutputResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_integrity: OutputIntegrity,
    pub stderr_integrity: OutputIntegrity,
    pub combined_integrity: OutputIntegrity,
    /// Bytes produced by the process, including discarded ones
    pub total_bytes: usize,
}

impl OutputResult {
    pub fn stdout_truncated(&self) -> bool {
        self.stdout_integrity != OutputIntegrity::Complete
    }

    /// Bytes were discarded because a cap was hit
    pub fn truncated(&self) -> bool {
        self.stdout_integrity == OutputIntegrity::TruncatedByLimit
            || self.stderr_integrity == OutputIntegrity::TruncatedByLimit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

enum StreamEvent {
    Data(Stream, Vec<u8>),
    Closed(Stream, OutputIntegrity, usize),
}

/// Output collector with bounded collection
pub struct OutputCollector {
    limits: OutputLimits,
}

impl OutputCollector {
    pub fn new(limits: OutputLimits) -> Self {
        OutputCollector { limits }
    }

    /// Start draining the child's pipes on background threads
    pub fn start<O, E>(&self, stdout: Option<O>, stderr: Option<E>) -> PendingOutput
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let mut open_streams = 0;

        if let Some(stdout) = stdout {
            open_streams += 1;
            let tx = tx.clone();
            let limit = self.limits.stdout_limit;
            thread::spawn(move || drain_stream(stdout, Stream::Stdout, limit, tx));
        }
        if let Some(stderr) = stderr {
            open_streams += 1;
            let tx = tx.clone();
            let limit = self.limits.stderr_limit;
            thread::spawn(move || drain_stream(stderr, Stream::Stderr, limit, tx));
        }

        PendingOutput {
            rx,
            open_streams,
            limits: self.limits.clone(),
        }
    }
}

/// Collection in progress; finish it once the process has exited
pub struct PendingOutput {
    rx: Receiver<StreamEvent>,
    open_streams: usize,
    limits: OutputLimits,
}

impl PendingOutput {
    /// Wait up to the collection timeout for both streams to reach EOF.
    /// Streams still open afterwards (e.g. held by an escaped descendant)
    /// are reported as `CollectionTimeout` with whatever was read so far.
    pub fn finish(self) -> OutputResult {
        let deadline = Instant::now() + Duration::from_millis(self.limits.collection_timeout_ms);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut stdout_integrity = None;
        let mut stderr_integrity = None;
        let mut total_bytes = 0;
        let mut open = self.open_streams;

        while open > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(StreamEvent::Data(Stream::Stdout, bytes)) => stdout.extend_from_slice(&bytes),
                Ok(StreamEvent::Data(Stream::Stderr, bytes)) => stderr.extend_from_slice(&bytes),
                Ok(StreamEvent::Closed(stream, integrity, seen)) => {
                    total_bytes += seen;
                    match stream {
                        Stream::Stdout => stdout_integrity = Some(integrity),
                        Stream::Stderr => stderr_integrity = Some(integrity),
                    }
                    open -= 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!("Output collection timed out with {} stream(s) open", open);
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut stdout_integrity = stdout_integrity.unwrap_or(if self.open_streams > 0 {
            OutputIntegrity::CollectionTimeout
        } else {
            OutputIntegrity::Complete
        });
        let mut stderr_integrity = stderr_integrity.unwrap_or(if self.open_streams > 0 {
            OutputIntegrity::CollectionTimeout
        } else {
            OutputIntegrity::Complete
        });
        total_bytes = total_bytes.max(stdout.len() + stderr.len());

        // Combined cap, preferring stdout where the result records live
        let mut combined_truncated = false;
        let combined_limit = self.limits.combined_limit;
        if stdout.len() + stderr.len() > combined_limit {
            combined_truncated = true;
            if stdout.len() > combined_limit {
                stdout.truncate(combined_limit);
                stderr.clear();
                stdout_integrity = OutputIntegrity::TruncatedByLimit;
            } else {
                stderr.truncate(combined_limit - stdout.len());
            }
            stderr_integrity = OutputIntegrity::TruncatedByLimit;
        }

        let combined_integrity = if combined_truncated {
            OutputIntegrity::TruncatedByLimit
        } else {
            worst_of(stdout_integrity, stderr_integrity)
        };

        OutputResult {
            stdout,
            stderr,
            stdout_integrity,
            stderr_integrity,
            combined_integrity,
            total_bytes,
        }
    }
}

fn severity(integrity: OutputIntegrity) -> u8 {
    match integrity {
        OutputIntegrity::Complete => 0,
        OutputIntegrity::TruncatedByLimit => 1,
        OutputIntegrity::CollectionTimeout => 2,
        OutputIntegrity::ReadError => 3,
    }
}

fn worst_of(a: OutputIntegrity, b: OutputIntegrity) -> OutputIntegrity {
    if severity(a) >= severity(b) {
        a
    } else {
        b
    }
}

/// Read a stream to EOF, forwarding at most `limit` bytes
fn drain_stream<R: Read>(mut stream: R, kind: Stream, limit: usize, tx: Sender<StreamEvent>) {
    let mut chunk = [0u8; 8192];
    let mut kept = 0usize;
    let mut seen = 0usize;
    let mut integrity = OutputIntegrity::Complete;

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                seen += n;
                let room = limit.saturating_sub(kept);
                if n > room {
                    integrity = OutputIntegrity::TruncatedByLimit;
                }
                let take = n.min(room);
                if take > 0 {
                    kept += take;
                    if tx.send(StreamEvent::Data(kind, chunk[..take].to_vec())).is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => {
                integrity = OutputIntegrity::ReadError;
                break;
            }
        }
    }

    let _ = tx.send(StreamEvent::Closed(kind, integrity, seen));
}
