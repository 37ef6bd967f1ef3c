//! # Chunked reliable transfer
//!
//! Moves a byte buffer to a device's transfer target over a [`Link`]. The
//! device has a single staging buffer, so the buffer is sent in chunks that fit
//! it, strictly one at a time and in increasing offset order:
//!
//! 1. **Negotiating**: ask the device for its staging capacity (`max`). A
//!    capacity of zero means the firmware cannot stage binaries at all.
//! 2. **Transferring** (per chunk): MD5 the chunk, COBS-encode it, announce the
//!    encoded length, write the encoded bytes plus the delimiter, ask the
//!    device how much it staged, then commit with the checksum, offset, total
//!    and (for relay transfers) the route.
//! 3. **CommitPending**: while the device reports the commit as pending, poll
//!    its status on a fixed interval.
//! 4. **Done** once every byte is committed.
//!
//! `{io}` and `{bad-bin}` failures while staging, verifying or committing
//! restage the same chunk; by default that retry never gives up, since the
//! alternative throws away a partially delivered upload. Pass a [`CancelFlag`]
//! to stop a transfer stuck in a retry or poll loop.
//!
//! ```rust,no_run
//! # async fn demo<L: binlink::transfer::Link>(link: &mut L, image: &[u8]) {
//! use binlink::transfer::{Destination, TransferConfig, TransferEngine};
//!
//! let mut engine = TransferEngine::new(link, TransferConfig::default())
//!     .on_progress(|p| println!("{}/{}", p.offset, p.total));
//! match engine.run(image, &Destination::Device).await {
//!     Ok(report) => println!("sent {} bytes in {} chunks", report.bytes, report.chunks),
//!     Err(failure) => eprintln!("stopped after {} bytes: {}", failure.committed, failure.error),
//! }
//! # }
//! ```

pub mod link;
pub mod policy;
pub mod request;

pub use link::{Link, LinkError};
pub use policy::{CancelFlag, RetryPolicy};
pub use request::{ErrorClass, Op, Request, Response};

use crate::binpack::md5_hex;
use crate::cobs;
use crate::logutil::{format_eta, format_rate, hex_snippet};
use log::{debug, error, info, trace, warn};
use policy::WaitOutcome;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{sleep, Duration, Instant};

/// Line feed: the usual packet terminator on the serial/I2C link.
pub const DEFAULT_DELIMITER: u8 = b'\n';

/// Chunk size used when the capacity query itself fails.
pub const FALLBACK_CHUNK_SIZE: usize = 8192;

/// Commit-status poll cadence.
pub const POLL_INTERVAL_MS: u64 = 750;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Reserved packet terminator; chunks are XOR-stuffed to avoid it.
    #[serde(default = "default_delimiter")]
    pub delimiter: u8,
    /// Upper bound on chunk size below the device's capacity. Smaller chunks
    /// make each retry cheaper on a noisy link.
    #[serde(default)]
    pub chunk_ceiling: Option<usize>,
    #[serde(default = "default_fallback_chunk_size")]
    pub fallback_chunk_size: usize,
    /// Write encoded chunks in segments of at most this many bytes.
    #[serde(default)]
    pub segment_len: Option<usize>,
    /// Pause between segments (ms).
    #[serde(default)]
    pub segment_delay_ms: u64,
    /// Stage/verify/commit retries.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Commit-pending polling.
    #[serde(default = "default_poll")]
    pub poll: RetryPolicy,
}

fn default_delimiter() -> u8 {
    DEFAULT_DELIMITER
}

fn default_fallback_chunk_size() -> usize {
    FALLBACK_CHUNK_SIZE
}

fn default_poll() -> RetryPolicy {
    RetryPolicy::unbounded(POLL_INTERVAL_MS)
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER,
            chunk_ceiling: None,
            fallback_chunk_size: FALLBACK_CHUNK_SIZE,
            segment_len: None,
            segment_delay_ms: 0,
            retry: RetryPolicy::default(),
            poll: default_poll(),
        }
    }
}

/// Where committed chunks end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Device-local storage.
    Device,
    /// Forwarded by the device to a cloud relay route.
    Relay(String),
}

impl Destination {
    fn route(&self) -> Option<String> {
        match self {
            Destination::Device => None,
            Destination::Relay(route) => Some(route.clone()),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("nothing to transfer")]
    EmptyPayload,

    /// Device firmware reports no staging capacity.
    #[error("device does not support binary transfers")]
    Unsupported,

    /// Device refused a request with a non-retryable error.
    #[error("device rejected {op:?}: {message}")]
    Device { op: Op, message: String },

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("transfer cancelled")]
    Cancelled,

    /// A bounded retry policy ran out.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// A failed transfer and how far it got.
#[derive(Debug, Error)]
#[error("{error} ({committed} bytes committed)")]
pub struct TransferFailure {
    /// Bytes durably committed before the failure; a resume would start here.
    pub committed: usize,
    #[source]
    pub error: TransferError,
}

/// Snapshot handed to the progress callback after each chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub offset: usize,
    pub total: usize,
    pub chunk_index: usize,
    pub bytes_per_sec: f64,
    pub eta: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes: usize,
    pub chunks: usize,
    pub retries: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Negotiating,
    Transferring,
    CommitPending,
    Done,
}

/// State of one `run` call; never outlives it.
#[derive(Debug)]
struct Session {
    total: usize,
    /// Next byte to stage.
    offset: usize,
    /// Bytes whose commit has fully completed.
    committed: usize,
    chunk_size: usize,
    chunk_index: usize,
    capacity_known: bool,
    retries: u32,
    started: Instant,
}

impl Session {
    fn new(total: usize) -> Self {
        Self {
            total,
            offset: 0,
            committed: 0,
            chunk_size: 0,
            chunk_index: 0,
            capacity_known: false,
            retries: 0,
            started: Instant::now(),
        }
    }
}

/// Result of one request after error classification.
enum Reply {
    Ok(Response),
    /// Retry the chunk.
    Transient(String),
    Rejected(ErrorClass, String),
}

/// Result of one stage/verify/commit pass over a chunk.
enum Attempt {
    Committed { pending: bool },
    /// Device announced a smaller capacity; re-slice before writing anything.
    Resized,
    Retry(String),
}

pub struct TransferEngine<'a, L: Link> {
    link: &'a mut L,
    config: TransferConfig,
    cancel: CancelFlag,
    progress: Option<Box<dyn FnMut(&Progress) + 'a>>,
}

impl<'a, L: Link> TransferEngine<'a, L> {
    pub fn new(link: &'a mut L, config: TransferConfig) -> Self {
        Self {
            link,
            config,
            cancel: CancelFlag::new(),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn on_progress(mut self, f: impl FnMut(&Progress) + 'a) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    /// Transfer `data` to `dest`.
    pub async fn run(
        &mut self,
        data: &[u8],
        dest: &Destination,
    ) -> Result<TransferReport, TransferFailure> {
        if data.is_empty() {
            return Err(TransferFailure {
                committed: 0,
                error: TransferError::EmptyPayload,
            });
        }

        let mut session = Session::new(data.len());
        let mut phase = Phase::Negotiating;
        loop {
            let next = match phase {
                Phase::Negotiating => self
                    .negotiate(&mut session)
                    .await
                    .map(|_| Phase::Transferring),
                Phase::Transferring if session.offset >= session.total => Ok(Phase::Done),
                Phase::Transferring => self.transfer_chunk(&mut session, data, dest).await,
                Phase::CommitPending => self
                    .await_commit(&mut session, dest)
                    .await
                    .map(|_| Phase::Transferring),
                Phase::Done => break,
            };
            match next {
                Ok(next) => phase = next,
                Err(error) => {
                    error!(
                        "transfer: aborted in {:?} at offset {}/{}: {}",
                        phase, session.committed, session.total, error
                    );
                    return Err(TransferFailure {
                        committed: session.committed,
                        error,
                    });
                }
            }
        }

        let report = TransferReport {
            bytes: session.total,
            chunks: session.chunk_index,
            retries: session.retries,
            elapsed: session.started.elapsed(),
        };
        info!(
            "transfer: {} bytes in {} chunks ({} retries) in {:.1}s",
            report.bytes,
            report.chunks,
            report.retries,
            report.elapsed.as_secs_f64()
        );
        Ok(report)
    }

    async fn negotiate(&mut self, s: &mut Session) -> Result<(), TransferError> {
        match self.call(&Request::new(Op::Capacity)).await? {
            Reply::Ok(rsp) => {
                let max = rsp.max.unwrap_or(0);
                if max == 0 {
                    return Err(TransferError::Unsupported);
                }
                s.chunk_size = self.limit(max);
                s.capacity_known = true;
                info!(
                    "transfer: device capacity {} bytes, chunk size {}",
                    max, s.chunk_size
                );
            }
            Reply::Transient(why) => {
                s.chunk_size = self.limit(self.config.fallback_chunk_size.max(1));
                s.capacity_known = false;
                warn!(
                    "transfer: capacity query failed ({}); starting with {} byte chunks",
                    why, s.chunk_size
                );
            }
            Reply::Rejected(_, message) => {
                return Err(TransferError::Device {
                    op: Op::Capacity,
                    message,
                })
            }
        }
        Ok(())
    }

    async fn transfer_chunk(
        &mut self,
        s: &mut Session,
        data: &[u8],
        dest: &Destination,
    ) -> Result<Phase, TransferError> {
        let mut attempt = 0u32;
        loop {
            let len = s.chunk_size.min(s.total - s.offset);
            let chunk = &data[s.offset..s.offset + len];
            let checksum = md5_hex(chunk);
            let encoded = cobs::encode(chunk, self.config.delimiter);
            trace!(
                "transfer: chunk {} encoded {} -> {} bytes [{}]",
                s.chunk_index,
                len,
                encoded.len(),
                hex_snippet(&encoded, 16)
            );

            match self.attempt_chunk(s, chunk, &checksum, &encoded, dest).await? {
                Attempt::Committed { pending } => {
                    s.offset += len;
                    s.chunk_index += 1;
                    if pending {
                        debug!("transfer: commit at offset {} pending", s.offset - len);
                        return Ok(Phase::CommitPending);
                    }
                    s.committed = s.offset;
                    self.report_progress(s);
                    return Ok(Phase::Transferring);
                }
                Attempt::Resized => continue,
                Attempt::Retry(reason) => {
                    attempt += 1;
                    s.retries += 1;
                    warn!(
                        "transfer: retrying chunk {} at offset {} (attempt {}): {}",
                        s.chunk_index,
                        s.offset,
                        attempt + 1,
                        reason
                    );
                    let policy = self.config.retry;
                    self.backoff(&policy, attempt, reason).await?;
                }
            }
        }
    }

    async fn attempt_chunk(
        &mut self,
        s: &mut Session,
        chunk: &[u8],
        checksum: &str,
        encoded: &[u8],
        dest: &Destination,
    ) -> Result<Attempt, TransferError> {
        let mut begin = Request::new(Op::BeginStage);
        begin.cobs_length = Some(encoded.len());
        let rsp = match self.call(&begin).await? {
            Reply::Ok(rsp) => rsp,
            Reply::Transient(why) => return Ok(Attempt::Retry(why)),
            Reply::Rejected(_, message) => {
                return Err(TransferError::Device {
                    op: Op::BeginStage,
                    message,
                })
            }
        };
        if !s.capacity_known {
            if let Some(max) = rsp.max {
                if max == 0 {
                    return Err(TransferError::Unsupported);
                }
                s.capacity_known = true;
                s.chunk_size = self.limit(max);
                info!(
                    "transfer: device reported capacity {} bytes, chunk size {}",
                    max, s.chunk_size
                );
                if chunk.len() > s.chunk_size {
                    return Ok(Attempt::Resized);
                }
            }
        }

        let mut wire = Vec::with_capacity(encoded.len() + 1);
        wire.extend_from_slice(encoded);
        wire.push(self.config.delimiter);
        if let Err(e) = self.send_paced(&wire).await {
            if !e.is_transient() {
                return Err(e.into());
            }
            return Ok(Attempt::Retry(e.to_string()));
        }

        let rsp = match self.call(&Request::new(Op::QueryStaged)).await? {
            Reply::Ok(rsp) => rsp,
            Reply::Transient(why) => return Ok(Attempt::Retry(why)),
            Reply::Rejected(_, message) => {
                return Err(TransferError::Device {
                    op: Op::QueryStaged,
                    message,
                })
            }
        };
        let staged = rsp.length.unwrap_or(0);
        if staged != chunk.len() {
            return Ok(Attempt::Retry(format!(
                "device staged {} of {} bytes",
                staged,
                chunk.len()
            )));
        }
        if let Some(status) = rsp.status.as_deref() {
            if !status.eq_ignore_ascii_case(checksum) {
                return Ok(Attempt::Retry(format!(
                    "staged md5 {} does not match {}",
                    status, checksum
                )));
            }
        }

        let mut commit = Request::new(Op::Commit);
        commit.binary = true;
        commit.offset = Some(s.offset);
        commit.total = Some(s.total);
        commit.status = Some(checksum.to_string());
        commit.route = dest.route();
        match self.call(&commit).await? {
            Reply::Ok(rsp) => Ok(Attempt::Committed {
                pending: rsp.pending,
            }),
            Reply::Transient(why) => Ok(Attempt::Retry(why)),
            Reply::Rejected(_, message) => Err(TransferError::Device {
                op: Op::Commit,
                message,
            }),
        }
    }

    async fn await_commit(
        &mut self,
        s: &mut Session,
        dest: &Destination,
    ) -> Result<(), TransferError> {
        let policy = self.config.poll;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.backoff(&policy, attempt, "commit still pending".to_string())
                .await?;

            let mut req = Request::new(Op::Status);
            req.offset = Some(s.offset);
            req.total = Some(s.total);
            req.route = dest.route();
            match self.call(&req).await? {
                Reply::Ok(rsp) if rsp.pending => {
                    debug!("transfer: commit still pending (poll {})", attempt);
                }
                Reply::Ok(_) => break,
                Reply::Transient(why) => {
                    warn!("transfer: status poll failed ({}), polling again", why);
                }
                // The device has already finished and moved on.
                Reply::Rejected(ErrorClass::NotReady, message) if s.offset == s.total => {
                    info!("transfer: treating final {} as complete", message);
                    break;
                }
                Reply::Rejected(_, message) => {
                    return Err(TransferError::Device {
                        op: Op::Status,
                        message,
                    })
                }
            }
        }
        s.committed = s.offset;
        self.report_progress(s);
        Ok(())
    }

    async fn call(&mut self, req: &Request) -> Result<Reply, TransferError> {
        debug!("transfer: -> {:?} offset={:?}", req.op, req.offset);
        match self.link.transact(req).await {
            Ok(rsp) => Ok(match rsp.error() {
                None => Reply::Ok(rsp),
                Some((class, msg)) if class.is_transient() => Reply::Transient(msg.to_string()),
                Some((class, msg)) => Reply::Rejected(class, msg.to_string()),
            }),
            Err(e) if e.is_transient() => Ok(Reply::Transient(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn send_paced(&mut self, wire: &[u8]) -> Result<(), LinkError> {
        let seg = match self.config.segment_len {
            Some(seg) if seg > 0 && wire.len() > seg => seg,
            _ => return self.link.send_bytes(wire).await,
        };
        let delay = Duration::from_millis(self.config.segment_delay_ms);
        for (i, part) in wire.chunks(seg).enumerate() {
            if i > 0 && !delay.is_zero() {
                sleep(delay).await;
            }
            self.link.send_bytes(part).await?;
        }
        Ok(())
    }

    async fn backoff(
        &self,
        policy: &RetryPolicy,
        attempt: u32,
        last: String,
    ) -> Result<(), TransferError> {
        policy::wait_before(policy, attempt, &self.cancel)
            .await
            .map_err(|outcome| match outcome {
                WaitOutcome::Cancelled => TransferError::Cancelled,
                WaitOutcome::Exhausted => TransferError::RetriesExhausted {
                    attempts: attempt,
                    last,
                },
            })
    }

    fn limit(&self, max: usize) -> usize {
        match self.config.chunk_ceiling {
            Some(ceiling) if ceiling > 0 => ceiling.min(max),
            _ => max,
        }
    }

    fn report_progress(&mut self, s: &Session) {
        let secs = s.started.elapsed().as_secs_f64();
        let bytes_per_sec = if secs > 0.0 {
            s.committed as f64 / secs
        } else {
            0.0
        };
        let eta = (bytes_per_sec > 0.0)
            .then(|| Duration::from_secs_f64((s.total - s.committed) as f64 / bytes_per_sec));
        info!(
            "transfer: {}/{} bytes ({}%), {}, eta {}",
            s.committed,
            s.total,
            s.committed * 100 / s.total,
            format_rate(bytes_per_sec),
            format_eta(eta)
        );
        if let Some(cb) = self.progress.as_mut() {
            cb(&Progress {
                offset: s.committed,
                total: s.total,
                chunk_index: s.chunk_index,
                bytes_per_sec,
                eta,
            });
        }
    }
}

/// Run a transfer with default cancellation and no progress callback.
pub async fn transfer<L: Link>(
    link: &mut L,
    data: &[u8],
    dest: &Destination,
    config: TransferConfig,
) -> Result<TransferReport, TransferFailure> {
    TransferEngine::new(link, config).run(data, dest).await
}
