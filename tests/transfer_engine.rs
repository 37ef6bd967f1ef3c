//! Transfer engine against a scripted in-memory device.
//!
//! The device stages whatever COBS frame arrives after a begin-stage, reports
//! the decoded length and MD5, and appends committed chunks to its storage, so
//! every test can compare storage with the original buffer.
use binlink::binpack::md5_hex;
use binlink::cobs;
use binlink::transfer::{
    CancelFlag, Destination, Link, LinkError, Op, Request, Response, RetryPolicy,
    TransferConfig, TransferEngine, TransferError,
};
use rand::{Rng, SeedableRng};
use std::time::Duration;

#[derive(Default)]
struct Device {
    /// `None` makes the capacity query time out.
    capacity: Option<usize>,
    /// `max` reported in begin-stage responses.
    stage_max: Option<usize>,
    delimiter: u8,

    expected_cobs: Option<usize>,
    rx: Vec<u8>,
    staged: Option<Vec<u8>>,
    storage: Vec<u8>,

    ops: Vec<Op>,
    commits: Vec<(usize, usize)>,
    routes: Vec<Option<String>>,
    sends: usize,
    queries: usize,

    // fault injection
    verify_io_on: Vec<usize>,
    verify_io_from: Option<usize>,
    verify_bad_bin_on: Vec<usize>,
    /// Verify queries that report the right length but a wrong MD5.
    wrong_md5_on: Vec<usize>,
    commit_io: usize,
    drop_frames: usize,
    commit_reject_at: Option<usize>,
    closed_on_send: bool,
    pending_polls: usize,
    pending_left: usize,
    status_not_ready: bool,
}

impl Device {
    fn with_capacity(capacity: usize) -> Self {
        Device {
            capacity: Some(capacity),
            delimiter: b'\n',
            ..Device::default()
        }
    }

    fn status_count(&self) -> usize {
        self.ops.iter().filter(|op| **op == Op::Status).count()
    }

    fn err(msg: &str) -> Response {
        Response {
            err: Some(msg.to_string()),
            ..Response::default()
        }
    }
}

impl Link for Device {
    async fn transact(&mut self, req: &Request) -> Result<Response, LinkError> {
        self.ops.push(req.op);
        match req.op {
            Op::Capacity => match self.capacity {
                Some(max) => Ok(Response {
                    max: Some(max),
                    ..Response::default()
                }),
                None => Err(LinkError::Timeout),
            },
            Op::BeginStage => {
                self.expected_cobs = req.cobs_length;
                self.staged = None;
                self.rx.clear();
                Ok(Response {
                    max: self.stage_max,
                    ..Response::default()
                })
            }
            Op::QueryStaged => {
                self.queries += 1;
                let failing = self.verify_io_on.contains(&self.queries)
                    || self.verify_io_from.map_or(false, |n| self.queries >= n);
                if failing {
                    return Ok(Device::err("i2c read failed {io}"));
                }
                if self.verify_bad_bin_on.contains(&self.queries) {
                    self.staged = None;
                    return Ok(Device::err("staged image rejected {bad-bin}"));
                }
                let staged = self.staged.as_deref().unwrap_or(&[]);
                let status = if self.wrong_md5_on.contains(&self.queries) {
                    md5_hex(b"not the chunk")
                } else {
                    md5_hex(staged)
                };
                Ok(Response {
                    length: Some(staged.len()),
                    status: self.staged.is_some().then_some(status),
                    ..Response::default()
                })
            }
            Op::Commit => {
                if self.commit_io > 0 {
                    self.commit_io -= 1;
                    return Ok(Device::err("serial glitch {io}"));
                }
                let offset = req.offset.unwrap_or(usize::MAX);
                if self.commit_reject_at == Some(offset) {
                    return Ok(Device::err("storage full"));
                }
                if offset != self.storage.len() {
                    return Ok(Device::err("out of order commit"));
                }
                let Some(staged) = self.staged.take() else {
                    return Ok(Device::err("nothing staged {bad-bin}"));
                };
                if req.status.as_deref() != Some(md5_hex(&staged).as_str()) {
                    return Ok(Device::err("checksum mismatch {bad-bin}"));
                }
                self.commits.push((offset, staged.len()));
                self.routes.push(req.route.clone());
                self.storage.extend_from_slice(&staged);
                self.pending_left = self.pending_polls;
                Ok(Response {
                    pending: self.pending_polls > 0,
                    ..Response::default()
                })
            }
            Op::Status => {
                if self.status_not_ready {
                    return Ok(Device::err("no transfer in progress {not-ready}"));
                }
                if self.pending_left > 0 {
                    self.pending_left -= 1;
                    return Ok(Response {
                        pending: true,
                        ..Response::default()
                    });
                }
                Ok(Response::default())
            }
        }
    }

    async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.sends += 1;
        if self.closed_on_send {
            return Err(LinkError::Closed);
        }
        self.rx.extend_from_slice(bytes);
        if self.rx.last() != Some(&self.delimiter) {
            return Ok(());
        }
        let frame = std::mem::take(&mut self.rx);
        if self.drop_frames > 0 {
            self.drop_frames -= 1;
            return Ok(());
        }
        let body = &frame[..frame.len() - 1];
        if Some(body.len()) != self.expected_cobs {
            return Ok(());
        }
        self.staged = cobs::decode(body, self.delimiter).ok();
        Ok(())
    }
}

fn payload(len: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(len as u64);
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    data
}

fn quick() -> TransferConfig {
    TransferConfig {
        retry: RetryPolicy::unbounded(0),
        ..TransferConfig::default()
    }
}

fn offsets(device: &Device) -> Vec<usize> {
    device.commits.iter().map(|(o, _)| *o).collect()
}

#[tokio::test]
async fn chunks_follow_device_capacity() {
    let data = payload(4500);
    let mut device = Device::with_capacity(1000);
    let report = TransferEngine::new(&mut device, quick())
        .run(&data, &Destination::Device)
        .await
        .unwrap();

    assert_eq!(report.chunks, 5);
    assert_eq!(report.bytes, 4500);
    assert_eq!(report.retries, 0);
    assert_eq!(offsets(&device), vec![0, 1000, 2000, 3000, 4000]);
    assert_eq!(device.commits.last(), Some(&(4000, 500)));
    assert_eq!(device.storage, data);

    assert_eq!(device.ops[0], Op::Capacity);
    for step in device.ops[1..].chunks(3) {
        assert_eq!(step, [Op::BeginStage, Op::QueryStaged, Op::Commit]);
    }
}

#[tokio::test]
async fn ceiling_caps_chunk_size() {
    let data = payload(1000);
    let mut device = Device::with_capacity(1000);
    let config = TransferConfig {
        chunk_ceiling: Some(300),
        ..quick()
    };
    let report = TransferEngine::new(&mut device, config)
        .run(&data, &Destination::Device)
        .await
        .unwrap();

    assert_eq!(report.chunks, 4);
    assert_eq!(offsets(&device), vec![0, 300, 600, 900]);
    assert_eq!(device.storage, data);
}

#[tokio::test]
async fn payload_with_delimiters_arrives_intact() {
    let data: Vec<u8> = b"line\n".iter().cycle().take(2048).copied().collect();
    let mut device = Device::with_capacity(512);
    TransferEngine::new(&mut device, quick())
        .run(&data, &Destination::Device)
        .await
        .unwrap();
    assert_eq!(device.storage, data);
}

#[tokio::test]
async fn verify_io_error_retries_same_chunk() {
    let data = payload(3000);
    let mut clean = Device::with_capacity(1000);
    TransferEngine::new(&mut clean, quick())
        .run(&data, &Destination::Device)
        .await
        .unwrap();

    let mut noisy = Device::with_capacity(1000);
    noisy.verify_io_on = vec![2];
    let report = TransferEngine::new(&mut noisy, quick())
        .run(&data, &Destination::Device)
        .await
        .unwrap();

    assert_eq!(report.retries, 1);
    assert_eq!(report.chunks, 3);
    assert_eq!(noisy.queries, 4);
    assert_eq!(offsets(&noisy), vec![0, 1000, 2000]);
    assert_eq!(noisy.storage, clean.storage);
}

#[tokio::test]
async fn commit_io_error_restages() {
    let data = payload(2000);
    let mut device = Device::with_capacity(1000);
    device.commit_io = 2;
    let report = TransferEngine::new(&mut device, quick())
        .run(&data, &Destination::Device)
        .await
        .unwrap();

    assert_eq!(report.retries, 2);
    assert_eq!(offsets(&device), vec![0, 1000]);
    assert_eq!(device.storage, data);
    let begins = device.ops.iter().filter(|op| **op == Op::BeginStage).count();
    assert_eq!(begins, 4);
}

#[tokio::test]
async fn lost_frame_shows_up_as_length_mismatch() {
    let data = payload(1500);
    let mut device = Device::with_capacity(1000);
    device.drop_frames = 1;
    let report = TransferEngine::new(&mut device, quick())
        .run(&data, &Destination::Device)
        .await
        .unwrap();

    assert_eq!(report.retries, 1);
    assert_eq!(device.storage, data);
}

#[tokio::test(start_paused = true)]
async fn pending_commit_is_polled() {
    let data = payload(1500);
    let mut device = Device::with_capacity(1000);
    device.pending_polls = 2;
    let report = TransferEngine::new(&mut device, quick())
        .run(&data, &Destination::Relay("firmware".to_string()))
        .await
        .unwrap();

    assert_eq!(device.storage, data);
    // Two chunks, each: pending, pending, done.
    assert_eq!(device.status_count(), 6);
    assert!(report.elapsed >= Duration::from_millis(6 * 750));
    assert_eq!(
        device.routes,
        vec![Some("firmware".to_string()), Some("firmware".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn not_ready_after_last_chunk_is_success() {
    let data = payload(800);
    let mut device = Device::with_capacity(1000);
    device.pending_polls = 1;
    device.status_not_ready = true;
    let report = TransferEngine::new(&mut device, quick())
        .run(&data, &Destination::Relay("upload".to_string()))
        .await
        .unwrap();

    assert_eq!(report.bytes, 800);
    assert_eq!(device.status_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn not_ready_mid_transfer_is_fatal() {
    let data = payload(1800);
    let mut device = Device::with_capacity(1000);
    device.pending_polls = 1;
    device.status_not_ready = true;
    let failure = TransferEngine::new(&mut device, quick())
        .run(&data, &Destination::Device)
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        TransferError::Device { op: Op::Status, .. }
    ));
    assert_eq!(failure.committed, 0);
}

#[tokio::test]
async fn zero_capacity_is_unsupported() {
    let mut device = Device::with_capacity(0);
    let failure = TransferEngine::new(&mut device, quick())
        .run(&payload(10), &Destination::Device)
        .await
        .unwrap_err();

    assert!(matches!(failure.error, TransferError::Unsupported));
    assert_eq!(failure.committed, 0);
    assert_eq!(device.ops, vec![Op::Capacity]);
}

#[tokio::test]
async fn unknown_capacity_uses_first_stage_response() {
    let data = payload(1200);
    let mut device = Device {
        stage_max: Some(500),
        ..Device::with_capacity(0)
    };
    device.capacity = None;
    let report = TransferEngine::new(&mut device, quick())
        .run(&data, &Destination::Device)
        .await
        .unwrap();

    assert_eq!(report.chunks, 3);
    assert_eq!(device.commits, vec![(0, 500), (500, 500), (1000, 200)]);
    assert_eq!(device.storage, data);
    // The oversized first attempt is abandoned before any bytes are written.
    assert_eq!(&device.ops[..3], &[Op::Capacity, Op::BeginStage, Op::BeginStage]);
}

#[tokio::test]
async fn unknown_capacity_without_stage_hint_uses_fallback() {
    let data = payload(5000);
    let mut device = Device::with_capacity(0);
    device.capacity = None;
    let config = TransferConfig {
        fallback_chunk_size: 2048,
        ..quick()
    };
    TransferEngine::new(&mut device, config)
        .run(&data, &Destination::Device)
        .await
        .unwrap();

    assert_eq!(offsets(&device), vec![0, 2048, 4096]);
    assert_eq!(device.storage, data);
}

#[tokio::test]
async fn cancel_stops_retry_loop() {
    let data = payload(2000);
    let mut device = Device::with_capacity(1000);
    device.verify_io_from = Some(2);
    let cancel = CancelFlag::new();
    cancel.cancel();
    let failure = TransferEngine::new(&mut device, quick())
        .with_cancel(cancel)
        .run(&data, &Destination::Device)
        .await
        .unwrap_err();

    assert!(matches!(failure.error, TransferError::Cancelled));
    assert_eq!(failure.committed, 1000);
    assert_eq!(device.storage, data[..1000]);
}

#[tokio::test(start_paused = true)]
async fn cancel_interrupts_a_long_backoff() {
    let mut device = Device::with_capacity(1000);
    device.verify_io_from = Some(1);
    let config = TransferConfig {
        retry: RetryPolicy::unbounded(60_000),
        ..quick()
    };
    let cancel = CancelFlag::new();
    let remote = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        remote.cancel();
    });

    let started = tokio::time::Instant::now();
    let failure = TransferEngine::new(&mut device, config)
        .with_cancel(cancel)
        .run(&payload(100), &Destination::Device)
        .await
        .unwrap_err();

    assert!(matches!(failure.error, TransferError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(device.queries, 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_commit_polling() {
    let data = payload(2000);
    let mut device = Device::with_capacity(1000);
    device.pending_polls = usize::MAX;
    let cancel = CancelFlag::new();
    let remote = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2000)).await;
        remote.cancel();
    });

    let failure = TransferEngine::new(&mut device, quick())
        .with_cancel(cancel)
        .run(&data, &Destination::Relay("firmware".to_string()))
        .await
        .unwrap_err();

    assert!(matches!(failure.error, TransferError::Cancelled));
    // The first commit never resolved, so nothing counts as committed.
    assert_eq!(failure.committed, 0);
    // Polls at 750 ms and 1500 ms; the third wait is cut short.
    assert_eq!(device.status_count(), 2);
    assert_eq!(device.commits, vec![(0, 1000)]);
}

#[tokio::test]
async fn bad_bin_on_verify_restages_same_chunk() {
    let data = payload(2000);
    let mut device = Device::with_capacity(1000);
    device.verify_bad_bin_on = vec![1];
    let report = TransferEngine::new(&mut device, quick())
        .run(&data, &Destination::Device)
        .await
        .unwrap();

    assert_eq!(report.retries, 1);
    assert_eq!(offsets(&device), vec![0, 1000]);
    assert_eq!(device.storage, data);
    assert_eq!(
        &device.ops[..5],
        &[
            Op::Capacity,
            Op::BeginStage,
            Op::QueryStaged,
            Op::BeginStage,
            Op::QueryStaged
        ]
    );
}

#[tokio::test]
async fn staged_md5_mismatch_retries_before_commit() {
    let data = payload(1500);
    let mut device = Device::with_capacity(1000);
    device.wrong_md5_on = vec![2];
    let report = TransferEngine::new(&mut device, quick())
        .run(&data, &Destination::Device)
        .await
        .unwrap();

    assert_eq!(report.retries, 1);
    assert_eq!(device.queries, 3);
    assert_eq!(offsets(&device), vec![0, 1000]);
    assert_eq!(device.storage, data);
    let commits = device.ops.iter().filter(|op| **op == Op::Commit).count();
    assert_eq!(commits, 2);
}

#[tokio::test]
async fn bounded_policy_gives_up() {
    let mut device = Device::with_capacity(1000);
    device.verify_io_from = Some(1);
    let config = TransferConfig {
        retry: RetryPolicy::limited(2, 0),
        ..quick()
    };
    let failure = TransferEngine::new(&mut device, config)
        .run(&payload(100), &Destination::Device)
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        TransferError::RetriesExhausted { attempts: 3, .. }
    ));
    assert_eq!(device.queries, 3);
}

#[tokio::test]
async fn empty_payload_sends_nothing() {
    let mut device = Device::with_capacity(1000);
    let failure = TransferEngine::new(&mut device, quick())
        .run(&[], &Destination::Device)
        .await
        .unwrap_err();

    assert!(matches!(failure.error, TransferError::EmptyPayload));
    assert!(device.ops.is_empty());
}

#[tokio::test]
async fn closed_link_is_fatal() {
    let mut device = Device::with_capacity(1000);
    device.closed_on_send = true;
    let failure = TransferEngine::new(&mut device, quick())
        .run(&payload(100), &Destination::Device)
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        TransferError::Link(LinkError::Closed)
    ));
    assert_eq!(device.sends, 1);
}

#[tokio::test]
async fn rejected_commit_keeps_committed_offset() {
    let mut device = Device::with_capacity(1000);
    device.commit_reject_at = Some(2000);
    let failure = TransferEngine::new(&mut device, quick())
        .run(&payload(3000), &Destination::Device)
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        TransferError::Device { op: Op::Commit, .. }
    ));
    assert_eq!(failure.committed, 2000);
}

#[tokio::test]
async fn segments_split_the_write() {
    let data = payload(300);
    let mut device = Device::with_capacity(1000);
    let config = TransferConfig {
        segment_len: Some(64),
        ..quick()
    };
    TransferEngine::new(&mut device, config)
        .run(&data, &Destination::Device)
        .await
        .unwrap();

    let wire = cobs::encode(&data, b'\n').len() + 1;
    assert_eq!(device.sends, (wire + 63) / 64);
    assert_eq!(device.storage, data);
}

#[tokio::test]
async fn progress_reports_each_commit() {
    let data = payload(2500);
    let mut device = Device::with_capacity(1000);
    let mut seen = Vec::new();
    TransferEngine::new(&mut device, quick())
        .on_progress(|p| seen.push((p.offset, p.total, p.chunk_index)))
        .run(&data, &Destination::Device)
        .await
        .unwrap();

    assert_eq!(
        seen,
        vec![(1000, 2500, 1), (2000, 2500, 2), (2500, 2500, 3)]
    );
}
