//! Single-slot frame worker
//!
//! One frame in flight at a time. The admission channel is a rendezvous
//! channel, so a non-blocking submit only succeeds while the worker thread
//! is parked waiting for work; a frame arriving while it is busy goes back
//! to the caller and is counted as dropped. Nothing queues.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::frame::Frame;
use crate::pipeline::{FramePipeline, ProcessedFrame};

/// Minimum gap between failure warnings
const FAILURE_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Frame counters shared between the worker thread and its owner
#[derive(Debug, Default)]
pub struct WorkerStats {
    submitted: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// A frame that was not admitted, returned to the caller
pub enum SubmitError {
    /// The worker is still processing the previous frame
    Busy(Frame),
    /// The worker thread has exited
    Stopped(Frame),
}

impl fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Busy(frame) => write!(f, "Busy(frame {})", frame.sequence),
            SubmitError::Stopped(frame) => write!(f, "Stopped(frame {})", frame.sequence),
        }
    }
}

pub struct FrameWorker {
    sender: Option<SyncSender<Frame>>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl FrameWorker {
    /// Start the worker thread. Each processed frame is sent on `results`;
    /// the worker stops once the receiving side is gone.
    pub fn spawn(
        pipeline: FramePipeline,
        results: SyncSender<ProcessedFrame>,
        stats_interval: Duration,
    ) -> io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Frame>(0);
        let stats = Arc::new(WorkerStats::default());
        let thread_stats = Arc::clone(&stats);

        let handle = thread::Builder::new()
            .name("frame-worker".to_string())
            .spawn(move || run(pipeline, receiver, results, thread_stats, stats_interval))?;

        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
            stats,
        })
    }

    /// Hand a frame to the worker if it is idle, without waiting
    pub fn submit(&self, frame: Frame) -> Result<(), SubmitError> {
        let Some(sender) = &self.sender else {
            return Err(SubmitError::Stopped(frame));
        };
        match sender.try_send(frame) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(frame)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Worker busy, dropping frame {}", frame.sequence);
                Err(SubmitError::Busy(frame))
            }
            Err(TrySendError::Disconnected(frame)) => Err(SubmitError::Stopped(frame)),
        }
    }

    /// Wait until the worker takes the frame
    pub fn submit_blocking(&self, frame: Frame) -> Result<(), SubmitError> {
        let Some(sender) = &self.sender else {
            return Err(SubmitError::Stopped(frame));
        };
        match sender.send(frame) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::SendError(frame)) => Err(SubmitError::Stopped(frame)),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Stop accepting frames and wait for the in-flight one to finish
    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Frame worker thread panicked");
            }
        }
    }
}

impl Drop for FrameWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    pipeline: FramePipeline,
    frames: Receiver<Frame>,
    results: SyncSender<ProcessedFrame>,
    stats: Arc<WorkerStats>,
    stats_interval: Duration,
) {
    info!("Frame worker started");

    let mut window_frames = 0u64;
    let mut window_us = 0u64;
    let mut window_start = Instant::now();
    let mut last_failure_warn: Option<Instant> = None;

    while let Ok(frame) = frames.recv() {
        let sequence = frame.sequence;
        match pipeline.process(frame) {
            Ok(processed) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);
                window_frames += 1;
                window_us += processed.timings.total_us();
                if results.send(processed).is_err() {
                    debug!("Result receiver closed");
                    break;
                }
            }
            Err(e) => {
                let failed = stats.failed.fetch_add(1, Ordering::Relaxed) + 1;
                let should_warn = last_failure_warn
                    .map(|t| t.elapsed() >= FAILURE_WARN_INTERVAL)
                    .unwrap_or(true);
                if should_warn {
                    warn!("Dropped frame {} ({}): {} ({} failed so far)",
                        sequence, e.kind(), e, failed);
                    last_failure_warn = Some(Instant::now());
                } else {
                    debug!("Dropped frame {}: {}", sequence, e);
                }
            }
        }

        if window_start.elapsed() >= stats_interval {
            let elapsed = window_start.elapsed().as_secs_f64();
            let snapshot = stats.snapshot();
            let avg_ms = if window_frames > 0 {
                window_us as f64 / window_frames as f64 / 1000.0
            } else {
                0.0
            };
            info!("Performance: {:.1} fps ({} frames in {:.1}s, {:.1} ms/frame, {} dropped, {} failed)",
                window_frames as f64 / elapsed, window_frames, elapsed, avg_ms,
                snapshot.dropped, snapshot.failed);
            window_frames = 0;
            window_us = 0;
            window_start = Instant::now();
        }
    }

    info!("Frame worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::source::SyntheticSource;

    fn worker(results: SyncSender<ProcessedFrame>) -> FrameWorker {
        let mut config = Config::default();
        config.decoder.jpeg_round_trip = false;
        config.blur.enabled = false;
        let pipeline = FramePipeline::new(&config).unwrap();
        FrameWorker::spawn(pipeline, results, Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn test_blocking_submit_delivers_results_in_order() {
        let (tx, rx) = mpsc::sync_channel(1);
        let worker = worker(tx);
        let mut source = SyntheticSource::new(32, 24);

        for _ in 0..3 {
            worker.submit_blocking(source.next_frame()).unwrap();
            let out = rx.recv().unwrap();
            assert_eq!(out.rectified.dimensions(), (32, 24));
        }
        assert_eq!(worker.stats().snapshot().processed, 3);
    }

    #[test]
    fn test_busy_worker_rejects_frame() {
        // Rendezvous result channel: the worker stays busy until we receive
        let (tx, rx) = mpsc::sync_channel(0);
        let worker = worker(tx);
        let mut source = SyntheticSource::new(32, 24);

        worker.submit_blocking(source.next_frame()).unwrap();
        match worker.submit(source.next_frame()) {
            Err(SubmitError::Busy(frame)) => assert_eq!(frame.sequence, 1),
            other => panic!("expected Busy, got {:?}", other),
        }

        let out = rx.recv().unwrap();
        assert_eq!(out.sequence, 0);

        let stats = worker.stats().snapshot();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_failed_frame_does_not_stop_worker() {
        let (tx, rx) = mpsc::sync_channel(1);
        let worker = worker(tx);
        let mut source = SyntheticSource::new(16, 16);

        let mut bad = source.next_frame();
        bad.planes[1].data.clear();
        worker.submit_blocking(bad).unwrap();

        worker.submit_blocking(source.next_frame()).unwrap();
        let out = rx.recv().unwrap();
        assert_eq!(out.sequence, 1);

        let stats = worker.stats().snapshot();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.processed, 1);
    }

    #[test]
    fn test_submit_after_shutdown() {
        let (tx, _rx) = mpsc::sync_channel(1);
        let mut worker = worker(tx);
        worker.shutdown();
        let frame = SyntheticSource::new(8, 8).next_frame();
        assert!(matches!(worker.submit(frame), Err(SubmitError::Stopped(_))));
    }

    #[test]
    fn test_worker_exits_when_results_dropped() {
        let (tx, rx) = mpsc::sync_channel(0);
        let mut worker = worker(tx);
        drop(rx);
        let frame = SyntheticSource::new(8, 8).next_frame();
        // Taken by the worker, whose result send then fails
        let _ = worker.submit_blocking(frame);
        worker.shutdown();
    }
}
