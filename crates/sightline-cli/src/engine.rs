use sightline_core::{FrameReport, FrameSource, RecognitionPipeline, RunStats};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Reports buffered between the engine thread and the consumer before the
/// engine blocks.
const REPORT_CHANNEL_CAPACITY: usize = 16;

/// Back-off while the report channel is full.
const SEND_RETRY_DELAY: Duration = Duration::from_millis(5);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread panicked")]
    Panicked,
}

/// Owner of the engine thread. Dropping it without calling [`stop`]
/// detaches the thread, which exits once the report receiver is gone.
/// Calling [`stop`] returns even while the receiver is alive and full: the
/// report that cannot be delivered is discarded.
///
/// [`stop`]: EngineHandle::stop
pub struct EngineHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<RunStats>,
}

impl EngineHandle {
    /// Signal the loop to stop after the current frame and wait for it.
    pub fn stop(self) -> Result<RunStats, EngineError> {
        self.stop.store(true, Ordering::Release);
        self.thread.join().map_err(|_| EngineError::Panicked)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// Spawn the recognition loop on a dedicated OS thread.
///
/// Each processed frame is sent to the returned receiver. The loop stops
/// when [`EngineHandle::stop`] is called or the receiver is dropped.
pub fn spawn_engine(
    pipeline: Arc<RecognitionPipeline>,
    source: Box<dyn FrameSource>,
    poll_interval: Duration,
) -> Result<(EngineHandle, mpsc::Receiver<FrameReport>), EngineError> {
    let (tx, rx) = mpsc::channel::<FrameReport>(REPORT_CHANNEL_CAPACITY);
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);

    let thread = std::thread::Builder::new()
        .name("sightline-engine".into())
        .spawn(move || {
            tracing::info!(
                threshold = pipeline.matcher().threshold(),
                cooldown_secs = pipeline.cooldown().cooldown().num_seconds(),
                known = pipeline.matcher().store().len(),
                "engine thread started"
            );
            let stats = pipeline.run(&*source, &thread_stop, poll_interval, |report| {
                deliver(&tx, report, &thread_stop);
            });
            tracing::info!("engine thread exiting");
            stats
        })?;

    Ok((EngineHandle { stop, thread }, rx))
}

/// Send `report`, waiting for channel capacity until the stop flag is set.
/// A closed channel sets the flag itself.
fn deliver(tx: &mpsc::Sender<FrameReport>, report: FrameReport, stop: &AtomicBool) {
    let mut pending = report;
    loop {
        match tx.try_send(pending) {
            Ok(()) => return,
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("report receiver dropped; stopping");
                stop.store(true, Ordering::Release);
                return;
            }
            Err(TrySendError::Full(report)) => {
                if stop.load(Ordering::Acquire) {
                    tracing::debug!(seq = report.sequence, "stopping with full channel; report dropped");
                    return;
                }
                pending = report;
                std::thread::sleep(SEND_RETRY_DELAY);
            }
        }
    }
}
