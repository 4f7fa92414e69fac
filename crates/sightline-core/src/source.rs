//! Frames and frame acquisition.
//!
//! [`FrameGrabber`] decouples a blocking capture device from the
//! recognition loop: a dedicated thread keeps overwriting a single
//! latest-frame slot, and the consumer polls it without ever blocking the
//! capture side.

use chrono::{DateTime, Utc};
use image::RgbImage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Back-off after a failed capture before trying again.
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// A captured RGB frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Monotonic per-source counter.
    pub sequence: u64,
    /// Capture time; used as "now" for cooldown and `last_seen`.
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64, captured_at: DateTime<Utc>) -> Self {
        Self {
            image,
            sequence,
            captured_at,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Non-blocking frame supplier. `None` means nothing is available this
/// tick; the caller retries later.
pub trait FrameSource: Send {
    fn next_frame(&self) -> Option<Frame>;
}

/// Latest-frame grabber running a capture closure on its own thread.
pub struct FrameGrabber {
    slot: Arc<Mutex<Option<Frame>>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FrameGrabber {
    /// Start capturing. `capture` may block until the device delivers a
    /// frame; returning `None` counts as a failed read and is retried.
    pub fn spawn<F>(mut capture: F) -> std::io::Result<Self>
    where
        F: FnMut() -> Option<RgbImage> + Send + 'static,
    {
        let slot: Arc<Mutex<Option<Frame>>> = Arc::new(Mutex::new(None));
        let running = Arc::new(AtomicBool::new(true));

        let thread = {
            let slot = Arc::clone(&slot);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("sightline-capture".into())
                .spawn(move || {
                    tracing::info!("capture thread started");
                    let mut sequence = 0u64;
                    let mut failures = 0u64;

                    while running.load(Ordering::Acquire) {
                        match capture() {
                            Some(image) => {
                                sequence += 1;
                                *slot.lock() = Some(Frame::new(image, sequence, Utc::now()));
                            }
                            None => {
                                failures += 1;
                                tracing::debug!(failures, "capture returned no frame");
                                std::thread::sleep(CAPTURE_RETRY_DELAY);
                            }
                        }
                    }
                    tracing::info!(frames = sequence, failures, "capture thread exiting");
                })?
        };

        Ok(Self {
            slot,
            running,
            thread: Some(thread),
        })
    }

    /// Signal the capture thread and wait for it. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("capture thread panicked");
            }
        }
    }
}

impl FrameSource for FrameGrabber {
    /// Take the most recent frame. Frames overwritten before being taken are
    /// dropped; the same frame is never handed out twice.
    fn next_frame(&self) -> Option<Frame> {
        self.slot.lock().take()
    }
}

impl Drop for FrameGrabber {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn poll(source: &dyn FrameSource, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(f) = source.next_frame() {
                return Some(f);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn test_grabber_delivers_frames_in_order() {
        let mut grabber = FrameGrabber::spawn(|| {
            std::thread::sleep(Duration::from_millis(2));
            Some(RgbImage::new(4, 3))
        })
        .unwrap();

        let first = poll(&grabber, Duration::from_secs(2)).expect("first frame");
        let second = poll(&grabber, Duration::from_secs(2)).expect("second frame");
        assert!(second.sequence > first.sequence);
        assert_eq!((first.width(), first.height()), (4, 3));

        grabber.stop();
    }

    #[test]
    fn test_grabber_frame_taken_once() {
        let mut produced = false;
        let mut grabber = FrameGrabber::spawn(move || {
            if produced {
                None
            } else {
                produced = true;
                Some(RgbImage::new(1, 1))
            }
        })
        .unwrap();

        assert!(poll(&grabber, Duration::from_secs(2)).is_some());
        assert!(grabber.next_frame().is_none());
        grabber.stop();
    }

    #[test]
    fn test_grabber_survives_capture_failures() {
        let mut calls = 0u32;
        let mut grabber = FrameGrabber::spawn(move || {
            calls += 1;
            (calls % 3 == 0).then(|| RgbImage::new(2, 2))
        })
        .unwrap();

        assert!(poll(&grabber, Duration::from_secs(2)).is_some());
        grabber.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut grabber = FrameGrabber::spawn(|| None).unwrap();
        grabber.stop();
        grabber.stop();
        assert!(grabber.next_frame().is_none());
    }
}
