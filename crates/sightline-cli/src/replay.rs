//! Replay of recorded detector output.
//!
//! A replay log is JSON lines, one frame per line:
//!
//! ```json
//! {"offset_ms": 1500, "width": 640, "height": 480,
//!  "faces": [{"embedding": [0.1, 0.2], "bbox": [10, 20, 110, 140]}]}
//! ```
//!
//! Blank lines and lines starting with `#` are ignored. Frames are handed
//! out in file order with `captured_at = start + offset_ms`; the image is a
//! flat grey canvas of the recorded size, so snapshots are placeholders.
//! Frames larger than [`MAX_FRAME_PIXELS`] are rejected.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use serde::Deserialize;
use sightline_core::{CollaboratorError, Detection, FaceDetector, Frame, FrameSource};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

const CANVAS: Rgb<u8> = Rgb([128, 128, 128]);

/// 8K UHD.
pub const MAX_FRAME_PIXELS: u64 = 7680 * 4320;

/// One recorded frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayFrame {
    #[serde(default)]
    pub offset_ms: u64,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub faces: Vec<Detection>,
    /// 1-based source line, for error messages.
    #[serde(skip)]
    pub line: usize,
}

/// Parse a replay log from `path`.
pub fn load(path: &Path) -> Result<Vec<ReplayFrame>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading replay log {}", path.display()))?;
    parse(&text).with_context(|| format!("parsing replay log {}", path.display()))
}

pub fn parse(text: &str) -> Result<Vec<ReplayFrame>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(idx, line)| {
            let mut frame: ReplayFrame =
                serde_json::from_str(line).with_context(|| format!("line {}", idx + 1))?;
            frame.line = idx + 1;
            let pixels = u64::from(frame.width) * u64::from(frame.height);
            if pixels > MAX_FRAME_PIXELS {
                bail!(
                    "line {}: frame {}x{} exceeds {MAX_FRAME_PIXELS} pixels",
                    frame.line,
                    frame.width,
                    frame.height
                );
            }
            Ok(frame)
        })
        .collect()
}

struct PendingFrame {
    sequence: u64,
    captured_at: DateTime<Utc>,
    width: u32,
    height: u32,
}

/// Frame source half of a replay.
pub struct ReplaySource {
    pending: Mutex<VecDeque<PendingFrame>>,
}

impl FrameSource for ReplaySource {
    fn next_frame(&self) -> Option<Frame> {
        let next = self.pending.lock().pop_front()?;
        let image = RgbImage::from_pixel(next.width, next.height, CANVAS);
        Some(Frame::new(image, next.sequence, next.captured_at))
    }
}

impl ReplaySource {
    pub fn remaining(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Detector half of a replay: yields the recorded faces for each frame.
pub struct ReplayDetector {
    by_sequence: Mutex<HashMap<u64, Vec<Detection>>>,
}

impl FaceDetector for ReplayDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, CollaboratorError> {
        Ok(self
            .by_sequence
            .lock()
            .remove(&frame.sequence)
            .unwrap_or_default())
    }
}

/// Split recorded frames into a frame source and the matching detector.
///
/// Fails if a frame's `start + offset_ms` is not a representable time.
pub fn split(
    frames: Vec<ReplayFrame>,
    start: DateTime<Utc>,
) -> Result<(ReplaySource, Arc<ReplayDetector>)> {
    let mut pending = VecDeque::with_capacity(frames.len());
    let mut by_sequence = HashMap::with_capacity(frames.len());

    for (sequence, frame) in (0u64..).zip(frames) {
        let captured_at = i64::try_from(frame.offset_ms)
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .and_then(|offset| start.checked_add_signed(offset));
        let Some(captured_at) = captured_at else {
            bail!(
                "line {}: offset_ms {} is out of range from {start}",
                frame.line,
                frame.offset_ms
            );
        };
        pending.push_back(PendingFrame {
            sequence,
            captured_at,
            width: frame.width,
            height: frame.height,
        });
        by_sequence.insert(sequence, frame.faces);
    }

    Ok((
        ReplaySource {
            pending: Mutex::new(pending),
        },
        Arc::new(ReplayDetector {
            by_sequence: Mutex::new(by_sequence),
        }),
    ))
}
