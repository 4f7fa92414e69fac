//! Per-frame recognition: detect, match or register, and log visits under
//! the cooldown policy.
//!
//! No failure inside a frame escapes [`RecognitionPipeline::process_frame`]:
//! a face whose registration fails is dropped from that frame's results, a
//! visit whose persistence fails is still counted, and a detector error
//! yields an empty frame.

use crate::collaborator::{FaceDetector, IdentityRegistrar, SnapshotEncoder, VisitStore};
use crate::cooldown::VisitCooldownTracker;
use crate::matcher::{IdentityMatcher, MatchError};
use crate::snapshot;
use crate::source::{Frame, FrameSource};
use crate::types::{Detection, FaceResult, Identity, IdentityId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// External services the pipeline calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub detector: Arc<dyn FaceDetector>,
    pub registrar: Arc<dyn IdentityRegistrar>,
    pub visits: Arc<dyn VisitStore>,
    pub encoder: Arc<dyn SnapshotEncoder>,
}

/// Results for one processed frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    /// One entry per successfully processed face, in detection order.
    pub faces: Vec<FaceResult>,
}

/// Counters returned by [`RecognitionPipeline::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub frames: u64,
    pub idle_ticks: u64,
}

pub struct RecognitionPipeline {
    matcher: IdentityMatcher,
    cooldown: VisitCooldownTracker,
    collaborators: Collaborators,
}

impl RecognitionPipeline {
    pub fn new(
        matcher: IdentityMatcher,
        cooldown: VisitCooldownTracker,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            matcher,
            cooldown,
            collaborators,
        }
    }

    pub fn matcher(&self) -> &IdentityMatcher {
        &self.matcher
    }

    pub fn cooldown(&self) -> &VisitCooldownTracker {
        &self.cooldown
    }

    /// Forget all cooldown state, e.g. when a new session starts.
    pub fn reset_session(&self) {
        self.cooldown.clear();
        tracing::info!("visit cooldown state cleared");
    }

    /// Process every face detected in `frame`, using its capture time as now.
    pub fn process_frame(&self, frame: &Frame) -> Vec<FaceResult> {
        let detections = match self.collaborators.detector.detect(frame) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "detector failed; skipping frame");
                return Vec::new();
            }
        };

        if detections.is_empty() {
            tracing::trace!(seq = frame.sequence, "no faces");
            return Vec::new();
        }

        detections
            .iter()
            .enumerate()
            .filter_map(|(index, detection)| {
                match self.process_face(frame, detection, frame.captured_at) {
                    Ok(result) => Some(result),
                    Err(e) => {
                        tracing::warn!(seq = frame.sequence, face = index, error = %e, "face skipped");
                        None
                    }
                }
            })
            .collect()
    }

    fn process_face(
        &self,
        frame: &Frame,
        detection: &Detection,
        now: DateTime<Utc>,
    ) -> Result<FaceResult, MatchError> {
        let outcome = self.matcher.find_or_register(
            &detection.embedding,
            self.collaborators.registrar.as_ref(),
            now,
        )?;
        let mut identity = outcome.identity;

        let claimed = self.claim_visit(identity.id, now)?;
        let visit_logged = claimed.is_some();
        if let Some(updated) = claimed {
            identity = updated;

            let snapshot = match snapshot::crop_face(frame, &detection.bbox) {
                Ok(crop) => self.collaborators.encoder.encode(&crop),
                Err(e) => {
                    tracing::debug!(identity = %identity.id, error = %e, "visit logged without snapshot");
                    None
                }
            };

            // The cooldown is already claimed: a failed write is not retried
            // on every following frame of the window.
            if let Err(e) = self
                .collaborators
                .visits
                .persist(&identity, now, snapshot.as_deref())
            {
                tracing::warn!(identity = %identity.id, error = %e, "visit not persisted");
            }

            tracing::info!(
                identity = %identity.id,
                visit_count = identity.visit_count,
                is_new = outcome.is_new,
                "visit logged"
            );
        } else {
            tracing::debug!(identity = %identity.id, "sighting within cooldown");
        }

        Ok(FaceResult {
            identity: identity.id,
            name: identity.name,
            visit_count: identity.visit_count,
            bbox: detection.bbox,
            is_new: outcome.is_new,
            visit_logged,
        })
    }

    /// Claim the cooldown for `id` and count the visit in the store.
    ///
    /// `Ok(None)` means the sighting is inside the cooldown window. If the
    /// store no longer knows `id` (a reload ran since the match) the claim
    /// is released so the next sighting can still log.
    fn claim_visit(
        &self,
        id: IdentityId,
        now: DateTime<Utc>,
    ) -> Result<Option<Identity>, MatchError> {
        if !self.cooldown.try_claim(id, now) {
            return Ok(None);
        }
        match self.matcher.store().record_visit(id, now) {
            Ok(identity) => Ok(Some(identity)),
            Err(e) => {
                self.cooldown.release(id, now);
                Err(e.into())
            }
        }
    }

    /// Poll `source` and process frames until `stop` is set.
    ///
    /// The flag is checked between frames only, so a stop never leaves a
    /// frame half-applied. When no frame is available the loop sleeps for
    /// `poll_interval` and tries again.
    pub fn run<F>(
        &self,
        source: &dyn FrameSource,
        stop: &AtomicBool,
        poll_interval: Duration,
        mut on_frame: F,
    ) -> RunStats
    where
        F: FnMut(FrameReport),
    {
        let mut stats = RunStats::default();

        while !stop.load(Ordering::Acquire) {
            let Some(frame) = source.next_frame() else {
                stats.idle_ticks += 1;
                std::thread::sleep(poll_interval);
                continue;
            };

            let faces = self.process_frame(&frame);
            stats.frames += 1;
            on_frame(FrameReport {
                sequence: frame.sequence,
                captured_at: frame.captured_at,
                faces,
            });
        }

        tracing::info!(frames = stats.frames, idle_ticks = stats.idle_ticks, "recognition loop stopped");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::CollaboratorError;
    use crate::snapshot::JpegSnapshotEncoder;
    use crate::store::EmbeddingStore;
    use crate::types::{BoundingBox, Embedding, Identity, IdentityId};
    use chrono::{TimeDelta, TimeZone};
    use image::RgbImage;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::AtomicUsize;

    /// Returns the detections scripted for each frame sequence number.
    #[derive(Default)]
    struct ScriptedDetector {
        by_sequence: HashMap<u64, Vec<Detection>>,
        fail_on: Option<u64>,
    }

    impl FaceDetector for ScriptedDetector {
        fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, CollaboratorError> {
            if self.fail_on == Some(frame.sequence) {
                return Err(CollaboratorError::Detection("model crashed".into()));
            }
            Ok(self.by_sequence.get(&frame.sequence).cloned().unwrap_or_default())
        }
    }

    /// Registrar that fails the calls whose (0-based) index is listed.
    #[derive(Default)]
    struct MemoryRegistrar {
        calls: AtomicUsize,
        fail_calls: Vec<usize>,
    }

    impl IdentityRegistrar for MemoryRegistrar {
        fn register(&self, _: &Embedding, now: DateTime<Utc>) -> Result<Identity, CollaboratorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_calls.contains(&call) {
                return Err(CollaboratorError::Registration("storage unavailable".into()));
            }
            Ok(Identity::new(IdentityId::new_v4(), now))
        }
    }

    #[derive(Debug, Clone)]
    struct Persisted {
        identity: IdentityId,
        visit_count: u32,
        timestamp: DateTime<Utc>,
        has_snapshot: bool,
    }

    #[derive(Default)]
    struct MemoryVisits {
        rows: Mutex<Vec<Persisted>>,
        fail: bool,
    }

    impl VisitStore for MemoryVisits {
        fn persist(
            &self,
            identity: &Identity,
            timestamp: DateTime<Utc>,
            snapshot: Option<&[u8]>,
        ) -> Result<(), CollaboratorError> {
            if self.fail {
                return Err(CollaboratorError::Persistence("disk full".into()));
            }
            self.rows.lock().push(Persisted {
                identity: identity.id,
                visit_count: identity.visit_count,
                timestamp,
                has_snapshot: snapshot.is_some(),
            });
            Ok(())
        }
    }

    struct Harness {
        pipeline: RecognitionPipeline,
        visits: Arc<MemoryVisits>,
        registrar: Arc<MemoryRegistrar>,
    }

    fn harness(
        detector: ScriptedDetector,
        registrar: MemoryRegistrar,
        visits: MemoryVisits,
        threshold: f32,
        cooldown_secs: i64,
    ) -> Harness {
        let visits = Arc::new(visits);
        let registrar = Arc::new(registrar);
        let pipeline = RecognitionPipeline::new(
            IdentityMatcher::new(EmbeddingStore::new(), threshold),
            VisitCooldownTracker::new(TimeDelta::seconds(cooldown_secs)),
            Collaborators {
                detector: Arc::new(detector),
                registrar: registrar.clone(),
                visits: visits.clone(),
                encoder: Arc::new(JpegSnapshotEncoder::default()),
            },
        );
        Harness {
            pipeline,
            visits,
            registrar,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn frame(sequence: u64, at_secs: i64) -> Frame {
        Frame::new(
            RgbImage::new(64, 64),
            sequence,
            t0() + TimeDelta::seconds(at_secs),
        )
    }

    fn face(values: &[f32], bbox: [i32; 4]) -> Detection {
        Detection {
            embedding: Embedding::new(values.to_vec()),
            bbox: bbox.into(),
        }
    }

    const E1: [f32; 4] = [0.1, 0.7, 0.2, 0.4];
    const E2: [f32; 4] = [0.9, -0.1, 0.0, 0.1];

    #[test]
    fn test_end_to_end_visit_dedup() {
        let detector = ScriptedDetector {
            by_sequence: (1..=3).map(|s| (s, vec![face(&E1, [4, 4, 36, 36])])).collect(),
            ..Default::default()
        };
        let h = harness(detector, MemoryRegistrar::default(), MemoryVisits::default(), 0.5, 30);

        let r1 = h.pipeline.process_frame(&frame(1, 0));
        assert_eq!(r1.len(), 1);
        assert!(r1[0].is_new && r1[0].visit_logged);
        assert_eq!(r1[0].visit_count, 1);
        let p1 = r1[0].identity;

        let r2 = h.pipeline.process_frame(&frame(2, 5));
        assert_eq!(r2[0].identity, p1);
        assert!(!r2[0].is_new);
        assert!(!r2[0].visit_logged);
        assert_eq!(r2[0].visit_count, 1);
        assert_eq!(h.visits.rows.lock().len(), 1, "no visit inside the cooldown");

        let r3 = h.pipeline.process_frame(&frame(3, 35));
        assert_eq!(r3[0].identity, p1);
        assert!(r3[0].visit_logged);
        assert_eq!(r3[0].visit_count, 2);

        let rows = h.visits.rows.lock();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].identity, p1);
        assert_eq!(rows[1].visit_count, 2);
        assert_eq!(rows[1].timestamp, t0() + TimeDelta::seconds(35));
        assert!(rows.iter().all(|r| r.has_snapshot));

        let stored = h.pipeline.matcher().store().get(p1).unwrap();
        assert_eq!(stored.visit_count, 2);
        assert_eq!(stored.last_seen, t0() + TimeDelta::seconds(35));
        assert_eq!(h.registrar.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_frame_yields_no_results() {
        let h = harness(
            ScriptedDetector::default(),
            MemoryRegistrar::default(),
            MemoryVisits::default(),
            0.5,
            30,
        );
        assert!(h.pipeline.process_frame(&frame(1, 0)).is_empty());
        assert!(h.visits.rows.lock().is_empty());
    }

    #[test]
    fn test_detector_failure_yields_empty_frame() {
        let detector = ScriptedDetector {
            by_sequence: HashMap::from([(2, vec![face(&E1, [0, 0, 10, 10])])]),
            fail_on: Some(1),
        };
        let h = harness(detector, MemoryRegistrar::default(), MemoryVisits::default(), 0.5, 30);

        assert!(h.pipeline.process_frame(&frame(1, 0)).is_empty());
        assert_eq!(h.pipeline.process_frame(&frame(2, 1)).len(), 1);
    }

    #[test]
    fn test_results_follow_detection_order() {
        let detector = ScriptedDetector {
            by_sequence: HashMap::from([(
                1,
                vec![face(&E2, [30, 0, 60, 30]), face(&E1, [0, 0, 30, 30])],
            )]),
            ..Default::default()
        };
        let h = harness(detector, MemoryRegistrar::default(), MemoryVisits::default(), 0.5, 30);

        let results = h.pipeline.process_frame(&frame(1, 0));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].bbox, BoundingBox::new(30, 0, 60, 30));
        assert_eq!(results[1].bbox, BoundingBox::new(0, 0, 30, 30));
        assert_ne!(results[0].identity, results[1].identity);
    }

    #[test]
    fn test_registration_failure_skips_only_that_face() {
        let detector = ScriptedDetector {
            by_sequence: HashMap::from([
                (1, vec![face(&E1, [0, 0, 20, 20]), face(&E2, [20, 0, 40, 20])]),
                (2, vec![face(&E1, [0, 0, 20, 20])]),
            ]),
            ..Default::default()
        };
        let registrar = MemoryRegistrar {
            fail_calls: vec![0],
            ..Default::default()
        };
        let h = harness(detector, registrar, MemoryVisits::default(), 0.5, 30);

        let r1 = h.pipeline.process_frame(&frame(1, 0));
        assert_eq!(r1.len(), 1, "failed face must not appear");
        assert_eq!(r1[0].bbox, BoundingBox::new(20, 0, 40, 20));

        // The face that failed registration gets a fresh attempt next frame.
        let r2 = h.pipeline.process_frame(&frame(2, 1));
        assert_eq!(r2.len(), 1);
        assert!(r2[0].is_new);
        assert_eq!(h.pipeline.matcher().store().len(), 2);
    }

    #[test]
    fn test_persistence_failure_still_counts_and_cools_down() {
        let detector = ScriptedDetector {
            by_sequence: (1..=2).map(|s| (s, vec![face(&E1, [0, 0, 20, 20])])).collect(),
            ..Default::default()
        };
        let visits = MemoryVisits {
            fail: true,
            ..Default::default()
        };
        let h = harness(detector, MemoryRegistrar::default(), visits, 0.5, 30);

        let r1 = h.pipeline.process_frame(&frame(1, 0));
        assert!(r1[0].visit_logged);
        assert_eq!(r1[0].visit_count, 1);

        let r2 = h.pipeline.process_frame(&frame(2, 10));
        assert!(!r2[0].visit_logged, "failed write must not be retried inside the window");
        assert_eq!(r2[0].visit_count, 1);
    }

    #[test]
    fn test_empty_crop_logs_visit_without_snapshot() {
        let detector = ScriptedDetector {
            by_sequence: HashMap::from([(1, vec![face(&E1, [200, 200, 220, 220])])]),
            ..Default::default()
        };
        let h = harness(detector, MemoryRegistrar::default(), MemoryVisits::default(), 0.5, 30);

        let results = h.pipeline.process_frame(&frame(1, 0));
        assert!(results[0].visit_logged);
        let rows = h.visits.rows.lock();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].has_snapshot);
    }

    #[test]
    fn test_dimension_mismatch_face_skipped() {
        let detector = ScriptedDetector {
            by_sequence: HashMap::from([
                (1, vec![face(&E1, [0, 0, 10, 10])]),
                (2, vec![face(&[1.0, 0.0], [0, 0, 10, 10]), face(&E1, [0, 0, 10, 10])]),
            ]),
            ..Default::default()
        };
        let h = harness(detector, MemoryRegistrar::default(), MemoryVisits::default(), 0.5, 30);

        h.pipeline.process_frame(&frame(1, 0));
        let r2 = h.pipeline.process_frame(&frame(2, 1));
        assert_eq!(r2.len(), 1);
        assert!(!r2[0].is_new);
        assert_eq!(h.registrar.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_session_allows_immediate_relog() {
        let detector = ScriptedDetector {
            by_sequence: (1..=2).map(|s| (s, vec![face(&E1, [0, 0, 20, 20])])).collect(),
            ..Default::default()
        };
        let h = harness(detector, MemoryRegistrar::default(), MemoryVisits::default(), 0.5, 30);

        h.pipeline.process_frame(&frame(1, 0));
        h.pipeline.reset_session();
        let r2 = h.pipeline.process_frame(&frame(2, 1));
        assert!(r2[0].visit_logged);
        assert_eq!(r2[0].visit_count, 2);
    }

    #[test]
    fn test_visit_claim_released_when_identity_vanished() {
        let h = harness(
            ScriptedDetector::default(),
            MemoryRegistrar::default(),
            MemoryVisits::default(),
            0.5,
            30,
        );
        // Matched before a reload dropped it from the store.
        let gone = IdentityId::new_v4();

        assert!(matches!(
            h.pipeline.claim_visit(gone, t0()),
            Err(MatchError::Store(_))
        ));
        assert_eq!(h.pipeline.cooldown().tracked(), 0);
        assert!(h.pipeline.cooldown().should_log(gone, t0() + TimeDelta::seconds(1)));
    }

    #[test]
    fn test_renamed_identity_reported_by_name() {
        let detector = ScriptedDetector {
            by_sequence: (1..=2).map(|s| (s, vec![face(&E1, [0, 0, 20, 20])])).collect(),
            ..Default::default()
        };
        let h = harness(detector, MemoryRegistrar::default(), MemoryVisits::default(), 0.5, 30);

        let id = h.pipeline.process_frame(&frame(1, 0))[0].identity;
        h.pipeline.matcher().store().rename(id, Some("Grace".into())).unwrap();
        let r2 = h.pipeline.process_frame(&frame(2, 1));
        assert_eq!(r2[0].name.as_deref(), Some("Grace"));
    }

    /// Hands out queued frames, then reports "no frame" forever.
    struct QueueSource(Mutex<VecDeque<Frame>>);

    impl FrameSource for QueueSource {
        fn next_frame(&self) -> Option<Frame> {
            self.0.lock().pop_front()
        }
    }

    #[test]
    fn test_run_processes_until_stopped() {
        let detector = ScriptedDetector {
            by_sequence: (1..=3).map(|s| (s, vec![face(&E1, [0, 0, 20, 20])])).collect(),
            ..Default::default()
        };
        let h = harness(detector, MemoryRegistrar::default(), MemoryVisits::default(), 0.5, 30);
        let source = QueueSource(Mutex::new((1..=3).map(|s| frame(s, s as i64)).collect()));
        let stop = AtomicBool::new(false);

        let mut reports = Vec::new();
        let stats = h.pipeline.run(&source, &stop, Duration::from_millis(1), |report| {
            reports.push(report);
            if reports.len() == 3 {
                stop.store(true, Ordering::Release);
            }
        });

        assert_eq!(stats.frames, 3);
        assert_eq!(reports.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(h.visits.rows.lock().len(), 1);
    }

    #[test]
    fn test_run_idles_without_frames_and_honours_stop() {
        let h = harness(
            ScriptedDetector::default(),
            MemoryRegistrar::default(),
            MemoryVisits::default(),
            0.5,
            30,
        );
        let source = QueueSource(Mutex::new(VecDeque::new()));
        let stop = AtomicBool::new(false);

        let stats = std::thread::scope(|s| {
            let runner = s.spawn(|| {
                h.pipeline
                    .run(&source, &stop, Duration::from_millis(1), |_| panic!("no frames expected"))
            });
            std::thread::sleep(Duration::from_millis(20));
            stop.store(true, Ordering::Release);
            runner.join().unwrap()
        });

        assert_eq!(stats.frames, 0);
        assert!(stats.idle_ticks > 0);
    }

    #[test]
    fn test_run_with_stop_already_set_does_nothing() {
        let h = harness(
            ScriptedDetector::default(),
            MemoryRegistrar::default(),
            MemoryVisits::default(),
            0.5,
            30,
        );
        let source = QueueSource(Mutex::new(VecDeque::from([frame(1, 0)])));
        let stop = AtomicBool::new(true);

        let stats = h.pipeline.run(&source, &stop, Duration::from_millis(1), |_| {});
        assert_eq!(stats, RunStats::default());
        assert!(source.next_frame().is_some(), "frame must be left unconsumed");
    }
}
