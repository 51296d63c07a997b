//! Live recognition loop.
//!
//! Runs on a dedicated OS thread: frames are pulled from a blocking source,
//! every `stride`-th frame is embedded and matched, and debounced marks are
//! handed to the async side over an mpsc channel for storage. The thread
//! owns the [`DebounceTracker`]; the gallery is shared and read by snapshot.

use chrono::{DateTime, Utc};
use rollcall_core::{
    Candidate, DebounceTracker, DetectedFace, Embedder, EmbedderError, EmbeddingGallery, FeedFrame,
    Matcher,
};
use rollcall_ledger::AttendanceEvent;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn live thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Running totals for the live loop, shared with the async side.
#[derive(Debug, Default)]
pub struct LiveCounters {
    frames_seen: AtomicU64,
    frames_processed: AtomicU64,
    failed_frames: AtomicU64,
    faces: AtomicU64,
    unknown_faces: AtomicU64,
    rejected_faces: AtomicU64,
    marks_accepted: AtomicU64,
    marks_suppressed: AtomicU64,
    insert_failures: AtomicU64,
}

/// Point-in-time copy of [`LiveCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LiveStatus {
    pub frames_seen: u64,
    pub frames_processed: u64,
    pub failed_frames: u64,
    pub faces: u64,
    pub unknown_faces: u64,
    pub rejected_faces: u64,
    pub marks_accepted: u64,
    pub marks_suppressed: u64,
    pub insert_failures: u64,
}

impl LiveCounters {
    pub fn snapshot(&self) -> LiveStatus {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        LiveStatus {
            frames_seen: get(&self.frames_seen),
            frames_processed: get(&self.frames_processed),
            failed_frames: get(&self.failed_frames),
            faces: get(&self.faces),
            unknown_faces: get(&self.unknown_faces),
            rejected_faces: get(&self.rejected_faces),
            marks_accepted: get(&self.marks_accepted),
            marks_suppressed: get(&self.marks_suppressed),
            insert_failures: get(&self.insert_failures),
        }
    }

    pub fn record_insert_failure(&self) {
        bump(&self.insert_failures);
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Match → debounce stage of the live path.
pub struct LiveRecognizer<M> {
    matcher: M,
    debounce: DebounceTracker,
    cooldown: Duration,
    group_id: Option<String>,
}

impl<M: Matcher> LiveRecognizer<M> {
    pub fn new(matcher: M, cooldown: Duration, group_id: Option<String>) -> Self {
        Self {
            matcher,
            debounce: DebounceTracker::new(),
            cooldown,
            group_id,
        }
    }

    /// Match every face of one frame and return the marks that pass the
    /// cool-down. Unknown and suppressed faces only move counters.
    pub fn process_frame(
        &mut self,
        faces: &[DetectedFace],
        candidates: &[Candidate],
        now: Instant,
        captured_at: Option<DateTime<Utc>>,
        counters: &LiveCounters,
    ) -> Vec<AttendanceEvent> {
        let mut marks = Vec::new();

        for face in faces {
            bump(&counters.faces);
            let result = match self.matcher.find_best_match(&face.embedding, candidates) {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(error = %e, "face rejected");
                    bump(&counters.rejected_faces);
                    continue;
                }
            };
            let Some(identity_id) = result.identity_id.as_deref() else {
                tracing::debug!(distance = result.distance, reason = result.message(), "unknown face");
                bump(&counters.unknown_faces);
                continue;
            };

            if !self.debounce.should_mark(identity_id, now, self.cooldown) {
                tracing::debug!(identity = identity_id, "mark suppressed by cool-down");
                bump(&counters.marks_suppressed);
                continue;
            }
            bump(&counters.marks_accepted);

            let mut event = AttendanceEvent::new(identity_id, result.confidence)
                .with_group(self.group_id.clone())
                .with_metadata("distance", result.distance)
                .at(captured_at);
            if let Some(bbox) = face.bbox.as_ref().and_then(|b| serde_json::to_value(b).ok()) {
                event = event.with_metadata("bbox", bbox);
            }
            marks.push(event);
        }

        marks
    }
}

/// Handle to the running live thread.
pub struct LiveHandle {
    counters: Arc<LiveCounters>,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl LiveHandle {
    pub fn status(&self) -> LiveStatus {
        self.counters.snapshot()
    }

    pub fn counters(&self) -> Arc<LiveCounters> {
        Arc::clone(&self.counters)
    }

    /// Ask the loop to exit before its next frame.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// Spawn the live loop on a dedicated OS thread.
///
/// The thread exits when the frame source ends, when [`LiveHandle::stop`]
/// is called, or when the marks receiver is dropped.
pub fn spawn_live_loop<I, E, M>(
    frames: I,
    mut embedder: E,
    mut recognizer: LiveRecognizer<M>,
    gallery: Arc<EmbeddingGallery>,
    stride: NonZeroUsize,
    marks: mpsc::Sender<AttendanceEvent>,
) -> Result<LiveHandle, EngineError>
where
    I: IntoIterator<Item = Result<FeedFrame, EmbedderError>> + Send + 'static,
    E: Embedder<Frame = FeedFrame> + Send + 'static,
    M: Matcher + Send + 'static,
{
    let counters = Arc::new(LiveCounters::default());
    let stop = Arc::new(AtomicBool::new(false));

    let thread = {
        let counters = Arc::clone(&counters);
        let stop = Arc::clone(&stop);
        std::thread::Builder::new()
            .name("rollcall-live".into())
            .spawn(move || {
                tracing::info!(stride = stride.get(), "live thread started");

                for (i, frame) in frames.into_iter().enumerate() {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    bump(&counters.frames_seen);
                    if (i + 1) % stride.get() != 0 {
                        continue;
                    }

                    let extracted = frame.and_then(|f| embedder.extract(&f).map(|faces| (f.captured_at, faces)));
                    let (captured_at, faces) = match extracted {
                        Ok(out) => out,
                        Err(e) => {
                            tracing::warn!(frame = i + 1, error = %e, "frame skipped");
                            bump(&counters.failed_frames);
                            continue;
                        }
                    };
                    bump(&counters.frames_processed);

                    let candidates = gallery.snapshot();
                    let events =
                        recognizer.process_frame(&faces, &candidates, Instant::now(), captured_at, &counters);
                    for event in events {
                        if marks.blocking_send(event).is_err() {
                            tracing::warn!("attendance recorder gone; stopping live thread");
                            return;
                        }
                    }
                }
                tracing::info!("live thread exiting");
            })?
    };

    Ok(LiveHandle {
        counters,
        stop,
        thread,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{Embedding, EuclideanMatcher, PrecomputedEmbedder};
    use tempfile::TempDir;

    const C: Duration = Duration::from_secs(10);

    fn face(v: [f32; 2]) -> DetectedFace {
        DetectedFace {
            bbox: None,
            embedding: Embedding::new(v.to_vec()),
        }
    }

    fn candidates() -> Vec<Candidate> {
        vec![
            Candidate {
                identity_id: "S1".into(),
                embedding: Embedding::new(vec![1.0, 0.0]),
            },
            Candidate {
                identity_id: "S2".into(),
                embedding: Embedding::new(vec![0.0, 1.0]),
            },
        ]
    }

    #[test]
    fn test_known_face_is_marked_once_per_cooldown() {
        let counters = LiveCounters::default();
        let mut r = LiveRecognizer::new(EuclideanMatcher::default(), C, Some("CS101".into()));
        let t0 = Instant::now();

        let marks = r.process_frame(&[face([1.0, 0.0])], &candidates(), t0, None, &counters);
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].identity_id, "S1");
        assert_eq!(marks[0].group_id.as_deref(), Some("CS101"));
        assert!(marks[0].metadata.contains_key("distance"));

        let again = r.process_frame(&[face([1.0, 0.0])], &candidates(), t0 + C / 2, None, &counters);
        assert!(again.is_empty());

        let later = r.process_frame(&[face([1.0, 0.0])], &candidates(), t0 + C, None, &counters);
        assert_eq!(later.len(), 1);

        let s = counters.snapshot();
        assert_eq!(s.marks_accepted, 2);
        assert_eq!(s.marks_suppressed, 1);
    }

    #[test]
    fn test_unknown_and_rejected_faces_are_counted() {
        let counters = LiveCounters::default();
        let mut r = LiveRecognizer::new(EuclideanMatcher::default(), C, None);

        let marks = r.process_frame(
            &[face([5.0, 5.0]), face([f32::NAN, 0.0]), face([0.0, 1.0])],
            &candidates(),
            Instant::now(),
            None,
            &counters,
        );
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].identity_id, "S2");

        let s = counters.snapshot();
        assert_eq!(s.faces, 3);
        assert_eq!(s.unknown_faces, 1);
        assert_eq!(s.rejected_faces, 1);
    }

    #[test]
    fn test_bbox_and_capture_time_are_attached() {
        let counters = LiveCounters::default();
        let mut r = LiveRecognizer::new(EuclideanMatcher::default(), C, None);
        let captured = Utc::now();
        let mut f = face([1.0, 0.0]);
        f.bbox = Some(rollcall_core::BoundingBox {
            x: 10.0,
            y: 20.0,
            width: 64.0,
            height: 64.0,
            confidence: None,
        });

        let marks = r.process_frame(&[f], &candidates(), Instant::now(), Some(captured), &counters);
        assert_eq!(marks[0].created_at, Some(captured));
        assert_eq!(marks[0].metadata["bbox"]["width"], serde_json::json!(64.0));
    }

    #[test]
    fn test_live_loop_strides_and_sends_marks() {
        let dir = TempDir::new().unwrap();
        let gallery = Arc::new(EmbeddingGallery::load(dir.path().join("gallery.json"), 2));
        gallery.set_single("S1", Embedding::new(vec![1.0, 0.0])).unwrap();

        let frames: Vec<Result<FeedFrame, EmbedderError>> = (1..=6)
            .map(|n| {
                Ok(FeedFrame {
                    index: Some(n),
                    captured_at: None,
                    faces: vec![face([1.0, 0.0])],
                })
            })
            .collect();

        let (tx, mut rx) = mpsc::channel(16);
        let handle = spawn_live_loop(
            frames,
            PrecomputedEmbedder,
            LiveRecognizer::new(EuclideanMatcher::default(), C, None),
            gallery,
            NonZeroUsize::new(2).unwrap(),
            tx,
        )
        .unwrap();

        let mut received = Vec::new();
        while let Some(event) = rx.blocking_recv() {
            received.push(event);
        }
        let status = handle.status();
        assert_eq!(received.len(), 1);
        assert_eq!(status.frames_seen, 6);
        assert_eq!(status.frames_processed, 3);
        assert_eq!(status.marks_suppressed, 2);
    }
}
