use faceguard_core::{AccessLogEntry, AccessLogSink, AccessOutcome, FaceMatch};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Running totals since the recorder was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecorderStats {
    /// Recognition results seen, including ones with no faces.
    pub results: u64,
    pub granted: u64,
    pub denied: u64,
    /// Entries the sink refused.
    pub write_failures: u64,
}

/// Writes one access-log entry per recognized face.
pub struct AccessRecorder {
    sink: Arc<dyn AccessLogSink>,
    results: AtomicU64,
    granted: AtomicU64,
    denied: AtomicU64,
    write_failures: AtomicU64,
}

impl AccessRecorder {
    pub fn new(sink: Arc<dyn AccessLogSink>) -> Self {
        Self {
            sink,
            results: AtomicU64::new(0),
            granted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    /// Log every face in one recognition result. Sink failures are logged
    /// and counted, never returned. Returns the entries written.
    pub fn record(&self, faces: &[FaceMatch]) -> usize {
        self.results.fetch_add(1, Ordering::Relaxed);
        let mut written = 0;
        for face in faces {
            let entry = AccessLogEntry::from_match(face);
            match entry.outcome {
                AccessOutcome::Granted => self.granted.fetch_add(1, Ordering::Relaxed),
                AccessOutcome::Denied => self.denied.fetch_add(1, Ordering::Relaxed),
            };
            match self.sink.append_log(&entry) {
                Ok(()) => {
                    written += 1;
                    tracing::info!(
                        outcome = %entry.outcome,
                        user_id = ?entry.user_id,
                        name = face.name.as_deref().unwrap_or("unknown"),
                        confidence = entry.confidence,
                        "access attempt"
                    );
                }
                Err(e) => {
                    self.write_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(error = %e, outcome = %entry.outcome, "failed to record access attempt");
                }
            }
        }
        written
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            results: self.results.load(Ordering::Relaxed),
            granted: self.granted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceguard_core::{BoundingBox, CollaboratorError};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySink {
        entries: Mutex<Vec<AccessLogEntry>>,
        broken: AtomicBool,
    }

    impl AccessLogSink for MemorySink {
        fn append_log(&self, entry: &AccessLogEntry) -> Result<(), CollaboratorError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(CollaboratorError::Storage("disk full".into()));
            }
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    fn face(user_id: Option<i64>) -> FaceMatch {
        FaceMatch {
            user_id,
            name: user_id.map(|_| "Ana".to_string()),
            distance: if user_id.is_some() { 0.35 } else { 0.9 },
            confidence: if user_id.is_some() { 65.0 } else { 0.0 },
            location: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 80.0,
                height: 80.0,
                confidence: 0.98,
                landmarks: None,
            },
        }
    }

    #[test]
    fn test_known_and_unknown_faces() {
        let sink = Arc::new(MemorySink::default());
        let recorder = AccessRecorder::new(sink.clone());

        assert_eq!(recorder.record(&[face(Some(3)), face(None)]), 2);

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries[0].outcome, AccessOutcome::Granted);
        assert_eq!(entries[0].user_id, Some(3));
        assert_eq!(entries[0].confidence, 65.0);
        assert_eq!(entries[1].outcome, AccessOutcome::Denied);
        assert_eq!(entries[1].user_id, None);

        let stats = recorder.stats();
        assert_eq!((stats.results, stats.granted, stats.denied), (1, 1, 1));
    }

    #[test]
    fn test_empty_result_writes_nothing() {
        let sink = Arc::new(MemorySink::default());
        let recorder = AccessRecorder::new(sink.clone());
        assert_eq!(recorder.record(&[]), 0);
        assert!(sink.entries.lock().unwrap().is_empty());
        assert_eq!(recorder.stats().results, 1);
    }

    #[test]
    fn test_sink_failure_is_swallowed() {
        let sink = Arc::new(MemorySink::default());
        sink.broken.store(true, Ordering::SeqCst);
        let recorder = AccessRecorder::new(sink);
        assert_eq!(recorder.record(&[face(Some(1))]), 0);
        assert_eq!(recorder.stats().write_failures, 1);
    }
}
