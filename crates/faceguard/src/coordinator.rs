//! Live recognition loop.
//!
//! A control thread drives two tickers: a fast capture tick that pulls the
//! latest frame from the shared camera and a slow recognition tick that runs
//! the pipeline on a snapshot of that frame in a short-lived worker thread.
//! At most one recognition job exists at a time. Stopping cancels the job,
//! waits a bounded time for background threads and releases the camera.

use crate::access::AccessRecorder;
use crossbeam_channel::{select, tick, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use faceguard_core::{FaceMatch, ImageRef, RecognitionError, RecognitionPipeline};
use faceguard_hw::{CameraResourceManager, CameraState, Frame};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

const EVENT_CAPACITY: usize = 256;
const SETTLE_POLL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("camera unavailable (camera state: {0})")]
    DeviceUnavailable(CameraState),
    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: CoordinatorState,
    },
    #[error("background threads still running after {0:?}; abandoned")]
    ShutdownTimeout(Duration),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum CoordinatorState {
    Inactive = 0,
    Starting = 1,
    Active = 2,
    Stopping = 3,
    Error = 4,
}

impl CoordinatorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CoordinatorState::Starting,
            2 => CoordinatorState::Active,
            3 => CoordinatorState::Stopping,
            4 => CoordinatorState::Error,
            _ => CoordinatorState::Inactive,
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoordinatorState::Inactive => "inactive",
            CoordinatorState::Starting => "starting",
            CoordinatorState::Active => "active",
            CoordinatorState::Stopping => "stopping",
            CoordinatorState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Id this coordinator registers with the camera manager.
    pub consumer_id: String,
    pub capture_interval: Duration,
    pub recognition_interval: Duration,
    /// Consecutive frameless capture ticks before the camera is reinitialized.
    pub failure_threshold: u32,
    /// Pause after a successful reinitialization before capturing again.
    pub settle_delay: Duration,
    /// Upper bound on how long `stop` waits for background threads.
    pub join_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            consumer_id: "recognition".to_string(),
            capture_interval: Duration::from_millis(33),
            recognition_interval: Duration::from_secs(1),
            failure_threshold: 5,
            settle_delay: Duration::from_millis(500),
            join_timeout: Duration::from_secs(3),
        }
    }
}

/// Something the coordinator reports to its owner.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    RecognitionResult {
        session: u64,
        frame_sequence: u32,
        faces: Vec<FaceMatch>,
        elapsed: Duration,
    },
    RecognitionFailed {
        session: u64,
        error: String,
    },
    /// Reinitialization failed; the coordinator is in `Error` until stopped.
    CameraLost {
        session: u64,
    },
}

impl CoordinatorEvent {
    pub fn session(&self) -> u64 {
        match self {
            CoordinatorEvent::RecognitionResult { session, .. }
            | CoordinatorEvent::RecognitionFailed { session, .. }
            | CoordinatorEvent::CameraLost { session } => *session,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub capture_ticks: u64,
    pub frames: u64,
    pub submitted: u64,
    /// Recognition ticks ignored because a job was still running.
    pub skipped: u64,
    pub completed: u64,
    pub failed: u64,
    pub reinitializations: u64,
}

#[derive(Default)]
struct Counters {
    capture_ticks: AtomicU64,
    frames: AtomicU64,
    submitted: AtomicU64,
    skipped: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    reinitializations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CoordinatorStats {
        CoordinatorStats {
            capture_ticks: self.capture_ticks.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reinitializations: self.reinitializations.load(Ordering::Relaxed),
        }
    }
}

/// Cancellation flag that doubles as the emission lock of one job.
///
/// Once `cancel` returns, `emit` never runs its closure again.
#[derive(Default)]
struct CancelToken {
    cancelled: Mutex<bool>,
}

impl CancelToken {
    fn cancel(&self) {
        *lock(&self.cancelled) = true;
    }

    fn is_cancelled(&self) -> bool {
        *lock(&self.cancelled)
    }

    fn emit(&self, publish: impl FnOnce()) -> bool {
        let cancelled = lock(&self.cancelled);
        if *cancelled {
            return false;
        }
        publish();
        true
    }
}

/// A background thread plus the channel that disconnects when it exits.
struct Worker {
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn(name: &str, body: impl FnOnce() + Send + 'static) -> std::io::Result<Self> {
        let (done_tx, done) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _done = done_tx;
            body();
        })?;
        Ok(Self { done, handle })
    }

    fn is_finished(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Wait until `deadline`; returns false (and detaches the thread) on timeout.
    fn join_until(self, deadline: Instant) -> bool {
        let name = self.handle.thread().name().unwrap_or("worker").to_string();
        match self.done.recv_deadline(deadline) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(thread = %name, "thread did not finish in time; abandoning it");
                false
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    tracing::error!(thread = %name, "thread panicked");
                }
                true
            }
        }
    }
}

struct Job {
    token: Arc<CancelToken>,
    worker: Worker,
}

struct ControlThread {
    stop: Sender<()>,
    worker: Worker,
}

struct Inner {
    camera: Arc<CameraResourceManager>,
    pipeline: Arc<RecognitionPipeline>,
    recorder: Option<Arc<AccessRecorder>>,
    config: CoordinatorConfig,
    state: AtomicU8,
    session: AtomicU64,
    failures: AtomicU32,
    latest: Mutex<Option<Frame>>,
    job: Mutex<Option<Job>>,
    events: Sender<CoordinatorEvent>,
    counters: Counters,
}

/// Runs recognition periodically against the shared camera.
pub struct RecognitionCoordinator {
    inner: Arc<Inner>,
    events: Receiver<CoordinatorEvent>,
    control: Mutex<Option<ControlThread>>,
}

impl RecognitionCoordinator {
    pub fn new(
        camera: Arc<CameraResourceManager>,
        pipeline: Arc<RecognitionPipeline>,
        recorder: Option<Arc<AccessRecorder>>,
        config: CoordinatorConfig,
    ) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                camera,
                pipeline,
                recorder,
                config,
                state: AtomicU8::new(CoordinatorState::Inactive as u8),
                session: AtomicU64::new(0),
                failures: AtomicU32::new(0),
                latest: Mutex::new(None),
                job: Mutex::new(None),
                events: tx,
                counters: Counters::default(),
            }),
            events: rx,
            control: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.state()
    }

    /// Current session; incremented by every `start` and `stop`.
    pub fn session(&self) -> u64 {
        self.inner.session.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.inner.counters.snapshot()
    }

    /// Copy of the most recent captured frame.
    pub fn latest_frame(&self) -> Option<Frame> {
        lock(&self.inner.latest).clone()
    }

    /// Acquire the camera and start ticking.
    pub fn start(&self) -> Result<(), CoordinatorError> {
        let mut control = lock(&self.control);
        let state = self.inner.state();
        if !matches!(state, CoordinatorState::Inactive | CoordinatorState::Error) {
            return Err(CoordinatorError::InvalidState { action: "start", state });
        }
        if let Some(previous) = control.take() {
            // Left behind by a run that ended in Error; it has already exited.
            drop(previous.stop);
            previous.worker.join_until(Instant::now() + self.inner.config.join_timeout);
        }
        // A job of the failed run may still be analyzing; it must not record.
        let stale_job = lock(&self.inner.job).take();
        if let Some(job) = stale_job {
            job.token.cancel();
            if !job.worker.is_finished() {
                tracing::debug!("recognition job of the previous run detached");
            }
        }

        self.inner.set_state(CoordinatorState::Starting);
        let session = self.inner.session.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.failures.store(0, Ordering::SeqCst);

        let consumer = self.inner.config.consumer_id.as_str();
        if !self.inner.camera.acquire(consumer) {
            let camera_state = self.inner.camera.state();
            self.inner.set_state(CoordinatorState::Error);
            tracing::error!(session, camera_state = %camera_state, "recognition could not start");
            return Err(CoordinatorError::DeviceUnavailable(camera_state));
        }

        self.inner.set_state(CoordinatorState::Active);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let inner = Arc::clone(&self.inner);
        match Worker::spawn("faceguard-control", move || run_control(&inner, &stop_rx)) {
            Ok(worker) => {
                *control = Some(ControlThread { stop: stop_tx, worker });
                tracing::info!(
                    session,
                    capture_ms = self.inner.config.capture_interval.as_millis() as u64,
                    recognition_ms = self.inner.config.recognition_interval.as_millis() as u64,
                    "recognition started"
                );
                Ok(())
            }
            Err(e) => {
                self.inner.camera.release(consumer);
                self.inner.set_state(CoordinatorState::Inactive);
                Err(e.into())
            }
        }
    }

    /// Stop ticking, cancel any running job and release the camera.
    ///
    /// Always ends `Inactive`. Returns `ShutdownTimeout` when a background
    /// thread had to be abandoned; it will never emit another event.
    ///
    /// The camera is released first: a reinitialization in progress on the
    /// control thread gives up at its next checkpoint instead of running
    /// through its retries.
    pub fn stop(&self) -> Result<(), CoordinatorError> {
        let mut control = lock(&self.control);
        if self.inner.state() == CoordinatorState::Inactive {
            return Ok(());
        }
        self.inner.set_state(CoordinatorState::Stopping);
        let session = self.inner.session.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + self.inner.config.join_timeout;
        let mut clean = true;

        self.inner.camera.release(&self.inner.config.consumer_id);

        if let Some(ctl) = control.take() {
            drop(ctl.stop);
            clean &= ctl.worker.join_until(deadline);
        }
        let job = lock(&self.inner.job).take();
        if let Some(job) = job {
            job.token.cancel();
            clean &= job.worker.join_until(deadline);
        }

        *lock(&self.inner.latest) = None;
        self.inner.failures.store(0, Ordering::SeqCst);
        self.inner.set_state(CoordinatorState::Inactive);

        if clean {
            tracing::info!(session, "recognition stopped");
            Ok(())
        } else {
            let err = CoordinatorError::ShutdownTimeout(self.inner.config.join_timeout);
            tracing::warn!(session, error = %err, "recognition stopped uncleanly");
            Err(err)
        }
    }

    /// Pull one frame from the camera. Returns whether a frame was obtained.
    pub fn capture_tick(&self) -> bool {
        self.inner.capture_tick()
    }

    /// Submit a recognition job unless one is already running.
    /// Returns whether a job was submitted.
    pub fn recognition_tick(&self) -> bool {
        self.inner.recognition_tick()
    }

    /// Pending events of the current session.
    pub fn try_events(&self) -> Vec<CoordinatorEvent> {
        let session = self.session();
        self.events.try_iter().filter(|e| e.session() == session).collect()
    }

    /// Next event of the current session, waiting up to `timeout`.
    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<CoordinatorEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let event = self.events.recv_deadline(deadline).ok()?;
            if event.session() == self.session() {
                return Some(event);
            }
        }
    }
}

impl Drop for RecognitionCoordinator {
    fn drop(&mut self) {
        if self.inner.state() != CoordinatorState::Inactive {
            let _ = self.stop();
        }
    }
}

impl Inner {
    fn state(&self) -> CoordinatorState {
        CoordinatorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, next: CoordinatorState) {
        let prev = CoordinatorState::from_u8(self.state.swap(next as u8, Ordering::SeqCst));
        if prev != next {
            tracing::debug!(from = %prev, to = %next, "coordinator state");
        }
    }

    fn capture_tick(&self) -> bool {
        if self.state() != CoordinatorState::Active {
            return false;
        }
        Counters::bump(&self.counters.capture_ticks);

        if let Some(frame) = self.camera.get_frame() {
            self.failures.store(0, Ordering::SeqCst);
            Counters::bump(&self.counters.frames);
            *lock(&self.latest) = Some(frame);
            return true;
        }

        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(failures, "no frame from camera");
        if failures >= self.config.failure_threshold.max(1) {
            self.failures.store(0, Ordering::SeqCst);
            self.recover(failures);
        }
        false
    }

    fn recover(&self, failures: u32) -> bool {
        Counters::bump(&self.counters.reinitializations);
        tracing::warn!(failures, "camera stopped delivering frames; reinitializing");

        if self.camera.reinitialize() {
            self.settle();
            tracing::info!("camera recovered");
            return true;
        }

        let camera_state = self.camera.state();
        let failed = self
            .state
            .compare_exchange(
                CoordinatorState::Active as u8,
                CoordinatorState::Error as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if failed {
            tracing::error!(camera_state = %camera_state, "camera reinitialization failed");
            let session = self.session.load(Ordering::SeqCst);
            self.publish(CoordinatorEvent::CameraLost { session });
        }
        false
    }

    /// Let the device settle after a reopen; cut short by `stop`.
    fn settle(&self) {
        let deadline = Instant::now() + self.config.settle_delay;
        while self.state() == CoordinatorState::Active {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(SETTLE_POLL.min(deadline - now));
        }
    }

    fn recognition_tick(self: &Arc<Self>) -> bool {
        let mut job = lock(&self.job);
        // Checked under the job lock so `stop` cannot miss a job spawned here.
        if self.state() != CoordinatorState::Active {
            return false;
        }
        if job.as_ref().is_some_and(|running| !running.worker.is_finished()) {
            Counters::bump(&self.counters.skipped);
            tracing::debug!("recognition still running; tick skipped");
            return false;
        }
        if let Some(finished) = job.take() {
            finished.worker.join_until(Instant::now());
        }

        let Some(frame) = lock(&self.latest).clone() else {
            return false;
        };
        let session = self.session.load(Ordering::SeqCst);
        let token = Arc::new(CancelToken::default());

        let inner = Arc::clone(self);
        let job_token = Arc::clone(&token);
        let sequence = frame.sequence;
        match Worker::spawn("faceguard-recognize", move || inner.run_job(&job_token, session, frame)) {
            Ok(worker) => {
                *job = Some(Job { token, worker });
                Counters::bump(&self.counters.submitted);
                tracing::debug!(session, sequence, "recognition job submitted");
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn recognition worker");
                false
            }
        }
    }

    fn run_job(&self, token: &CancelToken, session: u64, frame: Frame) {
        if token.is_cancelled() {
            return;
        }
        let image = ImageRef {
            data: &frame.data,
            width: frame.width,
            height: frame.height,
            channels: frame.format.channels() as u8,
        };
        let started = Instant::now();
        let result = self.pipeline.recognize(&image);
        let elapsed = started.elapsed();

        let emitted = token.emit(|| self.finish_job(session, frame.sequence, result, elapsed));
        if !emitted {
            tracing::debug!(session, sequence = frame.sequence, "recognition result discarded after cancel");
        }
    }

    fn finish_job(
        &self,
        session: u64,
        frame_sequence: u32,
        result: Result<Vec<FaceMatch>, RecognitionError>,
        elapsed: Duration,
    ) {
        match result {
            Ok(faces) => {
                Counters::bump(&self.counters.completed);
                tracing::debug!(
                    session,
                    faces = faces.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "recognition complete"
                );
                if let Some(recorder) = &self.recorder {
                    recorder.record(&faces);
                }
                self.publish(CoordinatorEvent::RecognitionResult {
                    session,
                    frame_sequence,
                    faces,
                    elapsed,
                });
            }
            Err(e) => {
                Counters::bump(&self.counters.failed);
                tracing::warn!(session, error = %e, "recognition failed");
                self.publish(CoordinatorEvent::RecognitionFailed {
                    session,
                    error: e.to_string(),
                });
            }
        }
    }

    fn publish(&self, event: CoordinatorEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::warn!("event queue full; dropping event"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

fn run_control(inner: &Arc<Inner>, stop: &Receiver<()>) {
    let capture = tick(inner.config.capture_interval);
    let recognition = tick(inner.config.recognition_interval);
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(capture) -> _ => {
                inner.capture_tick();
            }
            recv(recognition) -> _ => {
                inner.recognition_tick();
            }
        }
        if inner.state() != CoordinatorState::Active {
            break;
        }
    }
    tracing::debug!(state = %inner.state(), "control loop exited");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
