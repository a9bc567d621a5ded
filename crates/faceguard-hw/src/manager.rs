//! Shared ownership of the single physical camera.
//!
//! [`CameraResourceManager`] is constructed once at startup and handed to
//! every consumer as `Arc<CameraResourceManager>`. Consumers register by id
//! with [`acquire`](CameraResourceManager::acquire); the device is opened
//! lazily for the first consumer and torn down when the last one leaves.
//!
//! Locking: `slot` guards the device handle and the consumer set, `last_frame`
//! guards the frame cache. When both are needed `slot` is taken first.
//! Internal helpers receive the locked slot instead of locking again.
//! `departing` is only ever taken on its own or under `slot`.

use crate::device::{CameraError, DeviceBackend, DeviceHandle, DeviceInfo, DeviceSettings};
use crate::enhance::FrameEnhancer;
use crate::frame::Frame;
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

/// Granularity of abortable waits inside an open attempt.
const ABORT_POLL: Duration = Duration::from_millis(20);

/// Device lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum CameraState {
    Disconnected = 0,
    Initializing = 1,
    Connected = 2,
    Error = 3,
}

impl CameraState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CameraState::Initializing,
            2 => CameraState::Connected,
            3 => CameraState::Error,
            _ => CameraState::Disconnected,
        }
    }
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CameraState::Disconnected => "disconnected",
            CameraState::Initializing => "initializing",
            CameraState::Connected => "connected",
            CameraState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Tunables for opening, verifying and reading the device.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub device: DeviceSettings,
    /// Open attempts before giving up with [`CameraState::Error`].
    pub open_attempts: u32,
    /// Wait between open attempts so the OS can reclaim the device.
    pub retry_backoff: Duration,
    /// Reads tried when verifying a freshly opened device.
    pub verify_reads: u32,
    pub verify_pause: Duration,
    /// Reads tried per `get_frame` call.
    pub frame_reads: u32,
    /// Maximum age of a cached frame served in place of a failed read.
    pub stale_after: Duration,
    pub enhance: bool,
    pub enhancer: FrameEnhancer,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            device: DeviceSettings::default(),
            open_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            verify_reads: 5,
            verify_pause: Duration::from_millis(100),
            frame_reads: 2,
            stale_after: Duration::from_secs(1),
            enhance: true,
            enhancer: FrameEnhancer::default(),
        }
    }
}

struct DeviceSlot {
    handle: Option<DeviceHandle>,
    consumers: BTreeSet<String>,
}

/// Arbitrates the camera between consumers and owns its lifecycle.
pub struct CameraResourceManager {
    backend: Box<dyn DeviceBackend>,
    config: ManagerConfig,
    slot: Mutex<DeviceSlot>,
    last_frame: Mutex<Option<Frame>>,
    state: AtomicU8,
    /// Number of `force_release` calls in progress; non-zero gates new work.
    releasing: AtomicUsize,
    /// Bumped by every `force_release`; an open that sees it change aborts.
    abort_epoch: AtomicU64,
    /// Consumers waiting in `release`. An open whose every consumer is
    /// departing aborts instead of holding the slot through its retries.
    departing: Mutex<BTreeSet<String>>,
    watchers: Mutex<Vec<Sender<CameraState>>>,
}

impl CameraResourceManager {
    pub fn new(backend: impl DeviceBackend + 'static, config: ManagerConfig) -> Self {
        Self {
            backend: Box::new(backend),
            config,
            slot: Mutex::new(DeviceSlot {
                handle: None,
                consumers: BTreeSet::new(),
            }),
            last_frame: Mutex::new(None),
            state: AtomicU8::new(CameraState::Disconnected as u8),
            releasing: AtomicUsize::new(0),
            abort_epoch: AtomicU64::new(0),
            departing: Mutex::new(BTreeSet::new()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn state(&self) -> CameraState {
        CameraState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Receive every subsequent state transition.
    pub fn subscribe(&self) -> Receiver<CameraState> {
        let (tx, rx) = crossbeam_channel::unbounded();
        lock(&self.watchers).push(tx);
        rx
    }

    pub fn is_open(&self) -> bool {
        self.lock_slot().handle.as_ref().is_some_and(|h| h.is_open)
    }

    pub fn consumers(&self) -> Vec<String> {
        self.lock_slot().consumers.iter().cloned().collect()
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.lock_slot().handle.as_ref().filter(|h| h.is_open).map(DeviceHandle::info)
    }

    /// Register `consumer_id` and make sure the device is open.
    ///
    /// Returns true iff the camera ends up connected. The consumer stays
    /// registered when opening fails so a later `reinitialize` can recover.
    pub fn acquire(&self, consumer_id: &str) -> bool {
        let epoch = self.abort_epoch.load(Ordering::SeqCst);
        if self.is_releasing() {
            tracing::warn!(consumer = consumer_id, "acquire rejected: forced release in progress");
            return false;
        }

        let mut slot = self.lock_slot();
        if self.abort_epoch.load(Ordering::SeqCst) != epoch {
            tracing::warn!(consumer = consumer_id, "acquire aborted by forced release");
            return false;
        }

        slot.consumers.insert(consumer_id.to_string());
        tracing::info!(consumer = consumer_id, consumers = slot.consumers.len(), "camera acquired");

        let open = slot.handle.as_ref().is_some_and(|h| h.is_open);
        if open && self.state() == CameraState::Connected {
            return true;
        }
        self.open_locked(&mut slot, epoch)
    }

    /// Drop `consumer_id`; tears the device down when no consumer is left.
    /// Unknown ids are ignored.
    ///
    /// If an open is in flight and `consumer_id` is its last consumer, the
    /// open gives up at its next checkpoint rather than finishing its retries.
    pub fn release(&self, consumer_id: &str) {
        lock(&self.departing).insert(consumer_id.to_string());
        {
            let mut slot = self.lock_slot();
            if slot.consumers.remove(consumer_id) {
                tracing::info!(consumer = consumer_id, consumers = slot.consumers.len(), "camera released");
                if slot.consumers.is_empty() {
                    self.teardown_locked(&mut slot);
                }
            } else {
                tracing::debug!(consumer = consumer_id, "release of unknown consumer ignored");
            }
        }
        lock(&self.departing).remove(consumer_id);
    }

    /// Clear every consumer and close the device, whatever state it is in.
    ///
    /// An open running on another thread notices at its next checkpoint and
    /// gives up instead of bringing the device back.
    pub fn force_release(&self) {
        self.releasing.fetch_add(1, Ordering::SeqCst);
        self.abort_epoch.fetch_add(1, Ordering::SeqCst);
        {
            let mut slot = self.lock_slot();
            let dropped = slot.consumers.len();
            slot.consumers.clear();
            self.teardown_locked(&mut slot);
            tracing::info!(dropped_consumers = dropped, "camera force-released");
        }
        self.releasing.fetch_sub(1, Ordering::SeqCst);
    }

    /// Tear down and reopen the device for the registered consumers.
    pub fn reinitialize(&self) -> bool {
        let epoch = self.abort_epoch.load(Ordering::SeqCst);
        if self.is_releasing() {
            return false;
        }
        let mut slot = self.lock_slot();
        if slot.consumers.is_empty() {
            tracing::warn!("reinitialize requested with no consumers; ignoring");
            return false;
        }
        tracing::info!(consumers = slot.consumers.len(), "reinitializing camera");
        self.open_locked(&mut slot, epoch)
    }

    /// Latest frame, enhanced if configured.
    ///
    /// Falls back to the cached frame while it is younger than
    /// `stale_after`, then to `None`. A device lock held by a slow open or
    /// a release is treated like a failed read rather than waited on.
    pub fn get_frame(&self) -> Option<Frame> {
        if self.is_releasing() {
            return self.cached_frame();
        }

        let raw = {
            let mut slot = match self.slot.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(p)) => p.into_inner(),
                Err(TryLockError::WouldBlock) => return self.cached_frame(),
            };
            if self.state() != CameraState::Connected {
                return self.cached_frame();
            }
            let Some(handle) = slot.handle.as_mut() else {
                return self.cached_frame();
            };
            read_with_retries(handle, self.config.frame_reads)
        };

        let Some(raw) = raw else {
            return self.cached_frame();
        };

        let frame = if self.config.enhance {
            self.config.enhancer.enhance(&raw)
        } else {
            raw
        };

        let mut cache = lock(&self.last_frame);
        // A release that ran while we were enhancing has already cleared
        // the cache; do not repopulate it.
        if self.state() == CameraState::Connected {
            *cache = Some(frame.clone());
        }
        Some(frame)
    }

    /// Best-effort liveness check: one read, nothing cached.
    pub fn health_check(&self) -> bool {
        if self.is_releasing() {
            return false;
        }
        let mut slot = self.lock_slot();
        if self.state() != CameraState::Connected {
            return false;
        }
        let Some(handle) = slot.handle.as_mut() else {
            return false;
        };
        match handle.read() {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "camera health check failed");
                false
            }
        }
    }

    /// Sharpest of `samples` frames; used when a still image matters more
    /// than latency (enrollment).
    pub fn capture_best_frame(&self, samples: usize) -> Option<Frame> {
        let mut best: Option<(f64, Frame)> = None;
        for _ in 0..samples.max(1) {
            let Some(frame) = self.get_frame() else {
                continue;
            };
            let score = frame.sharpness();
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, frame));
            }
        }
        best.map(|(score, frame)| {
            tracing::debug!(score, sequence = frame.sequence, "best frame selected");
            frame
        })
    }

    fn open_locked(&self, slot: &mut DeviceSlot, epoch: u64) -> bool {
        if let Some(mut old) = slot.handle.take() {
            old.release();
        }
        self.set_state(CameraState::Initializing);

        let attempts = self.config.open_attempts.max(1);
        for attempt in 1..=attempts {
            if self.aborted(slot, epoch) {
                return self.abort_open();
            }

            match DeviceHandle::open(self.backend.as_ref(), &self.config.device) {
                Ok(mut handle) => match self.verify(&mut handle, slot, epoch) {
                    Ok(()) => {
                        tracing::info!(
                            index = handle.index,
                            width = handle.width,
                            height = handle.height,
                            fps = handle.fps,
                            attempt,
                            "camera connected"
                        );
                        slot.handle = Some(handle);
                        self.set_state(CameraState::Connected);
                        return true;
                    }
                    Err(e) => {
                        handle.release();
                        if self.aborted(slot, epoch) {
                            return self.abort_open();
                        }
                        tracing::warn!(attempt, attempts, error = %e, "camera opened but produced no frames");
                    }
                },
                Err(e) => tracing::warn!(attempt, attempts, error = %e, "camera open failed"),
            }

            if attempt < attempts && !self.pause(self.config.retry_backoff, slot, epoch) {
                return self.abort_open();
            }
        }

        tracing::error!(index = self.config.device.index, attempts, "camera unavailable after retries");
        self.set_state(CameraState::Error);
        false
    }

    /// Read until a non-empty frame arrives, proving the device delivers.
    fn verify(&self, handle: &mut DeviceHandle, slot: &DeviceSlot, epoch: u64) -> Result<(), CameraError> {
        let reads = self.config.verify_reads.max(1);
        let mut last_err = CameraError::EmptyFrame;
        for read in 1..=reads {
            match handle.read() {
                Ok(_) => return Ok(()),
                Err(e) => {
                    tracing::debug!(read, error = %e, "verification read failed");
                    last_err = e;
                }
            }
            if read < reads && !self.pause(self.config.verify_pause, slot, epoch) {
                break;
            }
        }
        Err(last_err)
    }

    fn abort_open(&self) -> bool {
        tracing::info!("camera open aborted by release");
        self.set_state(CameraState::Disconnected);
        false
    }

    fn teardown_locked(&self, slot: &mut DeviceSlot) {
        if let Some(mut handle) = slot.handle.take() {
            handle.release();
        }
        self.set_state(CameraState::Disconnected);
        *lock(&self.last_frame) = None;
    }

    fn cached_frame(&self) -> Option<Frame> {
        lock(&self.last_frame)
            .as_ref()
            .filter(|f| f.age() <= self.config.stale_after)
            .cloned()
    }

    /// Sleep for `duration`, returning false early once the open should stop.
    fn pause(&self, duration: Duration, slot: &DeviceSlot, epoch: u64) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.aborted(slot, epoch) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(ABORT_POLL));
        }
    }

    /// A forced release happened since `epoch`, or everyone the open is
    /// for is on the way out.
    fn aborted(&self, slot: &DeviceSlot, epoch: u64) -> bool {
        if self.abort_epoch.load(Ordering::SeqCst) != epoch {
            return true;
        }
        let departing = lock(&self.departing);
        !departing.is_empty() && slot.consumers.iter().all(|c| departing.contains(c))
    }

    fn is_releasing(&self) -> bool {
        self.releasing.load(Ordering::SeqCst) > 0
    }

    fn set_state(&self, next: CameraState) {
        let prev = CameraState::from_u8(self.state.swap(next as u8, Ordering::SeqCst));
        if prev == next {
            return;
        }
        tracing::info!(from = %prev, to = %next, "camera state changed");
        lock(&self.watchers).retain(|tx| tx.send(next).is_ok());
    }

    fn lock_slot(&self) -> MutexGuard<'_, DeviceSlot> {
        lock(&self.slot)
    }
}

fn read_with_retries(handle: &mut DeviceHandle, reads: u32) -> Option<Frame> {
    for attempt in 1..=reads.max(1) {
        match handle.read() {
            Ok(frame) => return Some(frame),
            Err(e) => tracing::debug!(attempt, error = %e, "frame read failed"),
        }
    }
    None
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
