//! Capture → recognition hand-off.
//!
//! - `FrameSlot`: holds at most one pending frame. Submitting while a frame is
//!   pending drops the new one. The worker blocks in `take`.
//! - `ResultsBoard`: the latest published `RecognitionSnapshot`, replaced whole.
//! - `spawn_worker`: moves a `Supervisor` onto its own thread and feeds it frames
//!   until shutdown.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::supervisor::{Detection, Supervisor};
use crate::Timestamp;

// -------------------- Frame slot --------------------

/// Outcome of offering a frame to the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// A frame was already pending. The offered frame was discarded.
    Dropped,
    /// The worker has stopped or shutdown was requested.
    Closed,
}

enum Pending {
    Empty,
    Frame(Frame),
    Shutdown,
}

struct SlotState {
    pending: Pending,
    closed: bool,
}

pub struct FrameSlot {
    state: Mutex<SlotState>,
    changed: Condvar,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                pending: Pending::Empty,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SlotState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("frame slot lock poisoned"))
    }

    /// Non-blocking. Accepts only when the slot is empty.
    pub fn try_submit(&self, frame: Frame) -> Result<Admission> {
        let mut state = self.lock()?;
        if state.closed {
            return Ok(Admission::Closed);
        }
        match &state.pending {
            Pending::Frame(_) => return Ok(Admission::Dropped),
            Pending::Shutdown => return Ok(Admission::Closed),
            Pending::Empty => {}
        }
        state.pending = Pending::Frame(frame);
        self.changed.notify_all();
        Ok(Admission::Accepted)
    }

    /// True while a frame waits for the worker.
    pub fn is_occupied(&self) -> bool {
        self.lock()
            .map(|state| matches!(state.pending, Pending::Frame(_)))
            .unwrap_or(false)
    }

    /// Block until a frame arrives. `None` means shutdown.
    pub fn take(&self) -> Result<Option<Frame>> {
        let mut state = self.lock()?;
        loop {
            match std::mem::replace(&mut state.pending, Pending::Empty) {
                Pending::Frame(frame) => {
                    self.changed.notify_all();
                    return Ok(Some(frame));
                }
                Pending::Shutdown => {
                    state.closed = true;
                    self.changed.notify_all();
                    return Ok(None);
                }
                Pending::Empty => {
                    if state.closed {
                        return Ok(None);
                    }
                    state = self
                        .changed
                        .wait(state)
                        .map_err(|_| anyhow!("frame slot lock poisoned"))?;
                }
            }
        }
    }

    /// Queue the shutdown sentinel behind any pending frame.
    ///
    /// Waits for the worker to take the pending frame first. Returns at once if
    /// the worker has already stopped.
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.lock()?;
        while matches!(state.pending, Pending::Frame(_)) && !state.closed {
            state = self
                .changed
                .wait(state)
                .map_err(|_| anyhow!("frame slot lock poisoned"))?;
        }
        if state.closed {
            return Ok(());
        }
        state.pending = Pending::Shutdown;
        self.changed.notify_all();
        Ok(())
    }

    /// Mark the slot dead. Pending frames are discarded and waiters released.
    pub fn close(&self) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.closed = true;
        state.pending = Pending::Empty;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|state| state.closed).unwrap_or(true)
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Capture-side admission.
///
/// `frame_count` is 1-based. Only every `frame_skip`-th frame is offered to the
/// slot; the rest return `None` without touching it. A `frame_skip` of zero
/// behaves like one.
pub fn admit_frame(
    slot: &FrameSlot,
    frame_count: u64,
    frame_skip: u64,
    frame: Frame,
) -> Result<Option<Admission>> {
    if frame_count % frame_skip.max(1) != 0 {
        return Ok(None);
    }
    slot.try_submit(frame).map(Some)
}

// -------------------- Results --------------------

/// What the worker saw on its latest completed cycle.
#[derive(Clone, Debug, Default)]
pub struct RecognitionSnapshot {
    /// Completed cycle counter, starting at 1. Zero means nothing published yet.
    pub sequence: u64,
    pub frame_sequence: u64,
    pub captured_at: Option<Timestamp>,
    pub detections: Vec<Detection>,
    pub latency: Duration,
}

/// Latest snapshot, replaced atomically. Readers may see a stale one.
#[derive(Default)]
pub struct ResultsBoard {
    latest: RwLock<Arc<RecognitionSnapshot>>,
}

impl ResultsBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: RecognitionSnapshot) {
        let mut guard = match self.latest.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(snapshot);
    }

    pub fn latest(&self) -> Arc<RecognitionSnapshot> {
        let guard = match self.latest.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(&guard)
    }
}

// -------------------- Worker --------------------

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub cycles: u64,
    pub failed_cycles: u64,
}

pub struct WorkerHandle {
    slot: Arc<FrameSlot>,
    join: Option<JoinHandle<(Supervisor, WorkerStats)>>,
}

impl WorkerHandle {
    pub fn slot(&self) -> &Arc<FrameSlot> {
        &self.slot
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Send the sentinel and join the worker.
    pub fn stop(self) -> Result<WorkerStats> {
        let (_, stats) = self.stop_and_reclaim()?;
        Ok(stats)
    }

    /// Like `stop`, handing the supervisor back so its state can be inspected.
    pub fn stop_and_reclaim(mut self) -> Result<(Supervisor, WorkerStats)> {
        self.slot.shutdown()?;
        let join = self
            .join
            .take()
            .ok_or_else(|| anyhow!("recognition worker already joined"))?;
        join.join()
            .map_err(|_| anyhow!("recognition worker thread panicked"))
    }
}

/// Closes the slot however the worker loop ends, so the capture side never
/// waits on a dead worker.
struct CloseOnExit(Arc<FrameSlot>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.close();
    }
}

pub fn spawn_worker(
    supervisor: Supervisor,
    slot: Arc<FrameSlot>,
    board: Arc<ResultsBoard>,
) -> Result<WorkerHandle> {
    let worker_slot = Arc::clone(&slot);
    let join = std::thread::Builder::new()
        .name("ipmas-recognition".to_string())
        .spawn(move || run_worker(supervisor, worker_slot, board))
        .map_err(|e| anyhow!("failed to spawn recognition worker: {}", e))?;
    Ok(WorkerHandle {
        slot,
        join: Some(join),
    })
}

fn run_worker(
    mut supervisor: Supervisor,
    slot: Arc<FrameSlot>,
    board: Arc<ResultsBoard>,
) -> (Supervisor, WorkerStats) {
    let _close = CloseOnExit(Arc::clone(&slot));
    let mut stats = WorkerStats::default();
    loop {
        let frame = match slot.take() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                log::error!("recognition worker stopping: {}", e);
                break;
            }
        };
        let started = Instant::now();
        match supervisor.run_cycle(&frame, frame.captured_at) {
            Ok(report) => {
                stats.cycles += 1;
                board.publish(RecognitionSnapshot {
                    sequence: stats.cycles,
                    frame_sequence: frame.sequence,
                    captured_at: Some(frame.captured_at),
                    detections: report.detections,
                    latency: started.elapsed(),
                });
            }
            Err(e) => {
                stats.failed_cycles += 1;
                log::warn!("recognition cycle failed on frame {}: {}", frame.sequence, e);
            }
        }
    }
    log::info!(
        "recognition worker stopped after {} cycles ({} failed)",
        stats.cycles,
        stats.failed_cycles
    );
    (supervisor, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn frame(sequence: u64) -> Frame {
        Frame::from_rgb_image(RgbImage::new(4, 4), sequence).unwrap()
    }

    #[test]
    fn occupied_slot_drops_newer_frame() -> Result<()> {
        let slot = FrameSlot::new();
        assert_eq!(slot.try_submit(frame(1))?, Admission::Accepted);
        assert_eq!(slot.try_submit(frame(2))?, Admission::Dropped);
        assert!(slot.is_occupied());
        assert_eq!(slot.take()?.map(|f| f.sequence), Some(1));
        assert!(!slot.is_occupied());
        Ok(())
    }

    #[test]
    fn shutdown_sentinel_ends_take() -> Result<()> {
        let slot = FrameSlot::new();
        slot.shutdown()?;
        assert_eq!(slot.try_submit(frame(1))?, Admission::Closed);
        assert!(slot.take()?.is_none());
        assert!(slot.is_closed());
        assert!(slot.take()?.is_none());
        Ok(())
    }

    #[test]
    fn shutdown_waits_for_pending_frame() -> Result<()> {
        let slot = Arc::new(FrameSlot::new());
        slot.try_submit(frame(7))?;

        let worker = Arc::clone(&slot);
        let taker = std::thread::spawn(move || -> Result<Vec<u64>> {
            let mut seen = Vec::new();
            while let Some(frame) = worker.take()? {
                seen.push(frame.sequence);
            }
            Ok(seen)
        });

        slot.shutdown()?;
        let seen = taker
            .join()
            .map_err(|_| anyhow!("taker panicked"))??;
        assert_eq!(seen, vec![7]);
        Ok(())
    }

    #[test]
    fn close_releases_shutdown_and_submitters() -> Result<()> {
        let slot = FrameSlot::new();
        slot.try_submit(frame(1))?;
        slot.close();
        slot.shutdown()?;
        assert_eq!(slot.try_submit(frame(2))?, Admission::Closed);
        assert!(slot.take()?.is_none());
        Ok(())
    }

    #[test]
    fn only_every_nth_frame_is_offered() -> Result<()> {
        let slot = FrameSlot::new();
        let mut accepted = Vec::new();
        for count in 1..=9 {
            match admit_frame(&slot, count, 3, frame(count))? {
                Some(Admission::Accepted) => {
                    accepted.push(count);
                    slot.take()?;
                }
                Some(other) => panic!("frame {} got {:?}", count, other),
                None => assert!(!slot.is_occupied()),
            }
        }
        assert_eq!(accepted, vec![3, 6, 9]);
        Ok(())
    }

    #[test]
    fn busy_worker_drops_admitted_frame() -> Result<()> {
        let slot = FrameSlot::new();
        assert_eq!(admit_frame(&slot, 3, 3, frame(3))?, Some(Admission::Accepted));
        assert_eq!(admit_frame(&slot, 4, 3, frame(4))?, None);
        assert_eq!(admit_frame(&slot, 6, 3, frame(6))?, Some(Admission::Dropped));
        assert_eq!(slot.take()?.map(|f| f.sequence), Some(3));

        assert_eq!(admit_frame(&slot, 1, 0, frame(1))?, Some(Admission::Accepted));
        Ok(())
    }

    #[test]
    fn board_replaces_snapshot_whole() {
        let board = ResultsBoard::new();
        let before = board.latest();
        assert_eq!(before.sequence, 0);
        board.publish(RecognitionSnapshot {
            sequence: 1,
            ..RecognitionSnapshot::default()
        });
        assert_eq!(before.sequence, 0);
        assert_eq!(board.latest().sequence, 1);
    }
}
