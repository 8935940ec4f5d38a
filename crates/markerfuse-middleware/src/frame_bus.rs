//! Latest-value frame bus.
//!
//! Uses [`tokio::sync::watch`] channels rather than a queue: the fusion loop
//! runs on its own timer and only ever wants the most recent detections, so
//! older frames that were never read are simply overwritten.
//!
//! # Lanes
//!
//! | Lane | Value | Producer | Consumer |
//! |---|---|---|---|
//! | frames | `Arc<ObservationBatch>` | detector / replay | fusion loop |
//! | poses | [`StampedPose`] | fusion loop | broadcasters, CLI output |
//!
//! Every batch carries a producer-assigned sequence number.  The bus rejects
//! sequence numbers that do not increase, and each [`FrameReceiver`] hands
//! out a given sequence at most once.  The sequence most recently taken by a
//! receiver is readable from the bus, so a producer can wait for the
//! consumer before sending the next frame.

use std::sync::Arc;

use markerfuse_types::{ObservationBatch, StampedPose};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Errors raised by the [`FrameBus`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameBusError {
    #[error("Stale frame: sequence {got} does not follow {last}")]
    StaleSequence { last: u64, got: u64 },

    #[error("Frame bus closed")]
    Closed,
}

/// Shared frame bus.  Clone it cheaply; all clones share the same channels.
#[derive(Clone, Debug)]
pub struct FrameBus {
    frames: Arc<watch::Sender<Option<Arc<ObservationBatch>>>>,
    poses: Arc<watch::Sender<Option<StampedPose>>>,
    consumed: Arc<watch::Sender<Option<u64>>>,
}

impl FrameBus {
    pub fn new() -> Self {
        let (frames, _) = watch::channel(None);
        let (poses, _) = watch::channel(None);
        let (consumed, _) = watch::channel(None);
        Self {
            frames: Arc::new(frames),
            poses: Arc::new(poses),
            consumed: Arc::new(consumed),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Frames
    // ─────────────────────────────────────────────────────────────────────────

    /// Replace the current frame snapshot.
    ///
    /// Succeeds whether or not anybody is subscribed; the snapshot stays
    /// readable through [`latest_frame`](Self::latest_frame).  Returns the
    /// accepted sequence number.
    pub fn publish_frame(&self, batch: ObservationBatch) -> Result<u64, FrameBusError> {
        let sequence = batch.sequence;
        let batch = Arc::new(batch);
        let mut stale = None;
        self.frames.send_if_modified(|current| {
            if let Some(previous) = current {
                if sequence <= previous.sequence {
                    stale = Some(previous.sequence);
                    return false;
                }
            }
            *current = Some(Arc::clone(&batch));
            true
        });

        match stale {
            Some(last) => {
                warn!(last, got = sequence, "Dropping out-of-order frame");
                Err(FrameBusError::StaleSequence { last, got: sequence })
            }
            None => {
                trace!(sequence, markers = batch.markers.len(), "Frame published");
                Ok(sequence)
            }
        }
    }

    /// The most recent frame, if any has been published.
    pub fn latest_frame(&self) -> Option<Arc<ObservationBatch>> {
        self.frames.borrow().clone()
    }

    /// Subscribe to frame snapshots.
    ///
    /// A fresh receiver treats the frame already on the bus (if any) as
    /// unseen.
    pub fn subscribe_frames(&self) -> FrameReceiver {
        let mut receiver = self.frames.subscribe();
        receiver.mark_changed();
        FrameReceiver {
            receiver,
            last_sequence: None,
            consumed: Arc::clone(&self.consumed),
        }
    }

    /// Sequence of the frame most recently taken by any receiver.
    pub fn consumed_sequence(&self) -> Option<u64> {
        *self.consumed.borrow()
    }

    /// Wait until a receiver has taken `sequence` or a later frame.
    pub async fn wait_consumed(&self, sequence: u64) {
        let mut rx = self.consumed.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|taken| taken.is_some_and(|s| s >= sequence)).await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fused poses
    // ─────────────────────────────────────────────────────────────────────────

    /// Replace the current fused pose.
    pub fn publish_pose(&self, pose: StampedPose) {
        debug!(
            parent = %pose.parent_frame,
            child = %pose.child_frame,
            markers = pose.contributing_markers,
            "Fused pose published"
        );
        self.poses.send_replace(Some(pose));
    }

    /// The most recent fused pose.
    pub fn latest_pose(&self) -> Option<StampedPose> {
        self.poses.borrow().clone()
    }

    /// Raw watch receiver for fused poses.
    pub fn subscribe_poses(&self) -> watch::Receiver<Option<StampedPose>> {
        self.poses.subscribe()
    }
}

impl Default for FrameBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Receiver
// ─────────────────────────────────────────────────────────────────────────────

/// Frame subscriber that yields each sequence number at most once.
pub struct FrameReceiver {
    receiver: watch::Receiver<Option<Arc<ObservationBatch>>>,
    last_sequence: Option<u64>,
    consumed: Arc<watch::Sender<Option<u64>>>,
}

impl FrameReceiver {
    /// Non-blocking: the latest frame if this receiver has not handed it out
    /// yet.
    pub fn take_new(&mut self) -> Option<Arc<ObservationBatch>> {
        let latest = self.receiver.borrow_and_update().clone()?;
        if self.last_sequence.is_some_and(|last| latest.sequence <= last) {
            return None;
        }
        self.last_sequence = Some(latest.sequence);
        self.consumed.send_replace(Some(latest.sequence));
        Some(latest)
    }

    /// Wait until an unseen frame is available.
    ///
    /// Returns [`FrameBusError::Closed`] once every [`FrameBus`] clone has
    /// been dropped and the last frame was already handed out.
    pub async fn next(&mut self) -> Result<Arc<ObservationBatch>, FrameBusError> {
        loop {
            if let Some(batch) = self.take_new() {
                return Ok(batch);
            }
            self.receiver
                .changed()
                .await
                .map_err(|_| FrameBusError::Closed)?;
        }
    }

    /// Sequence number of the last frame handed out.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }
}
