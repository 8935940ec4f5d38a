//! `markerfuse-middleware` – frame hand-off between detector and fusion.
//!
//! Moves immutable detection snapshots from the producer (a detector or a
//! replayed log) to the fusion loop, and fused poses from the fusion loop to
//! downstream readers, without either side ever observing a half-written
//! value.
//!
//! # Modules
//!
//! - [`frame_bus`] – [`FrameBus`][frame_bus::FrameBus]: latest-value
//!   channels built on Tokio `watch`, with per-subscriber sequence
//!   de-duplication.

pub mod frame_bus;

pub use frame_bus::{FrameBus, FrameBusError, FrameReceiver};
