//! Producer/consumer picture handoff between codecs and the GPU.
//!
//! [`Surface`] is the window a render context draws into and an encoder
//! consumes from. [`SurfaceTexture`] is the slot a decoder renders into and
//! a GPU texture latches from. Both are cheap handles around shared state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use duocam_common::{DuocamError, DuocamResult};

use crate::frame::VideoFrame;

/// Frames a surface holds before the consumer must catch up.
pub const DEFAULT_SURFACE_CAPACITY: usize = 4;

#[derive(Debug, Default)]
struct SurfaceState {
    frames: VecDeque<VideoFrame>,
    input_closed: bool,
    released: bool,
    queued_total: u64,
}

#[derive(Debug)]
struct SurfaceShared {
    width: u32,
    height: u32,
    capacity: usize,
    state: Mutex<SurfaceState>,
}

/// Bounded frame queue. The producer calls [`Surface::queue_frame`], the
/// consumer calls [`Surface::acquire_frame`].
#[derive(Debug, Clone)]
pub struct Surface {
    shared: Arc<SurfaceShared>,
}

impl Surface {
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_capacity(width, height, DEFAULT_SURFACE_CAPACITY)
    }

    pub fn with_capacity(width: u32, height: u32, capacity: usize) -> Self {
        Self {
            shared: Arc::new(SurfaceShared {
                width,
                height,
                capacity: capacity.max(1),
                state: Mutex::new(SurfaceState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SurfaceState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn size(&self) -> (u32, u32) {
        (self.shared.width, self.shared.height)
    }

    /// Hand a finished picture to the consumer. Fails once input has been
    /// closed, after release, on a size mismatch, or when the queue is full.
    pub fn queue_frame(&self, frame: VideoFrame) -> DuocamResult<()> {
        if (frame.width, frame.height) != self.size() {
            return Err(DuocamError::gpu(format!(
                "frame {}x{} does not match surface {}x{}",
                frame.width, frame.height, self.shared.width, self.shared.height
            )));
        }
        let mut state = self.state();
        if state.released {
            return Err(DuocamError::gpu("surface has been released"));
        }
        if state.input_closed {
            return Err(DuocamError::gpu(
                "surface input is closed (end of stream already signalled)",
            ));
        }
        if state.frames.len() >= self.shared.capacity {
            return Err(DuocamError::gpu(format!(
                "surface queue full ({} frames pending)",
                state.frames.len()
            )));
        }
        state.frames.push_back(frame);
        state.queued_total += 1;
        Ok(())
    }

    pub fn acquire_frame(&self) -> Option<VideoFrame> {
        self.state().frames.pop_front()
    }

    pub fn pending(&self) -> usize {
        self.state().frames.len()
    }

    /// Total frames ever queued.
    pub fn queued_total(&self) -> u64 {
        self.state().queued_total
    }

    /// Mark end of input; later `queue_frame` calls fail.
    pub fn close_input(&self) {
        self.state().input_closed = true;
    }

    pub fn is_input_closed(&self) -> bool {
        self.state().input_closed
    }

    /// Drop pending frames and refuse further input.
    pub fn release(&self) {
        let mut state = self.state();
        state.released = true;
        state.frames.clear();
    }

    pub fn is_released(&self) -> bool {
        self.state().released
    }

    /// Whether two handles refer to the same surface.
    pub fn same_as(&self, other: &Surface) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

#[derive(Debug, Default)]
struct TextureSlot {
    latest: Option<VideoFrame>,
    posted: u64,
    dropped: u64,
    released: bool,
}

/// Latest-frame slot a decoder renders into. Posting replaces any frame
/// that has not been latched yet.
#[derive(Debug, Clone, Default)]
pub struct SurfaceTexture {
    slot: Arc<Mutex<TextureSlot>>,
}

impl SurfaceTexture {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, TextureSlot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish a decoded picture. Ignored after release.
    pub fn post(&self, frame: VideoFrame) {
        let mut slot = self.slot();
        if slot.released {
            return;
        }
        if slot.latest.replace(frame).is_some() {
            slot.dropped += 1;
        }
        slot.posted += 1;
    }

    /// Take the newest unlatched picture.
    pub fn take_latest(&self) -> Option<VideoFrame> {
        self.slot().latest.take()
    }

    pub fn frame_available(&self) -> bool {
        self.slot().latest.is_some()
    }

    pub fn frames_posted(&self) -> u64 {
        self.slot().posted
    }

    /// Frames overwritten before anyone latched them.
    pub fn frames_dropped(&self) -> u64 {
        self.slot().dropped
    }

    pub fn release(&self) {
        let mut slot = self.slot();
        slot.released = true;
        slot.latest = None;
    }

    pub fn is_released(&self) -> bool {
        self.slot().released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_and_acquire_in_order() {
        let surface = Surface::new(2, 2);
        surface.queue_frame(VideoFrame::filled(2, 2, 1, [0; 4])).unwrap();
        surface.queue_frame(VideoFrame::filled(2, 2, 2, [0; 4])).unwrap();
        assert_eq!(surface.pending(), 2);
        assert_eq!(surface.acquire_frame().unwrap().pts_us, 1);
        assert_eq!(surface.acquire_frame().unwrap().pts_us, 2);
        assert!(surface.acquire_frame().is_none());
        assert_eq!(surface.queued_total(), 2);
    }

    #[test]
    fn test_closed_surface_rejects_frames() {
        let surface = Surface::new(2, 2);
        let consumer = surface.clone();
        consumer.close_input();
        assert!(surface.is_input_closed());
        assert!(surface
            .queue_frame(VideoFrame::filled(2, 2, 0, [0; 4]))
            .is_err());
    }

    #[test]
    fn test_size_mismatch_and_capacity() {
        let surface = Surface::with_capacity(2, 2, 1);
        assert!(surface
            .queue_frame(VideoFrame::filled(4, 2, 0, [0; 4]))
            .is_err());
        surface.queue_frame(VideoFrame::filled(2, 2, 0, [0; 4])).unwrap();
        assert!(surface
            .queue_frame(VideoFrame::filled(2, 2, 1, [0; 4]))
            .is_err());
    }

    #[test]
    fn test_texture_slot_keeps_latest() {
        let texture = SurfaceTexture::new();
        texture.post(VideoFrame::filled(1, 1, 10, [0; 4]));
        texture.post(VideoFrame::filled(1, 1, 20, [0; 4]));
        assert_eq!(texture.frames_posted(), 2);
        assert_eq!(texture.frames_dropped(), 1);
        assert_eq!(texture.take_latest().unwrap().pts_us, 20);
        assert!(!texture.frame_available());

        texture.release();
        texture.post(VideoFrame::filled(1, 1, 30, [0; 4]));
        assert!(texture.take_latest().is_none());
    }
}
