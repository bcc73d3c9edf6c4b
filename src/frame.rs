//! Frame model
//!
//! One [`Frame`] holds a complete DV frame (video plus embedded audio) and
//! the metadata the hub cares about. A frame is filled in place by the
//! source connection that owns it; once published through the mixer it is
//! shared behind an `Arc` and never mutated again.

use bytes::BytesMut;

use crate::dif::{VideoSystem, DIF_MAX_FRAME_SIZE};

/// One complete DV frame plus metadata
#[derive(Debug, Clone)]
pub struct Frame {
    /// Video system; valid once the frame header has been parsed
    pub system: VideoSystem,
    /// Total frame size in bytes; valid once the header has been parsed
    pub size: usize,
    /// Set by the mixer when this frame begins a new cut
    pub cut_before: bool,
    /// Frame bytes; always `DIF_MAX_FRAME_SIZE` long, only `size` are valid
    pub buffer: BytesMut,
}

impl Frame {
    /// Allocate a zeroed frame with room for the largest video system.
    pub fn blank() -> Self {
        Self {
            system: VideoSystem::System625_50,
            size: 0,
            cut_before: false,
            buffer: BytesMut::zeroed(DIF_MAX_FRAME_SIZE),
        }
    }

    /// The valid bytes of the frame.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.size]
    }
}
