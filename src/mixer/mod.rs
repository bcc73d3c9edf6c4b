//! Mixer boundary
//!
//! The server touches the mixing stage only through the [`Mixer`] trait:
//! sources register, publish complete frames, and unregister; sinks register
//! a callback that the mixer invokes for every frame of mixed output.
//! [`Switcher`] is the provided implementation.

mod switch;

pub use switch::Switcher;

use std::sync::Arc;

use crate::frame::Frame;

/// Identity the mixer assigns to a registered source
pub type SourceId = usize;

/// Identity the mixer assigns to a registered sink
pub type SinkId = usize;

/// Consumer side of the mixer.
///
/// `put_frame` is invoked from the mixer thread for every frame of mixed
/// output. The frame is shared with other sinks and must not be modified;
/// implementations should queue or drop quickly and never block.
pub trait Sink: Send + Sync {
    /// Hand one mixed frame to the sink.
    fn put_frame(&self, frame: &Arc<Frame>);
}

/// Producer and registration side of the mixer, as seen by the server.
///
/// All methods are called from the event-loop thread. Identities are unique
/// while their holder lives and may be reused after release.
pub trait Mixer: Send + Sync + 'static {
    /// Register a new source and return its identity.
    fn add_source(&self) -> SourceId;

    /// Release a source identity.
    fn remove_source(&self, id: SourceId);

    /// Allocate a frame with a buffer sized for the largest video system.
    fn allocate_frame(&self) -> Frame;

    /// Publish a complete frame received from a source.
    ///
    /// Ownership transfers to the mixer; the mixer decides what reaches the
    /// sinks.
    fn put_frame(&self, id: SourceId, frame: Frame);

    /// Register a sink callback and return its identity.
    fn add_sink(&self, sink: Arc<dyn Sink>) -> SinkId;

    /// Release a sink identity. The callback is not invoked afterwards.
    fn remove_sink(&self, id: SinkId);
}
