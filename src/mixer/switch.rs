//! Source selection and sink fanout
//!
//! The switcher is the provided mixer: it forwards frames of the selected
//! video source to every registered sink, in the order they were published,
//! and marks cut points. Compositing effects and audio source selection are
//! for a richer mixer behind the same trait.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::frame::Frame;

use super::{Mixer, Sink, SinkId, SourceId};

/// Forwards the selected source's frames to all registered sinks.
///
/// Frames published from the event-loop thread cross to the switcher's own
/// thread, which applies the current selection and cut state and then fans
/// the frame out. Dropping the switcher stops that thread.
pub struct Switcher {
    state: Arc<Mutex<State>>,
    tx: Option<Sender<(SourceId, Frame)>>,
    thread: Option<JoinHandle<()>>,
}

struct State {
    /// Occupied source identity slots
    sources: Vec<bool>,
    /// Registered sink callbacks, indexed by identity
    sinks: Vec<Option<Arc<dyn Sink>>>,
    /// Source currently selected for output
    video_source: SourceId,
    /// Mark the next published frame as the start of a cut
    cut_pending: bool,
}

impl Switcher {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(State {
            sources: Vec::new(),
            sinks: Vec::new(),
            video_source: 0,
            cut_pending: false,
        }));

        let (tx, rx) = channel();
        let thread_state = Arc::clone(&state);
        let thread = thread::Builder::new()
            .name("mixer".into())
            .spawn(move || run_mixer(thread_state, rx))
            .expect("failed to spawn mixer thread");

        Self {
            state,
            tx: Some(tx),
            thread: Some(thread),
        }
    }

    /// Select the video source for output.
    ///
    /// A switch begins a new take, so the next published frame is marked as
    /// a cut.
    pub fn set_video_source(&self, id: SourceId) {
        let mut state = self.state.lock().unwrap();
        state.video_source = id;
        state.cut_pending = true;
    }

    /// Mark a cut in the output as soon as possible.
    pub fn cut(&self) {
        self.state.lock().unwrap().cut_pending = true;
    }
}

impl Default for Switcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Mixer for Switcher {
    fn add_source(&self) -> SourceId {
        let mut state = self.state.lock().unwrap();
        let id = match state.sources.iter().position(|&used| !used) {
            Some(slot) => {
                state.sources[slot] = true;
                slot
            }
            None => {
                state.sources.push(true);
                state.sources.len() - 1
            }
        };
        tracing::info!(source = id + 1, "Source registered");
        id
    }

    fn remove_source(&self, id: SourceId) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.sources.get_mut(id) {
            *slot = false;
        }
        tracing::info!(source = id + 1, "Source removed");
    }

    fn allocate_frame(&self) -> Frame {
        Frame::blank()
    }

    fn put_frame(&self, id: SourceId, frame: Frame) {
        if let Some(tx) = &self.tx {
            let _ = tx.send((id, frame));
        }
    }

    fn add_sink(&self, sink: Arc<dyn Sink>) -> SinkId {
        let mut state = self.state.lock().unwrap();
        let id = match state.sinks.iter().position(|slot| slot.is_none()) {
            Some(slot) => {
                state.sinks[slot] = Some(sink);
                slot
            }
            None => {
                state.sinks.push(Some(sink));
                state.sinks.len() - 1
            }
        };
        tracing::info!(sink = id + 1, "Sink registered");
        id
    }

    fn remove_sink(&self, id: SinkId) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.sinks.get_mut(id) {
            *slot = None;
        }
        tracing::info!(sink = id + 1, "Sink removed");
    }
}

impl Drop for Switcher {
    fn drop(&mut self) {
        // Closing the channel lets the thread run dry and exit.
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_mixer(state: Arc<Mutex<State>>, rx: Receiver<(SourceId, Frame)>) {
    while let Ok((source_id, mut frame)) = rx.recv() {
        let sinks: Vec<Arc<dyn Sink>> = {
            let mut state = state.lock().unwrap();
            if source_id != state.video_source {
                continue;
            }
            frame.cut_before = state.cut_pending;
            state.cut_pending = false;
            state.sinks.iter().flatten().cloned().collect()
        };

        // Fan out with the state lock released; sink callbacks take their
        // own queue locks.
        let frame = Arc::new(frame);
        for sink in &sinks {
            sink.put_frame(&frame);
        }
    }
}
