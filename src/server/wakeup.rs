//! Event-loop wakeup channel
//!
//! Other threads nudge the event loop by pushing machine-word messages and
//! then waking its poll. Two message kinds exist: `-1` asks the loop to shut
//! down, and any non-negative value is the file descriptor of a sink socket
//! that now has output queued and should be polled for writability.
//!
//! The channel is multi-producer; the event loop is the only consumer. A
//! message that names an already-dropped sink is harmless and is discarded
//! by the loop.

use std::os::unix::io::RawFd;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

use mio::{Registry, Token, Waker};

use crate::error::Result;

/// Message asking the event loop to shut down
pub const QUIT_MESSAGE: isize = -1;

/// Maximum number of wakeup messages the loop consumes per poll cycle
pub const WAKEUP_BATCH: usize = 1024;

/// Multi-producer handle for waking the event loop
#[derive(Clone)]
pub struct WakeupSender {
    tx: Sender<isize>,
    waker: Arc<Waker>,
}

impl WakeupSender {
    /// Ask the loop to poll `fd` for writability.
    pub fn enable_output(&self, fd: RawFd) {
        self.send(fd as isize);
    }

    /// Ask the loop to shut down.
    pub fn quit(&self) {
        self.send(QUIT_MESSAGE);
    }

    fn send(&self, message: isize) {
        // A send can only fail once the loop has exited, at which point the
        // message is moot.
        let _ = self.tx.send(message);
        let _ = self.waker.wake();
    }

    /// Wake the poll without queueing a message.
    pub(crate) fn wake(&self) {
        let _ = self.waker.wake();
    }
}

/// Create the wakeup channel, registering its waker under `token`.
pub fn wakeup_channel(
    registry: &Registry,
    token: Token,
) -> Result<(WakeupSender, Receiver<isize>)> {
    let waker = Arc::new(Waker::new(registry, token)?);
    let (tx, rx) = channel();
    Ok((WakeupSender { tx, waker }, rx))
}
