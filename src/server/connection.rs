//! Per-connection state machines
//!
//! Every accepted socket starts out unknown, holding a four-byte greeting
//! slot. The first completed receive classifies the client and transmutes
//! the connection in place, exactly once, into a source or a sink:
//!
//! ```text
//! Unknown --"SORC"--> Source          reads DV frames, publishes to mixer
//!         --"SINK"--> Sink (cooked)   writes header-prefixed frames
//!         --"RSNK"--> Sink (raw)      writes bare frames
//!         -- else --> dropped
//! ```
//!
//! Receives work a region at a time: the current kind names the next byte
//! range it expects, a cursor tracks partial reads across poll cycles, and a
//! completed region advances the state machine. Sends exist only for sinks
//! and drain the sink's bounded frame queue with scatter writes.
//!
//! Mixer identities are taken when a kind is built and released in its
//! `Drop`, so however a connection ends, the mixer sees each register
//! exactly once and its matching release exactly once.

use std::io::{self, IoSlice, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use mio::net::TcpStream;

use crate::dif::{self, DIF_SEQUENCE_SIZE};
use crate::frame::Frame;
use crate::mixer::{Mixer, Sink, SinkId, SourceId};
use crate::protocol::{self, ClientRole, GREETING_SIZE};
use crate::ring::RingBuffer;
use crate::server::wakeup::WakeupSender;

/// Capacity of each sink's outgoing frame queue
pub const SINK_QUEUE_LEN: usize = 30;

/// Result of one receive step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStep {
    /// Progress was made; call `receive` again to keep draining the socket
    Progress,
    /// The socket has no more data for now; state is retained
    Blocked,
    /// The connection is done for; the caller must drop it
    Closed,
}

/// Result of a send pass over a sink's queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The sink is beyond saving; the caller must drop it
    Failed,
    /// Bytes went out but the queue is not drained; keep write interest
    SentSome,
    /// The queue is drained; write interest can be cleared
    SentAll,
}

/// One client connection: the socket plus role-dependent state
pub struct Connection<M: Mixer> {
    stream: TcpStream,
    mixer: Arc<M>,
    wakeup: WakeupSender,
    kind: Kind<M>,
}

enum Kind<M: Mixer> {
    Unknown {
        greeting: [u8; GREETING_SIZE],
        filled: usize,
    },
    Source(SourceState<M>),
    Sink(SinkState<M>),
}

impl<M: Mixer> Connection<M> {
    /// Wrap a freshly-accepted socket. The client's role is unknown until
    /// it greets.
    pub fn new(stream: TcpStream, mixer: Arc<M>, wakeup: WakeupSender) -> Self {
        Self {
            stream,
            mixer,
            wakeup,
            kind: Kind::Unknown {
                greeting: [0; GREETING_SIZE],
                filled: 0,
            },
        }
    }

    /// The connection's socket descriptor, as named in enable-output
    /// wakeup messages.
    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// The socket, for poll registration changes.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Advance the receive state machine by at most one read.
    ///
    /// Readiness is edge-style, so the caller keeps calling while this
    /// returns [`RecvStep::Progress`] and stops on [`RecvStep::Blocked`].
    pub fn receive(&mut self) -> RecvStep {
        let stream = &mut self.stream;
        let mut role = None;

        let step = match &mut self.kind {
            Kind::Unknown { greeting, filled } => {
                match stream.read(&mut greeting[*filled..]) {
                    Ok(0) => RecvStep::Closed,
                    Ok(count) => {
                        *filled += count;
                        if *filled < GREETING_SIZE {
                            RecvStep::Progress
                        } else {
                            match protocol::classify_greeting(greeting) {
                                Ok(client_role) => {
                                    role = Some(client_role);
                                    RecvStep::Progress
                                }
                                Err(_) => RecvStep::Closed,
                            }
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => RecvStep::Blocked,
                    Err(_) => RecvStep::Closed,
                }
            }

            Kind::Source(source) => source.receive(stream),

            // Sinks have nothing to say after the greeting; any input,
            // including EOF, disconnects them.
            Kind::Sink(_) => {
                let mut scratch = [0u8; 1];
                match stream.read(&mut scratch) {
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => RecvStep::Blocked,
                    _ => RecvStep::Closed,
                }
            }
        };

        if let Some(role) = role {
            self.transmute(role);
        }
        step
    }

    /// Replace the unknown kind with the one the greeting named.
    fn transmute(&mut self, role: ClientRole) {
        let mixer = Arc::clone(&self.mixer);
        self.kind = match role {
            ClientRole::Source => Kind::Source(SourceState::new(mixer)),
            ClientRole::Sink => Kind::Sink(SinkState::new(
                mixer,
                self.wakeup.clone(),
                self.stream.as_raw_fd(),
                false,
            )),
            ClientRole::RawSink => Kind::Sink(SinkState::new(
                mixer,
                self.wakeup.clone(),
                self.stream.as_raw_fd(),
                true,
            )),
        };
        tracing::debug!(client = %self, "Client identified");
    }

    /// Push queued frames to the wire. Called when the socket is writable.
    pub fn send(&mut self) -> SendStatus {
        match &mut self.kind {
            Kind::Sink(sink) => sink.send(&mut self.stream),
            // Only sinks ever hold write interest.
            _ => SendStatus::Failed,
        }
    }
}

impl<M: Mixer> std::fmt::Display for Connection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Kind::Unknown { .. } => write!(f, "unknown client"),
            Kind::Source(source) => write!(f, "source {}", source.source_id + 1),
            Kind::Sink(sink) => write!(f, "sink {}", sink.sink_id + 1),
        }
    }
}

/// State of a client that streams DV frames into the hub
struct SourceState<M: Mixer> {
    mixer: Arc<M>,
    source_id: SourceId,
    /// Frame being filled; owned by this source until published
    frame: Frame,
    /// Whether the next region is the frame's first DIF sequence
    first_sequence: bool,
    /// Bytes received into the current region
    filled: usize,
}

impl<M: Mixer> SourceState<M> {
    fn new(mixer: Arc<M>) -> Self {
        let frame = mixer.allocate_frame();
        // The identity is taken last; nothing after this can fail, so it is
        // always released by drop.
        let source_id = mixer.add_source();
        Self {
            mixer,
            source_id,
            frame,
            first_sequence: true,
            filled: 0,
        }
    }

    fn receive(&mut self, stream: &mut TcpStream) -> RecvStep {
        let (start, end) = if self.first_sequence {
            (0, DIF_SEQUENCE_SIZE)
        } else {
            (DIF_SEQUENCE_SIZE, self.frame.size)
        };

        match stream.read(&mut self.frame.buffer[start + self.filled..end]) {
            Ok(0) => RecvStep::Closed,
            Ok(count) => {
                self.filled += count;
                if start + self.filled < end {
                    RecvStep::Progress
                } else {
                    self.filled = 0;
                    self.handle_complete_receive()
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => RecvStep::Blocked,
            Err(_) => RecvStep::Closed,
        }
    }

    fn handle_complete_receive(&mut self) -> RecvStep {
        if self.first_sequence {
            match dif::parse_frame_header(&self.frame.buffer[..DIF_SEQUENCE_SIZE]) {
                Ok(system) => {
                    self.frame.system = system;
                    self.frame.size = system.frame_size();
                    self.first_sequence = false;
                    RecvStep::Progress
                }
                Err(_) => RecvStep::Closed,
            }
        } else {
            tracing::trace!(
                source = self.source_id + 1,
                system = %self.frame.system,
                size = self.frame.size,
                "Frame published"
            );
            let frame = std::mem::replace(&mut self.frame, self.mixer.allocate_frame());
            self.mixer.put_frame(self.source_id, frame);
            self.first_sequence = true;
            RecvStep::Progress
        }
    }
}

impl<M: Mixer> Drop for SourceState<M> {
    fn drop(&mut self) {
        self.mixer.remove_source(self.source_id);
    }
}

/// State of a client that consumes the mixed output
struct SinkState<M: Mixer> {
    mixer: Arc<M>,
    sink_id: SinkId,
    shared: Arc<SinkShared>,
    /// Raw sinks get bare frames, without the control header
    raw: bool,
    /// Bytes of the current frame (header included) already on the wire
    frame_pos: usize,
}

impl<M: Mixer> SinkState<M> {
    fn new(mixer: Arc<M>, wakeup: WakeupSender, fd: RawFd, raw: bool) -> Self {
        let shared = Arc::new(SinkShared {
            fd,
            wakeup,
            queue: Mutex::new(SinkQueue {
                frames: RingBuffer::new(),
                overflowed: false,
            }),
        });
        let sink_id = mixer.add_sink(Arc::clone(&shared) as Arc<dyn Sink>);
        Self {
            mixer,
            sink_id,
            shared,
            raw,
            frame_pos: 0,
        }
    }

    /// Drain the queue onto the wire.
    ///
    /// The front frame stays queued while it is being sent, so the mixer
    /// callback sees a non-empty queue and does not raise a redundant
    /// wakeup; the finished frame is popped at the start of the next pass.
    fn send(&mut self, stream: &mut TcpStream) -> SendStatus {
        let mut result = SendStatus::Failed;
        let mut finished_frame = false;

        loop {
            let frame = {
                let mut queue = self.shared.queue.lock().unwrap();
                if queue.overflowed {
                    break;
                }
                if finished_frame {
                    queue.frames.pop();
                    finished_frame = false;
                }
                match queue.frames.front() {
                    None => {
                        result = SendStatus::SentAll;
                        break;
                    }
                    Some(frame) => Arc::clone(frame),
                }
            };

            // All I/O happens with the queue lock released.
            let header = protocol::sink_frame_header(frame.cut_before);
            let body = frame.data();
            let header_len = if self.raw { 0 } else { header.len() };
            let total = header_len + body.len();

            // Skip what has already been sent: either part of the header is
            // still owed, or the write starts inside the body.
            let written = if self.frame_pos < header_len {
                let segments = [IoSlice::new(&header[self.frame_pos..]), IoSlice::new(body)];
                stream.write_vectored(&segments)
            } else {
                stream.write(&body[self.frame_pos - header_len..])
            };

            match written {
                Ok(count) if count > 0 => {
                    self.frame_pos += count;
                    if self.frame_pos == total {
                        finished_frame = true;
                        self.frame_pos = 0;
                    }
                    result = SendStatus::SentSome;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    result = SendStatus::SentSome;
                    break;
                }
                // A zero-length write or a hard error surfaces as Failed
                // unless an earlier pass already made progress; it will
                // recur on the next writable event in that case.
                _ => break,
            }

            if !finished_frame {
                break;
            }
        }

        result
    }
}

impl<M: Mixer> Drop for SinkState<M> {
    fn drop(&mut self) {
        self.mixer.remove_sink(self.sink_id);
    }
}

/// State a sink connection shares with the mixer thread
struct SinkShared {
    fd: RawFd,
    wakeup: WakeupSender,
    queue: Mutex<SinkQueue>,
}

struct SinkQueue {
    frames: RingBuffer<Arc<Frame>, SINK_QUEUE_LEN>,
    overflowed: bool,
}

impl Sink for SinkShared {
    /// Queue one mixed frame for transmission.
    ///
    /// A full queue latches `overflowed`: the frame is discarded and the
    /// connection will fail its next send. On the empty to non-empty
    /// transition the event loop is told, after the lock is released, to
    /// poll the socket for writability.
    fn put_frame(&self, frame: &Arc<Frame>) {
        let was_empty;
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.frames.is_full() {
                queue.overflowed = true;
                return;
            }
            was_empty = queue.frames.is_empty();
            queue.frames.push(Arc::clone(frame));
        }
        if was_empty {
            self.wakeup.enable_output(self.fd);
        }
    }
}
