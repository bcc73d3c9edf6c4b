//! Wire protocol between the hub and its clients
//!
//! A client opens a TCP connection and sends exactly four bytes of greeting
//! naming its role:
//!
//! ```text
//! Client                                  Hub
//!   |-------- "SORC" ------------------->|   source: DV frames follow,
//!   |-------- DV frames ... ------------>|   client to hub
//!
//!   |-------- "SINK" ------------------->|   cooked sink: hub sends
//!   |<------- header || DV frame ... ----|   header-prefixed frames
//!
//!   |-------- "RSNK" ------------------->|   raw sink: hub sends
//!   |<------- DV frames ... -------------|   bare frames
//! ```
//!
//! Any other greeting closes the connection. The cooked control header is a
//! fixed-size block, all zero except for a single flag byte marking frames
//! that begin a new cut; the zero bytes are reserved and clients must ignore
//! them.

use crate::error::{Error, Result};

/// Length of the role greeting in bytes
pub const GREETING_SIZE: usize = 4;

/// Greeting sent by sources
pub const GREETING_SOURCE: &[u8; GREETING_SIZE] = b"SORC";

/// Greeting sent by sinks that want frames with control headers
pub const GREETING_SINK: &[u8; GREETING_SIZE] = b"SINK";

/// Greeting sent by sinks that want bare DIF
pub const GREETING_RAW_SINK: &[u8; GREETING_SIZE] = b"RSNK";

/// Length of the control header preceding each frame sent to a cooked sink
pub const SINK_FRAME_HEADER_SIZE: usize = 4;

/// Position of the cut flag within the control header
pub const SINK_FRAME_CUT_FLAG_POS: usize = 0;

/// Value of the cut flag when the frame begins a new cut
pub const SINK_FRAME_CUT_FLAG: u8 = b'C';

/// Role a client declares in its greeting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    /// Streams DV frames into the hub
    Source,
    /// Consumes the mixed output with control headers
    Sink,
    /// Consumes the mixed output as bare frames
    RawSink,
}

/// Match a received greeting against the known role tokens.
pub fn classify_greeting(greeting: &[u8; GREETING_SIZE]) -> Result<ClientRole> {
    if greeting == GREETING_SOURCE {
        Ok(ClientRole::Source)
    } else if greeting == GREETING_SINK {
        Ok(ClientRole::Sink)
    } else if greeting == GREETING_RAW_SINK {
        Ok(ClientRole::RawSink)
    } else {
        Err(Error::UnknownGreeting(*greeting))
    }
}

/// Build the control header for one outgoing frame.
///
/// All bytes other than the cut flag are reserved and sent as zero.
pub fn sink_frame_header(cut_before: bool) -> [u8; SINK_FRAME_HEADER_SIZE] {
    let mut header = [0u8; SINK_FRAME_HEADER_SIZE];
    if cut_before {
        header[SINK_FRAME_CUT_FLAG_POS] = SINK_FRAME_CUT_FLAG;
    }
    header
}
