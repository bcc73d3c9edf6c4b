//! Clients for feeding and draining a mixer hub
//!
//! Blocking wrappers over the wire protocol, for tools and tests that act
//! as a source or a sink. Capture tools connect a [`SourceClient`] and push
//! one frame per frame interval; recorders and monitors pull frames back
//! out through a [`SinkClient`].

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::Bytes;

use crate::dif::{self, DIF_SEQUENCE_SIZE};
use crate::error::{Error, Result};
use crate::protocol::{
    GREETING_RAW_SINK, GREETING_SINK, GREETING_SOURCE, SINK_FRAME_CUT_FLAG,
    SINK_FRAME_CUT_FLAG_POS, SINK_FRAME_HEADER_SIZE,
};

/// A client that streams DV frames into the hub
pub struct SourceClient {
    stream: TcpStream,
}

impl SourceClient {
    /// Connect to the hub and greet as a source.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let mut stream = TcpStream::connect(addr)?;
        stream.write_all(GREETING_SOURCE)?;
        Ok(Self { stream })
    }

    /// Send one complete DV frame.
    ///
    /// The frame must start with a parseable DV header and have exactly the
    /// size its header announces; the hub drops sources that stream
    /// anything else.
    pub fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let system = dif::parse_frame_header(frame)?;
        if frame.len() != system.frame_size() {
            return Err(Error::InvalidFrameHeader);
        }
        self.stream.write_all(frame)?;
        Ok(())
    }
}

/// One frame read from the hub by a sink client
#[derive(Debug, Clone)]
pub struct SinkFrame {
    /// Whether the hub marked this frame as the start of a cut. Always
    /// false in raw mode, which carries no control header.
    pub cut_before: bool,
    /// The frame bytes
    pub data: Bytes,
}

/// A client that consumes the hub's mixed output
pub struct SinkClient {
    stream: TcpStream,
    raw: bool,
}

impl SinkClient {
    /// Connect and greet as a cooked sink; frames arrive with control
    /// headers.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Self::connect_with(addr, false)
    }

    /// Connect and greet as a raw sink; frames arrive bare.
    pub fn connect_raw<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Self::connect_with(addr, true)
    }

    fn connect_with<A: ToSocketAddrs>(addr: A, raw: bool) -> Result<Self> {
        let mut stream = TcpStream::connect(addr)?;
        stream.write_all(if raw { GREETING_RAW_SINK } else { GREETING_SINK })?;
        Ok(Self { stream, raw })
    }

    /// Bound how long `read_frame` may wait for bytes.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Read the next frame.
    ///
    /// The frame size is learned the same way the hub learns it: from the
    /// DV header in the frame's first DIF sequence.
    pub fn read_frame(&mut self) -> Result<SinkFrame> {
        let mut cut_before = false;
        if !self.raw {
            let mut header = [0u8; SINK_FRAME_HEADER_SIZE];
            self.stream.read_exact(&mut header)?;
            cut_before = header[SINK_FRAME_CUT_FLAG_POS] == SINK_FRAME_CUT_FLAG;
        }

        let mut data = vec![0u8; DIF_SEQUENCE_SIZE];
        self.stream.read_exact(&mut data)?;
        let system = dif::parse_frame_header(&data)?;

        data.resize(system.frame_size(), 0);
        self.stream.read_exact(&mut data[DIF_SEQUENCE_SIZE..])?;

        Ok(SinkFrame {
            cut_before,
            data: Bytes::from(data),
        })
    }
}
