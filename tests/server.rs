//! End-to-end tests against a live hub
//!
//! Each test spawns a real server on a loopback port with a recording mixer
//! standing in for the switching stage, then talks to it over actual
//! sockets. The tests play the mixer-thread role themselves by pushing
//! frames into the sinks the server registers.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use dvmix_rs::client::{SinkClient, SourceClient};
use dvmix_rs::dif::{self, VideoSystem};
use dvmix_rs::frame::Frame;
use dvmix_rs::mixer::{Mixer, Sink, SinkId, SourceId};
use dvmix_rs::protocol::{
    GREETING_SINK, SINK_FRAME_CUT_FLAG_POS, SINK_FRAME_HEADER_SIZE,
};
use dvmix_rs::{Server, ServerConfig, ServerHandle};

const TIMEOUT: Duration = Duration::from_secs(5);

/// What the recording mixer observed, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum MixerCall {
    AddSource(SourceId),
    RemoveSource(SourceId),
    PutFrame(SourceId, VideoSystem, usize),
    AddSink(SinkId),
    RemoveSink(SinkId),
}

/// Mixer that records every boundary call and hands registered sinks and
/// published frames back to the test.
struct RecordingMixer {
    calls: Sender<MixerCall>,
    registered: Sender<Arc<dyn Sink>>,
    published: Sender<Frame>,
    next_source: AtomicUsize,
    next_sink: AtomicUsize,
}

impl Mixer for RecordingMixer {
    fn add_source(&self) -> SourceId {
        let id = self.next_source.fetch_add(1, Ordering::SeqCst);
        let _ = self.calls.send(MixerCall::AddSource(id));
        id
    }

    fn remove_source(&self, id: SourceId) {
        let _ = self.calls.send(MixerCall::RemoveSource(id));
    }

    fn allocate_frame(&self) -> Frame {
        Frame::blank()
    }

    fn put_frame(&self, id: SourceId, frame: Frame) {
        let _ = self
            .calls
            .send(MixerCall::PutFrame(id, frame.system, frame.size));
        let _ = self.published.send(frame);
    }

    fn add_sink(&self, sink: Arc<dyn Sink>) -> SinkId {
        let id = self.next_sink.fetch_add(1, Ordering::SeqCst);
        let _ = self.registered.send(sink);
        let _ = self.calls.send(MixerCall::AddSink(id));
        id
    }

    fn remove_sink(&self, id: SinkId) {
        let _ = self.calls.send(MixerCall::RemoveSink(id));
    }
}

struct Hub {
    server: ServerHandle,
    calls: Receiver<MixerCall>,
    sinks: Receiver<Arc<dyn Sink>>,
    published: Receiver<Frame>,
}

fn start_hub() -> Hub {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (calls_tx, calls) = channel();
    let (sinks_tx, sinks) = channel();
    let (published_tx, published) = channel();
    let mixer = Arc::new(RecordingMixer {
        calls: calls_tx,
        registered: sinks_tx,
        published: published_tx,
        next_source: AtomicUsize::new(0),
        next_sink: AtomicUsize::new(0),
    });

    let config = ServerConfig::default().bind("127.0.0.1:0".parse().unwrap());
    let server = Server::new(config, mixer).spawn().unwrap();

    Hub {
        server,
        calls,
        sinks,
        published,
    }
}

fn dummy_frame(system: VideoSystem) -> Vec<u8> {
    let mut data = vec![0u8; system.frame_size()];
    dif::fill_dummy_frame(&mut data, system);
    data
}

fn mixed_frame(system: VideoSystem, cut_before: bool) -> Arc<Frame> {
    let mut frame = Frame::blank();
    frame.system = system;
    frame.size = system.frame_size();
    frame.cut_before = cut_before;
    dif::fill_dummy_frame(&mut frame.buffer[..frame.size], system);
    Arc::new(frame)
}

#[test]
fn test_unknown_greeting_is_rejected() {
    let hub = start_hub();

    let mut stream = TcpStream::connect(hub.server.local_addr()).unwrap();
    stream.write_all(b"XXXX").unwrap();

    // The hub closes without ever touching the mixer.
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
    assert!(hub.calls.try_recv().is_err());
}

#[test]
fn test_source_delivers_pal_frame() {
    let hub = start_hub();

    let mut source = SourceClient::connect(hub.server.local_addr()).unwrap();
    source
        .send_frame(&dummy_frame(VideoSystem::System625_50))
        .unwrap();

    assert_eq!(
        hub.calls.recv_timeout(TIMEOUT).unwrap(),
        MixerCall::AddSource(0)
    );
    assert_eq!(
        hub.calls.recv_timeout(TIMEOUT).unwrap(),
        MixerCall::PutFrame(0, VideoSystem::System625_50, 144_000)
    );

    drop(source);
    assert_eq!(
        hub.calls.recv_timeout(TIMEOUT).unwrap(),
        MixerCall::RemoveSource(0)
    );
}

#[test]
fn test_source_delivers_frames_in_order() {
    let hub = start_hub();

    let mut source = SourceClient::connect(hub.server.local_addr()).unwrap();
    source
        .send_frame(&dummy_frame(VideoSystem::System525_60))
        .unwrap();
    source
        .send_frame(&dummy_frame(VideoSystem::System625_50))
        .unwrap();
    source
        .send_frame(&dummy_frame(VideoSystem::System525_60))
        .unwrap();

    assert_eq!(
        hub.calls.recv_timeout(TIMEOUT).unwrap(),
        MixerCall::AddSource(0)
    );
    for expected in [
        VideoSystem::System525_60,
        VideoSystem::System625_50,
        VideoSystem::System525_60,
    ] {
        assert_eq!(
            hub.calls.recv_timeout(TIMEOUT).unwrap(),
            MixerCall::PutFrame(0, expected, expected.frame_size())
        );
    }
}

#[test]
fn test_bad_dv_header_drops_source() {
    let hub = start_hub();

    let mut stream = TcpStream::connect(hub.server.local_addr()).unwrap();
    stream.write_all(dvmix_rs::protocol::GREETING_SOURCE).unwrap();
    assert_eq!(
        hub.calls.recv_timeout(TIMEOUT).unwrap(),
        MixerCall::AddSource(0)
    );

    // A sequence of zeros has no header block ID.
    stream
        .write_all(&vec![0u8; dif::DIF_SEQUENCE_SIZE])
        .unwrap();

    assert_eq!(
        hub.calls.recv_timeout(TIMEOUT).unwrap(),
        MixerCall::RemoveSource(0)
    );
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_raw_sink_receives_bare_frame() {
    let hub = start_hub();

    let mut sink_client = SinkClient::connect_raw(hub.server.local_addr()).unwrap();
    sink_client.set_read_timeout(Some(TIMEOUT)).unwrap();
    let sink = hub.sinks.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(
        hub.calls.recv_timeout(TIMEOUT).unwrap(),
        MixerCall::AddSink(0)
    );

    let frame = mixed_frame(VideoSystem::System625_50, false);
    sink.put_frame(&frame);

    let received = sink_client.read_frame().unwrap();
    assert!(!received.cut_before);
    assert_eq!(received.data.len(), 144_000);
    assert_eq!(&received.data[..], frame.data());
}

#[test]
fn test_cooked_sink_receives_cut_flag() {
    let hub = start_hub();

    let mut stream = TcpStream::connect(hub.server.local_addr()).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream.write_all(GREETING_SINK).unwrap();
    let sink = hub.sinks.recv_timeout(TIMEOUT).unwrap();

    let frame = mixed_frame(VideoSystem::System625_50, true);
    sink.put_frame(&frame);

    let mut header = [0u8; SINK_FRAME_HEADER_SIZE];
    stream.read_exact(&mut header).unwrap();
    assert_eq!(header[SINK_FRAME_CUT_FLAG_POS], b'C');
    for (pos, &byte) in header.iter().enumerate() {
        if pos != SINK_FRAME_CUT_FLAG_POS {
            assert_eq!(byte, 0, "reserved header byte {} not zero", pos);
        }
    }

    let mut body = vec![0u8; frame.size];
    stream.read_exact(&mut body).unwrap();
    assert_eq!(&body[..], frame.data());
}

#[test]
fn test_cooked_sink_header_without_cut_is_all_zero() {
    let hub = start_hub();

    let mut sink_client = SinkClient::connect(hub.server.local_addr()).unwrap();
    sink_client.set_read_timeout(Some(TIMEOUT)).unwrap();
    let sink = hub.sinks.recv_timeout(TIMEOUT).unwrap();

    sink.put_frame(&mixed_frame(VideoSystem::System525_60, false));

    let received = sink_client.read_frame().unwrap();
    assert!(!received.cut_before);
    assert_eq!(received.data.len(), 120_000);
}

#[test]
fn test_slow_sink_overflows_and_is_dropped() {
    let hub = start_hub();

    let mut stream = TcpStream::connect(hub.server.local_addr()).unwrap();
    stream.write_all(GREETING_SINK).unwrap();
    let sink = hub.sinks.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(
        hub.calls.recv_timeout(TIMEOUT).unwrap(),
        MixerCall::AddSink(0)
    );

    // The client reads nothing. The queue holds 30 frames and the socket
    // buffers hold a few more; 200 PAL frames are far beyond both, so the
    // queue must overflow.
    let frame = mixed_frame(VideoSystem::System625_50, false);
    for _ in 0..200 {
        sink.put_frame(&frame);
    }

    // Start draining so the socket becomes writable again; the next send
    // pass observes the overflow and drops the connection.
    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }

    assert_eq!(
        hub.calls.recv_timeout(TIMEOUT).unwrap(),
        MixerCall::RemoveSink(0)
    );
    assert!(hub.calls.try_recv().is_err());
}

#[test]
fn test_quit_during_active_sessions() {
    let hub = start_hub();

    let source = SourceClient::connect(hub.server.local_addr()).unwrap();
    assert_eq!(
        hub.calls.recv_timeout(TIMEOUT).unwrap(),
        MixerCall::AddSource(0)
    );

    let mut sink_stream = TcpStream::connect(hub.server.local_addr()).unwrap();
    sink_stream.write_all(GREETING_SINK).unwrap();
    assert_eq!(
        hub.calls.recv_timeout(TIMEOUT).unwrap(),
        MixerCall::AddSink(0)
    );

    // Quit can come from any thread; shutdown joins the loop.
    hub.server.wakeup().quit();
    hub.server.shutdown();

    let remaining: Vec<MixerCall> = hub.calls.try_iter().collect();
    assert!(remaining.contains(&MixerCall::RemoveSource(0)));
    assert!(remaining.contains(&MixerCall::RemoveSink(0)));

    // Both sockets are closed.
    sink_stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(sink_stream.read(&mut buf).unwrap(), 0);
    drop(source);
}

#[test]
fn test_connection_limit() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (calls_tx, calls) = channel();
    let (sinks_tx, _sinks) = channel();
    let (published_tx, _published) = channel();
    let mixer = Arc::new(RecordingMixer {
        calls: calls_tx,
        registered: sinks_tx,
        published: published_tx,
        next_source: AtomicUsize::new(0),
        next_sink: AtomicUsize::new(0),
    });
    let config = ServerConfig::default()
        .bind("127.0.0.1:0".parse().unwrap())
        .max_connections(1);
    let server = Server::new(config, mixer).spawn().unwrap();

    let mut first = SourceClient::connect(server.local_addr()).unwrap();
    assert_eq!(calls.recv_timeout(TIMEOUT).unwrap(), MixerCall::AddSource(0));

    // The second connection is accepted and immediately closed.
    let mut rejected = TcpStream::connect(server.local_addr()).unwrap();
    rejected.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(rejected.read(&mut buf).unwrap(), 0);

    // The admitted client still works.
    first
        .send_frame(&dummy_frame(VideoSystem::System625_50))
        .unwrap();
    assert_eq!(
        calls.recv_timeout(TIMEOUT).unwrap(),
        MixerCall::PutFrame(0, VideoSystem::System625_50, 144_000)
    );
}

#[test]
fn test_raw_sink_output_round_trips_as_source_input() {
    let hub = start_hub();

    // First leg: push three frames through a raw sink.
    let mut sink_client = SinkClient::connect_raw(hub.server.local_addr()).unwrap();
    sink_client.set_read_timeout(Some(TIMEOUT)).unwrap();
    let sink = hub.sinks.recv_timeout(TIMEOUT).unwrap();

    let outgoing = [
        mixed_frame(VideoSystem::System625_50, false),
        mixed_frame(VideoSystem::System525_60, true),
        mixed_frame(VideoSystem::System625_50, false),
    ];
    for frame in &outgoing {
        sink.put_frame(frame);
    }

    let mut captured = Vec::new();
    for _ in 0..outgoing.len() {
        captured.push(sink_client.read_frame().unwrap().data);
    }

    // Second leg: feed the captured bytes back in as a fresh source.
    let mut source = SourceClient::connect(hub.server.local_addr()).unwrap();
    for data in &captured {
        source.send_frame(data).unwrap();
    }

    // Skip registration calls; compare the published frames byte for byte.
    for expected in &outgoing {
        let republished = hub.published.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(republished.system, expected.system);
        assert_eq!(republished.size, expected.size);
        assert_eq!(republished.data(), expected.data());
    }
}
