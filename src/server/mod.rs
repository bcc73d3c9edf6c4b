//! The mixer hub server
//!
//! A single event-loop thread owns the listening socket, every client
//! socket, and the poll. Only that thread creates, transmutes, or destroys
//! connections and only it changes polling interest. Other threads reach it
//! exclusively through the wakeup channel: the mixer announces queued sink
//! output, and anyone may ask the loop to shut down.

pub mod config;
pub mod connection;
pub mod wakeup;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use crate::error::Result;
use crate::mixer::Mixer;

use config::ServerConfig;
use connection::{Connection, RecvStep, SendStatus};
use wakeup::{WakeupSender, QUIT_MESSAGE, WAKEUP_BATCH};

/// Token of the wakeup channel's waker
const WAKEUP: Token = Token(0);

/// Token of the listening socket
const LISTENER: Token = Token(1);

/// First token handed to client connections
const FIRST_CONNECTION: usize = 2;

/// The mixer hub's TCP server.
///
/// Generic over the mixer it feeds; tests substitute a recording mixer, the
/// workstation passes its switcher.
pub struct Server<M: Mixer> {
    config: ServerConfig,
    mixer: Arc<M>,
}

impl<M: Mixer> Server<M> {
    /// Create a new server with the given configuration and mixer.
    pub fn new(config: ServerConfig, mixer: Arc<M>) -> Self {
        Self { config, mixer }
    }

    /// Bind the listener and start the event-loop thread.
    pub fn spawn(self) -> Result<ServerHandle> {
        let mut listener = TcpListener::bind(self.config.bind_addr)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        let (wakeup, wakeup_rx) = wakeup::wakeup_channel(poll.registry(), WAKEUP)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        tracing::info!(addr = %local_addr, "Mixer hub listening");

        let event_loop = EventLoop {
            poll,
            listener,
            mixer: self.mixer,
            config: self.config,
            wakeup: wakeup.clone(),
            wakeup_rx,
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION,
        };
        let thread = thread::Builder::new()
            .name("hub-server".into())
            .spawn(move || event_loop.run())?;

        Ok(ServerHandle {
            local_addr,
            wakeup,
            thread: Some(thread),
        })
    }
}

/// Handle to a running server.
///
/// Dropping the handle shuts the server down and waits for the event-loop
/// thread to finish.
pub struct ServerHandle {
    local_addr: SocketAddr,
    wakeup: WakeupSender,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A sender any thread can use to wake the event loop.
    pub fn wakeup(&self) -> WakeupSender {
        self.wakeup.clone()
    }

    /// Shut the server down and wait for the event-loop thread to finish.
    pub fn shutdown(mut self) {
        self.shutdown_impl();
    }

    fn shutdown_impl(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.wakeup.quit();
            let _ = thread.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown_impl();
    }
}

struct EventLoop<M: Mixer> {
    poll: Poll,
    listener: TcpListener,
    mixer: Arc<M>,
    config: ServerConfig,
    wakeup: WakeupSender,
    wakeup_rx: Receiver<isize>,
    connections: HashMap<usize, Connection<M>>,
    next_token: usize,
}

impl<M: Mixer> EventLoop<M> {
    fn run(mut self) {
        let mut events = Events::with_capacity(256);

        'serve: loop {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %err, "poll failed");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKEUP => {
                        if !self.drain_wakeups() {
                            break 'serve;
                        }
                    }
                    LISTENER => self.accept_clients(),
                    Token(token) => self.handle_client_event(token, event),
                }
            }
        }

        // Destroy remaining connections in arbitrary order; their drops
        // release the mixer identities.
        for (_, mut connection) in self.connections.drain() {
            let _ = self.poll.registry().deregister(connection.stream_mut());
        }
        tracing::info!("Mixer hub stopped");
    }

    /// Consume pending wakeup messages. Returns false on quit.
    fn drain_wakeups(&mut self) -> bool {
        for _ in 0..WAKEUP_BATCH {
            let message = match self.wakeup_rx.try_recv() {
                Ok(message) => message,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return true,
            };
            if message == QUIT_MESSAGE {
                tracing::info!("Quit requested");
                return false;
            }
            self.enable_output(message as RawFd);
        }

        // More than a full batch is pending; make sure the next poll cycle
        // comes straight back to the channel.
        self.wakeup.wake();
        true
    }

    /// Add write interest to the connection whose socket is `fd`.
    ///
    /// A message naming an fd with no matching connection is stale (the
    /// sink was already dropped) and is silently discarded.
    fn enable_output(&mut self, fd: RawFd) {
        let registry = self.poll.registry();
        for (&token, connection) in self.connections.iter_mut() {
            if connection.raw_fd() == fd {
                let _ = registry.reregister(
                    connection.stream_mut(),
                    Token(token),
                    Interest::READABLE | Interest::WRITABLE,
                );
                return;
            }
        }
    }

    /// Accept every waiting client. Accept errors are not fatal.
    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => self.install_client(stream, peer_addr),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to accept connection");
                    break;
                }
            }
        }
    }

    fn install_client(&mut self, mut stream: TcpStream, peer_addr: SocketAddr) {
        if self.config.max_connections > 0
            && self.connections.len() >= self.config.max_connections
        {
            tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
            return;
        }

        if self.config.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }

        let token = self.next_token;
        self.next_token += 1;
        if let Err(err) =
            self.poll
                .registry()
                .register(&mut stream, Token(token), Interest::READABLE)
        {
            tracing::warn!(peer = %peer_addr, error = %err, "Failed to register connection");
            return;
        }

        tracing::debug!(peer = %peer_addr, "Client connected");
        self.connections.insert(
            token,
            Connection::new(stream, Arc::clone(&self.mixer), self.wakeup.clone()),
        );
    }

    fn handle_client_event(&mut self, token: usize, event: &Event) {
        // The connection may have been dropped earlier in this batch.
        let Some(connection) = self.connections.get_mut(&token) else {
            return;
        };

        let mut keep = true;

        if event.is_error() {
            keep = false;
        } else {
            if event.is_readable() {
                keep = drive_receive(connection);
            }
            if keep && event.is_writable() {
                keep = match connection.send() {
                    SendStatus::Failed => false,
                    SendStatus::SentSome => true,
                    SendStatus::SentAll => {
                        let _ = self.poll.registry().reregister(
                            connection.stream_mut(),
                            Token(token),
                            Interest::READABLE,
                        );
                        true
                    }
                };
            }
        }

        if !keep {
            self.drop_connection(token);
        }
    }

    fn drop_connection(&mut self, token: usize) {
        if let Some(mut connection) = self.connections.remove(&token) {
            tracing::warn!(client = %connection, "Dropping connection");
            let _ = self.poll.registry().deregister(connection.stream_mut());
        }
    }
}

/// Drain a readable socket until it blocks. Returns false when the
/// connection asked to be dropped.
fn drive_receive<M: Mixer>(connection: &mut Connection<M>) -> bool {
    loop {
        match connection.receive() {
            RecvStep::Progress => continue,
            RecvStep::Blocked => return true,
            RecvStep::Closed => return false,
        }
    }
}
