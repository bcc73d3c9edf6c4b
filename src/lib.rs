//! Network hub for a live DV switching workstation
//!
//! The hub accepts TCP clients that greet as either *sources* (pushing
//! framed DV video/audio) or *sinks* (consuming the selected mixed output)
//! and shuttles complete frames between them through a mixing stage:
//!
//! - A single event-loop thread owns every socket and drives the
//!   per-connection state machines ([`server`]).
//! - Complete frames are published to the [`mixer`]; the provided
//!   [`Switcher`] forwards the selected source's frames to every registered
//!   sink and marks cut points.
//! - Each sink has a bounded frame queue. A sink that falls behind is
//!   dropped, never throttled upstream.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dvmix_rs::{Server, ServerConfig, Switcher};
//!
//! # fn main() -> dvmix_rs::Result<()> {
//! let mixer = Arc::new(Switcher::new());
//! let config = ServerConfig::default().bind("127.0.0.1:2000".parse().unwrap());
//! let server = Server::new(config, Arc::clone(&mixer)).spawn()?;
//! println!("listening on {}", server.local_addr());
//! // ... feed sources, switch with mixer.set_video_source(), mixer.cut() ...
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod dif;
pub mod error;
pub mod frame;
pub mod mixer;
pub mod protocol;
pub mod ring;
pub mod server;

pub use dif::VideoSystem;
pub use error::{Error, Result};
pub use frame::Frame;
pub use mixer::{Mixer, Sink, SinkId, SourceId, Switcher};
pub use server::config::ServerConfig;
pub use server::{Server, ServerHandle};
