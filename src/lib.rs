//! Server-side stream-event integration core: OBS WebSocket v5 and Twitch EventSub supervision,
//! request/response correlation, and a temporal chat/speech correlation engine.
//!
//! The crate is organized the way the system is laid out in its own design notes: protocol state
//! machines and their supervisors ([`obs`], [`twitch`]) publish onto an in-process bus
//! ([`pubsub`]), which the correlation engine ([`correlation`]) and any other downstream consumer
//! subscribe to. [`app`] wires a full instance together from [`Config`].

#![deny(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod activity_log;
pub mod app;
pub mod config;
pub mod correlation;
pub mod error;
pub mod metrics;
pub mod obs;
pub mod pubsub;
pub mod transport;
pub mod twitch;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
