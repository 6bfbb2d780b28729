//! Reliable, ordered-ish, bandwidth-adaptive game-state transport.
//!
//! A connection is a pair of [`Endpoint`]s exchanging datagrams over any
//! unreliable link. Each packet is coded against the adaptive statistics as
//! they stood after the last acknowledged packet (the basis), so loss never
//! desynchronizes the model: both sides clone the same snapshot, and a lost
//! packet simply never becomes a basis.
//!
//! The engine owns sequencing, acknowledgement and coding only. Message
//! storage, dispatch, datagram IO and rate policy come from the caller
//! through the [`traits`] seams, passed per call as an
//! [`traits::EndpointIo`] bundle.
//!
//! ```no_run
//! use statecast_transport::{Config, Endpoint, MessageDirectory};
//!
//! let directory = MessageDirectory::new(32)?;
//! let _endpoint = Endpoint::new(Config::default(), directory)?;
//! # Ok::<(), statecast_transport::ConfigError>(())
//! ```

pub mod alphabet;
pub mod bigstate;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod msgid;
pub mod stats;
pub mod traits;

pub use config::{CipherConfig, Config, StreamFormat};
pub use endpoint::{
    ConnectionState, Endpoint, EndpointEvent, MessageFlags, PacketWriter, UpdateParams,
};
pub use error::{ConfigError, ProtocolError};
pub use msgid::{HotTable, MessageDirectory, MessageId, END_OF_STREAM};
pub use stats::EndpointStats;
pub use traits::{
    DispatchResult, EndpointIo, FillResult, MessageEnv, MessageQueue, MessageSink, RateControl,
    SendableHandle, Transport,
};
