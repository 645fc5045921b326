//! dockwire - stream transport layer for the container engine API.
//!
//! Turns raw, long-lived engine connections into typed streams and fans
//! them out to independent consumers.
//!
//! # Modules
//!
//! - [`framing`] - multiplexed stream header codec and push decoder
//! - [`multiplexed`] - pull reader for log bodies
//! - [`jsonstream`] - newline-delimited JSON (events, progress, stats)
//! - [`hijack`] - interactive exec/attach sessions over an upgraded connection
//! - [`channel`] - publish/subscribe fan-out with bounded inboxes
//! - [`pump`] - background tasks feeding channels (events, followed logs)
//! - [`transport`] / [`http`] - engine connections and the HTTP/1.1 client
//! - [`engine`] - facade tying the above to engine endpoints
//! - [`config`] - configuration loading
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> dockwire::Result<()> {
//! use dockwire::{Engine, StreamEvent};
//!
//! let engine = Engine::from_env()?;
//! let events = engine.events();
//! let mut subscriber = events.subscribe();
//! while let Some(event) = subscriber.recv().await {
//!     if let StreamEvent::End(reason) = event {
//!         println!("stream ended: {reason:?}");
//!         break;
//!     }
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod framing;
pub mod hijack;
pub mod http;
pub mod jsonstream;
pub mod multiplexed;
pub mod pump;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use channel::{DeliveryPolicy, PubSubChannel, Subscriber};
pub use config::ClientConfig;
pub use engine::{
    AttachOptions, BuildOptions, Container, Engine, Exec, ExecConfig, ExecStart, Images,
    LogOptions, LogOutput, RegistryAuth,
};
pub use error::{Error, Result};
pub use framing::{Frame, FrameDecoder, StreamDecoder, StreamType};
pub use hijack::{HijackedTransport, TransportState};
pub use jsonstream::{JsonLineStream, Termination};
pub use multiplexed::MultiplexedResult;
pub use pump::{EndReason, EventBus, LogPump, Pump, PumpState, StreamEvent};
