//! Classroom Realtime - event channel multiplexer for the classroom dashboard.
//!
//! One physical push connection carries many logical channels (class
//! rosters, leaderboards, background-task progress, Studio plugin events,
//! observability streams). Independent UI components subscribe to
//! overlapping channels with per-message predicates; the multiplexer routes
//! every inbound event to exactly the subscriptions that want it, survives
//! reconnects transparently, and cleans up channels when the last
//! subscriber leaves.
//!
//! # Architecture
//!
//! Leaves first:
//!
//! - **Transport Connection** ([`transport`]) - owns the socket, reconnects
//!   with jittered exponential backoff, reports everything as
//!   [`TransportEvent`]s
//! - **Channel Registry** ([`registry`]) - reference counts per channel,
//!   opens on first subscriber, closes on last, replays on reconnect
//! - **Subscription Table** ([`subscription`]) - live `(channel, predicate,
//!   handler)` entries keyed by [`SubscriptionId`]
//! - **Dispatcher** ([`dispatch`]) - validates inbound messages and invokes
//!   matching handlers in registration order, isolating failures
//! - **Outbound Sender** ([`outbound`]) - bounded FIFO for messages issued
//!   while offline, flushed on reconnect
//!
//! [`Multiplexer`] ties them together behind a single-threaded handle.
//!
//! # Example
//!
//! ```no_run
//! use classroom_realtime::{filter, CableTransport, Config, Event, Multiplexer};
//! use classroom_realtime::transport::socket::cable_url;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let mut transport = CableTransport::new(config.cable_options());
//! let events = transport
//!     .take_events()
//!     .ok_or_else(|| anyhow::anyhow!("event stream already taken"))?;
//!
//! let mux = Multiplexer::new(transport, config.mux_options());
//! mux.subscribe("class-42", filter::kind("student-enrolled"), |msg| {
//!     println!("enrolled: {:?}", msg.event);
//!     Ok(())
//! });
//! mux.send("class-42", Event::RequestLeaderboard(Default::default()));
//! mux.connect(&cable_url(&config.server_url), &config.auth_params());
//! mux.run(events).await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod message;
pub mod mux;
pub mod outbound;
pub mod registry;
pub mod subscription;
pub mod transport;

// Re-export commonly used types
pub use auth::{HttpTokenProvider, StaticTokenProvider, TokenProvider};
pub use config::Config;
pub use error::{ChannelOpenError, HandlerError, MalformedMessageError, TransportError};
pub use message::{ChannelName, Event, Message};
pub use mux::{Diagnostics, Multiplexer, MuxOptions, SubscriptionGuard};
pub use registry::ChannelStatus;
pub use subscription::SubscriptionId;
pub use transport::{
    AuthParams, CableTransport, ConnectionState, MemoryTransport, Transport, TransportEvent,
};
