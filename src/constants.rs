//! Defaults for the multiplexer and its transport.
//!
//! Grouped by concern. Every value here can be overridden through
//! [`crate::Config`].

use std::time::Duration;

// ============================================================================
// Connection
// ============================================================================

/// Default dashboard server.
pub const DEFAULT_SERVER_URL: &str = "https://dashboard.example.com";

/// Server-side cable channel class that multiplexes logical channels.
pub const DEFAULT_CABLE_CHANNEL: &str = "DashboardChannel";

/// Path of the cable endpoint appended to the server URL.
pub const CABLE_PATH: &str = "/cable";

/// Path of the private-channel token endpoint.
pub const CHANNEL_AUTH_PATH: &str = "/api/realtime/auth";

/// HTTP timeout for token requests.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the cable `welcome` frame after the socket opens.
pub const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Reconnection backoff
// ============================================================================

/// First reconnect delay.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Cap on the reconnect delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Upper bound of the random jitter added to each delay.
pub const BACKOFF_JITTER: Duration = Duration::from_millis(1000);

// ============================================================================
// Channels & queues
// ============================================================================

/// A channel-open request with no acknowledgment after this long fails.
pub const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// How often pending channel opens are checked against the timeout.
pub const OPEN_TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Outbound messages held while disconnected before the oldest are dropped.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;
