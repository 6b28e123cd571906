/*!
 # Configuration

 Timeouts and pacing for links, sessions and the btleplug scanner.
*/

use std::time::Duration;

/// Bounds applied by the connection manager to every backend call
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long to wait for the device to accept a link
    pub connect_timeout: Duration,
    /// How long a confirmed write may wait for the acknowledgment
    pub ack_timeout: Duration,
    /// How long a fire-and-forget write or a disconnect may take to submit
    pub write_timeout: Duration,
    /// Minimum spacing between two writes on the same link
    pub command_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20), // covers a full discovery scan
            ack_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(2),
            command_delay: Duration::from_millis(15), // lowest value the controllers keep up with
        }
    }
}

impl ConnectionConfig {
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_delay(mut self, delay: Duration) -> Self {
        self.command_delay = delay;
        self
    }
}

/// Session behaviour on top of the connection bounds
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    /// Retry a connect that found no device once, without resetting the adapter
    pub retry_connect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            retry_connect: true,
        }
    }
}

impl SessionConfig {
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_retry_connect(mut self, retry: bool) -> Self {
        self.retry_connect = retry;
        self
    }
}

/// Discovery pacing for the btleplug backend
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Give up looking for the address after this long
    pub discovery_timeout: Duration,
    /// Pause between two peripheral list polls
    pub poll_interval: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
        }
    }
}
