/*!
 # Transport capability

 The BLE radio is consumed, never implemented here. A backend provides an
 adapter that can be started (optionally reset) and can open links; a link
 can write to a characteristic and be torn down. [`crate::btle`] implements
 this over btleplug and [`crate::fake`] in memory.
*/

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Hardware address (or platform id) of a peripheral.
///
/// Opaque; only compared case-insensitively.
#[derive(Debug, Clone, Eq)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `other` names the same device, ignoring case
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other.trim())
    }
}

impl PartialEq for DeviceAddress {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.0)
    }
}

impl std::hash::Hash for DeviceAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_ascii_lowercase().hash(state);
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceAddress {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Failures reported by a transport backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The local radio is missing or refused to start
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// No peripheral answered to the address
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The link is down
    #[error("Link is not connected")]
    NotConnected,

    /// The backend gave up waiting for an acknowledgment
    #[error("Write was not acknowledged")]
    AckTimeout,

    /// The peripheral does not expose the characteristic
    #[error("Could not find required BLE characteristic: {0}")]
    CharacteristicNotFound(Uuid),

    /// Anything else the backend reported
    #[error("BLE communication error: {0}")]
    Backend(String),
}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::NotConnected => TransportError::NotConnected,
            btleplug::Error::DeviceNotFound => {
                TransportError::DeviceNotFound("unknown peripheral".to_string())
            }
            btleplug::Error::TimedOut(_) => TransportError::AckTimeout,
            other => TransportError::Backend(other.to_string()),
        }
    }
}

/// A local radio able to open links to peripherals
#[async_trait]
pub trait BleAdapter: Send + Sync + 'static {
    /// Link type opened by this adapter
    type Link: BleLink;

    /// Human readable identifier, used in logs and errors
    fn id(&self) -> String;

    /// Starts the radio. With `reset`, every other link on it is invalidated.
    async fn start(&self, reset: bool) -> Result<(), TransportError>;

    /// Opens a link to the device at `address`
    async fn connect(&self, address: &DeviceAddress) -> Result<Self::Link, TransportError>;
}

/// An open link to one peripheral
#[async_trait]
pub trait BleLink: Send + Sync + 'static {
    /// Writes `bytes` to `characteristic`. With `ack`, resolves only once the
    /// peripheral confirmed the write.
    async fn write(&self, characteristic: Uuid, bytes: &[u8], ack: bool)
        -> Result<(), TransportError>;

    /// Tears the link down. Reports `NotConnected` if it already was.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_compare_ignoring_case() {
        let a = DeviceAddress::new("AA:BB:CC:DD:EE:FF");
        let b = DeviceAddress::new(" aa:bb:cc:dd:ee:ff ");
        assert_eq!(a, b);
        assert!(a.matches("aa:BB:cc:DD:ee:FF"));
        assert_eq!(b.to_string(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn btleplug_errors_keep_their_meaning() {
        assert_eq!(
            TransportError::from(btleplug::Error::NotConnected),
            TransportError::NotConnected
        );
        assert_eq!(
            TransportError::from(btleplug::Error::TimedOut(std::time::Duration::from_secs(1))),
            TransportError::AckTimeout
        );
    }
}
