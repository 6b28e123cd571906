/*!
 # Triones Bluetooth LED Strip Controller Library

 A Rust library for controlling Triones (and compatible "HappyLighting",
 "LEDnet") Bluetooth LED strip controllers that listen on the `FFD9`
 characteristic.

 ## Features

 * Power on/off control
 * RGB color control
 * White channel intensity
 * Built-in animation modes with speed
 * Fire-and-forget or acknowledged writes
 * Several strips on one adapter

 ## Example

 ```rust,no_run
 use triones_led_controller::*;
 use triones_led_controller::btle::{AdapterSelector, BtleAdapter};

 #[tokio::main]
 async fn main() -> Result<()> {
     // Initialize tracing for logs
     tracing_subscriber::fmt::init();

     let adapter = AdapterHandle::new(BtleAdapter::new(
         AdapterSelector::Default,
         ScanConfig::default(),
     ));
     let session = Session::open(
         "AA:BB:CC:DD:EE:FF".into(),
         adapter,
         true,
         SessionConfig::default(),
     )
     .await?;

     session.set_power(true, false).await?;
     session.set_color(255, 0, 0, false).await?; // Red
     session.set_builtin_mode(BuiltInMode::SevenColorCrossFade.into(), 10, true).await?;
     session.close().await?;

     Ok(())
 }
 ```
*/

use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

/// Errors raised while encoding a command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Built-in mode code outside `37..=56`
    #[error("Built-in mode {0} out of range (37..=56)")]
    InvalidMode(i64),

    /// Mode name that matches no built-in mode
    #[error("Unknown built-in mode name: {0}")]
    UnknownModeName(String),
}

/// Errors raised by the connection manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The local radio could not be started
    #[error("Could not start Bluetooth adapter {adapter}: {reason}")]
    AdapterStartError { adapter: String, reason: String },

    /// No active link to the device
    #[error("Device {address} is not connected: {reason}")]
    DeviceNotConnected {
        address: DeviceAddress,
        reason: String,
    },

    /// A confirmed write was not acknowledged in time
    #[error("Device {address} did not acknowledge the write within {timeout:?}")]
    NotificationTimeout {
        address: DeviceAddress,
        timeout: Duration,
    },
}

/// Errors returned to callers of a [`Session`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session is not connected
    #[error("Session is not ready (state: {0})")]
    SessionNotReady(SessionState),

    /// The session was closed
    #[error("Session is closed")]
    SessionClosed,

    /// The command could not be encoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The transport failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

pub mod btle;
pub mod codec;
pub mod config;
pub mod connection;
pub mod fake;
pub mod modes;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export key types
pub use codec::{
    encode_builtin_mode, encode_color, encode_power, encode_white, Command, CommandPayload,
};
pub use config::{ConnectionConfig, ScanConfig, SessionConfig};
pub use connection::{connect, AdapterHandle, Connection, ConnectionState};
pub use modes::BuiltInMode;
pub use session::{close_all, open_many, LastState, LightMode, Session};
pub use transport::{BleAdapter, BleLink, DeviceAddress, TransportError};
