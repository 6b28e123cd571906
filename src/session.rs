/*!
 # Device sessions

 A [`Session`] is the handle callers hold for one physical strip. It owns the
 connection, serializes every command (acknowledgment wait included) and
 remembers the last state it applied.

 ```text
 Created -> Connecting -> Connected -> Closed
                 \             \
                  +-> Failed <--+
 ```

 `Closed` and `Failed` are final.
*/

use std::fmt;

use chrono::{DateTime, Local};
use futures::future::join_all;
use parking_lot::Mutex as StateLock;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::codec::{BuiltInModeCommand, ColorCommand, Command, PowerCommand, WhiteCommand};
use crate::config::SessionConfig;
use crate::connection::{self, AdapterHandle, Connection, ConnectionState};
use crate::transport::{BleAdapter, DeviceAddress};
use crate::{ConnectionError, ProtocolError, Result, SessionError};

/// Lifecycle state of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Connecting,
    Connected,
    Closed,
    Failed(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Closed => write!(f, "closed"),
            SessionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// What the strip is showing, as far as this session knows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LightMode {
    #[default]
    Unknown,
    Color {
        red: u8,
        green: u8,
        blue: u8,
    },
    White {
        intensity: u8,
    },
    BuiltIn {
        mode: u8,
        speed: u8,
    },
}

/// Last state successfully applied through a session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LastState {
    /// `None` until a power command went through
    pub power: Option<bool>,
    pub light: LightMode,
    /// When the last command was applied
    pub updated_at: Option<DateTime<Local>>,
}

impl LastState {
    fn apply(&mut self, command: &Command) {
        match *command {
            Command::Power(PowerCommand(on)) => self.power = Some(on),
            Command::Color(c) => {
                self.light = LightMode::Color {
                    red: c.red,
                    green: c.green,
                    blue: c.blue,
                }
            }
            Command::White(w) => {
                self.light = LightMode::White {
                    intensity: w.intensity,
                }
            }
            Command::BuiltInMode(m) => {
                self.light = LightMode::BuiltIn {
                    mode: m.mode(),
                    speed: m.speed(),
                }
            }
        }
        self.updated_at = Some(Local::now());
    }
}

struct Inner<L> {
    state: SessionState,
    connection: Option<Connection<L>>,
    last_state: LastState,
}

/// Caller-facing handle to one LED strip
pub struct Session<A: BleAdapter> {
    address: DeviceAddress,
    adapter: AdapterHandle<A>,
    config: SessionConfig,
    /// Readable while `inner` is held by a connect or a command
    link_state: StateLock<ConnectionState>,
    inner: Mutex<Inner<A::Link>>,
}

impl<A: BleAdapter> Session<A> {
    /// Creates a session in the `Created` state; nothing is sent until
    /// [`Session::connect`].
    pub fn new(address: DeviceAddress, adapter: AdapterHandle<A>, config: SessionConfig) -> Self {
        Self {
            address,
            adapter,
            config,
            link_state: StateLock::new(ConnectionState::Disconnected),
            inner: Mutex::new(Inner {
                state: SessionState::Created,
                connection: None,
                last_state: LastState::default(),
            }),
        }
    }

    /// Creates a session and connects it.
    ///
    /// # Errors
    ///
    /// Returns the `ConnectionError` of the failed connect.
    #[instrument(skip(adapter, config), fields(adapter = %adapter.id()))]
    pub async fn open(
        address: DeviceAddress,
        adapter: AdapterHandle<A>,
        reset_on_start: bool,
        config: SessionConfig,
    ) -> std::result::Result<Self, ConnectionError> {
        let session = Self::new(address, adapter, config);
        match session.connect(reset_on_start).await {
            Ok(()) => Ok(session),
            Err(SessionError::Connection(e)) => Err(e),
            // A fresh session is always in `Created`
            Err(other) => Err(ConnectionError::DeviceNotConnected {
                address: session.address.clone(),
                reason: other.to_string(),
            }),
        }
    }

    /// Connects a `Created` session.
    ///
    /// A connect that finds no device is retried once without reset when
    /// `retry_connect` is set. Any other failure moves the session to
    /// `Failed`.
    ///
    /// # Errors
    ///
    /// * `SessionError::SessionNotReady` - the session is not in `Created`
    /// * `SessionError::Connection` - the adapter or device failed
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn connect(&self, reset_on_start: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match &inner.state {
            SessionState::Created => {}
            SessionState::Closed => return Err(SessionError::SessionClosed),
            other => return Err(SessionError::SessionNotReady(other.clone())),
        }
        inner.state = SessionState::Connecting;
        self.set_link_state(ConnectionState::Connecting);

        let cfg = &self.config.connection;
        let mut outcome =
            connection::connect(&self.address, &self.adapter, reset_on_start, cfg).await;
        if let Err(ConnectionError::DeviceNotConnected { reason, .. }) = &outcome {
            if self.config.retry_connect {
                warn!("Connect to {} failed ({}), retrying once", self.address, reason);
                outcome = connection::connect(&self.address, &self.adapter, false, cfg).await;
            }
        }

        match outcome {
            Ok(conn) => {
                inner.connection = Some(conn);
                inner.state = SessionState::Connected;
                self.set_link_state(ConnectionState::Connected);
                info!("Session to {} ready", self.address);
                Ok(())
            }
            Err(e) => {
                inner.state = SessionState::Failed(e.to_string());
                self.set_link_state(ConnectionState::Failed(e.to_string()));
                Err(e.into())
            }
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state.clone()
    }

    pub async fn last_state(&self) -> LastState {
        self.inner.lock().await.last_state.clone()
    }

    /// State of the underlying link. Unlike [`Session::state`] this does not
    /// wait for an in-flight connect or command.
    pub fn connection_state(&self) -> ConnectionState {
        self.link_state.lock().clone()
    }

    fn set_link_state(&self, state: ConnectionState) {
        debug!("Link to {} is {}", self.address, state);
        *self.link_state.lock() = state;
    }

    /// Turns the strip on or off
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn set_power(&self, on: bool, require_ack: bool) -> Result<()> {
        debug!("Turning LED strip {}", if on { "on" } else { "off" });
        self.dispatch(Ok(PowerCommand(on).into()), require_ack).await?;
        info!("LED strip powered {}", if on { "on" } else { "off" });
        Ok(())
    }

    /// Sets a static RGB color
    ///
    /// # Arguments
    ///
    /// * `red` - Red component (0-255)
    /// * `green` - Green component (0-255)
    /// * `blue` - Blue component (0-255)
    /// * `require_ack` - Wait for the strip to confirm the write
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn set_color(&self, red: u8, green: u8, blue: u8, require_ack: bool) -> Result<()> {
        debug!("Setting color to RGB({}, {}, {})", red, green, blue);
        self.dispatch(Ok(ColorCommand::new(red, green, blue).into()), require_ack)
            .await?;
        info!("Color set to RGB({}, {}, {})", red, green, blue);
        Ok(())
    }

    /// Switches to the white channel at `intensity` (0-255)
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn set_white(&self, intensity: u8, require_ack: bool) -> Result<()> {
        debug!("Setting white intensity to {}", intensity);
        self.dispatch(Ok(WhiteCommand::new(intensity).into()), require_ack)
            .await?;
        info!("White intensity set to {}", intensity);
        Ok(())
    }

    /// Starts a built-in animation
    ///
    /// # Arguments
    ///
    /// * `mode` - Mode code (37-56, see [`crate::BuiltInMode`])
    /// * `speed` - Animation speed, clamped to 1-255
    /// * `require_ack` - Wait for the strip to confirm the write
    ///
    /// # Errors
    ///
    /// `ProtocolError::InvalidMode` for a code outside 37-56, besides the
    /// usual session and connection errors.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn set_builtin_mode(&self, mode: i64, speed: i64, require_ack: bool) -> Result<()> {
        debug!("Setting built-in mode {} at speed {}", mode, speed);
        let command = BuiltInModeCommand::new(mode, speed).map(Command::from);
        self.dispatch(command, require_ack).await?;
        info!("Built-in mode {} set", mode);
        Ok(())
    }

    /// Disconnects from the strip. Commands fail with `SessionClosed`
    /// afterwards; closing twice is a no-op.
    ///
    /// A `Failed` session still releases its link but stays `Failed`.
    ///
    /// # Errors
    ///
    /// `ConnectionError::DeviceNotConnected` when the link was already down;
    /// the session is closed regardless.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            debug!("Session to {} already closed", self.address);
            return Ok(());
        }
        if !matches!(inner.state, SessionState::Failed(_)) {
            inner.state = SessionState::Closed;
        }

        match inner.connection.take() {
            Some(conn) => {
                let outcome = conn.disconnect().await;
                if !matches!(inner.state, SessionState::Failed(_)) {
                    self.set_link_state(ConnectionState::Disconnected);
                }
                outcome?;
                info!("Session to {} closed", self.address);
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn dispatch(
        &self,
        command: std::result::Result<Command, ProtocolError>,
        require_ack: bool,
    ) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        match &inner.state {
            SessionState::Connected => {}
            SessionState::Closed => return Err(SessionError::SessionClosed),
            other => return Err(SessionError::SessionNotReady(other.clone())),
        }
        let command = command?;

        let Some(conn) = inner.connection.as_ref() else {
            return Err(SessionError::SessionNotReady(inner.state.clone()));
        };
        match conn.send(command.encode(), require_ack).await {
            Ok(()) => {
                inner.last_state.apply(&command);
                Ok(())
            }
            Err(e @ ConnectionError::DeviceNotConnected { .. }) => {
                warn!("Link to {} lost, session failed", self.address);
                inner.state = SessionState::Failed(e.to_string());
                self.set_link_state(ConnectionState::Failed(e.to_string()));
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<A: BleAdapter> fmt::Debug for Session<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address)
            .field("adapter", &self.adapter.id())
            .finish_non_exhaustive()
    }
}

/// Opens one session per address on a shared adapter.
///
/// Sessions are opened in order and only the first connect may reset the
/// adapter, since a reset drops every other link on it. If any connect fails,
/// the sessions opened so far are closed again.
///
/// # Errors
///
/// The `ConnectionError` of the first connect that failed.
#[instrument(skip(adapter, config), fields(adapter = %adapter.id(), count = addresses.len()))]
pub async fn open_many<A: BleAdapter>(
    addresses: &[DeviceAddress],
    adapter: &AdapterHandle<A>,
    reset_on_first: bool,
    config: &SessionConfig,
) -> std::result::Result<Vec<Session<A>>, ConnectionError> {
    let mut sessions = Vec::with_capacity(addresses.len());
    for (i, address) in addresses.iter().enumerate() {
        let reset = reset_on_first && i == 0;
        match Session::open(address.clone(), adapter.clone(), reset, config.clone()).await {
            Ok(session) => sessions.push(session),
            Err(e) => {
                warn!(
                    "Opening {} failed, closing {} session(s)",
                    address,
                    sessions.len()
                );
                close_all(&sessions).await;
                return Err(e);
            }
        }
    }
    Ok(sessions)
}

/// Closes every session concurrently, returning each outcome in order
pub async fn close_all<A: BleAdapter>(sessions: &[Session<A>]) -> Vec<Result<()>> {
    join_all(sessions.iter().map(Session::close)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::fake::{FakeAdapter, FakeBehavior, FakeEvent};
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig::default()
            .with_connection(ConnectionConfig::default().with_command_delay(Duration::ZERO))
    }

    async fn connected(adapter: &AdapterHandle<FakeAdapter>) -> Session<FakeAdapter> {
        Session::open("AA:BB:CC:DD:EE:01".into(), adapter.clone(), true, config())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn commands_before_connect_are_not_ready() {
        let adapter = AdapterHandle::new(FakeAdapter::new("hci0"));
        let session = Session::new("AA:BB:CC:DD:EE:01".into(), adapter.clone(), config());

        let err = session.set_power(true, false).await.unwrap_err();

        assert_eq!(err, SessionError::SessionNotReady(SessionState::Created));
        assert!(adapter.backend().events().is_empty());
    }

    #[tokio::test]
    async fn commands_update_last_state() {
        let adapter = AdapterHandle::new(FakeAdapter::new("hci0"));
        let session = connected(&adapter).await;
        assert_eq!(session.last_state().await, LastState::default());

        session.set_power(true, false).await.unwrap();
        session.set_color(10, 20, 30, true).await.unwrap();
        let state = session.last_state().await;
        assert_eq!(state.power, Some(true));
        assert_eq!(
            state.light,
            LightMode::Color {
                red: 10,
                green: 20,
                blue: 30
            }
        );
        assert!(state.updated_at.is_some());

        session.set_white(200, false).await.unwrap();
        session.set_builtin_mode(40, 0, false).await.unwrap();
        assert_eq!(
            session.last_state().await.light,
            LightMode::BuiltIn { mode: 40, speed: 1 }
        );

        assert_eq!(
            adapter.backend().writes(),
            vec![
                vec![0xCC, 0x23, 0x33],
                vec![0x56, 10, 20, 30, 0x19, 0xF0, 0xAA],
                vec![0x56, 0, 0, 0, 200, 0x0F, 0xAA],
                vec![0xBB, 40, 1, 0x44],
            ]
        );
    }

    #[tokio::test]
    async fn invalid_mode_is_propagated_unchanged() {
        let adapter = AdapterHandle::new(FakeAdapter::new("hci0"));
        let session = connected(&adapter).await;

        let err = session.set_builtin_mode(36, 10, false).await.unwrap_err();

        assert_eq!(err, SessionError::Protocol(ProtocolError::InvalidMode(36)));
        assert!(adapter.backend().writes().is_empty());
        assert_eq!(session.state().await, SessionState::Connected);
    }

    #[tokio::test]
    async fn closed_session_rejects_commands_without_writing() {
        let adapter = AdapterHandle::new(FakeAdapter::new("hci0"));
        let session = connected(&adapter).await;
        session.close().await.unwrap();
        let events_after_close = adapter.backend().events().len();

        assert_eq!(
            session.set_power(true, false).await,
            Err(SessionError::SessionClosed)
        );
        assert_eq!(
            session.set_color(1, 2, 3, true).await,
            Err(SessionError::SessionClosed)
        );
        assert_eq!(
            session.set_white(1, false).await,
            Err(SessionError::SessionClosed)
        );
        assert_eq!(
            session.set_builtin_mode(37, 1, false).await,
            Err(SessionError::SessionClosed)
        );
        assert_eq!(adapter.backend().events().len(), events_after_close);
        assert_eq!(session.state().await, SessionState::Closed);
        // Closing again is harmless
        session.close().await.unwrap();
        assert_eq!(adapter.live_links(), 0);
    }

    #[tokio::test]
    async fn connect_retries_once_without_reset() {
        let adapter = AdapterHandle::new(FakeAdapter::with_behavior(
            "hci0",
            FakeBehavior {
                refuse_connect: true,
                ..Default::default()
            },
        ));

        let err = Session::open("AA:BB:CC:DD:EE:01".into(), adapter.clone(), true, config())
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectionError::DeviceNotConnected { .. }));
        let starts: Vec<_> = adapter
            .backend()
            .events()
            .into_iter()
            .filter(|e| matches!(e, FakeEvent::Start { .. }))
            .collect();
        assert_eq!(
            starts,
            vec![
                FakeEvent::Start { reset: true },
                FakeEvent::Start { reset: false }
            ]
        );
    }

    #[tokio::test]
    async fn failed_connect_leaves_session_unusable() {
        let adapter = AdapterHandle::new(FakeAdapter::with_behavior(
            "hci0",
            FakeBehavior {
                refuse_connect: true,
                ..Default::default()
            },
        ));
        let session = Session::new(
            "AA:BB:CC:DD:EE:01".into(),
            adapter.clone(),
            config().with_retry_connect(false),
        );

        assert!(session.connect(false).await.is_err());
        assert!(matches!(session.state().await, SessionState::Failed(_)));

        adapter.backend().set_behavior(|b| b.refuse_connect = false);
        assert!(matches!(
            session.connect(false).await,
            Err(SessionError::SessionNotReady(SessionState::Failed(_)))
        ));
        assert!(matches!(
            session.set_white(10, false).await,
            Err(SessionError::SessionNotReady(SessionState::Failed(_)))
        ));
    }

    #[tokio::test]
    async fn lost_link_fails_the_session() {
        let adapter = AdapterHandle::new(FakeAdapter::new("hci0"));
        let session = connected(&adapter).await;
        adapter.backend().drop_all_links();

        let err = session.set_power(false, false).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Connection(ConnectionError::DeviceNotConnected { .. })
        ));
        assert!(matches!(session.state().await, SessionState::Failed(_)));

        // Releasing the dead link reports it, and the session stays failed
        assert!(session.close().await.is_err());
        assert!(matches!(session.state().await, SessionState::Failed(_)));
        assert_eq!(adapter.live_links(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_to_one_session_never_overlap() {
        let adapter = AdapterHandle::new(FakeAdapter::with_behavior(
            "hci0",
            FakeBehavior {
                write_latency: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        ));
        let session = connected(&adapter).await;

        let (a, b, c) = tokio::join!(
            session.set_color(255, 0, 0, true),
            session.set_white(128, true),
            session.set_power(true, false),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(adapter.backend().writes().len(), 3);
        assert_eq!(adapter.backend().max_concurrent_writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_state_is_visible_while_connecting() {
        let adapter = AdapterHandle::new(FakeAdapter::with_behavior(
            "hci0",
            FakeBehavior {
                hang_connect: true,
                ..Default::default()
            },
        ));
        let cfg = config().with_retry_connect(false).with_connection(
            ConnectionConfig::default().with_connect_timeout(Duration::from_secs(1)),
        );
        let session = Session::new("AA:BB:CC:DD:EE:01".into(), adapter, cfg);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);

        let observe = async {
            tokio::task::yield_now().await;
            session.connection_state()
        };
        let (outcome, seen) = tokio::join!(session.connect(false), observe);

        assert_eq!(seen, ConnectionState::Connecting);
        assert!(outcome.is_err());
        assert!(matches!(
            session.connection_state(),
            ConnectionState::Failed(_)
        ));
    }

    #[tokio::test]
    async fn connection_state_follows_the_link() {
        let adapter = AdapterHandle::new(FakeAdapter::new("hci0"));
        let session = connected(&adapter).await;
        assert_eq!(session.connection_state(), ConnectionState::Connected);

        session.close().await.unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);

        let session = connected(&adapter).await;
        adapter.backend().drop_all_links();
        assert!(session.set_power(true, false).await.is_err());
        assert!(matches!(
            session.connection_state(),
            ConnectionState::Failed(_)
        ));
        assert!(session.close().await.is_err());
        assert!(matches!(
            session.connection_state(),
            ConnectionState::Failed(_)
        ));
    }

    #[tokio::test]
    async fn open_many_resets_only_the_first_connect() {
        let adapter = AdapterHandle::new(FakeAdapter::new("hci0"));
        let addresses: Vec<DeviceAddress> =
            vec!["AA:BB:CC:DD:EE:01".into(), "AA:BB:CC:DD:EE:02".into()];

        let sessions = open_many(&addresses, &adapter, true, &config()).await.unwrap();

        let starts: Vec<_> = adapter
            .backend()
            .events()
            .into_iter()
            .filter(|e| matches!(e, FakeEvent::Start { .. }))
            .collect();
        assert_eq!(
            starts,
            vec![
                FakeEvent::Start { reset: true },
                FakeEvent::Start { reset: false }
            ]
        );
        for session in &sessions {
            session.set_power(true, false).await.unwrap();
        }
        assert!(close_all(&sessions).await.iter().all(|r| r.is_ok()));
        assert_eq!(adapter.live_links(), 0);
    }
}
