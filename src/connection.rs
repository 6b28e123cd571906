/*!
 # Connection manager

 Owns the lifecycle of one link: start the adapter, connect, write frames,
 disconnect. Every backend call is bounded by a timeout from
 [`ConnectionConfig`] and every failure comes back as a [`ConnectionError`].
 Nothing in here retries.
*/

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as StateLock;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::codec::CommandPayload;
use crate::config::ConnectionConfig;
use crate::protocol::CONTROL_CHARACTERISTIC_UUID;
use crate::transport::{BleAdapter, BleLink, DeviceAddress, TransportError};
use crate::ConnectionError;

/// State of a single link.
///
/// A [`Connection`] is only ever `Connected` or `Failed`; a session reports
/// `Disconnected` before connecting and after closing, and `Connecting` while
/// a connect is in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// A local radio shared by every session opened on it.
///
/// Resetting the radio drops every link on it, so a connect with
/// `reset_adapter_on_start` must only happen while no other link is live.
/// The handle counts live links to flag violations, it does not prevent them.
pub struct AdapterHandle<A> {
    backend: Arc<A>,
    live_links: Arc<AtomicUsize>,
}

impl<A> Clone for AdapterHandle<A> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            live_links: Arc::clone(&self.live_links),
        }
    }
}

impl<A: BleAdapter> AdapterHandle<A> {
    pub fn new(backend: A) -> Self {
        Self {
            backend: Arc::new(backend),
            live_links: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The wrapped backend
    pub fn backend(&self) -> &A {
        &self.backend
    }

    /// Identifier of the wrapped backend
    pub fn id(&self) -> String {
        self.backend.id()
    }

    /// Number of connections opened through this handle and not yet dropped
    pub fn live_links(&self) -> usize {
        self.live_links.load(Ordering::SeqCst)
    }
}

/// Serializes writes on one link and keeps them `min_delay` apart
struct CommandQueue {
    /// Semaphore to limit command concurrency
    semaphore: Semaphore,
    /// Minimum delay between commands
    min_delay: Duration,
    /// When the previous command finished
    last_command: Mutex<Option<Instant>>,
}

impl CommandQueue {
    fn new(min_delay: Duration) -> Self {
        Self {
            semaphore: Semaphore::new(1), // Only allow one command at a time
            min_delay,
            last_command: Mutex::new(None),
        }
    }

    /// Runs `command` once the link is free and paced. The future is only
    /// built after the wait, so any deadline inside it starts then too.
    async fn execute<T, F, Fut>(&self, command: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        // The semaphore is owned by the queue and never closed
        let _permit = self.semaphore.acquire().await.ok();

        let mut last_cmd = self.last_command.lock().await;
        if let Some(last) = *last_cmd {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                let wait_time = self.min_delay - elapsed;
                trace!("Rate limiting: waiting {:?} before next command", wait_time);
                time::sleep(wait_time).await;
            }
        }

        let result = command().await;

        *last_cmd = Some(Instant::now());
        result
    }
}

/// An established link to one device
pub struct Connection<L> {
    address: DeviceAddress,
    link: L,
    state: StateLock<ConnectionState>,
    queue: CommandQueue,
    ack_timeout: Duration,
    write_timeout: Duration,
    live_links: Arc<AtomicUsize>,
}

/// Starts the adapter and opens a link to `address`.
///
/// `reset_adapter_on_start` restarts the radio first, which clears lockups
/// left by earlier attempts but also drops every other link on the adapter.
/// When connecting several devices, reset on the first connect only.
///
/// # Errors
///
/// * `ConnectionError::AdapterStartError` - the radio could not be started
/// * `ConnectionError::DeviceNotConnected` - the device did not answer in time
#[instrument(skip(adapter, config), fields(adapter = %adapter.id()))]
pub async fn connect<A: BleAdapter>(
    address: &DeviceAddress,
    adapter: &AdapterHandle<A>,
    reset_adapter_on_start: bool,
    config: &ConnectionConfig,
) -> Result<Connection<A::Link>, ConnectionError> {
    let live = adapter.live_links();
    if reset_adapter_on_start && live > 0 {
        warn!(
            "Resetting adapter {} while {} other link(s) are live; they will be dropped",
            adapter.id(),
            live
        );
    }

    debug!(reset = reset_adapter_on_start, "Starting Bluetooth adapter");
    adapter
        .backend()
        .start(reset_adapter_on_start)
        .await
        .map_err(|e| {
            error!("Failed to start adapter {}: {}", adapter.id(), e);
            ConnectionError::AdapterStartError {
                adapter: adapter.id(),
                reason: e.to_string(),
            }
        })?;

    info!("Connecting to {}", address);
    let link = match time::timeout(config.connect_timeout, adapter.backend().connect(address))
        .await
    {
        Ok(Ok(link)) => link,
        Ok(Err(e)) => {
            warn!("Connection to {} failed: {}", address, e);
            return Err(ConnectionError::DeviceNotConnected {
                address: address.clone(),
                reason: e.to_string(),
            });
        }
        Err(_) => {
            warn!(
                "Device {} did not respond within {:?}",
                address, config.connect_timeout
            );
            return Err(ConnectionError::DeviceNotConnected {
                address: address.clone(),
                reason: format!("no response within {:?}", config.connect_timeout),
            });
        }
    };

    adapter.live_links.fetch_add(1, Ordering::SeqCst);
    info!("Connected to {}", address);
    Ok(Connection {
        address: address.clone(),
        link,
        state: StateLock::new(ConnectionState::Connected),
        queue: CommandQueue::new(config.command_delay),
        ack_timeout: config.ack_timeout,
        write_timeout: config.write_timeout,
        live_links: Arc::clone(&adapter.live_links),
    })
}

impl<L: BleLink> Connection<L> {
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Last observed state of the link
    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    /// Writes `payload` to the control characteristic.
    ///
    /// With `require_ack` the call waits for the peripheral to confirm the
    /// write, bounded by the acknowledgment timeout. Without it the call
    /// returns once the write is submitted.
    ///
    /// # Errors
    ///
    /// * `ConnectionError::DeviceNotConnected` - the link dropped or refused the write
    /// * `ConnectionError::NotificationTimeout` - a confirmed write was not acknowledged
    #[instrument(skip(self, payload), fields(address = %self.address, len = payload.len()))]
    pub async fn send(
        &self,
        payload: CommandPayload,
        require_ack: bool,
    ) -> Result<(), ConnectionError> {
        let bound = if require_ack {
            self.ack_timeout
        } else {
            self.write_timeout
        };

        trace!("Writing frame [{}] (ack: {})", payload, require_ack);
        let outcome = self
            .queue
            .execute(|| {
                time::timeout(
                    bound,
                    self.link
                        .write(CONTROL_CHARACTERISTIC_UUID, payload.as_bytes(), require_ack),
                )
            })
            .await;

        match outcome {
            Ok(Ok(())) => {
                trace!("Frame written");
                Ok(())
            }
            Ok(Err(TransportError::AckTimeout)) | Err(_) if require_ack => {
                warn!("Write to {} not acknowledged within {:?}", self.address, bound);
                Err(ConnectionError::NotificationTimeout {
                    address: self.address.clone(),
                    timeout: bound,
                })
            }
            Ok(Err(e)) => {
                error!("Write to {} failed: {}", self.address, e);
                *self.state.lock() = ConnectionState::Failed(e.to_string());
                Err(self.not_connected(e.to_string()))
            }
            Err(_) => {
                error!("Write to {} stalled for {:?}", self.address, bound);
                let reason = format!("write not submitted within {bound:?}");
                *self.state.lock() = ConnectionState::Failed(reason.clone());
                Err(self.not_connected(reason))
            }
        }
    }

    /// Tears the link down.
    ///
    /// Safe on a link that already dropped; that case is reported as
    /// `DeviceNotConnected` for information only.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn disconnect(self) -> Result<(), ConnectionError> {
        debug!("Disconnecting from {}", self.address);
        let outcome = time::timeout(self.write_timeout, self.link.disconnect()).await;

        match outcome {
            Ok(Ok(())) => {
                info!("Disconnected from {}", self.address);
                Ok(())
            }
            Ok(Err(e)) => {
                debug!("Link to {} was already down: {}", self.address, e);
                Err(self.not_connected(e.to_string()))
            }
            Err(_) => {
                warn!("Disconnect from {} timed out", self.address);
                Err(self.not_connected(format!(
                    "disconnect not confirmed within {:?}",
                    self.write_timeout
                )))
            }
        }
    }

    fn not_connected(&self, reason: String) -> ConnectionError {
        ConnectionError::DeviceNotConnected {
            address: self.address.clone(),
            reason,
        }
    }
}

impl<L> Drop for Connection<L> {
    fn drop(&mut self) {
        self.live_links.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<L> fmt::Debug for Connection<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_color, encode_power};
    use crate::fake::{FakeAdapter, FakeBehavior, FakeEvent};

    fn config() -> ConnectionConfig {
        ConnectionConfig::default().with_command_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn connect_starts_adapter_then_links() {
        let adapter = AdapterHandle::new(FakeAdapter::new("hci0"));
        let address = DeviceAddress::new("AA:BB:CC:DD:EE:01");

        let conn = connect(&address, &adapter, true, &config()).await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(adapter.live_links(), 1);
        assert_eq!(
            adapter.backend().events(),
            vec![
                FakeEvent::Start { reset: true },
                FakeEvent::Connect(address.clone())
            ]
        );
    }

    #[tokio::test]
    async fn adapter_start_failure_is_typed() {
        let adapter = AdapterHandle::new(FakeAdapter::with_behavior(
            "hci0",
            FakeBehavior {
                fail_start: true,
                ..Default::default()
            },
        ));

        let err = connect(&"AA:BB:CC:DD:EE:01".into(), &adapter, true, &config())
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectionError::AdapterStartError { .. }));
        assert_eq!(adapter.live_links(), 0);
    }

    #[tokio::test]
    async fn unreachable_device_reports_not_connected() {
        let adapter = AdapterHandle::new(FakeAdapter::with_behavior(
            "hci0",
            FakeBehavior {
                refuse_connect: true,
                ..Default::default()
            },
        ));

        let err = connect(&"AA:BB:CC:DD:EE:01".into(), &adapter, false, &config())
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectionError::DeviceNotConnected { .. }));
    }

    #[tokio::test]
    async fn send_writes_frame_to_control_characteristic() {
        let adapter = AdapterHandle::new(FakeAdapter::new("hci0"));
        let conn = connect(&"AA:BB:CC:DD:EE:01".into(), &adapter, false, &config())
            .await
            .unwrap();

        conn.send(encode_power(true), false).await.unwrap();
        conn.send(encode_color(1, 2, 3), true).await.unwrap();

        assert_eq!(
            adapter.backend().writes(),
            vec![
                vec![0xCC, 0x23, 0x33],
                vec![0x56, 1, 2, 3, 0x19, 0xF0, 0xAA]
            ]
        );
        let acks: Vec<bool> = adapter
            .backend()
            .events()
            .into_iter()
            .filter_map(|e| match e {
                FakeEvent::Write {
                    characteristic,
                    ack,
                    ..
                } => {
                    assert_eq!(characteristic, CONTROL_CHARACTERISTIC_UUID);
                    Some(ack)
                }
                _ => None,
            })
            .collect();
        assert_eq!(acks, vec![false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_write_times_out() {
        let adapter = AdapterHandle::new(FakeAdapter::with_behavior(
            "hci0",
            FakeBehavior {
                never_ack: true,
                ..Default::default()
            },
        ));
        let cfg = config().with_ack_timeout(Duration::from_millis(250));
        let conn = connect(&"AA:BB:CC:DD:EE:01".into(), &adapter, false, &cfg)
            .await
            .unwrap();

        let started = Instant::now();
        let err = conn.send(encode_power(true), true).await.unwrap_err();

        assert!(matches!(err, ConnectionError::NotificationTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn rejected_write_marks_link_failed() {
        let adapter = AdapterHandle::new(FakeAdapter::with_behavior(
            "hci0",
            FakeBehavior {
                reject_writes: true,
                ..Default::default()
            },
        ));
        let conn = connect(&"AA:BB:CC:DD:EE:01".into(), &adapter, false, &config())
            .await
            .unwrap();

        let err = conn.send(encode_power(false), false).await.unwrap_err();

        assert!(matches!(err, ConnectionError::DeviceNotConnected { .. }));
        assert!(matches!(conn.state(), ConnectionState::Failed(_)));
    }

    #[tokio::test]
    async fn disconnect_is_safe_on_dropped_link() {
        let adapter = AdapterHandle::new(FakeAdapter::new("hci0"));
        let first = connect(&"AA:BB:CC:DD:EE:01".into(), &adapter, true, &config())
            .await
            .unwrap();
        // A reset start drops every link on the adapter
        let second = connect(&"AA:BB:CC:DD:EE:02".into(), &adapter, true, &config())
            .await
            .unwrap();
        assert_eq!(adapter.live_links(), 2);

        let err = first.disconnect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::DeviceNotConnected { .. }));
        second.disconnect().await.unwrap();
        assert_eq!(adapter.live_links(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_are_spaced_by_command_delay() {
        let adapter = AdapterHandle::new(FakeAdapter::new("hci0"));
        let cfg = config().with_command_delay(Duration::from_millis(100));
        let conn = connect(&"AA:BB:CC:DD:EE:01".into(), &adapter, false, &cfg)
            .await
            .unwrap();

        let started = Instant::now();
        conn.send(encode_power(true), false).await.unwrap();
        conn.send(encode_power(false), false).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_write_gets_its_own_full_bound() {
        let adapter = AdapterHandle::new(FakeAdapter::with_behavior(
            "hci0",
            FakeBehavior {
                write_latency: Some(Duration::from_millis(300)),
                ..Default::default()
            },
        ));
        let cfg = config().with_ack_timeout(Duration::from_millis(500));
        let conn = connect(&"AA:BB:CC:DD:EE:01".into(), &adapter, false, &cfg)
            .await
            .unwrap();

        // Each write waits 300ms behind the previous one, longer than what is
        // left of a 500ms deadline started at submission
        let (a, b, c) = tokio::join!(
            conn.send(encode_power(true), true),
            conn.send(encode_power(false), true),
            conn.send(encode_color(9, 8, 7), false),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(
            adapter.backend().writes(),
            vec![
                vec![0xCC, 0x23, 0x33],
                vec![0xCC, 0x24, 0x33],
                vec![0x56, 9, 8, 7, 0x19, 0xF0, 0xAA]
            ]
        );
        assert_eq!(adapter.backend().max_concurrent_writes(), 1);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_acknowledged_write_does_not_fail_the_next_one() {
        let adapter = AdapterHandle::new(FakeAdapter::with_behavior(
            "hci0",
            FakeBehavior {
                write_latency: Some(Duration::from_millis(1500)),
                ..Default::default()
            },
        ));
        let conn = connect(&"AA:BB:CC:DD:EE:01".into(), &adapter, false, &config())
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            conn.send(encode_power(true), true),
            conn.send(encode_power(false), false),
        );

        a.unwrap();
        b.unwrap();
        assert_eq!(adapter.backend().writes().len(), 2);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }
}
