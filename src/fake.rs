/*!
 # In-memory transport

 An adapter that needs no radio. It records every call it receives and can be
 told to misbehave, so sessions can be exercised without hardware.
*/

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

use crate::transport::{BleAdapter, BleLink, DeviceAddress, TransportError};

/// How the fake adapter and its links behave
#[derive(Debug, Clone, Default)]
pub struct FakeBehavior {
    /// `start` fails
    pub fail_start: bool,
    /// `connect` fails as if the device never answered
    pub refuse_connect: bool,
    /// `connect` fails for these addresses only
    pub unreachable: Vec<DeviceAddress>,
    /// `connect` never completes
    pub hang_connect: bool,
    /// Every write fails as if the link dropped
    pub reject_writes: bool,
    /// Confirmed writes are delivered but never acknowledged
    pub never_ack: bool,
    /// Every write takes this long to complete
    pub write_latency: Option<Duration>,
}

/// One call received by the fake adapter or one of its links
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeEvent {
    Start {
        reset: bool,
    },
    Connect(DeviceAddress),
    Write {
        address: DeviceAddress,
        characteristic: Uuid,
        bytes: Vec<u8>,
        ack: bool,
    },
    Disconnect(DeviceAddress),
}

#[derive(Default)]
struct Shared {
    behavior: Mutex<FakeBehavior>,
    events: Mutex<Vec<FakeEvent>>,
    links: Mutex<Vec<Arc<AtomicBool>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Shared {
    fn record(&self, event: FakeEvent) {
        trace!("fake transport: {:?}", event);
        self.events.lock().push(event);
    }
}

/// In-memory [`BleAdapter`]
pub struct FakeAdapter {
    id: String,
    shared: Arc<Shared>,
}

impl FakeAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_behavior(id, FakeBehavior::default())
    }

    pub fn with_behavior(id: impl Into<String>, behavior: FakeBehavior) -> Self {
        let shared = Shared {
            behavior: Mutex::new(behavior),
            ..Default::default()
        };
        Self {
            id: id.into(),
            shared: Arc::new(shared),
        }
    }

    /// Changes behaviour for subsequent calls, including on open links
    pub fn set_behavior(&self, update: impl FnOnce(&mut FakeBehavior)) {
        update(&mut self.shared.behavior.lock());
    }

    /// Every call received so far, in order
    pub fn events(&self) -> Vec<FakeEvent> {
        self.shared.events.lock().clone()
    }

    /// Bytes of every write delivered so far, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.shared
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                FakeEvent::Write { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// Highest number of writes that were ever in progress at once
    pub fn max_concurrent_writes(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }

    /// Drops every open link, as a radio failure would
    pub fn drop_all_links(&self) {
        for link in self.shared.links.lock().drain(..) {
            link.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl BleAdapter for FakeAdapter {
    type Link = FakeLink;

    fn id(&self) -> String {
        self.id.clone()
    }

    async fn start(&self, reset: bool) -> Result<(), TransportError> {
        self.shared.record(FakeEvent::Start { reset });
        if self.shared.behavior.lock().fail_start {
            return Err(TransportError::AdapterUnavailable(format!(
                "{} failed to power on",
                self.id
            )));
        }
        if reset {
            self.drop_all_links();
        }
        Ok(())
    }

    async fn connect(&self, address: &DeviceAddress) -> Result<FakeLink, TransportError> {
        self.shared.record(FakeEvent::Connect(address.clone()));
        let (refuse, hang) = {
            let behavior = self.shared.behavior.lock();
            let refuse = behavior.refuse_connect || behavior.unreachable.contains(address);
            (refuse, behavior.hang_connect)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if refuse {
            return Err(TransportError::DeviceNotFound(address.to_string()));
        }

        let connected = Arc::new(AtomicBool::new(true));
        self.shared.links.lock().push(Arc::clone(&connected));
        Ok(FakeLink {
            address: address.clone(),
            connected,
            shared: Arc::clone(&self.shared),
        })
    }
}

/// Link opened by [`FakeAdapter`]
pub struct FakeLink {
    address: DeviceAddress,
    connected: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

struct InFlight<'a>(&'a Shared);

impl<'a> InFlight<'a> {
    fn enter(shared: &'a Shared) -> Self {
        let now = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BleLink for FakeLink {
    async fn write(
        &self,
        characteristic: Uuid,
        bytes: &[u8],
        ack: bool,
    ) -> Result<(), TransportError> {
        let _in_flight = InFlight::enter(&self.shared);
        let behavior = self.shared.behavior.lock().clone();

        if !self.connected.load(Ordering::SeqCst) || behavior.reject_writes {
            return Err(TransportError::NotConnected);
        }
        if let Some(latency) = behavior.write_latency {
            tokio::time::sleep(latency).await;
        }

        self.shared.record(FakeEvent::Write {
            address: self.address.clone(),
            characteristic,
            bytes: bytes.to_vec(),
            ack,
        });

        if ack && behavior.never_ack {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.shared.record(FakeEvent::Disconnect(self.address.clone()));
        if self.connected.swap(false, Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}
