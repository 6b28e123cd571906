/*!
 # btleplug backend

 [`BleAdapter`] over the platform Bluetooth stack. Devices are found by
 scanning until a peripheral whose address (or platform id, on systems that
 hide addresses) matches.
*/

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::config::ScanConfig;
use crate::protocol::CONTROL_CHARACTERISTIC_UUID;
use crate::transport::{BleAdapter, BleLink, DeviceAddress, TransportError};

/// Which host adapter to use
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AdapterSelector {
    /// First adapter the platform reports
    #[default]
    Default,
    /// Position in the platform's adapter list
    Index(usize),
    /// Adapter whose description contains this name (e.g. `hci1`)
    Name(String),
}

impl FromStr for AdapterSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(if s.is_empty() || s.eq_ignore_ascii_case("default") {
            AdapterSelector::Default
        } else if let Ok(index) = s.parse() {
            AdapterSelector::Index(index)
        } else {
            AdapterSelector::Name(s.to_string())
        })
    }
}

impl fmt::Display for AdapterSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterSelector::Default => write!(f, "default"),
            AdapterSelector::Index(i) => write!(f, "#{i}"),
            AdapterSelector::Name(name) => write!(f, "{name}"),
        }
    }
}

/// Gets the Bluetooth adapter named by `selector`
#[instrument(skip(manager))]
async fn get_central(manager: &Manager, selector: &AdapterSelector) -> Result<Adapter, TransportError> {
    debug!("Getting Bluetooth adapter");
    let adapters = manager.adapters().await?;
    if adapters.is_empty() {
        error!("No Bluetooth adapters found");
        return Err(TransportError::AdapterUnavailable(
            "no Bluetooth adapters found".to_string(),
        ));
    }

    let adapter = match selector {
        AdapterSelector::Default => adapters.into_iter().next(),
        AdapterSelector::Index(i) => adapters.into_iter().nth(*i),
        AdapterSelector::Name(name) => {
            let mut found = None;
            for adapter in adapters {
                let info = adapter.adapter_info().await.unwrap_or_default();
                trace!("Candidate adapter: {}", info);
                if info.contains(name.as_str()) {
                    found = Some(adapter);
                    break;
                }
            }
            found
        }
    };

    adapter.ok_or_else(|| {
        error!("Bluetooth adapter {} not found", selector);
        TransportError::AdapterUnavailable(format!("adapter {selector} not found"))
    })
}

/// Runs `stop` when dropped unless disarmed, so a scan is stopped even when
/// the discovery future errors out early or is cancelled by a timeout
struct ScanGuard<F: FnOnce()> {
    stop: Option<F>,
}

impl<F: FnOnce()> ScanGuard<F> {
    fn new(stop: F) -> Self {
        Self { stop: Some(stop) }
    }

    fn disarm(mut self) {
        self.stop = None;
    }
}

impl<F: FnOnce()> Drop for ScanGuard<F> {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

/// Host adapter driven through btleplug
pub struct BtleAdapter {
    selector: AdapterSelector,
    scan: ScanConfig,
    central: Mutex<Option<Adapter>>,
}

impl BtleAdapter {
    pub fn new(selector: AdapterSelector, scan: ScanConfig) -> Self {
        Self {
            selector,
            scan,
            central: Mutex::new(None),
        }
    }

    /// Polls the peripheral list until one matches `address`
    async fn find_peripheral(
        &self,
        central: &Adapter,
        address: &DeviceAddress,
    ) -> Result<Peripheral, TransportError> {
        info!("Scanning for {}...", address);
        central.start_scan(ScanFilter::default()).await?;
        // Drop cannot await, so the stop is handed to the runtime
        let guard = ScanGuard::new(|| {
            let central = central.clone();
            if let Ok(runtime) = Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = central.stop_scan().await {
                        warn!("Failed to stop scan: {}", e);
                    }
                });
            }
        });

        let start_time = Instant::now();
        while start_time.elapsed() < self.scan.discovery_timeout {
            let peripherals = central.peripherals().await?;
            debug!("Found {} BLE peripherals so far", peripherals.len());

            for p in peripherals {
                let id = p.id().to_string();
                if address.matches(&p.address().to_string()) || address.matches(&id) {
                    if let Ok(Some(props)) = p.properties().await {
                        debug!(
                            "Found device {} ({})",
                            address,
                            props.local_name.unwrap_or_else(|| "unnamed".to_string())
                        );
                    }
                    guard.disarm();
                    central.stop_scan().await?;
                    return Ok(p);
                }
            }

            let remaining = self
                .scan
                .discovery_timeout
                .saturating_sub(start_time.elapsed());
            info!(
                "Still scanning for {}... ({} seconds remaining)",
                address,
                remaining.as_secs()
            );
            time::sleep(self.scan.poll_interval).await;
        }

        guard.disarm();
        central.stop_scan().await?;
        error!(
            "Device {} not found within {} seconds",
            address,
            self.scan.discovery_timeout.as_secs()
        );
        Err(TransportError::DeviceNotFound(address.to_string()))
    }
}

#[async_trait]
impl BleAdapter for BtleAdapter {
    type Link = BtleLink;

    fn id(&self) -> String {
        self.selector.to_string()
    }

    /// Opens the adapter on first use. A reset stops any scan and drops every
    /// peripheral connected through the adapter.
    #[instrument(skip(self), fields(adapter = %self.selector))]
    async fn start(&self, reset: bool) -> Result<(), TransportError> {
        let mut central = self.central.lock().await;
        if central.is_none() {
            info!("Initializing Bluetooth adapter");
            let manager = Manager::new().await.map_err(|e| {
                TransportError::AdapterUnavailable(format!("Bluetooth manager: {e}"))
            })?;
            *central = Some(get_central(&manager, &self.selector).await?);
        }

        if reset {
            if let Some(adapter) = central.as_ref() {
                warn!("Resetting adapter, dropping every connected peripheral");
                if let Err(e) = adapter.stop_scan().await {
                    trace!("No scan to stop: {}", e);
                }
                for p in adapter.peripherals().await? {
                    if p.is_connected().await.unwrap_or(false) {
                        debug!("Disconnecting {}", p.address());
                        p.disconnect().await?;
                    }
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(adapter = %self.selector))]
    async fn connect(&self, address: &DeviceAddress) -> Result<BtleLink, TransportError> {
        let central = self.central.lock().await.clone().ok_or_else(|| {
            TransportError::AdapterUnavailable("adapter was not started".to_string())
        })?;

        let peripheral = self.find_peripheral(&central, address).await?;

        info!("Connecting to device...");
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }

        debug!("Discovering services...");
        peripheral.discover_services().await?;

        let control = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == CONTROL_CHARACTERISTIC_UUID)
            .ok_or(TransportError::CharacteristicNotFound(
                CONTROL_CHARACTERISTIC_UUID,
            ))?;
        debug!(
            "Found control characteristic: {} (acknowledged writes: {})",
            control.uuid,
            control.properties.contains(CharPropFlags::WRITE)
        );

        Ok(BtleLink { peripheral })
    }
}

/// Link to one peripheral through btleplug
pub struct BtleLink {
    peripheral: Peripheral,
}

#[async_trait]
impl BleLink for BtleLink {
    async fn write(
        &self,
        characteristic: Uuid,
        bytes: &[u8],
        ack: bool,
    ) -> Result<(), TransportError> {
        if !self.peripheral.is_connected().await? {
            return Err(TransportError::NotConnected);
        }

        let target = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or(TransportError::CharacteristicNotFound(characteristic))?;

        let write_type = if ack {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        trace!("Sending BLE command ({:?})", write_type);
        self.peripheral.write(&target, bytes, write_type).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if !self.peripheral.is_connected().await? {
            return Err(TransportError::NotConnected);
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
