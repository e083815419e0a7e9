//! Connectivity monitoring and the sync-eligibility predicate.

use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::EventBus;

/// Classification of the current network link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    None,
    Wifi,
    Mobile,
    Ethernet,
    Bluetooth,
    Vpn,
    Other,
}

impl LinkType {
    pub fn is_connected(self) -> bool {
        self != LinkType::None
    }
}

/// Edge-triggered connectivity notification.
///
/// Emitted only when the derived `connected` boolean or the `wifi` boolean
/// actually flips, never on raw classification noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    ConnectedChanged(bool),
    WifiChanged(bool),
}

#[derive(Debug)]
struct MonitorInner {
    link: LinkType,
    wifi_preferred: bool,
}

/// Observes the network link and exposes the sync-eligibility predicate.
///
/// The platform connectivity feed calls [`ConnectivityMonitor::set_link`];
/// everything downstream (queue drains, connectivity-triggered scheduling)
/// reacts to the edge-triggered events.
pub struct ConnectivityMonitor {
    inner: RwLock<MonitorInner>,
    bus: EventBus<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    /// Create a monitor starting disconnected.
    pub fn new(wifi_preferred: bool) -> Self {
        Self {
            inner: RwLock::new(MonitorInner {
                link: LinkType::None,
                wifi_preferred,
            }),
            bus: EventBus::new(),
        }
    }

    /// Current link classification.
    pub fn link(&self) -> LinkType {
        self.inner.read().unwrap().link
    }

    /// Derived connected boolean.
    pub fn connected(&self) -> bool {
        self.link().is_connected()
    }

    pub fn wifi_preferred(&self) -> bool {
        self.inner.read().unwrap().wifi_preferred
    }

    /// Change the wifi-preferred sync preference.
    pub fn set_wifi_preferred(&self, preferred: bool) {
        self.inner.write().unwrap().wifi_preferred = preferred;
    }

    /// Whether sync-dependent work may run right now.
    pub fn sync_eligible(&self) -> bool {
        let inner = self.inner.read().unwrap();
        if inner.wifi_preferred {
            inner.link == LinkType::Wifi
        } else {
            inner.link.is_connected()
        }
    }

    /// Subscribe to edge-triggered connectivity events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectivityEvent> {
        self.bus.subscribe()
    }

    /// Platform feed entry point: record a new link classification.
    ///
    /// Emits at most one `ConnectedChanged` and one `WifiChanged` event,
    /// and only for booleans that actually flipped.
    pub fn set_link(&self, link: LinkType) {
        let (was_connected, was_wifi) = {
            let mut inner = self.inner.write().unwrap();
            let prev = inner.link;
            inner.link = link;
            (prev.is_connected(), prev == LinkType::Wifi)
        };

        let connected = link.is_connected();
        let wifi = link == LinkType::Wifi;

        if connected != was_connected {
            debug!(connected, "Connectivity flipped");
            self.bus.publish(ConnectivityEvent::ConnectedChanged(connected));
        }
        if wifi != was_wifi {
            self.bus.publish(ConnectivityEvent::WifiChanged(wifi));
        }
    }
}
