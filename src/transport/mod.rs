//! # Transport Abstraction
//!
//! A transport carries opaque byte buffers between two zones and implements
//! the same marshaller contract as everything else in the runtime. On top of
//! that contract it maintains a destinations map, from destination zone to
//! the weak-held marshaller (a [`Service`] or a [`PassThrough`]) that
//! handles messages received for that zone, and a connection status.
//!
//! The runtime ships exactly one concrete transport, the in-process pair
//! used to wire zones living in the same process together; network and
//! enclave transports are external collaborators that implement the same
//! trait.
//!
//! On transition to [`TransportStatus::Disconnected`] a transport posts
//! `zone_terminating` to every registered destination so that each local
//! handler can drop the proxies that pointed through the dead link.
//!
//! [`Service`]: crate::service::Service
//! [`PassThrough`]: crate::pass_through::PassThrough

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

use crate::marshaller::{Marshaller, PostOptions};
use crate::types::{
    CallerChannelZoneId, DestinationZoneId, Encoding, InterfaceId, MethodId, ObjectId, ZoneId,
    LATEST_PROTOCOL_VERSION,
};

pub mod in_process;

pub use in_process::{connect_root, link_zones, InProcessTransport, ZoneLink};

/// Connection lifecycle of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// Initial state, establishing the link.
    Connecting,
    /// Fully operational.
    Connected,
    /// Attempting to recover the link; traffic may be retried.
    Reconnecting,
    /// Terminal state; no further traffic is allowed.
    Disconnected,
}

impl TransportStatus {
    fn as_u8(self) -> u8 {
        match self {
            TransportStatus::Connecting => 0,
            TransportStatus::Connected => 1,
            TransportStatus::Reconnecting => 2,
            TransportStatus::Disconnected => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TransportStatus::Connecting,
            1 => TransportStatus::Connected,
            2 => TransportStatus::Reconnecting,
            _ => TransportStatus::Disconnected,
        }
    }
}

/// The contract a concrete transport adds on top of [`Marshaller`].
pub trait Transport: Marshaller {
    /// Register the handler that receives messages addressed to
    /// `destination` arriving over this transport.
    fn add_destination(&self, destination: DestinationZoneId, handler: Weak<dyn Marshaller>);

    fn remove_destination(&self, destination: DestinationZoneId);

    fn status(&self) -> TransportStatus;
}

/// Bookkeeping shared by transport implementations: the destinations map
/// plus the status word, with the disconnect broadcast.
pub struct DestinationRegistry {
    destinations: RwLock<HashMap<DestinationZoneId, Weak<dyn Marshaller>>>,
    default_handler: RwLock<Option<Weak<dyn Marshaller>>>,
    status: AtomicU8,
}

impl DestinationRegistry {
    pub fn new(status: TransportStatus) -> Self {
        Self {
            destinations: RwLock::new(HashMap::new()),
            default_handler: RwLock::new(None),
            status: AtomicU8::new(status.as_u8()),
        }
    }

    pub fn add_destination(&self, destination: DestinationZoneId, handler: Weak<dyn Marshaller>) {
        self.destinations.write().insert(destination, handler);
    }

    pub fn remove_destination(&self, destination: DestinationZoneId) {
        self.destinations.write().remove(&destination);
    }

    /// The handler for messages addressed to `destination`; falls back to
    /// the default handler, which forwards along its own routing table.
    pub fn handler(&self, destination: DestinationZoneId) -> Option<Arc<dyn Marshaller>> {
        if let Some(handler) = self
            .destinations
            .read()
            .get(&destination)
            .and_then(Weak::upgrade)
        {
            return Some(handler);
        }
        self.default_handler.read().as_ref().and_then(Weak::upgrade)
    }

    /// Handler of last resort for destinations with no explicit entry,
    /// normally the local service, which forwards along its own routes.
    pub fn set_default_handler(&self, handler: Weak<dyn Marshaller>) {
        *self.default_handler.write() = Some(handler);
    }

    pub fn status(&self) -> TransportStatus {
        TransportStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: TransportStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    /// Post `zone_terminating` on behalf of `terminating` to every
    /// registered destination.
    pub async fn notify_zone_terminating(&self, terminating: ZoneId) {
        let handlers: Vec<(DestinationZoneId, Arc<dyn Marshaller>)> = self
            .destinations
            .read()
            .iter()
            .filter_map(|(dest, weak)| weak.upgrade().map(|handler| (*dest, handler)))
            .collect();
        for (destination, handler) in handlers {
            trace!(%destination, peer = %terminating, "broadcasting zone_terminating");
            handler
                .post(
                    LATEST_PROTOCOL_VERSION,
                    Encoding::Binary,
                    0,
                    CallerChannelZoneId::NONE,
                    terminating.as_caller(),
                    destination,
                    ObjectId::NONE,
                    InterfaceId::NONE,
                    MethodId::NONE,
                    PostOptions::ZoneTerminating,
                    &[],
                )
                .await;
        }
    }
}
