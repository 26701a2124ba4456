//! A [`PassThrough`] sits between two transports and routes each call
//! arriving from one side out through the other, without the message ever
//! touching a service. It keeps its own reference count, split into shared
//! and optimistic halves mirroring the stubs it fronts, and drops the
//! self-reference that keeps it alive exactly when no references remain in
//! either direction.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use crate::error::RpcError;
use crate::marshaller::{AddRefOptions, Marshaller, PostOptions, ReleaseOptions};
use crate::service::Service;
use crate::transport::Transport;
use crate::types::{
    CallerChannelZoneId, CallerZoneId, DestinationChannelZoneId, DestinationZoneId, Encoding,
    InterfaceId, KnownDirectionZoneId, MethodId, ObjectId,
};

/// Bridges two transports, forwarding traffic for one destination zone on
/// each side.
pub struct PassThrough {
    forward_destination: DestinationZoneId,
    reverse_destination: DestinationZoneId,
    shared_count: AtomicU64,
    optimistic_count: AtomicU64,
    forward_transport: Arc<dyn Transport>,
    reverse_transport: Arc<dyn Transport>,
    service: Weak<Service>,
    // holds the bridge alive while references flow through it
    self_ref: Mutex<Option<Arc<PassThrough>>>,
}

impl PassThrough {
    pub fn new(
        service: &Arc<Service>,
        forward_transport: Arc<dyn Transport>,
        reverse_transport: Arc<dyn Transport>,
        forward_destination: DestinationZoneId,
        reverse_destination: DestinationZoneId,
    ) -> Arc<Self> {
        let bridge = Arc::new(Self {
            forward_destination,
            reverse_destination,
            shared_count: AtomicU64::new(0),
            optimistic_count: AtomicU64::new(0),
            forward_transport,
            reverse_transport,
            service: Arc::downgrade(service),
            self_ref: Mutex::new(None),
        });
        *bridge.self_ref.lock() = Some(bridge.clone());
        debug!(
            forward = %forward_destination,
            reverse = %reverse_destination,
            "pass-through created"
        );
        bridge
    }

    pub fn shared_count(&self) -> u64 {
        self.shared_count.load(Ordering::Acquire)
    }

    pub fn optimistic_count(&self) -> u64 {
        self.optimistic_count.load(Ordering::Acquire)
    }

    pub fn service(&self) -> Option<Arc<Service>> {
        self.service.upgrade()
    }

    pub fn forward_transport(&self) -> &Arc<dyn Transport> {
        &self.forward_transport
    }

    pub fn reverse_transport(&self) -> &Arc<dyn Transport> {
        &self.reverse_transport
    }

    /// Whether the bridge still holds itself alive.
    pub fn is_armed(&self) -> bool {
        self.self_ref.lock().is_some()
    }

    fn directional_transport(
        &self,
        destination: DestinationZoneId,
    ) -> Result<&Arc<dyn Transport>, RpcError> {
        if destination == self.forward_destination {
            Ok(&self.forward_transport)
        } else if destination == self.reverse_destination {
            Ok(&self.reverse_transport)
        } else {
            Err(RpcError::ZoneNotSupported)
        }
    }

    fn counter(&self, optimistic: bool) -> &AtomicU64 {
        if optimistic {
            &self.optimistic_count
        } else {
            &self.shared_count
        }
    }

    fn trigger_self_destruction(&self) {
        if self.shared_count.load(Ordering::Acquire) == 0
            && self.optimistic_count.load(Ordering::Acquire) == 0
        {
            if self.self_ref.lock().take().is_some() {
                trace!(
                    forward = %self.forward_destination,
                    reverse = %self.reverse_destination,
                    "pass-through drained"
                );
            }
        }
    }
}

#[async_trait]
impl Marshaller for PassThrough {
    async fn send(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        tag: u64,
        caller_channel_zone_id: CallerChannelZoneId,
        caller_zone_id: CallerZoneId,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        interface_id: InterfaceId,
        method_id: MethodId,
        in_buf: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        let transport = self.directional_transport(destination_zone_id)?;
        transport
            .send(
                protocol_version,
                encoding,
                tag,
                caller_channel_zone_id,
                caller_zone_id,
                destination_zone_id,
                object_id,
                interface_id,
                method_id,
                in_buf,
            )
            .await
    }

    async fn post(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        tag: u64,
        caller_channel_zone_id: CallerChannelZoneId,
        caller_zone_id: CallerZoneId,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        interface_id: InterfaceId,
        method_id: MethodId,
        options: PostOptions,
        in_buf: &[u8],
    ) {
        let Ok(transport) = self.directional_transport(destination_zone_id) else {
            trace!(destination = %destination_zone_id, "pass-through post dropped");
            return;
        };
        transport
            .post(
                protocol_version,
                encoding,
                tag,
                caller_channel_zone_id,
                caller_zone_id,
                destination_zone_id,
                object_id,
                interface_id,
                method_id,
                options,
                in_buf,
            )
            .await;
    }

    async fn try_cast(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        interface_id: InterfaceId,
    ) -> Result<(), RpcError> {
        let transport = self.directional_transport(destination_zone_id)?;
        transport
            .try_cast(protocol_version, destination_zone_id, object_id, interface_id)
            .await
    }

    async fn add_ref(
        &self,
        protocol_version: u64,
        destination_channel_zone_id: DestinationChannelZoneId,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        caller_channel_zone_id: CallerChannelZoneId,
        caller_zone_id: CallerZoneId,
        known_direction_zone_id: KnownDirectionZoneId,
        options: AddRefOptions,
    ) -> Result<u64, RpcError> {
        let optimistic = options.contains(AddRefOptions::OPTIMISTIC);
        // count first so the bridge can never transit zero while the
        // reference is in flight
        self.counter(optimistic).fetch_add(1, Ordering::AcqRel);
        let transport = match self.directional_transport(destination_zone_id) {
            Ok(transport) => transport,
            Err(err) => {
                self.counter(optimistic).fetch_sub(1, Ordering::AcqRel);
                self.trigger_self_destruction();
                return Err(err);
            }
        };
        match transport
            .add_ref(
                protocol_version,
                destination_channel_zone_id,
                destination_zone_id,
                object_id,
                caller_channel_zone_id,
                caller_zone_id,
                known_direction_zone_id,
                options,
            )
            .await
        {
            Ok(count) => Ok(count),
            Err(err) => {
                self.counter(optimistic).fetch_sub(1, Ordering::AcqRel);
                self.trigger_self_destruction();
                Err(err)
            }
        }
    }

    async fn release(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        caller_zone_id: CallerZoneId,
        options: ReleaseOptions,
    ) -> Result<u64, RpcError> {
        let transport = self.directional_transport(destination_zone_id)?;
        let result = transport
            .release(
                protocol_version,
                destination_zone_id,
                object_id,
                caller_zone_id,
                options,
            )
            .await;
        // a holder discovering a dead object or zone still hands its half
        // of the bridge count back
        if matches!(
            result,
            Ok(_) | Err(RpcError::ObjectNotFound) | Err(RpcError::ZoneNotFound)
        ) {
            let optimistic = options == ReleaseOptions::Optimistic;
            self.counter(optimistic)
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                    value.checked_sub(1)
                })
                .unwrap_or_else(|_| {
                    panic!(
                        "pass-through release underflow towards zone {}",
                        destination_zone_id
                    )
                });
            self.trigger_self_destruction();
        }
        result
    }
}

impl Drop for PassThrough {
    fn drop(&mut self) {
        trace!(
            forward = %self.forward_destination,
            reverse = %self.reverse_destination,
            "pass-through destroyed"
        );
    }
}
