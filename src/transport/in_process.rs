//! In-process transport: a pair of endpoints, one living in each of two
//! zones sharing an address space. A message sent on one endpoint is handed
//! directly to the handler registered for its destination on the peer
//! endpoint, so calls suspend only at task boundaries and nothing is copied
//! onto a wire. This is the transport used between a host zone and the
//! zones it spawns in-process, and by the test suite.

use async_trait::async_trait;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, trace};

use super::{DestinationRegistry, Transport, TransportStatus};
use crate::bindings;
use crate::error::RpcError;
use crate::marshaller::{AddRefOptions, Marshaller, PostOptions, ReleaseOptions};
use crate::object_proxy::InterfaceGlue;
use crate::service::{ChildService, Service};
use crate::service_proxy::ServiceProxy;
use crate::types::{
    CallerChannelZoneId, CallerZoneId, DestinationChannelZoneId, DestinationZoneId, Encoding,
    InterfaceId, KnownDirectionZoneId, MethodId, ObjectId, ZoneId, LATEST_PROTOCOL_VERSION,
};

/// One endpoint of an in-process link between two zones.
pub struct InProcessTransport {
    local_zone: ZoneId,
    remote_zone: ZoneId,
    registry: DestinationRegistry,
    peer: OnceLock<Weak<InProcessTransport>>,
}

impl InProcessTransport {
    /// Build a connected endpoint pair for the two zones.
    pub fn pair(a_zone: ZoneId, b_zone: ZoneId) -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self {
            local_zone: a_zone,
            remote_zone: b_zone,
            registry: DestinationRegistry::new(TransportStatus::Connected),
            peer: OnceLock::new(),
        });
        let b = Arc::new(Self {
            local_zone: b_zone,
            remote_zone: a_zone,
            registry: DestinationRegistry::new(TransportStatus::Connected),
            peer: OnceLock::new(),
        });
        let _ = a.peer.set(Arc::downgrade(&b));
        let _ = b.peer.set(Arc::downgrade(&a));
        debug!(a = %a_zone, b = %b_zone, "in-process link established");
        (a, b)
    }

    pub fn local_zone(&self) -> ZoneId {
        self.local_zone
    }

    pub fn remote_zone(&self) -> ZoneId {
        self.remote_zone
    }

    pub fn set_default_handler(&self, handler: Weak<dyn Marshaller>) {
        self.registry.set_default_handler(handler);
    }

    fn peer(&self) -> Result<Arc<Self>, RpcError> {
        self.peer
            .get()
            .and_then(Weak::upgrade)
            .ok_or(RpcError::TransportError)
    }

    fn check_connected(&self) -> Result<(), RpcError> {
        match self.registry.status() {
            TransportStatus::Connected => Ok(()),
            _ => Err(RpcError::TransportError),
        }
    }

    /// Route a message arriving over this endpoint to the peer side's
    /// handler for its destination.
    fn deliver_to(&self, destination: DestinationZoneId) -> Result<Arc<dyn Marshaller>, RpcError> {
        self.check_connected()?;
        let peer = self.peer()?;
        peer.check_connected()?;
        peer.registry
            .handler(destination)
            .ok_or(RpcError::ZoneNotFound)
    }

    /// Tear down this side of the link, telling every local handler that
    /// the peer zone is gone.
    pub async fn disconnect(&self) {
        if self.registry.status() == TransportStatus::Disconnected {
            return;
        }
        self.registry.set_status(TransportStatus::Disconnected);
        debug!(zone = %self.local_zone, peer = %self.remote_zone, "in-process link disconnected");
        self.registry.notify_zone_terminating(self.remote_zone).await;
    }

    /// Tear down both sides of the link.
    pub async fn shutdown(&self) {
        let peer = self.peer.get().and_then(Weak::upgrade);
        self.disconnect().await;
        if let Some(peer) = peer {
            peer.disconnect().await;
        }
    }
}

#[async_trait]
impl Marshaller for InProcessTransport {
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
        let handler = self.deliver_to(destination_zone_id)?;
        handler
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
        let Ok(handler) = self.deliver_to(destination_zone_id) else {
            trace!(
                destination = %destination_zone_id,
                "post dropped, link down or destination unknown"
            );
            return;
        };
        handler
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
        let handler = self.deliver_to(destination_zone_id)?;
        handler
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
        let handler = self.deliver_to(destination_zone_id)?;
        handler
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
    }

    async fn release(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        caller_zone_id: CallerZoneId,
        options: ReleaseOptions,
    ) -> Result<u64, RpcError> {
        let handler = self.deliver_to(destination_zone_id)?;
        handler
            .release(
                protocol_version,
                destination_zone_id,
                object_id,
                caller_zone_id,
                options,
            )
            .await
    }
}

impl Transport for InProcessTransport {
    fn add_destination(&self, destination: DestinationZoneId, handler: Weak<dyn Marshaller>) {
        self.registry.add_destination(destination, handler);
    }

    fn remove_destination(&self, destination: DestinationZoneId) {
        self.registry.remove_destination(destination);
    }

    fn status(&self) -> TransportStatus {
        self.registry.status()
    }
}

/// A live link between two zones: the endpoint pair plus the two pinned
/// routing records registered with the services.
pub struct ZoneLink {
    pub transport_a: Arc<InProcessTransport>,
    pub transport_b: Arc<InProcessTransport>,
    pub proxy_a_to_b: Arc<ServiceProxy>,
    pub proxy_b_to_a: Arc<ServiceProxy>,
}

impl ZoneLink {
    /// Disconnect the link; both services observe `zone_terminating`.
    pub async fn shutdown(&self) {
        self.transport_a.shutdown().await;
    }
}

/// Wire two in-process zones together: build the endpoint pair, register
/// each service as its side's message handler, and install a pinned routing
/// record in each direction.
pub fn link_zones(a: &Arc<Service>, b: &Arc<Service>) -> ZoneLink {
    let (transport_a, transport_b) = InProcessTransport::pair(a.zone_id(), b.zone_id());

    let a_handler: Arc<dyn Marshaller> = a.clone();
    transport_a.add_destination(a.zone_id().as_destination(), Arc::downgrade(&a_handler));
    transport_a.set_default_handler(Arc::downgrade(&a_handler));

    let b_handler: Arc<dyn Marshaller> = b.clone();
    transport_b.add_destination(b.zone_id().as_destination(), Arc::downgrade(&b_handler));
    transport_b.set_default_handler(Arc::downgrade(&b_handler));

    let proxy_a_to_b = ServiceProxy::new(
        &format!("{}->{}", a.name(), b.name()),
        a,
        b.zone_id().as_destination(),
        a.zone_id().as_caller(),
        transport_a.clone(),
    );
    // the link itself pins the route; reference traffic must not retire it
    proxy_a_to_b.set_parent_channel(true);
    a.add_zone(proxy_a_to_b.clone());

    let proxy_b_to_a = ServiceProxy::new(
        &format!("{}->{}", b.name(), a.name()),
        b,
        a.zone_id().as_destination(),
        b.zone_id().as_caller(),
        transport_b.clone(),
    );
    proxy_b_to_a.set_parent_channel(true);
    b.add_zone(proxy_b_to_a.clone());

    ZoneLink {
        transport_a,
        transport_b,
        proxy_a_to_b,
        proxy_b_to_a,
    }
}

/// Expose `root` as the child zone's root object and hand the parent a
/// proxy to it. The zones must already be linked.
pub async fn connect_root<G: InterfaceGlue>(
    parent: &Arc<Service>,
    child: &Arc<ChildService>,
    root: Arc<G::Target>,
) -> Result<Arc<G::Target>, RpcError> {
    let child_service = child.service();
    let descriptor = bindings::stub_bind_out_param::<G>(
        LATEST_PROTOCOL_VERSION,
        child_service,
        CallerChannelZoneId::NONE,
        parent.zone_id().as_caller(),
        &root,
    )
    .await?;
    if let Some(stub) = child_service.get_object(descriptor.object_id) {
        child.set_root_stub(stub);
    }
    bindings::proxy_bind_out_param::<G>(
        LATEST_PROTOCOL_VERSION,
        parent,
        child_service.zone_id().as_destination(),
        descriptor,
    )
    .await
}
