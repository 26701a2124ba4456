//! # The Routing Record for One Remote Zone
//!
//! A [`ServiceProxy`] represents "outbound traffic from this zone to one
//! destination zone, attributed to one caller zone". It owns no transport,
//! only a handle to one, and it holds only weak references to the
//! object proxies routed through it, so that the user-facing proxies drive
//! their own lifetimes while the record can still deduplicate them.
//!
//! The record's own lifetime is governed by `lifetime_lock_count`: the
//! number of live object proxies plus any external holds (references
//! forwarded through it on behalf of other zones, pins taken during route
//! construction). When the count collapses to zero and the record is not a
//! pinned parent channel, the proxy asks its service to retire it.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use crate::error::RpcError;
use crate::marshaller::{AddRefOptions, Marshaller, PostOptions, ReleaseOptions};
use crate::object_proxy::{InterfaceGlue, ObjectProxy};
use crate::service::Service;
use crate::transport::Transport;
use crate::types::{
    CallerChannelZoneId, CallerZoneId, DestinationChannelZoneId, DestinationZoneId, Encoding,
    InterfaceId, KnownDirectionZoneId, MethodId, ObjectId, ZoneId,
};

/// How `get_or_create_object_proxy` reconciles the wire reference count with
/// what it finds in the proxy map. The caller chooses based on how the
/// reference it holds was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectProxyCreationRule {
    /// Reference accounting is already correct; just look up or create.
    DoNothing,
    /// No wire reference accompanies this request: a freshly created proxy
    /// must acquire its own.
    AddRefIfNew,
    /// A wire reference accompanies this request: if an existing proxy
    /// already holds one, the surplus must be released.
    ReleaseIfNotNew,
}

enum ReleaseOutcome {
    /// No live replacement: the counts go out on the wire.
    Wire,
    /// A racing thread already registered a replacement proxy for the same
    /// object; it inherits the counts so the stub never transits zero.
    Inherited(Arc<ObjectProxy>),
}

/// Routing record for exactly one `(destination_zone, caller_zone)` pair.
pub struct ServiceProxy {
    name: String,
    zone_id: ZoneId,
    destination_zone_id: DestinationZoneId,
    destination_channel_zone_id: DestinationChannelZoneId,
    caller_zone_id: CallerZoneId,
    service: Weak<Service>,
    transport: Arc<dyn Transport>,
    proxies: Mutex<HashMap<ObjectId, Weak<ObjectProxy>>>,
    lifetime_lock_count: AtomicI64,
    is_parent_channel: AtomicBool,
    terminated: AtomicBool,
    encoding: Mutex<Encoding>,
    remote_version: AtomicU64,
}

impl ServiceProxy {
    pub fn new(
        name: &str,
        service: &Arc<Service>,
        destination_zone_id: DestinationZoneId,
        caller_zone_id: CallerZoneId,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        debug!(
            zone = %service.zone_id(),
            destination = %destination_zone_id,
            caller = %caller_zone_id,
            name,
            "service proxy created"
        );
        Arc::new(Self {
            name: name.to_string(),
            zone_id: service.zone_id(),
            destination_zone_id,
            destination_channel_zone_id: DestinationChannelZoneId::NONE,
            caller_zone_id,
            service: Arc::downgrade(service),
            transport,
            proxies: Mutex::new(HashMap::new()),
            lifetime_lock_count: AtomicI64::new(0),
            is_parent_channel: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            encoding: Mutex::new(Encoding::default()),
            remote_version: AtomicU64::new(crate::types::LATEST_PROTOCOL_VERSION),
        })
    }

    /// A sibling record sharing the transport but reaching `destination` on
    /// behalf of `caller`. Used by the service to construct return routes.
    pub fn clone_for_zone(
        &self,
        destination_zone_id: DestinationZoneId,
        caller_zone_id: CallerZoneId,
    ) -> Arc<Self> {
        let destination_channel_zone_id = if destination_zone_id == self.destination_zone_id {
            self.destination_channel_zone_id
        } else if self.destination_channel_zone_id.is_set() {
            self.destination_channel_zone_id
        } else {
            // the original record's destination becomes the relay hop
            self.destination_zone_id.as_channel()
        };
        debug!(
            zone = %self.zone_id,
            destination = %destination_zone_id,
            caller = %caller_zone_id,
            channel = %destination_channel_zone_id,
            "service proxy cloned"
        );
        Arc::new(Self {
            name: self.name.clone(),
            zone_id: self.zone_id,
            destination_zone_id,
            destination_channel_zone_id,
            caller_zone_id,
            service: self.service.clone(),
            transport: self.transport.clone(),
            proxies: Mutex::new(HashMap::new()),
            lifetime_lock_count: AtomicI64::new(0),
            is_parent_channel: AtomicBool::new(false),
            terminated: AtomicBool::new(self.terminated.load(Ordering::Acquire)),
            encoding: Mutex::new(*self.encoding.lock()),
            remote_version: AtomicU64::new(self.remote_version.load(Ordering::Acquire)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn zone_id(&self) -> ZoneId {
        self.zone_id
    }

    pub fn destination_zone_id(&self) -> DestinationZoneId {
        self.destination_zone_id
    }

    pub fn destination_channel_zone_id(&self) -> DestinationChannelZoneId {
        self.destination_channel_zone_id
    }

    pub fn caller_zone_id(&self) -> CallerZoneId {
        self.caller_zone_id
    }

    pub fn service(&self) -> Option<Arc<Service>> {
        self.service.upgrade()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn encoding(&self) -> Encoding {
        *self.encoding.lock()
    }

    pub fn set_encoding(&self, encoding: Encoding) {
        *self.encoding.lock() = encoding;
    }

    pub fn remote_version(&self) -> u64 {
        self.remote_version.load(Ordering::Acquire)
    }

    pub fn update_remote_version(&self, version: u64) {
        self.remote_version.store(version, Ordering::Release);
    }

    pub fn is_unused(&self) -> bool {
        self.lifetime_lock_count.load(Ordering::Acquire) == 0
    }

    pub fn lifetime_lock_count(&self) -> i64 {
        self.lifetime_lock_count.load(Ordering::Acquire)
    }

    /// Number of live object proxies currently routed through this record.
    pub fn proxy_count(&self) -> usize {
        self.proxies
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_parent_channel(&self) -> bool {
        self.is_parent_channel.load(Ordering::Acquire)
    }

    /// A parent channel stays registered even with no active references; a
    /// zone must not lose the route to the zone that spawned it.
    pub fn set_parent_channel(&self, pinned: bool) {
        self.is_parent_channel.store(pinned, Ordering::Release);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// The destination zone is gone; suppress all further wire traffic.
    pub fn mark_terminated(&self) {
        self.terminated.store(true, Ordering::Release);
        trace!(
            zone = %self.zone_id,
            destination = %self.destination_zone_id,
            "service proxy terminated"
        );
    }

    /// Pin the record independently of object proxies.
    pub fn add_external_ref(&self) -> i64 {
        self.lifetime_lock_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop an external pin; the last one out retires the record.
    pub fn release_external_ref(&self) {
        self.release_lifetime_lock();
    }

    fn release_lifetime_lock(&self) {
        let count = self.lifetime_lock_count.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(count >= 0, "lifetime lock underflow on {}", self.name);
        if count == 0 && !self.is_parent_channel() {
            if let Some(service) = self.service.upgrade() {
                service.remove_zone_proxy(
                    self.destination_zone_id,
                    self.caller_zone_id,
                    self as *const _,
                );
            }
        }
    }

    /// Look up the object proxy for `object_id`, creating one when no live
    /// proxy exists, and reconcile the wire reference per `rule`.
    pub async fn get_or_create_object_proxy(
        self: &Arc<Self>,
        object_id: ObjectId,
        rule: ObjectProxyCreationRule,
        known_direction_zone_id: KnownDirectionZoneId,
        is_optimistic: bool,
    ) -> Result<Arc<ObjectProxy>, RpcError> {
        if self.is_terminated() {
            return Err(RpcError::ZoneNotFound);
        }
        let (proxy, is_new) = {
            let mut map = self.proxies.lock();
            match map.get(&object_id).and_then(Weak::upgrade) {
                Some(existing) => (existing, false),
                None => {
                    let created = ObjectProxy::new(self.clone(), object_id, is_optimistic);
                    map.insert(object_id, Arc::downgrade(&created));
                    self.lifetime_lock_count.fetch_add(1, Ordering::AcqRel);
                    trace!(
                        zone = %self.zone_id,
                        destination = %self.destination_zone_id,
                        object = %object_id,
                        "object proxy created"
                    );
                    (created, true)
                }
            }
        };
        match rule {
            ObjectProxyCreationRule::AddRefIfNew if is_new => {
                let options = if is_optimistic {
                    AddRefOptions::OPTIMISTIC | AddRefOptions::BUILD_DESTINATION_ROUTE
                } else {
                    AddRefOptions::NORMAL | AddRefOptions::BUILD_DESTINATION_ROUTE
                };
                if let Err(err) = self
                    .sp_add_ref(
                        object_id,
                        CallerChannelZoneId::NONE,
                        options,
                        known_direction_zone_id,
                    )
                    .await
                {
                    proxy.disarm();
                    return Err(err);
                }
            }
            ObjectProxyCreationRule::ReleaseIfNotNew if !is_new => {
                // the sender's reference is surplus to the one the existing
                // proxy already holds
                self.sp_release(
                    object_id,
                    if is_optimistic {
                        ReleaseOptions::Optimistic
                    } else {
                        ReleaseOptions::Normal
                    },
                )
                .await?;
            }
            _ => {}
        }
        Ok(proxy)
    }

    /// User-facing entry point: a typed proxy for `object_id` in this
    /// record's destination zone.
    pub async fn create_proxy<G: InterfaceGlue>(
        self: &Arc<Self>,
        object_id: ObjectId,
        rule: ObjectProxyCreationRule,
    ) -> Result<Arc<G::Target>, RpcError> {
        let proxy = self
            .get_or_create_object_proxy(object_id, rule, KnownDirectionZoneId::NONE, false)
            .await?;
        proxy.query_interface::<G>(false).await
    }

    /// Called by a dying object proxy with the references it is carrying.
    pub(crate) fn on_object_proxy_released(
        self: &Arc<Self>,
        released: *const ObjectProxy,
        object_id: ObjectId,
        shared_refs: u64,
        optimistic_refs: u64,
    ) {
        let outcome = {
            let mut map = self.proxies.lock();
            match map.get(&object_id) {
                Some(weak) if Weak::as_ptr(weak) == released => {
                    map.remove(&object_id);
                    ReleaseOutcome::Wire
                }
                Some(weak) => match weak.upgrade() {
                    Some(replacement) => ReleaseOutcome::Inherited(replacement),
                    // the replacement is dying too; its own drop accounts
                    // for its references
                    None => ReleaseOutcome::Wire,
                },
                None => ReleaseOutcome::Wire,
            }
        };
        match outcome {
            ReleaseOutcome::Inherited(replacement) => {
                replacement.inherit(shared_refs, optimistic_refs);
                trace!(
                    zone = %self.zone_id,
                    object = %object_id,
                    shared_refs,
                    optimistic_refs,
                    "references inherited by replacement proxy"
                );
                self.release_lifetime_lock();
            }
            ReleaseOutcome::Wire => {
                if self.is_terminated() || (shared_refs == 0 && optimistic_refs == 0) {
                    self.release_lifetime_lock();
                    return;
                }
                let this = self.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            this.cleanup_after_object(object_id, shared_refs, optimistic_refs)
                                .await;
                        });
                    }
                    Err(_) => {
                        warn!(
                            zone = %self.zone_id,
                            object = %object_id,
                            "object proxy dropped outside a runtime; remote references abandoned"
                        );
                        self.release_lifetime_lock();
                    }
                }
            }
        }
    }

    async fn cleanup_after_object(
        self: Arc<Self>,
        object_id: ObjectId,
        shared_refs: u64,
        optimistic_refs: u64,
    ) {
        for _ in 0..shared_refs {
            if let Err(err) = self.sp_release(object_id, ReleaseOptions::Normal).await {
                trace!(
                    zone = %self.zone_id,
                    object = %object_id,
                    error = %err,
                    "release after object proxy death failed"
                );
                break;
            }
        }
        for _ in 0..optimistic_refs {
            if self
                .sp_release(object_id, ReleaseOptions::Optimistic)
                .await
                .is_err()
            {
                break;
            }
        }
        self.release_lifetime_lock();
    }

    /// Forward a call out of this zone, labelled with this record's
    /// destination and caller.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_from_this_zone(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        tag: u64,
        object_id: ObjectId,
        interface_id: InterfaceId,
        method_id: MethodId,
        in_buf: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        if self.is_terminated() {
            return Err(RpcError::ZoneNotFound);
        }
        self.transport
            .send(
                protocol_version,
                encoding,
                tag,
                CallerChannelZoneId::NONE,
                self.caller_zone_id,
                self.destination_zone_id,
                object_id,
                interface_id,
                method_id,
                in_buf,
            )
            .await
    }

    pub async fn sp_try_cast(
        &self,
        object_id: ObjectId,
        interface_id: InterfaceId,
    ) -> Result<(), RpcError> {
        if self.is_terminated() {
            return Err(RpcError::ZoneNotFound);
        }
        self.transport
            .try_cast(
                self.remote_version(),
                self.destination_zone_id,
                object_id,
                interface_id,
            )
            .await
    }

    pub async fn sp_add_ref(
        &self,
        object_id: ObjectId,
        caller_channel_zone_id: CallerChannelZoneId,
        options: AddRefOptions,
        known_direction_zone_id: KnownDirectionZoneId,
    ) -> Result<u64, RpcError> {
        if self.is_terminated() {
            return Err(RpcError::ZoneNotFound);
        }
        self.transport
            .add_ref(
                self.remote_version(),
                self.destination_channel_zone_id,
                self.destination_zone_id,
                object_id,
                caller_channel_zone_id,
                self.caller_zone_id,
                known_direction_zone_id,
                options,
            )
            .await
    }

    pub async fn sp_release(
        &self,
        object_id: ObjectId,
        options: ReleaseOptions,
    ) -> Result<u64, RpcError> {
        if self.is_terminated() {
            return Err(RpcError::ZoneNotFound);
        }
        self.transport
            .release(
                self.remote_version(),
                self.destination_zone_id,
                object_id,
                self.caller_zone_id,
                options,
            )
            .await
    }
}

/// Forwarding marshaller: a service routes a message for another zone into
/// the proxy, which hands it to the transport unchanged.
#[async_trait]
impl Marshaller for ServiceProxy {
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
        if self.is_terminated() {
            return Err(RpcError::ZoneNotFound);
        }
        self.transport
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
        if self.is_terminated() {
            return;
        }
        self.transport
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
        if self.is_terminated() {
            return Err(RpcError::ZoneNotFound);
        }
        self.transport
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
        if self.is_terminated() {
            return Err(RpcError::ZoneNotFound);
        }
        self.transport
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
        if self.is_terminated() {
            return Err(RpcError::ZoneNotFound);
        }
        self.transport
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

impl Drop for ServiceProxy {
    fn drop(&mut self) {
        trace!(
            zone = %self.zone_id,
            destination = %self.destination_zone_id,
            caller = %self.caller_zone_id,
            "service proxy destroyed"
        );
    }
}
