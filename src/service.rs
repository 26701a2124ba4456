//! # The Per-Zone Service Registry
//!
//! A [`Service`] is the heart of a zone. It owns every local [`ObjectStub`],
//! deduplicates implementations so the same object never gets two stubs,
//! owns the routing table of known peer zones ([`ServiceProxy`] records),
//! and implements the marshaller contract for everything arriving in the
//! zone: local messages are dispatched to the right stub, remote ones are
//! forwarded one hop along the best route, synthesising new routes when an
//! `add_ref` asks for one.
//!
//! Three maps live under a single insert lock:
//!
//! - `stubs`: object id to its strong-owned stub;
//! - `wrapped_object_to_stub`: implementation identity to a weak stub
//!   reference, for deduplication;
//! - `other_zones`: `(destination, caller)` route to its service proxy.
//!
//! The lock is a leaf: it is never held across a transport call, and no
//! other runtime lock is taken while it is held. A service must be empty
//! when dropped; leaking stubs or routes is a programming error.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use crate::error::RpcError;
use crate::marshaller::{AddRefOptions, Marshaller, PostOptions, ReleaseOptions};
use crate::service_proxy::ServiceProxy;
use crate::stub::{InterfaceStub, ObjectStub};
use crate::types::{
    CallerChannelZoneId, CallerZoneId, DestinationChannelZoneId, DestinationZoneId, Encoding,
    InterfaceId, KnownDirectionZoneId, MethodId, ObjectId, ZoneId, LATEST_PROTOCOL_VERSION,
};

/// Routing key for the `other_zones` map: one service proxy exists per
/// destination/caller pair, so clones for different callers can coexist and
/// be released independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ZoneRoute {
    pub destination: DestinationZoneId,
    pub caller: CallerZoneId,
}

impl fmt::Display for ZoneRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<-{}", self.destination, self.caller)
    }
}

struct ServiceMaps {
    stubs: HashMap<ObjectId, Arc<ObjectStub>>,
    wrapped_object_to_stub: HashMap<usize, Weak<ObjectStub>>,
    other_zones: HashMap<ZoneRoute, Arc<ServiceProxy>>,
}

/// The per-zone registry; one per zone.
pub struct Service {
    name: String,
    zone_id: ZoneId,
    object_id_generator: AtomicU64,
    insert_control: Mutex<ServiceMaps>,
}

impl Service {
    pub fn new(name: &str, zone_id: ZoneId) -> Arc<Self> {
        debug!(zone = %zone_id, name, "service created");
        Arc::new(Self {
            name: name.to_string(),
            zone_id,
            object_id_generator: AtomicU64::new(0),
            insert_control: Mutex::new(ServiceMaps {
                stubs: HashMap::new(),
                wrapped_object_to_stub: HashMap::new(),
                other_zones: HashMap::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn zone_id(&self) -> ZoneId {
        self.zone_id
    }

    fn next_object_id(&self) -> ObjectId {
        ObjectId::new(self.object_id_generator.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Return the object id bound to `target_key`, creating a stub if none
    /// exists yet. `factory` produces the first interface stub for a fresh
    /// object stub; a factory failure leaves the maps untouched.
    pub fn add_lookup_stub<F>(
        self: &Arc<Self>,
        target_key: usize,
        factory: F,
    ) -> Result<ObjectId, RpcError>
    where
        F: FnOnce(&Arc<ObjectStub>) -> Result<Arc<dyn InterfaceStub>, RpcError>,
    {
        let mut maps = self.insert_control.lock();
        if let Some(existing) = maps
            .wrapped_object_to_stub
            .get(&target_key)
            .and_then(Weak::upgrade)
        {
            return Ok(existing.id());
        }
        let id = self.next_object_id();
        let stub = ObjectStub::new(id, self, target_key);
        let iface = factory(&stub)?;
        stub.add_interface(iface, LATEST_PROTOCOL_VERSION);
        maps.wrapped_object_to_stub
            .insert(target_key, Arc::downgrade(&stub));
        maps.stubs.insert(id, stub);
        Ok(id)
    }

    pub fn get_object(&self, object_id: ObjectId) -> Option<Arc<ObjectStub>> {
        self.insert_control.lock().stubs.get(&object_id).cloned()
    }

    pub fn stub_count(&self) -> usize {
        self.insert_control.lock().stubs.len()
    }

    pub fn wrapped_count(&self) -> usize {
        let maps = self.insert_control.lock();
        maps.wrapped_object_to_stub
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn route_count(&self) -> usize {
        self.insert_control.lock().other_zones.len()
    }

    /// Register a route. Idempotent: an existing record for the same
    /// destination/caller pair wins.
    pub fn add_zone(&self, proxy: Arc<ServiceProxy>) {
        let route = ZoneRoute {
            destination: proxy.destination_zone_id(),
            caller: proxy.caller_zone_id(),
        };
        let mut maps = self.insert_control.lock();
        maps.other_zones.entry(route).or_insert(proxy);
    }

    pub fn get_zone(
        &self,
        destination: DestinationZoneId,
        caller: CallerZoneId,
    ) -> Option<Arc<ServiceProxy>> {
        self.insert_control
            .lock()
            .other_zones
            .get(&ZoneRoute {
                destination,
                caller,
            })
            .cloned()
    }

    /// Best route towards `destination`: the local caller's own record if it
    /// exists, otherwise any record reaching that destination.
    pub fn get_zone_for_destination(
        &self,
        destination: DestinationZoneId,
    ) -> Option<Arc<ServiceProxy>> {
        let maps = self.insert_control.lock();
        maps.other_zones
            .get(&ZoneRoute {
                destination,
                caller: self.zone_id.as_caller(),
            })
            .or_else(|| {
                maps.other_zones
                    .iter()
                    .find(|(route, _)| route.destination == destination)
                    .map(|(_, proxy)| proxy)
            })
            .cloned()
    }

    /// Drop every route to `destination`. A no-op when none exists.
    pub fn remove_zone(&self, destination: DestinationZoneId) {
        let mut maps = self.insert_control.lock();
        maps.other_zones
            .retain(|route, _| route.destination != destination);
    }

    /// Drop the specific route record `proxy_ptr`, if it is still the one
    /// registered. Called by a service proxy whose lifetime lock collapsed.
    pub(crate) fn remove_zone_proxy(
        &self,
        destination: DestinationZoneId,
        caller: CallerZoneId,
        proxy_ptr: *const ServiceProxy,
    ) {
        let route = ZoneRoute {
            destination,
            caller,
        };
        let mut maps = self.insert_control.lock();
        if let Some(existing) = maps.other_zones.get(&route) {
            if Arc::as_ptr(existing) == proxy_ptr {
                maps.other_zones.remove(&route);
                trace!(zone = %self.zone_id, %route, "route retired");
            }
        }
    }

    /// Find or synthesise a route for `(destination, caller)`. When no exact
    /// record exists, a proxy known to reach `destination` (or one of the
    /// `hints` zones) is cloned and relabelled.
    pub(crate) fn ensure_route(
        &self,
        destination: DestinationZoneId,
        caller: CallerZoneId,
        hints: &[DestinationZoneId],
    ) -> Result<Arc<ServiceProxy>, RpcError> {
        let mut maps = self.insert_control.lock();
        let route = ZoneRoute {
            destination,
            caller,
        };
        if let Some(existing) = maps.other_zones.get(&route) {
            return Ok(existing.clone());
        }
        let donor = maps
            .other_zones
            .values()
            .find(|proxy| proxy.destination_zone_id() == destination)
            .or_else(|| {
                hints.iter().filter(|hint| hint.is_set()).find_map(|hint| {
                    maps.other_zones
                        .values()
                        .find(|proxy| proxy.destination_zone_id() == *hint)
                })
            })
            .cloned()
            .ok_or(RpcError::ZoneNotFound)?;
        let clone = donor.clone_for_zone(destination, caller);
        maps.other_zones.insert(route, clone.clone());
        debug!(
            zone = %self.zone_id,
            %route,
            via = %donor.destination_zone_id(),
            "route synthesised"
        );
        Ok(clone)
    }

    /// A peer zone announced its termination: drop every route into it and
    /// abandon the reference counts that flowed through those routes.
    fn handle_zone_terminating(&self, terminating: CallerZoneId) {
        let dead_zone = terminating.as_zone();
        let removed: Vec<Arc<ServiceProxy>> = {
            let mut maps = self.insert_control.lock();
            let doomed: Vec<ZoneRoute> = maps
                .other_zones
                .iter()
                .filter(|(route, proxy)| {
                    route.destination == dead_zone.as_destination()
                        || proxy.destination_channel_zone_id() == dead_zone.as_destination().as_channel()
                })
                .map(|(route, _)| *route)
                .collect();
            doomed
                .into_iter()
                .filter_map(|route| maps.other_zones.remove(&route))
                .collect()
        };
        for proxy in removed {
            proxy.mark_terminated();
        }
        debug!(zone = %self.zone_id, peer = %dead_zone, "peer zone terminated");
    }

    /// Announce this zone's termination to every peer, then abandon whatever
    /// is left in the maps. After shutdown the service drops cleanly.
    pub async fn shutdown(&self) {
        let proxies: Vec<Arc<ServiceProxy>> = {
            let mut maps = self.insert_control.lock();
            maps.other_zones.drain().map(|(_, proxy)| proxy).collect()
        };
        for proxy in proxies {
            proxy
                .post(
                    LATEST_PROTOCOL_VERSION,
                    Encoding::Binary,
                    0,
                    CallerChannelZoneId::NONE,
                    self.zone_id.as_caller(),
                    proxy.destination_zone_id(),
                    ObjectId::NONE,
                    InterfaceId::NONE,
                    MethodId::NONE,
                    PostOptions::ZoneTerminating,
                    &[],
                )
                .await;
            proxy.mark_terminated();
        }
        let leftover = {
            let mut maps = self.insert_control.lock();
            maps.wrapped_object_to_stub.clear();
            maps.stubs.drain().count()
        };
        if leftover > 0 {
            warn!(
                zone = %self.zone_id,
                stubs = leftover,
                "zone terminated with outstanding remote references"
            );
        }
    }

    /// Decrement a local stub's count; a shared count reaching zero detaches
    /// the stub from the maps, collapsing ownership of the implementation.
    fn release_local_stub(&self, stub: &Arc<ObjectStub>, optimistic: bool) -> u64 {
        let previous = stub.release(optimistic);
        let remaining = previous - 1;
        if !optimistic && remaining == 0 {
            let mut maps = self.insert_control.lock();
            // Re-check under the insert lock: this is the Live -> Detaching
            // boundary and only one releaser may cross it.
            if stub.shared_count() == 0 && maps.stubs.remove(&stub.id()).is_some() {
                maps.wrapped_object_to_stub.remove(&stub.target_key());
            }
        }
        remaining
    }

    /// The channel label for a message this zone forwards onward.
    fn forwarded_channel(&self, caller_zone_id: CallerZoneId) -> CallerChannelZoneId {
        if caller_zone_id == self.zone_id.as_caller() {
            CallerChannelZoneId::NONE
        } else {
            self.zone_id.as_caller_channel()
        }
    }
}

#[async_trait]
impl Marshaller for Service {
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
        if destination_zone_id == self.zone_id.as_destination() {
            let stub = self
                .get_object(object_id)
                .ok_or(RpcError::ObjectNotFound)?;
            return stub
                .call(
                    protocol_version,
                    encoding,
                    caller_channel_zone_id,
                    caller_zone_id,
                    interface_id,
                    method_id,
                    in_buf,
                )
                .await;
        }
        let proxy = self
            .get_zone(destination_zone_id, caller_zone_id)
            .or_else(|| self.get_zone_for_destination(destination_zone_id))
            .ok_or(RpcError::ZoneNotFound)?;
        proxy
            .send(
                protocol_version,
                encoding,
                tag,
                self.forwarded_channel(caller_zone_id),
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
        if destination_zone_id == self.zone_id.as_destination() {
            match options {
                PostOptions::ZoneTerminating => self.handle_zone_terminating(caller_zone_id),
            }
            return;
        }
        let Some(proxy) = self
            .get_zone(destination_zone_id, caller_zone_id)
            .or_else(|| self.get_zone_for_destination(destination_zone_id))
        else {
            trace!(
                zone = %self.zone_id,
                destination = %destination_zone_id,
                "post dropped, no route"
            );
            return;
        };
        proxy
            .post(
                protocol_version,
                encoding,
                tag,
                self.forwarded_channel(caller_zone_id),
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
        if destination_zone_id == self.zone_id.as_destination() {
            let stub = self
                .get_object(object_id)
                .ok_or(RpcError::ObjectNotFound)?;
            return stub.try_cast(interface_id);
        }
        let proxy = self
            .get_zone_for_destination(destination_zone_id)
            .ok_or(RpcError::ZoneNotFound)?;
        proxy
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
        if destination_zone_id == self.zone_id.as_destination() {
            let optimistic = options.contains(AddRefOptions::OPTIMISTIC);
            let stub = self
                .get_object(object_id)
                .ok_or(RpcError::ObjectNotFound)?;
            let count = stub.add_ref(optimistic);
            if options.contains(AddRefOptions::BUILD_CALLER_ROUTE)
                && caller_zone_id != self.zone_id.as_caller()
            {
                if let Err(err) = self.ensure_route(
                    caller_zone_id.as_destination(),
                    self.zone_id.as_caller(),
                    &[
                        caller_channel_zone_id.as_destination(),
                        known_direction_zone_id.as_destination(),
                    ],
                ) {
                    // no reverse route means the reference could never be
                    // released; take the increment back
                    self.release_local_stub(&stub, optimistic);
                    return Err(err);
                }
            }
            return Ok(count);
        }

        let proxy = match self.get_zone(destination_zone_id, caller_zone_id) {
            Some(proxy) => proxy,
            None if options.contains(AddRefOptions::BUILD_DESTINATION_ROUTE) => self
                .ensure_route(
                    destination_zone_id,
                    caller_zone_id,
                    &[
                        destination_channel_zone_id.as_destination(),
                        known_direction_zone_id.as_destination(),
                    ],
                )?,
            None => self
                .get_zone_for_destination(destination_zone_id)
                .ok_or(RpcError::ZoneNotFound)?,
        };
        let count = proxy
            .add_ref(
                protocol_version,
                destination_channel_zone_id,
                destination_zone_id,
                object_id,
                self.forwarded_channel(caller_zone_id),
                caller_zone_id,
                known_direction_zone_id,
                options,
            )
            .await?;
        if caller_zone_id != self.zone_id.as_caller() {
            // The route is pinned by the references forwarded through it.
            proxy.add_external_ref();
        }
        Ok(count)
    }

    async fn release(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        caller_zone_id: CallerZoneId,
        options: ReleaseOptions,
    ) -> Result<u64, RpcError> {
        if destination_zone_id == self.zone_id.as_destination() {
            let optimistic = options == ReleaseOptions::Optimistic;
            let stub = self.get_object(object_id).ok_or(RpcError::ObjectNotFound)?;
            return Ok(self.release_local_stub(&stub, optimistic));
        }
        let proxy = self
            .get_zone(destination_zone_id, caller_zone_id)
            .or_else(|| self.get_zone_for_destination(destination_zone_id))
            .ok_or(RpcError::ZoneNotFound)?;
        let count = proxy
            .release(
                protocol_version,
                destination_zone_id,
                object_id,
                caller_zone_id,
                options,
            )
            .await?;
        if caller_zone_id != self.zone_id.as_caller() {
            proxy.release_external_ref();
        }
        Ok(count)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        let maps = self.insert_control.get_mut();
        if !std::thread::panicking() {
            assert!(
                maps.stubs.is_empty() && maps.other_zones.is_empty(),
                "service {} (zone {}) dropped with {} stubs and {} routes outstanding",
                self.name,
                self.zone_id,
                maps.stubs.len(),
                maps.other_zones.len()
            );
        }
        debug!(zone = %self.zone_id, "service destroyed");
    }
}

/// A service whose zone was spawned by, and is rooted in, a parent zone.
///
/// The child exposes one root object to the parent; tearing the child down
/// releases that root reference against the parent zone before the regular
/// service shutdown runs.
pub struct ChildService {
    service: Arc<Service>,
    parent_zone_id: DestinationZoneId,
    root_stub: Mutex<Option<Arc<ObjectStub>>>,
}

impl ChildService {
    pub fn new(service: Arc<Service>, parent_zone_id: DestinationZoneId) -> Arc<Self> {
        Arc::new(Self {
            service,
            parent_zone_id,
            root_stub: Mutex::new(None),
        })
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn parent_zone_id(&self) -> DestinationZoneId {
        self.parent_zone_id
    }

    pub fn set_root_stub(&self, stub: Arc<ObjectStub>) {
        *self.root_stub.lock() = Some(stub);
    }

    /// The object id of the root stub, `None` before the zone is connected.
    pub fn root_object_id(&self) -> Option<ObjectId> {
        self.root_stub.lock().as_ref().map(|stub| stub.id())
    }

    /// Release the root object against the parent and terminate the zone.
    pub async fn shutdown(&self) {
        let root = self.root_stub.lock().take();
        if let Some(stub) = root {
            if stub.shared_count() > 0 {
                let _ = self
                    .service
                    .release(
                        LATEST_PROTOCOL_VERSION,
                        self.service.zone_id().as_destination(),
                        stub.id(),
                        self.parent_zone_id.as_caller(),
                        ReleaseOptions::Normal,
                    )
                    .await;
            }
        }
        self.service.shutdown().await;
    }
}
