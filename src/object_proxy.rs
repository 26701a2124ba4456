//! # Client-Side Object Representation
//!
//! An [`ObjectProxy`] is the local stand-in for one remote object. It pins
//! its [`ServiceProxy`] with a strong member reference (the route must
//! outlive the proxy), caches the typed interface proxies handed to user
//! code, and when it dies it reports the references it carried back to the
//! routing record so exactly one wire `release` is issued per `add_ref`
//! observed by the remote stub, including references it inherited from a
//! predecessor proxy it raced against.
//!
//! Generated interface proxies plug in through [`InterfaceGlue`], the
//! crate's contract with the code generator.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

use crate::error::RpcError;
use crate::service_proxy::ServiceProxy;
use crate::stub::{InterfaceStub, ObjectStub};
use crate::types::{DestinationZoneId, Encoding, InterfaceId, MethodId, ObjectId};

/// Implemented by every user-visible interface trait so that the runtime
/// can recognise a proxy when one is passed back in as a parameter and
/// short-circuit to the object's real home instead of wrapping the proxy in
/// another proxy.
pub trait CastingInterface: Send + Sync {
    /// The object proxy behind this reference, when it is a proxy at all.
    /// Local implementations use the default.
    fn query_object_proxy(&self) -> Option<Arc<ObjectProxy>> {
        None
    }

    /// Cross-cast hook: a boxed `Arc<dyn OtherInterface>` for every
    /// interface this object implements, keyed by ordinal. Generated code
    /// provides the match per implementation type; the default advertises
    /// nothing beyond the interface the reference already has.
    fn query_interface_any(
        self: Arc<Self>,
        interface_id: InterfaceId,
    ) -> Option<Box<dyn Any + Send + Sync>> {
        let _ = interface_id;
        None
    }
}

/// The contract generated code implements once per IDL interface: the
/// compile-time interface ordinal plus constructors for the server-side
/// stub and the client-side proxy.
pub trait InterfaceGlue: 'static {
    /// The user's object-safe interface trait, e.g. `dyn Calculator`.
    type Target: ?Sized + CastingInterface + Send + Sync + 'static;

    /// The stable fingerprint of the interface under `protocol_version`.
    fn interface_id(protocol_version: u64) -> InterfaceId;

    /// Wrap an implementation in a generated interface stub.
    fn new_stub(target: Arc<Self::Target>, owner: &Arc<ObjectStub>) -> Arc<dyn InterfaceStub>;

    /// Build a generated interface proxy over `object_proxy`.
    fn new_proxy(object_proxy: Arc<ObjectProxy>) -> Arc<Self::Target>;

    /// Identity of an implementation, used to deduplicate stubs.
    fn target_key(target: &Arc<Self::Target>) -> usize {
        Arc::as_ptr(target) as *const () as usize
    }

    /// Recover a typed handle from a stub's boxed implementation clone.
    fn target_from_any(any: &(dyn Any + Send + Sync)) -> Option<Arc<Self::Target>> {
        any.downcast_ref::<Arc<Self::Target>>().cloned()
    }
}

/// One per (service proxy, remote object).
pub struct ObjectProxy {
    object_id: ObjectId,
    service_proxy: Arc<ServiceProxy>,
    // interface ordinal -> boxed Weak<dyn UserInterface>
    insert_control: Mutex<HashMap<InterfaceId, Box<dyn Any + Send + Sync>>>,
    inherited_shared: AtomicU64,
    inherited_optimistic: AtomicU64,
    optimistic: bool,
    armed: AtomicBool,
}

impl fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectProxy")
            .field("object_id", &self.object_id)
            .field("optimistic", &self.optimistic)
            .field("armed", &self.armed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ObjectProxy {
    pub(crate) fn new(
        service_proxy: Arc<ServiceProxy>,
        object_id: ObjectId,
        optimistic: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            object_id,
            service_proxy,
            insert_control: Mutex::new(HashMap::new()),
            inherited_shared: AtomicU64::new(0),
            inherited_optimistic: AtomicU64::new(0),
            optimistic,
            armed: AtomicBool::new(true),
        })
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn service_proxy(&self) -> &Arc<ServiceProxy> {
        &self.service_proxy
    }

    pub fn descriptor(&self) -> crate::marshaller::InterfaceDescriptor {
        crate::marshaller::InterfaceDescriptor::new(self.object_id, self.destination_zone_id())
    }

    pub fn destination_zone_id(&self) -> DestinationZoneId {
        self.service_proxy.destination_zone_id()
    }

    /// Number of live cached interface proxies.
    pub fn proxy_count(&self) -> usize {
        self.insert_control.lock().len()
    }

    /// Absorb references carried by a predecessor proxy that lost a
    /// creation race; they are released when this proxy dies.
    pub(crate) fn inherit(&self, shared_refs: u64, optimistic_refs: u64) {
        self.inherited_shared.fetch_add(shared_refs, Ordering::AcqRel);
        self.inherited_optimistic
            .fetch_add(optimistic_refs, Ordering::AcqRel);
    }

    /// Forget the wire reference this proxy would normally release; used
    /// when the acquiring `add_ref` never landed.
    pub(crate) fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// Forward a method call to the destination zone.
    pub async fn send(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        tag: u64,
        interface_id: InterfaceId,
        method_id: MethodId,
        in_buf: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        if self.service_proxy.service().is_none() {
            return Err(RpcError::ZoneNotInitialised);
        }
        self.service_proxy
            .send_from_this_zone(
                protocol_version,
                encoding,
                tag,
                self.object_id,
                interface_id,
                method_id,
                in_buf,
            )
            .await
    }

    /// Ask the destination zone whether the object supports `interface_id`.
    pub async fn try_cast_id(&self, interface_id: InterfaceId) -> Result<(), RpcError> {
        if self.service_proxy.service().is_none() {
            return Err(RpcError::ZoneNotInitialised);
        }
        self.service_proxy
            .sp_try_cast(self.object_id, interface_id)
            .await
    }

    /// Typed access to one interface of the remote object.
    ///
    /// The fast path serves a live cached proxy under the lock; a dead cache
    /// entry is refreshed in place. On a miss with `do_remote_check` the
    /// lock is dropped around the wire `try_cast` and the cache re-checked
    /// afterwards, since another task may have raced the same cast.
    pub async fn query_interface<G: InterfaceGlue>(
        self: &Arc<Self>,
        do_remote_check: bool,
    ) -> Result<Arc<G::Target>, RpcError> {
        let interface_id = G::interface_id(self.service_proxy.remote_version());
        if interface_id.is_none() {
            return Err(RpcError::InvalidCast);
        }
        {
            let mut map = self.insert_control.lock();
            if let Some(slot) = map.get_mut(&interface_id) {
                return Ok(Self::fetch_or_refresh::<G>(self, slot));
            }
            if !do_remote_check {
                let proxy = G::new_proxy(self.clone());
                map.insert(interface_id, Box::new(Arc::downgrade(&proxy)));
                return Ok(proxy);
            }
        }

        // the cast might not be valid; check on the wire with the lock
        // released
        self.try_cast_id(interface_id).await?;

        let mut map = self.insert_control.lock();
        if let Some(slot) = map.get_mut(&interface_id) {
            return Ok(Self::fetch_or_refresh::<G>(self, slot));
        }
        let proxy = G::new_proxy(self.clone());
        map.insert(interface_id, Box::new(Arc::downgrade(&proxy)));
        Ok(proxy)
    }

    fn fetch_or_refresh<G: InterfaceGlue>(
        self: &Arc<Self>,
        slot: &mut Box<dyn Any + Send + Sync>,
    ) -> Arc<G::Target> {
        if let Some(weak) = slot.downcast_ref::<Weak<G::Target>>() {
            if let Some(existing) = weak.upgrade() {
                return existing;
            }
        }
        // weak entry needs refreshing
        let proxy = G::new_proxy(self.clone());
        *slot = Box::new(Arc::downgrade(&proxy));
        proxy
    }
}

impl Drop for ObjectProxy {
    fn drop(&mut self) {
        let own_armed = self.armed.load(Ordering::Acquire);
        let own_shared: u64 = if own_armed && !self.optimistic { 1 } else { 0 };
        let own_optimistic: u64 = if own_armed && self.optimistic { 1 } else { 0 };
        let shared_refs = own_shared + self.inherited_shared.load(Ordering::Acquire);
        let optimistic_refs = own_optimistic + self.inherited_optimistic.load(Ordering::Acquire);
        trace!(
            zone = %self.service_proxy.zone_id(),
            destination = %self.destination_zone_id(),
            object = %self.object_id,
            shared_refs,
            optimistic_refs,
            "object proxy destroyed"
        );
        ServiceProxy::on_object_proxy_released(
            &self.service_proxy,
            self as *const _,
            self.object_id,
            shared_refs,
            optimistic_refs,
        );
    }
}
