//! # Server-Side Dispatch
//!
//! An [`ObjectStub`] wraps one implementation object exposed by a zone. It
//! owns the implementation (through its interface stubs), hands inbound
//! calls to the right [`InterfaceStub`] by ordinal, and carries the two
//! reference counts of the distributed lifetime protocol:
//!
//! - the *shared* count keeps the stub (and therefore the implementation)
//!   alive;
//! - the *optimistic* count protects in-flight messages that mention the
//!   object without keeping it alive. A stub whose shared count reaches zero
//!   is destroyed even with optimistic references outstanding; optimistic
//!   holders finding it gone observe `OBJECT_NOT_FOUND` and clean up.
//!
//! Interface stubs are generated code; the runtime sees them only through
//! the object-safe [`InterfaceStub`] trait.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

use crate::error::RpcError;
use crate::service::Service;
use crate::types::{CallerChannelZoneId, CallerZoneId, Encoding, InterfaceId, MethodId, ObjectId, ZoneId};

/// Generated server-side dispatch for one interface of one implementation.
#[async_trait]
pub trait InterfaceStub: Send + Sync {
    /// The stable ordinal of the interface this stub dispatches, under the
    /// given protocol version.
    fn interface_id(&self, protocol_version: u64) -> InterfaceId;

    /// Unpack `method_id` plus payload into a typed call on the
    /// implementation and pack the reply.
    async fn call(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        caller_channel_zone_id: CallerChannelZoneId,
        caller_zone_id: CallerZoneId,
        method_id: MethodId,
        in_buf: &[u8],
    ) -> Result<Vec<u8>, RpcError>;

    /// Attempt to produce a sibling stub dispatching `interface_id` against
    /// the same implementation. `None` means the implementation does not
    /// expose that interface.
    fn cast(&self, interface_id: InterfaceId) -> Option<Arc<dyn InterfaceStub>>;

    /// The object stub this interface stub dispatches for.
    fn object_stub(&self) -> Weak<ObjectStub>;

    /// A boxed clone of the strong implementation handle (an
    /// `Arc<dyn YourInterface>` behind `Any`), used to hand the original
    /// implementation back out when a descriptor for a local object is
    /// demarshalled. Avoids wrapping a local object in a proxy to itself.
    fn clone_target_any(&self) -> Box<dyn Any + Send + Sync>;
}

/// One per (zone, implementation). Strong-owns the implementation via its
/// interface stubs and fans inbound calls out by interface ordinal.
pub struct ObjectStub {
    id: ObjectId,
    zone_id: ZoneId,
    service: Weak<Service>,
    target_key: usize,
    map_control: Mutex<HashMap<InterfaceId, Arc<dyn InterfaceStub>>>,
    shared_count: AtomicU64,
    optimistic_count: AtomicU64,
}

impl ObjectStub {
    pub(crate) fn new(id: ObjectId, service: &Arc<Service>, target_key: usize) -> Arc<Self> {
        trace!(zone = %service.zone_id(), object = %id, "stub created");
        Arc::new(Self {
            id,
            zone_id: service.zone_id(),
            service: Arc::downgrade(service),
            target_key,
            map_control: Mutex::new(HashMap::new()),
            shared_count: AtomicU64::new(0),
            optimistic_count: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Identity of the wrapped implementation, used for stub deduplication.
    pub(crate) fn target_key(&self) -> usize {
        self.target_key
    }

    pub fn service(&self) -> Option<Arc<Service>> {
        self.service.upgrade()
    }

    pub fn shared_count(&self) -> u64 {
        self.shared_count.load(Ordering::Acquire)
    }

    pub fn optimistic_count(&self) -> u64 {
        self.optimistic_count.load(Ordering::Acquire)
    }

    /// Registration-time insert; callers hold the service's insert lock.
    pub(crate) fn add_interface(&self, iface: Arc<dyn InterfaceStub>, protocol_version: u64) {
        let interface_id = iface.interface_id(protocol_version);
        self.map_control.lock().insert(interface_id, iface);
    }

    pub fn get_interface(&self, interface_id: InterfaceId) -> Option<Arc<dyn InterfaceStub>> {
        self.map_control.lock().get(&interface_id).cloned()
    }

    /// Strong handle to the implementation, boxed behind `Any`.
    pub(crate) fn clone_target_any(&self) -> Option<Box<dyn Any + Send + Sync>> {
        let map = self.map_control.lock();
        map.values().next().map(|iface| iface.clone_target_any())
    }

    /// Dispatch a call to the interface stub registered under
    /// `interface_id`.
    #[allow(clippy::too_many_arguments)]
    pub async fn call(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        caller_channel_zone_id: CallerChannelZoneId,
        caller_zone_id: CallerZoneId,
        interface_id: InterfaceId,
        method_id: MethodId,
        in_buf: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        let stub = self.get_interface(interface_id);
        match stub {
            Some(stub) => {
                stub.call(
                    protocol_version,
                    encoding,
                    caller_channel_zone_id,
                    caller_zone_id,
                    method_id,
                    in_buf,
                )
                .await
            }
            None => {
                trace!(
                    zone = %self.zone_id,
                    object = %self.id,
                    interface = %interface_id,
                    "call on unknown interface"
                );
                Err(RpcError::InvalidInterfaceId)
            }
        }
    }

    /// Check whether the implementation supports `interface_id`, growing the
    /// interface-stub map on a successful cast.
    pub fn try_cast(&self, interface_id: InterfaceId) -> Result<(), RpcError> {
        let mut map = self.map_control.lock();
        if map.contains_key(&interface_id) {
            return Ok(());
        }
        let existing = map.values().next().cloned().ok_or(RpcError::InvalidCast)?;
        match existing.cast(interface_id) {
            Some(new_stub) => {
                map.insert(interface_id, new_stub);
                Ok(())
            }
            None => Err(RpcError::InvalidCast),
        }
    }

    /// Increment one of the two counts, returning the new value.
    pub fn add_ref(&self, optimistic: bool) -> u64 {
        let counter = if optimistic {
            &self.optimistic_count
        } else {
            &self.shared_count
        };
        let count = counter.fetch_add(1, Ordering::AcqRel) + 1;
        assert!(count != 0, "reference count overflow on object {}", self.id);
        trace!(
            zone = %self.zone_id,
            object = %self.id,
            count,
            optimistic,
            "stub add_ref"
        );
        count
    }

    /// Decrement one of the two counts, returning the *previous* value. A
    /// release that would take the count negative is a programming error.
    pub fn release(&self, optimistic: bool) -> u64 {
        let counter = if optimistic {
            &self.optimistic_count
        } else {
            &self.shared_count
        };
        let previous = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .unwrap_or_else(|_| {
                panic!("reference count underflow on object {}", self.id)
            });
        trace!(
            zone = %self.zone_id,
            object = %self.id,
            count = previous - 1,
            optimistic,
            "stub release"
        );
        previous
    }
}

impl Drop for ObjectStub {
    fn drop(&mut self) {
        trace!(zone = %self.zone_id, object = %self.id, "stub destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Service;
    use crate::types::{PROTOCOL_VERSION_3, ZoneId};

    struct EchoStub {
        owner: Weak<ObjectStub>,
        target: Arc<String>,
        interface_id: InterfaceId,
        castable_to: Option<InterfaceId>,
    }

    #[async_trait]
    impl InterfaceStub for EchoStub {
        fn interface_id(&self, _protocol_version: u64) -> InterfaceId {
            self.interface_id
        }

        async fn call(
            &self,
            _protocol_version: u64,
            _encoding: Encoding,
            _caller_channel_zone_id: CallerChannelZoneId,
            _caller_zone_id: CallerZoneId,
            method_id: MethodId,
            in_buf: &[u8],
        ) -> Result<Vec<u8>, RpcError> {
            if method_id != MethodId::new(1) {
                return Err(RpcError::InvalidMethodId);
            }
            let mut out = in_buf.to_vec();
            out.reverse();
            Ok(out)
        }

        fn cast(&self, interface_id: InterfaceId) -> Option<Arc<dyn InterfaceStub>> {
            if Some(interface_id) == self.castable_to {
                Some(Arc::new(EchoStub {
                    owner: self.owner.clone(),
                    target: self.target.clone(),
                    interface_id,
                    castable_to: None,
                }))
            } else {
                None
            }
        }

        fn object_stub(&self) -> Weak<ObjectStub> {
            self.owner.clone()
        }

        fn clone_target_any(&self) -> Box<dyn Any + Send + Sync> {
            Box::new(self.target.clone())
        }
    }

    fn make_stub(castable_to: Option<InterfaceId>) -> Arc<ObjectStub> {
        let service = Service::new("stub-test", ZoneId::new(1));
        let target = Arc::new("impl".to_string());
        let stub = ObjectStub::new(ObjectId::new(1), &service, 1);
        stub.add_interface(
            Arc::new(EchoStub {
                owner: Arc::downgrade(&stub),
                target,
                interface_id: InterfaceId::new(10),
                castable_to,
            }),
            PROTOCOL_VERSION_3,
        );
        stub
    }

    #[tokio::test]
    async fn dispatch_reaches_the_interface_stub() {
        let stub = make_stub(None);
        let out = stub
            .call(
                PROTOCOL_VERSION_3,
                Encoding::Binary,
                CallerChannelZoneId::NONE,
                CallerZoneId::new(1),
                InterfaceId::new(10),
                MethodId::new(1),
                &[1, 2, 3],
            )
            .await
            .unwrap();
        assert_eq!(out, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn unknown_interface_is_rejected() {
        let stub = make_stub(None);
        let err = stub
            .call(
                PROTOCOL_VERSION_3,
                Encoding::Binary,
                CallerChannelZoneId::NONE,
                CallerZoneId::new(1),
                InterfaceId::new(99),
                MethodId::new(1),
                &[],
            )
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::InvalidInterfaceId);
    }

    #[test]
    fn try_cast_grows_the_stub_map() {
        let stub = make_stub(Some(InterfaceId::new(20)));
        assert_eq!(stub.try_cast(InterfaceId::new(10)), Ok(()));
        assert_eq!(stub.try_cast(InterfaceId::new(20)), Ok(()));
        assert!(stub.get_interface(InterfaceId::new(20)).is_some());
        assert_eq!(stub.try_cast(InterfaceId::new(30)), Err(RpcError::InvalidCast));
    }

    #[test]
    fn reference_counts_are_independent() {
        let stub = make_stub(None);
        assert_eq!(stub.add_ref(false), 1);
        assert_eq!(stub.add_ref(false), 2);
        assert_eq!(stub.add_ref(true), 1);
        assert_eq!(stub.release(false), 2);
        assert_eq!(stub.shared_count(), 1);
        assert_eq!(stub.optimistic_count(), 1);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn release_below_zero_aborts() {
        let stub = make_stub(None);
        stub.release(false);
    }
}
