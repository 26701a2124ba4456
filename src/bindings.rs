//! # Generator Parameter Bindings
//!
//! Generated proxy and stub code marshals interface-typed parameters
//! through the free functions in this module. The four directions are:
//!
//! - [`proxy_bind_in_param`]: caller side, an interface passed *into* a
//!   remote call becomes a descriptor, with the references that keep the
//!   target alive while the message is in flight;
//! - [`stub_bind_in_param`]: callee side, that descriptor becomes a typed
//!   reference again;
//! - [`stub_bind_out_param`]: callee side, an interface *returned* from a
//!   call becomes a descriptor carrying a reference for the caller;
//! - [`proxy_bind_out_param`]: caller side, the returned descriptor
//!   becomes a typed reference.
//!
//! A descriptor pointing at the receiving zone itself is unwrapped to the
//! original implementation, never to a proxy-of-a-proxy.
//!
//! The module also hosts the process-wide bindings registry: one row of
//! constructor functions per interface ordinal, inserted by generated code
//! at startup, for contexts where the interface is known only by ordinal.

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::trace;

use crate::error::RpcError;
use crate::marshaller::{AddRefOptions, InterfaceDescriptor, Marshaller, ReleaseOptions};
use crate::object_proxy::CastingInterface;
use crate::object_proxy::{InterfaceGlue, ObjectProxy};
use crate::service::Service;
use crate::service_proxy::ObjectProxyCreationRule;
use crate::stub::{InterfaceStub, ObjectStub};
use crate::types::{
    CallerChannelZoneId, CallerZoneId, DestinationZoneId, InterfaceId, KnownDirectionZoneId,
    ObjectId, LATEST_PROTOCOL_VERSION,
};

/// Ensure `target` has a stub in `service`, returning its object id. The
/// same implementation always maps to the same id.
pub fn ensure_stub<G: InterfaceGlue>(
    service: &Arc<Service>,
    target: &Arc<G::Target>,
) -> Result<ObjectId, RpcError> {
    let key = G::target_key(target);
    let target = target.clone();
    service.add_lookup_stub(key, move |stub| Ok(G::new_stub(target, stub)))
}

/// Protection taken around an in-flight message that carries an interface
/// descriptor. Completing the guard after the message has been delivered
/// releases the optimistic half of the acquire/release pair.
#[must_use = "complete() must be called once the message has been delivered"]
pub struct InFlightGuard {
    service: Arc<Service>,
    descriptor: InterfaceDescriptor,
    protocol_version: u64,
    optimistic: bool,
}

impl InFlightGuard {
    pub async fn complete(self) {
        if !self.optimistic {
            return;
        }
        if let Err(err) = self
            .service
            .release(
                self.protocol_version,
                self.descriptor.destination_zone_id,
                self.descriptor.object_id,
                self.service.zone_id().as_caller(),
                ReleaseOptions::Optimistic,
            )
            .await
        {
            trace!(
                descriptor = %self.descriptor,
                error = %err,
                "optimistic in-flight release failed"
            );
        }
    }
}

/// Caller side: marshal an interface passed as an in-parameter to a call
/// into `destination`.
///
/// A local implementation gets (or reuses) a stub and a shared reference
/// attributed to the receiving zone. A reference that is itself a proxy is
/// marshalled as a descriptor of the object's real home; an optimistic
/// reference protects it until the guard completes, while the receiving
/// zone acquires its own shared reference with route building enabled.
pub async fn proxy_bind_in_param<G: InterfaceGlue>(
    protocol_version: u64,
    service: &Arc<Service>,
    destination: DestinationZoneId,
    target: &Arc<G::Target>,
) -> Result<(InterfaceDescriptor, InFlightGuard), RpcError> {
    if let Some(object_proxy) = target.query_object_proxy() {
        let descriptor = object_proxy.descriptor();
        // pin the object for the duration of the flight
        service
            .add_ref(
                protocol_version,
                descriptor.destination_zone_id.as_channel(),
                descriptor.destination_zone_id,
                descriptor.object_id,
                CallerChannelZoneId::NONE,
                service.zone_id().as_caller(),
                KnownDirectionZoneId::NONE,
                AddRefOptions::OPTIMISTIC,
            )
            .await?;
        // the receiving zone's own reference, with both routes built
        service
            .add_ref(
                protocol_version,
                descriptor.destination_zone_id.as_channel(),
                descriptor.destination_zone_id,
                descriptor.object_id,
                service.zone_id().as_caller_channel(),
                destination.as_caller(),
                service.zone_id().as_known_direction(),
                AddRefOptions::NORMAL
                    | AddRefOptions::BUILD_DESTINATION_ROUTE
                    | AddRefOptions::BUILD_CALLER_ROUTE,
            )
            .await?;
        return Ok((
            descriptor,
            InFlightGuard {
                service: service.clone(),
                descriptor,
                protocol_version,
                optimistic: true,
            },
        ));
    }

    let object_id = ensure_stub::<G>(service, target)?;
    let descriptor = InterfaceDescriptor::new(object_id, service.zone_id().as_destination());
    service
        .add_ref(
            protocol_version,
            descriptor.destination_zone_id.as_channel(),
            descriptor.destination_zone_id,
            object_id,
            CallerChannelZoneId::NONE,
            destination.as_caller(),
            KnownDirectionZoneId::NONE,
            AddRefOptions::NORMAL | AddRefOptions::BUILD_CALLER_ROUTE,
        )
        .await?;
    Ok((
        descriptor,
        InFlightGuard {
            service: service.clone(),
            descriptor,
            protocol_version,
            optimistic: false,
        },
    ))
}

/// Callee side: marshal an interface returned from a call back to
/// `caller_zone`. The descriptor carries one shared reference for the
/// caller.
pub async fn stub_bind_out_param<G: InterfaceGlue>(
    protocol_version: u64,
    service: &Arc<Service>,
    caller_channel_zone_id: CallerChannelZoneId,
    caller_zone_id: CallerZoneId,
    target: &Arc<G::Target>,
) -> Result<InterfaceDescriptor, RpcError> {
    if let Some(object_proxy) = target.query_object_proxy() {
        // returning someone else's object: point the caller at its home
        let descriptor = object_proxy.descriptor();
        service
            .add_ref(
                protocol_version,
                descriptor.destination_zone_id.as_channel(),
                descriptor.destination_zone_id,
                descriptor.object_id,
                caller_channel_zone_id,
                caller_zone_id,
                service.zone_id().as_known_direction(),
                AddRefOptions::NORMAL
                    | AddRefOptions::BUILD_DESTINATION_ROUTE
                    | AddRefOptions::BUILD_CALLER_ROUTE,
            )
            .await?;
        return Ok(descriptor);
    }

    let object_id = ensure_stub::<G>(service, target)?;
    let descriptor = InterfaceDescriptor::new(object_id, service.zone_id().as_destination());
    service
        .add_ref(
            protocol_version,
            descriptor.destination_zone_id.as_channel(),
            descriptor.destination_zone_id,
            object_id,
            caller_channel_zone_id,
            caller_zone_id,
            KnownDirectionZoneId::NONE,
            AddRefOptions::NORMAL | AddRefOptions::BUILD_CALLER_ROUTE,
        )
        .await?;
    Ok(descriptor)
}

/// Turn a descriptor into a typed reference inside `service`'s zone.
///
/// `via` is the zone the descriptor arrived through, used as a routing hint
/// when the destination has no route yet. `carries_ref` states whether a
/// wire reference accompanies the descriptor (out-params and in-params do;
/// a bare lookup does not).
pub async fn demarshall_interface_proxy<G: InterfaceGlue>(
    protocol_version: u64,
    service: &Arc<Service>,
    descriptor: InterfaceDescriptor,
    via: DestinationZoneId,
    carries_ref: bool,
) -> Result<Arc<G::Target>, RpcError> {
    if descriptor.is_null() {
        return Err(RpcError::InvalidData);
    }

    if descriptor.destination_zone_id == service.zone_id().as_destination() {
        // the descriptor points home: unwrap to the original implementation
        let stub = service
            .get_object(descriptor.object_id)
            .ok_or(RpcError::ObjectNotFound)?;
        let unwrapped = stub
            .try_cast(G::interface_id(protocol_version))
            .and_then(|_| {
                let any = stub.clone_target_any().ok_or(RpcError::ObjectNotFound)?;
                G::target_from_any(any.as_ref()).ok_or(RpcError::InvalidCast)
            });
        let target = match unwrapped {
            Ok(target) => target,
            Err(err) => {
                if carries_ref {
                    // do not strand the reference the descriptor carried
                    let _ = service
                        .release(
                            protocol_version,
                            descriptor.destination_zone_id,
                            descriptor.object_id,
                            service.zone_id().as_caller(),
                            ReleaseOptions::Normal,
                        )
                        .await;
                }
                return Err(err);
            }
        };
        if carries_ref {
            // the wire reference is redundant now that a local strong
            // reference exists
            service
                .release(
                    protocol_version,
                    descriptor.destination_zone_id,
                    descriptor.object_id,
                    service.zone_id().as_caller(),
                    ReleaseOptions::Normal,
                )
                .await?;
        }
        return Ok(target);
    }

    let route = service.ensure_route(
        descriptor.destination_zone_id,
        service.zone_id().as_caller(),
        &[via],
    )?;
    let rule = if carries_ref {
        ObjectProxyCreationRule::ReleaseIfNotNew
    } else {
        ObjectProxyCreationRule::AddRefIfNew
    };
    let object_proxy = route
        .get_or_create_object_proxy(
            descriptor.object_id,
            rule,
            KnownDirectionZoneId::new(via.get()),
            false,
        )
        .await?;
    object_proxy.query_interface::<G>(false).await
}

/// Callee side: a descriptor received as an in-parameter becomes a typed
/// reference. The sender attributed a reference to this zone.
pub async fn stub_bind_in_param<G: InterfaceGlue>(
    protocol_version: u64,
    service: &Arc<Service>,
    caller_channel_zone_id: CallerChannelZoneId,
    caller_zone_id: CallerZoneId,
    descriptor: InterfaceDescriptor,
) -> Result<Arc<G::Target>, RpcError> {
    let via = if caller_channel_zone_id.is_set() {
        caller_channel_zone_id.as_destination()
    } else {
        caller_zone_id.as_destination()
    };
    demarshall_interface_proxy::<G>(protocol_version, service, descriptor, via, true).await
}

/// Caller side: a descriptor returned from a call becomes a typed
/// reference. The callee attributed a reference to this zone.
pub async fn proxy_bind_out_param<G: InterfaceGlue>(
    protocol_version: u64,
    service: &Arc<Service>,
    via: DestinationZoneId,
    descriptor: InterfaceDescriptor,
) -> Result<Arc<G::Target>, RpcError> {
    demarshall_interface_proxy::<G>(protocol_version, service, descriptor, via, true).await
}

/// One registry row per interface: constructors the runtime can call when
/// it only knows the ordinal. Generated code inserts its row at startup.
#[derive(Clone, Copy)]
pub struct InterfaceBindings {
    pub interface_id: fn(u64) -> InterfaceId,
    pub create_stub:
        fn(&(dyn Any + Send + Sync), &Arc<ObjectStub>) -> Option<Arc<dyn InterfaceStub>>,
    pub create_proxy: fn(Arc<ObjectProxy>) -> Box<dyn Any + Send + Sync>,
}

fn registry() -> &'static RwLock<HashMap<InterfaceId, InterfaceBindings>> {
    static REGISTRY: OnceLock<RwLock<HashMap<InterfaceId, InterfaceBindings>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Insert (or refresh) the registry row for `G`. Idempotent.
pub fn register_interface<G: InterfaceGlue>() {
    let row = InterfaceBindings {
        interface_id: G::interface_id,
        create_stub: |any, owner| {
            G::target_from_any(any).map(|target| G::new_stub(target, owner))
        },
        create_proxy: |object_proxy| Box::new(G::new_proxy(object_proxy)),
    };
    registry()
        .write()
        .insert(G::interface_id(LATEST_PROTOCOL_VERSION), row);
}

/// The registry row for `interface_id`, if generated code registered one.
pub fn lookup_interface(interface_id: InterfaceId) -> Option<InterfaceBindings> {
    registry().read().get(&interface_id).copied()
}
