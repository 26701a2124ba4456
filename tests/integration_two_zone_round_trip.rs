//! Two linked zones: remote calls, reference pairing on teardown, interface
//! casting over the wire, descriptor round-trips and racing demarshals.

mod common;

use anyhow::Result;
use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use interzone::{
    bindings, link_zones, AddRefOptions, CallerChannelZoneId, InterfaceDescriptor, Marshaller,
    ObjectId, ObjectProxyCreationRule, RpcError, Service, ZoneId, LATEST_PROTOCOL_VERSION,
};

/// Scenario: zone A exposes an adder as object 1, zone B acquires a proxy
/// with a route-building add_ref, calls it, and dropping the proxy issues
/// exactly one release back at A.
#[tokio::test]
async fn two_zone_ping() -> Result<()> {
    register_all();
    let a = Service::new("a", ZoneId::new(1));
    let b = Service::new("b", ZoneId::new(2));
    let link = link_zones(&a, &b);

    let implementation = ArithmeticImpl::new("zone-a adder");
    let adder: Arc<dyn Adder> = implementation.clone();
    let object_id = bindings::ensure_stub::<AdderGlue>(&a, &adder)?;
    assert_eq!(object_id, ObjectId::new(1));

    let remote = link
        .proxy_b_to_a
        .create_proxy::<AdderGlue>(object_id, ObjectProxyCreationRule::AddRefIfNew)
        .await?;
    assert_eq!(a.get_object(object_id).unwrap().shared_count(), 1);

    assert_eq!(remote.add(10, 20).await?, 30);
    assert_eq!(implementation.calls.load(Ordering::Relaxed), 1);

    // exactly one release lands at A and its maps drain
    drop(remote);
    settle().await;
    assert_eq!(a.stub_count(), 0);
    assert_eq!(a.wrapped_count(), 0);

    link.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

/// Scenario: B holds the adder interface; a query for the describer
/// interface makes one wire try_cast, succeeds, and is afterwards served
/// from the cache.
#[tokio::test]
async fn interface_cast_is_cached() -> Result<()> {
    register_all();
    let a = Service::new("a", ZoneId::new(1));
    let b = Service::new("b", ZoneId::new(2));
    let link = link_zones(&a, &b);

    let implementation = ArithmeticImpl::new("castable");
    let adder: Arc<dyn Adder> = implementation.clone();
    let object_id = bindings::ensure_stub::<AdderGlue>(&a, &adder)?;

    let remote = link
        .proxy_b_to_a
        .create_proxy::<AdderGlue>(object_id, ObjectProxyCreationRule::AddRefIfNew)
        .await?;
    let object_proxy = remote.query_object_proxy().expect("remote is a proxy");

    // the stub side only dispatches the adder so far
    assert!(a
        .get_object(object_id)
        .unwrap()
        .get_interface(DESCRIBER_INTERFACE_ID)
        .is_none());

    let describer = object_proxy.query_interface::<DescriberGlue>(true).await?;
    assert_eq!(describer.describe().await?, "castable");

    // the wire cast grew the remote stub map
    assert!(a
        .get_object(object_id)
        .unwrap()
        .get_interface(DESCRIBER_INTERFACE_ID)
        .is_some());

    // a second query returns the cached proxy without another wire call
    let describer_again = object_proxy.query_interface::<DescriberGlue>(true).await?;
    assert!(same_object(&describer, &describer_again));

    drop(describer);
    drop(describer_again);
    drop(remote);
    drop(object_proxy);
    settle().await;
    assert_eq!(a.stub_count(), 0);

    link.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

/// Scenario: a cast to an interface the object does not implement fails
/// with INVALID_CAST, caches nothing, and fails identically on retry.
#[tokio::test]
async fn unknown_cast_is_not_cached() -> Result<()> {
    register_all();
    let a = Service::new("a", ZoneId::new(1));
    let b = Service::new("b", ZoneId::new(2));
    let link = link_zones(&a, &b);

    let implementation = ArithmeticImpl::new("no-absent");
    let adder: Arc<dyn Adder> = implementation.clone();
    let object_id = bindings::ensure_stub::<AdderGlue>(&a, &adder)?;

    let remote = link
        .proxy_b_to_a
        .create_proxy::<AdderGlue>(object_id, ObjectProxyCreationRule::AddRefIfNew)
        .await?;
    let object_proxy = remote.query_object_proxy().expect("remote is a proxy");

    let cached_before = object_proxy.proxy_count();
    let err = object_proxy
        .query_interface::<AbsentGlue>(true)
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::InvalidCast);
    assert_eq!(object_proxy.proxy_count(), cached_before);

    // the retry performs the wire check again and fails the same way
    let err = object_proxy
        .query_interface::<AbsentGlue>(true)
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::InvalidCast);

    drop(remote);
    drop(object_proxy);
    settle().await;

    link.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

/// Round-trip law: a proxy marshalled back to the object's home zone
/// demarshals to the original implementation, not a proxy chain.
#[tokio::test]
async fn descriptor_round_trip_unwraps() -> Result<()> {
    register_all();
    let a = Service::new("a", ZoneId::new(1));
    let b = Service::new("b", ZoneId::new(2));
    let link = link_zones(&a, &b);

    let implementation = ArithmeticImpl::new("boomerang");
    let adder: Arc<dyn Adder> = implementation.clone();
    let object_id = bindings::ensure_stub::<AdderGlue>(&a, &adder)?;

    let remote = link
        .proxy_b_to_a
        .create_proxy::<AdderGlue>(object_id, ObjectProxyCreationRule::AddRefIfNew)
        .await?;

    // B passes its proxy back to A as an in-parameter
    let (descriptor, guard) = bindings::proxy_bind_in_param::<AdderGlue>(
        LATEST_PROTOCOL_VERSION,
        &b,
        a.zone_id().as_destination(),
        &remote,
    )
    .await?;
    assert_eq!(descriptor.destination_zone_id, a.zone_id().as_destination());
    assert_eq!(descriptor.object_id, object_id);

    // A unwraps the descriptor to the original implementation
    let unwrapped = bindings::stub_bind_in_param::<AdderGlue>(
        LATEST_PROTOCOL_VERSION,
        &a,
        CallerChannelZoneId::NONE,
        b.zone_id().as_caller(),
        descriptor,
    )
    .await?;
    guard.complete().await;

    assert!(same_object(&unwrapped, &adder));
    assert!(unwrapped.query_object_proxy().is_none());
    assert_eq!(unwrapped.add(3, 4).await?, 7);

    // only B's original reference remains
    assert_eq!(a.get_object(object_id).unwrap().shared_count(), 1);
    assert_eq!(a.get_object(object_id).unwrap().optimistic_count(), 0);

    drop(unwrapped);
    drop(remote);
    settle().await;
    assert_eq!(a.stub_count(), 0);

    link.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

/// Scenario: two tasks in B demarshal the same descriptor concurrently,
/// each carrying its own wire reference. Exactly one object proxy exists
/// afterwards, and teardown issues as many releases as add_refs landed.
#[tokio::test]
async fn racing_demarshals_share_one_proxy() -> Result<()> {
    register_all();
    let a = Service::new("a", ZoneId::new(1));
    let b = Service::new("b", ZoneId::new(2));
    let link = link_zones(&a, &b);

    let implementation = ArithmeticImpl::new("race");
    let adder: Arc<dyn Adder> = implementation.clone();
    let object_id = bindings::ensure_stub::<AdderGlue>(&a, &adder)?;

    // the sender bound one reference per descriptor copy
    for _ in 0..2 {
        a.add_ref(
            LATEST_PROTOCOL_VERSION,
            Default::default(),
            a.zone_id().as_destination(),
            object_id,
            CallerChannelZoneId::NONE,
            b.zone_id().as_caller(),
            Default::default(),
            AddRefOptions::NORMAL | AddRefOptions::BUILD_CALLER_ROUTE,
        )
        .await?;
    }
    assert_eq!(a.get_object(object_id).unwrap().shared_count(), 2);

    let descriptor = InterfaceDescriptor::new(object_id, a.zone_id().as_destination());
    let (first, second) = tokio::join!(
        bindings::demarshall_interface_proxy::<AdderGlue>(
            LATEST_PROTOCOL_VERSION,
            &b,
            descriptor,
            a.zone_id().as_destination(),
            true,
        ),
        bindings::demarshall_interface_proxy::<AdderGlue>(
            LATEST_PROTOCOL_VERSION,
            &b,
            descriptor,
            a.zone_id().as_destination(),
            true,
        ),
    );
    let first = first?;
    let second = second?;
    settle().await;

    // one proxy, one surviving wire reference
    let first_proxy = first.query_object_proxy().expect("proxy");
    let second_proxy = second.query_object_proxy().expect("proxy");
    assert!(Arc::ptr_eq(&first_proxy, &second_proxy));
    assert_eq!(a.get_object(object_id).unwrap().shared_count(), 1);

    assert_eq!(first.add(20, 22).await?, 42);

    drop(first);
    drop(second);
    drop(first_proxy);
    drop(second_proxy);
    settle().await;
    assert_eq!(a.stub_count(), 0);

    link.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}
