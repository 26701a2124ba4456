//! Transport loss: a disconnected link terminates every route through it,
//! dead proxies fail cleanly, and their destruction stays off the wire.

mod common;

use anyhow::Result;
use common::*;
use std::sync::Arc;
use interzone::{
    bindings, link_zones, ObjectProxyCreationRule, RpcError, Service, Transport, TransportStatus,
    ZoneId,
};

/// Scenario: zone A's transport to B disconnects. Calls through the dead
/// route return ZONE_NOT_FOUND, A's routing table forgets B, and dropping
/// the orphaned proxy abandons the remote count without wire traffic.
#[tokio::test]
async fn transport_drop_severs_routes() -> Result<()> {
    register_all();
    let a = Service::new("a", ZoneId::new(1));
    let b = Service::new("b", ZoneId::new(2));
    let link = link_zones(&a, &b);

    let implementation = ArithmeticImpl::new("doomed");
    let adder: Arc<dyn Adder> = implementation.clone();
    let object_id = bindings::ensure_stub::<AdderGlue>(&b, &adder)?;

    let remote = link
        .proxy_a_to_b
        .create_proxy::<AdderGlue>(object_id, ObjectProxyCreationRule::AddRefIfNew)
        .await?;
    assert_eq!(remote.add(1, 1).await?, 2);
    assert_eq!(b.get_object(object_id).unwrap().shared_count(), 1);
    assert_eq!(a.route_count(), 1);

    // A's side of the link goes down
    link.transport_a.disconnect().await;
    assert_eq!(link.transport_a.status(), TransportStatus::Disconnected);

    // the route into B is gone and calls fail cleanly
    assert_eq!(a.route_count(), 0);
    assert_eq!(remote.add(1, 1).await.unwrap_err(), RpcError::ZoneNotFound);

    // destroying the proxy issues no wire traffic; B's count is abandoned
    drop(remote);
    settle().await;
    assert_eq!(b.get_object(object_id).unwrap().shared_count(), 1);

    a.shutdown().await;
    // B still believes in the reference; its shutdown logs and abandons it
    b.shutdown().await;
    Ok(())
}

/// A proxy created optimistically observes OBJECT_NOT_FOUND once the
/// underlying shared count has drained.
#[tokio::test]
async fn optimistic_reference_does_not_keep_the_stub_alive() -> Result<()> {
    register_all();
    let a = Service::new("a", ZoneId::new(1));
    let b = Service::new("b", ZoneId::new(2));
    let link = link_zones(&a, &b);

    let implementation = ArithmeticImpl::new("fleeting");
    let adder: Arc<dyn Adder> = implementation.clone();
    let object_id = bindings::ensure_stub::<AdderGlue>(&b, &adder)?;

    // one shared holder, one optimistic observer
    let shared = link
        .proxy_a_to_b
        .create_proxy::<AdderGlue>(object_id, ObjectProxyCreationRule::AddRefIfNew)
        .await?;
    let optimistic_proxy = link
        .proxy_a_to_b
        .get_or_create_object_proxy(
            interzone::ObjectId::new(7),
            ObjectProxyCreationRule::AddRefIfNew,
            Default::default(),
            true,
        )
        .await;
    // object 7 does not exist; the optimistic acquire observes that
    assert_eq!(optimistic_proxy.unwrap_err(), RpcError::ObjectNotFound);

    let stub = b.get_object(object_id).unwrap();
    assert_eq!(stub.shared_count(), 1);
    stub.add_ref(true);
    assert_eq!(stub.optimistic_count(), 1);

    // the shared holder goes away; the stub dies despite the optimistic
    // count
    drop(shared);
    settle().await;
    assert_eq!(b.stub_count(), 0);

    // an optimistic holder arriving late finds the object gone
    let late = link
        .proxy_a_to_b
        .sp_add_ref(
            object_id,
            interzone::CallerChannelZoneId::NONE,
            interzone::AddRefOptions::OPTIMISTIC,
            Default::default(),
        )
        .await;
    assert_eq!(late.unwrap_err(), RpcError::ObjectNotFound);

    link.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}
