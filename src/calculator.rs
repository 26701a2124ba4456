//! The demo's hand-expanded interface: what the IDL generator would emit
//! for a one-method `calculator` interface, written out in full. The same
//! shape (glue type, proxy struct, stub struct, request/reply payloads)
//! repeats per interface in generated code.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::{Arc, Weak};

use interzone::{
    bindings, CastingInterface, Encoding, InterfaceGlue, InterfaceId, InterfaceStub, MethodId,
    ObjectProxy, ObjectStub, RpcError,
};
use interzone::{CallerChannelZoneId, CallerZoneId};

/// Fingerprint of the `calculator` method set.
pub const CALCULATOR_INTERFACE_ID: InterfaceId = InterfaceId::new(0x6a3f_9b2c_51e0_7d44);

const METHOD_ADD: MethodId = MethodId::new(1);

#[async_trait]
pub trait Calculator: CastingInterface {
    async fn add(&self, lhs: i64, rhs: i64) -> Result<i64, RpcError>;
}

#[derive(Serialize, Deserialize)]
struct AddRequest {
    lhs: i64,
    rhs: i64,
}

#[derive(Serialize, Deserialize)]
struct AddReply {
    sum: i64,
}

/// Generated glue binding the `calculator` interface into the runtime.
pub struct CalculatorGlue;

impl InterfaceGlue for CalculatorGlue {
    type Target = dyn Calculator;

    fn interface_id(_protocol_version: u64) -> InterfaceId {
        CALCULATOR_INTERFACE_ID
    }

    fn new_stub(target: Arc<dyn Calculator>, owner: &Arc<ObjectStub>) -> Arc<dyn InterfaceStub> {
        Arc::new(CalculatorStub {
            target,
            owner: Arc::downgrade(owner),
        })
    }

    fn new_proxy(object_proxy: Arc<ObjectProxy>) -> Arc<dyn Calculator> {
        Arc::new(CalculatorProxy { object_proxy })
    }
}

/// Register the interface's constructor row; generated code runs this once
/// at startup.
pub fn register() {
    bindings::register_interface::<CalculatorGlue>();
}

struct CalculatorStub {
    target: Arc<dyn Calculator>,
    owner: Weak<ObjectStub>,
}

#[async_trait]
impl InterfaceStub for CalculatorStub {
    fn interface_id(&self, protocol_version: u64) -> InterfaceId {
        CalculatorGlue::interface_id(protocol_version)
    }

    async fn call(
        &self,
        _protocol_version: u64,
        encoding: Encoding,
        _caller_channel_zone_id: CallerChannelZoneId,
        _caller_zone_id: CallerZoneId,
        method_id: MethodId,
        in_buf: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        match method_id {
            METHOD_ADD => {
                let request: AddRequest = encoding.decode(in_buf)?;
                let sum = self.target.add(request.lhs, request.rhs).await?;
                encoding.encode(&AddReply { sum })
            }
            _ => Err(RpcError::InvalidMethodId),
        }
    }

    fn cast(&self, _interface_id: InterfaceId) -> Option<Arc<dyn InterfaceStub>> {
        None
    }

    fn object_stub(&self) -> Weak<ObjectStub> {
        self.owner.clone()
    }

    fn clone_target_any(&self) -> Box<dyn Any + Send + Sync> {
        Box::new(self.target.clone())
    }
}

struct CalculatorProxy {
    object_proxy: Arc<ObjectProxy>,
}

impl CastingInterface for CalculatorProxy {
    fn query_object_proxy(&self) -> Option<Arc<ObjectProxy>> {
        Some(self.object_proxy.clone())
    }
}

#[async_trait]
impl Calculator for CalculatorProxy {
    async fn add(&self, lhs: i64, rhs: i64) -> Result<i64, RpcError> {
        let service_proxy = self.object_proxy.service_proxy();
        let encoding = service_proxy.encoding();
        let in_buf = encoding.encode(&AddRequest { lhs, rhs })?;
        let out_buf = self
            .object_proxy
            .send(
                service_proxy.remote_version(),
                encoding,
                0,
                CALCULATOR_INTERFACE_ID,
                METHOD_ADD,
                &in_buf,
            )
            .await?;
        let reply: AddReply = encoding.decode(&out_buf)?;
        Ok(reply.sum)
    }
}

/// The demo's implementation, hosted in the child zone.
pub struct CalculatorImpl;

impl CastingInterface for CalculatorImpl {}

#[async_trait]
impl Calculator for CalculatorImpl {
    async fn add(&self, lhs: i64, rhs: i64) -> Result<i64, RpcError> {
        lhs.checked_add(rhs).ok_or(RpcError::Application(1))
    }
}
