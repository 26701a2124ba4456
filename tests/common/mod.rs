//! Hand-expanded interface glue standing in for generator output.
//!
//! The tests exercise a small interface family: `adder` and `describer`,
//! both implemented by [`ArithmeticImpl`], and `absent`, which nothing
//! implements; the negative-cast cases need an interface that is valid on
//! the wire but unsupported by the object.

#![allow(dead_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use interzone::{
    bindings, CallerChannelZoneId, CallerZoneId, CastingInterface, Encoding, InterfaceGlue,
    InterfaceId, InterfaceStub, MethodId, ObjectProxy, ObjectStub, RpcError,
};

pub const ADDER_INTERFACE_ID: InterfaceId = InterfaceId::new(0x41dd_e201_77aa_0001);
pub const DESCRIBER_INTERFACE_ID: InterfaceId = InterfaceId::new(0xde5c_1b02_77aa_0002);
pub const ABSENT_INTERFACE_ID: InterfaceId = InterfaceId::new(0xab5e_0003_77aa_0003);

pub const METHOD_ADD: MethodId = MethodId::new(1);
const METHOD_DESCRIBE: MethodId = MethodId::new(1);
const METHOD_POKE: MethodId = MethodId::new(1);

/// Payload helpers for tests that drive the dispatch path with raw bytes.
pub fn encode_add(encoding: Encoding, lhs: i32, rhs: i32) -> Result<Vec<u8>, RpcError> {
    encoding.encode(&AddRequest { lhs, rhs })
}

pub fn decode_sum(encoding: Encoding, bytes: &[u8]) -> Result<i32, RpcError> {
    encoding.decode(bytes)
}

/// Data-pointer identity for `Arc`s to possibly-unsized targets.
pub fn same_object<T: ?Sized, U: ?Sized>(a: &Arc<T>, b: &Arc<U>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Let spawned release tasks drain before asserting on counts.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Insert every test interface into the bindings registry. Idempotent.
pub fn register_all() {
    bindings::register_interface::<AdderGlue>();
    bindings::register_interface::<DescriberGlue>();
    bindings::register_interface::<AbsentGlue>();
}

#[async_trait]
pub trait Adder: CastingInterface {
    async fn add(&self, lhs: i32, rhs: i32) -> Result<i32, RpcError>;
}

#[async_trait]
pub trait Describer: CastingInterface {
    async fn describe(&self) -> Result<String, RpcError>;
}

#[async_trait]
pub trait Absent: CastingInterface {
    async fn poke(&self) -> Result<(), RpcError>;
}

impl std::fmt::Debug for dyn Absent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn Absent")
    }
}

/// The test implementation: supports `adder` and `describer`, not `absent`.
pub struct ArithmeticImpl {
    pub label: String,
    pub calls: AtomicU32,
}

impl ArithmeticImpl {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            calls: AtomicU32::new(0),
        })
    }
}

impl CastingInterface for ArithmeticImpl {
    fn query_interface_any(
        self: Arc<Self>,
        interface_id: InterfaceId,
    ) -> Option<Box<dyn Any + Send + Sync>> {
        if interface_id == ADDER_INTERFACE_ID {
            let target: Arc<dyn Adder> = self;
            Some(Box::new(target))
        } else if interface_id == DESCRIBER_INTERFACE_ID {
            let target: Arc<dyn Describer> = self;
            Some(Box::new(target))
        } else {
            None
        }
    }
}

#[async_trait]
impl Adder for ArithmeticImpl {
    async fn add(&self, lhs: i32, rhs: i32) -> Result<i32, RpcError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        lhs.checked_add(rhs).ok_or(RpcError::Application(1))
    }
}

#[async_trait]
impl Describer for ArithmeticImpl {
    async fn describe(&self) -> Result<String, RpcError> {
        Ok(self.label.clone())
    }
}

#[derive(Serialize, Deserialize)]
struct AddRequest {
    lhs: i32,
    rhs: i32,
}

/// Cross-cast through the implementation's advertised interfaces plus the
/// bindings registry; the shape every generated stub shares.
fn registry_cast<T: ?Sized + CastingInterface>(
    target: Arc<T>,
    owner: &Weak<ObjectStub>,
    interface_id: InterfaceId,
) -> Option<Arc<dyn InterfaceStub>> {
    let any = target.query_interface_any(interface_id)?;
    let row = bindings::lookup_interface(interface_id)?;
    let owner = owner.upgrade()?;
    (row.create_stub)(any.as_ref(), &owner)
}

// ---------------------------------------------------------------------------
// adder

pub struct AdderGlue;

impl InterfaceGlue for AdderGlue {
    type Target = dyn Adder;

    fn interface_id(_protocol_version: u64) -> InterfaceId {
        ADDER_INTERFACE_ID
    }

    fn new_stub(target: Arc<dyn Adder>, owner: &Arc<ObjectStub>) -> Arc<dyn InterfaceStub> {
        Arc::new(AdderStub {
            target,
            owner: Arc::downgrade(owner),
        })
    }

    fn new_proxy(object_proxy: Arc<ObjectProxy>) -> Arc<dyn Adder> {
        Arc::new(AdderProxy { object_proxy })
    }
}

struct AdderStub {
    target: Arc<dyn Adder>,
    owner: Weak<ObjectStub>,
}

#[async_trait]
impl InterfaceStub for AdderStub {
    fn interface_id(&self, _protocol_version: u64) -> InterfaceId {
        ADDER_INTERFACE_ID
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
                encoding.encode(&sum)
            }
            _ => Err(RpcError::InvalidMethodId),
        }
    }

    fn cast(&self, interface_id: InterfaceId) -> Option<Arc<dyn InterfaceStub>> {
        registry_cast(self.target.clone(), &self.owner, interface_id)
    }

    fn object_stub(&self) -> Weak<ObjectStub> {
        self.owner.clone()
    }

    fn clone_target_any(&self) -> Box<dyn Any + Send + Sync> {
        Box::new(self.target.clone())
    }
}

pub struct AdderProxy {
    object_proxy: Arc<ObjectProxy>,
}

impl CastingInterface for AdderProxy {
    fn query_object_proxy(&self) -> Option<Arc<ObjectProxy>> {
        Some(self.object_proxy.clone())
    }
}

#[async_trait]
impl Adder for AdderProxy {
    async fn add(&self, lhs: i32, rhs: i32) -> Result<i32, RpcError> {
        let service_proxy = self.object_proxy.service_proxy();
        let encoding = service_proxy.encoding();
        let in_buf = encoding.encode(&AddRequest { lhs, rhs })?;
        let out_buf = self
            .object_proxy
            .send(
                service_proxy.remote_version(),
                encoding,
                0,
                ADDER_INTERFACE_ID,
                METHOD_ADD,
                &in_buf,
            )
            .await?;
        encoding.decode(&out_buf)
    }
}

// ---------------------------------------------------------------------------
// describer

pub struct DescriberGlue;

impl InterfaceGlue for DescriberGlue {
    type Target = dyn Describer;

    fn interface_id(_protocol_version: u64) -> InterfaceId {
        DESCRIBER_INTERFACE_ID
    }

    fn new_stub(target: Arc<dyn Describer>, owner: &Arc<ObjectStub>) -> Arc<dyn InterfaceStub> {
        Arc::new(DescriberStub {
            target,
            owner: Arc::downgrade(owner),
        })
    }

    fn new_proxy(object_proxy: Arc<ObjectProxy>) -> Arc<dyn Describer> {
        Arc::new(DescriberProxy { object_proxy })
    }
}

struct DescriberStub {
    target: Arc<dyn Describer>,
    owner: Weak<ObjectStub>,
}

#[async_trait]
impl InterfaceStub for DescriberStub {
    fn interface_id(&self, _protocol_version: u64) -> InterfaceId {
        DESCRIBER_INTERFACE_ID
    }

    async fn call(
        &self,
        _protocol_version: u64,
        encoding: Encoding,
        _caller_channel_zone_id: CallerChannelZoneId,
        _caller_zone_id: CallerZoneId,
        method_id: MethodId,
        _in_buf: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        match method_id {
            METHOD_DESCRIBE => {
                let description = self.target.describe().await?;
                encoding.encode(&description)
            }
            _ => Err(RpcError::InvalidMethodId),
        }
    }

    fn cast(&self, interface_id: InterfaceId) -> Option<Arc<dyn InterfaceStub>> {
        registry_cast(self.target.clone(), &self.owner, interface_id)
    }

    fn object_stub(&self) -> Weak<ObjectStub> {
        self.owner.clone()
    }

    fn clone_target_any(&self) -> Box<dyn Any + Send + Sync> {
        Box::new(self.target.clone())
    }
}

pub struct DescriberProxy {
    object_proxy: Arc<ObjectProxy>,
}

impl CastingInterface for DescriberProxy {
    fn query_object_proxy(&self) -> Option<Arc<ObjectProxy>> {
        Some(self.object_proxy.clone())
    }
}

#[async_trait]
impl Describer for DescriberProxy {
    async fn describe(&self) -> Result<String, RpcError> {
        let service_proxy = self.object_proxy.service_proxy();
        let encoding = service_proxy.encoding();
        let out_buf = self
            .object_proxy
            .send(
                service_proxy.remote_version(),
                encoding,
                0,
                DESCRIBER_INTERFACE_ID,
                METHOD_DESCRIBE,
                &[],
            )
            .await?;
        encoding.decode(&out_buf)
    }
}

// ---------------------------------------------------------------------------
// absent: declared, registered, implemented by nothing

pub struct AbsentGlue;

impl InterfaceGlue for AbsentGlue {
    type Target = dyn Absent;

    fn interface_id(_protocol_version: u64) -> InterfaceId {
        ABSENT_INTERFACE_ID
    }

    fn new_stub(target: Arc<dyn Absent>, owner: &Arc<ObjectStub>) -> Arc<dyn InterfaceStub> {
        Arc::new(AbsentStub {
            target,
            owner: Arc::downgrade(owner),
        })
    }

    fn new_proxy(object_proxy: Arc<ObjectProxy>) -> Arc<dyn Absent> {
        Arc::new(AbsentProxy { object_proxy })
    }
}

struct AbsentStub {
    target: Arc<dyn Absent>,
    owner: Weak<ObjectStub>,
}

#[async_trait]
impl InterfaceStub for AbsentStub {
    fn interface_id(&self, _protocol_version: u64) -> InterfaceId {
        ABSENT_INTERFACE_ID
    }

    async fn call(
        &self,
        _protocol_version: u64,
        _encoding: Encoding,
        _caller_channel_zone_id: CallerChannelZoneId,
        _caller_zone_id: CallerZoneId,
        method_id: MethodId,
        _in_buf: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        match method_id {
            METHOD_POKE => {
                self.target.poke().await?;
                Ok(Vec::new())
            }
            _ => Err(RpcError::InvalidMethodId),
        }
    }

    fn cast(&self, interface_id: InterfaceId) -> Option<Arc<dyn InterfaceStub>> {
        registry_cast(self.target.clone(), &self.owner, interface_id)
    }

    fn object_stub(&self) -> Weak<ObjectStub> {
        self.owner.clone()
    }

    fn clone_target_any(&self) -> Box<dyn Any + Send + Sync> {
        Box::new(self.target.clone())
    }
}

struct AbsentProxy {
    object_proxy: Arc<ObjectProxy>,
}

impl CastingInterface for AbsentProxy {
    fn query_object_proxy(&self) -> Option<Arc<ObjectProxy>> {
        Some(self.object_proxy.clone())
    }
}

#[async_trait]
impl Absent for AbsentProxy {
    async fn poke(&self) -> Result<(), RpcError> {
        let service_proxy = self.object_proxy.service_proxy();
        let encoding = service_proxy.encoding();
        self.object_proxy
            .send(
                service_proxy.remote_version(),
                encoding,
                0,
                ABSENT_INTERFACE_ID,
                METHOD_POKE,
                &[],
            )
            .await?;
        Ok(())
    }
}
