//! # The Marshaller Contract
//!
//! Every routing element in the runtime (the per-zone [`Service`], the
//! per-destination [`ServiceProxy`], a [`PassThrough`] bridge, and every
//! transport) speaks the same five-operation contract: `send`, `post`,
//! `try_cast`, `add_ref` and `release`. A message entering a zone is handed
//! to whichever marshaller is registered for its destination, which either
//! dispatches it locally or forwards it one hop closer.
//!
//! All five operations are suspendable: only the transport boundary actually
//! blocks, and implementations must never hold a lock across a call into
//! another marshaller.
//!
//! [`Service`]: crate::service::Service
//! [`ServiceProxy`]: crate::service_proxy::ServiceProxy
//! [`PassThrough`]: crate::pass_through::PassThrough

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr};

use crate::error::RpcError;
use crate::types::{
    CallerChannelZoneId, CallerZoneId, DestinationChannelZoneId, DestinationZoneId, Encoding,
    InterfaceId, KnownDirectionZoneId, MethodId, ObjectId,
};

/// Bitset controlling how an `add_ref` acquires its reference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRefOptions(u8);

impl AddRefOptions {
    /// An ordinary shared increment over an existing route.
    pub const NORMAL: Self = Self(0x1);
    /// Unidirectional: no response route back to the caller is assumed to
    /// exist, so the receiving service may synthesise one to the destination.
    pub const BUILD_DESTINATION_ROUTE: Self = Self(0x2);
    /// Unidirectional in the other sense: prepare reference counts and a
    /// route in the reverse (caller) direction.
    pub const BUILD_CALLER_ROUTE: Self = Self(0x4);
    /// A weak reference that protects an in-flight message without keeping
    /// the stub alive.
    pub const OPTIMISTIC: Self = Self(0x8);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for AddRefOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for AddRefOptions {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Which counter a `release` reverses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseOptions {
    /// Release a shared reference.
    #[default]
    Normal,
    /// Release an optimistic reference.
    Optimistic,
}

/// Fire-and-forget notification kinds carried by `post`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostOptions {
    /// The caller zone is shutting down; recipients drop every proxy routed
    /// into it and abandon the associated reference counts.
    ZoneTerminating,
}

/// The portable handle passed on the wire when an interface is marshalled.
///
/// Two fields are enough for the receiver to locate, or build, the right
/// object proxy in its own address space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub object_id: ObjectId,
    pub destination_zone_id: DestinationZoneId,
}

impl InterfaceDescriptor {
    pub const fn new(object_id: ObjectId, destination_zone_id: DestinationZoneId) -> Self {
        Self {
            object_id,
            destination_zone_id,
        }
    }

    /// A descriptor carrying no interface at all (a null pointer crossed
    /// the boundary).
    pub const fn null() -> Self {
        Self {
            object_id: ObjectId::NONE,
            destination_zone_id: DestinationZoneId::NONE,
        }
    }

    pub const fn is_null(self) -> bool {
        self.object_id.is_none() && self.destination_zone_id.is_none()
    }
}

impl fmt::Display for InterfaceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "object {} in zone {}",
            self.object_id, self.destination_zone_id
        )
    }
}

/// The contract implemented by everything that can route a message.
#[async_trait]
pub trait Marshaller: Send + Sync {
    /// Synchronous request/response. Dispatches `method_id` on `interface_id`
    /// of `object_id` in `destination_zone_id` and returns the reply payload.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<Vec<u8>, RpcError>;

    /// Fire-and-forget notification. No reply, and no error reaches the
    /// originator; a failed post is logged and dropped.
    #[allow(clippy::too_many_arguments)]
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
    );

    /// Ask whether `object_id` supports `interface_id`. `Ok(())` means the
    /// cast is valid; an unsupported interface is `InvalidCast`.
    async fn try_cast(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        interface_id: InterfaceId,
    ) -> Result<(), RpcError>;

    /// Acquire a reference for `caller_zone_id` on `object_id` in
    /// `destination_zone_id`, building routes along the way as `options`
    /// dictates. Returns the resulting reference count as observed at the
    /// point the increment landed.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<u64, RpcError>;

    /// Reverse one `add_ref`. Returns the remaining reference count.
    async fn release(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        caller_zone_id: CallerZoneId,
        options: ReleaseOptions,
    ) -> Result<u64, RpcError>;
}
