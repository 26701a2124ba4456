//! # Interzone
//!
//! An inter-zone RPC runtime for environments that straddle trust
//! boundaries. A *zone* is a unit of execution with its own address space
//! and object identity numbering; zones exchange opaque byte buffers
//! through transports, while this runtime makes remote objects look like
//! local references: calls dispatch through generated stubs, interface
//! references round-trip between zones without double-wrapping, and object
//! lifetimes are governed by a distributed reference-counting protocol that
//! stays paired under concurrent release, multi-hop routing and transport
//! loss.

pub mod bindings;
pub mod error;
pub mod marshaller;
pub mod object_proxy;
pub mod pass_through;
pub mod service;
pub mod service_proxy;
pub mod stub;
pub mod transport;
pub mod types;

pub use error::RpcError;
pub use marshaller::{
    AddRefOptions, InterfaceDescriptor, Marshaller, PostOptions, ReleaseOptions,
};
pub use object_proxy::{CastingInterface, InterfaceGlue, ObjectProxy};
pub use pass_through::PassThrough;
pub use service::{ChildService, Service, ZoneRoute};
pub use service_proxy::{ObjectProxyCreationRule, ServiceProxy};
pub use stub::{InterfaceStub, ObjectStub};
pub use transport::{
    connect_root, link_zones, InProcessTransport, Transport, TransportStatus, ZoneLink,
};
pub use types::{
    CallerChannelZoneId, CallerZoneId, DestinationChannelZoneId, DestinationZoneId, Encoding,
    InterfaceId, KnownDirectionZoneId, MethodId, ObjectId, ZoneId, LATEST_PROTOCOL_VERSION,
    PROTOCOL_VERSION_2, PROTOCOL_VERSION_3,
};

/// The current version of the runtime.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
