//! # Identifier Types and Wire Encodings
//!
//! Every identifier that crosses a zone boundary is a 64-bit integer wrapped
//! in its own nominal type, so that a function taking a destination zone can
//! never silently accept a caller zone. The value `0` is reserved in all of
//! them and means "unassigned / none".
//!
//! The same zone can appear in several roles within one message (the zone a
//! call is going to, the zone it came from, the adjacent zone it was relayed
//! through), which is why the conversions between the flavours are explicit
//! methods rather than `From` impls: call sites must say which role they are
//! converting into.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};

use crate::error::RpcError;

/// Protocol version for sessions negotiated before fingerprinted ordinals.
pub const PROTOCOL_VERSION_2: u64 = 2;

/// Current protocol version.
pub const PROTOCOL_VERSION_3: u64 = 3;

/// The newest protocol version this runtime speaks.
pub const LATEST_PROTOCOL_VERSION: u64 = PROTOCOL_VERSION_3;

macro_rules! id_type {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// The reserved "unassigned" value.
            pub const NONE: Self = Self(0);

            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            pub const fn get(self) -> u64 {
                self.0
            }

            pub const fn is_none(self) -> bool {
                self.0 == 0
            }

            pub const fn is_set(self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

id_type! {
    /// The zone a service is running in.
    ZoneId
}

id_type! {
    /// The ultimate zone a message is being sent to.
    DestinationZoneId
}

id_type! {
    /// The adjacent zone a message is relayed through on its way to the
    /// destination, when the route is not direct.
    DestinationChannelZoneId
}

id_type! {
    /// The zone that originated a call.
    CallerZoneId
}

id_type! {
    /// The adjacent zone that relayed a call into this zone; a chain of
    /// zones means this can differ from the originating caller zone.
    CallerChannelZoneId
}

id_type! {
    /// A zone known to have a live route in the direction a reference is
    /// being built; used as a routing hint when synthesising return routes.
    KnownDirectionZoneId
}

id_type! {
    /// An object identity, unique within the zone that assigned it.
    ObjectId
}

id_type! {
    /// A stable 64-bit fingerprint of an interface's method set.
    InterfaceId
}

id_type! {
    /// A method ordinal within an interface.
    MethodId
}

impl ZoneId {
    pub const fn as_destination(self) -> DestinationZoneId {
        DestinationZoneId(self.0)
    }

    pub const fn as_caller(self) -> CallerZoneId {
        CallerZoneId(self.0)
    }

    pub const fn as_caller_channel(self) -> CallerChannelZoneId {
        CallerChannelZoneId(self.0)
    }

    pub const fn as_known_direction(self) -> KnownDirectionZoneId {
        KnownDirectionZoneId(self.0)
    }
}

impl DestinationZoneId {
    pub const fn as_zone(self) -> ZoneId {
        ZoneId(self.0)
    }

    pub const fn as_caller(self) -> CallerZoneId {
        CallerZoneId(self.0)
    }

    pub const fn as_channel(self) -> DestinationChannelZoneId {
        DestinationChannelZoneId(self.0)
    }
}

impl DestinationChannelZoneId {
    pub const fn as_zone(self) -> ZoneId {
        ZoneId(self.0)
    }

    pub const fn as_destination(self) -> DestinationZoneId {
        DestinationZoneId(self.0)
    }
}

impl CallerZoneId {
    pub const fn as_zone(self) -> ZoneId {
        ZoneId(self.0)
    }

    pub const fn as_destination(self) -> DestinationZoneId {
        DestinationZoneId(self.0)
    }
}

impl CallerChannelZoneId {
    pub const fn as_zone(self) -> ZoneId {
        ZoneId(self.0)
    }

    pub const fn as_destination(self) -> DestinationZoneId {
        DestinationZoneId(self.0)
    }

    pub const fn as_known_direction(self) -> KnownDirectionZoneId {
        KnownDirectionZoneId(self.0)
    }
}

impl KnownDirectionZoneId {
    pub const fn as_destination(self) -> DestinationZoneId {
        DestinationZoneId(self.0)
    }
}

/// Payload encoding negotiated per session.
///
/// The runtime itself only ever encodes interface descriptors; user payloads
/// are opaque bytes produced by generated code with the same encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// Compact binary encoding; the default.
    #[default]
    Binary,
    /// Binary encoding wrapped in zlib compression, for transports where
    /// bandwidth is dearer than CPU.
    CompressedBinary,
    /// Self-describing JSON, for debugging and cross-tooling.
    Json,
}

impl Encoding {
    /// Serialize `value` with this encoding.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, RpcError> {
        match self {
            Encoding::Binary => bincode::serialize(value).map_err(|_| RpcError::InvalidData),
            Encoding::CompressedBinary => {
                let raw = bincode::serialize(value).map_err(|_| RpcError::InvalidData)?;
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(&raw)
                    .and_then(|_| encoder.finish())
                    .map_err(|_| RpcError::InvalidData)
            }
            Encoding::Json => serde_json::to_vec(value).map_err(|_| RpcError::InvalidData),
        }
    }

    /// Deserialize a value previously produced by [`Encoding::encode`].
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, RpcError> {
        match self {
            Encoding::Binary => bincode::deserialize(bytes).map_err(|_| RpcError::InvalidData),
            Encoding::CompressedBinary => {
                let mut decoder = flate2::read::ZlibDecoder::new(bytes);
                let mut raw = Vec::new();
                decoder
                    .read_to_end(&mut raw)
                    .map_err(|_| RpcError::InvalidData)?;
                bincode::deserialize(&raw).map_err(|_| RpcError::InvalidData)
            }
            Encoding::Json => serde_json::from_slice(bytes).map_err(|_| RpcError::InvalidData),
        }
    }
}
