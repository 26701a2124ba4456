//! # Error Codes
//!
//! Every marshaller operation reports failure as a stable integer code so
//! that errors survive serialization across a zone boundary unchanged. The
//! codes are negative by default; an application whose own domain codes are
//! negative can remap the runtime's block into a positive offset region with
//! [`set_code_offset`] / [`set_codes_negative`] so the two ranges coexist.
//!
//! `OK` is always `0` and is represented in Rust by `Result::Ok`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use thiserror::Error;

static CODE_OFFSET: AtomicI32 = AtomicI32::new(0);
static CODES_NEGATIVE: AtomicBool = AtomicBool::new(true);

/// Shift the runtime's error block by `offset`. Affects every code returned
/// by [`RpcError::code`] process-wide; call once during startup, before any
/// traffic flows.
pub fn set_code_offset(offset: i32) {
    CODE_OFFSET.store(offset, Ordering::Relaxed);
}

/// Choose the sign of the runtime's error block. Defaults to negative.
pub fn set_codes_negative(negative: bool) {
    CODES_NEGATIVE.store(negative, Ordering::Relaxed);
}

/// The failure codes of the marshaller contract.
///
/// `Application` carries a user-level code produced by an implementation
/// behind a stub; the runtime passes it through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RpcError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("supplied buffer too small, retry with a larger one")]
    NeedMoreMemory,
    #[error("security violation")]
    SecurityError,
    #[error("malformed or undecodable payload")]
    InvalidData,
    #[error("transport failure")]
    TransportError,
    #[error("unknown method ordinal")]
    InvalidMethodId,
    #[error("unknown interface ordinal")]
    InvalidInterfaceId,
    #[error("object does not support the requested interface")]
    InvalidCast,
    #[error("zone does not support this operation")]
    ZoneNotSupported,
    #[error("zone has not been initialised or has been torn down")]
    ZoneNotInitialised,
    #[error("no route to the requested zone")]
    ZoneNotFound,
    #[error("object not found in the destination zone")]
    ObjectNotFound,
    #[error("application error {0}")]
    Application(i32),
}

impl RpcError {
    fn ordinal(self) -> Option<i32> {
        Some(match self {
            RpcError::OutOfMemory => 1,
            RpcError::NeedMoreMemory => 2,
            RpcError::SecurityError => 3,
            RpcError::InvalidData => 4,
            RpcError::TransportError => 5,
            RpcError::InvalidMethodId => 6,
            RpcError::InvalidInterfaceId => 7,
            RpcError::InvalidCast => 8,
            RpcError::ZoneNotSupported => 9,
            RpcError::ZoneNotInitialised => 10,
            RpcError::ZoneNotFound => 11,
            RpcError::ObjectNotFound => 12,
            RpcError::Application(_) => return None,
        })
    }

    fn from_ordinal(ordinal: i32) -> Option<Self> {
        Some(match ordinal {
            1 => RpcError::OutOfMemory,
            2 => RpcError::NeedMoreMemory,
            3 => RpcError::SecurityError,
            4 => RpcError::InvalidData,
            5 => RpcError::TransportError,
            6 => RpcError::InvalidMethodId,
            7 => RpcError::InvalidInterfaceId,
            8 => RpcError::InvalidCast,
            9 => RpcError::ZoneNotSupported,
            10 => RpcError::ZoneNotInitialised,
            11 => RpcError::ZoneNotFound,
            12 => RpcError::ObjectNotFound,
            _ => return None,
        })
    }

    /// The wire representation of this error under the current mapping.
    pub fn code(self) -> i32 {
        match self.ordinal() {
            None => match self {
                RpcError::Application(code) => code,
                _ => unreachable!(),
            },
            Some(ordinal) => {
                let shifted = CODE_OFFSET.load(Ordering::Relaxed) + ordinal;
                if CODES_NEGATIVE.load(Ordering::Relaxed) {
                    -shifted
                } else {
                    shifted
                }
            }
        }
    }

    /// Reconstruct an error from its wire code. Codes outside the runtime's
    /// block come back as `Application`; `0` is success and yields `Ok`.
    pub fn from_code(code: i32) -> Result<(), RpcError> {
        if code == 0 {
            return Ok(());
        }
        let shifted = if CODES_NEGATIVE.load(Ordering::Relaxed) {
            -code
        } else {
            code
        };
        let ordinal = shifted - CODE_OFFSET.load(Ordering::Relaxed);
        Err(Self::from_ordinal(ordinal).unwrap_or(RpcError::Application(code)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_by_default() {
        assert_eq!(RpcError::OutOfMemory.code(), -1);
        assert_eq!(RpcError::ObjectNotFound.code(), -12);
    }

    #[test]
    fn codes_round_trip() {
        for err in [
            RpcError::OutOfMemory,
            RpcError::InvalidCast,
            RpcError::ZoneNotFound,
            RpcError::ObjectNotFound,
            RpcError::Application(17),
        ] {
            assert_eq!(RpcError::from_code(err.code()), Err(err));
        }
        assert_eq!(RpcError::from_code(0), Ok(()));
    }

    #[test]
    fn unknown_codes_become_application_errors() {
        assert_eq!(RpcError::from_code(-999), Err(RpcError::Application(-999)));
    }
}
