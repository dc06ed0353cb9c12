//! LE Audio GATT profile services for an async Rust BLE host.
//!
//! Implements the server role of the Volume Control Service (VCS), Volume
//! Offset Control Service (VOCS), Audio Input Control Service (AICS),
//! Audio Stream Control Service (ASCS) and Coordinated Set Identification
//! Service (CSIS). The host stack owns the attribute table and transport;
//! it routes characteristic reads and writes into the service objects and
//! implements the narrow capability traits in [`host`] for notifications,
//! bonding lookups, connection enumeration and crypto.
//!
//! All services are plain objects guarded by an
//! `embassy_sync::blocking_mutex` and are safe to drive from the host's
//! serialized callback context. None of the entry points block; outbound
//! notifications are fire-and-forget.
#![no_std]
#![allow(async_fn_in_trait)]

use host::CryptoError;
use types::AttErrorCode;

// This mod MUST go first, so that the others see its macros.
mod fmt;

pub mod codec;

mod counter;
mod cursor;

pub mod aics;
pub mod ascs;
pub mod channel;
pub mod csis;
pub mod host;
pub mod response;
pub mod types;
pub mod vcs;
pub mod vocs;

#[cfg(test)]
pub(crate) mod mock;

/// Capacity of audio input / output description strings.
pub const DESCRIPTION_MAX: usize = 32;
/// Capacity of a stored codec specific configuration.
pub const CODEC_CONFIG_MAX: usize = 32;
/// Capacity of stored ASE metadata.
pub const METADATA_MAX: usize = 32;

pub(crate) const ASE_STATUS_MAX: usize = 64;

/// Errors returned by the host-facing service APIs.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No matching resource.
    NotFound,
    /// The instance pool has no free slot left.
    NoFreeInstance,
    /// A parameter was outside its valid range.
    InvalidParameter,
    /// The operation failed with an ATT protocol error.
    Gatt(AttErrorCode),
    /// A crypto primitive failed.
    Crypto(CryptoError),
    /// Encoding or decoding failed.
    Codec(codec::Error),
}

impl From<AttErrorCode> for Error {
    fn from(error: AttErrorCode) -> Self {
        Self::Gatt(error)
    }
}

impl From<CryptoError> for Error {
    fn from(error: CryptoError) -> Self {
        Self::Crypto(error)
    }
}

impl From<codec::Error> for Error {
    fn from(error: codec::Error) -> Self {
        Self::Codec(error)
    }
}
