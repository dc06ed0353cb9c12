//! Audio channel capability.
//!
//! ISO channel establishment, codec negotiation and data path handling
//! live in the host/controller. ASCS drives them through this trait and
//! maps the error domain onto control-point response codes; it never
//! looks inside the channel.

use crate::host::Address;

/// Direction of an audio stream endpoint, seen from the server.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Dir {
    /// Server receives audio (client to server).
    Sink = 0x01,
    /// Server transmits audio (server to client).
    Source = 0x02,
}

impl TryFrom<u8> for Dir {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(Dir::Sink),
            0x02 => Ok(Dir::Source),
            _ => Err(()),
        }
    }
}

/// Codec identifier from a codec configure operation.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodecId {
    /// Coding format.
    pub id: u8,
    /// Company id for vendor specific codecs.
    pub cid: u16,
    /// Vendor specific codec id.
    pub vid: u16,
}

/// QoS parameters requested for an endpoint.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QosParams {
    /// CIG id.
    pub cig: u8,
    /// CIS id.
    pub cis: u8,
    /// SDU interval in microseconds (24 bit).
    pub interval: u32,
    /// Framing mode.
    pub framing: u8,
    /// PHY bitmask.
    pub phy: u8,
    /// Maximum SDU size.
    pub sdu: u16,
    /// Retransmission effort.
    pub rtn: u8,
    /// Maximum transport latency in milliseconds.
    pub latency: u16,
    /// Presentation delay in microseconds (24 bit).
    pub pd: u32,
}

/// Server QoS preferences advertised in the codec configured state.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preferences {
    /// Supported framing.
    pub framing: u8,
    /// Preferred PHY bitmask.
    pub phy: u8,
    /// Preferred retransmission effort.
    pub rtn: u8,
    /// Maximum transport latency in milliseconds.
    pub latency: u16,
    /// Minimum presentation delay in microseconds.
    pub pd_min: u32,
    /// Maximum presentation delay in microseconds.
    pub pd_max: u32,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            framing: 0x00,
            phy: 0x02,
            rtn: 2,
            latency: 20,
            pd_min: 0,
            pd_max: 40000,
        }
    }
}

/// Errors from the audio channel capability.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// Out of channel resources.
    NoMem,
    /// A parameter value was invalid.
    InvalidArgument,
    /// A parameter value is valid but not supported.
    NotSupported,
    /// No capability matches the requested codec and direction.
    UnsupportedCapability,
    /// The capability rejected an otherwise valid configuration.
    Rejected,
    /// The operation does not fit the channel's current state.
    BadMessage,
    /// The underlying transport is gone.
    NotConnected,
    /// Anything else.
    Unspecified,
}

/// Opaque handle to the host's audio channel management.
///
/// One implementation serves all endpoints; calls identify the endpoint
/// by owning peer and ASE id.
pub trait AudioChannel {
    /// Bind a codec configuration to an idle endpoint.
    fn configure(&self, peer: &Address, ase: u8, dir: Dir, codec: &CodecId, config: &[u8]) -> Result<(), ChannelError>;

    /// Replace the codec configuration of a configured endpoint.
    fn reconfigure(&self, peer: &Address, ase: u8, codec: &CodecId, config: &[u8]) -> Result<(), ChannelError>;

    /// Apply QoS parameters.
    fn qos(&self, peer: &Address, ase: u8, qos: &QosParams) -> Result<(), ChannelError>;

    /// Enable the endpoint with the given metadata.
    fn enable(&self, peer: &Address, ase: u8, metadata: &[u8]) -> Result<(), ChannelError>;

    /// Update metadata of an enabled or streaming endpoint.
    fn metadata(&self, peer: &Address, ase: u8, metadata: &[u8]) -> Result<(), ChannelError>;

    /// Start audio (receiver start ready).
    fn start(&self, peer: &Address, ase: u8) -> Result<(), ChannelError>;

    /// Disable the endpoint.
    fn disable(&self, peer: &Address, ase: u8) -> Result<(), ChannelError>;

    /// Stop audio (receiver stop ready).
    fn stop(&self, peer: &Address, ase: u8) -> Result<(), ChannelError>;

    /// Release the endpoint. With `cache` set the server keeps the codec
    /// configuration for a later reattach.
    fn release(&self, peer: &Address, ase: u8, cache: bool) -> Result<(), ChannelError>;

    /// Server QoS preferences for a direction, exposed in the codec
    /// configured ASE state.
    fn preferences(&self, _peer: &Address, _ase: u8, _dir: Dir) -> Preferences {
        Preferences::default()
    }
}
