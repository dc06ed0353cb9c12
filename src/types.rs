//! Shared protocol types.

use core::fmt::Display;

/// Attribute Error Code returned from a characteristic write handler.
///
/// Covers the ATT protocol errors this crate raises itself plus the
/// application error range (0x80..) that the audio services define.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct AttErrorCode {
    value: u8,
}

impl AttErrorCode {
    /// The attribute cannot be written
    pub const WRITE_NOT_PERMITTED: Self = Self { value: 0x03 };
    /// ATT Server does not support the request received from the client
    pub const REQUEST_NOT_SUPPORTED: Self = Self { value: 0x06 };
    /// Offset specified was past the end of the attribute
    pub const INVALID_OFFSET: Self = Self { value: 0x07 };
    /// The attribute value length is invalid for the operation
    pub const INVALID_ATTRIBUTE_VALUE_LENGTH: Self = Self { value: 0x0d };
    /// The attribute request encountered an error that was unlikely, and therefore could not be completed
    pub const UNLIKELY_ERROR: Self = Self { value: 0x0e };
    /// The attribute parameter value was not allowed
    pub const VALUE_NOT_ALLOWED: Self = Self { value: 0x13 };

    /// An application error code defined by a higher layer specification.
    pub const fn application(value: u8) -> Self {
        Self { value }
    }

    /// Raw error code value.
    pub const fn value(&self) -> u8 {
        self.value
    }
}

impl Display for AttErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            &Self::WRITE_NOT_PERMITTED => f.write_str("write not permitted: the attribute cannot be written"),
            &Self::REQUEST_NOT_SUPPORTED => {
                f.write_str("request not supported: ATT server does not support the request received from the client")
            }
            &Self::INVALID_OFFSET => f.write_str("offset specified was past the end of the attribute"),
            &Self::INVALID_ATTRIBUTE_VALUE_LENGTH => {
                f.write_str("invalid attribute value length: the attribute value length is invalid for the operation")
            }
            &Self::UNLIKELY_ERROR => {
                f.write_str("unlikely error: the attribute request encountered an error that was unlikely")
            }
            &Self::VALUE_NOT_ALLOWED => f.write_str("value not allowed: the attribute parameter value was not allowed"),
            other => write!(f, "application error code {:#04x}", other.value),
        }
    }
}

/// 16-bit UUIDs for the audio services and their characteristics.
pub mod uuid {
    use bt_hci::uuid::BluetoothUuid16;

    /// Audio Input Control Service
    pub const AUDIO_INPUT_CONTROL: BluetoothUuid16 = BluetoothUuid16::new(0x1843);
    /// Volume Control Service
    pub const VOLUME_CONTROL: BluetoothUuid16 = BluetoothUuid16::new(0x1844);
    /// Volume Offset Control Service
    pub const VOLUME_OFFSET_CONTROL: BluetoothUuid16 = BluetoothUuid16::new(0x1845);
    /// Coordinated Set Identification Service
    pub const COORDINATED_SET_IDENTIFICATION: BluetoothUuid16 = BluetoothUuid16::new(0x1846);
    /// Audio Stream Control Service
    pub const AUDIO_STREAM_CONTROL: BluetoothUuid16 = BluetoothUuid16::new(0x184e);

    /// AICS Audio Input State
    pub const INPUT_STATE: BluetoothUuid16 = BluetoothUuid16::new(0x2b77);
    /// AICS Gain Setting Properties
    pub const GAIN_SETTINGS: BluetoothUuid16 = BluetoothUuid16::new(0x2b78);
    /// AICS Audio Input Type
    pub const INPUT_TYPE: BluetoothUuid16 = BluetoothUuid16::new(0x2b79);
    /// AICS Audio Input Status
    pub const INPUT_STATUS: BluetoothUuid16 = BluetoothUuid16::new(0x2b7a);
    /// AICS Audio Input Control Point
    pub const INPUT_CONTROL_POINT: BluetoothUuid16 = BluetoothUuid16::new(0x2b7b);
    /// AICS Audio Input Description
    pub const INPUT_DESCRIPTION: BluetoothUuid16 = BluetoothUuid16::new(0x2b7c);

    /// VCS Volume State
    pub const VOLUME_STATE: BluetoothUuid16 = BluetoothUuid16::new(0x2b7d);
    /// VCS Volume Control Point
    pub const VOLUME_CONTROL_POINT: BluetoothUuid16 = BluetoothUuid16::new(0x2b7e);
    /// VCS Volume Flags
    pub const VOLUME_FLAGS: BluetoothUuid16 = BluetoothUuid16::new(0x2b7f);

    /// VOCS Volume Offset State
    pub const OFFSET_STATE: BluetoothUuid16 = BluetoothUuid16::new(0x2b80);
    /// VOCS Audio Location
    pub const AUDIO_LOCATION: BluetoothUuid16 = BluetoothUuid16::new(0x2b81);
    /// VOCS Volume Offset Control Point
    pub const OFFSET_CONTROL_POINT: BluetoothUuid16 = BluetoothUuid16::new(0x2b82);
    /// VOCS Audio Output Description
    pub const OUTPUT_DESCRIPTION: BluetoothUuid16 = BluetoothUuid16::new(0x2b83);

    /// CSIS Set Identity Resolving Key
    pub const SET_SIRK: BluetoothUuid16 = BluetoothUuid16::new(0x2b84);
    /// CSIS Coordinated Set Size
    pub const SET_SIZE: BluetoothUuid16 = BluetoothUuid16::new(0x2b85);
    /// CSIS Set Member Lock
    pub const SET_LOCK: BluetoothUuid16 = BluetoothUuid16::new(0x2b86);
    /// CSIS Set Member Rank
    pub const SET_RANK: BluetoothUuid16 = BluetoothUuid16::new(0x2b87);

    /// ASCS Sink ASE
    pub const SINK_ASE: BluetoothUuid16 = BluetoothUuid16::new(0x2bc4);
    /// ASCS Source ASE
    pub const SOURCE_ASE: BluetoothUuid16 = BluetoothUuid16::new(0x2bc5);
    /// ASCS ASE Control Point
    pub const ASE_CONTROL_POINT: BluetoothUuid16 = BluetoothUuid16::new(0x2bc6);
}
