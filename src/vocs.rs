//! Volume Offset Control Service (server role).
//!
//! A secondary service, instantiated per audio output and included by
//! VCS. Each instance carries an offset state guarded by a change
//! counter, an audio location and an output description; the latter two
//! are plain read characteristics that a config flag can make writable.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::String;

use crate::counter::ChangeCounter;
use crate::host::Notifier;
use crate::types::uuid;
use crate::types::AttErrorCode;
use crate::{Error, DESCRIPTION_MAX};

/// Change counter presented by the writer did not match.
pub const ERR_INVALID_COUNTER: AttErrorCode = AttErrorCode::application(0x80);
/// Opcode not supported by this control point.
pub const ERR_OP_NOT_SUPPORTED: AttErrorCode = AttErrorCode::application(0x81);
/// Offset outside the valid range.
pub const ERR_OUT_OF_RANGE: AttErrorCode = AttErrorCode::application(0x82);

/// Smallest valid volume offset.
pub const MIN_OFFSET: i16 = -255;
/// Largest valid volume offset.
pub const MAX_OFFSET: i16 = 255;

const OPCODE_SET_OFFSET: u8 = 0x01;
const CP_SET_OFFSET_LEN: usize = 4;

/// Initial values for one offset control instance.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct OffsetConfig<'a> {
    /// Initial volume offset.
    pub offset: i16,
    /// Audio location bitmask of the output.
    pub location: u8,
    /// Whether peers may write the location.
    pub location_writable: bool,
    /// Initial output description.
    pub description: &'a str,
    /// Whether peers may write the description.
    pub description_writable: bool,
}

impl Default for OffsetConfig<'_> {
    fn default() -> Self {
        Self {
            offset: 0,
            location: 0,
            location_writable: false,
            description: "",
            description_writable: false,
        }
    }
}

impl OffsetConfig<'_> {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.offset < MIN_OFFSET || self.offset > MAX_OFFSET {
            debug!("[vocs] invalid initial offset {}", self.offset);
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

/// Application observer for one or more offset control instances.
pub trait OffsetHandler {
    /// Offset state changed.
    fn state(&self, index: u8, offset: i16) {
        let _ = (index, offset);
    }

    /// Audio location changed.
    fn location(&self, index: u8, location: u8) {
        let _ = (index, location);
    }

    /// Output description changed.
    fn description(&self, index: u8, description: &str) {
        let _ = (index, description);
    }
}

struct OffsetInner {
    offset: i16,
    counter: ChangeCounter,
    location: u8,
    description: String<DESCRIPTION_MAX>,
}

/// One Volume Offset Control Service instance.
pub struct VolumeOffsetControl<'d, M: RawMutex, T: Notifier> {
    index: u8,
    state: Mutex<M, RefCell<OffsetInner>>,
    notifier: &'d T,
    handler: Option<&'d dyn OffsetHandler>,
    location_writable: bool,
    description_writable: bool,
}

impl<'d, M: RawMutex, T: Notifier> VolumeOffsetControl<'d, M, T> {
    /// Create an instance with the given config.
    pub fn new(
        index: u8,
        notifier: &'d T,
        config: OffsetConfig<'_>,
        handler: Option<&'d dyn OffsetHandler>,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::new_valid(index, notifier, config, handler))
    }

    pub(crate) fn new_valid(
        index: u8,
        notifier: &'d T,
        config: OffsetConfig<'_>,
        handler: Option<&'d dyn OffsetHandler>,
    ) -> Self {
        let mut description = String::new();
        let clipped = clip_str(config.description);
        unwrap!(description.push_str(clipped).ok());
        Self {
            index,
            state: Mutex::new(RefCell::new(OffsetInner {
                offset: config.offset,
                counter: ChangeCounter::new(),
                location: config.location,
                description,
            })),
            notifier,
            handler,
            location_writable: config.location_writable,
            description_writable: config.description_writable,
        }
    }

    /// Instance index within its pool.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Wire encoding of the Volume Offset State characteristic.
    pub fn read_offset_state(&self) -> [u8; 3] {
        self.state.lock(|state| {
            let state = state.borrow();
            let offset = state.offset.to_le_bytes();
            [offset[0], offset[1], state.counter.value()]
        })
    }

    /// Current audio location.
    pub fn read_location(&self) -> [u8; 1] {
        self.state.lock(|state| [state.borrow().location])
    }

    /// Copy the output description into `buf`, returning the used length.
    pub fn read_description(&self, buf: &mut [u8]) -> usize {
        self.state.lock(|state| {
            let state = state.borrow();
            let bytes = state.description.as_bytes();
            let len = bytes.len().min(buf.len());
            buf[..len].copy_from_slice(&bytes[..len]);
            len
        })
    }

    /// Handle a peer write to the Volume Offset Control Point.
    pub fn write_control(&self, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        if offset != 0 {
            return Err(AttErrorCode::INVALID_OFFSET);
        }
        if data.is_empty() {
            return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH);
        }

        // Opcode is validated before the length rules.
        if data[0] != OPCODE_SET_OFFSET {
            debug!("[vocs] invalid opcode {}", data[0]);
            return Err(ERR_OP_NOT_SUPPORTED);
        }
        if data.len() != CP_SET_OFFSET_LEN {
            return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH);
        }

        let counter = data[1];
        let requested = i16::from_le_bytes([data[2], data[3]]);
        debug!("[vocs] set offset {}, counter {}", requested, counter);

        let notify = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if !state.counter.matches(counter) {
                return Err(ERR_INVALID_COUNTER);
            }
            if requested < MIN_OFFSET || requested > MAX_OFFSET {
                return Err(ERR_OUT_OF_RANGE);
            }
            if state.offset == requested {
                return Ok(None);
            }
            state.offset = requested;
            state.counter.increment();
            Ok(Some((state.offset, state.counter.value())))
        })?;

        if let Some((new_offset, counter)) = notify {
            debug!("[vocs] new state: offset {}, counter {}", new_offset, counter);
            let bytes = new_offset.to_le_bytes();
            self.notifier
                .notify(None, uuid::OFFSET_STATE, self.index, &[bytes[0], bytes[1], counter]);
            if let Some(handler) = self.handler {
                handler.state(self.index, new_offset);
            }
        }
        Ok(())
    }

    /// Handle a peer write to the Audio Location characteristic.
    pub fn write_location(&self, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        if !self.location_writable {
            return Err(AttErrorCode::WRITE_NOT_PERMITTED);
        }
        if offset != 0 {
            return Err(AttErrorCode::INVALID_OFFSET);
        }
        if data.len() != 1 {
            return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH);
        }

        let location = data[0];
        let changed = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.location == location {
                false
            } else {
                state.location = location;
                true
            }
        });

        if changed {
            debug!("[vocs] location 0x{:02x}", location);
            self.notifier.notify(None, uuid::AUDIO_LOCATION, self.index, &[location]);
            if let Some(handler) = self.handler {
                handler.location(self.index, location);
            }
        }
        Ok(())
    }

    /// Handle a peer write to the Audio Output Description characteristic.
    ///
    /// Values longer than the storage capacity are clipped, not rejected.
    pub fn write_description(&self, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        if !self.description_writable {
            return Err(AttErrorCode::WRITE_NOT_PERMITTED);
        }
        if offset != 0 {
            return Err(AttErrorCode::INVALID_OFFSET);
        }

        let text = core::str::from_utf8(data).map_err(|_| AttErrorCode::VALUE_NOT_ALLOWED)?;
        let clipped = clip_str(text);
        if clipped.len() < text.len() {
            debug!("[vocs] description clipped from {} to {} bytes", text.len(), clipped.len());
        }

        let changed = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.description.as_str() == clipped {
                false
            } else {
                state.description.clear();
                unwrap!(state.description.push_str(clipped).ok());
                true
            }
        });

        if changed {
            self.notifier
                .notify(None, uuid::OUTPUT_DESCRIPTION, self.index, clipped.as_bytes());
            if let Some(handler) = self.handler {
                handler.description(self.index, clipped);
            }
        }
        Ok(())
    }

    /// Set the offset locally, running the same validation and
    /// notification path as a peer write.
    pub fn set_offset(&self, offset: i16) -> Result<(), Error> {
        let counter = self.state.lock(|state| state.borrow().counter.value());
        let bytes = offset.to_le_bytes();
        let cp = [OPCODE_SET_OFFSET, counter, bytes[0], bytes[1]];
        self.write_control(0, &cp).map_err(Error::Gatt)
    }

    /// Set the audio location locally.
    pub fn set_location(&self, location: u8) -> Result<(), Error> {
        let changed = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.location == location {
                false
            } else {
                state.location = location;
                true
            }
        });
        if changed {
            self.notifier.notify(None, uuid::AUDIO_LOCATION, self.index, &[location]);
            if let Some(handler) = self.handler {
                handler.location(self.index, location);
            }
        }
        Ok(())
    }

    /// Set the output description locally.
    pub fn set_description(&self, description: &str) -> Result<(), Error> {
        let clipped = clip_str(description);
        let changed = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.description.as_str() == clipped {
                false
            } else {
                state.description.clear();
                unwrap!(state.description.push_str(clipped).ok());
                true
            }
        });
        if changed {
            self.notifier
                .notify(None, uuid::OUTPUT_DESCRIPTION, self.index, clipped.as_bytes());
            if let Some(handler) = self.handler {
                handler.description(self.index, clipped);
            }
        }
        Ok(())
    }

    /// Current offset value.
    pub fn offset(&self) -> i16 {
        self.state.lock(|state| state.borrow().offset)
    }
}

/// Clip a string to the description capacity on a char boundary.
pub(crate) fn clip_str(text: &str) -> &str {
    if text.len() <= DESCRIPTION_MAX {
        return text;
    }
    let mut end = DESCRIPTION_MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;
    use crate::mock::MockNotifier;

    fn instance<'d>(notifier: &'d MockNotifier) -> VolumeOffsetControl<'d, NoopRawMutex, MockNotifier> {
        unwrap!(VolumeOffsetControl::new(
            0,
            notifier,
            OffsetConfig {
                offset: 10,
                location: 0x01,
                location_writable: true,
                description: "Left",
                description_writable: true,
            },
            None,
        )
        .ok())
    }

    #[test]
    fn set_offset_notifies_and_bumps_counter() {
        let notifier = MockNotifier::new();
        let vocs = instance(&notifier);

        unwrap!(vocs.write_control(0, &[0x01, 0, 0x80, 0x00]).ok());
        assert_eq!(vocs.read_offset_state(), [0x80, 0x00, 1]);
        assert_eq!(notifier.count(uuid::OFFSET_STATE), 1);
    }

    #[test]
    fn stale_counter_leaves_state_unchanged() {
        let notifier = MockNotifier::new();
        let vocs = instance(&notifier);
        let before = vocs.read_offset_state();

        assert_eq!(vocs.write_control(0, &[0x01, 7, 0x20, 0x00]), Err(ERR_INVALID_COUNTER));
        assert_eq!(vocs.read_offset_state(), before);
        assert_eq!(notifier.count(uuid::OFFSET_STATE), 0);
    }

    #[test]
    fn offset_out_of_range_is_rejected_without_counter_bump() {
        let notifier = MockNotifier::new();
        let vocs = instance(&notifier);

        // 256 > MAX_OFFSET
        assert_eq!(vocs.write_control(0, &[0x01, 0, 0x00, 0x01]), Err(ERR_OUT_OF_RANGE));
        assert_eq!(vocs.read_offset_state(), [10, 0, 0]);
    }

    #[test]
    fn opcode_checked_before_length() {
        let notifier = MockNotifier::new();
        let vocs = instance(&notifier);

        // Both the opcode and the length are wrong; the opcode error wins.
        assert_eq!(vocs.write_control(0, &[0x02, 0]), Err(ERR_OP_NOT_SUPPORTED));
        // Valid opcode, wrong length.
        assert_eq!(
            vocs.write_control(0, &[0x01, 0, 0x10]),
            Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH)
        );
    }

    #[test]
    fn unchanged_offset_succeeds_without_notification() {
        let notifier = MockNotifier::new();
        let vocs = instance(&notifier);

        unwrap!(vocs.write_control(0, &[0x01, 0, 10, 0]).ok());
        assert_eq!(notifier.count(uuid::OFFSET_STATE), 0);
        assert_eq!(vocs.read_offset_state(), [10, 0, 0]);
    }

    #[test]
    fn location_write_notifies_without_touching_counter() {
        let notifier = MockNotifier::new();
        let vocs = instance(&notifier);

        unwrap!(vocs.write_location(0, &[0x02]).ok());
        assert_eq!(vocs.read_location(), [0x02]);
        assert_eq!(notifier.count(uuid::AUDIO_LOCATION), 1);
        assert_eq!(vocs.read_offset_state(), [10, 0, 0]);
    }

    #[test]
    fn description_write_is_clipped_to_capacity() {
        let notifier = MockNotifier::new();
        let vocs = instance(&notifier);

        let long = [b'x'; DESCRIPTION_MAX + 10];
        unwrap!(vocs.write_description(0, &long).ok());

        let mut buf = [0; DESCRIPTION_MAX + 10];
        let len = vocs.read_description(&mut buf);
        assert_eq!(len, DESCRIPTION_MAX);
        assert_eq!(notifier.count(uuid::OUTPUT_DESCRIPTION), 1);
    }

    #[test]
    fn non_writable_side_characteristics_reject_writes() {
        let notifier = MockNotifier::new();
        let vocs: VolumeOffsetControl<'_, NoopRawMutex, _> = unwrap!(VolumeOffsetControl::new(
            0,
            &notifier,
            OffsetConfig::default(),
            None
        )
        .ok());

        assert_eq!(vocs.write_location(0, &[0x01]), Err(AttErrorCode::WRITE_NOT_PERMITTED));
        assert_eq!(vocs.write_description(0, b"x"), Err(AttErrorCode::WRITE_NOT_PERMITTED));
    }
}
