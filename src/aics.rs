//! Audio Input Control Service (server role).
//!
//! A secondary service, instantiated per audio input and included by
//! VCS (and other services with inputs). Gain, mute and gain mode live
//! in one state characteristic guarded by a change counter; gain
//! settings and input type are fixed at init.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::String;

use crate::counter::ChangeCounter;
use crate::host::Notifier;
use crate::types::uuid;
use crate::types::AttErrorCode;
use crate::vocs::clip_str;
use crate::{Error, DESCRIPTION_MAX};

/// Change counter presented by the writer did not match.
pub const ERR_INVALID_COUNTER: AttErrorCode = AttErrorCode::application(0x80);
/// Opcode not supported by this control point.
pub const ERR_OP_NOT_SUPPORTED: AttErrorCode = AttErrorCode::application(0x81);
/// Mute commands are disabled on this input.
pub const ERR_MUTE_DISABLED: AttErrorCode = AttErrorCode::application(0x82);
/// Gain setting outside the configured range.
pub const ERR_OUT_OF_RANGE: AttErrorCode = AttErrorCode::application(0x83);
/// The gain mode cannot be changed on this input.
pub const ERR_GAIN_MODE_NOT_SUPPORTED: AttErrorCode = AttErrorCode::application(0x84);

/// Input is not muted.
pub const MUTE_UNMUTED: u8 = 0x00;
/// Input is muted.
pub const MUTE_MUTED: u8 = 0x01;
/// Mute commands are disabled for this input.
pub const MUTE_DISABLED: u8 = 0x02;

/// Gain is adjusted manually and the mode is fixed.
pub const MODE_MANUAL_ONLY: u8 = 0x00;
/// Gain is adjusted automatically and the mode is fixed.
pub const MODE_AUTO_ONLY: u8 = 0x01;
/// Gain is adjusted manually.
pub const MODE_MANUAL: u8 = 0x02;
/// Gain is adjusted automatically.
pub const MODE_AUTO: u8 = 0x03;

/// Input is inactive.
pub const STATUS_INACTIVE: u8 = 0x00;
/// Input is active.
pub const STATUS_ACTIVE: u8 = 0x01;

/// Unspecified input.
pub const INPUT_TYPE_LOCAL: u8 = 0x00;
/// Isochronous stream input.
pub const INPUT_TYPE_ISO: u8 = 0x01;
/// Analog input.
pub const INPUT_TYPE_ANALOG: u8 = 0x02;
/// Digital input.
pub const INPUT_TYPE_DIGITAL: u8 = 0x03;
/// Radio input.
pub const INPUT_TYPE_RADIO: u8 = 0x04;
/// Physical media input.
pub const INPUT_TYPE_PHYS_MEDIA: u8 = 0x05;
/// Network input.
pub const INPUT_TYPE_NETWORK: u8 = 0x06;
/// Input of any other type.
pub const INPUT_TYPE_OTHER: u8 = 0xff;

const CP_LEN: usize = 2;
const CP_SET_GAIN_LEN: usize = 3;

/// Audio Input Control Point opcodes.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InputOpcode {
    /// Set an absolute gain.
    SetGain = 0x01,
    /// Unmute the input.
    Unmute = 0x02,
    /// Mute the input.
    Mute = 0x03,
    /// Switch to manual gain mode.
    SetManualMode = 0x04,
    /// Switch to automatic gain mode.
    SetAutomaticMode = 0x05,
}

impl TryFrom<u8> for InputOpcode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(Self::SetGain),
            0x02 => Ok(Self::Unmute),
            0x03 => Ok(Self::Mute),
            0x04 => Ok(Self::SetManualMode),
            0x05 => Ok(Self::SetAutomaticMode),
            _ => Err(()),
        }
    }
}

fn mode_immutable(mode: u8) -> bool {
    mode == MODE_MANUAL_ONLY || mode == MODE_AUTO_ONLY
}

fn mode_gain_settable(mode: u8) -> bool {
    mode == MODE_MANUAL_ONLY || mode == MODE_MANUAL
}

/// Initial values for one input control instance.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct InputConfig<'a> {
    /// Initial gain in `units` steps.
    pub gain: i8,
    /// Initial mute state.
    pub mute: u8,
    /// Initial gain mode.
    pub mode: u8,
    /// Gain step size in 0.1 dB units.
    pub units: u8,
    /// Smallest valid gain setting.
    pub min_gain: i8,
    /// Largest valid gain setting.
    pub max_gain: i8,
    /// Kind of input.
    pub input_type: u8,
    /// Initial input status.
    pub status: u8,
    /// Initial input description.
    pub description: &'a str,
    /// Whether peers may write the description.
    pub description_writable: bool,
}

impl Default for InputConfig<'_> {
    fn default() -> Self {
        Self {
            gain: 0,
            mute: MUTE_UNMUTED,
            mode: MODE_MANUAL,
            units: 1,
            min_gain: -100,
            max_gain: 100,
            input_type: INPUT_TYPE_LOCAL,
            status: STATUS_ACTIVE,
            description: "",
            description_writable: false,
        }
    }
}

impl InputConfig<'_> {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.mute > MUTE_DISABLED || self.mode > MODE_AUTO {
            return Err(Error::InvalidParameter);
        }
        if self.input_type > INPUT_TYPE_NETWORK && self.input_type != INPUT_TYPE_OTHER {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

/// Application observer for one or more input control instances.
pub trait InputHandler {
    /// Input state changed.
    fn state(&self, index: u8, gain: i8, mute: u8, mode: u8) {
        let _ = (index, gain, mute, mode);
    }

    /// Input status changed.
    fn status(&self, index: u8, status: u8) {
        let _ = (index, status);
    }

    /// Input description changed.
    fn description(&self, index: u8, description: &str) {
        let _ = (index, description);
    }
}

struct InputInner {
    gain: i8,
    mute: u8,
    mode: u8,
    counter: ChangeCounter,
    status: u8,
    description: String<DESCRIPTION_MAX>,
}

/// One Audio Input Control Service instance.
pub struct AudioInputControl<'d, M: RawMutex, T: Notifier> {
    index: u8,
    state: Mutex<M, RefCell<InputInner>>,
    notifier: &'d T,
    handler: Option<&'d dyn InputHandler>,
    units: u8,
    min_gain: i8,
    max_gain: i8,
    input_type: u8,
    description_writable: bool,
}

impl<'d, M: RawMutex, T: Notifier> AudioInputControl<'d, M, T> {
    /// Create an instance with the given config.
    pub fn new(
        index: u8,
        notifier: &'d T,
        config: InputConfig<'_>,
        handler: Option<&'d dyn InputHandler>,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::new_valid(index, notifier, config, handler))
    }

    pub(crate) fn new_valid(
        index: u8,
        notifier: &'d T,
        config: InputConfig<'_>,
        handler: Option<&'d dyn InputHandler>,
    ) -> Self {
        let mut description = String::new();
        unwrap!(description.push_str(clip_str(config.description)).ok());
        Self {
            index,
            state: Mutex::new(RefCell::new(InputInner {
                gain: config.gain,
                mute: config.mute,
                mode: config.mode,
                counter: ChangeCounter::new(),
                status: config.status,
                description,
            })),
            notifier,
            handler,
            units: config.units,
            min_gain: config.min_gain,
            max_gain: config.max_gain,
            input_type: config.input_type,
            description_writable: config.description_writable,
        }
    }

    /// Instance index within its pool.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Wire encoding of the Audio Input State characteristic.
    pub fn read_input_state(&self) -> [u8; 4] {
        self.state.lock(|state| {
            let state = state.borrow();
            [state.gain as u8, state.mute, state.mode, state.counter.value()]
        })
    }

    /// Wire encoding of the Gain Setting Properties characteristic.
    pub fn read_gain_settings(&self) -> [u8; 3] {
        [self.units, self.min_gain as u8, self.max_gain as u8]
    }

    /// Wire encoding of the Audio Input Type characteristic.
    pub fn read_input_type(&self) -> [u8; 1] {
        [self.input_type]
    }

    /// Wire encoding of the Audio Input Status characteristic.
    pub fn read_input_status(&self) -> [u8; 1] {
        self.state.lock(|state| [state.borrow().status])
    }

    /// Copy the input description into `buf`, returning the used length.
    pub fn read_description(&self, buf: &mut [u8]) -> usize {
        self.state.lock(|state| {
            let state = state.borrow();
            let bytes = state.description.as_bytes();
            let len = bytes.len().min(buf.len());
            buf[..len].copy_from_slice(&bytes[..len]);
            len
        })
    }

    /// Handle a peer write to the Audio Input Control Point.
    pub fn write_control(&self, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        if offset != 0 {
            return Err(AttErrorCode::INVALID_OFFSET);
        }
        if data.is_empty() {
            return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH);
        }

        // Opcode is validated before the length rules.
        let opcode = InputOpcode::try_from(data[0]).map_err(|_| {
            debug!("[aics] invalid opcode {}", data[0]);
            ERR_OP_NOT_SUPPORTED
        })?;
        match data.len() {
            CP_LEN if opcode != InputOpcode::SetGain => {}
            CP_SET_GAIN_LEN if opcode == InputOpcode::SetGain => {}
            _ => return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH),
        }

        let counter = data[1];
        debug!("[aics] opcode {}, counter {}", data[0], counter);

        let notify = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if !state.counter.matches(counter) {
                return Err(ERR_INVALID_COUNTER);
            }

            let mut changed = false;
            match opcode {
                InputOpcode::SetGain => {
                    let requested = data[2] as i8;
                    debug!("[aics] set gain {}", requested);
                    if requested < self.min_gain || requested > self.max_gain {
                        return Err(ERR_OUT_OF_RANGE);
                    }
                    if mode_gain_settable(state.mode) && state.gain != requested {
                        state.gain = requested;
                        changed = true;
                    }
                }
                InputOpcode::Unmute => {
                    if state.mute == MUTE_DISABLED {
                        return Err(ERR_MUTE_DISABLED);
                    }
                    if state.mute != MUTE_UNMUTED {
                        state.mute = MUTE_UNMUTED;
                        changed = true;
                    }
                }
                InputOpcode::Mute => {
                    if state.mute == MUTE_DISABLED {
                        return Err(ERR_MUTE_DISABLED);
                    }
                    if state.mute != MUTE_MUTED {
                        state.mute = MUTE_MUTED;
                        changed = true;
                    }
                }
                InputOpcode::SetManualMode => {
                    if mode_immutable(state.mode) {
                        return Err(ERR_GAIN_MODE_NOT_SUPPORTED);
                    }
                    if state.mode != MODE_MANUAL {
                        state.mode = MODE_MANUAL;
                        changed = true;
                    }
                }
                InputOpcode::SetAutomaticMode => {
                    if mode_immutable(state.mode) {
                        return Err(ERR_GAIN_MODE_NOT_SUPPORTED);
                    }
                    if state.mode != MODE_AUTO {
                        state.mode = MODE_AUTO;
                        changed = true;
                    }
                }
            }

            if changed {
                state.counter.increment();
                Ok(Some((state.gain, state.mute, state.mode, state.counter.value())))
            } else {
                Ok(None)
            }
        })?;

        if let Some((gain, mute, mode, counter)) = notify {
            debug!("[aics] new state: gain {}, mute {}, mode {}, counter {}", gain, mute, mode, counter);
            self.notifier
                .notify(None, uuid::INPUT_STATE, self.index, &[gain as u8, mute, mode, counter]);
            if let Some(handler) = self.handler {
                handler.state(self.index, gain, mute, mode);
            }
        }
        Ok(())
    }

    /// Handle a peer write to the Audio Input Description characteristic.
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
            debug!("[aics] description clipped from {} to {} bytes", text.len(), clipped.len());
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
                .notify(None, uuid::INPUT_DESCRIPTION, self.index, clipped.as_bytes());
            if let Some(handler) = self.handler {
                handler.description(self.index, clipped);
            }
        }
        Ok(())
    }

    /// Mark the input active, notifying subscribers on a change.
    pub fn activate(&self) -> Result<(), Error> {
        self.set_status(STATUS_ACTIVE)
    }

    /// Mark the input inactive, notifying subscribers on a change.
    pub fn deactivate(&self) -> Result<(), Error> {
        self.set_status(STATUS_INACTIVE)
    }

    fn set_status(&self, status: u8) -> Result<(), Error> {
        let changed = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.status == status {
                false
            } else {
                state.status = status;
                true
            }
        });

        if changed {
            debug!("[aics] index {}: status set to {}", self.index, status);
            self.notifier.notify(None, uuid::INPUT_STATUS, self.index, &[status]);
            if let Some(handler) = self.handler {
                handler.status(self.index, status);
            }
        }
        Ok(())
    }

    /// Set the gain locally through the control point path.
    pub fn set_gain(&self, gain: i8) -> Result<(), Error> {
        let counter = self.current_counter();
        self.write_control(0, &[InputOpcode::SetGain as u8, counter, gain as u8])
            .map_err(Error::Gatt)
    }

    /// Unmute the input locally.
    pub fn unmute(&self) -> Result<(), Error> {
        let counter = self.current_counter();
        self.write_control(0, &[InputOpcode::Unmute as u8, counter])
            .map_err(Error::Gatt)
    }

    /// Mute the input locally.
    pub fn mute(&self) -> Result<(), Error> {
        let counter = self.current_counter();
        self.write_control(0, &[InputOpcode::Mute as u8, counter])
            .map_err(Error::Gatt)
    }

    /// Switch to manual gain mode locally.
    pub fn set_manual_gain_mode(&self) -> Result<(), Error> {
        let counter = self.current_counter();
        self.write_control(0, &[InputOpcode::SetManualMode as u8, counter])
            .map_err(Error::Gatt)
    }

    /// Switch to automatic gain mode locally.
    pub fn set_automatic_gain_mode(&self) -> Result<(), Error> {
        let counter = self.current_counter();
        self.write_control(0, &[InputOpcode::SetAutomaticMode as u8, counter])
            .map_err(Error::Gatt)
    }

    fn current_counter(&self) -> u8 {
        self.state.lock(|state| state.borrow().counter.value())
    }
}

#[cfg(test)]
mod tests {
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;
    use crate::mock::MockNotifier;

    fn instance<'d>(notifier: &'d MockNotifier, mode: u8, mute: u8) -> AudioInputControl<'d, NoopRawMutex, MockNotifier> {
        unwrap!(AudioInputControl::new(
            0,
            notifier,
            InputConfig {
                gain: 0,
                mute,
                mode,
                units: 1,
                min_gain: -10,
                max_gain: 10,
                ..InputConfig::default()
            },
            None,
        )
        .ok())
    }

    #[test]
    fn set_gain_notifies_and_bumps_counter() {
        let notifier = MockNotifier::new();
        let aics = instance(&notifier, MODE_MANUAL, MUTE_UNMUTED);

        unwrap!(aics.write_control(0, &[0x01, 0, 5]).ok());
        assert_eq!(aics.read_input_state(), [5, MUTE_UNMUTED, MODE_MANUAL, 1]);
        assert_eq!(notifier.count(uuid::INPUT_STATE), 1);
    }

    #[test]
    fn gain_out_of_range_is_rejected() {
        let notifier = MockNotifier::new();
        let aics = instance(&notifier, MODE_MANUAL, MUTE_UNMUTED);

        assert_eq!(aics.write_control(0, &[0x01, 0, 0x7f]), Err(ERR_OUT_OF_RANGE));
        assert_eq!(aics.read_input_state(), [0, MUTE_UNMUTED, MODE_MANUAL, 0]);
        assert_eq!(notifier.count(uuid::INPUT_STATE), 0);
    }

    #[test]
    fn set_gain_in_automatic_mode_succeeds_without_change() {
        let notifier = MockNotifier::new();
        let aics = instance(&notifier, MODE_AUTO, MUTE_UNMUTED);

        unwrap!(aics.write_control(0, &[0x01, 0, 5]).ok());
        assert_eq!(aics.read_input_state(), [0, MUTE_UNMUTED, MODE_AUTO, 0]);
        assert_eq!(notifier.count(uuid::INPUT_STATE), 0);
    }

    #[test]
    fn mute_rejected_when_mute_disabled() {
        let notifier = MockNotifier::new();
        let aics = instance(&notifier, MODE_MANUAL, MUTE_DISABLED);

        assert_eq!(aics.write_control(0, &[0x03, 0]), Err(ERR_MUTE_DISABLED));
        assert_eq!(aics.write_control(0, &[0x02, 0]), Err(ERR_MUTE_DISABLED));
    }

    #[test]
    fn mute_is_idempotent() {
        let notifier = MockNotifier::new();
        let aics = instance(&notifier, MODE_MANUAL, MUTE_UNMUTED);

        unwrap!(aics.write_control(0, &[0x03, 0]).ok());
        unwrap!(aics.write_control(0, &[0x03, 1]).ok());
        assert_eq!(aics.read_input_state(), [0, MUTE_MUTED, MODE_MANUAL, 1]);
        assert_eq!(notifier.count(uuid::INPUT_STATE), 1);
    }

    #[test]
    fn mode_change_rejected_when_immutable() {
        let notifier = MockNotifier::new();
        let aics = instance(&notifier, MODE_MANUAL_ONLY, MUTE_UNMUTED);

        assert_eq!(aics.write_control(0, &[0x05, 0]), Err(ERR_GAIN_MODE_NOT_SUPPORTED));
        assert_eq!(aics.write_control(0, &[0x04, 0]), Err(ERR_GAIN_MODE_NOT_SUPPORTED));
        assert_eq!(aics.read_input_state(), [0, MUTE_UNMUTED, MODE_MANUAL_ONLY, 0]);
    }

    #[test]
    fn opcode_checked_before_length() {
        let notifier = MockNotifier::new();
        let aics = instance(&notifier, MODE_MANUAL, MUTE_UNMUTED);

        assert_eq!(aics.write_control(0, &[0x07, 0, 0, 0]), Err(ERR_OP_NOT_SUPPORTED));
        // Extra byte is only valid for set gain.
        assert_eq!(
            aics.write_control(0, &[0x02, 0, 0]),
            Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH)
        );
        assert_eq!(
            aics.write_control(0, &[0x01, 0]),
            Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH)
        );
    }

    #[test]
    fn stale_counter_is_rejected() {
        let notifier = MockNotifier::new();
        let aics = instance(&notifier, MODE_MANUAL, MUTE_UNMUTED);

        unwrap!(aics.write_control(0, &[0x01, 0, 5]).ok());
        assert_eq!(aics.write_control(0, &[0x01, 0, 7]), Err(ERR_INVALID_COUNTER));
        assert_eq!(aics.read_input_state(), [5, MUTE_UNMUTED, MODE_MANUAL, 1]);
    }

    #[test]
    fn status_toggles_notify() {
        let notifier = MockNotifier::new();
        let aics = instance(&notifier, MODE_MANUAL, MUTE_UNMUTED);

        unwrap!(aics.deactivate().ok());
        assert_eq!(aics.read_input_status(), [STATUS_INACTIVE]);
        assert_eq!(notifier.count(uuid::INPUT_STATUS), 1);

        // No change, no notification.
        unwrap!(aics.deactivate().ok());
        assert_eq!(notifier.count(uuid::INPUT_STATUS), 1);

        unwrap!(aics.activate().ok());
        assert_eq!(notifier.count(uuid::INPUT_STATUS), 2);
    }

    #[test]
    fn init_rejects_invalid_values() {
        let notifier = MockNotifier::new();
        let result: Result<AudioInputControl<'_, NoopRawMutex, _>, Error> = AudioInputControl::new(
            0,
            &notifier,
            InputConfig {
                mode: 4,
                ..InputConfig::default()
            },
            None,
        );
        assert_eq!(result.err(), Some(Error::InvalidParameter));
    }
}
