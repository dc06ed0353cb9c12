//! Volume Control Service (server role).
//!
//! The primary rendering-control service of a device. Owns the volume
//! state (volume, mute, change counter), the sticky volume flags, and
//! any included VOCS and AICS instances.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::aics::{AudioInputControl, InputConfig, InputHandler};
use crate::counter::ChangeCounter;
use crate::host::Notifier;
use crate::types::uuid;
use crate::types::AttErrorCode;
use crate::vocs::{OffsetConfig, OffsetHandler, VolumeOffsetControl};
use crate::Error;

/// Change counter presented by the writer did not match.
pub const ERR_INVALID_COUNTER: AttErrorCode = AttErrorCode::application(0x80);
/// Opcode not supported by this control point.
pub const ERR_OP_NOT_SUPPORTED: AttErrorCode = AttErrorCode::application(0x81);

const CP_LEN: usize = 2;
const CP_ABS_VOL_LEN: usize = 3;

/// Volume Control Point opcodes.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VolumeOpcode {
    /// Step the volume down.
    RelativeVolumeDown = 0x00,
    /// Step the volume up.
    RelativeVolumeUp = 0x01,
    /// Unmute, then step the volume down.
    UnmuteRelativeVolumeDown = 0x02,
    /// Unmute, then step the volume up.
    UnmuteRelativeVolumeUp = 0x03,
    /// Set an absolute volume.
    SetAbsoluteVolume = 0x04,
    /// Unmute.
    Unmute = 0x05,
    /// Mute.
    Mute = 0x06,
}

impl TryFrom<u8> for VolumeOpcode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x00 => Ok(Self::RelativeVolumeDown),
            0x01 => Ok(Self::RelativeVolumeUp),
            0x02 => Ok(Self::UnmuteRelativeVolumeDown),
            0x03 => Ok(Self::UnmuteRelativeVolumeUp),
            0x04 => Ok(Self::SetAbsoluteVolume),
            0x05 => Ok(Self::Unmute),
            0x06 => Ok(Self::Mute),
            _ => Err(()),
        }
    }
}

/// Volume and mute values of the Volume State characteristic.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeState {
    /// Volume setting, 0..=255.
    pub volume: u8,
    /// Mute state, 0 or 1.
    pub mute: u8,
}

/// Initial values for the volume control service.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct VolumeConfig {
    /// Initial volume setting.
    pub volume: u8,
    /// Initial mute state.
    pub mute: u8,
    /// Volume change per relative step.
    pub step: u8,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            volume: 100,
            mute: 0,
            step: 1,
        }
    }
}

/// Application observer for the volume control service.
pub trait VolumeHandler {
    /// Volume state changed.
    fn state(&self, volume: u8, mute: u8) {
        let _ = (volume, mute);
    }

    /// Volume flags changed.
    fn flags(&self, flags: u8) {
        let _ = flags;
    }
}

/// Handlers for the volume service and its included instances.
#[derive(Default, Clone, Copy)]
pub struct VolumeHandlers<'d> {
    /// Observer for the volume state and flags.
    pub volume: Option<&'d dyn VolumeHandler>,
    /// Observer for the included VOCS instances.
    pub offset: Option<&'d dyn OffsetHandler>,
    /// Observer for the included AICS instances.
    pub input: Option<&'d dyn InputHandler>,
}

struct VolumeInner {
    volume: u8,
    mute: u8,
    counter: ChangeCounter,
    flags: u8,
    step: u8,
}

/// Volume Control Service with `VOCS` included offset instances and
/// `AICS` included input instances.
pub struct VolumeControl<'d, M: RawMutex, T: Notifier, const VOCS: usize = 0, const AICS: usize = 0> {
    state: Mutex<M, RefCell<VolumeInner>>,
    notifier: &'d T,
    handler: Option<&'d dyn VolumeHandler>,
    vocs: [VolumeOffsetControl<'d, M, T>; VOCS],
    aics: [AudioInputControl<'d, M, T>; AICS],
}

impl<'d, M: RawMutex, T: Notifier, const VOCS: usize, const AICS: usize> VolumeControl<'d, M, T, VOCS, AICS> {
    /// Create the service together with its included instances.
    pub fn new(
        notifier: &'d T,
        config: VolumeConfig,
        vocs_config: [OffsetConfig<'_>; VOCS],
        aics_config: [InputConfig<'_>; AICS],
        handlers: VolumeHandlers<'d>,
    ) -> Result<Self, Error> {
        if config.step == 0 {
            return Err(Error::InvalidParameter);
        }
        for config in vocs_config.iter() {
            config.validate()?;
        }
        for config in aics_config.iter() {
            config.validate()?;
        }

        Ok(Self {
            state: Mutex::new(RefCell::new(VolumeInner {
                volume: config.volume,
                mute: config.mute,
                counter: ChangeCounter::new(),
                flags: 0,
                step: config.step,
            })),
            notifier,
            handler: handlers.volume,
            vocs: core::array::from_fn(|i| {
                VolumeOffsetControl::new_valid(i as u8, notifier, vocs_config[i], handlers.offset)
            }),
            aics: core::array::from_fn(|i| {
                AudioInputControl::new_valid(i as u8, notifier, aics_config[i], handlers.input)
            }),
        })
    }

    /// Included volume offset instances.
    pub fn vocs(&self) -> &[VolumeOffsetControl<'d, M, T>; VOCS] {
        &self.vocs
    }

    /// Included audio input instances.
    pub fn aics(&self) -> &[AudioInputControl<'d, M, T>; AICS] {
        &self.aics
    }

    /// Wire encoding of the Volume State characteristic.
    pub fn read_volume_state(&self) -> [u8; 3] {
        self.state.lock(|state| {
            let state = state.borrow();
            [state.volume, state.mute, state.counter.value()]
        })
    }

    /// Wire encoding of the Volume Flags characteristic.
    pub fn read_flags(&self) -> [u8; 1] {
        self.state.lock(|state| [state.borrow().flags])
    }

    /// Handle a peer write to the Volume Control Point.
    pub fn write_control(&self, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        if offset != 0 {
            return Err(AttErrorCode::INVALID_OFFSET);
        }
        if data.is_empty() {
            return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH);
        }

        // Opcode is validated before the length rules.
        let opcode = VolumeOpcode::try_from(data[0]).map_err(|_| {
            debug!("[vcs] invalid opcode {}", data[0]);
            ERR_OP_NOT_SUPPORTED
        })?;
        match data.len() {
            CP_LEN if opcode != VolumeOpcode::SetAbsoluteVolume => {}
            CP_ABS_VOL_LEN if opcode == VolumeOpcode::SetAbsoluteVolume => {}
            _ => return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH),
        }

        let counter = data[1];
        debug!("[vcs] opcode {}, counter {}", data[0], counter);

        let (state, flags) = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if !state.counter.matches(counter) {
                return Err(ERR_INVALID_COUNTER);
            }

            let mut changed = false;
            let mut volume_op = false;
            match opcode {
                VolumeOpcode::RelativeVolumeDown => {
                    volume_op = true;
                    changed |= volume_down(&mut state);
                }
                VolumeOpcode::RelativeVolumeUp => {
                    volume_op = true;
                    changed |= volume_up(&mut state);
                }
                VolumeOpcode::UnmuteRelativeVolumeDown => {
                    volume_op = true;
                    changed |= volume_down(&mut state);
                    changed |= unmute(&mut state);
                }
                VolumeOpcode::UnmuteRelativeVolumeUp => {
                    volume_op = true;
                    changed |= volume_up(&mut state);
                    changed |= unmute(&mut state);
                }
                VolumeOpcode::SetAbsoluteVolume => {
                    volume_op = true;
                    let requested = data[2];
                    if state.volume != requested {
                        state.volume = requested;
                        changed = true;
                    }
                }
                VolumeOpcode::Unmute => {
                    changed |= unmute(&mut state);
                }
                VolumeOpcode::Mute => {
                    if state.mute == 0 {
                        state.mute = 1;
                        changed = true;
                    }
                }
            }

            let state_out = if changed {
                state.counter.increment();
                Some([state.volume, state.mute, state.counter.value()])
            } else {
                None
            };

            // The first volume-affecting opcode ever accepted latches the
            // Volume_Setting_Persisted flag; it never clears through this
            // path.
            let flags_out = if volume_op && state.flags == 0 {
                state.flags = 1;
                Some(state.flags)
            } else {
                None
            };

            Ok((state_out, flags_out))
        })?;

        if let Some(encoded) = state {
            debug!(
                "[vcs] new state: volume {}, mute {}, counter {}",
                encoded[0], encoded[1], encoded[2]
            );
            self.notifier.notify(None, uuid::VOLUME_STATE, 0, &encoded);
            if let Some(handler) = self.handler {
                handler.state(encoded[0], encoded[1]);
            }
        }

        if let Some(flags) = flags {
            self.notifier.notify(None, uuid::VOLUME_FLAGS, 0, &[flags]);
            if let Some(handler) = self.handler {
                handler.flags(flags);
            }
        }
        Ok(())
    }

    /// Change the step used by the relative volume opcodes.
    pub fn set_step(&self, step: u8) -> Result<(), Error> {
        if step == 0 {
            return Err(Error::InvalidParameter);
        }
        self.state.lock(|state| state.borrow_mut().step = step);
        Ok(())
    }

    /// Current volume state.
    pub fn volume_state(&self) -> VolumeState {
        self.state.lock(|state| {
            let state = state.borrow();
            VolumeState {
                volume: state.volume,
                mute: state.mute,
            }
        })
    }

    /// Current volume flags.
    pub fn flags(&self) -> u8 {
        self.state.lock(|state| state.borrow().flags)
    }

    /// Step the volume down locally through the control point path.
    pub fn volume_down(&self) -> Result<(), Error> {
        self.local_op(VolumeOpcode::RelativeVolumeDown, None)
    }

    /// Step the volume up locally.
    pub fn volume_up(&self) -> Result<(), Error> {
        self.local_op(VolumeOpcode::RelativeVolumeUp, None)
    }

    /// Unmute and step the volume down locally.
    pub fn unmute_volume_down(&self) -> Result<(), Error> {
        self.local_op(VolumeOpcode::UnmuteRelativeVolumeDown, None)
    }

    /// Unmute and step the volume up locally.
    pub fn unmute_volume_up(&self) -> Result<(), Error> {
        self.local_op(VolumeOpcode::UnmuteRelativeVolumeUp, None)
    }

    /// Set an absolute volume locally.
    pub fn set_volume(&self, volume: u8) -> Result<(), Error> {
        self.local_op(VolumeOpcode::SetAbsoluteVolume, Some(volume))
    }

    /// Unmute locally.
    pub fn unmute(&self) -> Result<(), Error> {
        self.local_op(VolumeOpcode::Unmute, None)
    }

    /// Mute locally.
    pub fn mute(&self) -> Result<(), Error> {
        self.local_op(VolumeOpcode::Mute, None)
    }

    fn local_op(&self, opcode: VolumeOpcode, arg: Option<u8>) -> Result<(), Error> {
        let counter = self.state.lock(|state| state.borrow().counter.value());
        let mut cp = [opcode as u8, counter, 0];
        let len = match arg {
            Some(value) => {
                cp[2] = value;
                CP_ABS_VOL_LEN
            }
            None => CP_LEN,
        };
        self.write_control(0, &cp[..len]).map_err(Error::Gatt)
    }
}

fn volume_down(state: &mut VolumeInner) -> bool {
    let new = state.volume.saturating_sub(state.step);
    if new != state.volume {
        state.volume = new;
        true
    } else {
        false
    }
}

fn volume_up(state: &mut VolumeInner) -> bool {
    let new = state.volume.saturating_add(state.step);
    if new != state.volume {
        state.volume = new;
        true
    } else {
        false
    }
}

fn unmute(state: &mut VolumeInner) -> bool {
    if state.mute != 0 {
        state.mute = 0;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;
    use crate::mock::MockNotifier;

    fn service<'d>(notifier: &'d MockNotifier, config: VolumeConfig) -> VolumeControl<'d, NoopRawMutex, MockNotifier> {
        unwrap!(VolumeControl::new(notifier, config, [], [], VolumeHandlers::default()).ok())
    }

    #[test]
    fn set_absolute_volume_end_to_end() {
        let notifier = MockNotifier::new();
        let vcs = service(
            &notifier,
            VolumeConfig {
                volume: 100,
                mute: 0,
                step: 1,
            },
        );

        unwrap!(vcs.write_control(0, &[0x04, 0, 80]).ok());
        assert_eq!(vcs.read_volume_state(), [80, 0, 1]);
        assert_eq!(notifier.count(uuid::VOLUME_STATE), 1);
        // First accepted volume operation latches the flags.
        assert_eq!(vcs.read_flags(), [1]);
        assert_eq!(notifier.count(uuid::VOLUME_FLAGS), 1);

        // Replaying the same write with the stale counter fails.
        assert_eq!(vcs.write_control(0, &[0x04, 0, 80]), Err(ERR_INVALID_COUNTER));
        assert_eq!(vcs.read_volume_state(), [80, 0, 1]);
        assert_eq!(notifier.count(uuid::VOLUME_STATE), 1);
        assert_eq!(notifier.count(uuid::VOLUME_FLAGS), 1);
    }

    #[test]
    fn relative_volume_saturates_at_bounds() {
        let notifier = MockNotifier::new();
        let vcs = service(
            &notifier,
            VolumeConfig {
                volume: 0,
                mute: 0,
                step: 1,
            },
        );

        // Down from zero: success, no state change, no notification.
        unwrap!(vcs.write_control(0, &[0x00, 0]).ok());
        assert_eq!(vcs.read_volume_state(), [0, 0, 0]);
        assert_eq!(notifier.count(uuid::VOLUME_STATE), 0);

        unwrap!(vcs.set_volume(255).ok());
        notifier.clear();

        // Up from max: success, no state change, no notification.
        let counter = vcs.read_volume_state()[2];
        unwrap!(vcs.write_control(0, &[0x01, counter]).ok());
        assert_eq!(vcs.read_volume_state(), [255, 0, counter]);
        assert_eq!(notifier.count(uuid::VOLUME_STATE), 0);
    }

    #[test]
    fn flags_latch_exactly_once() {
        let notifier = MockNotifier::new();
        let vcs = service(&notifier, VolumeConfig::default());

        unwrap!(vcs.volume_up().ok());
        unwrap!(vcs.volume_down().ok());
        unwrap!(vcs.set_volume(42).ok());
        assert_eq!(vcs.read_flags(), [1]);
        assert_eq!(notifier.count(uuid::VOLUME_FLAGS), 1);
    }

    #[test]
    fn mute_is_idempotent() {
        let notifier = MockNotifier::new();
        let vcs = service(&notifier, VolumeConfig::default());

        unwrap!(vcs.mute().ok());
        unwrap!(vcs.mute().ok());
        assert_eq!(vcs.read_volume_state(), [100, 1, 1]);
        assert_eq!(notifier.count(uuid::VOLUME_STATE), 1);
        // Mute is not a volume operation; flags stay clear.
        assert_eq!(vcs.read_flags(), [0]);
    }

    #[test]
    fn unmute_volume_up_changes_both_with_one_notification() {
        let notifier = MockNotifier::new();
        let vcs = service(&notifier, VolumeConfig::default());
        unwrap!(vcs.mute().ok());
        notifier.clear();

        let counter = vcs.read_volume_state()[2];
        unwrap!(vcs.write_control(0, &[0x03, counter]).ok());
        let state = vcs.read_volume_state();
        assert_eq!(state[0], 101);
        assert_eq!(state[1], 0);
        assert_eq!(state[2], counter.wrapping_add(1));
        assert_eq!(notifier.count(uuid::VOLUME_STATE), 1);
    }

    #[test]
    fn opcode_checked_before_length() {
        let notifier = MockNotifier::new();
        let vcs = service(&notifier, VolumeConfig::default());

        assert_eq!(vcs.write_control(0, &[0x09, 0, 0, 0]), Err(ERR_OP_NOT_SUPPORTED));
        // Extra byte only valid for set absolute volume.
        assert_eq!(
            vcs.write_control(0, &[0x06, 0, 0]),
            Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH)
        );
        assert_eq!(
            vcs.write_control(0, &[0x04, 0]),
            Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH)
        );
    }

    #[test]
    fn step_applies_to_relative_opcodes() {
        let notifier = MockNotifier::new();
        let vcs = service(
            &notifier,
            VolumeConfig {
                volume: 5,
                mute: 0,
                step: 10,
            },
        );

        unwrap!(vcs.volume_down().ok());
        assert_eq!(vcs.volume_state().volume, 0);
        unwrap!(vcs.volume_up().ok());
        assert_eq!(vcs.volume_state().volume, 10);
        assert_eq!(vcs.set_step(0), Err(Error::InvalidParameter));
    }

    #[test]
    fn included_instances_are_reachable() {
        let notifier = MockNotifier::new();
        let vcs: VolumeControl<'_, NoopRawMutex, MockNotifier, 1, 1> = unwrap!(VolumeControl::new(
            &notifier,
            VolumeConfig::default(),
            [OffsetConfig::default()],
            [InputConfig::default()],
            VolumeHandlers::default(),
        )
        .ok());

        unwrap!(vcs.vocs()[0].set_offset(12).ok());
        assert_eq!(vcs.vocs()[0].offset(), 12);
        unwrap!(vcs.aics()[0].set_gain(3).ok());
        assert_eq!(vcs.aics()[0].read_input_state()[0], 3);
    }
}
