//! Audio Stream Control Service (server role).
//!
//! Exposes one Audio Stream Endpoint (ASE) characteristic per endpoint
//! plus a control point accepting batched operations. Each operation
//! carries one or more per-ASE records; every record gets a result in a
//! single aggregated response notification, and every accepted state
//! transition is notified on the ASE characteristic afterwards.
//!
//! Sessions bind a peer identity to a set of ASE slots. A bonded peer
//! keeps its codec configuration across a disconnect and is reattached
//! by address on reconnect; an unbonded peer's session is cleared.

use core::cell::RefCell;

use bt_hci::uuid::BluetoothUuid16;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Vec;

use crate::channel::{AudioChannel, ChannelError, CodecId, Dir, QosParams};
use crate::codec;
use crate::cursor::{ReadCursor, WriteCursor};
use crate::host::{Address, Bonds, Notifier};
use crate::response::{Reason, ResponseBatch, RspCode, RECORDS_MAX};
use crate::types::uuid;
use crate::types::AttErrorCode;
use crate::{ASE_STATUS_MAX, CODEC_CONFIG_MAX, METADATA_MAX};

const CONFIG_RECORD_LEN: usize = 10;
const QOS_RECORD_LEN: usize = 16;
const METADATA_RECORD_LEN: usize = 2;
const ID_RECORD_LEN: usize = 1;

/// ASE state machine states as they appear on the wire.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AseState {
    /// No configuration applied.
    Idle = 0x00,
    /// Codec configured.
    CodecConfigured = 0x01,
    /// QoS configured.
    QosConfigured = 0x02,
    /// Enabled, waiting for audio.
    Enabling = 0x03,
    /// Audio flowing.
    Streaming = 0x04,
    /// Being disabled.
    Disabling = 0x05,
    /// Being released.
    Releasing = 0x06,
}

fn state_str(state: AseState) -> &'static str {
    match state {
        AseState::Idle => "idle",
        AseState::CodecConfigured => "codec-configured",
        AseState::QosConfigured => "qos-configured",
        AseState::Enabling => "enabling",
        AseState::Streaming => "streaming",
        AseState::Disabling => "disabling",
        AseState::Releasing => "releasing",
    }
}

/// ASE Control Point opcodes.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AseOpcode {
    /// Config Codec.
    Config = 0x01,
    /// Config QoS.
    Qos = 0x02,
    /// Enable.
    Enable = 0x03,
    /// Receiver Start Ready.
    Start = 0x04,
    /// Disable.
    Disable = 0x05,
    /// Receiver Stop Ready.
    Stop = 0x06,
    /// Update Metadata.
    Metadata = 0x07,
    /// Release.
    Release = 0x08,
}

impl TryFrom<u8> for AseOpcode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(Self::Config),
            0x02 => Ok(Self::Qos),
            0x03 => Ok(Self::Enable),
            0x04 => Ok(Self::Start),
            0x05 => Ok(Self::Disable),
            0x06 => Ok(Self::Stop),
            0x07 => Ok(Self::Metadata),
            0x08 => Ok(Self::Release),
            _ => Err(()),
        }
    }
}

struct Ase {
    id: u8,
    state: AseState,
    dir: Dir,
    latency: u8,
    phy: u8,
    codec: CodecId,
    config: Vec<u8, CODEC_CONFIG_MAX>,
    qos: QosParams,
    metadata: Vec<u8, METADATA_MAX>,
}

impl Ase {
    const UNUSED: Self = Self::empty();

    const fn empty() -> Self {
        Self {
            id: 0,
            state: AseState::Idle,
            dir: Dir::Sink,
            latency: 0,
            phy: 0,
            codec: CodecId { id: 0, cid: 0, vid: 0 },
            config: Vec::new(),
            qos: QosParams {
                cig: 0,
                cis: 0,
                interval: 0,
                framing: 0,
                phy: 0,
                sdu: 0,
                rtn: 0,
                latency: 0,
                pd: 0,
            },
            metadata: Vec::new(),
        }
    }

    fn claim(&mut self, id: u8) {
        *self = Self::empty();
        self.id = id;
    }
}

struct Session<const ASES: usize> {
    peer: Option<Address>,
    connected: bool,
    ases: [Ase; ASES],
}

impl<const ASES: usize> Session<ASES> {
    const fn empty() -> Self {
        Self {
            peer: None,
            connected: false,
            ases: [Ase::UNUSED; ASES],
        }
    }
}

type StatusQueue = Vec<(BluetoothUuid16, u8, Vec<u8, ASE_STATUS_MAX>), RECORDS_MAX>;

/// Audio Stream Control Service with `CONNS` sessions of `ASES`
/// endpoints each.
pub struct AudioStreamControl<'d, M: RawMutex, T: Notifier, B: Bonds, C: AudioChannel, const CONNS: usize, const ASES: usize>
{
    sessions: Mutex<M, RefCell<[Session<ASES>; CONNS]>>,
    notifier: &'d T,
    bonds: &'d B,
    channel: &'d C,
}

impl<'d, M: RawMutex, T: Notifier, B: Bonds, C: AudioChannel, const CONNS: usize, const ASES: usize>
    AudioStreamControl<'d, M, T, B, C, CONNS, ASES>
{
    /// Create the service.
    pub fn new(notifier: &'d T, bonds: &'d B, channel: &'d C) -> Self {
        Self {
            sessions: Mutex::new(RefCell::new(core::array::from_fn(|_| Session::empty()))),
            notifier,
            bonds,
            channel,
        }
    }

    /// Handle a peer write to the ASE Control Point.
    ///
    /// Exactly one aggregated response notification is sent per call,
    /// followed by one ASE state notification for every record that
    /// changed endpoint state.
    pub fn write_control(&self, peer: &Address, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        if offset != 0 {
            return Err(AttErrorCode::INVALID_OFFSET);
        }
        if data.is_empty() {
            return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH);
        }

        let op_raw = data[0];
        let mut batch = ResponseBatch::new(op_raw);
        let mut statuses = StatusQueue::new();

        let result = self.sessions.lock(|sessions| {
            let mut sessions = sessions.borrow_mut();
            let Some(index) = find_or_attach(&mut sessions, peer) else {
                error!("[ascs] unable to get session");
                batch.add(0, RspCode::Unspecified, Reason::None);
                return Err(AttErrorCode::UNLIKELY_ERROR);
            };
            let session = &mut sessions[index];

            let op = match AseOpcode::try_from(op_raw) {
                Ok(op) => op,
                Err(()) => {
                    debug!("[ascs] unknown opcode 0x{:02x}", op_raw);
                    batch.add(0, RspCode::UnsupportedOpcode, Reason::None);
                    return Err(AttErrorCode::REQUEST_NOT_SUPPORTED);
                }
            };

            let mut r = ReadCursor::new(&data[1..]);
            let result = match op {
                AseOpcode::Config => self.op_config(session, peer, &mut r, &mut batch, &mut statuses),
                AseOpcode::Qos => self.op_qos(session, peer, &mut r, &mut batch, &mut statuses),
                AseOpcode::Enable => self.op_metadata_shaped(session, peer, op, &mut r, &mut batch, &mut statuses),
                AseOpcode::Start => self.op_id_shaped(session, peer, op, &mut r, &mut batch, &mut statuses),
                AseOpcode::Disable => self.op_id_shaped(session, peer, op, &mut r, &mut batch, &mut statuses),
                AseOpcode::Stop => self.op_id_shaped(session, peer, op, &mut r, &mut batch, &mut statuses),
                AseOpcode::Metadata => self.op_metadata_shaped(session, peer, op, &mut r, &mut batch, &mut statuses),
                AseOpcode::Release => self.op_id_shaped(session, peer, op, &mut r, &mut batch, &mut statuses),
            };

            if result == Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH) {
                batch.add(0, RspCode::TruncatedOperation, Reason::None);
            }
            result
        });

        // The response goes out first, then the endpoint state changes,
        // matching the deferred status delivery of the protocol.
        let mut buf = [0; 2 + 3 * RECORDS_MAX];
        let len = batch.encode(&mut buf);
        self.notifier.notify(Some(peer), uuid::ASE_CONTROL_POINT, 0, &buf[..len]);
        for (characteristic, instance, status) in statuses.iter() {
            self.notifier.notify(Some(peer), *characteristic, *instance, status);
        }

        result
    }

    /// Read the ASE characteristic of endpoint `ase_id` for `peer`.
    pub fn read_ase(&self, peer: &Address, ase_id: u8, buf: &mut [u8]) -> Result<usize, AttErrorCode> {
        self.sessions.lock(|sessions| {
            let mut sessions = sessions.borrow_mut();
            let Some(index) = find_or_attach(&mut sessions, peer) else {
                error!("[ascs] unable to get session");
                return Err(AttErrorCode::UNLIKELY_ERROR);
            };
            let session = &mut sessions[index];
            let Some(ase) = get_or_claim_ase(session, ase_id) else {
                error!("[ascs] unable to get ase");
                return Err(AttErrorCode::UNLIKELY_ERROR);
            };
            encode_status(self.channel, peer, ase, buf).map_err(|_| AttErrorCode::UNLIKELY_ERROR)
        })
    }

    /// Current state of endpoint `ase_id` for `peer`, if allocated.
    pub fn ase_state(&self, peer: &Address, ase_id: u8) -> Option<AseState> {
        self.sessions.lock(|sessions| {
            let sessions = sessions.borrow();
            let session = sessions.iter().find(|s| s.peer == Some(*peer))?;
            let ase = find_ase(session, ase_id)?;
            Some(session.ases[ase].state)
        })
    }

    /// Handle a disconnect of `peer`.
    ///
    /// A bonded peer keeps its session and codec configuration for
    /// reattachment on reconnect; an unbonded peer's endpoints are
    /// force-released and the session slot is cleared.
    pub fn on_disconnected(&self, peer: &Address) {
        self.sessions.lock(|sessions| {
            let mut sessions = sessions.borrow_mut();
            for session in sessions.iter_mut() {
                if session.peer != Some(*peer) {
                    continue;
                }
                session.connected = false;

                if self.bonds.is_bonded(peer) {
                    debug!("[ascs] detaching bonded peer");
                    for ase in session.ases.iter_mut() {
                        if ase.id != 0 && ase.state != AseState::Idle {
                            let _ = self.channel.release(peer, ase.id, true);
                            // Cache the codec configuration for reattach.
                            ase.state = AseState::CodecConfigured;
                        }
                    }
                } else {
                    debug!("[ascs] clearing unbonded peer");
                    for ase in session.ases.iter_mut() {
                        if ase.id != 0 && ase.state != AseState::Idle {
                            let _ = self.channel.release(peer, ase.id, false);
                        }
                    }
                    *session = Session::empty();
                }
            }
        })
    }

    fn op_config(
        &self,
        session: &mut Session<ASES>,
        peer: &Address,
        r: &mut ReadCursor<'_>,
        batch: &mut ResponseBatch,
        statuses: &mut StatusQueue,
    ) -> Result<(), AttErrorCode> {
        let num = read_num_ases(r)?;
        debug!("[ascs] config: num_ases {}", num);
        if r.available() < num as usize * CONFIG_RECORD_LEN {
            error!("[ascs] malformed config: len {} < {}", r.available(), num as usize * CONFIG_RECORD_LEN);
            return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH);
        }

        for _ in 0..num {
            if r.available() < CONFIG_RECORD_LEN {
                return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH);
            }
            let id = read_u8(r)?;
            let dir_raw = read_u8(r)?;
            let latency = read_u8(r)?;
            let phy = read_u8(r)?;
            let codec = CodecId {
                id: read_u8(r)?,
                cid: read_u16(r)?,
                vid: read_u16(r)?,
            };
            let cc_len = read_u8(r)? as usize;
            if r.available() < cc_len {
                error!("[ascs] malformed codec config: len {} < {}", r.available(), cc_len);
                return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH);
            }
            let cc = r.slice(cc_len).map_err(|_| AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH)?;

            debug!("[ascs] config: ase 0x{:02x} cc_len {}", id, cc_len);

            let slot = if id == 0 {
                new_ase(session)
            } else {
                get_or_claim_ase_index(session, id)
            };
            let Some(slot) = slot else {
                error!("[ascs] unable to find ase 0x{:02x}", id);
                batch.add(id, RspCode::InvalidAseId, Reason::None);
                continue;
            };

            let connected = session.connected;
            self.ase_config(
                &mut session.ases[slot],
                connected,
                peer,
                dir_raw,
                latency,
                phy,
                codec,
                cc,
                batch,
                statuses,
            );
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn ase_config(
        &self,
        ase: &mut Ase,
        connected: bool,
        peer: &Address,
        dir_raw: u8,
        latency: u8,
        phy: u8,
        codec: CodecId,
        cc: &[u8],
        batch: &mut ResponseBatch,
        statuses: &mut StatusQueue,
    ) {
        debug!(
            "[ascs] ase 0x{:02x} dir 0x{:02x} latency 0x{:02x} phy 0x{:02x} codec 0x{:02x}",
            ase.id, dir_raw, latency, phy, codec.id
        );

        if !(0x01..=0x03).contains(&latency) {
            error!("[ascs] invalid latency 0x{:02x}", latency);
            batch.add(ase.id, RspCode::InvalidConfiguration, Reason::Latency);
            return;
        }
        if !(0x01..=0x03).contains(&phy) {
            error!("[ascs] invalid phy 0x{:02x}", phy);
            batch.add(ase.id, RspCode::InvalidConfiguration, Reason::Phy);
            return;
        }

        // Valid only in idle, codec configured or QoS configured.
        match ase.state {
            AseState::Idle | AseState::CodecConfigured | AseState::QosConfigured => {}
            state => {
                error!("[ascs] invalid state: {}", state_str(state));
                batch.add(ase.id, RspCode::InvalidAseState, Reason::None);
                return;
            }
        }

        let Ok(dir) = Dir::try_from(dir_raw) else {
            // No capability can ever match an unknown direction.
            batch.add(ase.id, RspCode::UnsupportedCapability, Reason::None);
            return;
        };

        if cc.len() > CODEC_CONFIG_MAX {
            batch.add(ase.id, RspCode::InvalidConfiguration, Reason::CodecDataLen);
            return;
        }

        let result = if ase.state == AseState::Idle {
            self.channel.configure(peer, ase.id, dir, &codec, cc)
        } else {
            self.channel.reconfigure(peer, ase.id, &codec, cc)
        };
        if let Err(error) = result {
            error!("[ascs] config rejected by channel");
            let (code, reason) = map_channel_error(AseOpcode::Config, error, Reason::CodecData);
            batch.add(ase.id, code, reason);
            return;
        }

        ase.dir = dir;
        ase.latency = latency;
        ase.phy = phy;
        ase.codec = codec;
        ase.config.clear();
        unwrap!(ase.config.extend_from_slice(cc).ok());
        self.transition(ase, connected, peer, AseState::CodecConfigured, statuses);
        batch.success(ase.id);
    }

    fn op_qos(
        &self,
        session: &mut Session<ASES>,
        peer: &Address,
        r: &mut ReadCursor<'_>,
        batch: &mut ResponseBatch,
        statuses: &mut StatusQueue,
    ) -> Result<(), AttErrorCode> {
        let num = read_num_ases(r)?;
        debug!("[ascs] qos: num_ases {}", num);
        if r.available() < num as usize * QOS_RECORD_LEN {
            error!("[ascs] malformed qos: len {} < {}", r.available(), num as usize * QOS_RECORD_LEN);
            return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH);
        }

        for _ in 0..num {
            if r.available() < QOS_RECORD_LEN {
                return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH);
            }
            let id = read_u8(r)?;
            let qos = QosParams {
                cig: read_u8(r)?,
                cis: read_u8(r)?,
                interval: read_u24(r)?,
                framing: read_u8(r)?,
                phy: read_u8(r)?,
                sdu: read_u16(r)?,
                rtn: read_u8(r)?,
                latency: read_u16(r)?,
                pd: read_u24(r)?,
            };

            debug!("[ascs] qos: ase 0x{:02x} cig 0x{:02x} cis 0x{:02x}", id, qos.cig, qos.cis);

            let Some(slot) = find_ase(session, id) else {
                error!("[ascs] unable to find ase 0x{:02x}", id);
                batch.add(id, RspCode::InvalidAseId, Reason::None);
                continue;
            };
            let connected = session.connected;
            self.ase_qos(&mut session.ases[slot], connected, peer, qos, batch, statuses);
        }
        Ok(())
    }

    fn ase_qos(
        &self,
        ase: &mut Ase,
        connected: bool,
        peer: &Address,
        qos: QosParams,
        batch: &mut ResponseBatch,
        statuses: &mut StatusQueue,
    ) {
        // Valid only in codec configured or QoS configured.
        match ase.state {
            AseState::CodecConfigured | AseState::QosConfigured => {}
            state => {
                error!("[ascs] invalid state: {}", state_str(state));
                batch.add(ase.id, RspCode::InvalidAseState, Reason::None);
                return;
            }
        }

        if let Some(reason) = validate_qos(&qos) {
            error!("[ascs] unsupported qos parameter");
            batch.add(ase.id, RspCode::UnsupportedConfiguration, reason);
            return;
        }

        if let Err(error) = self.channel.qos(peer, ase.id, &qos) {
            error!("[ascs] qos rejected by channel");
            let (code, reason) = map_channel_error(AseOpcode::Qos, error, Reason::None);
            batch.add(ase.id, code, reason);
            return;
        }

        ase.qos = qos;
        self.transition(ase, connected, peer, AseState::QosConfigured, statuses);
        batch.success(ase.id);
    }

    fn op_metadata_shaped(
        &self,
        session: &mut Session<ASES>,
        peer: &Address,
        op: AseOpcode,
        r: &mut ReadCursor<'_>,
        batch: &mut ResponseBatch,
        statuses: &mut StatusQueue,
    ) -> Result<(), AttErrorCode> {
        let num = read_num_ases(r)?;
        debug!("[ascs] op 0x{:02x}: num_ases {}", op as u8, num);
        if r.available() < num as usize * METADATA_RECORD_LEN {
            error!(
                "[ascs] malformed metadata: len {} < {}",
                r.available(),
                num as usize * METADATA_RECORD_LEN
            );
            return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH);
        }

        for _ in 0..num {
            if r.available() < METADATA_RECORD_LEN {
                return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH);
            }
            let id = read_u8(r)?;
            let len = read_u8(r)? as usize;
            if r.available() < len {
                error!("[ascs] malformed metadata: len {} < {}", r.available(), len);
                return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH);
            }
            let metadata = r.slice(len).map_err(|_| AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH)?;

            debug!("[ascs] op 0x{:02x}: ase 0x{:02x} metadata len {}", op as u8, id, len);

            let Some(slot) = find_ase(session, id) else {
                error!("[ascs] unable to find ase 0x{:02x}", id);
                batch.add(id, RspCode::InvalidAseId, Reason::None);
                continue;
            };
            let connected = session.connected;
            match op {
                AseOpcode::Enable => {
                    self.ase_enable(&mut session.ases[slot], connected, peer, metadata, batch, statuses)
                }
                _ => self.ase_metadata(&mut session.ases[slot], connected, peer, metadata, batch, statuses),
            }
        }
        Ok(())
    }

    fn ase_enable(
        &self,
        ase: &mut Ase,
        connected: bool,
        peer: &Address,
        metadata: &[u8],
        batch: &mut ResponseBatch,
        statuses: &mut StatusQueue,
    ) {
        if metadata.len() > METADATA_MAX {
            batch.add(ase.id, RspCode::InvalidMetadata, Reason::Metadata);
            return;
        }

        // Valid only in QoS configured.
        if ase.state != AseState::QosConfigured {
            error!("[ascs] invalid state: {}", state_str(ase.state));
            batch.add(ase.id, RspCode::InvalidAseState, Reason::None);
            return;
        }

        if let Err(error) = self.channel.enable(peer, ase.id, metadata) {
            error!("[ascs] enable rejected by channel");
            let (code, reason) = map_channel_error(AseOpcode::Enable, error, Reason::None);
            batch.add(ase.id, code, reason);
            return;
        }

        ase.metadata.clear();
        unwrap!(ase.metadata.extend_from_slice(metadata).ok());
        self.transition(ase, connected, peer, AseState::Enabling, statuses);
        batch.success(ase.id);
    }

    fn ase_metadata(
        &self,
        ase: &mut Ase,
        connected: bool,
        peer: &Address,
        metadata: &[u8],
        batch: &mut ResponseBatch,
        statuses: &mut StatusQueue,
    ) {
        if metadata.len() > METADATA_MAX {
            batch.add(ase.id, RspCode::InvalidMetadata, Reason::Metadata);
            return;
        }

        // Valid only in enabling or streaming.
        match ase.state {
            AseState::Enabling | AseState::Streaming => {}
            state => {
                error!("[ascs] invalid state: {}", state_str(state));
                batch.add(ase.id, RspCode::InvalidAseState, Reason::None);
                return;
            }
        }

        if let Err(error) = self.channel.metadata(peer, ase.id, metadata) {
            error!("[ascs] metadata rejected by channel");
            let (code, reason) = map_channel_error(AseOpcode::Metadata, error, Reason::None);
            batch.add(ase.id, code, reason);
            return;
        }

        ase.metadata.clear();
        unwrap!(ase.metadata.extend_from_slice(metadata).ok());
        // Re-notify the current state to carry the new metadata.
        let state = ase.state;
        self.transition(ase, connected, peer, state, statuses);
        batch.success(ase.id);
    }

    fn op_id_shaped(
        &self,
        session: &mut Session<ASES>,
        peer: &Address,
        op: AseOpcode,
        r: &mut ReadCursor<'_>,
        batch: &mut ResponseBatch,
        statuses: &mut StatusQueue,
    ) -> Result<(), AttErrorCode> {
        let num = read_num_ases(r)?;
        debug!("[ascs] op 0x{:02x}: num_ases {}", op as u8, num);
        if r.available() < num as usize * ID_RECORD_LEN {
            error!("[ascs] malformed op: len {} < {}", r.available(), num as usize);
            return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH);
        }

        for _ in 0..num {
            let id = read_u8(r)?;
            debug!("[ascs] op 0x{:02x}: ase 0x{:02x}", op as u8, id);

            let Some(slot) = find_ase(session, id) else {
                error!("[ascs] unable to find ase 0x{:02x}", id);
                // Disable reports a state error for unknown endpoints.
                let code = if op == AseOpcode::Disable {
                    RspCode::InvalidAseState
                } else {
                    RspCode::InvalidAseId
                };
                batch.add(id, code, Reason::None);
                continue;
            };
            let connected = session.connected;
            let ase = &mut session.ases[slot];
            match op {
                AseOpcode::Start => self.ase_start(ase, connected, peer, batch, statuses),
                AseOpcode::Disable => self.ase_disable(ase, connected, peer, batch, statuses),
                AseOpcode::Stop => self.ase_stop(ase, connected, peer, batch, statuses),
                _ => self.ase_release(ase, connected, peer, batch, statuses),
            }
        }
        Ok(())
    }

    fn ase_start(
        &self,
        ase: &mut Ase,
        connected: bool,
        peer: &Address,
        batch: &mut ResponseBatch,
        statuses: &mut StatusQueue,
    ) {
        // Valid only in enabling.
        if ase.state != AseState::Enabling {
            error!("[ascs] invalid state: {}", state_str(ase.state));
            batch.add(ase.id, RspCode::InvalidAseState, Reason::None);
            return;
        }

        if let Err(error) = self.channel.start(peer, ase.id) {
            error!("[ascs] start rejected by channel");
            let (code, reason) = map_channel_error(AseOpcode::Start, error, Reason::None);
            batch.add(ase.id, code, reason);
            return;
        }

        self.transition(ase, connected, peer, AseState::Streaming, statuses);
        batch.success(ase.id);
    }

    fn ase_disable(
        &self,
        ase: &mut Ase,
        connected: bool,
        peer: &Address,
        batch: &mut ResponseBatch,
        statuses: &mut StatusQueue,
    ) {
        // Valid only in enabling or streaming.
        match ase.state {
            AseState::Enabling | AseState::Streaming => {}
            state => {
                error!("[ascs] invalid state: {}", state_str(state));
                batch.add(ase.id, RspCode::InvalidAseState, Reason::None);
                return;
            }
        }

        if let Err(error) = self.channel.disable(peer, ase.id) {
            error!("[ascs] disable rejected by channel");
            let (code, reason) = map_channel_error(AseOpcode::Disable, error, Reason::None);
            batch.add(ase.id, code, reason);
            return;
        }

        self.transition(ase, connected, peer, AseState::Disabling, statuses);

        // A sink server has no data to drain and initiates receiver stop
        // ready on its own.
        if ase.dir == Dir::Sink {
            if let Err(error) = self.channel.stop(peer, ase.id) {
                error!("[ascs] stop rejected by channel");
                let (code, reason) = map_channel_error(AseOpcode::Disable, error, Reason::None);
                batch.add(ase.id, code, reason);
                return;
            }
            self.transition(ase, connected, peer, AseState::QosConfigured, statuses);
        }

        batch.success(ase.id);
    }

    fn ase_stop(
        &self,
        ase: &mut Ase,
        connected: bool,
        peer: &Address,
        batch: &mut ResponseBatch,
        statuses: &mut StatusQueue,
    ) {
        // Valid only in disabling.
        if ase.state != AseState::Disabling {
            error!("[ascs] invalid state: {}", state_str(ase.state));
            batch.add(ase.id, RspCode::InvalidAseState, Reason::None);
            return;
        }

        if let Err(error) = self.channel.stop(peer, ase.id) {
            error!("[ascs] stop rejected by channel");
            let (code, reason) = map_channel_error(AseOpcode::Stop, error, Reason::None);
            batch.add(ase.id, code, reason);
            return;
        }

        self.transition(ase, connected, peer, AseState::QosConfigured, statuses);
        batch.success(ase.id);
    }

    fn ase_release(
        &self,
        ase: &mut Ase,
        connected: bool,
        peer: &Address,
        batch: &mut ResponseBatch,
        statuses: &mut StatusQueue,
    ) {
        // Valid in any configured state.
        match ase.state {
            AseState::CodecConfigured
            | AseState::QosConfigured
            | AseState::Enabling
            | AseState::Streaming
            | AseState::Disabling => {}
            state => {
                error!("[ascs] invalid state: {}", state_str(state));
                batch.add(ase.id, RspCode::InvalidAseState, Reason::None);
                return;
            }
        }

        if let Err(error) = self.channel.release(peer, ase.id, false) {
            error!("[ascs] release rejected by channel");
            let (code, reason) = map_channel_error(AseOpcode::Release, error, Reason::None);
            batch.add(ase.id, code, reason);
            return;
        }

        self.transition(ase, connected, peer, AseState::Releasing, statuses);
        // A peer-initiated release caches nothing; complete to idle.
        self.transition(ase, connected, peer, AseState::Idle, statuses);
        batch.success(ase.id);
    }

    fn transition(&self, ase: &mut Ase, connected: bool, peer: &Address, state: AseState, statuses: &mut StatusQueue) {
        let old = ase.state;
        ase.state = state;
        debug!("[ascs] ase 0x{:02x} {} -> {}", ase.id, state_str(old), state_str(state));

        if !connected {
            return;
        }

        let mut buf = [0; ASE_STATUS_MAX];
        let len = unwrap!(encode_status(self.channel, peer, ase, &mut buf).ok());
        let characteristic = match ase.dir {
            Dir::Sink => uuid::SINK_ASE,
            Dir::Source => uuid::SOURCE_ASE,
        };
        if statuses
            .push((characteristic, ase.id, unwrap!(Vec::from_slice(&buf[..len]).ok())))
            .is_err()
        {
            warn!("[ascs] status queue full, dropping notification for ase 0x{:02x}", ase.id);
        }
    }
}

fn find_or_attach<const ASES: usize, const CONNS: usize>(
    sessions: &mut [Session<ASES>; CONNS],
    peer: &Address,
) -> Option<usize> {
    // An existing session for this identity, live or detached.
    for (index, session) in sessions.iter_mut().enumerate() {
        if session.peer == Some(*peer) {
            session.connected = true;
            return Some(index);
        }
    }
    // Otherwise take a free slot.
    for (index, session) in sessions.iter_mut().enumerate() {
        if session.peer.is_none() {
            *session = Session::empty();
            session.peer = Some(*peer);
            session.connected = true;
            return Some(index);
        }
    }
    None
}

fn find_ase<const ASES: usize>(session: &Session<ASES>, id: u8) -> Option<usize> {
    if id == 0 || id as usize > ASES {
        return None;
    }
    let index = id as usize - 1;
    if session.ases[index].id == id {
        Some(index)
    } else {
        None
    }
}

fn get_or_claim_ase_index<const ASES: usize>(session: &mut Session<ASES>, id: u8) -> Option<usize> {
    if id == 0 || id as usize > ASES {
        return None;
    }
    let index = id as usize - 1;
    if session.ases[index].id == 0 {
        session.ases[index].claim(id);
    }
    Some(index)
}

fn get_or_claim_ase<const ASES: usize>(session: &mut Session<ASES>, id: u8) -> Option<&Ase> {
    let index = get_or_claim_ase_index(session, id)?;
    Some(&session.ases[index])
}

fn new_ase<const ASES: usize>(session: &mut Session<ASES>) -> Option<usize> {
    for (index, ase) in session.ases.iter_mut().enumerate() {
        if ase.id == 0 {
            ase.claim(index as u8 + 1);
            return Some(index);
        }
    }
    None
}

fn read_num_ases(r: &mut ReadCursor<'_>) -> Result<u8, AttErrorCode> {
    r.read::<u8>().map_err(|_| AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH)
}

fn read_u8(r: &mut ReadCursor<'_>) -> Result<u8, AttErrorCode> {
    r.read::<u8>().map_err(|_| AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH)
}

fn read_u16(r: &mut ReadCursor<'_>) -> Result<u16, AttErrorCode> {
    r.read::<u16>().map_err(|_| AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH)
}

fn read_u24(r: &mut ReadCursor<'_>) -> Result<u32, AttErrorCode> {
    r.read_u24().map_err(|_| AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH)
}

fn validate_qos(qos: &QosParams) -> Option<Reason> {
    // Allowed range: 0x0000FF..0xFFFFFF
    if !(0x0000ff..=0xffffff).contains(&qos.interval) {
        return Some(Reason::Interval);
    }
    // Allowed values: unframed and framed
    if qos.framing > 0x01 {
        return Some(Reason::Framing);
    }
    // Allowed values: 1M, 2M or coded
    if qos.phy == 0 || qos.phy > 0x07 {
        return Some(Reason::Phy);
    }
    // Allowed range: 0x00..0x0FFF
    if qos.sdu > 0x0fff {
        return Some(Reason::Sdu);
    }
    // Allowed range: 0x0005..0x0FA0
    if !(0x0005..=0x0fa0).contains(&qos.latency) {
        return Some(Reason::Latency);
    }
    None
}

fn map_channel_error(op: AseOpcode, error: ChannelError, reason: Reason) -> (RspCode, Reason) {
    match error {
        ChannelError::NoMem => (RspCode::NoMem, Reason::None),
        ChannelError::InvalidArgument => match op {
            AseOpcode::Config | AseOpcode::Qos => (RspCode::InvalidConfiguration, reason),
            AseOpcode::Enable | AseOpcode::Metadata => (RspCode::InvalidMetadata, reason),
            _ => (RspCode::Unspecified, Reason::None),
        },
        ChannelError::NotSupported => match op {
            AseOpcode::Config | AseOpcode::Qos => (RspCode::UnsupportedConfiguration, reason),
            AseOpcode::Enable | AseOpcode::Metadata => (RspCode::UnsupportedMetadata, reason),
            _ => (RspCode::Unspecified, Reason::None),
        },
        ChannelError::UnsupportedCapability => (RspCode::UnsupportedCapability, Reason::None),
        ChannelError::Rejected => (RspCode::RejectedConfiguration, reason),
        ChannelError::BadMessage => (RspCode::InvalidAseState, Reason::None),
        ChannelError::NotConnected | ChannelError::Unspecified => (RspCode::Unspecified, Reason::None),
    }
}

fn encode_status<C: AudioChannel>(
    channel: &C,
    peer: &Address,
    ase: &Ase,
    buf: &mut [u8],
) -> Result<usize, codec::Error> {
    let mut w = WriteCursor::new(buf);
    w.write(ase.id)?;
    w.write(ase.state as u8)?;

    match ase.state {
        AseState::Idle | AseState::Releasing => {}
        AseState::CodecConfigured => {
            let prefs = channel.preferences(peer, ase.id, ase.dir);
            w.write(ase.dir as u8)?;
            w.write(prefs.framing)?;
            w.write(prefs.phy)?;
            w.write(prefs.rtn)?;
            w.write(prefs.latency)?;
            w.write_u24(prefs.pd_min)?;
            w.write_u24(prefs.pd_max)?;
            w.write(ase.codec.id)?;
            w.write(ase.codec.cid)?;
            w.write(ase.codec.vid)?;
            w.write(ase.config.len() as u8)?;
            w.append(&ase.config)?;
        }
        AseState::QosConfigured => {
            w.write(ase.qos.cig)?;
            w.write(ase.qos.cis)?;
            w.write_u24(ase.qos.interval)?;
            w.write(ase.qos.framing)?;
            w.write(ase.qos.phy)?;
            w.write(ase.qos.sdu)?;
            w.write(ase.qos.rtn)?;
            w.write(ase.qos.latency)?;
            w.write_u24(ase.qos.pd)?;
        }
        AseState::Enabling | AseState::Streaming | AseState::Disabling => {
            w.write(ase.qos.cig)?;
            w.write(ase.qos.cis)?;
            w.write(ase.metadata.len() as u8)?;
            w.append(&ase.metadata)?;
        }
    }
    Ok(w.len())
}
