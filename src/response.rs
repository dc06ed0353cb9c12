//! Aggregated ASE control point response.

use heapless::Vec;

/// Max per-record results carried in one control point notification.
pub const RECORDS_MAX: usize = 16;

/// Number_of_ASEs value signalling a whole-batch failure.
pub const NUM_ASES_ALL: u8 = 0xff;

/// ASE control point response codes.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RspCode {
    Success = 0x00,
    UnsupportedOpcode = 0x01,
    TruncatedOperation = 0x02,
    InvalidAseId = 0x03,
    InvalidAseState = 0x04,
    UnsupportedCapability = 0x05,
    UnsupportedConfiguration = 0x06,
    RejectedConfiguration = 0x07,
    InvalidConfiguration = 0x08,
    UnsupportedMetadata = 0x09,
    RejectedMetadata = 0x0a,
    InvalidMetadata = 0x0b,
    NoMem = 0x0c,
    Unspecified = 0x0d,
}

/// ASE control point response reasons.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reason {
    None = 0x00,
    Direction = 0x01,
    Codec = 0x02,
    CodecDataLen = 0x03,
    CodecData = 0x04,
    Interval = 0x05,
    Framing = 0x06,
    Phy = 0x07,
    Sdu = 0x08,
    Rtn = 0x09,
    Latency = 0x0a,
    PresentationDelay = 0x0b,
    Metadata = 0x0c,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Record {
    id: u8,
    code: RspCode,
    reason: Reason,
}

/// Accumulates one `(id, code, reason)` record per processed item of a
/// control point write, notified as a single batch when the transaction
/// ends.
///
/// A whole-batch failure (`UnsupportedOpcode`, `TruncatedOperation`)
/// forces Number_of_ASEs to the `NUM_ASES_ALL` sentinel. The record that
/// sets the sentinel is still appended; anything added after it is
/// dropped. That asymmetry reproduces the wire behavior of the original
/// implementation.
pub struct ResponseBatch {
    op: u8,
    num: u8,
    records: Vec<Record, RECORDS_MAX>,
}

impl ResponseBatch {
    /// Start a new batch for the given request opcode.
    pub fn new(op: u8) -> Self {
        Self {
            op,
            num: 0,
            records: Vec::new(),
        }
    }

    /// Record the outcome of one item.
    pub fn add(&mut self, id: u8, code: RspCode, reason: Reason) {
        trace!(
            "[ascs] rsp id 0x{:02x} op 0x{:02x} code 0x{:02x} reason 0x{:02x}",
            id,
            self.op,
            code as u8,
            reason as u8
        );

        if self.num == NUM_ASES_ALL {
            return;
        }

        match code {
            // If the Response_Code value is 0x01 or 0x02, Number_of_ASEs
            // shall be set to 0xFF.
            RspCode::UnsupportedOpcode | RspCode::TruncatedOperation => self.num = NUM_ASES_ALL,
            _ => self.num = self.num.wrapping_add(1),
        }

        if self.records.push(Record { id, code, reason }).is_err() {
            warn!("[ascs] response batch full, dropping record for ase 0x{:02x}", id);
        }
    }

    /// Record a successful item.
    pub fn success(&mut self, id: u8) {
        self.add(id, RspCode::Success, Reason::None);
    }

    /// Number_of_ASEs as it will go on the wire.
    pub fn num_ases(&self) -> u8 {
        self.num
    }

    /// Encode the batch into `buf`, returning the encoded length.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let len = 2 + self.records.len() * 3;
        debug_assert!(buf.len() >= len);
        buf[0] = self.op;
        buf[1] = self.num;
        for (i, record) in self.records.iter().enumerate() {
            let at = 2 + i * 3;
            buf[at] = record.id;
            buf[at + 1] = record.code as u8;
            buf[at + 2] = record.reason as u8;
        }
        len
    }
}
