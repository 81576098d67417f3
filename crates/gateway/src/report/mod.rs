// BSD-2-Clause

//! Report wire formats: `Individual` and `SignedList`.

pub mod assembler;
pub mod codec;

use serde::{Deserialize, Serialize};

use crate::error::{malformed_report, GatewayResult};
use crate::model::DeviceId;

/// One timestamped sensor value belonging to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    pub stream_id: u16,
    pub reading_id: u32,
    pub timestamp: u32,
    pub value: u32,
}

pub const INDIVIDUAL_LEN: usize = 20;
pub const READING_LEN: usize = 16;
pub const SIGNED_HEADER_LEN: usize = 36;
pub const SIGNED_FOOTER_LEN: usize = 24;
pub const SIGNATURE_LEN: usize = 16;

pub const FORMAT_CODE_INDIVIDUAL: u8 = 1;
pub const FORMAT_CODE_SIGNED_LIST: u8 = 2;

/// Magic value stamped into every `SignedList` header.
pub const SIGNED_LIST_MAGIC: u32 = 0x454C_4954; // "TILE" little-endian

/// Key type used to sign/verify a report (2-bit field in `flags`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    None,
    Device,
    User,
    Broadcast,
}

impl KeyType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::None,
            1 => Self::Device,
            2 => Self::User,
            _ => Self::Broadcast,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Device => 1,
            Self::User => 2,
            Self::Broadcast => 3,
        }
    }
}

/// Decoded `flags` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFlags {
    pub encrypted: bool,
    pub key_type: KeyType,
}

impl ReportFlags {
    pub fn from_byte(byte: u8) -> Self {
        Self { encrypted: byte & 0b0000_0100 != 0, key_type: KeyType::from_bits(byte >> 3) }
    }

    pub fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.encrypted {
            b |= 0b0000_0100;
        }
        b |= self.key_type.to_bits() << 3;
        b
    }
}

/// An assembled, validated report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Report {
    Individual(IndividualReport),
    SignedList(SignedListReport),
}

impl Report {
    pub fn device_id(&self) -> Option<DeviceId> {
        match self {
            Report::Individual(_) => None,
            Report::SignedList(r) => Some(r.device_id),
        }
    }
}

/// A single-reading, unsigned, 20-byte report used for realtime data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndividualReport {
    pub stream_id: u16,
    pub reading_id: u32,
    pub reading_timestamp: u32,
    pub reading_value: u32,
    pub sent_timestamp: u32,
}

impl IndividualReport {
    pub fn encode(&self) -> [u8; INDIVIDUAL_LEN] {
        let mut buf = [0u8; INDIVIDUAL_LEN];
        buf[0] = FORMAT_CODE_INDIVIDUAL;
        buf[1] = 0;
        buf[2..4].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.reading_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.reading_timestamp.to_le_bytes());
        buf[12..16].copy_from_slice(&self.reading_value.to_le_bytes());
        buf[16..20].copy_from_slice(&self.sent_timestamp.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> GatewayResult<Self> {
        if buf.len() != INDIVIDUAL_LEN {
            return Err(malformed_report(format!(
                "individual report must be {INDIVIDUAL_LEN} bytes, got {}",
                buf.len()
            )));
        }
        if buf[0] != FORMAT_CODE_INDIVIDUAL {
            return Err(malformed_report("unexpected format_code for individual report"));
        }
        Ok(Self {
            stream_id: u16::from_le_bytes([buf[2], buf[3]]),
            reading_id: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            reading_timestamp: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            reading_value: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            sent_timestamp: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
        })
    }

    pub fn reading(&self) -> Reading {
        Reading {
            stream_id: self.stream_id,
            reading_id: self.reading_id,
            timestamp: self.reading_timestamp,
            value: self.reading_value,
        }
    }
}

/// Header of a `SignedList` report. Carries `magic`/`report_id`/`selector`/
/// `sent_timestamp` alongside the length-and-flags word, so the header is
/// wider than the minimal length+flags+reading_count triple would require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedListHeader {
    pub magic: u32,
    pub length: u32,
    pub flags: ReportFlags,
    pub reading_count: u32,
    pub device_id: DeviceId,
    pub report_id: u32,
    pub sent_timestamp: u32,
    pub selector: u16,
}

impl SignedListHeader {
    pub fn encode(&self) -> [u8; SIGNED_HEADER_LEN] {
        let mut buf = [0u8; SIGNED_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4] = FORMAT_CODE_SIGNED_LIST;
        buf[5] = 0;
        let length_low = (self.length & 0xFFFF) as u16;
        let length_high = ((self.length >> 16) & 0xFF) as u32;
        let word = length_high | (u32::from(self.flags.to_byte()) << 24);
        buf[6..8].copy_from_slice(&length_low.to_le_bytes());
        buf[8..12].copy_from_slice(&word.to_le_bytes());
        buf[12..16].copy_from_slice(&self.reading_count.to_le_bytes());
        buf[16..20].copy_from_slice(&((self.device_id & 0xFFFF_FFFF) as u32).to_le_bytes());
        buf[20..24].copy_from_slice(&((self.device_id >> 32) as u32).to_le_bytes());
        buf[24..28].copy_from_slice(&self.report_id.to_le_bytes());
        buf[28..32].copy_from_slice(&self.sent_timestamp.to_le_bytes());
        buf[32..34].copy_from_slice(&self.selector.to_le_bytes());
        buf[34..36].copy_from_slice(&0u16.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> GatewayResult<Self> {
        if buf.len() < SIGNED_HEADER_LEN {
            return Err(malformed_report("signed list header truncated"));
        }
        if buf[4] != FORMAT_CODE_SIGNED_LIST {
            return Err(malformed_report("unexpected format_code for signed list report"));
        }
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != SIGNED_LIST_MAGIC {
            return Err(malformed_report("bad magic in signed list header"));
        }
        let length_low = u16::from_le_bytes([buf[6], buf[7]]);
        let word = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let length = u32::from(length_low) | ((word & 0xFF) << 16);
        let flags = ReportFlags::from_byte((word >> 24) as u8);
        let reading_count = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let device_id_low = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let device_id_high = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);
        let device_id = u64::from(device_id_low) | (u64::from(device_id_high) << 32);
        let report_id = u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]);
        let sent_timestamp = u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]);
        let selector = u16::from_le_bytes([buf[32], buf[33]]);
        Ok(Self { magic, length, flags, reading_count, device_id, report_id, sent_timestamp, selector })
    }
}

/// A signed, optionally encrypted, list of readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedListReport {
    pub device_id: DeviceId,
    pub report_id: u32,
    pub sent_timestamp: u32,
    pub flags: ReportFlags,
    pub selector: u16,
    pub readings: Vec<Reading>,
    pub lowest_reading_id: u32,
    pub highest_reading_id: u32,
    pub signature: [u8; SIGNATURE_LEN],
}

impl SignedListReport {
    pub fn wire_len(reading_count: usize) -> usize {
        SIGNED_HEADER_LEN + reading_count * READING_LEN + SIGNED_FOOTER_LEN
    }

    fn header(&self) -> SignedListHeader {
        SignedListHeader {
            magic: SIGNED_LIST_MAGIC,
            length: Self::wire_len(self.readings.len()) as u32,
            flags: self.flags,
            reading_count: self.readings.len() as u32,
            device_id: self.device_id,
            report_id: self.report_id,
            sent_timestamp: self.sent_timestamp,
            selector: self.selector,
        }
    }

    /// Encode the full report with `signature` as provided (callers
    /// typically zero it first, sign via `codec`, then re-encode — see
    /// `codec::sign`).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::wire_len(self.readings.len()));
        buf.extend_from_slice(&self.header().encode());
        for reading in &self.readings {
            buf.extend_from_slice(&reading.stream_id.to_le_bytes());
            buf.extend_from_slice(&0u16.to_le_bytes());
            buf.extend_from_slice(&reading.reading_id.to_le_bytes());
            buf.extend_from_slice(&reading.timestamp.to_le_bytes());
            buf.extend_from_slice(&reading.value.to_le_bytes());
        }
        buf.extend_from_slice(&self.lowest_reading_id.to_le_bytes());
        buf.extend_from_slice(&self.highest_reading_id.to_le_bytes());
        buf.extend_from_slice(&self.signature);
        buf
    }

    /// Decode from a fully-buffered wire representation (the bytes named by
    /// the already-parsed header's `length`). Does not verify the
    /// signature — see `codec::verify`.
    pub fn decode(buf: &[u8]) -> GatewayResult<Self> {
        let header = SignedListHeader::decode(buf)?;
        let expected_len = Self::wire_len(header.reading_count as usize);
        if buf.len() != expected_len || header.length as usize != expected_len {
            return Err(malformed_report(format!(
                "signed list length mismatch: header says {}, buffer is {}, expected {}",
                header.length,
                buf.len(),
                expected_len
            )));
        }

        let mut readings = Vec::with_capacity(header.reading_count as usize);
        let mut offset = SIGNED_HEADER_LEN;
        let mut prev_id: Option<u32> = None;
        for _ in 0..header.reading_count {
            let chunk = &buf[offset..offset + READING_LEN];
            let stream_id = u16::from_le_bytes([chunk[0], chunk[1]]);
            let reading_id = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            let timestamp = u32::from_le_bytes([chunk[8], chunk[9], chunk[10], chunk[11]]);
            let value = u32::from_le_bytes([chunk[12], chunk[13], chunk[14], chunk[15]]);
            if let Some(prev) = prev_id {
                if reading_id < prev {
                    return Err(malformed_report("reading ids must be non-decreasing"));
                }
            }
            prev_id = Some(reading_id);
            readings.push(Reading { stream_id, reading_id, timestamp, value });
            offset += READING_LEN;
        }

        let footer = &buf[offset..offset + SIGNED_FOOTER_LEN];
        let lowest_reading_id = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
        let highest_reading_id = u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]]);
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&footer[8..8 + SIGNATURE_LEN]);

        Ok(Self {
            device_id: header.device_id,
            report_id: header.report_id,
            sent_timestamp: header.sent_timestamp,
            flags: header.flags,
            selector: header.selector,
            readings,
            lowest_reading_id,
            highest_reading_id,
            signature,
        })
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
