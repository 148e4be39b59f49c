//! Opcode, frame-type, pump-generation, and history-code enumerations.
//!
//! Frame types and the two handshake opcodes are reproduced bit-for-bit from the
//! reference (`original_source/server/encryption.go`'s `codes` package references and
//! spec §4.1/§6). The retrieved reference sources never included the `packets/codes.go`
//! file itself, so the numeric assignment of every opcode past the handshake is this
//! crate's own internally-consistent scheme — see `DESIGN.md` for that decision.

use std::ops::RangeInclusive;

/// The `TYPE` byte of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    EncryptionRequest = 0x01,
    EncryptionResponse = 0x02,
    Command = 0xA1,
    Response = 0xB2,
    Notify = 0xC3,
}

impl FrameType {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::EncryptionRequest,
            0x02 => Self::EncryptionResponse,
            0xA1 => Self::Command,
            0xB2 => Self::Response,
            0xC3 => Self::Notify,
            _ => return None,
        })
    }
}

/// Opcodes carried by `ENCRYPTION_REQUEST`/`ENCRYPTION_RESPONSE` frames.
pub mod encryption_opcode {
    pub const PUMP_CHECK: u8 = 0x00;
    pub const TIME_INFORMATION: u8 = 0x01;
}

/// Opcodes carried by `COMMAND`/`RESPONSE`/`NOTIFY` frames.
pub mod opcode {
    pub const KEEP_CONNECTION: u8 = 0xFF;

    pub const INITIAL_SCREEN_INFORMATION: u8 = 0x02;
    pub const GET_PUMP_TIME: u8 = 0x04;
    pub const SET_PUMP_TIME: u8 = 0x05;
    pub const GET_PUMP_UTC_AND_TIME_ZONE: u8 = 0x06;
    pub const SET_PUMP_UTC_AND_TIME_ZONE: u8 = 0x07;

    pub const GET_USER_OPTION: u8 = 0x08;
    pub const SET_USER_OPTION: u8 = 0x09;
    pub const SET_HISTORY_UPLOAD_MODE: u8 = 0x0A;

    pub const SET_STEP_BOLUS_START: u8 = 0x0B;
    pub const SET_STEP_BOLUS_STOP: u8 = 0x0C;

    pub const SET_PROFILE_BASAL_RATE: u8 = 0x0D;
    pub const SET_PROFILE_NUMBER: u8 = 0x0E;
    pub const GET_BASAL_RATE: u8 = 0x14;

    pub const SET_SUSPEND_ON: u8 = 0x0F;
    pub const SET_SUSPEND_OFF: u8 = 0x10;

    pub const SET_TEMPORARY_BASAL: u8 = 0x11;
    pub const APS_SET_TEMPORARY_BASAL: u8 = 0x12;
    pub const CANCEL_TEMPORARY_BASAL: u8 = 0x13;

    pub const GET_STEP_BOLUS_INFORMATION: u8 = 0x15;

    pub const DELIVERY_RATE_DISPLAY: u8 = 0x16;
    pub const DELIVERY_COMPLETE: u8 = 0x17;

    // History replay range. Contiguous so "is this a history opcode" is one range
    // check, matching spec §4.3's "any history-range opcode (BOLUS_AVG..ALL_HISTORY)".
    pub const BOLUS_AVG: u8 = 0xA0;
    pub const DAILY: u8 = 0xA1;
    pub const PRIME: u8 = 0xA2;
    pub const REFILL: u8 = 0xA3;
    pub const GLUCOSE: u8 = 0xA4;
    pub const CARBO: u8 = 0xA5;
    pub const SUSPEND: u8 = 0xA6;
    pub const ALARM: u8 = 0xA7;
    pub const BASALHOUR: u8 = 0xA8;
    pub const TEMP_BASAL: u8 = 0xA9;
    pub const ALL_HISTORY: u8 = 0xAA;

    pub const HISTORY_RANGE: std::ops::RangeInclusive<u8> = BOLUS_AVG..=ALL_HISTORY;
}

pub use opcode::HISTORY_RANGE;

/// Returns the [`HistoryCode`] that a history-request opcode filters on, or `None` for
/// `ALL_HISTORY`, which replays every code.
pub fn history_filter_for_opcode(op: u8) -> Option<Option<HistoryCode>> {
    use opcode::*;
    Some(Some(match op {
        BOLUS_AVG => HistoryCode::Bolus,
        DAILY => HistoryCode::Daily,
        PRIME => HistoryCode::Prime,
        REFILL => HistoryCode::Refill,
        GLUCOSE => HistoryCode::Glucose,
        CARBO => HistoryCode::Carbo,
        SUSPEND => HistoryCode::Suspend,
        ALARM => HistoryCode::Alarm,
        BASALHOUR => HistoryCode::BasalHour,
        TEMP_BASAL => HistoryCode::TempBasal,
        ALL_HISTORY => return Some(None),
        _ => return None,
    }))
}

/// Pump hardware generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PumpType {
    #[serde(rename = "RS_V1")]
    RsV1,
    #[serde(rename = "RS_V3")]
    RsV3,
    #[serde(rename = "DANA_I")]
    DanaI,
}

impl PumpType {
    /// The `enhancedEncryption`/CRC-mix variant selector used by [`crate::crc`].
    pub fn crc_variant(self) -> u8 {
        match self {
            PumpType::RsV1 => 0,
            PumpType::RsV3 => 1,
            PumpType::DanaI => 2,
        }
    }

    pub fn supports_utc_time_zone(self) -> bool {
        matches!(self, PumpType::DanaI)
    }
}

/// One entry in the append-only history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum HistoryCode {
    Bolus = 0x10,
    Daily = 0x11,
    Prime = 0x12,
    Refill = 0x13,
    Glucose = 0x14,
    Carbo = 0x15,
    Suspend = 0x16,
    Alarm = 0x17,
    BasalHour = 0x18,
    TempBasal = 0x19,
}

impl HistoryCode {
    /// The byte written into a history replay frame (`code - 0x0F`, per spec §4.3).
    pub fn wire_code(self) -> u8 {
        self as u8 - 0x0F
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_range_covers_all_history() {
        assert!(HISTORY_RANGE.contains(&opcode::ALL_HISTORY));
        assert!(HISTORY_RANGE.contains(&opcode::BOLUS_AVG));
        assert!(!HISTORY_RANGE.contains(&opcode::KEEP_CONNECTION));
    }

    #[test]
    fn wire_code_matches_spec_offset() {
        assert_eq!(HistoryCode::Bolus.wire_code(), 0x01);
        assert_eq!(HistoryCode::TempBasal.wire_code(), 0x0A);
    }
}
