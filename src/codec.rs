//! Frame encode/decode: header framing, CRC, packet-serial scramble, the RS-v1
//! handshake scrambles, and outer ("second-level") obfuscation.
//!
//! Grounded on `original_source/server/encryption.go`'s `encodeMessage` for frame
//! layout and scramble ordering; the outer-obfuscation byte passes come from the
//! per-byte description in spec §4.1, which is the more complete revision (the Go
//! source's `encodePairingKey`/`getDescPairingKey` stop short of the `L`-table stage).

use crate::constants::FrameType;
use crate::constants::PumpType;
use crate::crc::crc16;
use crate::error::{Error, Result};
use crate::keys::{self, Keys};

/// A decoded or to-be-encoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            opcode,
            payload,
        }
    }

    fn is_encryption(&self) -> bool {
        matches!(
            self.frame_type,
            FrameType::EncryptionRequest | FrameType::EncryptionResponse
        )
    }
}

fn obfuscated_start_byte(pump_type: PumpType) -> u8 {
    match pump_type {
        PumpType::RsV3 => 0x7A,
        PumpType::DanaI => 0xAA,
        PumpType::RsV1 => 0xA5,
    }
}

fn obfuscated_end_byte(pump_type: PumpType) -> u8 {
    match pump_type {
        PumpType::RsV3 => 0x2E,
        PumpType::DanaI => 0xEE,
        PumpType::RsV1 => 0x5A,
    }
}

/// Per-connection codec state: device name, pairing/BLE-5 keys, and the RS-v3 rolling
/// sync key. One instance lives per open connection and is reset on disconnect (per
/// spec §9, the rolling key must not be a global).
#[derive(Debug, Clone)]
pub struct Codec {
    pub pump_type: PumpType,
    pub device_name: String,
    pub keys: Keys,
    pub random_sync_key: u8,
}

impl Codec {
    pub fn new(pump_type: PumpType, device_name: String) -> Self {
        Self {
            pump_type,
            device_name,
            keys: Keys::default(),
            random_sync_key: 0,
        }
    }

    /// Clears the rolling key and pairing material, matching a pairing-handshake
    /// restart (spec §3 invariant: `randomSyncKey` resets to zero then).
    pub fn reset_pairing(&mut self) {
        self.keys = Keys::default();
        self.random_sync_key = 0;
    }

    fn apply_outer_encode(&mut self, buf: &mut [u8]) {
        match self.pump_type {
            PumpType::RsV3 => {
                for b in buf.iter_mut() {
                    let (c, k) = keys::rs_v3_encode_byte(*b, self.random_sync_key, &self.keys);
                    *b = c;
                    self.random_sync_key = k;
                }
            }
            PumpType::DanaI => {
                for b in buf.iter_mut() {
                    *b = keys::dana_i_encode_byte(*b, &self.keys);
                }
            }
            PumpType::RsV1 => {}
        }
    }

    fn apply_outer_decode(&mut self, buf: &mut [u8]) {
        match self.pump_type {
            PumpType::RsV3 => {
                for b in buf.iter_mut() {
                    let (p, k) = keys::rs_v3_decode_byte(*b, self.random_sync_key, &self.keys);
                    *b = p;
                    self.random_sync_key = k;
                }
            }
            PumpType::DanaI => {
                for b in buf.iter_mut() {
                    *b = keys::dana_i_decode_byte(*b, &self.keys);
                }
            }
            PumpType::RsV1 => {}
        }
    }

    /// Encodes a frame. `secure` reflects the session's promoted/not-promoted state;
    /// outer obfuscation is applied only when `secure` is true and the frame is not a
    /// handshake frame, and never for RS-v1, which has no outer pass.
    pub fn encode(&mut self, frame: &Frame, secure: bool) -> Vec<u8> {
        let is_enc = frame.is_encryption();
        let len = 2 + frame.payload.len() as u8;

        let mut buf = Vec::with_capacity(7 + frame.payload.len());
        buf.push(0xA5);
        buf.push(0xA5);
        buf.push(len);
        buf.push(frame.frame_type as u8);
        buf.push(frame.opcode);
        buf.extend_from_slice(&frame.payload);

        let crc = crc16(&buf[3..5 + frame.payload.len()], self.pump_type, is_enc);
        buf.push((crc >> 8) as u8);
        buf.push((crc & 0xFF) as u8);
        buf.push(0x5A);
        buf.push(0x5A);

        let end = buf.len();
        keys::serial_scramble(&mut buf[3..end - 2], &self.device_name);

        if is_enc && frame.frame_type == FrameType::EncryptionResponse && self.pump_type == PumpType::RsV1 {
            keys::time_scramble(&mut buf[3..end - 2], &self.keys.time_secret);
            keys::password_scramble(&mut buf[3..end - 2], &self.keys.password_secret);
            keys::passkey_scramble(&mut buf[3..end - 2], &self.keys.pass_key_secret);
        }

        if secure && !is_enc && self.pump_type != PumpType::RsV1 {
            self.apply_outer_encode(&mut buf[3..end - 2]);
            buf[0] = obfuscated_start_byte(self.pump_type);
            buf[1] = obfuscated_start_byte(self.pump_type);
            buf[end - 2] = obfuscated_end_byte(self.pump_type);
            buf[end - 1] = obfuscated_end_byte(self.pump_type);
        }

        buf
    }

    /// Decodes one whole, already-reassembled frame. `obfuscated` comes from the
    /// [`crate::reassembler::Reassembler`]'s detection of which sentinel pair framed
    /// this buffer.
    pub fn decode(&mut self, raw: &[u8], obfuscated: bool) -> Result<(FrameType, u8, Vec<u8>)> {
        if raw.len() < 7 {
            return Err(Error::GarbledFrame);
        }
        let mut buf = raw.to_vec();
        let end = buf.len();

        if obfuscated {
            buf[0] = 0xA5;
            buf[1] = 0xA5;
            buf[end - 2] = 0x5A;
            buf[end - 1] = 0x5A;
            self.apply_outer_decode(&mut buf[3..end - 2]);
        }

        if buf[0] != 0xA5 || buf[1] != 0xA5 || buf[end - 2] != 0x5A || buf[end - 1] != 0x5A {
            return Err(Error::GarbledFrame);
        }

        let len = buf[2] as usize;
        if buf.len() != len + 7 {
            return Err(Error::InvalidLength);
        }

        let frame_type = FrameType::from_u8(buf[3]).ok_or(Error::InvalidValue)?;
        let is_enc = matches!(frame_type, FrameType::EncryptionRequest | FrameType::EncryptionResponse);

        if is_enc && frame_type == FrameType::EncryptionResponse && self.pump_type == PumpType::RsV1 {
            keys::passkey_scramble(&mut buf[3..end - 2], &self.keys.pass_key_secret);
            keys::password_scramble(&mut buf[3..end - 2], &self.keys.password_secret);
            keys::time_scramble(&mut buf[3..end - 2], &self.keys.time_secret);
        }

        keys::serial_scramble(&mut buf[3..end - 2], &self.device_name);

        let opcode = buf[4];
        let payload_len = len - 2;
        let payload = buf[5..5 + payload_len].to_vec();

        let computed = crc16(&buf[3..5 + payload_len], self.pump_type, is_enc);
        let received = u16::from_be_bytes([buf[5 + payload_len], buf[6 + payload_len]]);
        if computed != received {
            return Err(Error::CrcMismatch {
                expected: received,
                computed,
            });
        }

        Ok((frame_type, opcode, payload))
    }
}
