//! `dana_sim` — a deterministic, persistable simulator of the RS-v1/RS-v3/Dana-I
//! insulin pump BLE GATT protocol.
//!
//! The crate is organized bottom-up, each module owning one layer of the stack:
//!
//! - [`bytes`] — checked-primitive cursors used by every payload encoder/decoder.
//! - [`constants`] — frame types, opcodes, pump generations, history codes.
//! - [`crc`] — the three per-generation CRC-16 variants.
//! - [`keys`] — pairing/BLE-5 key material and the per-generation byte scrambles.
//! - [`codec`] — frame encode/decode: header framing, CRC, scrambles, outer obfuscation.
//! - [`reassembler`] — turns a stream of BLE write fragments into whole frames.
//! - [`state`] — the durable, JSON-backed simulator state.
//! - [`bolus`] — bolus-ticker timing math.
//! - [`command_center`] — opcode dispatch, the handshake, and the bolus ticker loop.
//! - [`simulator`] — the facade wiring store, command center, and transport together.

pub mod bolus;
pub mod bytes;
pub mod codec;
pub mod command_center;
pub mod constants;
pub mod crc;
pub mod error;
pub mod keys;
pub mod reassembler;
pub mod simulator;
pub mod state;

pub use command_center::{CommandCenter, Transport};
pub use constants::PumpType;
pub use error::{Error, Result};
pub use simulator::Simulator;
pub use state::Store;
