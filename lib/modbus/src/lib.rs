// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Modbus RTU frames and the generic PDU handler framework.
//!
//! This crate is the protocol half of the RTU slave: [`RtuMessage`] is the
//! fixed-capacity frame container that moves between the framing daemon and
//! the handler, and [`PduHandler`] is the statically-dispatched framework
//! that validates a request and executes it against user-supplied coil and
//! register hooks. Framing and bus timing live elsewhere; nothing here
//! blocks or allocates.

#![cfg_attr(not(test), no_std)]

mod message;
mod pdu;

pub use message::{
    ExceptionCode, FrameOverrun, FunctionCode, RtuAddress, RtuMessage,
    EXCEPTION_FLAG, MIN_FRAME, PDU_MAX,
};
pub use pdu::{DeviceFault, PduHandler};

use crc::{Crc, CRC_16_MODBUS};

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16 as used on the RTU wire: polynomial 0xA001 (reflected), initial
/// value 0xFFFF, no final XOR. Stored little-endian in the trailing two
/// bytes of a frame.
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC.checksum(bytes)
}
