// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The RTU frame container and the wire-level code types.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

/// Maximum size of an RTU frame, station address and CRC included.
pub const PDU_MAX: usize = 256;

/// Smallest frame that can carry anything: address, function code, CRC.
pub const MIN_FRAME: usize = 4;

/// Set in the function byte of an exception reply.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Station address. 0 is the broadcast address; device addresses are
/// 1..=247.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RtuAddress(u8);

impl RtuAddress {
    pub const BROADCAST: Self = RtuAddress(0);

    pub const fn new(address: u8) -> Self {
        RtuAddress(address)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }
}

/// The function codes this slave implements.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

/// Exception codes carried in the third byte of an exception reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
}

/// Error returned when a frame would exceed [`PDU_MAX`] bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameOverrun;

/// An RTU frame: `[address][function][payload…][crc lo][crc hi]`, at most
/// [`PDU_MAX`] bytes.
///
/// The container does no validation of its own. It is equally happy
/// holding a half-received fragment or a framed reply. Validation belongs
/// to the PDU framework. The same value serves as indication and, mutated
/// in place by the handler, as the reply.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RtuMessage {
    data: heapless::Vec<u8, PDU_MAX>,
}

impl RtuMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, FrameOverrun> {
        let data =
            heapless::Vec::from_slice(bytes).map_err(|_| FrameOverrun)?;
        Ok(Self { data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// The station address byte. Zero on an empty frame.
    pub fn address(&self) -> RtuAddress {
        RtuAddress(self.data.first().copied().unwrap_or(0))
    }

    /// The function byte, decoded; `None` if absent or not a code this
    /// slave knows.
    pub fn function_code(&self) -> Option<FunctionCode> {
        FunctionCode::from_u8(self.raw_function()?)
    }

    /// The raw function byte, if present.
    pub fn raw_function(&self) -> Option<u8> {
        self.data.get(1).copied()
    }

    pub fn push(&mut self, byte: u8) -> Result<(), FrameOverrun> {
        self.data.push(byte).map_err(|_| FrameOverrun)
    }

    pub fn extend_from_slice(
        &mut self,
        bytes: &[u8],
    ) -> Result<(), FrameOverrun> {
        self.data.extend_from_slice(bytes).map_err(|_| FrameOverrun)
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Reads a big-endian 16-bit field at `offset`.
    pub fn be_u16(&self, offset: usize) -> Option<u16> {
        let hi = *self.data.get(offset)?;
        let lo = *self.data.get(offset + 1)?;
        Some(u16::from_be_bytes([hi, lo]))
    }

    /// Appends the CRC over the current contents, little-endian.
    pub fn append_crc(&mut self) -> Result<(), FrameOverrun> {
        let crc = crate::crc16(&self.data);
        self.extend_from_slice(&crc.to_le_bytes())
    }

    /// Checks the trailing CRC against the rest of the frame. Frames too
    /// short to carry a CRC fail.
    pub fn crc_valid(&self) -> bool {
        if self.data.len() < MIN_FRAME {
            return false;
        }
        let (body, trailer) = self.data.split_at(self.data.len() - 2);
        crate::crc16(body) == u16::from_le_bytes([trailer[0], trailer[1]])
    }
}
