// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The generic PDU handler framework.
//!
//! [`PduHandler`] is implemented by a device object that declares, per
//! function family, whether the family is supported, whether a data address
//! range is valid, and how to read or write a single item. Every hook has a
//! default: unsupported families answer IllegalFunction, and address
//! validators accept everything. That is safe, because support is the
//! gate.
//!
//! [`PduHandler::handle_indication`] runs the whole pipeline over a frame
//! in place: CRC and address gates, per-code validation in the order
//! supported → data address → data value → execute, reply construction, and
//! the trailing CRC. On return the frame either holds a fully framed reply
//! or is empty, meaning nothing must be transmitted (broadcast, wrong
//! address, or a corrupt frame).
//!
//! Dispatch is monomorphised: a handler that leaves a family unsupported
//! compiles that family's path down to the constant exception reply.

use crate::message::{
    ExceptionCode, FrameOverrun, FunctionCode, RtuAddress, RtuMessage,
    EXCEPTION_FLAG, MIN_FRAME,
};

/// Returned by a hook whose device-side operation failed; surfaces to the
/// master as a ServerDeviceFailure exception.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceFault;

const READ_WRITE_COILS_MAX: u16 = 0x07B0;
const READ_REGISTERS_MAX: u16 = 0x007D;
const WRITE_REGISTERS_MAX: u16 = 0x007B;

/// Packed-bit buffer large enough for the biggest legal coil read/write.
const BIT_BYTES_MAX: usize = (READ_WRITE_COILS_MAX as usize + 7) / 8;

/// Echoed prefix of a write-multiple request: address, function, start,
/// quantity.
const WRITE_MULTIPLE_ECHO_LEN: usize = 6;

pub trait PduHandler {
    /// The station address this device answers to (1..=247).
    fn slave_address(&self) -> RtuAddress;

    // Coils: 0x01 read, 0x05 / 0x0F write.
    fn is_read_coils_supported(&self) -> bool {
        false
    }
    fn is_read_coils_valid_data_address(
        &self,
        _address: u16,
        _bit_count: u16,
    ) -> bool {
        true
    }
    fn read_single_coil(&mut self, _address: u16) -> Result<bool, DeviceFault> {
        Err(DeviceFault)
    }

    fn is_write_coils_supported(&self) -> bool {
        false
    }
    fn is_write_coils_valid_data_address(
        &self,
        _address: u16,
        _bit_count: u16,
    ) -> bool {
        true
    }
    fn is_write_single_coil_supported(&self) -> bool {
        self.is_write_coils_supported()
    }
    fn is_write_single_coil_valid_data_address(&self, address: u16) -> bool {
        self.is_write_coils_valid_data_address(address, 1)
    }
    fn write_single_coil(
        &mut self,
        _address: u16,
        _on: bool,
    ) -> Result<(), DeviceFault> {
        Err(DeviceFault)
    }

    // Discrete inputs: 0x02.
    fn is_read_discrete_inputs_supported(&self) -> bool {
        false
    }
    fn is_read_discrete_inputs_valid_data_address(
        &self,
        _address: u16,
        _bit_count: u16,
    ) -> bool {
        true
    }
    fn read_single_discrete_input(
        &mut self,
        _address: u16,
    ) -> Result<bool, DeviceFault> {
        Err(DeviceFault)
    }

    // Holding registers: 0x03 read, 0x06 / 0x10 write.
    fn is_read_registers_supported(&self) -> bool {
        false
    }
    fn is_read_registers_valid_data_address(
        &self,
        _address: u16,
        _register_count: u16,
    ) -> bool {
        true
    }
    fn read_single_register(
        &mut self,
        _address: u16,
    ) -> Result<u16, DeviceFault> {
        Err(DeviceFault)
    }

    fn is_write_registers_supported(&self) -> bool {
        false
    }
    fn is_write_registers_valid_data_address(
        &self,
        _address: u16,
        _register_count: u16,
    ) -> bool {
        true
    }
    fn is_write_single_register_supported(&self) -> bool {
        self.is_write_registers_supported()
    }
    fn write_single_register(
        &mut self,
        _address: u16,
        _value: u16,
    ) -> Result<(), DeviceFault> {
        Err(DeviceFault)
    }

    // Input registers: 0x04.
    fn is_read_input_registers_supported(&self) -> bool {
        false
    }
    fn is_read_input_registers_valid_data_address(
        &self,
        _address: u16,
        _register_count: u16,
    ) -> bool {
        true
    }
    fn read_single_input_register(
        &mut self,
        _address: u16,
    ) -> Result<u16, DeviceFault> {
        Err(DeviceFault)
    }

    /// Transforms an indication into its reply in place. An empty frame on
    /// return means no transmission is required.
    fn handle_indication(&mut self, frame: &mut RtuMessage)
    where
        Self: Sized,
    {
        process(self, frame)
    }
}

fn process<H: PduHandler>(handler: &mut H, frame: &mut RtuMessage) {
    // Corrupt frames are dropped without a reply; the master's timeout is
    // the only signal it gets.
    if frame.len() < MIN_FRAME || !frame.crc_valid() {
        frame.clear();
        return;
    }
    let address = frame.address();
    if address != handler.slave_address() && !address.is_broadcast() {
        frame.clear();
        return;
    }

    // Work on the bare PDU; the reply CRC is appended at the end.
    frame.truncate(frame.len() - 2);
    if execute_function(handler, frame).is_err() {
        frame.clear();
        return;
    }

    // A broadcast executes for its side-effects only. No reply, not even an
    // exception.
    if address.is_broadcast() {
        frame.clear();
    } else if frame.append_crc().is_err() {
        frame.clear();
    }
}

fn execute_function<H: PduHandler>(
    handler: &mut H,
    frame: &mut RtuMessage,
) -> Result<(), FrameOverrun> {
    match frame.function_code() {
        Some(FunctionCode::ReadCoils) => {
            read_bits(handler, frame, BitSpace::Coil)
        }
        Some(FunctionCode::ReadDiscreteInputs) => {
            read_bits(handler, frame, BitSpace::DiscreteInput)
        }
        Some(FunctionCode::ReadHoldingRegisters) => {
            read_registers(handler, frame, RegisterSpace::Holding)
        }
        Some(FunctionCode::ReadInputRegisters) => {
            read_registers(handler, frame, RegisterSpace::Input)
        }
        Some(FunctionCode::WriteSingleCoil) => {
            write_single_coil(handler, frame)
        }
        Some(FunctionCode::WriteSingleRegister) => {
            write_single_register(handler, frame)
        }
        Some(FunctionCode::WriteMultipleCoils) => write_coils(handler, frame),
        Some(FunctionCode::WriteMultipleRegisters) => {
            write_registers(handler, frame)
        }
        None => exception_reply(frame, ExceptionCode::IllegalFunction),
    }
}

#[derive(Copy, Clone)]
enum BitSpace {
    Coil,
    DiscreteInput,
}

#[derive(Copy, Clone)]
enum RegisterSpace {
    Holding,
    Input,
}

/// The (address, quantity) pair every request carries at offsets 2 and 4.
/// Absence means the request is too short to mean anything.
fn request_fields(frame: &RtuMessage) -> Option<(u16, u16)> {
    Some((frame.be_u16(2)?, frame.be_u16(4)?))
}

fn read_bits<H: PduHandler>(
    handler: &mut H,
    frame: &mut RtuMessage,
    space: BitSpace,
) -> Result<(), FrameOverrun> {
    let Some((address, bit_count)) = request_fields(frame) else {
        return exception_reply(frame, ExceptionCode::IllegalDataValue);
    };

    let supported = match space {
        BitSpace::Coil => handler.is_read_coils_supported(),
        BitSpace::DiscreteInput => {
            handler.is_read_discrete_inputs_supported()
        }
    };
    if !supported {
        return exception_reply(frame, ExceptionCode::IllegalFunction);
    }
    let address_valid = match space {
        BitSpace::Coil => {
            handler.is_read_coils_valid_data_address(address, bit_count)
        }
        BitSpace::DiscreteInput => handler
            .is_read_discrete_inputs_valid_data_address(address, bit_count),
    };
    if !address_valid {
        return exception_reply(frame, ExceptionCode::IllegalDataAddress);
    }
    if !(1..=READ_WRITE_COILS_MAX).contains(&bit_count) {
        return exception_reply(frame, ExceptionCode::IllegalDataValue);
    }

    let mut bytes = [0u8; BIT_BYTES_MAX];
    for i in 0..bit_count {
        let item = match space {
            BitSpace::Coil => {
                handler.read_single_coil(address.wrapping_add(i))
            }
            BitSpace::DiscreteInput => {
                handler.read_single_discrete_input(address.wrapping_add(i))
            }
        };
        match item {
            // LSB-first packing within each byte.
            Ok(true) => bytes[usize::from(i / 8)] |= 1u8 << (i % 8),
            Ok(false) => (),
            Err(DeviceFault) => {
                return exception_reply(
                    frame,
                    ExceptionCode::ServerDeviceFailure,
                )
            }
        }
    }

    let byte_count = (usize::from(bit_count) + 7) / 8;
    frame.truncate(2);
    frame.push(byte_count as u8)?;
    frame.extend_from_slice(&bytes[..byte_count])
}

fn read_registers<H: PduHandler>(
    handler: &mut H,
    frame: &mut RtuMessage,
    space: RegisterSpace,
) -> Result<(), FrameOverrun> {
    let Some((address, register_count)) = request_fields(frame) else {
        return exception_reply(frame, ExceptionCode::IllegalDataValue);
    };

    let supported = match space {
        RegisterSpace::Holding => handler.is_read_registers_supported(),
        RegisterSpace::Input => handler.is_read_input_registers_supported(),
    };
    if !supported {
        return exception_reply(frame, ExceptionCode::IllegalFunction);
    }
    let address_valid = match space {
        RegisterSpace::Holding => handler
            .is_read_registers_valid_data_address(address, register_count),
        RegisterSpace::Input => handler
            .is_read_input_registers_valid_data_address(
                address,
                register_count,
            ),
    };
    if !address_valid {
        return exception_reply(frame, ExceptionCode::IllegalDataAddress);
    }
    if !(1..=READ_REGISTERS_MAX).contains(&register_count) {
        return exception_reply(frame, ExceptionCode::IllegalDataValue);
    }

    let mut words = [0u16; READ_REGISTERS_MAX as usize];
    for i in 0..register_count {
        let word = match space {
            RegisterSpace::Holding => {
                handler.read_single_register(address.wrapping_add(i))
            }
            RegisterSpace::Input => {
                handler.read_single_input_register(address.wrapping_add(i))
            }
        };
        match word {
            Ok(value) => words[usize::from(i)] = value,
            Err(DeviceFault) => {
                return exception_reply(
                    frame,
                    ExceptionCode::ServerDeviceFailure,
                )
            }
        }
    }

    frame.truncate(2);
    frame.push((register_count * 2) as u8)?;
    for word in &words[..usize::from(register_count)] {
        frame.extend_from_slice(&word.to_be_bytes())?;
    }
    Ok(())
}

fn write_single_coil<H: PduHandler>(
    handler: &mut H,
    frame: &mut RtuMessage,
) -> Result<(), FrameOverrun> {
    let Some((address, value)) = request_fields(frame) else {
        return exception_reply(frame, ExceptionCode::IllegalDataValue);
    };

    if !handler.is_write_single_coil_supported() {
        return exception_reply(frame, ExceptionCode::IllegalFunction);
    }
    if !handler.is_write_single_coil_valid_data_address(address) {
        return exception_reply(frame, ExceptionCode::IllegalDataAddress);
    }
    if value != 0x0000 && value != 0xFF00 {
        return exception_reply(frame, ExceptionCode::IllegalDataValue);
    }
    if handler.write_single_coil(address, value == 0xFF00).is_err() {
        return exception_reply(frame, ExceptionCode::ServerDeviceFailure);
    }

    // Reply is the indication minus CRC, which is what the frame already
    // holds.
    Ok(())
}

fn write_single_register<H: PduHandler>(
    handler: &mut H,
    frame: &mut RtuMessage,
) -> Result<(), FrameOverrun> {
    let Some((address, value)) = request_fields(frame) else {
        return exception_reply(frame, ExceptionCode::IllegalDataValue);
    };

    if !handler.is_write_single_register_supported() {
        return exception_reply(frame, ExceptionCode::IllegalFunction);
    }
    // Single-register writes share the multi-write address validator with a
    // quantity of one; any 16-bit value is legal.
    if !handler.is_write_registers_valid_data_address(address, 1) {
        return exception_reply(frame, ExceptionCode::IllegalDataAddress);
    }
    if handler.write_single_register(address, value).is_err() {
        return exception_reply(frame, ExceptionCode::ServerDeviceFailure);
    }

    Ok(())
}

fn write_coils<H: PduHandler>(
    handler: &mut H,
    frame: &mut RtuMessage,
) -> Result<(), FrameOverrun> {
    let Some((address, bit_count)) = request_fields(frame) else {
        return exception_reply(frame, ExceptionCode::IllegalDataValue);
    };

    if !handler.is_write_coils_supported() {
        return exception_reply(frame, ExceptionCode::IllegalFunction);
    }
    if !handler.is_write_coils_valid_data_address(address, bit_count) {
        return exception_reply(frame, ExceptionCode::IllegalDataAddress);
    }

    let byte_count = frame.as_slice().get(6).copied();
    let count_valid = (1..=READ_WRITE_COILS_MAX).contains(&bit_count)
        && byte_count
            == Some(((usize::from(bit_count) + 7) / 8) as u8);
    let payload_present = byte_count
        .is_some_and(|bc| frame.len() >= 7 + usize::from(bc));
    if !count_valid || !payload_present {
        return exception_reply(frame, ExceptionCode::IllegalDataValue);
    }

    let byte_count = usize::from(byte_count.unwrap_or(0));
    let mut bits = [0u8; BIT_BYTES_MAX];
    bits[..byte_count]
        .copy_from_slice(&frame.as_slice()[7..7 + byte_count]);

    for i in 0..bit_count {
        let on = bits[usize::from(i / 8)] & (1u8 << (i % 8)) != 0;
        if handler
            .write_single_coil(address.wrapping_add(i), on)
            .is_err()
        {
            return exception_reply(
                frame,
                ExceptionCode::ServerDeviceFailure,
            );
        }
    }

    frame.truncate(WRITE_MULTIPLE_ECHO_LEN);
    Ok(())
}

fn write_registers<H: PduHandler>(
    handler: &mut H,
    frame: &mut RtuMessage,
) -> Result<(), FrameOverrun> {
    let Some((address, register_count)) = request_fields(frame) else {
        return exception_reply(frame, ExceptionCode::IllegalDataValue);
    };

    if !handler.is_write_registers_supported() {
        return exception_reply(frame, ExceptionCode::IllegalFunction);
    }
    if !handler
        .is_write_registers_valid_data_address(address, register_count)
    {
        return exception_reply(frame, ExceptionCode::IllegalDataAddress);
    }

    let byte_count = frame.as_slice().get(6).copied();
    let count_valid = (1..=WRITE_REGISTERS_MAX).contains(&register_count)
        && byte_count == Some((register_count * 2) as u8);
    let payload_present = byte_count
        .is_some_and(|bc| frame.len() >= 7 + usize::from(bc));
    if !count_valid || !payload_present {
        return exception_reply(frame, ExceptionCode::IllegalDataValue);
    }

    let mut words = [0u16; WRITE_REGISTERS_MAX as usize];
    for i in 0..usize::from(register_count) {
        let offset = 7 + 2 * i;
        let hi = frame.as_slice()[offset];
        let lo = frame.as_slice()[offset + 1];
        words[i] = u16::from_be_bytes([hi, lo]);
    }

    for (i, &word) in
        words[..usize::from(register_count)].iter().enumerate()
    {
        if handler
            .write_single_register(address.wrapping_add(i as u16), word)
            .is_err()
        {
            return exception_reply(
                frame,
                ExceptionCode::ServerDeviceFailure,
            );
        }
    }

    frame.truncate(WRITE_MULTIPLE_ECHO_LEN);
    Ok(())
}

fn exception_reply(
    frame: &mut RtuMessage,
    code: ExceptionCode,
) -> Result<(), FrameOverrun> {
    // Both bytes exist: the CRC/length gate ran before dispatch.
    let address = frame.as_slice()[0];
    let function = frame.as_slice()[1] | EXCEPTION_FLAG;
    frame.clear();
    frame.push(address)?;
    frame.push(function)?;
    frame.push(code as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    /// A device with every family supported: registers live in maps, bit
    /// reads are computed from the address, writes are recorded.
    struct TestDevice {
        address: RtuAddress,
        holding: HashMap<u16, u16>,
        input: HashMap<u16, u16>,
        coil_writes: Vec<(u16, bool)>,
        register_writes: Vec<(u16, u16)>,
        hook_calls: usize,
        fail: bool,
    }

    impl TestDevice {
        fn new() -> Self {
            Self {
                address: RtuAddress::new(0x01),
                holding: HashMap::new(),
                input: HashMap::new(),
                coil_writes: Vec::new(),
                register_writes: Vec::new(),
                hook_calls: 0,
                fail: false,
            }
        }

        fn with_holding(values: &[(u16, u16)]) -> Self {
            let mut device = Self::new();
            device.holding = values.iter().copied().collect();
            device
        }
    }

    impl PduHandler for TestDevice {
        fn slave_address(&self) -> RtuAddress {
            self.address
        }

        fn is_read_coils_supported(&self) -> bool {
            true
        }
        fn read_single_coil(
            &mut self,
            address: u16,
        ) -> Result<bool, DeviceFault> {
            self.hook_calls += 1;
            if self.fail {
                return Err(DeviceFault);
            }
            Ok(address % 3 == 0)
        }

        fn is_read_discrete_inputs_supported(&self) -> bool {
            true
        }
        fn read_single_discrete_input(
            &mut self,
            address: u16,
        ) -> Result<bool, DeviceFault> {
            self.hook_calls += 1;
            Ok(address % 2 == 0)
        }

        fn is_read_registers_supported(&self) -> bool {
            true
        }
        fn is_read_registers_valid_data_address(
            &self,
            address: u16,
            register_count: u16,
        ) -> bool {
            u32::from(address) + u32::from(register_count) <= 0x1000
        }
        fn read_single_register(
            &mut self,
            address: u16,
        ) -> Result<u16, DeviceFault> {
            self.hook_calls += 1;
            if self.fail {
                return Err(DeviceFault);
            }
            Ok(self.holding.get(&address).copied().unwrap_or(0))
        }

        fn is_read_input_registers_supported(&self) -> bool {
            true
        }
        fn read_single_input_register(
            &mut self,
            address: u16,
        ) -> Result<u16, DeviceFault> {
            self.hook_calls += 1;
            Ok(self.input.get(&address).copied().unwrap_or(0xFFFF))
        }

        fn is_write_coils_supported(&self) -> bool {
            true
        }
        fn write_single_coil(
            &mut self,
            address: u16,
            on: bool,
        ) -> Result<(), DeviceFault> {
            self.hook_calls += 1;
            if self.fail {
                return Err(DeviceFault);
            }
            self.coil_writes.push((address, on));
            Ok(())
        }

        fn is_write_registers_supported(&self) -> bool {
            true
        }
        fn write_single_register(
            &mut self,
            address: u16,
            value: u16,
        ) -> Result<(), DeviceFault> {
            self.hook_calls += 1;
            if self.fail {
                return Err(DeviceFault);
            }
            self.register_writes.push((address, value));
            self.holding.insert(address, value);
            Ok(())
        }
    }

    /// A device that overrides nothing but its address.
    struct BareDevice;

    impl PduHandler for BareDevice {
        fn slave_address(&self) -> RtuAddress {
            RtuAddress::new(0x01)
        }
    }

    fn framed(body: &[u8]) -> RtuMessage {
        let mut frame = RtuMessage::from_slice(body).unwrap();
        frame.append_crc().unwrap();
        frame
    }

    fn run(device: &mut impl PduHandler, body: &[u8]) -> RtuMessage {
        let mut frame = framed(body);
        device.handle_indication(&mut frame);
        frame
    }

    #[track_caller]
    fn expect_exception(
        reply: &RtuMessage,
        function: u8,
        code: ExceptionCode,
    ) {
        assert_eq!(reply.len(), 5, "exception replies are 3 bytes + CRC");
        assert_eq!(reply.as_slice()[0], 0x01);
        assert_eq!(reply.as_slice()[1], function | EXCEPTION_FLAG);
        assert_eq!(reply.as_slice()[2], code as u8);
        assert!(reply.crc_valid());
    }

    #[test]
    fn read_two_holding_registers() {
        let mut device =
            TestDevice::with_holding(&[(0x0002, 0x000A), (0x0003, 0x0102)]);

        let request = framed(&[0x01, 0x03, 0x00, 0x02, 0x00, 0x02]);
        assert_eq!(
            request.as_slice(),
            &[0x01, 0x03, 0x00, 0x02, 0x00, 0x02, 0x65, 0xCB],
        );

        let mut reply = request;
        device.handle_indication(&mut reply);
        assert_eq!(
            &reply.as_slice()[..7],
            &[0x01, 0x03, 0x04, 0x00, 0x0A, 0x01, 0x02],
        );
        assert_eq!(reply.len(), 9);
        assert!(reply.crc_valid());
    }

    #[test]
    fn write_single_register_echoes_request() {
        let mut device = TestDevice::new();
        let request = framed(&[0x01, 0x06, 0x00, 0x07, 0x03, 0xFF]);
        let mut reply = request.clone();
        device.handle_indication(&mut reply);

        assert_eq!(reply, request);
        assert_eq!(device.register_writes, [(0x0007, 0x03FF)]);
    }

    #[test]
    fn unknown_function_code_is_illegal_function() {
        let mut device = TestDevice::new();
        let reply = run(&mut device, &[0x01, 0x2B, 0x0E, 0x01, 0x00]);
        assert_eq!(reply.as_slice()[1], 0xAB);
        expect_exception(&reply, 0x2B, ExceptionCode::IllegalFunction);
        assert_eq!(device.hook_calls, 0);
    }

    #[test]
    fn zero_register_read_is_illegal_data_value() {
        let mut device = TestDevice::new();
        let reply = run(&mut device, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x00]);
        expect_exception(&reply, 0x03, ExceptionCode::IllegalDataValue);
        assert_eq!(device.hook_calls, 0);
    }

    #[test]
    fn broadcast_write_applies_side_effect_without_reply() {
        let mut device = TestDevice::new();
        let reply = run(&mut device, &[0x00, 0x05, 0x00, 0x04, 0xFF, 0x00]);
        assert!(reply.is_empty());
        assert_eq!(device.coil_writes, [(0x0004, true)]);
    }

    #[test]
    fn broadcast_suppresses_exception_replies_too() {
        let mut device = TestDevice::new();
        let reply = run(&mut device, &[0x00, 0x03, 0x00, 0x00, 0x00, 0x00]);
        assert!(reply.is_empty());
    }

    #[test]
    fn wrong_address_is_dropped_without_consulting_hooks() {
        let mut device = TestDevice::new();
        let reply = run(&mut device, &[0x02, 0x03, 0x00, 0x00, 0x00, 0x01]);
        assert!(reply.is_empty());
        assert_eq!(device.hook_calls, 0);
    }

    #[test]
    fn corrupt_crc_is_dropped_without_consulting_hooks() {
        let mut device = TestDevice::new();
        let mut frame = framed(&[0x01, 0x03, 0x00, 0x02, 0x00, 0x02]);
        let mut bytes = frame.as_slice().to_vec();
        bytes[4] ^= 0x01;
        frame = RtuMessage::from_slice(&bytes).unwrap();

        device.handle_indication(&mut frame);
        assert!(frame.is_empty());
        assert_eq!(device.hook_calls, 0);
    }

    #[test]
    fn runt_frame_is_dropped() {
        let mut device = TestDevice::new();
        let mut frame = RtuMessage::from_slice(&[0x01, 0x03, 0x00]).unwrap();
        device.handle_indication(&mut frame);
        assert!(frame.is_empty());
    }

    #[test]
    fn read_coils_packs_bits_lsb_first() {
        let mut device = TestDevice::new();
        // Addresses 0..10, set where address % 3 == 0: 0, 3, 6, 9.
        let reply = run(&mut device, &[0x01, 0x01, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(
            &reply.as_slice()[..5],
            &[0x01, 0x01, 0x02, 0x49, 0x02],
        );
        assert!(reply.crc_valid());
        assert_eq!(device.hook_calls, 10);
    }

    #[test]
    fn read_discrete_inputs_uses_its_own_hooks() {
        let mut device = TestDevice::new();
        // Addresses 4..8, set where address % 2 == 0: 4 and 6 -> bits 0, 2.
        let reply = run(&mut device, &[0x01, 0x02, 0x00, 0x04, 0x00, 0x04]);
        assert_eq!(&reply.as_slice()[..4], &[0x01, 0x02, 0x01, 0x05]);
    }

    #[test]
    fn read_input_registers_uses_its_own_hooks() {
        let mut device = TestDevice::new();
        device.input.insert(0x0001, 0x1234);
        let reply = run(&mut device, &[0x01, 0x04, 0x00, 0x01, 0x00, 0x02]);
        assert_eq!(
            &reply.as_slice()[..7],
            &[0x01, 0x04, 0x04, 0x12, 0x34, 0xFF, 0xFF],
        );
    }

    #[test]
    fn bit_count_boundaries() {
        let mut device = TestDevice::new();

        let ok_low = run(&mut device, &[0x01, 0x01, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(ok_low.as_slice()[2], 1);

        let ok_high = run(&mut device, &[0x01, 0x01, 0x00, 0x00, 0x07, 0xB0]);
        assert_eq!(ok_high.as_slice()[2], 246);
        assert_eq!(ok_high.len(), 3 + 246 + 2);

        let zero = run(&mut device, &[0x01, 0x01, 0x00, 0x00, 0x00, 0x00]);
        expect_exception(&zero, 0x01, ExceptionCode::IllegalDataValue);

        let over = run(&mut device, &[0x01, 0x01, 0x00, 0x00, 0x07, 0xB1]);
        expect_exception(&over, 0x01, ExceptionCode::IllegalDataValue);
    }

    #[test]
    fn register_count_boundaries_on_read() {
        let mut device = TestDevice::new();

        let ok_low = run(&mut device, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(ok_low.as_slice()[2], 2);

        let ok_high = run(&mut device, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x7D]);
        assert_eq!(ok_high.as_slice()[2], 250);

        let zero = run(&mut device, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x00]);
        expect_exception(&zero, 0x03, ExceptionCode::IllegalDataValue);

        let over = run(&mut device, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x7E]);
        expect_exception(&over, 0x03, ExceptionCode::IllegalDataValue);
    }

    #[test]
    fn out_of_range_read_address_is_illegal_data_address() {
        let mut device = TestDevice::new();
        let reply = run(&mut device, &[0x01, 0x03, 0xFF, 0xF0, 0x00, 0x20]);
        expect_exception(&reply, 0x03, ExceptionCode::IllegalDataAddress);
    }

    #[test]
    fn write_registers_accepts_up_to_0x7b() {
        let mut device = TestDevice::new();
        let mut body = vec![0x01, 0x10, 0x00, 0x00, 0x00, 0x7B, 0xF6];
        for i in 0..0x7Bu16 {
            body.extend_from_slice(&i.to_be_bytes());
        }
        let reply = run(&mut device, &body);
        assert_eq!(
            reply.as_slice()[..6],
            [0x01, 0x10, 0x00, 0x00, 0x00, 0x7B],
        );
        assert_eq!(reply.len(), 8);
        assert_eq!(device.register_writes.len(), 0x7B);
        assert_eq!(device.register_writes[3], (3, 3));

        let mut body = vec![0x01, 0x10, 0x00, 0x00, 0x00, 0x7C, 0xF8];
        for i in 0..0x7Cu16 {
            body.extend_from_slice(&i.to_be_bytes());
        }
        let reply = run(&mut device, &body);
        expect_exception(&reply, 0x10, ExceptionCode::IllegalDataValue);
    }

    #[test]
    fn write_registers_byte_count_mismatch_is_illegal_data_value() {
        let mut device = TestDevice::new();
        // Two registers but byte count claims 3.
        let body = [
            0x01, 0x10, 0x00, 0x00, 0x00, 0x02, 0x03, 0xAA, 0xBB, 0xCC,
        ];
        let reply = run(&mut device, &body);
        expect_exception(&reply, 0x10, ExceptionCode::IllegalDataValue);
        assert!(device.register_writes.is_empty());
    }

    #[test]
    fn write_registers_truncated_payload_is_illegal_data_value() {
        let mut device = TestDevice::new();
        // Byte count says four bytes follow; only two do.
        let body = [0x01, 0x10, 0x00, 0x00, 0x00, 0x02, 0x04, 0xAA, 0xBB];
        let reply = run(&mut device, &body);
        expect_exception(&reply, 0x10, ExceptionCode::IllegalDataValue);
    }

    #[test]
    fn write_coils_applies_bits_in_order() {
        let mut device = TestDevice::new();
        // Ten coils starting at 3, pattern 0b0000001101 (LSB first).
        let body =
            [0x01, 0x0F, 0x00, 0x03, 0x00, 0x0A, 0x02, 0x0D, 0x00];
        let reply = run(&mut device, &body);
        assert_eq!(
            reply.as_slice()[..6],
            [0x01, 0x0F, 0x00, 0x03, 0x00, 0x0A],
        );
        assert_eq!(device.coil_writes.len(), 10);
        assert_eq!(device.coil_writes[0], (3, true));
        assert_eq!(device.coil_writes[1], (4, false));
        assert_eq!(device.coil_writes[2], (5, true));
        assert_eq!(device.coil_writes[3], (6, true));
        assert!(device.coil_writes[4..].iter().all(|&(_, on)| !on));
    }

    #[test]
    fn write_coils_byte_count_mismatch_is_illegal_data_value() {
        let mut device = TestDevice::new();
        let body = [0x01, 0x0F, 0x00, 0x00, 0x00, 0x0A, 0x01, 0xFF];
        let reply = run(&mut device, &body);
        expect_exception(&reply, 0x0F, ExceptionCode::IllegalDataValue);
        assert!(device.coil_writes.is_empty());
    }

    #[test]
    fn write_single_coil_value_must_be_canonical() {
        let mut device = TestDevice::new();

        let on = run(&mut device, &[0x01, 0x05, 0x00, 0x04, 0xFF, 0x00]);
        assert_eq!(on.as_slice()[..6], [0x01, 0x05, 0x00, 0x04, 0xFF, 0x00]);

        let off = run(&mut device, &[0x01, 0x05, 0x00, 0x04, 0x00, 0x00]);
        assert_eq!(off.as_slice()[..6], [0x01, 0x05, 0x00, 0x04, 0x00, 0x00]);

        let bad = run(&mut device, &[0x01, 0x05, 0x00, 0x04, 0x12, 0x34]);
        expect_exception(&bad, 0x05, ExceptionCode::IllegalDataValue);

        assert_eq!(device.coil_writes, [(4, true), (4, false)]);
    }

    #[test]
    fn defaults_deny_every_family() {
        let mut device = BareDevice;

        let requests: [&[u8]; 8] = [
            &[0x01, 0x01, 0x00, 0x00, 0x00, 0x01],
            &[0x01, 0x02, 0x00, 0x00, 0x00, 0x01],
            &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01],
            &[0x01, 0x04, 0x00, 0x00, 0x00, 0x01],
            &[0x01, 0x05, 0x00, 0x00, 0xFF, 0x00],
            &[0x01, 0x06, 0x00, 0x00, 0x00, 0x01],
            &[0x01, 0x0F, 0x00, 0x00, 0x00, 0x01, 0x01, 0x01],
            &[0x01, 0x10, 0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x01],
        ];
        for body in requests {
            let reply = run(&mut device, body);
            expect_exception(&reply, body[1], ExceptionCode::IllegalFunction);
        }
    }

    #[test]
    fn device_fault_surfaces_as_server_device_failure() {
        let mut device = TestDevice::new();
        device.fail = true;
        let reply = run(&mut device, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        expect_exception(&reply, 0x03, ExceptionCode::ServerDeviceFailure);
    }

    #[test]
    fn write_single_register_is_idempotent() {
        let body = [0x01, 0x06, 0x00, 0x07, 0x03, 0xFF];
        let mut device = TestDevice::new();
        let first = run(&mut device, &body);
        let holding_after_first = device.holding.clone();
        let second = run(&mut device, &body);

        assert_eq!(first, second);
        assert_eq!(device.holding, holding_after_first);
        assert_eq!(
            device.register_writes,
            [(0x0007, 0x03FF), (0x0007, 0x03FF)],
        );
    }

    #[test]
    fn truncated_request_is_illegal_data_value() {
        let mut device = TestDevice::new();
        // CRC-valid frame whose PDU is too short to carry the fields.
        let reply = run(&mut device, &[0x01, 0x03, 0x00]);
        expect_exception(&reply, 0x03, ExceptionCode::IllegalDataValue);
    }

    proptest! {
        #[test]
        fn read_holding_round_trip(
            start in 0u16..0x0F00,
            values in proptest::collection::vec(any::<u16>(), 1..=125),
        ) {
            let seeded: Vec<(u16, u16)> = values
                .iter()
                .enumerate()
                .map(|(i, &v)| (start + i as u16, v))
                .collect();
            let mut device = TestDevice::with_holding(&seeded);

            let count = values.len() as u16;
            let mut body = vec![0x01, 0x03];
            body.extend_from_slice(&start.to_be_bytes());
            body.extend_from_slice(&count.to_be_bytes());
            let reply = run(&mut device, &body);

            prop_assert_eq!(reply.as_slice()[0], 0x01);
            prop_assert_eq!(reply.as_slice()[1], 0x03);
            prop_assert_eq!(reply.as_slice()[2] as usize, 2 * values.len());
            for (i, &v) in values.iter().enumerate() {
                let offset = 3 + 2 * i;
                let word = u16::from_be_bytes([
                    reply.as_slice()[offset],
                    reply.as_slice()[offset + 1],
                ]);
                prop_assert_eq!(word, v);
            }
            prop_assert!(reply.crc_valid());
        }

        #[test]
        fn non_broadcast_replies_keep_address_and_function(
            body in proptest::collection::vec(any::<u8>(), 2..=64),
        ) {
            let mut body = body;
            body[0] = 0x01; // our station
            let mut device = TestDevice::new();
            let reply = run(&mut device, &body);

            if !reply.is_empty() {
                prop_assert_eq!(reply.as_slice()[0], body[0]);
                prop_assert_eq!(reply.as_slice()[1] & 0x7F, body[1] & 0x7F);
                prop_assert!(reply.crc_valid());
            }
        }
    }
}
