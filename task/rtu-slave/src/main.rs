// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stdio deployment of the RTU slave.
//!
//! Stdin is the receive line and stdout the transmit line, so the slave
//! can be exercised by piping a master's byte stream through the process.
//! The device publishes the simulated ADC channels as holding registers:
//! register N reads channel N's latest sample, and anything past the
//! channel table reads as 0xFFFF.

use std::io::Read;
use std::{io, thread};

use alarm::AlarmService;
use drv_adc_sim::{AdcInput, AdcSampler, ChannelMask};
use drv_serial_io::{output_manager, OutputRequest};
use eventq::Queue;
use modbus::{DeviceFault, PduHandler, RtuAddress, RtuMessage};
use task_rtu_slave::{
    Daemon, Event, QueueAlarms, TimingProfile, DAEMON_QUEUE_DEPTH,
};

const SLAVE_ADDRESS: RtuAddress = RtuAddress::new(0x01);
const OUTPUT_QUEUE_DEPTH: usize = 16;

/// Per-channel sample rate.
const SAMPLE_HZ: u32 = 100;

/// The ADC-publishing device: read-only holding registers, one per
/// converter channel.
struct AdcSlave {
    adc: AdcSampler,
}

impl PduHandler for AdcSlave {
    fn slave_address(&self) -> RtuAddress {
        SLAVE_ADDRESS
    }

    fn is_read_registers_supported(&self) -> bool {
        true
    }

    fn read_single_register(
        &mut self,
        address: u16,
    ) -> Result<u16, DeviceFault> {
        let value = AdcInput::from_index(usize::from(address))
            .and_then(|channel| self.adc.read(channel))
            .unwrap_or(0xFFFF);
        Ok(value)
    }
}

/// Forwards wire bytes from stdin into the daemon queue, stamped with
/// their arrival time, until the stream closes.
fn stdin_pump(events: &eventq::Sender<Event>) {
    let stdin = io::stdin();
    let mut handle = stdin.lock();
    let mut byte = [0u8; 1];
    loop {
        match handle.read(&mut byte) {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                let _ = events.send_from_isr(Event::ReadChar {
                    at: alarm::now(),
                    byte: byte[0],
                });
            }
        }
    }
}

fn main() {
    let alarms = AlarmService::new();

    // The output manager owns stdout; everyone else goes through its
    // queue.
    let output = Queue::<OutputRequest>::new(OUTPUT_QUEUE_DEPTH);
    {
        let requests = output.receiver();
        thread::spawn(move || {
            let mut port = io::stdout();
            output_manager(&requests, &mut port)
        });
    }

    let adc = AdcSampler::start(
        &alarms,
        ChannelMask::ADC0 | ChannelMask::ADC1 | ChannelMask::ADC4,
        SAMPLE_HZ,
    );

    let events = Queue::<Event>::new(DAEMON_QUEUE_DEPTH);
    {
        let producer = events.sender();
        thread::spawn(move || stdin_pump(&producer));
    }

    let mut device = AdcSlave { adc };
    let daemon = Daemon::new(
        events.clone(),
        output.sender(),
        QueueAlarms::new(alarms, events.sender()),
        move |frame: &mut RtuMessage| device.handle_indication(frame),
        TimingProfile::Standard,
    );
    daemon.run()
}
