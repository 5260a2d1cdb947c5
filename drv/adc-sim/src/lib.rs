// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated round-robin ADC sampler.
//!
//! Models the converter the example slave publishes over Modbus: a set of
//! channels selected by a mask, sampled round-robin at a configured
//! per-channel frequency from timer context, with the latest 12-bit sample
//! per channel kept in a table. On hardware the table is written by the
//! conversion-complete interrupt; here a repeating alarm stands in for it
//! and a deterministic waveform stands in for the pins.
//!
//! Reads never block and never observe a torn value; a channel outside the
//! active mask reads as `None`.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alarm::AlarmService;
use bitflags::bitflags;

pub const CHANNEL_COUNT: usize = 5;

/// Largest sample value the 12-bit converter produces.
pub const SAMPLE_MAX: u16 = 0x0FFF;

bitflags! {
    /// Set of active converter channels.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct ChannelMask: u8 {
        const ADC0 = 1 << 0;
        const ADC1 = 1 << 1;
        const ADC2 = 1 << 2;
        const ADC3 = 1 << 3;
        const ADC4 = 1 << 4;
    }
}

/// One converter channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AdcInput {
    Adc0,
    Adc1,
    Adc2,
    Adc3,
    Adc4,
}

impl AdcInput {
    pub const ALL: [Self; CHANNEL_COUNT] =
        [Self::Adc0, Self::Adc1, Self::Adc2, Self::Adc3, Self::Adc4];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn mask(self) -> ChannelMask {
        ChannelMask::from_bits_truncate(1 << self.index())
    }
}

struct Table {
    samples: [AtomicU16; CHANNEL_COUNT],
    active: ChannelMask,
}

/// Handle to a running sampler. Cloning shares the sample table.
#[derive(Clone)]
pub struct AdcSampler {
    table: Arc<Table>,
}

impl AdcSampler {
    /// Starts sampling `channels` at `sample_hz` conversions per second per
    /// channel, driven by a repeating alarm on `alarms`.
    pub fn start(
        alarms: &AlarmService,
        channels: ChannelMask,
        sample_hz: u32,
    ) -> Self {
        let table = Arc::new(Table {
            samples: Default::default(),
            active: channels,
        });

        let active_count = channels.bits().count_ones();
        if active_count > 0 {
            // One conversion per tick, rotating through the active
            // channels, so the tick rate is the per-channel rate times the
            // channel count.
            let tick_rate = sample_hz.max(1) * active_count;
            let period =
                Duration::from_micros(u64::from(1_000_000 / tick_rate.max(1)));

            let sampler = Arc::clone(&table);
            let mut tick: u64 = 0;
            let mut channel: usize = 0;
            alarms.set_alarm(period, move |_| {
                // Advance to the next active channel.
                while !sampler
                    .active
                    .contains(ChannelMask::from_bits_truncate(1 << channel))
                {
                    channel = (channel + 1) % CHANNEL_COUNT;
                }
                sampler.samples[channel]
                    .store(waveform(channel, tick), Ordering::Relaxed);
                channel = (channel + 1) % CHANNEL_COUNT;
                tick = tick.wrapping_add(1);
                Some(period)
            });
        }

        Self { table }
    }

    /// The most recent sample for `channel`, or `None` if it is not being
    /// sampled.
    pub fn read(&self, channel: AdcInput) -> Option<u16> {
        if !self.table.active.contains(channel.mask()) {
            return None;
        }
        Some(self.table.samples[channel.index()].load(Ordering::Relaxed))
    }
}

/// Deterministic 12-bit ramp, one slope per channel.
fn waveform(channel: usize, tick: u64) -> u16 {
    let step = 7 + 13 * channel as u64;
    (tick.wrapping_mul(step) & u64::from(SAMPLE_MAX)) as u16
}
