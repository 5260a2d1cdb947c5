// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for tracing long-running tasks.
//!
//! A `Ringbuf<T, N>` keeps the last `N` trace entries recorded by a task.
//! The design center is debugging: a task declares a small `Copy` enum of
//! interesting events, embeds a ring buffer in its state, and records an
//! entry at each event. The buffer can then be dumped in a test failure or
//! from a debugger.
//!
//! Consecutive identical entries are de-duplicated: recording the same
//! payload twice in a row bumps a counter on the existing entry instead of
//! consuming a slot, so a burst of identical events can't wipe out the
//! earlier history.
//!
//! The buffer is a plain owned value. Tasks in this workspace are structs
//! driven by a single thread, so there is no interior mutability and no
//! `static` registration. Whoever owns the task owns its trace.

#![cfg_attr(not(test), no_std)]

/// A single recorded entry.
///
/// `generation` counts how many times this slot has been overwritten, which
/// disambiguates old and new entries when reading a partially-filled dump.
/// `count` is the number of consecutive times this payload was recorded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RingbufEntry<T: Copy> {
    pub generation: u16,
    pub count: u16,
    pub payload: T,
}

/// A ring buffer of the `N` most recent entries.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    buffer: [Option<RingbufEntry<T>>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new() -> Self {
        Self {
            last: None,
            buffer: [None; N],
        }
    }

    /// Records an entry, merging it into the previous one if the payload is
    /// identical and the merge counter has room.
    pub fn record(&mut self, payload: T) {
        if let Some(ndx) = self.last {
            // Slot is always occupied when `last` points at it.
            if let Some(entry) = &mut self.buffer[ndx] {
                if entry.payload == payload && entry.count < u16::MAX {
                    entry.count += 1;
                    return;
                }
            }
        }

        let ndx = match self.last {
            Some(last) if last + 1 < N => last + 1,
            _ => 0,
        };
        let generation = match self.buffer[ndx] {
            Some(old) => old.generation.wrapping_add(1),
            None => 0,
        };
        self.buffer[ndx] = Some(RingbufEntry {
            generation,
            count: 1,
            payload,
        });
        self.last = Some(ndx);
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_none()
    }

    /// The most recently recorded entry, if any.
    pub fn last_entry(&self) -> Option<&RingbufEntry<T>> {
        self.buffer[self.last?].as_ref()
    }

    /// Iterates entries oldest-first.
    pub fn entries(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = match self.last {
            // Oldest entry is the one just past the write cursor, modulo
            // wrap; before the first wrap those slots are `None` and get
            // filtered out below.
            Some(last) if last + 1 < N => last + 1,
            _ => 0,
        };
        (0..N).filter_map(move |i| {
            let ndx = (start + i) % N;
            self.buffer[ndx].as_ref()
        })
    }
}

impl<T: Copy + PartialEq, const N: usize> Default for Ringbuf<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
