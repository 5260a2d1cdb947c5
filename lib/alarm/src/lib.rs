// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-shot alarm service with monotonic microsecond time.
//!
//! [`AlarmService::set_alarm`] schedules a callback to run at least the
//! requested duration after registration. The callback runs in the timer's
//! context (a dedicated thread here, an interrupt on hardware), so it must
//! confine itself to interrupt-safe work; in this workspace that means
//! enqueueing into a queue via its non-blocking send. Returning
//! `Some(period)` from the callback re-arms the same alarm id after
//! `period`; returning `None` ends it. This is how periodic pollers like
//! the ADC sampler ride a one-shot service.
//!
//! # Cancellation is advisory
//!
//! [`AlarmService::cancel_alarm`] is best-effort. The alarm may already
//! have fired (or be firing right now) when the cancellation lands, in
//! which case whatever the callback enqueued is already in flight.
//! Consumers that care must tag their events with the [`AlarmId`] and
//! compare it against the id they currently expect; a non-matching id marks
//! a stale event to be discarded. There is no way to make cancellation
//! synchronous without making it deadlock-prone, so no attempt is made.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Monotonic timestamp in microseconds since the first observation in this
/// process.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn micros(self) -> u64 {
        self.0
    }
}

impl core::ops::Sub for Timestamp {
    type Output = Duration;

    /// Elapsed time from `rhs` to `self`, saturating at zero.
    fn sub(self, rhs: Self) -> Duration {
        Duration::from_micros(self.0.saturating_sub(rhs.0))
    }
}

/// Reads the monotonic clock.
pub fn now() -> Timestamp {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    Timestamp(epoch.elapsed().as_micros() as u64)
}

/// Opaque alarm handle. Compares equal only to the id returned by the
/// registration that produced it; [`AlarmId::NONE`] (id 0) never names a
/// live alarm.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AlarmId(u32);

impl AlarmId {
    pub const NONE: Self = AlarmId(0);

    /// Builds an id from its raw value. Only useful to alternative alarm
    /// sources (test fakes); ids minted here never match a live alarm of
    /// an [`AlarmService`].
    pub const fn new(raw: u32) -> Self {
        AlarmId(raw)
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

type Callback = Box<dyn FnMut(AlarmId) -> Option<Duration> + Send>;

struct Entry {
    id: AlarmId,
    deadline: Instant,
    callback: Callback,
}

struct Inner {
    alarms: Vec<Entry>,
    next_id: u32,
}

struct Shared {
    inner: Mutex<Inner>,
    changed: Condvar,
}

/// Handle to the alarm service. Cloning yields another handle; the worker
/// thread exits shortly after the last handle is dropped.
#[derive(Clone)]
pub struct AlarmService {
    shared: Arc<Shared>,
}

/// Upper bound on a single worker nap, so the thread notices that all
/// service handles were dropped.
const IDLE_POLL: Duration = Duration::from_millis(50);

impl AlarmService {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                alarms: Vec::new(),
                next_id: 1,
            }),
            changed: Condvar::new(),
        });
        let weak = Arc::downgrade(&shared);
        thread::spawn(move || worker(&weak));
        Self { shared }
    }

    /// Schedules `callback` to run at least `after` from now. The callback
    /// may re-arm the alarm by returning the next period.
    pub fn set_alarm(
        &self,
        after: Duration,
        callback: impl FnMut(AlarmId) -> Option<Duration> + Send + 'static,
    ) -> AlarmId {
        let mut guard = lock(&self.shared);
        let id = AlarmId(guard.next_id);
        // Skip 0 on wraparound; it is the no-alarm sentinel.
        guard.next_id = guard.next_id.checked_add(1).unwrap_or(1);
        guard.alarms.push(Entry {
            id,
            deadline: Instant::now() + after,
            callback: Box::new(callback),
        });
        self.shared.changed.notify_one();
        id
    }

    /// Best-effort cancellation; see the module docs for the inherent race.
    pub fn cancel_alarm(&self, id: AlarmId) {
        let mut guard = lock(&self.shared);
        guard.alarms.retain(|entry| entry.id != id);
        self.shared.changed.notify_one();
    }
}

impl Default for AlarmService {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(shared: &Shared) -> MutexGuard<'_, Inner> {
    shared.inner.lock().unwrap_or_else(|e| e.into_inner())
}

fn worker(weak: &Weak<Shared>) {
    loop {
        let Some(shared) = weak.upgrade() else { break };

        let mut due = {
            let mut guard = lock(&shared);
            let now = Instant::now();
            let mut due = Vec::new();
            let mut i = 0;
            while i < guard.alarms.len() {
                if guard.alarms[i].deadline <= now {
                    due.push(guard.alarms.swap_remove(i));
                } else {
                    i += 1;
                }
            }

            if due.is_empty() {
                let nap = guard
                    .alarms
                    .iter()
                    .map(|entry| entry.deadline)
                    .min()
                    .map_or(IDLE_POLL, |deadline| {
                        deadline.saturating_duration_since(now).min(IDLE_POLL)
                    });
                let _ = shared
                    .changed
                    .wait_timeout(guard, nap)
                    .unwrap_or_else(|e| e.into_inner());
                continue;
            }
            due
        };

        // Fire in deadline order, outside the lock: callbacks are free to
        // register or cancel alarms.
        due.sort_by_key(|entry| entry.deadline);
        for mut entry in due {
            if let Some(period) = (entry.callback)(entry.id) {
                entry.deadline = Instant::now() + period;
                let mut guard = lock(&shared);
                guard.alarms.push(entry);
                shared.changed.notify_one();
            }
        }
    }
}
