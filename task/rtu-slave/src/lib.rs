// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Modbus RTU slave daemon.
//!
//! The daemon is a state machine over a single event queue. Byte arrivals,
//! alarm expiries, prepared replies, and transmit acknowledgements all
//! arrive as [`Event`]s; the daemon suspends only on the queue receive and
//! holds no locks, so it can be driven by real producers or by a scripted
//! test with equal fidelity.
//!
//! # Framing
//!
//! RTU frames are delimited by silence: a gap longer than the
//! inter-character time ends a frame, and a frame may only start after the
//! line has been idle for the inter-frame time. The daemon measures both
//! with one-shot alarms; every byte in `Reception` cancels the running
//! alarm and arms a fresh one, so the alarm only ever fires into silence.
//!
//! # The cancellation race
//!
//! Cancelling an alarm cannot be synchronous: the alarm may already have
//! fired and enqueued its timeout by the time the cancellation lands. Two
//! defenses compose here, and both are load-bearing:
//!
//! - every [`Event::Timeout`] carries the [`AlarmId`] of the alarm that
//!   produced it, and a timeout whose id is not the one currently expected
//!   is discarded in every state without a state change;
//! - on each received byte the daemon also drains already-enqueued
//!   timeouts from the head of its queue, so a stale expiry cannot sit in
//!   front of the bytes that follow it.
//!
//! # Replies
//!
//! A completed frame is handed to the user handler, which rewrites it in
//! place into the reply (or clears it: broadcasts and frames for other
//! stations produce nothing). After waiting out the post-frame silence the
//! daemon re-enqueues the reply to itself at the *front* of the queue, so
//! the transmission is observed strictly before any bytes that raced in.

use core::mem;
use std::time::Duration;

use alarm::{AlarmId, AlarmService, Timestamp};
use drv_serial_io::{FrameBytes, OutputRequest, Payload};
use eventq::{Queue, Sender, Wait};
use modbus::RtuMessage;
use ringbuf::Ringbuf;
use static_assertions::const_assert;

/// Depth of the daemon's event queue. Sized for a worst-case burst of wire
/// bytes plus timer traffic.
pub const DAEMON_QUEUE_DEPTH: usize = 32;
const_assert!(DAEMON_QUEUE_DEPTH >= 32);

/// Bus silence windows.
///
/// `Standard` is the profile for links at 19200 bps and up. `Fast` shrinks
/// both windows by an order of magnitude for high-baud test rigs; that is
/// far below what conforming masters expect between frames, so
/// interoperability with them is not guaranteed under `Fast`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TimingProfile {
    #[default]
    Standard,
    Fast,
}

impl TimingProfile {
    /// Longest in-frame gap: silence beyond this ends the frame.
    pub fn inter_char(self) -> Duration {
        match self {
            TimingProfile::Standard => Duration::from_micros(750),
            TimingProfile::Fast => Duration::from_micros(15),
        }
    }

    /// Shortest between-frames gap: the line must idle this long before a
    /// frame may start (or a reply may be transmitted).
    pub fn inter_frame(self) -> Duration {
        match self {
            TimingProfile::Standard => Duration::from_micros(1750),
            TimingProfile::Fast => Duration::from_micros(75),
        }
    }

    /// Remaining silence owed after a frame has already been closed by an
    /// inter-character timeout.
    pub fn post_frame_silence(self) -> Duration {
        self.inter_frame() - self.inter_char()
    }
}

/// Everything the daemon reacts to.
#[derive(Clone, Debug)]
pub enum Event {
    /// A wire byte, stamped with its arrival time.
    ReadChar { at: Timestamp, byte: u8 },
    /// An alarm expired. Stale ids are discarded; see the module docs.
    Timeout(AlarmId),
    /// A prepared reply looping back through the queue for transmission.
    PendingReply(RtuMessage),
    /// The output manager finished writing our reply.
    BytesWritten(usize),
}

/// The daemon's seam to the alarm machinery, so tests can substitute a
/// scripted source.
pub trait AlarmControl {
    /// Arms a one-shot alarm that will deliver `Event::Timeout` with the
    /// returned id to the daemon's queue.
    fn arm(&mut self, after: Duration) -> AlarmId;

    /// Best-effort cancel; a stale timeout may still be delivered.
    fn disarm(&mut self, id: AlarmId);
}

/// Production [`AlarmControl`]: alarms on an [`AlarmService`] whose expiry
/// enqueues a timeout from timer context.
pub struct QueueAlarms {
    service: AlarmService,
    events: Sender<Event>,
}

impl QueueAlarms {
    pub fn new(service: AlarmService, events: Sender<Event>) -> Self {
        Self { service, events }
    }
}

impl AlarmControl for QueueAlarms {
    fn arm(&mut self, after: Duration) -> AlarmId {
        let events = self.events.clone();
        self.service.set_alarm(after, move |id| {
            // Timer context: non-blocking send only. The queue is sized so
            // this cannot overflow under a worst-case burst.
            let _ = events.send_from_isr(Event::Timeout(id));
            None
        })
    }

    fn disarm(&mut self, id: AlarmId) {
        self.service.cancel_alarm(id);
    }
}

enum State {
    /// Waiting out the line-idle window before listening.
    Initial { alarm: AlarmId },
    /// Bus idle: a frame may start, or a queued reply may transmit.
    Ready,
    /// Accumulating a frame.
    Reception { alarm: AlarmId, frame: RtuMessage },
    /// Frame handled; waiting out the post-frame silence.
    Processing { alarm: AlarmId, reply: RtuMessage },
    /// Waiting for the output manager's acknowledgement.
    Emission,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    BusIdle,
    RxByte(u8),
    FrameComplete(usize),
    ReplyReady(usize),
    StaleTimeout,
    FramingError,
    Overrun,
    ReplyDropped,
    TxStart(usize),
    TxDone(usize),
}

/// The RTU slave daemon. `H` is the indication handler; it rewrites the
/// frame in place and leaves it empty when nothing must be transmitted.
pub struct Daemon<A, H> {
    events: Queue<Event>,
    out: Sender<OutputRequest>,
    alarms: A,
    handler: H,
    timing: TimingProfile,
    state: State,
    trace: Ringbuf<Trace, 32>,
}

impl<A, H> Daemon<A, H>
where
    A: AlarmControl,
    H: FnMut(&mut RtuMessage),
{
    pub fn new(
        events: Queue<Event>,
        out: Sender<OutputRequest>,
        mut alarms: A,
        handler: H,
        timing: TimingProfile,
    ) -> Self {
        // The line state is unknown at startup; demand a full idle window
        // before listening.
        let alarm = alarms.arm(timing.inter_frame());
        Self {
            events,
            out,
            alarms,
            handler,
            timing,
            state: State::Initial { alarm },
            trace: Ringbuf::new(),
        }
    }

    /// A handle for producers (byte pumps, alarm sources) feeding this
    /// daemon.
    pub fn event_sender(&self) -> Sender<Event> {
        self.events.sender()
    }

    /// Runs forever. The daemon has no shutdown: on the device it lives
    /// until reset.
    pub fn run(mut self) -> ! {
        loop {
            if let Ok(event) = self.events.receive(Wait::Forever) {
                self.step(event);
            }
        }
    }

    /// Feeds one event through the state machine.
    pub fn step(&mut self, event: Event) {
        let state = mem::replace(&mut self.state, State::Ready);
        self.state = self.next(state, event);
    }

    fn next(&mut self, state: State, event: Event) -> State {
        match (state, event) {
            // Initial: bytes mean the line is still busy; restart the idle
            // window.
            (State::Initial { alarm }, Event::ReadChar { .. }) => {
                self.alarms.disarm(alarm);
                State::Initial {
                    alarm: self.alarms.arm(self.timing.inter_frame()),
                }
            }
            (State::Initial { alarm }, Event::Timeout(id)) if id == alarm => {
                self.trace.record(Trace::BusIdle);
                State::Ready
            }
            (state @ State::Initial { .. }, Event::Timeout(_)) => {
                self.trace.record(Trace::StaleTimeout);
                state
            }
            (
                state @ State::Initial { .. },
                Event::PendingReply(_) | Event::BytesWritten(_),
            ) => state,

            // Ready: a byte opens a frame; a non-empty pending reply goes
            // out. An empty pending reply is a broadcast's silence.
            (State::Ready, Event::ReadChar { byte, .. }) => {
                self.accept_byte(RtuMessage::new(), byte)
            }
            (State::Ready, Event::PendingReply(reply))
                if !reply.is_empty() =>
            {
                self.transmit(&reply);
                State::Emission
            }
            (State::Ready, Event::PendingReply(_)) => State::Ready,
            (State::Ready, Event::Timeout(_)) => {
                self.trace.record(Trace::StaleTimeout);
                State::Ready
            }
            (State::Ready, Event::BytesWritten(_)) => State::Ready,

            // Reception: bytes extend the frame, the matching timeout ends
            // it, anything else is line noise.
            (State::Reception { alarm, frame }, Event::ReadChar { byte, .. }) => {
                self.alarms.disarm(alarm);
                self.drain_stale_timeouts();
                self.accept_byte(frame, byte)
            }
            (State::Reception { alarm, mut frame }, Event::Timeout(id))
                if id == alarm =>
            {
                self.trace.record(Trace::FrameComplete(frame.len()));
                // Arm the silence window before handling so it stays
                // anchored to the end of the frame, not the end of
                // processing.
                let alarm =
                    self.alarms.arm(self.timing.post_frame_silence());
                (self.handler)(&mut frame);
                self.trace.record(Trace::ReplyReady(frame.len()));
                State::Processing {
                    alarm,
                    reply: frame,
                }
            }
            (state @ State::Reception { .. }, Event::Timeout(_)) => {
                self.trace.record(Trace::StaleTimeout);
                state
            }
            (
                State::Reception { alarm, .. },
                Event::PendingReply(_) | Event::BytesWritten(_),
            ) => {
                self.alarms.disarm(alarm);
                self.framing_error()
            }

            // Processing: the matching timeout releases the reply into the
            // queue ahead of any bytes that raced in.
            (State::Processing { alarm, reply }, Event::Timeout(id))
                if id == alarm =>
            {
                if self
                    .events
                    .send_front(Event::PendingReply(reply), Wait::NONE)
                    .is_err()
                {
                    // Queue full of wire noise; dropping the reply beats
                    // deadlocking against our own queue.
                    self.trace.record(Trace::ReplyDropped);
                }
                State::Ready
            }
            (state @ State::Processing { .. }, Event::Timeout(_)) => {
                self.trace.record(Trace::StaleTimeout);
                state
            }
            (
                State::Processing { alarm, .. },
                Event::ReadChar { .. }
                | Event::PendingReply(_)
                | Event::BytesWritten(_),
            ) => {
                self.alarms.disarm(alarm);
                self.framing_error()
            }

            // Emission: only the write acknowledgement matters; the line
            // is ours until it arrives.
            (State::Emission, Event::BytesWritten(written)) => {
                self.trace.record(Trace::TxDone(written));
                State::Initial {
                    alarm: self.alarms.arm(self.timing.inter_frame()),
                }
            }
            (State::Emission, Event::ReadChar { .. }) => State::Emission,
            (State::Emission, Event::Timeout(_)) => {
                self.trace.record(Trace::StaleTimeout);
                State::Emission
            }
            (State::Emission, Event::PendingReply(_)) => State::Emission,
        }
    }

    fn accept_byte(&mut self, mut frame: RtuMessage, byte: u8) -> State {
        self.trace.record(Trace::RxByte(byte));
        if frame.push(byte).is_err() {
            self.trace.record(Trace::Overrun);
            return self.framing_error();
        }
        State::Reception {
            alarm: self.alarms.arm(self.timing.inter_frame()),
            frame,
        }
    }

    /// Eats timeouts already sitting at the head of the queue. They belong
    /// to the alarm that was just disarmed: had the current alarm fired,
    /// we would not be receiving a byte.
    fn drain_stale_timeouts(&mut self) {
        while let Ok(Event::Timeout(_)) = self.events.peek(Wait::NONE) {
            let _ = self.events.receive(Wait::NONE);
            self.trace.record(Trace::StaleTimeout);
        }
    }

    fn framing_error(&mut self) -> State {
        self.trace.record(Trace::FramingError);
        State::Initial {
            alarm: self.alarms.arm(self.timing.inter_frame()),
        }
    }

    fn transmit(&mut self, reply: &RtuMessage) {
        self.trace.record(Trace::TxStart(reply.len()));
        let mut payload = FrameBytes::new();
        // Same capacity on both sides; cannot overflow.
        let _ = payload.extend_from_slice(reply.as_slice());
        let ack = self.events.sender();
        let request = OutputRequest::with_completion(
            Payload::Frame(payload),
            move |written| {
                let _ = ack.send(Event::BytesWritten(written), Wait::Forever);
            },
        );
        let _ = self.out.send(request, Wait::Forever);
    }
}
