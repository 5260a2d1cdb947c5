// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serial I/O manager.
//!
//! The port (a UART on hardware, stdio here) is owned exclusively by two
//! manager loops; every other task reaches it through their request
//! queues. [`output_manager`] drains [`OutputRequest`]s one at a time and
//! invokes each request's completion with the byte count *before* dequeuing
//! the next request. Consumers may rely on that ordering to know their
//! bytes are on the wire. [`input_manager`] fills each [`InputRequest`]'s
//! buffer with a single read and hands it back the same way.
//!
//! Payloads are typed: callers may lend static bytes, hand over an owned
//! box (whose drop is the deallocation), or copy a wire frame inline so the
//! sending task never loans out its own buffer. Only this manager owns
//! heap payloads; the inline form keeps the reply path of the protocol
//! daemon allocation-free.

use std::io::{Read, Write};

use eventq::{Receiver, Sender, Wait};

/// Capacity of the inline frame payload; matches the largest RTU frame.
pub const MAX_FRAME: usize = 256;

/// A wire frame carried by value.
pub type FrameBytes = heapless::Vec<u8, MAX_FRAME>;

/// What an output request carries.
pub enum Payload {
    /// Bytes borrowed for the life of the program (banners, fixed text).
    Borrowed(&'static [u8]),
    /// Owned bytes; dropped by the manager once written.
    Owned(Box<[u8]>),
    /// Borrowed text.
    Str(&'static str),
    /// An inline copy of a wire frame.
    Frame(FrameBytes),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Borrowed(bytes) => bytes,
            Payload::Owned(bytes) => bytes,
            Payload::Str(text) => text.as_bytes(),
            Payload::Frame(frame) => frame,
        }
    }
}

type OutputDone = Box<dyn FnOnce(usize) + Send>;

/// A write order for the output manager.
pub struct OutputRequest {
    payload: Payload,
    done: Option<OutputDone>,
}

impl OutputRequest {
    /// Fire-and-forget write.
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            done: None,
        }
    }

    /// Write with a completion; it receives the number of bytes written
    /// (zero if the port failed) and typically forwards it to the
    /// requester's own queue.
    pub fn with_completion(
        payload: Payload,
        done: impl FnOnce(usize) + Send + 'static,
    ) -> Self {
        Self {
            payload,
            done: Some(Box::new(done)),
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    fn complete(self, written: usize) {
        if let Some(done) = self.done {
            done(written);
        }
        // Dropping the payload here is the "deleter" for owned bytes.
    }
}

/// A fill order for the input manager: read up to `buffer.len()` bytes in
/// one go, then hand the buffer and the actual count back.
pub struct InputRequest {
    buffer: Box<[u8]>,
    done: Box<dyn FnOnce(Box<[u8]>, usize) + Send>,
}

impl InputRequest {
    pub fn new(
        buffer: Box<[u8]>,
        done: impl FnOnce(Box<[u8]>, usize) + Send + 'static,
    ) -> Self {
        Self {
            buffer,
            done: Box::new(done),
        }
    }
}

/// Drains the output queue forever, one request at a time.
pub fn output_manager(
    requests: &Receiver<OutputRequest>,
    port: &mut impl Write,
) -> ! {
    loop {
        let Ok(request) = requests.receive(Wait::Forever) else {
            continue;
        };
        let bytes = request.payload.as_bytes();
        let written = match port.write_all(bytes).and_then(|()| port.flush())
        {
            Ok(()) => bytes.len(),
            Err(_) => 0,
        };
        request.complete(written);
    }
}

/// Drains the input queue forever, one fill at a time.
pub fn input_manager(
    requests: &Receiver<InputRequest>,
    port: &mut impl Read,
) -> ! {
    loop {
        let Ok(request) = requests.receive(Wait::Forever) else {
            continue;
        };
        let InputRequest { mut buffer, done } = request;
        let count = port.read(&mut buffer).unwrap_or(0);
        done(buffer, count);
    }
}

/// Writes `text` through the output manager and blocks until it is on the
/// wire.
pub fn print(out: &Sender<OutputRequest>, text: &str) {
    let ack = eventq::Queue::<usize>::new(1);
    let ack_tx = ack.sender();
    let request = OutputRequest::with_completion(
        Payload::Owned(text.as_bytes().into()),
        move |written| {
            let _ = ack_tx.send(written, Wait::Forever);
        },
    );
    if out.send(request, Wait::Forever).is_ok() {
        let _ = ack.receive(Wait::Forever);
    }
}
