//! Frame queues for a connection
//!
//! - [`SendQueue`]: encoded outbound frames, shared between application
//!   threads (producers) and the connection worker (consumer)
//! - [`ReassemblyQueue`]: inbound data frames waiting for their message to
//!   finish, owned by the worker alone

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::frame::{Frame, OpCode};

/// An encoded frame ready to be written to the transport
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Opcode of the frame (for logging)
    pub opcode: OpCode,
    /// Wire bytes, header and masked payload
    pub bytes: Bytes,
}

/// FIFO of outbound frames
///
/// Guarded by its own lock so that enqueueing never waits on connection
/// state. The worker takes the whole batch at once and writes it without
/// holding the lock.
#[derive(Debug, Default)]
pub struct SendQueue {
    frames: Mutex<VecDeque<OutboundFrame>>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame
    pub fn push(&self, opcode: OpCode, bytes: Bytes) {
        self.frames.lock().push_back(OutboundFrame { opcode, bytes });
    }

    /// Take every queued frame, oldest first
    pub fn drain(&self) -> Vec<OutboundFrame> {
        let mut frames = self.frames.lock();
        frames.drain(..).collect()
    }

    /// Drop every queued frame
    pub fn clear(&self) {
        self.frames.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

/// Inbound frames belonging to not-yet-finished messages
///
/// Merge rule for an incoming data frame:
/// - if the newest pending entry is unfinished and the frame has the same
///   opcode, or is a continuation, it is merged into that entry
/// - otherwise a frame with payload becomes a new pending entry
/// - otherwise (no payload, nothing to merge into) the frame is handed back
///   to the caller as a terminal marker
#[derive(Debug, Default)]
pub struct ReassemblyQueue {
    pending: VecDeque<Frame>,
}

impl ReassemblyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a frame, returning it back if it is a terminal marker
    pub fn push(&mut self, frame: Frame) -> Option<Frame> {
        if let Some(last) = self.pending.back_mut() {
            if !last.is_final()
                && (last.opcode() == frame.opcode() || frame.opcode() == OpCode::Continuation)
            {
                last.combine(frame);
                return None;
            }
        }

        if frame.payload.is_empty() {
            return Some(frame);
        }

        self.pending.push_back(frame);
        None
    }

    /// Pop the oldest entry if its message is complete
    pub fn pop_finished(&mut self) -> Option<Frame> {
        match self.pending.front() {
            Some(front) if front.is_final() => self.pending.pop_front(),
            _ => None,
        }
    }

    /// Payload bytes currently buffered across all entries
    pub fn buffered_len(&self) -> usize {
        self.pending.iter().map(|f| f.payload.len()).sum()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_queue_fifo() {
        let queue = SendQueue::new();
        queue.push(OpCode::Text, Bytes::from_static(b"one"));
        queue.push(OpCode::Ping, Bytes::from_static(b"two"));
        assert_eq!(queue.len(), 2);

        let frames = queue.drain();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].bytes[..], b"one");
        assert_eq!(frames[1].opcode, OpCode::Ping);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_send_queue_clear() {
        let queue = SendQueue::new();
        queue.push(OpCode::Binary, Bytes::from_static(b"x"));
        queue.clear();
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_reassembly_merges_continuations() {
        let mut queue = ReassemblyQueue::new();

        assert!(queue.push(Frame::new(OpCode::Text, &b"He"[..], false)).is_none());
        assert!(queue.pop_finished().is_none());

        assert!(
            queue
                .push(Frame::new(OpCode::Continuation, &b"llo"[..], true))
                .is_none()
        );
        let msg = queue.pop_finished().unwrap();
        assert_eq!(msg.opcode(), OpCode::Text);
        assert_eq!(&msg.payload[..], b"Hello");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reassembly_empty_unmatched_frame_is_marker() {
        let mut queue = ReassemblyQueue::new();
        let marker = queue
            .push(Frame::new(OpCode::Text, &b""[..], true))
            .unwrap();
        assert_eq!(marker.opcode(), OpCode::Text);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reassembly_empty_continuation_finishes_entry() {
        let mut queue = ReassemblyQueue::new();
        queue.push(Frame::new(OpCode::Binary, &b"abc"[..], false));
        assert!(
            queue
                .push(Frame::new(OpCode::Continuation, &b""[..], true))
                .is_none()
        );
        assert_eq!(&queue.pop_finished().unwrap().payload[..], b"abc");
    }

    #[test]
    fn test_reassembly_delivers_in_order() {
        let mut queue = ReassemblyQueue::new();
        queue.push(Frame::new(OpCode::Text, &b"first"[..], true));
        queue.push(Frame::new(OpCode::Text, &b"second"[..], true));
        assert_eq!(queue.buffered_len(), 11);

        assert_eq!(&queue.pop_finished().unwrap().payload[..], b"first");
        assert_eq!(&queue.pop_finished().unwrap().payload[..], b"second");
        assert!(queue.pop_finished().is_none());
    }
}
