//! Inbound frame handling for a client connection
//!
//! [`Protocol`] sits between the receive buffer and the application
//! callbacks. It:
//! - cuts complete frames off the receive buffer
//! - reassembles fragmented text (and binary, in buffered mode)
//! - streams binary chunks as they arrive (in streaming mode)
//! - surfaces control frames so the worker can answer pings and react to
//!   close
//!
//! It also owns the outbound encoders, which always mask.

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::BinaryDelivery;
use crate::error::{Error, Result};
use crate::frame::{
    FragmentMarker, Frame, OpCode, Received, check_frame_size, decode, encode_fragment,
    encode_frame, peek_payload_len,
};
use crate::mask::generate_mask;
use crate::queue::ReassemblyQueue;

/// Something the worker must act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Complete, UTF-8 validated text message
    Text(String),
    /// Binary data and its position in the message
    Binary(Bytes, FragmentMarker),
    /// Ping payload, to be echoed in a pong
    Ping(Bytes),
    /// Pong received
    Pong,
    /// Peer sent Close
    Close,
}

/// Inbound side of a connection
#[derive(Debug)]
pub struct Protocol {
    /// How binary data reaches the application
    binary_delivery: BinaryDelivery,
    /// Upper bound for a single frame or a buffered message
    max_message_size: usize,
    /// Pending fragments
    reassembly: ReassemblyQueue,
    /// Opcode of the data message in flight, if any
    message_opcode: Option<OpCode>,
}

impl Protocol {
    pub fn new(binary_delivery: BinaryDelivery, max_message_size: usize) -> Self {
        Self {
            binary_delivery,
            max_message_size,
            reassembly: ReassemblyQueue::new(),
            message_opcode: None,
        }
    }

    /// Forget any partially received message
    pub fn reset(&mut self) {
        self.reassembly.clear();
        self.message_opcode = None;
    }

    /// Decode every complete frame in `buf`, appending events to `events`
    ///
    /// Consumed frames are removed from `buf`. Frames with an unknown opcode
    /// are skipped. After a Close frame the rest of the buffer is dropped.
    /// On error, `events` still holds what was decoded before the failure.
    pub fn process_into(&mut self, buf: &mut BytesMut, events: &mut Vec<Event>) -> Result<()> {
        loop {
            let size = check_frame_size(buf)?;
            if size == 0 {
                if let Some(len) = peek_payload_len(buf)? {
                    if len > self.max_message_size as u64 {
                        return Err(Error::InvalidFrame("frame exceeds max message size"));
                    }
                }
                return Ok(());
            }

            let raw = buf.split_to(size);
            let frame = match decode(&raw) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(Error::UnknownOpcode(op)) => {
                    trace!(opcode = op, len = size, "skipping frame with unknown opcode");
                    continue;
                }
                Err(e) => return Err(e),
            };

            trace!(
                opcode = ?frame.opcode(),
                fin = frame.is_final(),
                len = frame.payload.len(),
                "frame received"
            );

            if let Some(event) = self.handle_frame(frame)? {
                let closed = event == Event::Close;
                events.push(event);
                if closed {
                    buf.clear();
                    return Ok(());
                }
            }
        }
    }

    /// Handle a single decoded frame
    pub fn handle_frame(&mut self, frame: Frame) -> Result<Option<Event>> {
        match frame.into_received() {
            Received::Text { payload, fin } => self.handle_text(payload, fin),
            Received::Binary { payload, fin } => self.handle_binary(payload, fin),
            Received::Continuation { payload, fin } => self.handle_continuation(payload, fin),
            Received::Ping(payload) => Ok(Some(Event::Ping(payload))),
            Received::Pong => Ok(Some(Event::Pong)),
            Received::Close => Ok(Some(Event::Close)),
        }
    }

    /// A new data message may only start once the previous one finished
    fn begin_message(&mut self, opcode: OpCode) -> Result<()> {
        if self.message_opcode.is_some() {
            return Err(Error::InvalidFrame(
                "new data frame while a fragmented message is in flight",
            ));
        }
        self.message_opcode = Some(opcode);
        Ok(())
    }

    fn handle_text(&mut self, payload: BytesMut, fin: bool) -> Result<Option<Event>> {
        self.begin_message(OpCode::Text)?;
        self.buffer(Frame::new(OpCode::Text, payload, fin))
    }

    fn handle_binary(&mut self, payload: BytesMut, fin: bool) -> Result<Option<Event>> {
        self.begin_message(OpCode::Binary)?;

        match self.binary_delivery {
            BinaryDelivery::Streaming => {
                let marker = if fin {
                    self.message_opcode = None;
                    FragmentMarker::Whole
                } else {
                    FragmentMarker::Start
                };
                Ok(Some(Event::Binary(payload.freeze(), marker)))
            }
            BinaryDelivery::Buffered => self.buffer(Frame::new(OpCode::Binary, payload, fin)),
        }
    }

    fn handle_continuation(&mut self, payload: BytesMut, fin: bool) -> Result<Option<Event>> {
        let streaming_binary = self.message_opcode == Some(OpCode::Binary)
            && self.binary_delivery == BinaryDelivery::Streaming;

        if streaming_binary {
            let marker = if fin {
                self.message_opcode = None;
                FragmentMarker::End
            } else {
                FragmentMarker::Continue
            };
            return Ok(Some(Event::Binary(payload.freeze(), marker)));
        }

        self.buffer(Frame::new(OpCode::Continuation, payload, fin))
    }

    /// Queue a data frame for reassembly and deliver whatever completed
    fn buffer(&mut self, frame: Frame) -> Result<Option<Event>> {
        if self.reassembly.buffered_len() + frame.payload.len() > self.max_message_size {
            return Err(Error::InvalidFrame("message exceeds max message size"));
        }

        if let Some(marker) = self.reassembly.push(frame) {
            if marker.is_final() {
                return self.complete(marker).map(Some);
            }
            return Ok(None);
        }

        match self.reassembly.pop_finished() {
            Some(message) => self.complete(message).map(Some),
            None => Ok(None),
        }
    }

    /// Turn a finished message into an event
    fn complete(&mut self, message: Frame) -> Result<Event> {
        let opcode = match message.opcode() {
            OpCode::Continuation => self.message_opcode.unwrap_or(OpCode::Binary),
            op => op,
        };
        self.message_opcode = None;

        match opcode {
            OpCode::Text => {
                let text = String::from_utf8(message.payload.to_vec())
                    .map_err(|_| Error::InvalidFrame("invalid UTF-8 in text message"))?;
                Ok(Event::Text(text))
            }
            _ => Ok(Event::Binary(message.payload.freeze(), FragmentMarker::Whole)),
        }
    }

    /// Encode a masked text frame
    pub fn encode_text(text: &str, buf: &mut BytesMut) {
        encode_frame(buf, OpCode::Text, text.as_bytes(), true, Some(generate_mask()));
    }

    /// Encode a masked binary frame for one chunk of a message
    pub fn encode_binary(data: &[u8], marker: FragmentMarker, buf: &mut BytesMut) {
        encode_fragment(buf, OpCode::Binary, data, marker, Some(generate_mask()));
    }

    /// Encode a masked ping
    pub fn encode_ping(payload: &[u8], buf: &mut BytesMut) {
        encode_frame(buf, OpCode::Ping, payload, true, Some(generate_mask()));
    }

    /// Encode a masked pong echoing `ping_data`
    pub fn encode_pong(ping_data: &[u8], buf: &mut BytesMut) {
        encode_frame(buf, OpCode::Pong, ping_data, true, Some(generate_mask()));
    }

    /// Encode a masked close frame
    pub fn encode_close(payload: &[u8], buf: &mut BytesMut) {
        encode_frame(buf, OpCode::Close, payload, true, Some(generate_mask()));
    }
}
