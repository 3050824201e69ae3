//! WebSocket frame decoding and encoding
//!
//! This module implements the RFC 6455 frame layout for a client endpoint:
//! - `check_frame_size` finds one complete frame at the front of a receive buffer
//! - `decode` turns that frame into an owned, unmasked [`Frame`]
//! - `encode_frame` / `encode_fragment` serialize outgoing frames with masking
//!
//! Decoding supports payload lengths up to `u32::MAX`. A 64-bit length field
//! carrying a larger value is rejected with [`Error::FrameTooLarge`] rather
//! than truncated.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::mask::apply_mask;
use crate::{MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// Largest payload length the decoder accepts
pub const MAX_PAYLOAD_LEN: u64 = u32::MAX as u64;

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// Position of a binary chunk within a logical message
///
/// Used both by `send_binary` to pick opcode/FIN and by the streaming
/// binary callback to tell the application where a chunk belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentMarker {
    /// First frame of a fragmented message
    Start,
    /// Middle frame of a fragmented message
    Continue,
    /// Last frame of a fragmented message
    End,
    /// Unfragmented message
    Whole,
}

impl FragmentMarker {
    /// Whether the frame carrying this chunk has FIN set
    #[inline]
    pub fn is_final(&self) -> bool {
        matches!(self, FragmentMarker::End | FragmentMarker::Whole)
    }

    /// Opcode used on the wire for a chunk of a message whose first frame is `opcode`
    #[inline]
    pub fn wire_opcode(&self, opcode: OpCode) -> OpCode {
        match self {
            FragmentMarker::Start | FragmentMarker::Whole => opcode,
            FragmentMarker::Continue | FragmentMarker::End => OpCode::Continuation,
        }
    }
}

/// A parsed WebSocket frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag
    pub masked: bool,
    /// Payload length as announced on the wire
    pub payload_len: u64,
    /// Masking key (if masked)
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Get the total header size in bytes
    #[inline]
    pub fn header_size(&self) -> usize {
        header_size_for(self.payload_len, self.masked)
    }
}

#[inline]
fn header_size_for(payload_len: u64, masked: bool) -> usize {
    let mut size = 2;

    if payload_len > MEDIUM_MESSAGE_THRESHOLD as u64 {
        size += 8;
    } else if payload_len > SMALL_MESSAGE_THRESHOLD as u64 {
        size += 2;
    }

    if masked {
        size += 4;
    }

    size
}

/// A complete WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Frame payload (already unmasked)
    pub payload: BytesMut,
}

impl Frame {
    /// Create an unmasked frame
    pub fn new(opcode: OpCode, payload: impl Into<BytesMut>, fin: bool) -> Self {
        let payload = payload.into();
        Self {
            header: FrameHeader {
                fin,
                opcode,
                masked: false,
                payload_len: payload.len() as u64,
                mask: None,
            },
            payload,
        }
    }

    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    /// Check if this is the final fragment
    #[inline]
    pub fn is_final(&self) -> bool {
        self.header.fin
    }

    /// Header length this frame had (or would have) on the wire
    #[inline]
    pub fn header_len(&self) -> usize {
        self.header.header_size()
    }

    /// Append `from`'s payload to this frame and adopt its FIN flag
    ///
    /// Used to merge a new fragment into the frame already buffered for an
    /// unfinished message.
    pub fn combine(&mut self, from: Frame) {
        if self.payload.is_empty() {
            self.payload = from.payload;
        } else {
            self.payload.extend_from_slice(&from.payload);
        }
        self.header.payload_len = self.payload.len() as u64;
        self.header.fin = from.header.fin;
    }

    /// Convert into the dispatch variant
    pub fn into_received(self) -> Received {
        let fin = self.header.fin;
        match self.header.opcode {
            OpCode::Text => Received::Text {
                payload: self.payload,
                fin,
            },
            OpCode::Binary => Received::Binary {
                payload: self.payload,
                fin,
            },
            OpCode::Continuation => Received::Continuation {
                payload: self.payload,
                fin,
            },
            OpCode::Ping => Received::Ping(self.payload.freeze()),
            OpCode::Pong => Received::Pong,
            OpCode::Close => Received::Close,
        }
    }
}

/// An inbound frame, narrowed to what each kind needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Text data (possibly a first fragment)
    Text { payload: BytesMut, fin: bool },
    /// Binary data (possibly a first fragment)
    Binary { payload: BytesMut, fin: bool },
    /// Later fragment of a text or binary message
    Continuation { payload: BytesMut, fin: bool },
    /// Ping with its application data, to be echoed in a pong
    Ping(Bytes),
    /// Pong (payload is not kept)
    Pong,
    /// Close (payload is not kept)
    Close,
}

/// Header fields needed to size and slice a frame
struct RawHeader {
    fin: bool,
    opcode: u8,
    masked: bool,
    payload_len: u64,
    mask_pos: usize,
    header_size: usize,
}

/// Parse the header at the front of `buf`
///
/// Returns `Ok(None)` when the header itself is not fully buffered.
#[inline]
fn parse_header(buf: &[u8]) -> Result<Option<RawHeader>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let b0 = buf[0];
    let b1 = buf[1];

    let fin = b0 & 0x80 != 0;
    let opcode = b0 & 0x0F;
    let masked = b1 & 0x80 != 0;
    let len_byte = b1 & 0x7F;

    let len_field = match len_byte {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let mask_pos = 2 + len_field;
    let header_size = mask_pos + if masked { 4 } else { 0 };

    if buf.len() < header_size {
        return Ok(None);
    }

    let payload_len = match len_byte {
        126 => u16::from_be_bytes([buf[2], buf[3]]) as u64,
        127 => {
            let len = u64::from_be_bytes([
                buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
            ]);
            if len > MAX_PAYLOAD_LEN {
                return Err(Error::FrameTooLarge);
            }
            len
        }
        small => small as u64,
    };

    Ok(Some(RawHeader {
        fin,
        opcode,
        masked,
        payload_len,
        mask_pos,
        header_size,
    }))
}

/// Number of bytes the frame at the front of `buf` occupies
///
/// Returns 0 when the buffer does not yet hold a complete frame.
pub fn check_frame_size(buf: &[u8]) -> Result<usize> {
    match parse_header(buf)? {
        Some(raw) => {
            let total = raw.header_size as u64 + raw.payload_len;
            if total <= buf.len() as u64 {
                Ok(total as usize)
            } else {
                Ok(0)
            }
        }
        None => Ok(0),
    }
}

/// Payload length announced by the header at the front of `buf`
///
/// Lets a reader reject an oversized frame before buffering all of it.
pub fn peek_payload_len(buf: &[u8]) -> Result<Option<u64>> {
    Ok(parse_header(buf)?.map(|raw| raw.payload_len))
}

/// Decode the frame at the front of `buf`
///
/// Returns:
/// - `Ok(Some(frame))` if a complete frame is buffered
/// - `Ok(None)` if more data is needed
/// - `Err(Error::UnknownOpcode)` for an opcode outside RFC 6455
/// - `Err(Error::FrameTooLarge)` for a length above [`MAX_PAYLOAD_LEN`]
pub fn decode(buf: &[u8]) -> Result<Option<Frame>> {
    let raw = match parse_header(buf)? {
        Some(raw) => raw,
        None => return Ok(None),
    };

    let payload_len = raw.payload_len as usize;
    let end = raw.header_size + payload_len;
    if buf.len() < end {
        return Ok(None);
    }

    let opcode = OpCode::from_u8(raw.opcode).ok_or(Error::UnknownOpcode(raw.opcode))?;

    let mask = if raw.masked {
        let p = raw.mask_pos;
        Some([buf[p], buf[p + 1], buf[p + 2], buf[p + 3]])
    } else {
        None
    };

    let header = FrameHeader {
        fin: raw.fin,
        opcode,
        masked: raw.masked,
        payload_len: raw.payload_len,
        mask,
    };

    // Close and pong carry nothing the engine acts on.
    if matches!(opcode, OpCode::Close | OpCode::Pong) {
        return Ok(Some(Frame {
            header,
            payload: BytesMut::new(),
        }));
    }

    let mut payload = BytesMut::from(&buf[raw.header_size..end]);
    if let Some(m) = mask {
        apply_mask(&mut payload, m);
    }

    Ok(Some(Frame { header, payload }))
}

/// Encode a frame into a buffer
///
/// For masked frames (client mode) the payload is copied and masked.
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    let payload_len = payload.len();

    buf.reserve(header_size_for(payload_len as u64, mask.is_some()) + payload_len);

    // First byte: FIN + opcode
    let mut b0 = opcode as u8;
    if fin {
        b0 |= 0x80;
    }
    buf.put_u8(b0);

    // Second byte: mask flag + length
    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };

    if payload_len <= SMALL_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    if let Some(m) = mask {
        buf.put_slice(&m);

        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], m);
    } else {
        buf.put_slice(payload);
    }
}

/// Encode one chunk of a possibly fragmented message
///
/// `opcode` is the opcode of the message (`Text` or `Binary`); the wire
/// opcode and FIN bit are derived from `marker`.
pub fn encode_fragment(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    marker: FragmentMarker,
    mask: Option<[u8; 4]>,
) {
    encode_frame(
        buf,
        marker.wire_opcode(opcode),
        payload,
        marker.is_final(),
        mask,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(opcode: OpCode, payload: &[u8], fin: bool, mask: Option<[u8; 4]>) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, fin, mask);
        buf
    }

    #[test]
    fn test_opcode() {
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(OpCode::Continuation.is_data());
        assert_eq!(OpCode::from_u8(0x3), None);
    }

    #[test]
    fn test_decode_needs_two_bytes() {
        assert_eq!(decode(&[]).unwrap(), None);
        assert_eq!(decode(&[0x81]).unwrap(), None);
        assert_eq!(check_frame_size(&[0x81]).unwrap(), 0);
    }

    #[test]
    fn test_decode_small_unmasked() {
        let frame = decode(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o'])
            .unwrap()
            .unwrap();
        assert!(frame.is_final());
        assert_eq!(frame.opcode(), OpCode::Text);
        assert_eq!(&frame.payload[..], b"hello");
        assert_eq!(frame.header_len(), 2);
    }

    #[test]
    fn test_decode_incomplete_payload() {
        assert_eq!(decode(&[0x81, 0x05, b'h', b'e']).unwrap(), None);
        assert_eq!(check_frame_size(&[0x81, 0x05, b'h', b'e']).unwrap(), 0);
    }

    #[test]
    fn test_masking_on_the_wire() {
        let mask = [0x01, 0x02, 0x03, 0x04];
        let buf = encoded(OpCode::Binary, &[0x05, 0x06], true, Some(mask));

        assert_eq!(buf[0], 0x82);
        assert_eq!(buf[1], 0x82); // masked + length 2
        assert_eq!(&buf[2..6], &mask);
        assert_eq!(&buf[6..], &[0x04, 0x04]);

        let frame = decode(&buf).unwrap().unwrap();
        assert!(frame.header.masked);
        assert_eq!(frame.header.mask, Some(mask));
        assert_eq!(&frame.payload[..], &[0x05, 0x06]);
    }

    #[test]
    fn test_header_length_boundaries() {
        // (payload length, unmasked header size)
        let cases = [(0usize, 2usize), (125, 2), (126, 4), (65535, 4), (65536, 10)];

        for (len, header) in cases {
            let payload = vec![0xABu8; len];

            let plain = encoded(OpCode::Binary, &payload, true, None);
            assert_eq!(plain.len(), header + len, "unmasked len {}", len);
            assert_eq!(check_frame_size(&plain).unwrap(), header + len);

            let masked = encoded(OpCode::Binary, &payload, true, Some([9, 8, 7, 6]));
            assert_eq!(masked.len(), header + 4 + len, "masked len {}", len);

            let frame = decode(&masked).unwrap().unwrap();
            assert_eq!(frame.header_len(), header + 4);
            assert_eq!(frame.payload.len(), len);
            assert!(frame.payload.iter().all(|b| *b == 0xAB));
        }
    }

    #[test]
    fn test_round_trip_data_and_control() {
        let cases: [(OpCode, &[u8]); 4] = [
            (OpCode::Text, b"Hello"),
            (OpCode::Binary, &[0, 1, 2, 3, 255]),
            (OpCode::Continuation, b""),
            (OpCode::Ping, b"42"),
        ];

        for (opcode, payload) in cases {
            for mask in [None, Some([0x37, 0xfa, 0x21, 0x3d])] {
                let buf = encoded(opcode, payload, true, mask);
                let frame = decode(&buf).unwrap().unwrap();
                assert_eq!(frame.opcode(), opcode);
                assert_eq!(&frame.payload[..], payload);
            }
        }
    }

    #[test]
    fn test_close_and_pong_are_headers_only() {
        let buf = encoded(OpCode::Close, b"17", true, Some([1, 2, 3, 4]));
        let frame = decode(&buf).unwrap().unwrap();
        assert_eq!(frame.opcode(), OpCode::Close);
        assert!(frame.payload.is_empty());
        assert_eq!(frame.header.payload_len, 2);

        let buf = encoded(OpCode::Pong, b"abc", true, None);
        assert_eq!(decode(&buf).unwrap().unwrap().into_received(), Received::Pong);
    }

    #[test]
    fn test_length_above_32_bits_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(127);
        buf.put_u64(u32::MAX as u64 + 1);

        assert!(matches!(check_frame_size(&buf), Err(Error::FrameTooLarge)));
        assert!(matches!(decode(&buf), Err(Error::FrameTooLarge)));
    }

    #[test]
    fn test_length_at_32_bit_ceiling_is_accepted_as_incomplete() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(127);
        buf.put_u64(u32::MAX as u64);

        assert_eq!(check_frame_size(&buf).unwrap(), 0);
        assert_eq!(decode(&buf).unwrap(), None);
    }

    #[test]
    fn test_unknown_opcode() {
        let buf = [0x83, 0x00];
        assert_eq!(check_frame_size(&buf).unwrap(), 2);
        assert!(matches!(decode(&buf), Err(Error::UnknownOpcode(0x3))));
    }

    #[test]
    fn test_check_frame_size_finds_first_of_two() {
        let mut buf = encoded(OpCode::Text, b"first", true, None);
        buf.extend_from_slice(&encoded(OpCode::Text, b"second", true, None));

        let size = check_frame_size(&buf).unwrap();
        assert_eq!(size, 7);

        let first = decode(&buf[..size]).unwrap().unwrap();
        assert_eq!(&first.payload[..], b"first");
        let second = decode(&buf[size..]).unwrap().unwrap();
        assert_eq!(&second.payload[..], b"second");
    }

    #[test]
    fn test_encode_fragment_markers() {
        let mut buf = BytesMut::new();
        encode_fragment(&mut buf, OpCode::Binary, b"ab", FragmentMarker::Start, None);
        assert_eq!(buf[0], 0x02);

        buf.clear();
        encode_fragment(&mut buf, OpCode::Binary, b"cd", FragmentMarker::Continue, None);
        assert_eq!(buf[0], 0x00);

        buf.clear();
        encode_fragment(&mut buf, OpCode::Binary, b"", FragmentMarker::End, None);
        assert_eq!(&buf[..], &[0x80, 0x00]);

        buf.clear();
        encode_fragment(&mut buf, OpCode::Binary, b"ef", FragmentMarker::Whole, None);
        assert_eq!(buf[0], 0x82);
    }

    #[test]
    fn test_combine() {
        let mut first = Frame::new(OpCode::Text, &b"He"[..], false);
        let second = Frame::new(OpCode::Continuation, &b"llo"[..], true);

        first.combine(second);
        assert!(first.is_final());
        assert_eq!(first.opcode(), OpCode::Text);
        assert_eq!(&first.payload[..], b"Hello");
        assert_eq!(first.header.payload_len, 5);
    }
}
