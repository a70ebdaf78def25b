//! Fixed-width frame protocol shared by the broker and every client.
//!
//! A frame is written to a FIFO with a single `write`, so it must never exceed
//! the size the kernel guarantees to be atomic. Fields use host byte order:
//! both ends always live on the same machine.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Identity of a connected client. Clients use their process id.
pub type SenderId = i32;

/// Capacity of the reply address field, terminator included.
pub const MAX_ADDRESS: usize = 128;
/// Capacity of the chat text field, terminator included.
pub const MAX_TEXT: usize = 256;
/// Smallest `PIPE_BUF` POSIX allows; writes up to this size are never interleaved.
pub const ATOMIC_WRITE_LIMIT: usize = 512;
/// Encoded size of every frame.
pub const FRAME_SIZE: usize = 4 + 4 + MAX_ADDRESS + MAX_TEXT;

const _: () = assert!(
    FRAME_SIZE <= ATOMIC_WRITE_LIMIT,
    "frame exceeds the atomic write limit"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Connect,
    Chat,
    Disconnect,
}

impl FrameKind {
    pub fn as_i32(self) -> i32 {
        match self {
            FrameKind::Connect => 1,
            FrameKind::Chat => 2,
            FrameKind::Disconnect => 3,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(FrameKind::Connect),
            2 => Some(FrameKind::Chat),
            3 => Some(FrameKind::Disconnect),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unknown frame kind: {0}")]
    UnknownKind(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    sender_id: SenderId,
    reply_address: String,
    text: String,
}

impl Frame {
    /// Builds a frame, truncating `reply_address` and `text` so each fits its
    /// field with room for the terminator.
    pub fn new(kind: FrameKind, sender_id: SenderId, reply_address: &str, text: &str) -> Self {
        Self {
            kind,
            sender_id,
            reply_address: truncate_to(reply_address, MAX_ADDRESS - 1).to_string(),
            text: truncate_to(text, MAX_TEXT - 1).to_string(),
        }
    }

    pub fn connect(sender_id: SenderId, reply_address: &str) -> Self {
        Self::new(FrameKind::Connect, sender_id, reply_address, "")
    }

    pub fn chat(sender_id: SenderId, reply_address: &str, text: &str) -> Self {
        Self::new(FrameKind::Chat, sender_id, reply_address, text)
    }

    pub fn disconnect(sender_id: SenderId, reply_address: &str) -> Self {
        Self::new(FrameKind::Disconnect, sender_id, reply_address, "")
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn sender_id(&self) -> SenderId {
        self.sender_id
    }

    pub fn reply_address(&self) -> &str {
        &self.reply_address
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(FRAME_SIZE);
        dst.put_i32_ne(self.kind.as_i32());
        dst.put_i32_ne(self.sender_id);
        put_padded(&mut dst, &self.reply_address, MAX_ADDRESS);
        put_padded(&mut dst, &self.text, MAX_TEXT);
        dst.freeze()
    }

    pub fn decode(src: &[u8]) -> Result<Self, DecodeError> {
        if src.len() != FRAME_SIZE {
            return Err(DecodeError::Truncated {
                expected: FRAME_SIZE,
                actual: src.len(),
            });
        }

        let mut src = src;
        let raw_kind = src.get_i32_ne();
        let kind = FrameKind::from_i32(raw_kind).ok_or(DecodeError::UnknownKind(raw_kind))?;
        let sender_id = src.get_i32_ne();
        let reply_address = read_padded(&src[..MAX_ADDRESS]);
        let text = read_padded(&src[MAX_ADDRESS..MAX_ADDRESS + MAX_TEXT]);

        // Lossy replacement can grow a field past its capacity; refit it so
        // the frame can be encoded again.
        Ok(Self::new(kind, sender_id, &reply_address, &text))
    }
}

fn put_padded(dst: &mut BytesMut, value: &str, capacity: usize) {
    dst.put_slice(value.as_bytes());
    dst.put_bytes(0, capacity - value.len());
}

fn read_padded(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn truncate_to(value: &str, max_len: usize) -> &str {
    if value.len() <= max_len {
        return value;
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_frame_has_fixed_width() {
        let short = Frame::connect(1, "/tmp/a");
        let long = Frame::chat(2, &"x".repeat(500), &"y".repeat(500));

        assert_eq!(short.encode().len(), FRAME_SIZE);
        assert_eq!(long.encode().len(), FRAME_SIZE);
    }

    #[test]
    fn chat_frame_survives_the_wire() {
        let frame = Frame::chat(100, "/tmp/client_fifo_100", "hello");
        let decoded = Frame::decode(&frame.encode()).expect("decode chat frame");

        assert_eq!(decoded, frame);
        assert_eq!(decoded.kind(), FrameKind::Chat);
        assert_eq!(decoded.sender_id(), 100);
        assert_eq!(decoded.text(), "hello");
    }

    #[test]
    fn short_input_is_truncated() {
        let encoded = Frame::connect(7, "/tmp/x").encode();
        let result = Frame::decode(&encoded[..FRAME_SIZE - 1]);

        assert_eq!(
            result,
            Err(DecodeError::Truncated {
                expected: FRAME_SIZE,
                actual: FRAME_SIZE - 1
            })
        );
        assert!(matches!(
            Frame::decode(&[]),
            Err(DecodeError::Truncated { actual: 0, .. })
        ));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut raw = Frame::connect(7, "/tmp/x").encode().to_vec();
        raw[..4].copy_from_slice(&9i32.to_ne_bytes());

        assert_eq!(Frame::decode(&raw), Err(DecodeError::UnknownKind(9)));
    }

    #[test]
    fn long_text_is_cut_on_a_char_boundary() {
        // 'é' is two bytes, so 255 bytes lands in the middle of one.
        let text = "é".repeat(200);
        let frame = Frame::chat(1, "/tmp/a", &text);

        assert_eq!(frame.text().len(), 254);
        assert!(frame.text().chars().all(|c| c == 'é'));

        let decoded = Frame::decode(&frame.encode()).expect("decode");
        assert_eq!(decoded.text(), frame.text());
    }

    #[test]
    fn foreign_bytes_are_refitted_to_the_field() {
        let mut raw = Frame::chat(1, "/tmp/a", &"a".repeat(MAX_TEXT - 1)).encode().to_vec();
        raw[8 + MAX_ADDRESS + 254] = 0xE9;
        // Address field filled to the brim with no terminator.
        raw[8..8 + MAX_ADDRESS].fill(b'b');

        let decoded = Frame::decode(&raw).expect("decode latin-1 frame");

        assert!(decoded.text().len() < MAX_TEXT);
        assert!(decoded.text().starts_with(&"a".repeat(250)));
        assert_eq!(decoded.reply_address().len(), MAX_ADDRESS - 1);
        assert_eq!(decoded.encode().len(), FRAME_SIZE);
    }

    #[test]
    fn text_is_ignored_outside_chat_frames_but_still_fits() {
        let frame = Frame::disconnect(3, "/tmp/client_fifo_3");
        let decoded = Frame::decode(&frame.encode()).expect("decode");

        assert_eq!(decoded.kind(), FrameKind::Disconnect);
        assert_eq!(decoded.text(), "");
        assert_eq!(decoded.reply_address(), "/tmp/client_fifo_3");
    }
}
