use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Header carried at the front of every load message, padded to the
/// configured message size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadPayload {
    pub publisher: u32,
    pub sequence: u64,
    /// Microseconds since the start of the run.
    pub sent_at_micros: u64,
}

impl LoadPayload {
    pub const HEADER_LEN: usize = 4 + 8 + 8;

    const PADDING: u8 = b'x';

    #[must_use]
    pub fn encode(&self, size: usize) -> Bytes {
        let mut buf = BytesMut::with_capacity(size.max(Self::HEADER_LEN));
        buf.put_u32(self.publisher);
        buf.put_u64(self.sequence);
        buf.put_u64(self.sent_at_micros);
        if size > Self::HEADER_LEN {
            buf.put_bytes(Self::PADDING, size - Self::HEADER_LEN);
        }
        buf.freeze()
    }

    /// `None` for payloads that did not come from a load publisher.
    #[must_use]
    pub fn decode(mut payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::HEADER_LEN {
            return None;
        }
        Some(Self {
            publisher: payload.get_u32(),
            sequence: payload.get_u64(),
            sent_at_micros: payload.get_u64(),
        })
    }
}
