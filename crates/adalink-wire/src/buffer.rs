use adalink_core::error::ProtocolError;

/// Role of a call buffer, identified by one letter. On the wire the tag is
/// four bytes: the letter followed by three spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferTag {
    Format,
    Record,
    Search,
    Value,
    Isn,
    Multifetch,
    UserInfo,
}

impl BufferTag {
    pub fn letter(self) -> u8 {
        match self {
            BufferTag::Format => b'F',
            BufferTag::Record => b'R',
            BufferTag::Search => b'S',
            BufferTag::Value => b'V',
            BufferTag::Isn => b'I',
            BufferTag::Multifetch => b'M',
            BufferTag::UserInfo => b'U',
        }
    }

    pub fn from_letter(b: u8) -> Result<Self, ProtocolError> {
        Ok(match b {
            b'F' => BufferTag::Format,
            b'R' => BufferTag::Record,
            b'S' => BufferTag::Search,
            b'V' => BufferTag::Value,
            b'I' => BufferTag::Isn,
            b'M' => BufferTag::Multifetch,
            b'U' => BufferTag::UserInfo,
            other => return Err(ProtocolError::InvalidBufferTag(other)),
        })
    }

    /// Four-byte header form of the tag.
    pub fn header(self) -> [u8; 4] {
        [self.letter(), b' ', b' ', b' ']
    }

    /// True when the server writes into this buffer on a reply.
    pub fn is_receive(self) -> bool {
        matches!(
            self,
            BufferTag::Record | BufferTag::Isn | BufferTag::Multifetch
        )
    }
}

/// Upper bound for a single buffer; a request exceeding it is a caller bug
/// surfaced as a protocol error rather than an allocation storm.
pub const MAX_BUFFER_CAPACITY: usize = 64 * 1024 * 1024;

/// One typed call buffer: a tag, a pre-allocated capacity and the used
/// prefix of its backing bytes. `used <= capacity` always holds; for
/// receive buffers `used` reflects what the server wrote back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    tag: BufferTag,
    bytes: Vec<u8>,
    used: usize,
}

impl Buffer {
    pub fn new(tag: BufferTag) -> Self {
        Buffer {
            tag,
            bytes: Vec::new(),
            used: 0,
        }
    }

    pub fn with_capacity(tag: BufferTag, capacity: usize) -> Self {
        Buffer {
            tag,
            bytes: vec![0; capacity],
            used: 0,
        }
    }

    pub fn tag(&self) -> BufferTag {
        self.tag
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The prefix the server wrote (receive side) or the caller staged
    /// (send side).
    pub fn used_bytes(&self) -> &[u8] {
        &self.bytes[..self.used]
    }

    /// Grow to at least `capacity` zeroed bytes, subject to the cap.
    pub fn allocate(&mut self, capacity: usize) -> Result<(), ProtocolError> {
        if capacity > MAX_BUFFER_CAPACITY {
            return Err(ProtocolError::InvalidValue {
                field: "Buffer.capacity",
                reason: "capacity exceeds the buffer cap",
            });
        }
        if capacity > self.bytes.len() {
            self.bytes.resize(capacity, 0);
        }
        Ok(())
    }

    pub fn write_string(&mut self, content: &str) -> Result<(), ProtocolError> {
        self.write_bytes(content.as_bytes())
    }

    pub fn write_byte(&mut self, byte: u8) -> Result<(), ProtocolError> {
        self.write_bytes(&[byte])
    }

    pub fn write_bytes(&mut self, content: &[u8]) -> Result<(), ProtocolError> {
        let end = self.used + content.len();
        self.allocate(end)?;
        self.bytes[self.used..end].copy_from_slice(content);
        self.used = end;
        Ok(())
    }

    /// Zero the used size; capacity is kept for reuse.
    pub fn reset(&mut self) {
        self.used = 0;
        self.bytes.fill(0);
    }

    /// Install the reply payload for this buffer. The server never writes
    /// beyond the advertised capacity.
    pub fn set_received(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        if payload.len() > self.bytes.len() {
            return Err(ProtocolError::InvalidValue {
                field: "Buffer.used",
                reason: "reply larger than the advertised capacity",
            });
        }
        self.bytes[..payload.len()].copy_from_slice(payload);
        self.used = payload.len();
        Ok(())
    }

    /// Mark the whole capacity as used, for staged send buffers that were
    /// filled through `allocate` + direct writes.
    pub fn set_used(&mut self, used: usize) -> Result<(), ProtocolError> {
        if used > self.bytes.len() {
            return Err(ProtocolError::InvalidValue {
                field: "Buffer.used",
                reason: "used exceeds capacity",
            });
        }
        self.used = used;
        Ok(())
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_headers() {
        assert_eq!(BufferTag::Format.header(), *b"F   ");
        assert_eq!(BufferTag::from_letter(b'M').unwrap(), BufferTag::Multifetch);
        assert!(BufferTag::from_letter(b'Q').is_err());
    }

    #[test]
    fn write_grows_and_tracks_used() {
        let mut b = Buffer::new(BufferTag::Format);
        b.write_string("AA,8,A.").unwrap();
        assert_eq!(b.used(), 7);
        assert_eq!(b.capacity(), 7);
        b.write_byte(b'X').unwrap();
        assert_eq!(b.used_bytes(), b"AA,8,A.X");
    }

    #[test]
    fn reset_keeps_capacity() {
        let mut b = Buffer::with_capacity(BufferTag::Record, 64);
        b.write_bytes(&[1, 2, 3]).unwrap();
        b.reset();
        assert_eq!(b.used(), 0);
        assert_eq!(b.capacity(), 64);
        assert!(b.bytes().iter().all(|x| *x == 0));
    }

    #[test]
    fn received_payload_bounded_by_capacity() {
        let mut b = Buffer::with_capacity(BufferTag::Record, 4);
        assert!(b.set_received(&[1, 2, 3, 4, 5]).is_err());
        b.set_received(&[9, 9]).unwrap();
        assert_eq!(b.used_bytes(), &[9, 9]);
    }

    #[test]
    fn allocation_cap_enforced() {
        let mut b = Buffer::new(BufferTag::Record);
        assert!(b.allocate(MAX_BUFFER_CAPACITY + 1).is_err());
    }
}
