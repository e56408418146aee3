use std::io::{Read, Write};

use adalink_core::error::{Error, ProtocolError};
use adalink_core::types::Identity;

use crate::acbx::{Acbx, ACBX_LENGTH};
use crate::buffer::{Buffer, BufferTag, MAX_BUFFER_CAPACITY};

/// Wire protocol version carried in every frame header.
pub const FRAME_VERSION: u8 = 1;

/// Frame header: u32 big-endian total length, one kind byte, one version
/// byte.
pub const FRAME_HEADER_LEN: usize = 6;

const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

const IDENTITY_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
    Event,
}

impl FrameKind {
    fn to_byte(self) -> u8 {
        match self {
            FrameKind::Request => 0,
            FrameKind::Response => 1,
            FrameKind::Event => 2,
        }
    }

    fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        Ok(match b {
            0 => FrameKind::Request,
            1 => FrameKind::Response,
            2 => FrameKind::Event,
            other => return Err(ProtocolError::UnexpectedFrameType(other)),
        })
    }
}

/// One framed (ACBX, buffer list) exchange unit. Requests carry the caller
/// identity ahead of the control block; responses return the control block
/// with response/subcode set and each buffer's used size updated.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub identity: Option<Identity>,
    pub acbx: Acbx,
    pub buffers: Vec<Buffer>,
}

impl Frame {
    pub fn request(identity: Identity, acbx: Acbx, buffers: Vec<Buffer>) -> Self {
        Frame {
            kind: FrameKind::Request,
            identity: Some(identity),
            acbx,
            buffers,
        }
    }

    pub fn response(acbx: Acbx, buffers: Vec<Buffer>) -> Self {
        Frame {
            kind: FrameKind::Response,
            identity: None,
            acbx,
            buffers,
        }
    }
}

/// Serialise one frame. Each buffer is written as
/// (tag[4], capacity u32, used u32, payload[used]), little-endian integers.
pub fn write_frame(w: &mut impl Write, frame: &Frame) -> Result<(), Error> {
    let mut payload = Vec::with_capacity(ACBX_LENGTH + 64);
    if frame.kind == FrameKind::Request {
        let id = frame.identity.as_ref().ok_or(ProtocolError::InvalidValue {
            field: "Frame.identity",
            reason: "request frames carry the caller identity",
        })?;
        payload.extend_from_slice(&id.user);
        payload.extend_from_slice(&id.node);
        payload.extend_from_slice(&id.pid.to_le_bytes());
        payload.extend_from_slice(&id.timestamp.to_le_bytes());
    }
    payload.extend_from_slice(&frame.acbx.to_bytes());
    payload.extend_from_slice(&(frame.buffers.len() as u32).to_le_bytes());
    for buffer in &frame.buffers {
        payload.extend_from_slice(&buffer.tag().header());
        payload.extend_from_slice(&(buffer.capacity() as u32).to_le_bytes());
        payload.extend_from_slice(&(buffer.used() as u32).to_le_bytes());
        payload.extend_from_slice(buffer.used_bytes());
    }

    let total = FRAME_HEADER_LEN + payload.len();
    w.write_all(&(total as u32).to_be_bytes())?;
    w.write_all(&[frame.kind.to_byte(), FRAME_VERSION])?;
    w.write_all(&payload)?;
    w.flush()?;
    Ok(())
}

/// Read one frame, validating header, version and all declared lengths.
pub fn read_frame(r: &mut impl Read) -> Result<Frame, Error> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    r.read_exact(&mut header)?;
    let total = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let kind = FrameKind::from_byte(header[4])?;
    if header[5] != FRAME_VERSION {
        return Err(ProtocolError::UnsupportedVersion(header[5]).into());
    }
    if total < FRAME_HEADER_LEN || total > MAX_FRAME_LEN {
        return Err(ProtocolError::LengthMismatch {
            declared: total,
            actual: FRAME_HEADER_LEN,
        }
        .into());
    }
    let mut payload = vec![0u8; total - FRAME_HEADER_LEN];
    r.read_exact(&mut payload)?;

    let mut off = 0usize;
    let identity = if kind == FrameKind::Request {
        let id = parse_identity(&payload)?;
        off += IDENTITY_LEN;
        Some(id)
    } else {
        None
    };

    need(&payload, off, ACBX_LENGTH)?;
    let acbx = Acbx::from_bytes(&payload[off..off + ACBX_LENGTH])?;
    off += ACBX_LENGTH;

    need(&payload, off, 4)?;
    let count = u32::from_le_bytes([
        payload[off],
        payload[off + 1],
        payload[off + 2],
        payload[off + 3],
    ]) as usize;
    off += 4;

    let mut buffers = Vec::with_capacity(count);
    for _ in 0..count {
        need(&payload, off, 12)?;
        let tag = BufferTag::from_letter(payload[off])?;
        let capacity = u32::from_le_bytes([
            payload[off + 4],
            payload[off + 5],
            payload[off + 6],
            payload[off + 7],
        ]) as usize;
        let used = u32::from_le_bytes([
            payload[off + 8],
            payload[off + 9],
            payload[off + 10],
            payload[off + 11],
        ]) as usize;
        off += 12;
        if capacity > MAX_BUFFER_CAPACITY || used > capacity {
            return Err(ProtocolError::InvalidValue {
                field: "Frame.buffer",
                reason: "declared buffer sizes out of range",
            }
            .into());
        }
        need(&payload, off, used)?;
        let mut buffer = Buffer::with_capacity(tag, capacity);
        buffer.set_received(&payload[off..off + used])?;
        off += used;
        buffers.push(buffer);
    }
    if off != payload.len() {
        return Err(ProtocolError::LengthMismatch {
            declared: total,
            actual: FRAME_HEADER_LEN + off,
        }
        .into());
    }

    Ok(Frame {
        kind,
        identity,
        acbx,
        buffers,
    })
}

fn parse_identity(payload: &[u8]) -> Result<Identity, ProtocolError> {
    need(payload, 0, IDENTITY_LEN)?;
    let mut user = [0u8; 8];
    let mut node = [0u8; 8];
    user.copy_from_slice(&payload[0..8]);
    node.copy_from_slice(&payload[8..16]);
    let pid = u32::from_le_bytes([payload[16], payload[17], payload[18], payload[19]]);
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&payload[20..28]);
    Ok(Identity {
        user,
        node,
        pid,
        timestamp: u64::from_le_bytes(ts),
    })
}

fn need(payload: &[u8], off: usize, len: usize) -> Result<(), ProtocolError> {
    if off + len > payload.len() {
        return Err(ProtocolError::Truncated {
            at: off,
            needed: len,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use adalink_core::types::{Command, Dbid, Fnr};

    fn sample_frame() -> Frame {
        let mut acbx = Acbx::new(Dbid(24));
        acbx.reset_for(Command::S1, Fnr(11));
        acbx.command_id = *b"Q001";
        let mut fb = Buffer::new(BufferTag::Format);
        fb.write_string("AA,8,A.").unwrap();
        let rb = Buffer::with_capacity(BufferTag::Record, 64);
        let mut sb = Buffer::new(BufferTag::Search);
        sb.write_string("AE,20,A,EQ.").unwrap();
        Frame::request(Identity::new("tester", "node1"), acbx, vec![fb, rb, sb])
    }

    fn round_trip(frame: &Frame) -> Frame {
        let mut wire = Vec::new();
        write_frame(&mut wire, frame).unwrap();
        read_frame(&mut wire.as_slice()).unwrap()
    }

    #[test]
    fn request_round_trips_byte_identical() {
        let frame = sample_frame();
        let mut first = Vec::new();
        write_frame(&mut first, &frame).unwrap();
        let re_read = read_frame(&mut first.as_slice()).unwrap();
        let mut second = Vec::new();
        write_frame(&mut second, &re_read).unwrap();
        assert_eq!(first, second);
        assert_eq!(re_read, frame);
    }

    #[test]
    fn response_round_trips() {
        let mut frame = sample_frame();
        frame.kind = FrameKind::Response;
        frame.identity = None;
        frame.acbx.response = 3;
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &sample_frame()).unwrap();
        wire[5] = 9;
        assert!(matches!(
            read_frame(&mut wire.as_slice()),
            Err(Error::Protocol(ProtocolError::UnsupportedVersion(9)))
        ));
    }

    #[test]
    fn truncated_frame_rejected() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &sample_frame()).unwrap();
        let short = &wire[..wire.len() - 3];
        assert!(read_frame(&mut &short[..]).is_err());
    }

    #[test]
    fn bad_buffer_sizes_rejected() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &sample_frame()).unwrap();
        // First buffer's used field beyond its capacity.
        let used_off = FRAME_HEADER_LEN + 28 + ACBX_LENGTH + 4 + 8;
        wire[used_off..used_off + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(read_frame(&mut wire.as_slice()).is_err());
    }
}
