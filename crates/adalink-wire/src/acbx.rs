use adalink_core::error::{ProtocolError, ServerError};
use adalink_core::types::{Command, Dbid, Fnr, Identity, Isn};

/// Serialised size of the control block.
pub const ACBX_LENGTH: usize = 192;

const ACBX_TYPE: u8 = 0x30;
const ACBX_VERSION: [u8; 2] = *b"F2";

/// The extended Adabas control block: the fixed-layout request/response
/// descriptor of every direct call. Integers are serialised with explicit
/// widths; little-endian unless the session was constructed big-endian.
///
/// The buffer length fields hold the *capacity* of the paired buffer, not
/// its used size; the session stamps them immediately before each call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acbx {
    pub command: Command,
    pub command_id: [u8; 4],
    pub dbid: Dbid,
    pub fnr: Fnr,
    pub response: u16,
    pub isn: Isn,
    pub isn_lower: u64,
    pub isn_quantity: u64,
    pub command_options: [u8; 8],
    pub additions1: [u8; 4],
    pub additions2: [u8; 4],
    pub fb_len: u64,
    pub rb_len: u64,
    pub sb_len: u64,
    pub vb_len: u64,
    pub ib_len: u64,
    pub user_area_len: u64,
    pub error_offset: u64,
    pub error_subcode: u16,
    pub error_char: [u8; 2],
    pub status_quantity: u32,
    pub user_info: [u8; 16],
}

impl Default for Acbx {
    fn default() -> Self {
        Acbx {
            command: Command::Op,
            command_id: [0; 4],
            dbid: Dbid(0),
            fnr: Fnr(0),
            response: 0,
            isn: Isn(0),
            isn_lower: 0,
            isn_quantity: 0,
            command_options: [b' '; 8],
            additions1: [0; 4],
            additions2: [0; 4],
            fb_len: 0,
            rb_len: 0,
            sb_len: 0,
            vb_len: 0,
            ib_len: 0,
            user_area_len: 0,
            error_offset: 0,
            error_subcode: 0,
            error_char: [0; 2],
            status_quantity: 0,
            user_info: [0; 16],
        }
    }
}

impl Acbx {
    pub fn new(dbid: Dbid) -> Self {
        Acbx {
            dbid,
            ..Acbx::default()
        }
    }

    /// Prepare for the next command: response state and per-call fields are
    /// cleared, identification and command id survive.
    pub fn reset_for(&mut self, command: Command, fnr: Fnr) {
        self.command = command;
        self.fnr = fnr;
        self.response = 0;
        self.error_offset = 0;
        self.error_subcode = 0;
        self.error_char = [0; 2];
        self.status_quantity = 0;
        self.command_options = [b' '; 8];
        self.additions1 = [0; 4];
        self.additions2 = [0; 4];
        self.isn = Isn(0);
        self.isn_lower = 0;
        self.isn_quantity = 0;
    }

    /// Stamp the caller identity into the user-info area. The area holds
    /// user and node only; pid and timestamp travel in the frame header.
    pub fn stamp_identity(&mut self, id: &Identity) {
        self.user_info[..8].copy_from_slice(&id.user);
        self.user_info[8..16].copy_from_slice(&id.node);
    }

    pub fn set_option(&mut self, slot: usize, option: u8) {
        if slot < self.command_options.len() {
            self.command_options[slot] = option;
        }
    }

    /// The error as seen by the server, when the response is neither
    /// success nor EOF.
    pub fn server_error(&self) -> Option<ServerError> {
        match self.response {
            0 | 3 => None,
            rsp => Some(ServerError {
                command: self.command,
                response: rsp,
                subcode: self.error_subcode,
            }),
        }
    }

    pub fn to_bytes(&self) -> [u8; ACBX_LENGTH] {
        self.to_bytes_order(false)
    }

    pub fn to_bytes_order(&self, big_endian: bool) -> [u8; ACBX_LENGTH] {
        let mut b = [0u8; ACBX_LENGTH];
        b[0] = ACBX_TYPE;
        b[2..4].copy_from_slice(&ACBX_VERSION);
        put_u16(&mut b, 4, ACBX_LENGTH as u16, big_endian);
        b[6..8].copy_from_slice(&self.command.code());
        put_u16(&mut b, 10, self.response, big_endian);
        b[12..16].copy_from_slice(&self.command_id);
        put_u32(&mut b, 16, self.dbid.0, big_endian);
        put_u32(&mut b, 20, self.fnr.0, big_endian);
        put_u64(&mut b, 24, self.isn.0, big_endian);
        put_u64(&mut b, 32, self.isn_lower, big_endian);
        put_u64(&mut b, 40, self.isn_quantity, big_endian);
        b[48..56].copy_from_slice(&self.command_options);
        b[56..60].copy_from_slice(&self.additions1);
        b[60..64].copy_from_slice(&self.additions2);
        put_u64(&mut b, 64, self.fb_len, big_endian);
        put_u64(&mut b, 72, self.rb_len, big_endian);
        put_u64(&mut b, 80, self.sb_len, big_endian);
        put_u64(&mut b, 88, self.vb_len, big_endian);
        put_u64(&mut b, 96, self.ib_len, big_endian);
        put_u64(&mut b, 104, self.user_area_len, big_endian);
        put_u64(&mut b, 112, self.error_offset, big_endian);
        put_u16(&mut b, 120, self.error_subcode, big_endian);
        b[122..124].copy_from_slice(&self.error_char);
        put_u32(&mut b, 124, self.status_quantity, big_endian);
        b[128..144].copy_from_slice(&self.user_info);
        b
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_bytes_order(bytes, false)
    }

    pub fn from_bytes_order(bytes: &[u8], big_endian: bool) -> Result<Self, ProtocolError> {
        if bytes.len() < ACBX_LENGTH {
            return Err(ProtocolError::Truncated {
                at: bytes.len(),
                needed: ACBX_LENGTH,
            });
        }
        if bytes[0] != ACBX_TYPE || bytes[2..4] != ACBX_VERSION {
            return Err(ProtocolError::InvalidValue {
                field: "Acbx.version",
                reason: "unknown control block type or version",
            });
        }
        let declared = read_u16(bytes, 4, big_endian) as usize;
        if declared != ACBX_LENGTH {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: ACBX_LENGTH,
            });
        }
        let command = Command::from_code([bytes[6], bytes[7]]).ok_or(
            ProtocolError::InvalidValue {
                field: "Acbx.command",
                reason: "unknown command code",
            },
        )?;
        let mut acbx = Acbx {
            command,
            response: read_u16(bytes, 10, big_endian),
            dbid: Dbid(read_u32(bytes, 16, big_endian)),
            fnr: Fnr(read_u32(bytes, 20, big_endian)),
            isn: Isn(read_u64(bytes, 24, big_endian)),
            isn_lower: read_u64(bytes, 32, big_endian),
            isn_quantity: read_u64(bytes, 40, big_endian),
            fb_len: read_u64(bytes, 64, big_endian),
            rb_len: read_u64(bytes, 72, big_endian),
            sb_len: read_u64(bytes, 80, big_endian),
            vb_len: read_u64(bytes, 88, big_endian),
            ib_len: read_u64(bytes, 96, big_endian),
            user_area_len: read_u64(bytes, 104, big_endian),
            error_offset: read_u64(bytes, 112, big_endian),
            error_subcode: read_u16(bytes, 120, big_endian),
            status_quantity: read_u32(bytes, 124, big_endian),
            ..Acbx::default()
        };
        acbx.command_id.copy_from_slice(&bytes[12..16]);
        acbx.command_options.copy_from_slice(&bytes[48..56]);
        acbx.additions1.copy_from_slice(&bytes[56..60]);
        acbx.additions2.copy_from_slice(&bytes[60..64]);
        acbx.error_char.copy_from_slice(&bytes[122..124]);
        acbx.user_info.copy_from_slice(&bytes[128..144]);
        Ok(acbx)
    }
}

fn put_u16(b: &mut [u8], off: usize, v: u16, big: bool) {
    let bytes = if big { v.to_be_bytes() } else { v.to_le_bytes() };
    b[off..off + 2].copy_from_slice(&bytes);
}

fn put_u32(b: &mut [u8], off: usize, v: u32, big: bool) {
    let bytes = if big { v.to_be_bytes() } else { v.to_le_bytes() };
    b[off..off + 4].copy_from_slice(&bytes);
}

fn put_u64(b: &mut [u8], off: usize, v: u64, big: bool) {
    let bytes = if big { v.to_be_bytes() } else { v.to_le_bytes() };
    b[off..off + 8].copy_from_slice(&bytes);
}

fn read_u16(b: &[u8], off: usize, big: bool) -> u16 {
    let mut a = [0u8; 2];
    a.copy_from_slice(&b[off..off + 2]);
    if big {
        u16::from_be_bytes(a)
    } else {
        u16::from_le_bytes(a)
    }
}

fn read_u32(b: &[u8], off: usize, big: bool) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[off..off + 4]);
    if big {
        u32::from_be_bytes(a)
    } else {
        u32::from_le_bytes(a)
    }
}

fn read_u64(b: &[u8], off: usize, big: bool) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[off..off + 8]);
    if big {
        u64::from_be_bytes(a)
    } else {
        u64::from_le_bytes(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Acbx {
        let mut acbx = Acbx::new(Dbid(24));
        acbx.reset_for(Command::L3, Fnr(11));
        acbx.command_id = *b"RD01";
        acbx.isn = Isn(12345);
        acbx.isn_quantity = 2;
        acbx.fb_len = 128;
        acbx.rb_len = 1024;
        acbx.set_option(0, b'M');
        acbx
    }

    #[test]
    fn identity_stamp_carries_user_and_node() {
        let mut acbx = sample();
        let id = Identity::new("jtester", "workst04");
        acbx.stamp_identity(&id);
        assert_eq!(&acbx.user_info[..8], b"jtester ");
        assert_eq!(&acbx.user_info[8..16], b"workst04");
    }

    #[test]
    fn round_trips_little_endian() {
        let acbx = sample();
        let bytes = acbx.to_bytes();
        assert_eq!(bytes.len(), ACBX_LENGTH);
        let parsed = Acbx::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, acbx);
    }

    #[test]
    fn round_trips_big_endian() {
        let acbx = sample();
        let bytes = acbx.to_bytes_order(true);
        let parsed = Acbx::from_bytes_order(&bytes, true).unwrap();
        assert_eq!(parsed, acbx);
        // Mixed orders must not silently agree.
        assert!(Acbx::from_bytes(&bytes).is_err() || Acbx::from_bytes(&bytes).unwrap() != acbx);
    }

    #[test]
    fn rejects_truncation_and_bad_version() {
        let acbx = sample();
        let bytes = acbx.to_bytes();
        assert!(Acbx::from_bytes(&bytes[..100]).is_err());
        let mut bad = bytes;
        bad[2] = b'X';
        assert!(Acbx::from_bytes(&bad).is_err());
    }

    #[test]
    fn reset_clears_response_state_keeps_id() {
        let mut acbx = sample();
        acbx.response = 148;
        acbx.error_subcode = 7;
        acbx.reset_for(Command::L1, Fnr(11));
        assert_eq!(acbx.response, 0);
        assert_eq!(acbx.error_subcode, 0);
        assert_eq!(acbx.command_id, *b"RD01");
        assert_eq!(acbx.command, Command::L1);
    }

    #[test]
    fn server_error_skips_success_and_eof() {
        let mut acbx = sample();
        acbx.response = 0;
        assert!(acbx.server_error().is_none());
        acbx.response = 3;
        assert!(acbx.server_error().is_none());
        acbx.response = 17;
        acbx.error_subcode = 2;
        let err = acbx.server_error().unwrap();
        assert_eq!(err.response, 17);
        assert_eq!(err.subcode, 2);
    }
}
