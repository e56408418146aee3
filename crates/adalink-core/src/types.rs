use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Database identifier of an Adabas target.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Dbid(pub u32);

impl Dbid {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Dbid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File number within a database.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Fnr(pub u32);

impl Fnr {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Fnr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Internal Sequence Number, the physical identifier of a record.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Isn(pub u64);

impl Isn {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Isn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Two-letter Adabas direct-call command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Open a user session.
    Op,
    /// Close a user session.
    Cl,
    /// Read record by ISN or continue an ISN-list sequence.
    L1,
    /// Read in physical sequence.
    L2,
    /// Read in logical sequence by descriptor.
    L3,
    /// Histogram read over a descriptor.
    L9,
    /// Read the field definition table of a file.
    Lf,
    /// Find records by search expression.
    S1,
    /// Store a new record, ISN assigned by the server.
    N1,
    /// Store a new record under a caller-chosen ISN.
    N2,
    /// Update a held record.
    A1,
    /// Delete a record.
    E1,
    /// End transaction.
    Et,
    /// Backout transaction.
    Bt,
    /// Release command id resources.
    Rc,
    /// Management call (cluster coordinator query).
    Mc,
}

impl Command {
    /// Two-byte code as it is placed into the control block.
    pub fn code(self) -> [u8; 2] {
        match self {
            Command::Op => *b"OP",
            Command::Cl => *b"CL",
            Command::L1 => *b"L1",
            Command::L2 => *b"L2",
            Command::L3 => *b"L3",
            Command::L9 => *b"L9",
            Command::Lf => *b"LF",
            Command::S1 => *b"S1",
            Command::N1 => *b"N1",
            Command::N2 => *b"N2",
            Command::A1 => *b"A1",
            Command::E1 => *b"E1",
            Command::Et => *b"ET",
            Command::Bt => *b"BT",
            Command::Rc => *b"RC",
            Command::Mc => *b"MC",
        }
    }

    pub fn from_code(code: [u8; 2]) -> Option<Self> {
        Some(match &code {
            b"OP" => Command::Op,
            b"CL" => Command::Cl,
            b"L1" => Command::L1,
            b"L2" => Command::L2,
            b"L3" => Command::L3,
            b"L9" => Command::L9,
            b"LF" => Command::Lf,
            b"S1" => Command::S1,
            b"N1" => Command::N1,
            b"N2" => Command::N2,
            b"A1" => Command::A1,
            b"E1" => Command::E1,
            b"ET" => Command::Et,
            b"BT" => Command::Bt,
            b"RC" => Command::Rc,
            b"MC" => Command::Mc,
            _ => return None,
        })
    }

    /// True for commands that modify data and therefore require a held
    /// transaction context.
    pub fn is_modify(self) -> bool {
        matches!(
            self,
            Command::N1 | Command::N2 | Command::A1 | Command::E1
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.code();
        write!(f, "{}{}", code[0] as char, code[1] as char)
    }
}

/// Successful completion.
pub const RSP_NORMAL: u16 = 0;
/// End of a read sequence.
pub const RSP_EOF: u16 = 3;
/// Transaction backed out by the server (time limit).
pub const RSP_TXN_ABORTED: u16 = 9;
/// Invalid or timed-out command id.
pub const RSP_BAD_COMMAND_ID: u16 = 17;
/// ISN held by another user.
pub const RSP_ISN_HELD: u16 = 145;
/// Database not active or not reachable.
pub const RSP_NOT_ACTIVE: u16 = 148;

/// Response codes on which a session is reset (close, reopen) and the
/// failing call retried exactly once.
pub const RETRY_RESPONSES: [u16; 4] = [
    RSP_TXN_ABORTED,
    RSP_BAD_COMMAND_ID,
    RSP_ISN_HELD,
    RSP_NOT_ACTIVE,
];

/// Caller identity stamped into the control block on every call.
///
/// Two identities are equal iff all four components match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user: [u8; 8],
    pub node: [u8; 8],
    pub pid: u32,
    pub timestamp: u64,
}

impl Identity {
    /// Build an identity for the current process. `user` and `node` are
    /// blank-padded or truncated to eight bytes.
    pub fn new(user: &str, node: &str) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Identity {
            user: pad8(user),
            node: pad8(node),
            pid: std::process::id(),
            timestamp,
        }
    }

    pub fn user_str(&self) -> String {
        trim8(&self.user)
    }

    pub fn node_str(&self) -> String {
        trim8(&self.node)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}-{}",
            self.user_str(),
            self.node_str(),
            self.pid,
            self.timestamp
        )
    }
}

fn pad8(s: &str) -> [u8; 8] {
    let mut out = [b' '; 8];
    for (i, b) in s.bytes().take(8).enumerate() {
        out[i] = b;
    }
    out
}

fn trim8(b: &[u8; 8]) -> String {
    String::from_utf8_lossy(b).trim_end().to_string()
}

/// A (user, password) pair bound to one target. Mutable only through the
/// credential store of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            user: user.into(),
            password: password.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_round_trip() {
        for cmd in [
            Command::Op,
            Command::Cl,
            Command::L1,
            Command::L2,
            Command::L3,
            Command::L9,
            Command::Lf,
            Command::S1,
            Command::N1,
            Command::N2,
            Command::A1,
            Command::E1,
            Command::Et,
            Command::Bt,
            Command::Rc,
            Command::Mc,
        ] {
            assert_eq!(Command::from_code(cmd.code()), Some(cmd));
        }
        assert_eq!(Command::from_code(*b"XX"), None);
    }

    #[test]
    fn identity_equality_over_all_components() {
        let a = Identity {
            user: pad8("tkn"),
            node: pad8("host1"),
            pid: 7,
            timestamp: 42,
        };
        let mut b = a;
        assert_eq!(a, b);
        b.timestamp = 43;
        assert_ne!(a, b);
    }

    #[test]
    fn identity_pads_and_truncates_names() {
        let id = Identity::new("averylonguser", "n");
        assert_eq!(id.user_str(), "averylon");
        assert_eq!(id.node_str(), "n");
    }
}
