use adalink_core::error::{Error, ProtocolError};
use adalink_core::types::{Command, Fnr};
use adalink_wire::{Buffer, BufferTag};

use crate::session::Session;

/// Node states as reported by the cluster coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Active,
    Standby,
    Down,
    Unknown(u8),
}

impl NodeState {
    fn from_byte(b: u8) -> Self {
        match b {
            0 => NodeState::Active,
            1 => NodeState::Standby,
            2 => NodeState::Down,
            other => NodeState::Unknown(other),
        }
    }
}

/// One cluster member. The first entry of the coordinator's reply is the
/// node this session talks to; the rest are failover candidates the caller
/// may reconnect to by URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: u32,
    pub host: String,
    pub port: u16,
    pub state: NodeState,
}

/// Query the coordinator (MC) for the cluster membership, in priority
/// order. Failover itself is left to the caller.
pub fn cluster_nodes(session: &Session) -> Result<Vec<ClusterNode>, Error> {
    let mut buffers = vec![Buffer::with_capacity(BufferTag::Record, 4096)];
    let cid = session.allocate_command_id();
    session.call(Command::Mc, Fnr(0), &mut buffers, |acbx| {
        acbx.command_id = cid;
    })?;
    parse_nodes(buffers[0].used_bytes())
}

/// Reply layout: u32 node count, then per node
/// { id u32, port u16, state u8, host length u8, host bytes }.
pub(crate) fn parse_nodes(bytes: &[u8]) -> Result<Vec<ClusterNode>, Error> {
    if bytes.len() < 4 {
        return Err(ProtocolError::Truncated {
            at: bytes.len(),
            needed: 4,
        }
        .into());
    }
    let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let mut at = 4usize;
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        if at + 8 > bytes.len() {
            return Err(ProtocolError::Truncated { at, needed: 8 }.into());
        }
        let id = u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let port = u16::from_le_bytes([bytes[at + 4], bytes[at + 5]]);
        let state = NodeState::from_byte(bytes[at + 6]);
        let host_len = bytes[at + 7] as usize;
        at += 8;
        if at + host_len > bytes.len() {
            return Err(ProtocolError::Truncated {
                at,
                needed: host_len,
            }
            .into());
        }
        let host = String::from_utf8_lossy(&bytes[at..at + host_len]).to_string();
        at += host_len;
        nodes.push(ClusterNode {
            id,
            host,
            port,
            state,
        });
    }
    Ok(nodes)
}

/// Serialise a membership list into the reply layout. Scripted servers in
/// tests build their MC replies with this.
pub fn encode_nodes(nodes: &[ClusterNode]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + nodes.len() * 16);
    out.extend_from_slice(&(nodes.len() as u32).to_le_bytes());
    for node in nodes {
        out.extend_from_slice(&node.id.to_le_bytes());
        out.extend_from_slice(&node.port.to_le_bytes());
        out.push(match node.state {
            NodeState::Active => 0,
            NodeState::Standby => 1,
            NodeState::Down => 2,
            NodeState::Unknown(b) => b,
        });
        out.push(node.host.len() as u8);
        out.extend_from_slice(node.host.as_bytes());
    }
    out
}
