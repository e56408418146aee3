//! Wire layer: typed call buffers, the ACBX control block and its fixed
//! byte layout, the length-framed network codec and the pluggable
//! transport back-ends.

pub mod acbx;
pub mod buffer;
pub mod frame;
pub mod transport;

pub use acbx::{Acbx, ACBX_LENGTH};
pub use buffer::{Buffer, BufferTag};
pub use frame::{read_frame, write_frame, Frame, FrameKind, FRAME_VERSION};
pub use transport::{
    configure_local_dbid, local_dbid_configured, remove_local_dbid, LocalServer, MockTransport,
    TcpLink, Transport,
};
