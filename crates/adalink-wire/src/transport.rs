use std::collections::HashMap;
use std::io::BufWriter;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use adalink_core::error::{ConfigError, Error, ProtocolError};
use adalink_core::types::{Dbid, Identity};

use crate::acbx::Acbx;
use crate::buffer::Buffer;
use crate::frame::{read_frame, write_frame, Frame, FrameKind};

/// An in-process database engine reachable without a socket. The driver
/// hands it the control block and buffer set and expects both mutated in
/// place, exactly as a remote server would return them.
pub trait LocalServer: Send {
    fn call(&mut self, acbx: &mut Acbx, buffers: &mut [Buffer]) -> Result<(), Error>;
}

type LocalFactory = Arc<dyn Fn() -> Box<dyn LocalServer> + Send + Sync>;

fn local_table() -> &'static Mutex<HashMap<u32, LocalFactory>> {
    static TABLE: OnceLock<Mutex<HashMap<u32, LocalFactory>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register an in-process server for a database id. Later registrations
/// replace earlier ones.
pub fn configure_local_dbid<F>(dbid: Dbid, factory: F)
where
    F: Fn() -> Box<dyn LocalServer> + Send + Sync + 'static,
{
    if let Ok(mut table) = local_table().lock() {
        table.insert(dbid.0, Arc::new(factory));
    }
}

pub fn local_dbid_configured(dbid: Dbid) -> bool {
    local_table()
        .lock()
        .map(|table| table.contains_key(&dbid.0))
        .unwrap_or(false)
}

pub fn remove_local_dbid(dbid: Dbid) {
    if let Ok(mut table) = local_table().lock() {
        table.remove(&dbid.0);
    }
}

/// One database link. Every session owns exactly one transport, so calls
/// through it are naturally serialised by the session lock above it.
pub enum Transport {
    Local(Box<dyn LocalServer>),
    Tcp(TcpLink),
    Mock(MockTransport),
}

impl Transport {
    /// Resolve a locally registered database id into a transport.
    pub fn local(dbid: Dbid) -> Result<Self, Error> {
        let factory = local_table()
            .lock()
            .ok()
            .and_then(|table| table.get(&dbid.0).cloned())
            .ok_or(ConfigError::LocalNotConfigured { dbid: dbid.0 })?;
        Ok(Transport::Local(factory()))
    }

    pub fn tcp(host: &str, port: u16, deadline: Option<Duration>) -> Self {
        Transport::Tcp(TcpLink::new(host, port, deadline))
    }

    /// Issue one direct call. The control block and every buffer are
    /// updated in place with the server's reply.
    pub fn call(
        &mut self,
        identity: &Identity,
        acbx: &mut Acbx,
        buffers: &mut [Buffer],
    ) -> Result<(), Error> {
        match self {
            Transport::Local(server) => server.call(acbx, buffers),
            Transport::Tcp(link) => link.call(identity, acbx, buffers),
            Transport::Mock(mock) => mock.call(acbx, buffers),
        }
    }

    /// Tear down any underlying connection. Safe to call more than once.
    pub fn close(&mut self) {
        if let Transport::Tcp(link) = self {
            link.close();
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Local(_) => f.write_str("Transport::Local"),
            Transport::Tcp(link) => write!(f, "Transport::Tcp({}:{})", link.host, link.port),
            Transport::Mock(_) => f.write_str("Transport::Mock"),
        }
    }
}

/// A framed TCP connection to a remote database. The stream is opened on
/// first use and re-opened after `close`.
pub struct TcpLink {
    host: String,
    port: u16,
    deadline: Option<Duration>,
    stream: Option<TcpStream>,
}

impl TcpLink {
    pub fn new(host: &str, port: u16, deadline: Option<Duration>) -> Self {
        TcpLink {
            host: host.to_string(),
            port,
            deadline,
            stream: None,
        }
    }

    fn connect(&mut self) -> Result<&mut TcpStream, Error> {
        if self.stream.is_none() {
            let addr = (self.host.as_str(), self.port);
            let stream = match self.deadline {
                Some(limit) => {
                    let resolved = addr.to_socket_addrs()?.next().ok_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "host did not resolve",
                        )
                    })?;
                    TcpStream::connect_timeout(&resolved, limit)?
                }
                None => TcpStream::connect(addr)?,
            };
            stream.set_read_timeout(self.deadline)?;
            stream.set_write_timeout(self.deadline)?;
            stream.set_nodelay(true)?;
            log::debug!("connected to {}:{}", self.host, self.port);
            self.stream = Some(stream);
        }
        // Just inserted above when absent.
        self.stream.as_mut().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection unavailable",
            ))
        })
    }

    fn call(
        &mut self,
        identity: &Identity,
        acbx: &mut Acbx,
        buffers: &mut [Buffer],
    ) -> Result<(), Error> {
        let (host, port) = (self.host.clone(), self.port);
        let stream = self.connect()?;
        let request = Frame::request(*identity, acbx.clone(), buffers.to_vec());
        {
            let mut writer = BufWriter::new(&mut *stream);
            write_frame(&mut writer, &request)?;
        }

        // Unsolicited event frames may precede the reply.
        let reply = loop {
            let frame = read_frame(stream)?;
            match frame.kind {
                FrameKind::Response => break frame,
                FrameKind::Event => {
                    log::debug!("discarding event frame from {}:{}", host, port);
                }
                FrameKind::Request => {
                    return Err(ProtocolError::UnexpectedFrameType(0).into());
                }
            }
        };

        if reply.buffers.len() != buffers.len() {
            return Err(ProtocolError::BufferCountMismatch {
                sent: buffers.len(),
                received: reply.buffers.len(),
            }
            .into());
        }
        *acbx = reply.acbx;
        for (ours, theirs) in buffers.iter_mut().zip(reply.buffers.iter()) {
            if ours.tag() != theirs.tag() {
                return Err(ProtocolError::InvalidBufferTag(theirs.tag().letter()).into());
            }
            ours.set_received(theirs.used_bytes())?;
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            log::debug!("closed connection to {}:{}", self.host, self.port);
        }
    }
}

type MockHandler = Box<dyn FnMut(&mut Acbx, &mut [Buffer]) -> Result<(), Error> + Send>;

/// A scripted transport for driver tests. Rejects re-entrant calls, which
/// would indicate two threads slipping past the session lock.
pub struct MockTransport {
    handler: MockHandler,
    in_call: AtomicBool,
    calls: AtomicU64,
}

impl MockTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: FnMut(&mut Acbx, &mut [Buffer]) -> Result<(), Error> + Send + 'static,
    {
        MockTransport {
            handler: Box::new(handler),
            in_call: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn call(&mut self, acbx: &mut Acbx, buffers: &mut [Buffer]) -> Result<(), Error> {
        if self.in_call.swap(true, Ordering::SeqCst) {
            return Err(adalink_core::error::StateError::SessionBusy.into());
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = (self.handler)(acbx, buffers);
        self.in_call.store(false, Ordering::SeqCst);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferTag;
    use adalink_core::types::{Command, Fnr, Isn};
    use std::net::TcpListener;
    use std::thread;

    struct EchoServer;

    impl LocalServer for EchoServer {
        fn call(&mut self, acbx: &mut Acbx, buffers: &mut [Buffer]) -> Result<(), Error> {
            acbx.response = 0;
            for buffer in buffers.iter_mut() {
                if buffer.tag() == BufferTag::Record {
                    buffer.set_received(b"echo")?;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn local_registry_round_trip() {
        let dbid = Dbid(9901);
        assert!(!local_dbid_configured(dbid));
        configure_local_dbid(dbid, || Box::new(EchoServer));
        assert!(local_dbid_configured(dbid));

        let mut transport = Transport::local(dbid).unwrap();
        let mut acbx = Acbx::new(dbid);
        acbx.reset_for(Command::L1, Fnr(1));
        let mut buffers = vec![Buffer::with_capacity(BufferTag::Record, 16)];
        transport
            .call(&Identity::new("t", "n"), &mut acbx, &mut buffers)
            .unwrap();
        assert_eq!(buffers[0].used_bytes(), b"echo");

        remove_local_dbid(dbid);
        assert!(!local_dbid_configured(dbid));
        assert!(matches!(
            Transport::local(dbid),
            Err(Error::Config(ConfigError::LocalNotConfigured { dbid: 9901 }))
        ));
    }

    #[test]
    fn mock_counts_calls() {
        let mut transport = Transport::Mock(MockTransport::new(|acbx, _| {
            acbx.response = 0;
            Ok(())
        }));
        let mut acbx = Acbx::new(Dbid(1));
        let id = Identity::new("t", "n");
        transport.call(&id, &mut acbx, &mut []).unwrap();
        transport.call(&id, &mut acbx, &mut []).unwrap();
        if let Transport::Mock(mock) = &transport {
            assert_eq!(mock.call_count(), 2);
        }
    }

    #[test]
    fn tcp_call_round_trips_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let request = read_frame(&mut socket).unwrap();
            assert_eq!(request.kind, FrameKind::Request);
            let mut acbx = request.acbx;
            acbx.response = 0;
            acbx.isn = Isn(42);
            let mut buffers = request.buffers;
            for buffer in buffers.iter_mut() {
                if buffer.tag() == BufferTag::Record {
                    buffer.set_received(b"from server").unwrap();
                }
            }
            write_frame(&mut socket, &Frame::response(acbx, buffers)).unwrap();
        });

        let mut transport =
            Transport::tcp("127.0.0.1", port, Some(Duration::from_secs(5)));
        let mut acbx = Acbx::new(Dbid(24));
        acbx.reset_for(Command::L1, Fnr(11));
        let mut buffers = vec![
            Buffer::new(BufferTag::Format),
            Buffer::with_capacity(BufferTag::Record, 32),
        ];
        buffers[0].write_string("AA,8,A.").unwrap();
        transport
            .call(&Identity::new("tester", "node1"), &mut acbx, &mut buffers)
            .unwrap();
        assert_eq!(acbx.isn, Isn(42));
        assert_eq!(buffers[1].used_bytes(), b"from server");

        transport.close();
        transport.close();
        server.join().unwrap();
    }
}
