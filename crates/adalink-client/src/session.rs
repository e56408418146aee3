use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use adalink_core::error::{ConfigError, Error, StateError};
use adalink_core::types::{
    Command, Fnr, Identity, Isn, RETRY_RESPONSES, RSP_EOF, RSP_NORMAL,
};
use adalink_types::Fdt;
use adalink_wire::{Acbx, Buffer, BufferTag, Transport};

use crate::url::{Scheme, Url};

/// Outcome of one successful direct call: the response fields a request
/// needs to continue its loop. Response is always 0 or 3 here; anything
/// else surfaces as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallResult {
    pub response: u16,
    pub subcode: u16,
    pub isn: Isn,
    pub isn_lower: u64,
    pub isn_quantity: u64,
}

impl CallResult {
    pub fn is_eof(&self) -> bool {
        self.response == RSP_EOF
    }
}

struct Inner {
    transport: Transport,
    acbx: Acbx,
    opened: bool,
    closed: bool,
    in_transaction: bool,
    /// Command id of a read loop currently walking this session, used to
    /// reject interleaved updates on the same id.
    active_read_cid: Option<[u8; 4]>,
}

/// One database handle: a target URL, an identity, a transport and the
/// control block every call mutates. A session admits exactly one call at
/// a time; a second caller gets `StateError::SessionBusy` instead of
/// queueing behind unbounded I/O.
pub struct Session {
    url: Url,
    identity: Identity,
    inner: Mutex<Inner>,
    command_counter: AtomicU32,
}

impl Session {
    /// Build a session for the URL, selecting the transport from its
    /// scheme. TLS targets parse but cannot be served.
    pub fn connect(url: &Url, identity: Identity) -> Result<Self, Error> {
        Self::connect_with_deadline(url, identity, None)
    }

    pub fn connect_with_deadline(
        url: &Url,
        identity: Identity,
        deadline: Option<Duration>,
    ) -> Result<Self, Error> {
        let transport = match url.scheme {
            Scheme::SecureNetwork => return Err(ConfigError::TlsUnavailable.into()),
            Scheme::Network => match (&url.host, url.port) {
                (Some(host), Some(port)) => Transport::tcp(host, port, deadline),
                _ => {
                    return Err(ConfigError::MalformedUrl {
                        reason: "network target without host:port".to_string(),
                    }
                    .into())
                }
            },
            Scheme::Local | Scheme::MapPseudo => match (&url.host, url.port) {
                (Some(host), Some(port)) => Transport::tcp(host, port, deadline),
                _ => Transport::local(url.dbid)?,
            },
        };
        Ok(Self::with_transport(url.clone(), identity, transport))
    }

    /// Build a session over an explicit transport. Scripted transports in
    /// tests enter here.
    pub fn with_transport(url: Url, identity: Identity, transport: Transport) -> Self {
        let acbx = Acbx::new(url.dbid);
        Session {
            url,
            identity,
            inner: Mutex::new(Inner {
                transport,
                acbx,
                opened: false,
                closed: false,
                in_transaction: false,
                active_read_cid: None,
            }),
            command_counter: AtomicU32::new(1),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Next per-session command id. Read loops hold one id across their
    /// whole call sequence; stores allocate their own.
    pub fn allocate_command_id(&self) -> [u8; 4] {
        self.command_counter
            .fetch_add(1, Ordering::SeqCst)
            .to_le_bytes()
    }

    /// Issue OP once. Idempotent while the session stays open.
    pub fn open(&self) -> Result<(), Error> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(StateError::SessionClosed.into());
        }
        open_locked(&mut inner, &self.identity, &self.url)
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().map(|i| i.opened).unwrap_or(false)
    }

    /// Issue one direct call. `prep` stages the per-command control block
    /// fields (command id, ISN, options) on a freshly reset ACBX; identity
    /// and buffer lengths are stamped afterwards. Responses on the retry
    /// allow-list force one close/reopen/retry cycle.
    pub fn call(
        &self,
        command: Command,
        fnr: Fnr,
        buffers: &mut [Buffer],
        prep: impl Fn(&mut Acbx),
    ) -> Result<CallResult, Error> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(StateError::SessionClosed.into());
        }
        if !inner.opened && command != Command::Op && command != Command::Cl {
            open_locked(&mut inner, &self.identity, &self.url)?;
        }

        match issue(&mut inner, &self.identity, command, fnr, buffers, &prep) {
            Ok(result) => {
                self.finish(&mut inner, command);
                Ok(result)
            }
            Err(Error::Server(server)) if RETRY_RESPONSES.contains(&server.response) => {
                log::warn!(
                    "response {} on {}, resetting session to {}",
                    server.response,
                    command,
                    self.url.dbid
                );
                reopen_locked(&mut inner, &self.identity, &self.url)?;
                let result = issue(&mut inner, &self.identity, command, fnr, buffers, &prep)?;
                self.finish(&mut inner, command);
                Ok(result)
            }
            Err(other) => Err(other),
        }
    }

    fn finish(&self, inner: &mut Inner, command: Command) {
        if command.is_modify() {
            inner.in_transaction = true;
        }
        if command == Command::Et || command == Command::Bt {
            inner.in_transaction = false;
        }
    }

    /// Commit the open transaction of this session.
    pub fn end_transaction(&self) -> Result<(), Error> {
        self.call(Command::Et, Fnr(0), &mut [], |_| ())?;
        Ok(())
    }

    /// Roll back the open transaction of this session.
    pub fn backout_transaction(&self) -> Result<(), Error> {
        self.call(Command::Bt, Fnr(0), &mut [], |_| ())?;
        Ok(())
    }

    /// Release server-side resources held for a command id.
    pub fn release(&self, command_id: [u8; 4]) -> Result<(), Error> {
        self.call(Command::Rc, Fnr(0), &mut [], |acbx| {
            acbx.command_id = command_id;
        })?;
        Ok(())
    }

    /// Fetch and parse the field definition table of a file (LF with
    /// option 'X').
    pub fn read_file_definition(&self, fnr: Fnr) -> Result<Fdt, Error> {
        let mut buffers = vec![Buffer::with_capacity(BufferTag::Record, 8192)];
        self.call(Command::Lf, fnr, &mut buffers, |acbx| {
            acbx.set_option(0, b'X');
        })?;
        Ok(Fdt::from_lf_bytes(fnr, buffers[0].used_bytes())?)
    }

    /// Close the session: back out an open transaction, issue CL, drop the
    /// transport. Safe to call more than once.
    pub fn close(&self) -> Result<(), Error> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.closed {
            return Ok(());
        }
        if inner.opened {
            if inner.in_transaction {
                let _ = issue(
                    &mut inner,
                    &self.identity,
                    Command::Bt,
                    Fnr(0),
                    &mut [],
                    &|_| (),
                );
                inner.in_transaction = false;
            }
            let _ = issue(
                &mut inner,
                &self.identity,
                Command::Cl,
                Fnr(0),
                &mut [],
                &|_| (),
            );
            inner.opened = false;
        }
        inner.transport.close();
        inner.closed = true;
        log::debug!("session to {} closed", self.url.dbid);
        Ok(())
    }

    /// Mark a read loop as active so modify calls on the same command id
    /// are rejected until `end_read`.
    pub(crate) fn begin_read(&self, command_id: [u8; 4]) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.active_read_cid = Some(command_id);
        }
    }

    pub(crate) fn end_read(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.active_read_cid = None;
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, Error> {
        match self.inner.try_lock() {
            Ok(inner) => Ok(inner),
            Err(std::sync::TryLockError::WouldBlock) => Err(StateError::SessionBusy.into()),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("url", &self.url).finish()
    }
}

fn open_locked(inner: &mut Inner, identity: &Identity, url: &Url) -> Result<(), Error> {
    if inner.opened {
        return Ok(());
    }
    issue(inner, identity, Command::Op, Fnr(0), &mut [], &|acbx| {
        if let Some(user) = url.user.as_deref() {
            let bytes = user.as_bytes();
            let n = bytes.len().min(4);
            acbx.additions1[..n].copy_from_slice(&bytes[..n]);
        }
    })?;
    inner.opened = true;
    log::debug!("session to {} opened", url.dbid);
    Ok(())
}

fn reopen_locked(inner: &mut Inner, identity: &Identity, url: &Url) -> Result<(), Error> {
    let _ = issue(inner, identity, Command::Cl, Fnr(0), &mut [], &|_| ());
    inner.transport.close();
    inner.opened = false;
    open_locked(inner, identity, url)
}

/// One transport round trip: reset, prepare, stamp, send, interpret.
fn issue(
    inner: &mut Inner,
    identity: &Identity,
    command: Command,
    fnr: Fnr,
    buffers: &mut [Buffer],
    prep: &impl Fn(&mut Acbx),
) -> Result<CallResult, Error> {
    inner.acbx.reset_for(command, fnr);
    prep(&mut inner.acbx);
    if command.is_modify() {
        if let Some(read_cid) = inner.active_read_cid {
            if read_cid == inner.acbx.command_id {
                return Err(StateError::InterleavedUpdate.into());
            }
        }
    }
    inner.acbx.stamp_identity(identity);
    stamp_lengths(&mut inner.acbx, buffers);
    log::trace!("issuing {} against file {}", command, fnr);
    inner.transport.call(identity, &mut inner.acbx, buffers)?;
    if let Some(server) = inner.acbx.server_error() {
        return Err(server.into());
    }
    debug_assert!(inner.acbx.response == RSP_NORMAL || inner.acbx.response == RSP_EOF);
    Ok(CallResult {
        response: inner.acbx.response,
        subcode: inner.acbx.error_subcode,
        isn: inner.acbx.isn,
        isn_lower: inner.acbx.isn_lower,
        isn_quantity: inner.acbx.isn_quantity,
    })
}

/// The control block advertises buffer *capacities*, never used sizes.
fn stamp_lengths(acbx: &mut Acbx, buffers: &[Buffer]) {
    acbx.fb_len = 0;
    acbx.rb_len = 0;
    acbx.sb_len = 0;
    acbx.vb_len = 0;
    acbx.ib_len = 0;
    acbx.user_area_len = 0;
    for buffer in buffers {
        let capacity = buffer.capacity() as u64;
        match buffer.tag() {
            BufferTag::Format => acbx.fb_len = capacity,
            BufferTag::Record => acbx.rb_len = capacity,
            BufferTag::Search => acbx.sb_len = capacity,
            BufferTag::Value => acbx.vb_len = capacity,
            BufferTag::Isn => acbx.ib_len = capacity,
            BufferTag::Multifetch => acbx.user_area_len = capacity,
            BufferTag::UserInfo => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adalink_core::types::RSP_BAD_COMMAND_ID;
    use adalink_wire::MockTransport;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn mock_session(
        handler: impl FnMut(&mut Acbx, &mut [Buffer]) -> Result<(), Error> + Send + 'static,
    ) -> Session {
        let url = Url::parse("acj;target=24").unwrap();
        Session::with_transport(
            url,
            Identity::new("tester", "node1"),
            Transport::Mock(MockTransport::new(handler)),
        )
    }

    #[test]
    fn open_is_idempotent() {
        let opens = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&opens);
        let session = mock_session(move |acbx, _| {
            if acbx.command == Command::Op {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            acbx.response = 0;
            Ok(())
        });
        session.open().unwrap();
        session.open().unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_call_opens_implicitly() {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&commands);
        let session = mock_session(move |acbx, _| {
            seen.lock().unwrap().push(acbx.command);
            acbx.response = 0;
            Ok(())
        });
        session
            .call(Command::L2, Fnr(11), &mut [], |_| ())
            .unwrap();
        assert_eq!(*commands.lock().unwrap(), vec![Command::Op, Command::L2]);
    }

    #[test]
    fn retry_once_on_allow_listed_response() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        let session = mock_session(move |acbx, _| {
            acbx.response = 0;
            if acbx.command == Command::L1 {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                acbx.response = if n == 0 { RSP_BAD_COMMAND_ID } else { 0 };
                acbx.isn = Isn(7);
            }
            Ok(())
        });
        let result = session
            .call(Command::L1, Fnr(11), &mut [], |_| ())
            .unwrap();
        assert_eq!(result.isn, Isn(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn persistent_server_error_surfaces() {
        let session = mock_session(|acbx, _| {
            acbx.response = if acbx.command == Command::L1 { 17 } else { 0 };
            acbx.error_subcode = 4;
            Ok(())
        });
        let err = session
            .call(Command::L1, Fnr(11), &mut [], |_| ())
            .unwrap_err();
        assert_eq!(err.response_code(), Some(17));
    }

    #[test]
    fn closed_session_rejects_calls() {
        let session = mock_session(|acbx, _| {
            acbx.response = 0;
            Ok(())
        });
        session.open().unwrap();
        session.close().unwrap();
        session.close().unwrap();
        assert!(matches!(
            session.call(Command::L2, Fnr(11), &mut [], |_| ()),
            Err(Error::State(StateError::SessionClosed))
        ));
    }

    #[test]
    fn buffer_lengths_hold_capacities() {
        let session = mock_session(|acbx, _| {
            if acbx.command == Command::L1 {
                assert_eq!(acbx.fb_len, 7);
                assert_eq!(acbx.rb_len, 128);
            }
            acbx.response = 0;
            Ok(())
        });
        let mut fb = Buffer::new(BufferTag::Format);
        fb.write_string("AA,8,A.").unwrap();
        let mut buffers = vec![fb, Buffer::with_capacity(BufferTag::Record, 128)];
        session
            .call(Command::L1, Fnr(11), &mut buffers, |_| ())
            .unwrap();
    }

    #[test]
    fn interleaved_update_on_read_cid_rejected() {
        let session = mock_session(|acbx, _| {
            acbx.response = 0;
            Ok(())
        });
        session.open().unwrap();
        let cid = session.allocate_command_id();
        session.begin_read(cid);
        let err = session
            .call(Command::A1, Fnr(11), &mut [], |acbx| acbx.command_id = cid)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::State(StateError::InterleavedUpdate)
        ));
        session.end_read();
        session
            .call(Command::A1, Fnr(11), &mut [], |acbx| acbx.command_id = cid)
            .unwrap();
    }
}
