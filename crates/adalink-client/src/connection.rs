use std::sync::{Arc, Mutex};
use std::time::Duration;

use adalink_core::error::{ConfigError, Error};
use adalink_core::types::{Credentials, Fnr, Identity};
use adalink_wire::Transport;

use crate::cluster::{cluster_nodes, ClusterNode};
use crate::map::Map;
use crate::read::ReadRequest;
use crate::registry;
use crate::repository::MapRepository;
use crate::session::Session;
use crate::store::StoreRequest;
use crate::url::Url;

/// User-facing entry point: one session to the target, the map repository
/// behind the URL's `config` coordinates, and the per-connection credential
/// store. Typical use is one connection per worker thread.
pub struct Connection {
    url: Url,
    session: Session,
    repository: Option<Arc<MapRepository>>,
    credentials: Mutex<Vec<Credentials>>,
}

impl Connection {
    /// Open a connection described by a connection string, e.g.
    /// `acj;target=24` or `acj;map;config=[24,4]`.
    pub fn open(connection: &str) -> Result<Self, Error> {
        let url = Url::parse(connection)?;
        let identity = Identity::new(url.user.as_deref().unwrap_or("adalink"), &hostname());
        Self::with_identity(url, identity, None)
    }

    pub fn open_with_deadline(connection: &str, deadline: Duration) -> Result<Self, Error> {
        let url = Url::parse(connection)?;
        let identity = Identity::new(url.user.as_deref().unwrap_or("adalink"), &hostname());
        Self::with_identity(url, identity, Some(deadline))
    }

    pub fn with_identity(
        url: Url,
        identity: Identity,
        deadline: Option<Duration>,
    ) -> Result<Self, Error> {
        let session = Session::connect_with_deadline(&url, identity, deadline)?;
        Ok(Self::assemble(url, session))
    }

    /// Build a connection over an explicit transport; scripted transports
    /// in tests enter here.
    pub fn with_transport(url: Url, identity: Identity, transport: Transport) -> Self {
        let session = Session::with_transport(url.clone(), identity, transport);
        Self::assemble(url, session)
    }

    fn assemble(url: Url, session: Session) -> Self {
        let repository = url.config.map(|(dbid, fnr)| {
            let target = format!("{};target={}", url.driver, dbid);
            registry::add_repository(&target, fnr)
        });
        Connection {
            url,
            session,
            repository,
            credentials: Mutex::new(Vec::new()),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn repository(&self) -> Option<&Arc<MapRepository>> {
        self.repository.as_ref()
    }

    /// Open the underlying session explicitly. Requests also open lazily
    /// on their first call.
    pub fn open_session(&self) -> Result<(), Error> {
        self.session.open()
    }

    /// Direct read on a file, field names are Adabas short names.
    pub fn create_read_request(&self, fnr: Fnr) -> ReadRequest<'_> {
        ReadRequest::new(&self.session, fnr)
    }

    /// Map-backed read; the map is resolved through this connection's
    /// repository.
    pub fn create_map_read_request(&self, name: &str) -> Result<ReadRequest<'_>, Error> {
        let map = self.resolve_map(name)?;
        Ok(ReadRequest::with_map(&self.session, map))
    }

    pub fn create_store_request(&self, fnr: Fnr) -> StoreRequest<'_> {
        StoreRequest::new(&self.session, fnr)
    }

    pub fn create_map_store_request(&self, name: &str) -> Result<StoreRequest<'_>, Error> {
        let map = self.resolve_map(name)?;
        Ok(StoreRequest::with_map(&self.session, map))
    }

    fn resolve_map(&self, name: &str) -> Result<Arc<Map>, Error> {
        let repository = self
            .repository
            .as_ref()
            .ok_or_else(|| ConfigError::MalformedUrl {
                reason: "connection has no map repository (missing config=[dbid,fnr])"
                    .to_string(),
            })?;
        repository.search(&self.session, name)
    }

    /// Commit the open transaction on this connection's session.
    pub fn end_transaction(&self) -> Result<(), Error> {
        self.session.end_transaction()
    }

    /// Roll back the open transaction on this connection's session.
    pub fn backout_transaction(&self) -> Result<(), Error> {
        self.session.backout_transaction()
    }

    /// Cluster membership of the target, current node first.
    pub fn cluster_nodes(&self) -> Result<Vec<ClusterNode>, Error> {
        cluster_nodes(&self.session)
    }

    /// Attach credentials for the target. Replaces an earlier entry for
    /// the same user.
    pub fn add_credentials(&self, credentials: Credentials) {
        if let Ok(mut store) = self.credentials.lock() {
            store.retain(|c| c.user != credentials.user);
            store.push(credentials);
        }
    }

    pub fn remove_credentials(&self, user: &str) {
        if let Ok(mut store) = self.credentials.lock() {
            store.retain(|c| c.user != user);
        }
    }

    pub fn credentials_for(&self, user: &str) -> Option<Credentials> {
        self.credentials
            .lock()
            .ok()
            .and_then(|store| store.iter().find(|c| c.user == user).cloned())
    }

    /// Close the session: back out an open transaction, CL, drop the
    /// transport. Dropping the connection does the same.
    pub fn close(&self) -> Result<(), Error> {
        self.session.close()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("url", &self.url).finish()
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_store_replaces_by_user() {
        let url = Url::parse("acj;target=24").unwrap();
        let connection = Connection::with_transport(
            url,
            Identity::new("tester", "node1"),
            Transport::Mock(adalink_wire::MockTransport::new(|acbx, _| {
                acbx.response = 0;
                Ok(())
            })),
        );
        connection.add_credentials(Credentials::new("batch01", "first"));
        connection.add_credentials(Credentials::new("batch01", "second"));
        let stored = connection.credentials_for("batch01").unwrap();
        assert_eq!(stored.password, "second");
        connection.remove_credentials("batch01");
        assert!(connection.credentials_for("batch01").is_none());
    }
}
