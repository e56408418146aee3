//! Record-oriented Adabas client: connection strings, sessions with the
//! direct-call loop and retry policy, read/store requests with multifetch
//! and streaming, maps and their repository, the tag-driven record binding
//! and the cluster view.
//!
//! ```no_run
//! use adalink_client::Connection;
//! use adalink_core::types::Fnr;
//!
//! # fn main() -> Result<(), adalink_core::error::Error> {
//! let connection = Connection::open("acj;target=24")?;
//! let mut request = connection.create_read_request(Fnr(11));
//! request.query_fields("AA,AC,AE")?;
//! let response = request.read_logical_with("AE='SMITH'")?;
//! for record in &response.records {
//!     println!("{} {:?}", record.isn, record.value("AA"));
//! }
//! # Ok(())
//! # }
//! ```

pub mod binding;
pub mod cluster;
pub mod connection;
pub mod map;
pub mod read;
pub mod registry;
pub mod repository;
pub mod response;
pub mod session;
pub mod store;
pub mod url;

pub use binding::{FieldKind, TagSpec, TypeField, TypeInfo};
pub use cluster::{ClusterNode, NodeState};
pub use connection::Connection;
pub use map::{Map, MapField};
pub use read::{Cursor, ReadRequest};
pub use registry::{
    add_repository, list_repositories, remove_repository, repository, reset_repositories,
};
pub use repository::MapRepository;
pub use response::{Record, RecordValue, Response};
pub use session::{CallResult, Session};
pub use store::StoreRequest;
pub use url::{Scheme, Url};
