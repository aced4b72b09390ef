//! Client and client group records.
//!
//! Every client that ever opened a store has a record in the client map,
//! kept as a single chunk under [`CLIENTS_HEAD_NAME`]. Clients of the newer
//! format belong to a client group; groups share a commit chain and are kept
//! under [`CLIENT_GROUPS_HEAD_NAME`]. Both maps ref the heads they point at,
//! so a recorded head stays alive after the client that wrote it is gone.

use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};

use crate::{dag::DagError, db::DbError, sync::SyncError};

mod client_groups;
mod clients;

pub use self::{
    client_groups::{
        CLIENT_GROUPS_HEAD_NAME, ClientGroup, ClientGroupMap, disable_client_group,
        get_client_group, get_client_group_for_client, get_client_groups, set_client_group,
        set_client_groups,
    },
    clients::{
        CLIENTS_HEAD_NAME, Client, ClientMap, ClientV4, ClientV5, FindMatchingClientResult,
        InitClientResult, find_matching_client, get_client, get_clients, init_client_v4,
        init_client_v5, set_client, set_clients, update_heartbeat,
    },
};

/// Errors reading or writing client records.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum PersistError {
    #[snafu(transparent)]
    Db { source: DbError },
    #[snafu(transparent)]
    Sync { source: SyncError },
    #[snafu(display("Invalid client map"))]
    InvalidClientMap { source: serde_json::Error },
    #[snafu(display("Invalid client group map"))]
    InvalidClientGroupMap { source: serde_json::Error },
    #[snafu(display("Failed to encode {what}"))]
    Encode {
        what: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("Unknown client: {client_id}"))]
    ClientNotFound { client_id: String },
    #[snafu(display("Client {client_id} does not belong to a client group"))]
    NotInClientGroup { client_id: String },
    #[snafu(display("Unknown client group: {client_group_id}"))]
    ClientGroupNotFound { client_group_id: String },
    #[snafu(display("Invalid update of client group {client_group_id}: {message}"))]
    InvalidClientGroupUpdate {
        client_group_id: String,
        message: &'static str,
    },
}

impl From<DagError> for PersistError {
    fn from(source: DagError) -> Self {
        DbError::from(source).into()
    }
}
