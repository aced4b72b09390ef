//! Pulling server state into the store and pushing local mutations out.
//!
//! A pull stages the server's snapshot under the client's sync head. Local
//! mutations the server has not seen yet are replayed on top of it, and
//! once nothing is left to replay the sync head becomes the new main head.
//! Every client of a store has its own pair of [`Heads`].

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, IntoError, Snafu};
use syncstore_base::Hash;

use crate::db::{DEFAULT_HEAD_NAME, DbError};

mod cookie;
mod diff;
mod ids;
mod patch;
pub mod pull;
pub mod push;
mod rebase;

pub use self::{
    cookie::{Cookie, compare_cookies},
    diff::{DiffComputationConfig, DiffsMap, diff_commits},
    ids::{ClientGroupId, ClientId, new_client_group_id, new_client_id, new_request_id},
    patch::{PatchOperation, apply_patch},
    pull::{
        BeginPullResponse, HandlePullResponseResult, MaybeEndPullResult, Puller, PullerResult,
        PullError, PullRequest, PullRequestV0, PullRequestV1, PullResponseOkV0, PullResponseOkV1,
        PullResponseV0, PullResponseV1, begin_pull_v0, begin_pull_v1, handle_pull_response_v0,
        handle_pull_response_v1, maybe_end_pull,
    },
    push::{
        MutationV0, MutationV1, PushError, PushParams, PushRequest, PushRequestV0, PushRequestV1,
        Pusher, PusherResult, build_push_request, push,
    },
    rebase::rebase_mutation,
};

/// Name of the head a pulled snapshot is staged under.
pub const SYNC_HEAD_NAME: &str = "sync";

/// The heads one client works on.
///
/// Clients sharing a store never move each other's heads, so each one
/// gets a main head and a sync head of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heads {
    /// The client's current state, local mutations included.
    pub main: String,
    /// Where a pulled snapshot waits until it replaces main.
    pub sync: String,
}

impl Default for Heads {
    fn default() -> Self {
        Self {
            main: DEFAULT_HEAD_NAME.to_string(),
            sync: SYNC_HEAD_NAME.to_string(),
        }
    }
}

impl Heads {
    /// The heads private to `client_id`.
    pub fn for_client(client_id: &str) -> Self {
        Self {
            main: format!("{DEFAULT_HEAD_NAME}/{client_id}"),
            sync: format!("{SYNC_HEAD_NAME}/{client_id}"),
        }
    }
}

/// Status of the HTTP round trip behind a pull or push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestInfo {
    /// The HTTP status, 200 on success.
    pub http_status_code: u16,
    /// Empty on success.
    pub error_message: String,
}

/// An error response from the server, passed through to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// The kind of error, e.g. `VersionNotSupported`.
    pub error: String,
    /// Which version the server rejected, if that was the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_type: Option<String>,
}

/// Failure of the puller or pusher itself, as opposed to a bad response.
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(module)]
pub enum TransportError {
    #[snafu(display("Transport '{provenance}' error"))]
    User {
        provenance: &'static str,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl TransportError {
    /// Creates a new user error from an arbitrary error type.
    pub fn from_err<T: std::error::Error + Send + Sync + 'static>(
        provenance: &'static str,
        source: T,
    ) -> Self {
        transport_error::UserSnafu { provenance }.into_error(Box::new(source))
    }

    /// Creates a new user error from an arbitrary boxed error type.
    pub fn from_err_box(
        provenance: &'static str,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    ) -> Self {
        transport_error::UserSnafu { provenance }.into_error(source)
    }
}

/// Protocol and consistency errors while syncing.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum SyncError {
    #[snafu(transparent)]
    Db { source: DbError },
    #[snafu(display("Invalid cookie: {cookie}"))]
    InvalidCookie { cookie: String },
    #[snafu(display(
        "Received {name} {received} is < than last snapshot {name} {last}; ignoring client view"
    ))]
    BadOrder {
        name: String,
        received: String,
        last: String,
    },
    #[snafu(display("Overlapping sync"))]
    OverlappingSync {},
    #[snafu(display("Overlapping syncs"))]
    OverlappingSyncs {},
    #[snafu(display("Missing sync head"))]
    MissingSyncHead {},
    #[snafu(display("Wrong sync head"))]
    WrongSyncHead { expected: Hash, actual: Hash },
    #[snafu(display("Missing main head"))]
    MissingMainHead {},
    #[snafu(display("Internal invalid chain"))]
    InvalidChain {},
    #[snafu(display("Unknown mutator: {name}"))]
    UnknownMutator { name: String },
    #[snafu(display("Mutator {name} failed"))]
    Mutator {
        name: String,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[snafu(display("Commit {hash} is not a local mutation"))]
    NotLocal { hash: Hash },
}

impl From<crate::dag::DagError> for SyncError {
    fn from(source: crate::dag::DagError) -> Self {
        DbError::from(source).into()
    }
}
