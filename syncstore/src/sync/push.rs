//! Sending pending local mutations to the server.

use n0_future::boxed::BoxFuture;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tracing::{debug, instrument};

use super::{
    ClientGroupId, ClientId, Heads, HttpRequestInfo, MissingMainHeadSnafu, NotLocalSnafu,
    SyncError, TransportError,
};
use crate::{
    dag::{self, Readable},
    db::{self, Commit, local_mutations},
};

/// Push protocol of single client stores.
pub const PUSH_VERSION_SDD: u32 = 0;
/// Push protocol of client groups.
pub const PUSH_VERSION_DD31: u32 = 1;

/// A mutation as sent by a single client store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationV0 {
    /// The mutation id.
    pub id: u64,
    /// The mutator name.
    pub name: String,
    /// The mutator arguments.
    pub args: Value,
    /// When the mutation first ran, in Unix milliseconds.
    pub timestamp: u64,
}

/// A mutation as sent by a client group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationV1 {
    /// The mutation id, counted per client.
    pub id: u64,
    /// The mutator name.
    pub name: String,
    /// The mutator arguments.
    pub args: Value,
    /// When the mutation first ran, in Unix milliseconds.
    pub timestamp: u64,
    /// The client that ran the mutation.
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
}

/// Push request of a single client store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequestV0 {
    /// Always [`PUSH_VERSION_SDD`].
    pub push_version: u32,
    /// The app schema the client runs.
    pub schema_version: String,
    /// The browser profile or device of the client.
    #[serde(rename = "profileID")]
    pub profile_id: String,
    /// The pushing client.
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
    /// Pending mutations, oldest first.
    pub mutations: Vec<MutationV0>,
}

/// Push request of a client group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequestV1 {
    /// Always [`PUSH_VERSION_DD31`].
    pub push_version: u32,
    /// The app schema the client runs.
    pub schema_version: String,
    /// The browser profile or device of the client.
    #[serde(rename = "profileID")]
    pub profile_id: String,
    /// The group whose mutations are pushed.
    #[serde(rename = "clientGroupID")]
    pub client_group_id: ClientGroupId,
    /// Pending mutations of every client in the group, oldest first.
    pub mutations: Vec<MutationV1>,
}

/// The body sent to the push endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_more::From)]
#[serde(untagged)]
pub enum PushRequest {
    /// A client group push.
    V1(PushRequestV1),
    /// A single client push.
    V0(PushRequestV0),
}

impl PushRequest {
    /// Number of mutations in the request.
    pub fn mutation_count(&self) -> usize {
        match self {
            PushRequest::V0(r) => r.mutations.len(),
            PushRequest::V1(r) => r.mutations.len(),
        }
    }
}

/// What the pusher hands back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PusherResult {
    /// Status of the request.
    pub http_request_info: HttpRequestInfo,
    /// The decoded body, if the server sent one.
    pub response: Option<Value>,
}

/// Sends push requests to the server.
pub trait Pusher: std::fmt::Debug + Send + Sync + 'static {
    /// Sends `request`. Only a failure to reach the server is an error.
    fn push(
        &self,
        request: PushRequest,
        request_id: String,
    ) -> BoxFuture<Result<PusherResult, TransportError>>;
}

/// Errors of a push round trip.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum PushError {
    #[snafu(display("Failed to push"))]
    Pusher { source: TransportError },
    #[snafu(transparent)]
    Sync { source: SyncError },
}

impl From<db::DbError> for PushError {
    fn from(source: db::DbError) -> Self {
        SyncError::from(source).into()
    }
}

impl From<dag::DagError> for PushError {
    fn from(source: dag::DagError) -> Self {
        SyncError::from(source).into()
    }
}

/// Parameters of a push that do not come from the store.
#[derive(Debug, Clone)]
pub struct PushParams<'a> {
    /// The browser profile or device.
    pub profile_id: &'a str,
    /// The pushing client.
    pub client_id: &'a str,
    /// The client group, empty for single client stores.
    pub client_group_id: &'a str,
    /// The app schema the client runs.
    pub schema_version: &'a str,
    /// Picks the request format.
    pub push_version: u32,
}

/// Builds the request for the local mutations on top of the base snapshot
/// of `heads.main`, oldest first. `None` when nothing is pending.
pub fn build_push_request(
    read: &(impl Readable + ?Sized),
    heads: &Heads,
    params: &PushParams<'_>,
) -> Result<Option<PushRequest>, SyncError> {
    let main_head = read.get_head(&heads.main)?.context(MissingMainHeadSnafu)?;
    let mut pending = local_mutations(&main_head, read)?;
    if pending.is_empty() {
        return Ok(None);
    }
    pending.reverse();
    Ok(Some(request_for(&pending, params)?))
}

/// Builds a push request for `pending`, which must be local commits.
pub(crate) fn request_for(
    pending: &[Commit],
    params: &PushParams<'_>,
) -> Result<PushRequest, SyncError> {
    if params.push_version == PUSH_VERSION_SDD {
        let mutations = pending
            .iter()
            .map(|commit| {
                let parts = commit
                    .meta()
                    .local_parts()
                    .context(NotLocalSnafu { hash: commit.hash() })?;
                Ok(MutationV0 {
                    id: parts.mutation_id,
                    name: parts.mutator_name.to_string(),
                    args: parts.mutator_args.clone(),
                    timestamp: parts.timestamp,
                })
            })
            .collect::<Result<_, SyncError>>()?;
        return Ok(PushRequestV0 {
            push_version: PUSH_VERSION_SDD,
            schema_version: params.schema_version.to_string(),
            profile_id: params.profile_id.to_string(),
            client_id: params.client_id.to_string(),
            mutations,
        }
        .into());
    }
    let mutations = pending
        .iter()
        .map(|commit| {
            let parts = commit
                .meta()
                .local_parts()
                .context(NotLocalSnafu { hash: commit.hash() })?;
            Ok(MutationV1 {
                id: parts.mutation_id,
                name: parts.mutator_name.to_string(),
                args: parts.mutator_args.clone(),
                timestamp: parts.timestamp,
                client_id: parts.client_id.unwrap_or(params.client_id).to_string(),
            })
        })
        .collect::<Result<_, SyncError>>()?;
    Ok(PushRequestV1 {
        push_version: PUSH_VERSION_DD31,
        schema_version: params.schema_version.to_string(),
        profile_id: params.profile_id.to_string(),
        client_group_id: params.client_group_id.to_string(),
        mutations,
    }
    .into())
}

/// Pushes the pending local mutations on `heads.main`.
///
/// Returns `None` without calling the pusher when nothing is pending.
#[instrument(skip(store, heads, pusher, params), fields(client_id = %params.client_id))]
pub async fn push(
    request_id: String,
    store: &dag::Store,
    heads: &Heads,
    pusher: &dyn Pusher,
    params: &PushParams<'_>,
) -> Result<Option<PusherResult>, PushError> {
    let request = {
        let read = store.read()?;
        build_push_request(&read, heads, params)?
    };
    let Some(request) = request else {
        return Ok(None);
    };
    debug!(mutations = request.mutation_count(), "Starting push...");
    let result = pusher.push(request, request_id).await.context(PusherSnafu)?;
    debug!(
        status = result.http_request_info.http_status_code,
        "...Push complete"
    );
    Ok(Some(result))
}
