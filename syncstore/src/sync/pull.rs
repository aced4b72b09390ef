//! Pull requests and applying their responses.

use std::collections::BTreeMap;

use n0_future::boxed::BoxFuture;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu, ensure};
use syncstore_base::Hash;
use tracing::{debug, error, instrument};

use super::{
    BadOrderSnafu, ClientGroupId, ClientId, Cookie, DiffComputationConfig, DiffsMap,
    ErrorResponse, Heads, HttpRequestInfo, InvalidChainSnafu, MissingMainHeadSnafu,
    MissingSyncHeadSnafu, OverlappingSyncSnafu, OverlappingSyncsSnafu, SyncError,
    TransportError, WrongSyncHeadSnafu, compare_cookies, diff_commits,
    patch::{PatchOperation, apply_patch},
};
use crate::{
    dag::{self, Readable},
    db::{
        self, Commit, FormatVersion, Meta, ValueMap, WrongFormatSnafu,
        base_snapshot_from_hash, commit_chain, commit_from_hash, local_mutations,
    },
};

/// Pull protocol of single client stores.
pub const PULL_VERSION_SDD: u32 = 0;
/// Pull protocol of client groups.
pub const PULL_VERSION_DD31: u32 = 1;

/// Pull request of a single client store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestV0 {
    /// Always [`PULL_VERSION_SDD`].
    pub pull_version: u32,
    /// The app schema the client runs.
    pub schema_version: String,
    /// The browser profile or device of the client.
    #[serde(rename = "profileID")]
    pub profile_id: String,
    /// The cookie of the client's base snapshot.
    pub cookie: Cookie,
    /// The pulling client.
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
    /// The last mutation id of the base snapshot.
    #[serde(rename = "lastMutationID")]
    pub last_mutation_id: u64,
}

/// Pull request of a client group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestV1 {
    /// Always [`PULL_VERSION_DD31`].
    pub pull_version: u32,
    /// The app schema the client runs.
    pub schema_version: String,
    /// The browser profile or device of the client.
    #[serde(rename = "profileID")]
    pub profile_id: String,
    /// The cookie of the group's base snapshot.
    pub cookie: Cookie,
    /// The pulling client group.
    #[serde(rename = "clientGroupID")]
    pub client_group_id: ClientGroupId,
}

/// The body sent to the pull endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_more::From)]
#[serde(untagged)]
pub enum PullRequest {
    /// A single client pull.
    V0(PullRequestV0),
    /// A client group pull.
    V1(PullRequestV1),
}

/// A successful pull response for a single client store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponseOkV0 {
    /// The server version the patch brings the client to.
    #[serde(default)]
    pub cookie: Cookie,
    /// The last mutation of the client the server has applied.
    #[serde(rename = "lastMutationID")]
    pub last_mutation_id: u64,
    /// Turns the base snapshot into the new one.
    pub patch: Vec<PatchOperation>,
}

/// A successful pull response for a client group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponseOkV1 {
    /// The server version the patch brings the group to.
    pub cookie: Cookie,
    /// New last mutation ids, only for the clients whose id changed.
    #[serde(rename = "lastMutationIDChanges", default)]
    pub last_mutation_id_changes: BTreeMap<ClientId, u64>,
    /// Turns the base snapshot into the new one.
    pub patch: Vec<PatchOperation>,
}

/// The pull response body of a single client store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PullResponseV0 {
    /// New server state.
    Ok(PullResponseOkV0),
    /// The server refused the pull.
    Error(ErrorResponse),
}

/// The pull response body of a client group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PullResponseV1 {
    /// New server state.
    Ok(PullResponseOkV1),
    /// The server refused the pull.
    Error(ErrorResponse),
}

/// What the puller hands back: the HTTP status and, if the request went
/// through, the decoded JSON body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullerResult {
    /// Status of the request.
    pub http_request_info: HttpRequestInfo,
    /// The body, when the server answered.
    pub response: Option<Value>,
}

/// Sends pull requests to the server.
pub trait Puller: std::fmt::Debug + Send + Sync + 'static {
    /// Sends `request`; a failure to reach the server is an error, an error
    /// response from the server is not.
    fn pull(
        &self,
        request: PullRequest,
        request_id: String,
    ) -> BoxFuture<Result<PullerResult, TransportError>>;
}

/// Errors of a pull round trip.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum PullError {
    #[snafu(display("Failed to get pull response"))]
    Puller { source: TransportError },
    #[snafu(display("Invalid puller result"))]
    InvalidResponse { source: serde_json::Error },
    #[snafu(transparent)]
    Sync { source: SyncError },
}

impl From<db::DbError> for PullError {
    fn from(source: db::DbError) -> Self {
        SyncError::from(source).into()
    }
}

impl From<dag::DagError> for PullError {
    fn from(source: dag::DagError) -> Self {
        SyncError::from(source).into()
    }
}

/// Outcome of applying a pull response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlePullResponseResult {
    /// The new snapshot is staged under the sync head.
    Applied {
        /// The staged snapshot.
        sync_head: Hash,
    },
    /// The server had nothing new.
    NoOp,
    /// Main moved on while the request was in flight.
    CookieMismatch,
}

/// Result of [`begin_pull_v0`] and [`begin_pull_v1`].
#[derive(Debug, Clone, PartialEq)]
pub struct BeginPullResponse<R> {
    /// Status of the request.
    pub http_request_info: HttpRequestInfo,
    /// The decoded body, when the server answered.
    pub pull_response: Option<R>,
    /// The staged snapshot, if the response was applied.
    pub sync_head: Option<Hash>,
}

/// Result of [`maybe_end_pull`].
#[derive(Debug, Clone, PartialEq)]
pub struct MaybeEndPullResult {
    /// The sync head the pull ended at.
    pub sync_head: Hash,
    /// Local mutations to replay on top of the sync head, oldest first.
    pub replay_mutations: Vec<Commit>,
    /// What changed between the old and the new main.
    pub diffs: DiffsMap,
}

fn main_base_snapshot(
    read: &(impl Readable + ?Sized),
    heads: &Heads,
) -> Result<(Hash, Commit), SyncError> {
    let main_head = read.get_head(&heads.main)?.context(MissingMainHeadSnafu)?;
    let base = base_snapshot_from_hash(&main_head, read)?;
    Ok((main_head, base))
}

pub(crate) async fn call_puller<R: serde::de::DeserializeOwned>(
    puller: &dyn Puller,
    request: PullRequest,
    request_id: String,
) -> Result<(HttpRequestInfo, Option<R>), PullError> {
    debug!("Starting pull...");
    let result = puller.pull(request, request_id).await.context(PullerSnafu)?;
    debug!(
        status = result.http_request_info.http_status_code,
        "...Pull {}",
        if result.response.is_some() { "complete" } else { "failed" }
    );
    let response = result
        .response
        .map(serde_json::from_value)
        .transpose()
        .context(InvalidResponseSnafu)?;
    Ok((result.http_request_info, response))
}

/// Pulls for a single client store and stages the response.
///
/// When `create_sync_branch` is false the response is returned without
/// being applied.
#[instrument(skip(puller, store, heads))]
#[allow(clippy::too_many_arguments)]
pub async fn begin_pull_v0(
    profile_id: &str,
    client_id: &str,
    schema_version: &str,
    puller: &dyn Puller,
    request_id: String,
    store: &dag::Store,
    heads: &Heads,
    create_sync_branch: bool,
) -> Result<BeginPullResponse<PullResponseV0>, PullError> {
    let (last_mutation_id, base_cookie) = {
        let read = store.read()?;
        let (_, base) = main_base_snapshot(&read, heads)?;
        let cookie = base.meta().cookie().cloned().unwrap_or_default();
        (base.mutation_id(client_id, &read)?, cookie)
    };
    let request = PullRequestV0 {
        pull_version: PULL_VERSION_SDD,
        schema_version: schema_version.to_string(),
        profile_id: profile_id.to_string(),
        cookie: base_cookie.clone(),
        client_id: client_id.to_string(),
        last_mutation_id,
    };
    let (http_request_info, response) =
        call_puller::<PullResponseV0>(puller, request.into(), request_id).await?;
    let response = match response {
        Some(PullResponseV0::Ok(ok)) if create_sync_branch => ok,
        pull_response => {
            return Ok(BeginPullResponse {
                http_request_info,
                pull_response,
                sync_head: None,
            });
        }
    };
    let result = handle_pull_response_v0(store, heads, &base_cookie, &response, client_id)?;
    let sync_head = match result {
        HandlePullResponseResult::CookieMismatch => {
            return Err(OverlappingSyncSnafu.build().into());
        }
        HandlePullResponseResult::Applied { sync_head } => Some(sync_head),
        HandlePullResponseResult::NoOp => None,
    };
    Ok(BeginPullResponse {
        http_request_info,
        pull_response: Some(PullResponseV0::Ok(response)),
        sync_head,
    })
}

/// Pulls for a client group and stages the response.
#[instrument(skip(puller, store, heads))]
#[allow(clippy::too_many_arguments)]
pub async fn begin_pull_v1(
    profile_id: &str,
    client_id: &str,
    client_group_id: &str,
    schema_version: &str,
    puller: &dyn Puller,
    request_id: String,
    store: &dag::Store,
    heads: &Heads,
    create_sync_branch: bool,
) -> Result<BeginPullResponse<PullResponseV1>, PullError> {
    let base_cookie = {
        let read = store.read()?;
        let (_, base) = main_base_snapshot(&read, heads)?;
        let Meta::SnapshotDd31(meta) = base.meta() else {
            return Err(WrongFormatSnafu {
                hash: base.hash(),
                expected: FormatVersion::Dd31,
            }
            .build()
            .into());
        };
        meta.cookie.clone()
    };
    let request = PullRequestV1 {
        pull_version: PULL_VERSION_DD31,
        schema_version: schema_version.to_string(),
        profile_id: profile_id.to_string(),
        cookie: base_cookie.clone(),
        client_group_id: client_group_id.to_string(),
    };
    let (http_request_info, response) =
        call_puller::<PullResponseV1>(puller, request.into(), request_id).await?;
    let response = match response {
        Some(PullResponseV1::Ok(ok)) if create_sync_branch => ok,
        pull_response => {
            return Ok(BeginPullResponse {
                http_request_info,
                pull_response,
                sync_head: None,
            });
        }
    };
    let result = handle_pull_response_v1(store, heads, &base_cookie, &response, client_id)?;
    let sync_head = match result {
        HandlePullResponseResult::Applied { sync_head } => Some(sync_head),
        HandlePullResponseResult::NoOp | HandlePullResponseResult::CookieMismatch => None,
    };
    Ok(BeginPullResponse {
        http_request_info,
        pull_response: Some(PullResponseV1::Ok(response)),
        sync_head,
    })
}

/// Stages a single client pull response under the sync head.
///
/// Nothing is written unless the result is
/// [`HandlePullResponseResult::Applied`].
#[instrument(skip_all, fields(client_id = %client_id))]
pub fn handle_pull_response_v0(
    store: &dag::Store,
    heads: &Heads,
    expected_base_cookie: &Cookie,
    response: &PullResponseOkV0,
    client_id: &str,
) -> Result<HandlePullResponseResult, SyncError> {
    let mut dag_write = store.write()?;
    let (main_head, base_snapshot) = main_base_snapshot(&dag_write, heads)?;
    let Meta::SnapshotSdd(base_meta) = base_snapshot.meta() else {
        return Err(WrongFormatSnafu {
            hash: base_snapshot.hash(),
            expected: FormatVersion::Sdd,
        }
        .build()
        .into());
    };
    let base_last_mutation_id = base_meta.last_mutation_id;
    let base_cookie = base_meta.cookie.clone();

    if expected_base_cookie != &base_cookie {
        return Ok(HandlePullResponseResult::CookieMismatch);
    }

    // Other clients may change the view without touching our mutation id,
    // so only a smaller id is rejected.
    ensure!(
        response.last_mutation_id >= base_last_mutation_id,
        BadOrderSnafu {
            name: "lastMutationID",
            received: response.last_mutation_id.to_string(),
            last: base_last_mutation_id.to_string(),
        }
    );

    if response.cookie == base_cookie {
        if !response.patch.is_empty() {
            error!(
                "handlePullResponse: cookie {base_cookie} did not change, but patch is not empty"
            );
        }
        if response.last_mutation_id != base_last_mutation_id {
            error!(
                "handlePullResponse: cookie {base_cookie} did not change, but lastMutationID did change"
            );
        }
        return Ok(HandlePullResponseResult::NoOp);
    }

    // The server's value for a mutation need not match what this client
    // computed for it, so indexes start from the last integrated commit and
    // are then fixed up by diffing its map against the new one.
    let mut last_integrated = None;
    for commit in commit_chain(&main_head, &dag_write)? {
        if commit.mutation_id(client_id, &dag_write)? <= response.last_mutation_id {
            last_integrated = Some(commit);
            break;
        }
    }
    let last_integrated = last_integrated.context(InvalidChainSnafu)?;
    let indexes = db::read_indexes_for_write(&last_integrated, &dag_write)?;
    let last_integrated_map = ValueMap::load(&last_integrated.value_hash(), &dag_write)?;

    let mut write = db::Write::new_snapshot_sdd(
        Some(base_snapshot.hash()),
        response.last_mutation_id,
        response.cookie.clone(),
        &mut dag_write,
        indexes,
        client_id,
    )?;
    apply_patch(&mut write, &response.patch);
    let changes = ValueMap::diff(&last_integrated_map, write.map());
    for change in changes {
        write.update_indexes(change.key(), change.old_value(), change.new_value());
    }
    let sync_head = write.commit(&heads.sync)?;
    dag_write.commit()?;
    Ok(HandlePullResponseResult::Applied { sync_head })
}

/// Stages a client group pull response under the sync head.
#[instrument(skip_all, fields(client_id = %client_id))]
pub fn handle_pull_response_v1(
    store: &dag::Store,
    heads: &Heads,
    expected_base_cookie: &Cookie,
    response: &PullResponseOkV1,
    client_id: &str,
) -> Result<HandlePullResponseResult, SyncError> {
    let mut dag_write = store.write()?;
    let (_, base_snapshot) = main_base_snapshot(&dag_write, heads)?;
    let Meta::SnapshotDd31(base_meta) = base_snapshot.meta() else {
        return Err(WrongFormatSnafu {
            hash: base_snapshot.hash(),
            expected: FormatVersion::Dd31,
        }
        .build()
        .into());
    };
    let base_cookie = &base_meta.cookie;

    // Expected when a refresh lands while the pull is in flight.
    if expected_base_cookie != base_cookie {
        debug!("handlePullResponse: cookie mismatch, response is not applicable");
        return Ok(HandlePullResponseResult::CookieMismatch);
    }

    for (changed_client, &change) in &response.last_mutation_id_changes {
        if let Some(&last) = base_meta.last_mutation_ids.get(changed_client) {
            ensure!(
                change >= last,
                BadOrderSnafu {
                    name: format!("{changed_client} lastMutationID"),
                    received: change.to_string(),
                    last: last.to_string(),
                }
            );
        }
    }

    ensure!(
        compare_cookies(&response.cookie, base_cookie)?.is_ge(),
        BadOrderSnafu {
            name: "cookie",
            received: response.cookie.to_string(),
            last: base_cookie.to_string(),
        }
    );

    if &response.cookie == base_cookie {
        if !response.patch.is_empty() {
            error!(
                "handlePullResponse: cookie {base_cookie} did not change, but patch is not empty"
            );
        }
        if !response.last_mutation_id_changes.is_empty() {
            error!(
                changes = ?response.last_mutation_id_changes,
                "handlePullResponse: cookie {base_cookie} did not change, but lastMutationIDChanges is not empty"
            );
        }
        return Ok(HandlePullResponseResult::NoOp);
    }

    let mut last_mutation_ids = base_meta.last_mutation_ids.clone();
    last_mutation_ids.extend(
        response
            .last_mutation_id_changes
            .iter()
            .map(|(k, v)| (k.clone(), *v)),
    );
    let basis = base_snapshot.hash();
    let mut write = db::Write::new_snapshot_dd31(
        Some(basis),
        last_mutation_ids,
        response.cookie.clone(),
        &mut dag_write,
        client_id,
    )?;
    apply_patch(&mut write, &response.patch);
    let sync_head = write.commit(&heads.sync)?;
    dag_write.commit()?;
    Ok(HandlePullResponseResult::Applied { sync_head })
}

/// Promotes the sync head to main once no local mutation needs replaying.
///
/// Mutations still to replay are returned oldest first and nothing is
/// changed. Otherwise main is pointed at the sync head, the sync head is
/// removed, and the diffs between the old and new main are returned.
#[instrument(skip_all, fields(sync_head = %expected_sync_head.fmt_short(), client_id = %client_id))]
pub fn maybe_end_pull(
    store: &dag::Store,
    heads: &Heads,
    expected_sync_head: Hash,
    client_id: &str,
    diff_config: &DiffComputationConfig,
) -> Result<MaybeEndPullResult, SyncError> {
    let mut dag_write = store.write()?;
    let sync_head_hash = dag_write
        .get_head(&heads.sync)?
        .context(MissingSyncHeadSnafu)?;
    if sync_head_hash != expected_sync_head {
        error!(
            expected = %expected_sync_head,
            actual = %sync_head_hash,
            "maybeEndPull, Wrong sync head"
        );
        return WrongSyncHeadSnafu {
            expected: expected_sync_head,
            actual: sync_head_hash,
        }
        .fail();
    }

    let sync_snapshot = base_snapshot_from_hash(&sync_head_hash, &dag_write)?;
    let (main_head_hash, main_snapshot) = main_base_snapshot(&dag_write, heads)?;
    ensure!(
        sync_snapshot.meta().basis_hash() == Some(main_snapshot.hash()),
        OverlappingSyncsSnafu
    );

    let sync_head = commit_from_hash(&sync_head_hash, &dag_write)?;
    let mut pending = Vec::new();
    for commit in local_mutations(&main_head_hash, &dag_write)? {
        let owner = match commit.meta() {
            Meta::LocalDd31(meta) => meta.client_id.as_str(),
            _ => client_id,
        };
        let is_pending =
            commit.mutation_id(owner, &dag_write)? > sync_head.mutation_id(owner, &dag_write)?;
        if is_pending {
            pending.push(commit);
        }
    }
    // collected newest first, replayed oldest first
    pending.reverse();

    if !pending.is_empty() {
        return Ok(MaybeEndPullResult {
            sync_head: sync_head_hash,
            replay_mutations: pending,
            diffs: DiffsMap::default(),
        });
    }

    let main_head = commit_from_hash(&main_head_hash, &dag_write)?;
    let diffs = diff_commits(&main_head, &sync_head, &dag_write, diff_config)?;

    dag_write.set_head(&heads.main, sync_head_hash)?;
    dag_write.remove_head(&heads.sync)?;
    dag_write.commit()?;

    debug!(
        old_cookie = ?main_snapshot.meta().cookie(),
        new_cookie = ?sync_snapshot.meta().cookie(),
        main_head = %main_head_hash.fmt_short(),
        "Successfully pulled new snapshot"
    );
    Ok(MaybeEndPullResult {
        sync_head: sync_head_hash,
        replay_mutations: Vec::new(),
        diffs,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::{db::DiffOperation, kv};

    /// A client group store whose main head is a snapshot with `cookie` and
    /// the acknowledged ids `last_mutation_ids`.
    fn store_with(last_mutation_ids: &[(&str, u64)], cookie: u64) -> dag::Store {
        let store = dag::Store::new(kv::Store::in_memory().unwrap());
        let ids = last_mutation_ids
            .iter()
            .map(|(client, id)| (client.to_string(), *id))
            .collect();
        let mut dag = store.write().unwrap();
        db::Write::new_snapshot_dd31(None, ids, Cookie::from(cookie), &mut dag, "c1")
            .unwrap()
            .commit(&Heads::default().main)
            .unwrap();
        dag.commit().unwrap();
        store
    }

    fn store_at(cookie: u64) -> dag::Store {
        store_with(&[], cookie)
    }

    /// A single client store at `cookie` that has seen `last_mutation_id`.
    fn sdd_store_at(last_mutation_id: u64, cookie: u64) -> dag::Store {
        let store = dag::Store::new(kv::Store::in_memory().unwrap());
        let mut dag = store.write().unwrap();
        db::Write::new_snapshot_sdd(
            None,
            last_mutation_id,
            Cookie::from(cookie),
            &mut dag,
            BTreeMap::new(),
            "c1",
        )
        .unwrap()
        .commit(&Heads::default().main)
        .unwrap();
        dag.commit().unwrap();
        store
    }

    fn response(value: Value) -> PullResponseOkV1 {
        serde_json::from_value(value).unwrap()
    }

    fn heads_of(store: &dag::Store, heads: &Heads) -> (Option<Hash>, Option<Hash>) {
        let read = store.read().unwrap();
        (
            read.get_head(&heads.main).unwrap(),
            read.get_head(&heads.sync).unwrap(),
        )
    }

    fn sync_head(store: &dag::Store) -> Option<Hash> {
        heads_of(store, &Heads::default()).1
    }

    #[test]
    fn request_wire_format() {
        let request = PullRequest::V1(PullRequestV1 {
            pull_version: PULL_VERSION_DD31,
            schema_version: "1".into(),
            profile_id: "p".into(),
            cookie: Cookie::from(3),
            client_group_id: "g".into(),
        });
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "pullVersion": 1,
                "schemaVersion": "1",
                "profileID": "p",
                "cookie": 3,
                "clientGroupID": "g",
            })
        );
    }

    #[test]
    fn responses_parse_ok_or_error() {
        let ok: PullResponseV1 = serde_json::from_value(json!({
            "cookie": "c2",
            "lastMutationIDChanges": {"c1": 2},
            "patch": [{"op": "put", "key": "a", "value": 1}],
        }))
        .unwrap();
        assert!(matches!(ok, PullResponseV1::Ok(_)));

        let err: PullResponseV0 =
            serde_json::from_value(json!({"error": "ClientStateNotFound"})).unwrap();
        assert_eq!(
            err,
            PullResponseV0::Error(ErrorResponse {
                error: "ClientStateNotFound".into(),
                version_type: None,
            })
        );

        assert!(serde_json::from_value::<PullResponseV0>(json!({"patch": 3})).is_err());
    }

    #[test]
    #[traced_test]
    fn same_cookie_is_a_no_op() {
        let store = store_at(1);
        let res = handle_pull_response_v1(
            &store,
            &Heads::default(),
            &Cookie::from(1),
            &response(json!({
                "cookie": 1,
                "lastMutationIDChanges": {},
                "patch": [{"op": "put", "key": "a", "value": 1}],
            })),
            "c1",
        )
        .unwrap();
        assert_eq!(res, HandlePullResponseResult::NoOp);
        assert_eq!(sync_head(&store), None);
        assert!(logs_contain("did not change, but patch is not empty"));
    }

    #[test]
    fn stale_base_cookie_is_not_applied() {
        let store = store_at(2);
        let res = handle_pull_response_v1(
            &store,
            &Heads::default(),
            &Cookie::from(1),
            &response(json!({"cookie": 3, "patch": []})),
            "c1",
        )
        .unwrap();
        assert_eq!(res, HandlePullResponseResult::CookieMismatch);
        assert_eq!(sync_head(&store), None);
    }

    #[test]
    fn older_cookie_is_rejected() {
        let store = store_at(2);
        let err = handle_pull_response_v1(
            &store,
            &Heads::default(),
            &Cookie::from(2),
            &response(json!({"cookie": 1, "patch": []})),
            "c1",
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::BadOrder { .. }));
    }

    #[test]
    fn decreasing_last_mutation_id_is_rejected() {
        let store = sdd_store_at(3, 1);
        let heads = Heads::default();
        let before = heads_of(&store, &heads);
        let response: PullResponseOkV0 = serde_json::from_value(json!({
            "cookie": 2,
            "lastMutationID": 2,
            "patch": [{"op": "put", "key": "a", "value": 1}],
        }))
        .unwrap();
        let err =
            handle_pull_response_v0(&store, &heads, &Cookie::from(1), &response, "c1").unwrap_err();
        match err {
            SyncError::BadOrder {
                name,
                received,
                last,
                ..
            } => {
                assert_eq!(name, "lastMutationID");
                assert_eq!((received.as_str(), last.as_str()), ("2", "3"));
            }
            other => panic!("expected a bad order error, got {other:?}"),
        }
        assert_eq!(heads_of(&store, &heads), before);
        assert_eq!(before.1, None);
    }

    #[test]
    fn decreasing_last_mutation_id_change_is_rejected() {
        let store = store_with(&[("c1", 3), ("c2", 1)], 1);
        let heads = Heads::default();
        let before = heads_of(&store, &heads);
        let err = handle_pull_response_v1(
            &store,
            &heads,
            &Cookie::from(1),
            &response(json!({
                "cookie": 2,
                "lastMutationIDChanges": {"c1": 2, "c2": 4},
                "patch": [],
            })),
            "c1",
        )
        .unwrap_err();
        match err {
            SyncError::BadOrder { name, .. } => assert_eq!(name, "c1 lastMutationID"),
            other => panic!("expected a bad order error, got {other:?}"),
        }
        assert_eq!(heads_of(&store, &heads), before);
        assert_eq!(before.1, None);
    }

    #[test]
    fn end_pull_checks_sync_head() {
        let store = store_at(1);
        let heads = Heads::default();
        let res = handle_pull_response_v1(
            &store,
            &heads,
            &Cookie::from(1),
            &response(json!({
                "cookie": 2,
                "lastMutationIDChanges": {"c1": 0},
                "patch": [{"op": "put", "key": "a", "value": 1}],
            })),
            "c1",
        )
        .unwrap();
        let HandlePullResponseResult::Applied { sync_head: staged } = res else {
            panic!("expected the response to be applied, got {res:?}");
        };
        assert_eq!(sync_head(&store), Some(staged));

        let config = DiffComputationConfig::all();
        let err = maybe_end_pull(&store, &heads, Hash::fake("other"), "c1", &config).unwrap_err();
        assert!(matches!(err, SyncError::WrongSyncHead { .. }));

        let res = maybe_end_pull(&store, &heads, staged, "c1", &config).unwrap();
        assert!(res.replay_mutations.is_empty());
        assert_eq!(
            res.diffs.get(""),
            Some(&vec![DiffOperation::Add {
                key: "a".into(),
                new_value: json!(1),
            }])
        );
        assert_eq!(heads_of(&store, &heads), (Some(staged), None));
    }

    #[test]
    fn pulls_only_move_the_clients_own_heads() {
        let store = store_at(1);
        let own = Heads::for_client("c1");
        let other = Heads::for_client("c2");
        {
            let mut dag = store.write().unwrap();
            let genesis = dag.get_head(&Heads::default().main).unwrap().unwrap();
            dag.set_head(&own.main, genesis).unwrap();
            dag.set_head(&other.main, genesis).unwrap();
            dag.commit().unwrap();
        }
        let other_before = heads_of(&store, &other);

        let res = handle_pull_response_v1(
            &store,
            &own,
            &Cookie::from(1),
            &response(json!({"cookie": 2, "patch": [{"op": "put", "key": "a", "value": 1}]})),
            "c1",
        )
        .unwrap();
        let HandlePullResponseResult::Applied { sync_head: staged } = res else {
            panic!("expected the response to be applied, got {res:?}");
        };
        maybe_end_pull(&store, &own, staged, "c1", &DiffComputationConfig::none()).unwrap();

        assert_eq!(heads_of(&store, &own), (Some(staged), None));
        assert_eq!(heads_of(&store, &other), other_before);
    }

    #[test]
    fn end_pull_rejects_overlapping_sync() {
        let store = store_at(1);
        let heads = Heads::default();
        let staged = match handle_pull_response_v1(
            &store,
            &heads,
            &Cookie::from(1),
            &response(json!({"cookie": 2, "patch": []})),
            "c1",
        )
        .unwrap()
        {
            HandlePullResponseResult::Applied { sync_head } => sync_head,
            other => panic!("expected the response to be applied, got {other:?}"),
        };

        // Another pull lands on main first.
        {
            let mut dag = store.write().unwrap();
            db::Write::new_snapshot_dd31(None, BTreeMap::new(), Cookie::from(5), &mut dag, "c1")
                .unwrap()
                .commit(&heads.main)
                .unwrap();
            dag.commit().unwrap();
        }
        let err = maybe_end_pull(&store, &heads, staged, "c1", &DiffComputationConfig::all())
            .unwrap_err();
        assert!(matches!(err, SyncError::OverlappingSyncs { .. }));
    }
}
