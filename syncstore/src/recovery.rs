//! Recovering mutations that other clients left unpushed.
//!
//! A client can go away with local mutations the server never confirmed.
//! Their commits stay reachable through the client (or client group) record
//! in the store. [`MutationRecovery`] pushes them on the absent client's
//! behalf and then pulls to learn which ids the server has acknowledged, so
//! the next sweep does not push them again.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu, ensure};
use syncstore_base::Hash;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    dag::{self, DagError},
    db::{Commit, DbError, FormatVersion, base_snapshot_from_hash, local_mutations},
    persist::{
        Client, ClientGroup, ClientV4, PersistError, disable_client_group, get_client,
        get_client_group, get_client_groups, get_clients, set_client, set_client_group,
    },
    sync::{
        ClientGroupId, ClientId, PullError, PullRequestV0, PullRequestV1, PullResponseV0,
        PullResponseV1, Puller, PushError, PushParams, Pusher, SyncError, new_request_id,
        pull::{PULL_VERSION_DD31, PULL_VERSION_SDD, call_puller},
        push::{PUSH_VERSION_DD31, PUSH_VERSION_SDD, PusherSnafu, request_for},
    },
};

/// Server errors after which a client group can never sync again.
const FATAL_PULL_ERRORS: [&str; 2] = ["ClientStateNotFound", "VersionNotSupported"];

/// Errors recovering the mutations of a single client or client group.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum RecoveryError {
    #[snafu(transparent)]
    Persist { source: PersistError },
    #[snafu(transparent)]
    Sync { source: SyncError },
    #[snafu(transparent)]
    Push { source: PushError },
    #[snafu(transparent)]
    Pull { source: PullError },
    #[snafu(display("Push failed with status {status}: {message}"))]
    PushStatus { status: u16, message: String },
}

impl From<DbError> for RecoveryError {
    fn from(source: DbError) -> Self {
        SyncError::from(source).into()
    }
}

impl From<DagError> for RecoveryError {
    fn from(source: DagError) -> Self {
        SyncError::from(source).into()
    }
}

/// A store to look for unpushed mutations in.
#[derive(Debug, Clone)]
pub struct RecoveryTarget {
    /// Used for logging only.
    pub name: String,
    /// The store to sweep.
    pub store: dag::Store,
    /// Schema version the store's clients were written with.
    pub schema_version: String,
    /// The format of the store, which picks the protocol versions.
    pub format_version: FormatVersion,
}

/// Identity of the running client and what recovery may do.
#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// Sent along with every request.
    pub profile_id: String,
    /// The running client. Its own mutations are pushed by itself.
    pub client_id: ClientId,
    /// The running client's group, skipped for the same reason.
    pub client_group_id: Option<ClientGroupId>,
    /// Whether to pull for acknowledged ids after pushing.
    pub pull_enabled: bool,
}

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Clients or client groups whose acknowledged ids were updated.
    pub recovered: Vec<String>,
    /// Participants that failed and were skipped.
    pub failed: Vec<String>,
    /// Whether the sweep stopped early because it was cancelled.
    pub cancelled: bool,
}

/// Pushes the pending mutations of clients other than the running one.
#[derive(derive_more::Debug)]
pub struct MutationRecovery {
    options: RecoveryOptions,
    #[debug("Puller")]
    puller: Arc<dyn Puller>,
    #[debug("Pusher")]
    pusher: Arc<dyn Pusher>,
    cancel: CancellationToken,
    request_count: AtomicU64,
}

impl MutationRecovery {
    /// Recovery for the client described by `options`. The sweep stops
    /// before the next participant once `cancel` fires.
    pub fn new(
        options: RecoveryOptions,
        puller: Arc<dyn Puller>,
        pusher: Arc<dyn Pusher>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            options,
            puller,
            pusher,
            cancel,
            request_count: AtomicU64::new(0),
        }
    }

    fn next_request_id(&self) -> String {
        let count = self.request_count.fetch_add(1, Ordering::Relaxed);
        new_request_id(&self.options.client_id, "recovery", count)
    }

    /// Sweeps `targets` in order.
    ///
    /// Failures are logged and skipped, both per client and per store. The
    /// cancellation token is checked before every client, so a cancelled
    /// sweep stops between two clients and never in the middle of one.
    #[instrument(skip_all, fields(client_id = %self.options.client_id, stores = targets.len()))]
    pub async fn recover(&self, targets: &[RecoveryTarget]) -> RecoverySummary {
        let mut summary = RecoverySummary::default();
        for target in targets {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let res = match target.format_version {
                FormatVersion::Sdd => self.recover_store_sdd(target, &mut summary).await,
                FormatVersion::Dd31 => self.recover_store_dd31(target, &mut summary).await,
            };
            if let Err(err) = res {
                error!(store = %target.name, "Mutation recovery error: {err}");
                summary.failed.push(target.name.clone());
            }
            if summary.cancelled {
                break;
            }
        }
        debug!(
            recovered = summary.recovered.len(),
            failed = summary.failed.len(),
            cancelled = summary.cancelled,
            "mutation recovery done"
        );
        summary
    }

    async fn recover_store_sdd(
        &self,
        target: &RecoveryTarget,
        summary: &mut RecoverySummary,
    ) -> Result<(), RecoveryError> {
        let clients = get_clients(&target.store.read()?)?;
        for (client_id, client) in clients {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                return Ok(());
            }
            let Client::V4(client) = client else {
                continue;
            };
            if client_id == self.options.client_id
                || client.mutation_id <= client.last_server_ackd_mutation_id
            {
                continue;
            }
            match self.recover_client_v4(target, &client_id, &client).await {
                Ok(true) => summary.recovered.push(client_id),
                Ok(false) => {}
                Err(err) => {
                    error!(
                        store = %target.name,
                        %client_id,
                        "Mutation recovery error: {err}"
                    );
                    summary.failed.push(client_id);
                }
            }
        }
        Ok(())
    }

    async fn recover_store_dd31(
        &self,
        target: &RecoveryTarget,
        summary: &mut RecoverySummary,
    ) -> Result<(), RecoveryError> {
        let groups = get_client_groups(&target.store.read()?)?;
        for (client_group_id, group) in groups {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                return Ok(());
            }
            if group.disabled
                || !group.has_pending_mutations()
                || self.options.client_group_id.as_ref() == Some(&client_group_id)
            {
                continue;
            }
            match self
                .recover_client_group(target, &client_group_id, &group)
                .await
            {
                Ok(true) => summary.recovered.push(client_group_id),
                Ok(false) => {}
                Err(err) => {
                    error!(
                        store = %target.name,
                        %client_group_id,
                        "Mutation recovery error: {err}"
                    );
                    summary.failed.push(client_group_id);
                }
            }
        }
        Ok(())
    }

    async fn push(&self, request: crate::sync::PushRequest) -> Result<(), RecoveryError> {
        let result = self
            .pusher
            .push(request, self.next_request_id())
            .await
            .context(PusherSnafu)?;
        let info = result.http_request_info;
        ensure!(
            info.http_status_code == 200,
            PushStatusSnafu {
                status: info.http_status_code,
                message: info.error_message,
            }
        );
        Ok(())
    }

    /// Recovers a client of the single client format. Returns whether its
    /// record was updated.
    #[instrument(skip(self, target, client), fields(store = %target.name))]
    async fn recover_client_v4(
        &self,
        target: &RecoveryTarget,
        client_id: &str,
        client: &ClientV4,
    ) -> Result<bool, RecoveryError> {
        let (pending, cookie) = {
            let read = target.store.read()?;
            let pending = pending_mutations(&client.head_hash, &read, |_| {
                client.last_server_ackd_mutation_id
            })?;
            let base = base_snapshot_from_hash(&client.head_hash, &read)?;
            (pending, base.meta().cookie().cloned().unwrap_or_default())
        };
        if !pending.is_empty() {
            let params = PushParams {
                profile_id: &self.options.profile_id,
                client_id,
                client_group_id: "",
                schema_version: &target.schema_version,
                push_version: PUSH_VERSION_SDD,
            };
            info!(mutations = pending.len(), "Recovering mutations");
            self.push(request_for(&pending, &params)?).await?;
        }
        if !self.options.pull_enabled {
            return Ok(false);
        }

        let request = PullRequestV0 {
            pull_version: PULL_VERSION_SDD,
            schema_version: target.schema_version.clone(),
            profile_id: self.options.profile_id.clone(),
            cookie,
            client_id: client_id.to_string(),
            last_mutation_id: client.last_server_ackd_mutation_id,
        };
        let (info, response) = call_puller::<PullResponseV0>(
            self.puller.as_ref(),
            request.into(),
            self.next_request_id(),
        )
        .await?;
        let ok = match response {
            Some(PullResponseV0::Ok(ok)) => ok,
            Some(PullResponseV0::Error(err)) => {
                warn!(error = %err.error, "Pull returned an error response during recovery");
                return Ok(false);
            }
            None => {
                warn!(
                    status = info.http_status_code,
                    "Pull failed during recovery: {}", info.error_message
                );
                return Ok(false);
            }
        };

        let mut write = target.store.write()?;
        let Some(Client::V4(mut current)) = get_client(client_id, &write)? else {
            return Ok(false);
        };
        if ok.last_mutation_id <= current.last_server_ackd_mutation_id {
            return Ok(false);
        }
        current.last_server_ackd_mutation_id = ok.last_mutation_id;
        set_client(client_id, current.into(), &mut write)?;
        write.commit()?;
        Ok(true)
    }

    /// Recovers a client group. Returns whether its record was updated.
    #[instrument(skip(self, target, group), fields(store = %target.name))]
    async fn recover_client_group(
        &self,
        target: &RecoveryTarget,
        client_group_id: &str,
        group: &ClientGroup,
    ) -> Result<bool, RecoveryError> {
        let (pending, cookie) = {
            let read = target.store.read()?;
            let pending = pending_mutations(&group.head_hash, &read, |client_id| {
                group
                    .last_server_ackd_mutation_ids
                    .get(client_id)
                    .copied()
                    .unwrap_or(0)
            })?;
            let base = base_snapshot_from_hash(&group.head_hash, &read)?;
            (pending, base.meta().cookie().cloned().unwrap_or_default())
        };
        if !pending.is_empty() {
            let params = PushParams {
                profile_id: &self.options.profile_id,
                client_id: &self.options.client_id,
                client_group_id,
                schema_version: &target.schema_version,
                push_version: PUSH_VERSION_DD31,
            };
            info!(mutations = pending.len(), "Recovering mutations");
            self.push(request_for(&pending, &params)?).await?;
        }
        if !self.options.pull_enabled {
            return Ok(false);
        }

        let request = PullRequestV1 {
            pull_version: PULL_VERSION_DD31,
            schema_version: target.schema_version.clone(),
            profile_id: self.options.profile_id.clone(),
            cookie,
            client_group_id: client_group_id.to_string(),
        };
        let (info, response) = call_puller::<PullResponseV1>(
            self.puller.as_ref(),
            request.into(),
            self.next_request_id(),
        )
        .await?;
        let ok = match response {
            Some(PullResponseV1::Ok(ok)) => ok,
            Some(PullResponseV1::Error(err)) => {
                if FATAL_PULL_ERRORS.contains(&err.error.as_str()) {
                    warn!(error = %err.error, "Disabling client group");
                    let mut write = target.store.write()?;
                    disable_client_group(client_group_id, &mut write)?;
                    write.commit()?;
                } else {
                    warn!(error = %err.error, "Pull returned an error response during recovery");
                }
                return Ok(false);
            }
            None => {
                warn!(
                    status = info.http_status_code,
                    "Pull failed during recovery: {}", info.error_message
                );
                return Ok(false);
            }
        };

        let mut write = target.store.write()?;
        let Some(mut current) = get_client_group(client_group_id, &write)? else {
            return Ok(false);
        };
        let mut changed = false;
        for (client_id, id) in ok.last_mutation_id_changes {
            let acked = current
                .last_server_ackd_mutation_ids
                .entry(client_id)
                .or_insert(0);
            if id > *acked {
                *acked = id;
                changed = true;
            }
        }
        if !changed {
            return Ok(false);
        }
        set_client_group(client_group_id, current, &mut write)?;
        write.commit()?;
        Ok(true)
    }
}

/// Local commits on top of `head`'s base snapshot the server has not
/// acknowledged, oldest first. `acked` gives the last acknowledged id of a
/// client; commits of the single client format belong to client `""`.
fn pending_mutations(
    head: &Hash,
    read: &dag::Read,
    acked: impl Fn(&str) -> u64,
) -> Result<Vec<Commit>, RecoveryError> {
    let mut pending = Vec::new();
    for commit in local_mutations(head, read)? {
        let Some(parts) = commit.meta().local_parts() else {
            continue;
        };
        if parts.mutation_id > acked(parts.client_id.unwrap_or("")) {
            pending.push(commit);
        }
    }
    pending.reverse();
    Ok(pending)
}
