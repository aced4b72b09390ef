//! A client replica: local mutations, push and pull on one store.

use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use nested_enum_utils::common_fields;
use parking_lot::Mutex;
use serde_json::Value;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use syncstore_base::Hash;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    config::Config,
    dag::{self, DagError, Readable},
    db::{
        self, DbError, FormatVersion, IndexDefinition, Meta, ReadSnapshot,
        base_snapshot_from_commit, commit_from_hash, read_commit_for_head,
    },
    persist::{
        Client, PersistError, get_client, get_client_group, init_client_v4, init_client_v5,
        set_client, set_client_group, update_heartbeat,
    },
    recovery::{MutationRecovery, RecoveryOptions, RecoveryTarget},
    sync::{
        ClientGroupId, ClientId, DiffComputationConfig, DiffsMap, ErrorResponse, Heads,
        HttpRequestInfo, MissingMainHeadSnafu, MutatorSnafu, PullError, PullResponseV0,
        PullResponseV1, Puller, PushError, PushParams, Pusher, PusherResult, SyncError,
        UnknownMutatorSnafu, begin_pull_v0, begin_pull_v1, maybe_end_pull, new_client_id,
        new_request_id,
        push::{PUSH_VERSION_DD31, PUSH_VERSION_SDD},
        rebase_mutation,
    },
    transaction::{MutatorRegistry, WriteTransaction},
};

/// Errors of replica operations.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ReplicaError {
    #[snafu(transparent)]
    Sync { source: SyncError },
    #[snafu(transparent)]
    Persist { source: PersistError },
    #[snafu(transparent)]
    Pull { source: PullError },
    #[snafu(transparent)]
    Push { source: PushError },
    #[snafu(display("A pull is already in progress"))]
    PullInProgress {},
}

impl From<DbError> for ReplicaError {
    fn from(source: DbError) -> Self {
        SyncError::from(source).into()
    }
}

impl From<DagError> for ReplicaError {
    fn from(source: DagError) -> Self {
        SyncError::from(source).into()
    }
}

/// Result of [`Replica::pull`].
#[derive(Debug, Clone, PartialEq)]
pub struct PullOutcome {
    /// Status of the pull request.
    pub http_request_info: HttpRequestInfo,
    /// The server's error response, if it sent one.
    pub error: Option<ErrorResponse>,
    /// Whether main moved to a new snapshot.
    pub synced: bool,
    /// What changed on main, empty unless `synced`.
    pub diffs: DiffsMap,
}

#[derive(Debug, Default)]
struct ReplicaState {
    request_count: u64,
    pulling: bool,
}

/// Clears the pulling flag when a pull ends, however it ends.
struct PullGuard<'a>(&'a Mutex<ReplicaState>);

impl Drop for PullGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().pulling = false;
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Builder for [`Replica`].
#[derive(derive_more::Debug)]
pub struct Builder {
    config: Config,
    store: Option<dag::Store>,
    mutators: MutatorRegistry,
    indexes: Vec<IndexDefinition>,
    #[debug("Puller")]
    puller: Arc<dyn Puller>,
    #[debug("Pusher")]
    pusher: Arc<dyn Pusher>,
}

impl Builder {
    /// Uses an already opened store instead of opening the configured one.
    pub fn store(mut self, store: dag::Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the mutators [`Replica::mutate`] can run.
    ///
    /// With the current format, clients only share a client group when
    /// their mutator names match.
    pub fn mutators(mut self, mutators: MutatorRegistry) -> Self {
        self.mutators = mutators;
        self
    }

    /// Adds an index definition.
    pub fn index(mut self, definition: IndexDefinition) -> Self {
        self.indexes.push(definition);
        self
    }

    /// Opens the store and registers a new client in it.
    ///
    /// With the current format the client joins a client group with the
    /// same mutators and indexes, or starts a new one. The client's main
    /// head starts at the state of its client (group) record. Other clients
    /// of the store never move it.
    #[instrument(skip_all, fields(name = %self.config.name))]
    pub fn open(self) -> Result<Replica, ReplicaError> {
        let store = match self.store {
            Some(store) => store,
            None => dag::Store::open(&self.config)?,
        };
        let (client_id, client_group_id, head) = match self.config.format_version {
            FormatVersion::Dd31 => {
                let names: BTreeSet<String> = self.mutators.names().map(String::from).collect();
                let res = init_client_v5(&store, &names, &self.indexes, now_ms())?;
                (
                    res.client_id,
                    Some(res.client.client_group_id),
                    res.client.head_hash,
                )
            }
            FormatVersion::Sdd => {
                let res = init_client_v4(&store, &self.indexes, now_ms())?;
                (res.client_id, None, res.client.head_hash)
            }
        };
        let heads = Heads::for_client(&client_id);
        let mut write = store.write()?;
        write.set_head(&heads.main, head)?;
        write.commit()?;
        debug!(%client_id, ?client_group_id, head = %head.fmt_short(), "replica opened");
        Ok(Replica {
            config: self.config,
            store,
            heads,
            client_id,
            client_group_id,
            session_id: new_client_id(),
            mutators: self.mutators,
            puller: self.puller,
            pusher: self.pusher,
            state: Mutex::new(ReplicaState::default()),
        })
    }
}

/// A client of a store: runs mutators locally and syncs with the server.
#[derive(derive_more::Debug)]
pub struct Replica {
    config: Config,
    store: dag::Store,
    heads: Heads,
    client_id: ClientId,
    client_group_id: Option<ClientGroupId>,
    session_id: String,
    mutators: MutatorRegistry,
    #[debug("Puller")]
    puller: Arc<dyn Puller>,
    #[debug("Pusher")]
    pusher: Arc<dyn Pusher>,
    state: Mutex<ReplicaState>,
}

impl Replica {
    /// Starts building a replica for `config`, syncing through `puller`
    /// and `pusher`.
    pub fn builder(config: Config, puller: Arc<dyn Puller>, pusher: Arc<dyn Pusher>) -> Builder {
        Builder {
            config,
            store: None,
            mutators: MutatorRegistry::default(),
            indexes: Vec::new(),
            puller,
            pusher,
        }
    }

    /// The id of this client, new for every opened replica.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The client group, `None` for a store of the single client format.
    pub fn client_group_id(&self) -> Option<&str> {
        self.client_group_id.as_deref()
    }

    /// The store, possibly shared with other replicas.
    pub fn store(&self) -> &dag::Store {
        &self.store
    }

    /// The heads this replica keeps its state under.
    pub fn heads(&self) -> &Heads {
        &self.heads
    }

    /// The configuration the replica was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn next_request_id(&self) -> String {
        let mut state = self.state.lock();
        let count = state.request_count;
        state.request_count += 1;
        new_request_id(&self.client_id, &self.session_id, count)
    }

    /// Runs the mutator `name` on top of main and commits the result.
    ///
    /// A failing mutator leaves main untouched.
    #[instrument(skip(self, args), fields(client_id = %self.client_id))]
    pub fn mutate(&self, name: &str, args: Value) -> Result<Hash, ReplicaError> {
        let mutator = self
            .mutators
            .get(name)
            .cloned()
            .context(UnknownMutatorSnafu { name })?;
        let mut dag_write = self.store.write()?;
        let main = dag_write
            .get_head(&self.heads.main)?
            .context(MissingMainHeadSnafu)?;
        let mut write = db::Write::new_local(
            main,
            name,
            args.clone(),
            None,
            &mut dag_write,
            now_ms(),
            &self.client_id,
            self.config.format_version,
        )?;
        let mutation_id = write
            .meta()
            .local_parts()
            .map(|parts| parts.mutation_id)
            .unwrap_or_default();
        {
            let environment = self.config.environment;
            let mut tx = WriteTransaction::new(
                &mut write,
                environment,
                environment.initial_reason(),
                mutation_id,
                &self.client_id,
            );
            mutator
                .mutate(&mut tx, &args)
                .context(MutatorSnafu { name })?;
        }
        let head = write.commit(&self.heads.main)?;
        self.record_head(&mut dag_write, head)?;
        dag_write.commit()?;
        Ok(head)
    }

    /// Keeps the client (group) record in step with main.
    fn record_head(&self, dag_write: &mut dag::Write, head: Hash) -> Result<(), ReplicaError> {
        let commit = commit_from_hash(&head, &*dag_write)?;
        let mutation_id = commit.mutation_id(&self.client_id, &*dag_write)?;
        let base = base_snapshot_from_commit(commit, &*dag_write)?;
        match &self.client_group_id {
            Some(client_group_id) => {
                let Some(mut group) = get_client_group(client_group_id, &*dag_write)? else {
                    warn!(%client_group_id, "client group is gone");
                    return Ok(());
                };
                group.head_hash = head;
                let id = group
                    .mutation_ids
                    .entry(self.client_id.clone())
                    .or_insert(0);
                *id = (*id).max(mutation_id);
                if let Meta::SnapshotDd31(meta) = base.meta() {
                    for (client_id, &acked) in &meta.last_mutation_ids {
                        let id = group
                            .last_server_ackd_mutation_ids
                            .entry(client_id.clone())
                            .or_insert(0);
                        *id = (*id).max(acked);
                    }
                }
                set_client_group(client_group_id, group, dag_write)?;
            }
            None => {
                let Some(Client::V4(mut client)) = get_client(&self.client_id, &*dag_write)?
                else {
                    warn!(client_id = %self.client_id, "client is gone");
                    return Ok(());
                };
                let acked = base.mutation_id(&self.client_id, &*dag_write)?;
                client.head_hash = head;
                client.mutation_id = client.mutation_id.max(mutation_id);
                client.last_server_ackd_mutation_id =
                    client.last_server_ackd_mutation_id.max(acked);
                set_client(&self.client_id, client.into(), dag_write)?;
            }
        }
        Ok(())
    }

    /// Reads main.
    pub fn query<T>(&self, f: impl FnOnce(&ReadSnapshot) -> T) -> Result<T, ReplicaError> {
        let read = self.store.read()?;
        let (_, snapshot) = read_commit_for_head(&self.heads.main, &read)?;
        Ok(f(&snapshot))
    }

    /// Reads the value of `key` on main.
    pub fn get(&self, key: &str) -> Result<Option<Value>, ReplicaError> {
        self.query(|snapshot| snapshot.get(key).cloned())
    }

    /// Records that this client is alive.
    pub fn heartbeat(&self) -> Result<(), ReplicaError> {
        let mut write = self.store.write()?;
        update_heartbeat(&self.client_id, now_ms(), &mut write)?;
        write.commit()?;
        Ok(())
    }

    fn push_params(&self) -> PushParams<'_> {
        PushParams {
            profile_id: &self.config.profile_id,
            client_id: &self.client_id,
            client_group_id: self.client_group_id.as_deref().unwrap_or_default(),
            schema_version: &self.config.schema_version,
            push_version: match self.config.format_version {
                FormatVersion::Sdd => PUSH_VERSION_SDD,
                FormatVersion::Dd31 => PUSH_VERSION_DD31,
            },
        }
    }

    /// Pushes the pending local mutations. `None` when nothing is pending.
    pub async fn push(&self) -> Result<Option<PusherResult>, ReplicaError> {
        let request_id = self.next_request_id();
        let params = self.push_params();
        let pusher = self.pusher.as_ref();
        Ok(crate::sync::push(request_id, &self.store, &self.heads, pusher, &params).await?)
    }

    /// Pulls from the server and moves main to the new snapshot.
    ///
    /// Local mutations the server has not seen yet are replayed on top of
    /// the pulled snapshot before main moves.
    #[instrument(skip_all, fields(client_id = %self.client_id))]
    pub async fn pull(
        &self,
        diff_config: &DiffComputationConfig,
    ) -> Result<PullOutcome, ReplicaError> {
        let _guard = {
            let mut state = self.state.lock();
            snafu::ensure!(!state.pulling, PullInProgressSnafu);
            state.pulling = true;
            PullGuard(&self.state)
        };

        let request_id = self.next_request_id();
        let (http_request_info, error, sync_head) = match self.config.format_version {
            FormatVersion::Sdd => {
                let res = begin_pull_v0(
                    &self.config.profile_id,
                    &self.client_id,
                    &self.config.schema_version,
                    self.puller.as_ref(),
                    request_id,
                    &self.store,
                    &self.heads,
                    true,
                )
                .await?;
                let error = match res.pull_response {
                    Some(PullResponseV0::Error(err)) => Some(err),
                    _ => None,
                };
                (res.http_request_info, error, res.sync_head)
            }
            FormatVersion::Dd31 => {
                let res = begin_pull_v1(
                    &self.config.profile_id,
                    &self.client_id,
                    self.client_group_id.as_deref().unwrap_or_default(),
                    &self.config.schema_version,
                    self.puller.as_ref(),
                    request_id,
                    &self.store,
                    &self.heads,
                    true,
                )
                .await?;
                let error = match res.pull_response {
                    Some(PullResponseV1::Error(err)) => Some(err),
                    _ => None,
                };
                (res.http_request_info, error, res.sync_head)
            }
        };
        if let Some(err) = &error {
            warn!(error = %err.error, "pull returned an error response");
        }
        let Some(mut sync_head) = sync_head else {
            return Ok(PullOutcome {
                http_request_info,
                error,
                synced: false,
                diffs: DiffsMap::default(),
            });
        };

        loop {
            let end = maybe_end_pull(
                &self.store,
                &self.heads,
                sync_head,
                &self.client_id,
                diff_config,
            )?;
            if end.replay_mutations.is_empty() {
                let mut write = self.store.write()?;
                self.record_head(&mut write, end.sync_head)?;
                write.commit()?;
                return Ok(PullOutcome {
                    http_request_info,
                    error,
                    synced: true,
                    diffs: end.diffs,
                });
            }
            debug!(count = end.replay_mutations.len(), "replaying mutations");
            let mut write = self.store.write()?;
            for mutation in &end.replay_mutations {
                sync_head = rebase_mutation(
                    mutation,
                    &mut write,
                    sync_head,
                    &self.heads.sync,
                    &self.mutators,
                    self.config.environment,
                    &self.client_id,
                    self.config.format_version,
                )?;
            }
            write.commit()?;
        }
    }

    /// A recovery task for the mutations other clients of this store left
    /// behind, skipping this client and its group.
    pub fn mutation_recovery(&self, cancel: CancellationToken) -> MutationRecovery {
        MutationRecovery::new(
            RecoveryOptions {
                profile_id: self.config.profile_id.clone(),
                client_id: self.client_id.clone(),
                client_group_id: self.client_group_id.clone(),
                pull_enabled: self.config.recovery_pull_enabled,
            },
            self.puller.clone(),
            self.pusher.clone(),
            cancel,
        )
    }

    /// This replica's own store as a recovery target.
    pub fn recovery_target(&self) -> RecoveryTarget {
        RecoveryTarget {
            name: self.config.name.clone(),
            store: self.store.clone(),
            schema_version: self.config.schema_version.clone(),
            format_version: self.config.format_version,
        }
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        // The client (group) record keeps the state alive for recovery and
        // for the next replica of the group.
        let res = self.store.write().and_then(|mut write| {
            write.remove_head(&self.heads.main)?;
            write.remove_head(&self.heads.sync)?;
            write.commit()
        });
        if let Err(err) = res {
            warn!(client_id = %self.client_id, "failed to release heads: {err}");
        }
    }
}
