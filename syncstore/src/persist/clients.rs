use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};
use syncstore_base::Hash;
use tracing::{debug, instrument};

use super::{
    ClientNotFoundSnafu, EncodeSnafu, InvalidClientMapSnafu, PersistError,
    client_groups::{ClientGroup, get_client_groups, set_client_group},
};
use crate::{
    dag::{self, Readable},
    db::{
        Commit, CommitData, IndexDefinition, IndexRecord, Meta, SnapshotMetaDd31,
        SnapshotMetaSdd, ValueMap, base_snapshot_from_hash, create_index_map,
    },
    sync::{ClientGroupId, ClientId, Cookie, compare_cookies, new_client_group_id, new_client_id},
};

/// Name of the head the client map is stored under.
pub const CLIENTS_HEAD_NAME: &str = "clients";

/// A client of the single client format. It owns its commit chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientV4 {
    /// When the client was last seen alive, in Unix milliseconds.
    pub heartbeat_timestamp_ms: u64,
    /// The head of the client's commit chain.
    pub head_hash: Hash,
    /// The id of the client's last local mutation.
    #[serde(rename = "mutationID")]
    pub mutation_id: u64,
    /// The last mutation id the server confirmed.
    #[serde(rename = "lastServerAckdMutationID")]
    pub last_server_ackd_mutation_id: u64,
}

/// A client that belongs to a client group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientV5 {
    /// When the client was last seen alive, in Unix milliseconds.
    pub heartbeat_timestamp_ms: u64,
    /// The snapshot the client started from.
    pub head_hash: Hash,
    /// The group the client belongs to.
    #[serde(rename = "clientGroupID")]
    pub client_group_id: ClientGroupId,
    /// Head of a refresh in progress, kept alive while the refresh runs.
    pub temp_refresh_hash: Option<Hash>,
}

/// A persisted client record, of either format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::From)]
#[serde(untagged)]
pub enum Client {
    /// A client of a client group.
    V5(ClientV5),
    /// A client of the single client format.
    V4(ClientV4),
}

impl Client {
    /// The head the record keeps alive.
    pub fn head_hash(&self) -> Hash {
        match self {
            Client::V4(c) => c.head_hash,
            Client::V5(c) => c.head_hash,
        }
    }

    /// When the client was last seen alive.
    pub fn heartbeat_timestamp_ms(&self) -> u64 {
        match self {
            Client::V4(c) => c.heartbeat_timestamp_ms,
            Client::V5(c) => c.heartbeat_timestamp_ms,
        }
    }

    /// The group of a client of the newer format.
    pub fn client_group_id(&self) -> Option<&str> {
        match self {
            Client::V4(_) => None,
            Client::V5(c) => Some(&c.client_group_id),
        }
    }

    fn set_heartbeat_timestamp_ms(&mut self, now_ms: u64) {
        match self {
            Client::V4(c) => c.heartbeat_timestamp_ms = now_ms,
            Client::V5(c) => c.heartbeat_timestamp_ms = now_ms,
        }
    }

    /// Chunks the record keeps alive.
    fn refs(&self) -> impl Iterator<Item = Hash> + use<> {
        let temp_refresh = match self {
            Client::V4(_) => None,
            Client::V5(c) => c.temp_refresh_hash,
        };
        std::iter::once(self.head_hash()).chain(temp_refresh)
    }
}

/// Every known client, by id.
pub type ClientMap = BTreeMap<ClientId, Client>;

/// Reads the client map. A store without one has no clients.
pub fn get_clients(read: &(impl Readable + ?Sized)) -> Result<ClientMap, PersistError> {
    let Some(hash) = read.get_head(CLIENTS_HEAD_NAME)? else {
        return Ok(ClientMap::new());
    };
    let chunk = read.must_get_chunk(&hash)?;
    serde_json::from_value(chunk.into_data()).context(InvalidClientMapSnafu)
}

/// Replaces the client map.
pub fn set_clients(clients: &ClientMap, write: &mut dag::Write) -> Result<Hash, PersistError> {
    let data = serde_json::to_value(clients).context(EncodeSnafu { what: "client map" })?;
    let refs = clients.values().flat_map(Client::refs).collect();
    let chunk = write.create_chunk(data, refs);
    write.put_chunk(&chunk)?;
    write.set_head(CLIENTS_HEAD_NAME, chunk.hash())?;
    Ok(chunk.hash())
}

/// Loads the record of `client_id`.
pub fn get_client(
    client_id: &str,
    read: &(impl Readable + ?Sized),
) -> Result<Option<Client>, PersistError> {
    Ok(get_clients(read)?.remove(client_id))
}

/// Adds or replaces a single client record.
pub fn set_client(
    client_id: &str,
    client: Client,
    write: &mut dag::Write,
) -> Result<Hash, PersistError> {
    let mut clients = get_clients(&*write)?;
    clients.insert(client_id.to_string(), client);
    set_clients(&clients, write)
}

/// Records that `client_id` is still alive.
pub fn update_heartbeat(
    client_id: &str,
    now_ms: u64,
    write: &mut dag::Write,
) -> Result<ClientMap, PersistError> {
    let mut clients = get_clients(&*write)?;
    let client = clients
        .get_mut(client_id)
        .context(ClientNotFoundSnafu { client_id })?;
    client.set_heartbeat_timestamp_ms(now_ms);
    set_clients(&clients, write)?;
    Ok(clients)
}

/// How a new client should get its initial state.
#[derive(Debug, Clone, PartialEq)]
pub enum FindMatchingClientResult {
    /// There is nothing to start from.
    New,
    /// An existing group is compatible and can be joined.
    Head {
        /// The group to join.
        client_group_id: ClientGroupId,
        /// The group's current head.
        head_hash: Hash,
    },
    /// No group is compatible; a new group starts from this snapshot, the
    /// newest one among the existing groups.
    Fork {
        /// The snapshot to start from.
        snapshot: Commit,
    },
}

fn index_definitions_equal(a: &[IndexDefinition], b: &[IndexDefinition]) -> bool {
    let by_name = |defs: &[IndexDefinition]| {
        defs.iter()
            .map(|d| (d.name.clone(), d.clone()))
            .collect::<BTreeMap<_, _>>()
    };
    by_name(a) == by_name(b)
}

/// Finds a client group compatible with `mutator_names` and `indexes`.
///
/// A group is compatible when it is enabled and has the same mutator names
/// and index definitions.
pub fn find_matching_client(
    read: &(impl Readable + ?Sized),
    mutator_names: &BTreeSet<String>,
    indexes: &[IndexDefinition],
) -> Result<FindMatchingClientResult, PersistError> {
    let groups = get_client_groups(read)?;
    for (client_group_id, group) in &groups {
        let names: BTreeSet<&str> = group.mutator_names.iter().map(String::as_str).collect();
        let wanted: BTreeSet<&str> = mutator_names.iter().map(String::as_str).collect();
        if !group.disabled && names == wanted && index_definitions_equal(indexes, &group.indexes) {
            return Ok(FindMatchingClientResult::Head {
                client_group_id: client_group_id.clone(),
                head_hash: group.head_hash,
            });
        }
    }

    let mut newest: Option<Commit> = None;
    for group in groups.values() {
        let snapshot = base_snapshot_from_hash(&group.head_hash, read)?;
        let is_newer = match &newest {
            None => true,
            Some(current) => compare_cookies(
                snapshot.meta().cookie().unwrap_or(&Cookie::NULL),
                current.meta().cookie().unwrap_or(&Cookie::NULL),
            )?
            .is_gt(),
        };
        if is_newer {
            newest = Some(snapshot);
        }
    }
    Ok(match newest {
        Some(snapshot) => FindMatchingClientResult::Fork { snapshot },
        None => FindMatchingClientResult::New,
    })
}

/// The client created by [`init_client_v5`] or [`init_client_v4`].
#[derive(Debug, Clone, PartialEq)]
pub struct InitClientResult<C> {
    /// The id of the new client.
    pub client_id: ClientId,
    /// The new client record.
    pub client: C,
    /// The client map including the new client.
    pub clients: ClientMap,
    /// Whether a new client group was created for the client.
    pub created_client_group: bool,
}

fn put_snapshot(write: &mut dag::Write, data: CommitData) -> Result<Hash, PersistError> {
    let chunk = data.to_chunk(&*write)?;
    write.put_chunk(&chunk)?;
    Ok(chunk.hash())
}

fn empty_indexes(
    write: &mut dag::Write,
    indexes: &[IndexDefinition],
) -> Result<(Hash, Vec<IndexRecord>), PersistError> {
    let empty = ValueMap::new().flush(write)?;
    let records = indexes
        .iter()
        .map(|definition| IndexRecord {
            definition: definition.clone(),
            value_hash: empty,
        })
        .collect();
    Ok((empty, records))
}

/// Creates a client of a client group.
///
/// The client joins a compatible group if there is one. Otherwise a new
/// group is created, starting from the newest snapshot of the existing
/// groups or from an empty snapshot when there are none. Index maps of the
/// forked snapshot are reused when their definitions only differ by name.
#[instrument(skip_all, fields(mutators = mutator_names.len(), indexes = indexes.len()))]
pub fn init_client_v5(
    store: &dag::Store,
    mutator_names: &BTreeSet<String>,
    indexes: &[IndexDefinition],
    now_ms: u64,
) -> Result<InitClientResult<ClientV5>, PersistError> {
    let client_id = new_client_id();
    let mut write = store.write()?;
    let mut clients = get_clients(&write)?;

    let (basis_hash, cookie, value_hash, index_records) =
        match find_matching_client(&write, mutator_names, indexes)? {
            FindMatchingClientResult::Head {
                client_group_id,
                head_hash,
            } => {
                debug!(%client_group_id, "joining existing client group");
                let client = ClientV5 {
                    heartbeat_timestamp_ms: now_ms,
                    head_hash,
                    client_group_id,
                    temp_refresh_hash: None,
                };
                clients.insert(client_id.clone(), client.clone().into());
                set_clients(&clients, &mut write)?;
                write.commit()?;
                return Ok(InitClientResult {
                    client_id,
                    client,
                    clients,
                    created_client_group: false,
                });
            }
            FindMatchingClientResult::New => {
                let (empty, records) = empty_indexes(&mut write, indexes)?;
                (None, Cookie::NULL, empty, records)
            }
            FindMatchingClientResult::Fork { snapshot } => {
                debug!(snapshot = %snapshot.hash().fmt_short(), "forking client group");
                let map = ValueMap::load(&snapshot.value_hash(), &write)?;
                let mut records = Vec::with_capacity(indexes.len());
                for definition in indexes {
                    let reusable = snapshot.indexes().iter().find(|old| {
                        old.definition.key_prefix == definition.key_prefix
                            && old.definition.json_pointer == definition.json_pointer
                            && old.definition.allow_empty == definition.allow_empty
                    });
                    let value_hash = match reusable {
                        Some(old) => old.value_hash,
                        None => create_index_map(definition, &map).flush(&mut write)?,
                    };
                    records.push(IndexRecord {
                        definition: definition.clone(),
                        value_hash,
                    });
                }
                let cookie = snapshot.meta().cookie().cloned().unwrap_or_default();
                (snapshot.meta().basis_hash(), cookie, snapshot.value_hash(), records)
            }
        };

    let head_hash = put_snapshot(
        &mut write,
        CommitData {
            meta: Meta::SnapshotDd31(SnapshotMetaDd31 {
                basis_hash,
                last_mutation_ids: BTreeMap::new(),
                cookie,
            }),
            value_hash,
            indexes: index_records,
        },
    )?;
    let client_group_id = new_client_group_id();
    let client = ClientV5 {
        heartbeat_timestamp_ms: now_ms,
        head_hash,
        client_group_id: client_group_id.clone(),
        temp_refresh_hash: None,
    };
    clients.insert(client_id.clone(), client.clone().into());
    set_clients(&clients, &mut write)?;
    set_client_group(
        &client_group_id,
        ClientGroup {
            head_hash,
            mutator_names: mutator_names.iter().cloned().collect(),
            indexes: indexes.to_vec(),
            mutation_ids: BTreeMap::new(),
            last_server_ackd_mutation_ids: BTreeMap::new(),
            disabled: false,
        },
        &mut write,
    )?;
    write.commit()?;
    Ok(InitClientResult {
        client_id,
        client,
        clients,
        created_client_group: true,
    })
}

/// Creates a client of the single client format on a fresh empty snapshot.
#[instrument(skip_all)]
pub fn init_client_v4(
    store: &dag::Store,
    indexes: &[IndexDefinition],
    now_ms: u64,
) -> Result<InitClientResult<ClientV4>, PersistError> {
    let client_id = new_client_id();
    let mut write = store.write()?;
    let mut clients = get_clients(&write)?;
    let (empty, records) = empty_indexes(&mut write, indexes)?;
    let head_hash = put_snapshot(
        &mut write,
        CommitData {
            meta: Meta::SnapshotSdd(SnapshotMetaSdd {
                basis_hash: None,
                last_mutation_id: 0,
                cookie: Cookie::NULL,
            }),
            value_hash: empty,
            indexes: records,
        },
    )?;
    let client = ClientV4 {
        heartbeat_timestamp_ms: now_ms,
        head_hash,
        mutation_id: 0,
        last_server_ackd_mutation_id: 0,
    };
    clients.insert(client_id.clone(), client.clone().into());
    set_clients(&clients, &mut write)?;
    write.commit()?;
    Ok(InitClientResult {
        client_id,
        client,
        clients,
        created_client_group: false,
    })
}
