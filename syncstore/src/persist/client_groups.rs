use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, ensure};
use syncstore_base::Hash;

use super::{
    ClientGroupNotFoundSnafu, EncodeSnafu, InvalidClientGroupMapSnafu,
    InvalidClientGroupUpdateSnafu, NotInClientGroupSnafu, PersistError, clients::get_client,
};
use crate::{
    dag::{self, Readable},
    db::IndexDefinition,
    sync::{ClientGroupId, ClientId},
};

/// Name of the head the client group map is stored under.
pub const CLIENT_GROUPS_HEAD_NAME: &str = "client-groups";

/// Clients sharing one commit chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientGroup {
    /// Latest commit of the group.
    pub head_hash: Hash,
    /// Mutators the group's clients run. Fixed for the lifetime of the group.
    pub mutator_names: Vec<String>,
    /// Fixed for the lifetime of the group.
    pub indexes: Vec<IndexDefinition>,
    /// Highest mutation id per client of the group.
    #[serde(rename = "mutationIDs")]
    pub mutation_ids: BTreeMap<ClientId, u64>,
    /// Highest mutation id per client the server has confirmed.
    #[serde(rename = "lastServerAckdMutationIDs")]
    pub last_server_ackd_mutation_ids: BTreeMap<ClientId, u64>,
    /// A disabled group is never joined; the server no longer knows it.
    #[serde(default)]
    pub disabled: bool,
}

impl ClientGroup {
    /// Whether some client has mutations the server has not confirmed yet.
    pub fn has_pending_mutations(&self) -> bool {
        self.mutation_ids.iter().any(|(client_id, &id)| {
            id > self
                .last_server_ackd_mutation_ids
                .get(client_id)
                .copied()
                .unwrap_or(0)
        })
    }
}

/// Every known client group, by id.
pub type ClientGroupMap = BTreeMap<ClientGroupId, ClientGroup>;

/// Loads every client group.
pub fn get_client_groups(read: &(impl Readable + ?Sized)) -> Result<ClientGroupMap, PersistError> {
    let Some(hash) = read.get_head(CLIENT_GROUPS_HEAD_NAME)? else {
        return Ok(ClientGroupMap::new());
    };
    let chunk = read.must_get_chunk(&hash)?;
    serde_json::from_value(chunk.into_data()).context(InvalidClientGroupMapSnafu)
}

fn validate_update(
    client_group_id: &str,
    old: &ClientGroup,
    new: &ClientGroup,
) -> Result<(), PersistError> {
    let invalid = |message| InvalidClientGroupUpdateSnafu {
        client_group_id,
        message,
    };
    let names = |g: &ClientGroup| g.mutator_names.iter().cloned().collect::<BTreeSet<_>>();
    ensure!(names(old) == names(new), invalid("mutator names cannot change"));
    ensure!(old.indexes == new.indexes, invalid("indexes cannot change"));
    for (client_id, &id) in &old.mutation_ids {
        ensure!(
            new.mutation_ids.get(client_id).copied().unwrap_or(0) >= id,
            invalid("mutation ids cannot go backward")
        );
    }
    for (client_id, &id) in &old.last_server_ackd_mutation_ids {
        ensure!(
            new.last_server_ackd_mutation_ids
                .get(client_id)
                .copied()
                .unwrap_or(0)
                >= id,
            invalid("last server acknowledged mutation ids cannot go backward")
        );
    }
    Ok(())
}

/// Replaces the client group map.
///
/// Existing groups may only move forward: their mutator names and indexes
/// are fixed, and mutation ids never decrease.
pub fn set_client_groups(
    groups: &ClientGroupMap,
    write: &mut dag::Write,
) -> Result<Hash, PersistError> {
    let old = get_client_groups(&*write)?;
    for (client_group_id, group) in groups {
        if let Some(old) = old.get(client_group_id) {
            validate_update(client_group_id, old, group)?;
        }
    }
    let data = serde_json::to_value(groups).context(EncodeSnafu {
        what: "client group map",
    })?;
    let refs = groups.values().map(|g| g.head_hash).collect();
    let chunk = write.create_chunk(data, refs);
    write.put_chunk(&chunk)?;
    write.set_head(CLIENT_GROUPS_HEAD_NAME, chunk.hash())?;
    Ok(chunk.hash())
}

/// Loads the client group `client_group_id`.
pub fn get_client_group(
    client_group_id: &str,
    read: &(impl Readable + ?Sized),
) -> Result<Option<ClientGroup>, PersistError> {
    Ok(get_client_groups(read)?.remove(client_group_id))
}

/// Adds or replaces a single client group.
pub fn set_client_group(
    client_group_id: &str,
    group: ClientGroup,
    write: &mut dag::Write,
) -> Result<Hash, PersistError> {
    let mut groups = get_client_groups(&*write)?;
    groups.insert(client_group_id.to_string(), group);
    set_client_groups(&groups, write)
}

/// Marks a group as unusable for new clients.
pub fn disable_client_group(
    client_group_id: &str,
    write: &mut dag::Write,
) -> Result<(), PersistError> {
    let mut group = get_client_group(client_group_id, &*write)?
        .context(ClientGroupNotFoundSnafu { client_group_id })?;
    group.disabled = true;
    set_client_group(client_group_id, group, write)?;
    Ok(())
}

/// The group of `client_id`, if the group still exists.
///
/// Fails when the client is unknown or does not belong to a group.
pub fn get_client_group_for_client(
    client_id: &str,
    read: &(impl Readable + ?Sized),
) -> Result<Option<ClientGroup>, PersistError> {
    let client = get_client(client_id, read)?;
    let client = client.context(super::ClientNotFoundSnafu { client_id })?;
    let client_group_id = client
        .client_group_id()
        .context(NotInClientGroupSnafu { client_id })?;
    get_client_group(client_group_id, read)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        kv,
        persist::{ClientV5, set_client},
    };

    fn store() -> dag::Store {
        dag::Store::new(kv::Store::in_memory().unwrap())
    }

    fn group(head: &str) -> ClientGroup {
        ClientGroup {
            head_hash: Hash::fake(head),
            mutator_names: vec!["m".into()],
            indexes: vec![],
            mutation_ids: [("c1".to_string(), 2)].into(),
            last_server_ackd_mutation_ids: [("c1".to_string(), 1)].into(),
            disabled: false,
        }
    }

    #[test]
    fn groups_ref_their_heads() {
        let store = store();
        let mut groups = ClientGroupMap::new();
        groups.insert("g1".into(), group("h1"));
        groups.insert("g2".into(), group("h2"));
        let mut write = store.write().unwrap();
        let hash = set_client_groups(&groups, &mut write).unwrap();
        write.commit().unwrap();

        let read = store.read().unwrap();
        assert_eq!(
            read.must_get_chunk(&hash).unwrap().refs(),
            &[Hash::fake("h1"), Hash::fake("h2")]
        );
        assert_eq!(get_client_groups(&read).unwrap(), groups);
        assert!(groups["g1"].has_pending_mutations());
    }

    #[test]
    fn updates_only_move_forward() {
        let store = store();
        let mut write = store.write().unwrap();
        set_client_group("g", group("h"), &mut write).unwrap();

        let mut next = group("h2");
        next.mutation_ids.insert("c1".into(), 3);
        next.last_server_ackd_mutation_ids.insert("c1".into(), 3);
        set_client_group("g", next.clone(), &mut write).unwrap();
        assert!(!next.has_pending_mutations());

        let mut back = next.clone();
        back.mutation_ids.insert("c1".into(), 1);
        let err = set_client_group("g", back, &mut write).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid update of client group g: mutation ids cannot go backward"
        );

        let mut renamed = next.clone();
        renamed.mutator_names.push("other".into());
        assert!(set_client_group("g", renamed, &mut write).is_err());

        let mut acked_back = next;
        acked_back.last_server_ackd_mutation_ids.clear();
        assert!(set_client_group("g", acked_back, &mut write).is_err());
    }

    #[test]
    fn group_for_client() {
        let store = store();
        let mut write = store.write().unwrap();
        set_client_group("g", group("h"), &mut write).unwrap();
        let client = |group: &str| ClientV5 {
            heartbeat_timestamp_ms: 0,
            head_hash: Hash::fake("h"),
            client_group_id: group.into(),
            temp_refresh_hash: None,
        };
        set_client("c1", client("g").into(), &mut write).unwrap();
        set_client("c2", client("gone").into(), &mut write).unwrap();

        assert_eq!(
            get_client_group_for_client("c1", &write).unwrap(),
            Some(group("h"))
        );
        assert_eq!(get_client_group_for_client("c2", &write).unwrap(), None);
        assert!(matches!(
            get_client_group_for_client("c3", &write),
            Err(PersistError::ClientNotFound { .. })
        ));
    }

    #[test]
    fn disable() {
        let store = store();
        let mut write = store.write().unwrap();
        set_client_group("g", group("h"), &mut write).unwrap();
        disable_client_group("g", &mut write).unwrap();
        assert!(get_client_group("g", &write).unwrap().unwrap().disabled);
        assert!(matches!(
            disable_client_group("nope", &mut write),
            Err(PersistError::ClientGroupNotFound { .. })
        ));
    }
}
