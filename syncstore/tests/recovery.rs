use pretty_assertions::assert_eq;
use serde_json::json;
use syncstore::{
    Config, Replica,
    dag::{self, Readable},
    db::FormatVersion,
    kv,
    persist::{Client, get_client, get_client_group, get_client_groups},
    recovery::RecoveryTarget,
};
use tokio_util::sync::CancellationToken;

mod common;
use common::{FakePuller, FakePusher, mutators, put_args};

fn memory_store() -> dag::Store {
    dag::Store::new(kv::Store::in_memory().unwrap())
}

fn config(format_version: FormatVersion) -> Config {
    Config {
        name: "recovery".into(),
        profile_id: "profile".into(),
        schema_version: "s1".into(),
        format_version,
        ..Default::default()
    }
}

#[tokio::test]
async fn recovers_other_client_group() -> n0_snafu::Result {
    let store = memory_store();
    let (puller, pusher) = (FakePuller::new(), FakePusher::new());
    let left_behind = Replica::builder(config(FormatVersion::Dd31), puller.clone(), pusher.clone())
        .store(store.clone())
        .mutators(mutators(false))
        .open()?;
    left_behind.mutate("put", put_args("a", json!(1)))?;
    left_behind.mutate("put", put_args("b", json!(2)))?;
    let old_client = left_behind.client_id().to_string();
    let old_group = left_behind.client_group_id().unwrap().to_string();
    drop(left_behind);

    let running = Replica::builder(config(FormatVersion::Dd31), puller.clone(), pusher.clone())
        .store(store.clone())
        .mutators(mutators(true))
        .open()?;
    assert_ne!(running.client_group_id(), Some(old_group.as_str()));

    puller.respond(json!({
        "cookie": "c1",
        "lastMutationIDChanges": {(old_client.as_str()): 2},
        "patch": [],
    }));
    let summary = running
        .mutation_recovery(CancellationToken::new())
        .recover(&[running.recovery_target()])
        .await;
    assert_eq!(summary.recovered, vec![old_group.clone()]);
    assert!(summary.failed.is_empty());
    assert!(!summary.cancelled);

    let pushed = pusher.requests_json();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0]["clientGroupID"], json!(old_group));
    assert_eq!(pushed[0]["profileID"], json!("profile"));
    assert_eq!(pushed[0]["mutations"].as_array().unwrap().len(), 2);

    let pulled = puller.requests_json();
    assert_eq!(
        pulled,
        vec![json!({
            "pullVersion": 1,
            "schemaVersion": "s1",
            "profileID": "profile",
            "cookie": null,
            "clientGroupID": old_group,
        })]
    );

    let read = store.read()?;
    let group = get_client_group(&old_group, &read)?.unwrap();
    assert_eq!(group.last_server_ackd_mutation_ids[&old_client], 2);
    assert!(!group.has_pending_mutations());

    // A second sweep finds nothing left to do.
    drop(read);
    let summary = running
        .mutation_recovery(CancellationToken::new())
        .recover(&[running.recovery_target()])
        .await;
    assert!(summary.recovered.is_empty());
    assert_eq!(pusher.requests.lock().len(), 1);
    Ok(())
}

#[tokio::test]
async fn recovers_single_format_clients() -> n0_snafu::Result {
    let store = memory_store();
    let (puller, pusher) = (FakePuller::new(), FakePusher::new());
    let left_behind = Replica::builder(config(FormatVersion::Sdd), puller.clone(), pusher.clone())
        .store(store.clone())
        .mutators(mutators(false))
        .open()?;
    for i in 0..3 {
        left_behind.mutate("put", put_args("k", json!(i)))?;
    }
    let old_client = left_behind.client_id().to_string();
    drop(left_behind);

    let running = Replica::builder(config(FormatVersion::Sdd), puller.clone(), pusher.clone())
        .store(store.clone())
        .mutators(mutators(false))
        .open()?;

    // The server only saw two of the three mutations.
    puller.respond(json!({"cookie": "c1", "lastMutationID": 2, "patch": []}));
    let summary = running
        .mutation_recovery(CancellationToken::new())
        .recover(&[running.recovery_target()])
        .await;
    assert_eq!(summary.recovered, vec![old_client.clone()]);

    let pushed = pusher.requests_json();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0]["pushVersion"], json!(0));
    assert_eq!(pushed[0]["clientID"], json!(old_client));
    let ids: Vec<_> = pushed[0]["mutations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);

    let pulled = puller.requests_json();
    assert_eq!(pulled[0]["clientID"], json!(old_client));
    assert_eq!(pulled[0]["lastMutationID"], json!(0));
    assert_eq!(pulled[0]["pullVersion"], json!(0));

    let Some(Client::V4(client)) = get_client(&old_client, &store.read()?)? else {
        panic!("expected a single format client");
    };
    assert_eq!(client.mutation_id, 3);
    assert_eq!(client.last_server_ackd_mutation_id, 2);
    Ok(())
}

#[tokio::test]
async fn pull_disabled_only_pushes() -> n0_snafu::Result {
    let store = memory_store();
    let (puller, pusher) = (FakePuller::new(), FakePusher::new());
    let left_behind = Replica::builder(config(FormatVersion::Dd31), puller.clone(), pusher.clone())
        .store(store.clone())
        .mutators(mutators(false))
        .open()?;
    left_behind.mutate("put", put_args("a", json!(1)))?;
    drop(left_behind);

    let no_pull = Config {
        recovery_pull_enabled: false,
        ..config(FormatVersion::Dd31)
    };
    let running = Replica::builder(no_pull, puller.clone(), pusher.clone())
        .store(store.clone())
        .mutators(mutators(true))
        .open()?;
    let before = get_client_groups(&store.read()?)?;
    let summary = running
        .mutation_recovery(CancellationToken::new())
        .recover(&[running.recovery_target()])
        .await;
    assert!(summary.recovered.is_empty());
    assert_eq!(pusher.requests.lock().len(), 1);
    assert!(puller.requests.lock().is_empty());
    assert_eq!(get_client_groups(&store.read()?)?, before);
    Ok(())
}

#[tokio::test]
async fn failures_are_skipped() -> n0_snafu::Result {
    let (puller, pusher) = (FakePuller::new(), FakePusher::new());
    let mut targets = Vec::new();
    let mut clients = Vec::new();
    for name in ["one", "two", "three"] {
        let store = memory_store();
        let sdd = config(FormatVersion::Sdd);
        let left_behind = Replica::builder(sdd, puller.clone(), pusher.clone())
            .store(store.clone())
            .mutators(mutators(false))
            .open()?;
        left_behind.mutate("put", put_args(name, json!(name)))?;
        clients.push(left_behind.client_id().to_string());
        targets.push(RecoveryTarget {
            name: name.into(),
            store,
            schema_version: "s1".into(),
            format_version: FormatVersion::Sdd,
        });
    }
    pusher.fail_for.lock().push(clients[1].clone());
    puller.respond(json!({"cookie": 1, "lastMutationID": 1, "patch": []}));
    puller.respond(json!({"cookie": 1, "lastMutationID": 1, "patch": []}));

    let running = Replica::builder(config(FormatVersion::Sdd), puller.clone(), pusher.clone())
        .mutators(mutators(false))
        .open()?;
    let summary = running
        .mutation_recovery(CancellationToken::new())
        .recover(&targets)
        .await;
    assert_eq!(summary.recovered, vec![clients[0].clone(), clients[2].clone()]);
    assert_eq!(summary.failed, vec![clients[1].clone()]);
    assert_eq!(pusher.requests.lock().len(), 3);
    assert_eq!(puller.requests.lock().len(), 2);

    let Some(Client::V4(failed)) = get_client(&clients[1], &targets[1].store.read()?)? else {
        panic!("expected a single format client");
    };
    assert_eq!(failed.last_server_ackd_mutation_id, 0);
    Ok(())
}

#[tokio::test]
async fn cancelled_recovery_stops_before_next_client() -> n0_snafu::Result {
    let store = memory_store();
    let (puller, pusher) = (FakePuller::new(), FakePusher::new());
    let left_behind = Replica::builder(config(FormatVersion::Dd31), puller.clone(), pusher.clone())
        .store(store.clone())
        .mutators(mutators(false))
        .open()?;
    left_behind.mutate("put", put_args("a", json!(1)))?;
    drop(left_behind);

    let running = Replica::builder(config(FormatVersion::Dd31), puller.clone(), pusher.clone())
        .store(store)
        .mutators(mutators(true))
        .open()?;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = running
        .mutation_recovery(cancel)
        .recover(&[running.recovery_target()])
        .await;
    assert!(summary.cancelled);
    assert!(pusher.requests.lock().is_empty());
    assert!(running.store().read()?.get_head("client-groups")?.is_some());
    Ok(())
}

#[tokio::test]
async fn cancel_during_push_stops_before_next_client() -> n0_snafu::Result {
    let (puller, pusher) = (FakePuller::new(), FakePusher::new());
    let mut targets = Vec::new();
    let mut clients = Vec::new();
    for name in ["one", "two"] {
        let store = memory_store();
        let sdd = config(FormatVersion::Sdd);
        let left_behind = Replica::builder(sdd, puller.clone(), pusher.clone())
            .store(store.clone())
            .mutators(mutators(false))
            .open()?;
        left_behind.mutate("put", put_args(name, json!(name)))?;
        clients.push(left_behind.client_id().to_string());
        targets.push(RecoveryTarget {
            name: name.into(),
            store,
            schema_version: "s1".into(),
            format_version: FormatVersion::Sdd,
        });
    }
    puller.respond(json!({"cookie": 1, "lastMutationID": 1, "patch": []}));

    let running = Replica::builder(config(FormatVersion::Sdd), puller.clone(), pusher.clone())
        .mutators(mutators(false))
        .open()?;
    let cancel = CancellationToken::new();
    *pusher.cancel_on_push.lock() = Some(cancel.clone());
    let summary = running.mutation_recovery(cancel).recover(&targets).await;
    assert!(summary.cancelled);
    // The client being recovered when the token fires is finished.
    assert_eq!(summary.recovered, vec![clients[0].clone()]);
    assert!(summary.failed.is_empty());

    let pushed = pusher.requests_json();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0]["clientID"], json!(clients[0]));
    let pulled = puller.requests_json();
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0]["clientID"], json!(clients[0]));

    let Some(Client::V4(skipped)) = get_client(&clients[1], &targets[1].store.read()?)? else {
        panic!("expected a single format client");
    };
    assert_eq!(skipped.last_server_ackd_mutation_id, 0);
    Ok(())
}

#[tokio::test]
async fn cancel_during_push_skips_remaining_groups() -> n0_snafu::Result {
    let store = memory_store();
    let (puller, pusher) = (FakePuller::new(), FakePusher::new());
    for with_del in [false, true] {
        let left_behind =
            Replica::builder(config(FormatVersion::Dd31), puller.clone(), pusher.clone())
                .store(store.clone())
                .mutators(mutators(with_del))
                .open()?;
        left_behind.mutate("put", put_args("a", json!(with_del)))?;
    }
    let before = get_client_groups(&store.read()?)?;
    assert_eq!(before.len(), 2);

    puller.respond(json!({"cookie": "c1", "lastMutationIDChanges": {}, "patch": []}));

    // Recover from a replica in another store so both groups are candidates.
    let running = Replica::builder(config(FormatVersion::Dd31), puller.clone(), pusher.clone())
        .mutators(mutators(false))
        .open()?;
    let target = RecoveryTarget {
        name: "shared".into(),
        store: store.clone(),
        schema_version: "s1".into(),
        format_version: FormatVersion::Dd31,
    };
    let cancel = CancellationToken::new();
    *pusher.cancel_on_push.lock() = Some(cancel.clone());
    let summary = running.mutation_recovery(cancel).recover(&[target]).await;
    assert!(summary.cancelled);
    assert!(summary.failed.is_empty());

    let pushed = pusher.requests_json();
    assert_eq!(pushed.len(), 1);
    let first = pushed[0]["clientGroupID"].as_str().unwrap().to_string();
    let pulled = puller.requests_json();
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0]["clientGroupID"], json!(first));

    let after = get_client_groups(&store.read()?)?;
    let (skipped, group) = before.iter().find(|(id, _)| **id != first).unwrap();
    assert_eq!(after.get(skipped), Some(group));
    Ok(())
}
