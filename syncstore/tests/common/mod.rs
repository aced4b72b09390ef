#![allow(dead_code)]

use std::{collections::VecDeque, sync::Arc};

use n0_future::boxed::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Value, json};
use syncstore::{
    sync::{
        HttpRequestInfo, PullRequest, Puller, PullerResult, PushRequest, Pusher, PusherResult,
        TransportError,
    },
    transaction::{MutatorError, MutatorRegistry, WriteTransaction},
};
use tokio_util::sync::CancellationToken;

pub fn ok_info() -> HttpRequestInfo {
    HttpRequestInfo {
        http_status_code: 200,
        error_message: String::new(),
    }
}

/// Answers pulls with queued responses and records the requests.
#[derive(Debug, Default)]
pub struct FakePuller {
    responses: Mutex<VecDeque<Value>>,
    pub requests: Mutex<Vec<PullRequest>>,
}

impl FakePuller {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn respond(&self, response: Value) {
        self.responses.lock().push_back(response);
    }

    pub fn requests_json(&self) -> Vec<Value> {
        self.requests
            .lock()
            .iter()
            .map(|r| serde_json::to_value(r).unwrap())
            .collect()
    }
}

impl Puller for FakePuller {
    fn pull(
        &self,
        request: PullRequest,
        _request_id: String,
    ) -> BoxFuture<Result<PullerResult, TransportError>> {
        self.requests.lock().push(request);
        let next = self.responses.lock().pop_front();
        Box::pin(async move {
            match next {
                Some(response) => Ok(PullerResult {
                    http_request_info: ok_info(),
                    response: Some(response),
                }),
                None => Err(TransportError::from_err(
                    "fake",
                    std::io::Error::other("no response queued"),
                )),
            }
        })
    }
}

/// Accepts pushes and records them. Pushes for `fail_for` client or client
/// group ids fail. The first push cancels `cancel_on_push`.
#[derive(Debug, Default)]
pub struct FakePusher {
    pub requests: Mutex<Vec<PushRequest>>,
    pub fail_for: Mutex<Vec<String>>,
    pub cancel_on_push: Mutex<Option<CancellationToken>>,
}

impl FakePusher {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn requests_json(&self) -> Vec<Value> {
        self.requests
            .lock()
            .iter()
            .map(|r| serde_json::to_value(r).unwrap())
            .collect()
    }
}

impl Pusher for FakePusher {
    fn push(
        &self,
        request: PushRequest,
        _request_id: String,
    ) -> BoxFuture<Result<PusherResult, TransportError>> {
        let owner = match &request {
            PushRequest::V0(r) => r.client_id.clone(),
            PushRequest::V1(r) => r.client_group_id.clone(),
        };
        self.requests.lock().push(request);
        if let Some(cancel) = self.cancel_on_push.lock().take() {
            cancel.cancel();
        }
        let fail = self.fail_for.lock().contains(&owner);
        Box::pin(async move {
            if fail {
                Err(TransportError::from_err(
                    "fake",
                    std::io::Error::other("test error in push"),
                ))
            } else {
                Ok(PusherResult {
                    http_request_info: ok_info(),
                    response: None,
                })
            }
        })
    }
}

fn put(tx: &mut WriteTransaction<'_, '_>, args: &Value) -> Result<(), MutatorError> {
    let key = args["key"].as_str().ok_or("missing key")?;
    tx.set(key, args["value"].clone());
    Ok(())
}

fn del(tx: &mut WriteTransaction<'_, '_>, args: &Value) -> Result<(), MutatorError> {
    let key = args["key"].as_str().ok_or("missing key")?;
    tx.del(key);
    Ok(())
}

/// `put {key, value}`, plus `del {key}` when `with_del` is set.
pub fn mutators(with_del: bool) -> MutatorRegistry {
    let mut registry = MutatorRegistry::new();
    registry.register("put", put);
    if with_del {
        registry.register("del", del);
    }
    registry
}

pub fn put_args(key: &str, value: Value) -> Value {
    json!({"key": key, "value": value})
}
