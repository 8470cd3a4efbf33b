#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use folio_chat::completion::{CompletionBackend, CompletionRequest, UpstreamError};
use folio_chat::AppConfig;
use http_body_util::BodyExt;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Backend that answers from a per-model script and records every call.
/// Models without a script entry answer with `default_answer`.
pub struct MockBackend {
    script: HashMap<String, Result<Option<String>, UpstreamError>>,
    default_answer: String,
    calls: Mutex<Vec<(String, CompletionRequest)>>,
}

impl MockBackend {
    pub fn answering(answer: &str) -> Self {
        Self {
            script: HashMap::new(),
            default_answer: answer.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with(mut self, model: &str, outcome: Result<Option<String>, UpstreamError>) -> Self {
        self.script.insert(model.to_string(), outcome);
        self
    }

    pub fn models_called(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(model, _)| model.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, req)| req.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    async fn complete(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<Option<String>, UpstreamError> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), request.clone()));
        match self.script.get(model) {
            Some(outcome) => outcome.clone(),
            None => Ok(Some(self.default_answer.clone())),
        }
    }
}

/// Defaults with flavoring disabled so answers are deterministic.
pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new("test-key");
    cfg.flavor_enabled = false;
    cfg
}

pub fn shared(backend: MockBackend) -> Arc<MockBackend> {
    Arc::new(backend)
}

pub fn chat_request(method: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri("/api/chat")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(resp: Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
