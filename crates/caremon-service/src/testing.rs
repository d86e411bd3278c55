//! Scripted transport shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use caremon_types::HttpMethod;

use crate::error::{DeliveryError, Result};
use crate::transport::Transport;

/// What the fake backend answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Offline,
    Status(u16),
}

#[derive(Debug, Clone)]
pub struct Call {
    pub method: HttpMethod,
    pub url: String,
    pub payload: Option<serde_json::Value>,
}

/// Answers from a script, then with `fallback` once the script runs out.
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    calls: Mutex<Vec<Call>>,
    latency: Duration,
}

impl ScriptedTransport {
    pub fn new(script: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: Reply::Ok,
            calls: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    /// Always answer `reply`.
    pub fn always(reply: Reply) -> Self {
        let mut transport = Self::new([]);
        transport.fallback = reply;
        transport
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, method: HttpMethod, url: &str, payload: Option<&serde_json::Value>) -> Result<()> {
        self.calls.lock().unwrap().push(Call {
            method,
            url: url.to_string(),
            payload: payload.cloned(),
        });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let reply = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
        match reply {
            Reply::Ok => Ok(()),
            Reply::Offline => Err(DeliveryError::Connectivity("connection refused".to_string())),
            Reply::Status(status) => Err(DeliveryError::from_status(status)),
        }
    }
}
