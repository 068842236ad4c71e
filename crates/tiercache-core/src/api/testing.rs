//! Scripted transport for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Transport, TransportError, TransportRequest, TransportResponse};

#[derive(Debug, Clone)]
pub(crate) enum MockReply {
    Json(Value),
    Status(u16),
    Fail,
}

pub(crate) struct MockTransport {
    scripted: Mutex<HashMap<String, VecDeque<MockReply>>>,
    fallback: Mutex<MockReply>,
    delay: Mutex<Duration>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            scripted: Mutex::new(HashMap::new()),
            fallback: Mutex::new(MockReply::Json(json!({"ok": true}))),
            delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Queue a one-shot reply for `endpoint`, used before the fallback.
    pub(crate) fn respond(&self, endpoint: &str, reply: MockReply) {
        self.scripted
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_default()
            .push_back(reply);
    }

    pub(crate) fn set_fallback(&self, reply: MockReply) {
        *self.fallback.lock().unwrap() = reply;
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Most sends that were ever running at once.
    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        self.calls.lock().unwrap().push(request.endpoint.clone());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let reply = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&request.endpoint)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.fallback.lock().unwrap().clone());

        match reply {
            MockReply::Json(value) => Ok(TransportResponse {
                status: 200,
                headers: Vec::new(),
                body: value.to_string(),
            }),
            MockReply::Status(status) => Ok(TransportResponse {
                status,
                headers: Vec::new(),
                body: format!("status {}", status),
            }),
            MockReply::Fail => Err(TransportError::Connection("connection reset".to_string())),
        }
    }
}
