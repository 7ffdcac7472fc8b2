//! Scripted protocol backend for tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ClientFactory, ProtocolClient, ProtocolError, ProtocolEvent};

#[derive(Default)]
pub struct MockClient {
    pub sent: Mutex<Vec<(String, String)>>,
    pub destroyed: AtomicBool,
    pub logged_out: AtomicBool,
    pub fail_send: AtomicBool,
}

#[async_trait]
impl ProtocolClient for MockClient {
    async fn send_text(&self, to: &str, body: &str) -> Result<(), ProtocolError> {
        if self.fail_send.load(Ordering::Relaxed) {
            return Err(ProtocolError::SendFailed("scripted send failure".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), body.to_string()));
        Ok(())
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        self.logged_out.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ProtocolError> {
        self.destroyed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockFactory {
    connects: AtomicUsize,
    connect_delay: Option<Duration>,
    failures: Mutex<VecDeque<ProtocolError>>,
    clients: Mutex<Vec<Arc<MockClient>>>,
    senders: Mutex<Vec<mpsc::Sender<ProtocolEvent>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every connect take this long, so tests can overlap callers.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Queue a failure consumed by the next connect call.
    pub fn push_failure(&self, error: ProtocolError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn last_client(&self) -> Arc<MockClient> {
        self.clients.lock().unwrap().last().cloned().expect("no client connected")
    }

    pub fn last_sender(&self) -> mpsc::Sender<ProtocolEvent> {
        self.senders.lock().unwrap().last().cloned().expect("no client connected")
    }
}

#[async_trait]
impl ClientFactory for MockFactory {
    async fn connect(
        &self,
        _user_id: &str,
        _storage_dir: &Path,
    ) -> Result<(Arc<dyn ProtocolClient>, mpsc::Receiver<ProtocolEvent>), ProtocolError> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let (tx, rx) = mpsc::channel(16);
        let client = Arc::new(MockClient::default());
        self.clients.lock().unwrap().push(client.clone());
        self.senders.lock().unwrap().push(tx);
        Ok((client, rx))
    }
}
