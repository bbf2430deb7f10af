//! Test doubles for the proxy module.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reproxy_stream::BoxedStream;
use tokio::io::DuplexStream;
use tokio::sync::{oneshot, Notify};

use super::connector::Connector;
use crate::error::{ReproxyError, Result};

/// A connect call waiting for the test to decide its outcome.
pub(crate) struct PendingConnect {
    pub address: String,
    reply: oneshot::Sender<Result<BoxedStream>>,
}

impl PendingConnect {
    /// Complete with a fresh in-memory stream; returns the backend's end.
    pub fn succeed(self) -> DuplexStream {
        let (proxy_end, backend_end) = tokio::io::duplex(64 * 1024);
        let _ = self.reply.send(Ok(Box::new(proxy_end)));
        backend_end
    }

    pub fn fail(self) {
        let _ = self.reply.send(Err(ReproxyError::Connect {
            address: self.address,
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        }));
    }
}

#[derive(Default)]
struct MockState {
    requests: Mutex<VecDeque<PendingConnect>>,
    notify: Notify,
}

/// Connector whose connects complete only when the test says so.
#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next connect call, in call order.
    pub async fn next_request(&self) -> PendingConnect {
        loop {
            if let Some(request) = self.pop() {
                return request;
            }
            self.state.notify.notified().await;
        }
    }

    fn pop(&self) -> Option<PendingConnect> {
        self.state
            .requests
            .lock()
            .map(|mut queue| queue.pop_front())
            .unwrap_or(None)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: &str) -> Result<BoxedStream> {
        let (reply, rx) = oneshot::channel();
        if let Ok(mut queue) = self.state.requests.lock() {
            queue.push_back(PendingConnect {
                address: address.to_string(),
                reply,
            });
        }
        self.state.notify.notify_one();

        rx.await
            .unwrap_or_else(|_| Err(io::Error::from(io::ErrorKind::ConnectionAborted).into()))
    }
}
