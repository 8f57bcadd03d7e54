use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{Bus, Delivery, Protocol, TransportError};

/// In-process [`Bus`] backed by tokio channels.
///
/// Every registered address owns an mpsc mailbox, so delivery to one address
/// is ordered. Request/reply rides a oneshot channel inside the delivery;
/// broadcast fans out to whatever subscribers a topic has at publish time.
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    endpoints: HashMap<String, mpsc::Sender<Delivery>>,
    topics: HashMap<String, Vec<mpsc::Sender<Protocol>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn endpoint(&self, addr: &str) -> Result<mpsc::Sender<Delivery>, TransportError> {
        let inner = self.inner.lock().expect("bus lock poisoned");
        inner
            .endpoints
            .get(addr)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(addr.to_string()))
    }

    fn drop_endpoint_if_closed(&self, addr: &str) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        if inner.endpoints.get(addr).is_some_and(|tx| tx.is_closed()) {
            inner.endpoints.remove(addr);
        }
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn send(&self, addr: &str, msg: Protocol) -> Result<(), TransportError> {
        let tx = self.endpoint(addr)?;
        if tx.send(Delivery::new(msg, None)).await.is_err() {
            self.drop_endpoint_if_closed(addr);
            return Err(TransportError::Closed(addr.to_string()));
        }
        Ok(())
    }

    async fn request(
        &self,
        addr: &str,
        msg: Protocol,
        timeout: Duration,
    ) -> Result<Protocol, TransportError> {
        let tx = self.endpoint(addr)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send(Delivery::new(msg, Some(reply_tx))).await.is_err() {
            self.drop_endpoint_if_closed(addr);
            return Err(TransportError::Closed(addr.to_string()));
        }
        match tokio::time::timeout(timeout, reply_rx).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(_)) => Err(TransportError::NoReply),
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(rejection))) => Err(TransportError::Rejected(rejection)),
        }
    }

    async fn publish(&self, topic: &str, msg: Protocol) -> Result<(), TransportError> {
        let subscribers: Vec<mpsc::Sender<Protocol>> = {
            let mut inner = self.inner.lock().expect("bus lock poisoned");
            if let Some(subs) = inner.topics.get_mut(topic) {
                subs.retain(|tx| !tx.is_closed());
                subs.clone()
            } else {
                Vec::new()
            }
        };
        for tx in subscribers {
            // A full subscriber drops this update rather than stalling the
            // publisher; progress broadcasts are periodic anyway.
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(msg.clone()) {
                tracing::debug!(topic, "Subscriber lagging, dropping broadcast");
            }
        }
        Ok(())
    }

    fn register(&self, addr: &str, capacity: usize) -> mpsc::Receiver<Delivery> {
        let (tx, rx) = mpsc::channel(capacity);
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        if inner.endpoints.insert(addr.to_string(), tx).is_some() {
            tracing::warn!(addr, "Replacing existing bus endpoint");
        }
        rx
    }

    fn unregister(&self, addr: &str) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        inner.endpoints.remove(addr);
    }

    fn subscribe(&self, topic: &str, capacity: usize) -> mpsc::Receiver<Protocol> {
        let (tx, rx) = mpsc::channel(capacity);
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        inner.topics.entry(topic.to_string()).or_default().push(tx);
        rx
    }
}
