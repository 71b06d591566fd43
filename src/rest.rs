//! Queued, signed account calls over HTTP.
//!
//! Account operations (orders, balances, account info) go through a single
//! serial queue: one worker signs and sends each request in turn, so nonces
//! leave in issue order and the exchange never sees them out of sequence. A
//! failed call is re-enqueued at the tail and retried until it goes through;
//! its reply is fed back into the inbound stream like any other frame,
//! correlated by token.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::LinkEvent;
use crate::config::Credentials;
use crate::error::{MarlinError, Result};
use crate::nonce::NonceGen;
use crate::signing::{sign, SignedRequest};
use crate::wire::WireFrame;

/// Pause before re-enqueueing a failed request.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// One queued account operation. The token correlates its eventual reply.
#[derive(Debug, Clone)]
pub struct AccountRequest {
    pub endpoint: String,
    pub params: Map<String, Value>,
    pub token: String,
}

/// Where signed requests actually go. Swapped out in tests.
pub trait RequestTransport: Send + Sync + 'static {
    fn call(
        &self,
        req: &SignedRequest,
    ) -> impl std::future::Future<Output = Result<Value>> + Send;
}

/// Production transport: POST against the account API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

impl RequestTransport for HttpTransport {
    async fn call(&self, req: &SignedRequest) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, req.endpoint);
        let response = self
            .client
            .post(&url)
            .header("X-API-KEY", &req.api_key)
            .header("X-API-PAYLOAD", &req.payload)
            .header("X-API-SIGNATURE", &req.signature)
            .body(req.payload.clone())
            .send()
            .await?;

        let status = response.status();
        let body: Value = response.json().await?;
        // The API reports request-level failures in the body as well.
        if !status.is_success() {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_string();
            return Err(MarlinError::Http {
                status: status.as_u16(),
                message,
            });
        }
        Ok(body)
    }
}

/// Producer side of the account queue.
///
/// Cloneable; without credentials the queue is disabled and silently drops
/// everything enqueued, so callers need no credential checks of their own.
#[derive(Debug, Clone, Default)]
pub struct RequestQueue {
    tx: Option<UnboundedSender<AccountRequest>>,
}

impl RequestQueue {
    pub fn new() -> (Self, UnboundedReceiver<AccountRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Queue that drops everything (market-data-only operation).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn enqueue(&self, endpoint: &str, params: Map<String, Value>, token: &str) {
        let Some(tx) = &self.tx else {
            debug!(endpoint, token, "no credentials, dropping account request");
            return;
        };
        let request = AccountRequest {
            endpoint: endpoint.to_string(),
            params,
            token: token.to_string(),
        };
        if tx.send(request).is_err() {
            debug!(endpoint, token, "account worker gone, dropping request");
        }
    }
}

/// Drain the queue until cancelled.
///
/// Each attempt is signed with a fresh nonce. On failure the request is
/// re-enqueued unchanged at the tail; replies are injected into the inbound
/// stream as [`WireFrame::Reply`].
pub async fn run_worker<T: RequestTransport>(
    transport: T,
    creds: Credentials,
    nonce: Arc<NonceGen>,
    mut rx: UnboundedReceiver<AccountRequest>,
    retry: RequestQueue,
    inbound: UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return,
            request = rx.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };

        let signed = match sign(&creds, &request.endpoint, request.params.clone(), nonce.next()) {
            Ok(signed) => signed,
            Err(err) => {
                // Signing is deterministic; retrying cannot help.
                warn!(endpoint = %request.endpoint, %err, "dropping unsignable request");
                continue;
            }
        };

        match transport.call(&signed).await {
            Ok(data) => {
                let frame = WireFrame::Reply {
                    token: request.token.clone(),
                    data,
                };
                if inbound.send(LinkEvent::Frame(frame)).is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(endpoint = %request.endpoint, token = %request.token, %err,
                    "account request failed, re-enqueueing");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
                retry.enqueue(&request.endpoint, request.params, &request.token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    struct FlakyTransport {
        fail_first: usize,
        attempts: AtomicUsize,
        payloads: Mutex<Vec<String>>,
    }

    impl RequestTransport for Arc<FlakyTransport> {
        async fn call(&self, req: &SignedRequest) -> Result<Value> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            self.payloads.lock().unwrap().push(req.payload.clone());
            if n < self.fail_first {
                Err(MarlinError::Http {
                    status: 500,
                    message: "flaky".to_string(),
                })
            } else {
                Ok(serde_json::json!({"ok": true}))
            }
        }
    }

    fn creds() -> Credentials {
        Credentials {
            key: "k".to_string(),
            secret: "s".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_request_retries_until_delivered() {
        let transport = Arc::new(FlakyTransport {
            fail_first: 3,
            attempts: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        });
        let (queue, rx) = RequestQueue::new();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        queue.enqueue("balances", Map::new(), "balances");
        let worker = tokio::spawn(run_worker(
            Arc::clone(&transport),
            creds(),
            Arc::new(NonceGen::new()),
            rx,
            queue.clone(),
            inbound_tx,
            cancel.clone(),
        ));

        let event = inbound_rx.recv().await.unwrap();
        match event {
            LinkEvent::Frame(WireFrame::Reply { token, data }) => {
                assert_eq!(token, "balances");
                assert_eq!(data["ok"], true);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 4);

        // Every attempt was re-signed with a fresh nonce.
        let payloads = transport.payloads.lock().unwrap();
        let distinct: std::collections::HashSet<_> = payloads.iter().collect();
        assert_eq!(distinct.len(), payloads.len());

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn disabled_queue_drops_silently() {
        let queue = RequestQueue::disabled();
        queue.enqueue("balances", Map::new(), "balances");
        // Nothing to assert beyond not panicking; there is no worker.
    }

    #[tokio::test]
    async fn replies_preserve_enqueue_order() {
        struct Ok200;
        impl RequestTransport for Ok200 {
            async fn call(&self, _req: &SignedRequest) -> Result<Value> {
                Ok(Value::Null)
            }
        }

        let (queue, rx) = RequestQueue::new();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        queue.enqueue("balances", Map::new(), "balances");
        queue.enqueue("orders", Map::new(), "orders");
        let worker = tokio::spawn(run_worker(
            Ok200,
            creds(),
            Arc::new(NonceGen::new()),
            rx,
            queue.clone(),
            inbound_tx,
            cancel.clone(),
        ));

        for expected in ["balances", "orders"] {
            match inbound_rx.recv().await.unwrap() {
                LinkEvent::Frame(WireFrame::Reply { token, .. }) => assert_eq!(token, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        cancel.cancel();
        worker.await.unwrap();
    }
}
