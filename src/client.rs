//! Connection lifecycle.
//!
//! Owns the streaming connection: connect, subscribe the market-data
//! channels, authenticate the account channel, then pump frames inward until
//! the link dies, and reconnect forever. Liveness is watched with a periodic
//! health check; a silent link is torn down and rebuilt, a long-lived one
//! has its subscriptions refreshed in place.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{MarlinError, Result};
use crate::events::{DepthSnapshot, HistoryTrade};
use crate::nonce::NonceGen;
use crate::rest::RequestQueue;
use crate::signing::hmac_sha384_hex;
use crate::wire::WireFrame;

/// Pause between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Health check cadence.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// A link that was silent this long is considered dead.
const STALE_AFTER: Duration = Duration::from_secs(60);

/// Subscriptions older than this are refreshed in place.
const RESUBSCRIBE_AFTER: Duration = Duration::from_secs(30 * 60);

/// How many candle timeframes of history the initial download covers.
const HISTORY_CANDLES: i64 = 100;

/// Upper bound on one history download.
const HISTORY_LIMIT: u32 = 10_000;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Everything flowing from the link toward the session.
#[derive(Debug)]
pub enum LinkEvent {
    /// Connected and subscriptions sent.
    Connected,
    /// Link lost; reconnecting.
    Disconnected,
    /// One decoded frame (streamed or a queued-call reply).
    Frame(WireFrame),
    /// Out-of-band full-depth download finished.
    Snapshot(DepthSnapshot),
    /// Out-of-band history download finished, oldest first.
    History(Vec<HistoryTrade>),
}

struct Shared {
    config: Config,
    nonce: Arc<NonceGen>,
    queue: RequestQueue,
    link_tx: UnboundedSender<LinkEvent>,
    http: reqwest::Client,
    /// Newest already-downloaded history timestamp; later downloads resume
    /// from here instead of re-fetching the whole window.
    history_since: Mutex<Option<i64>>,
    cancel: CancellationToken,
}

/// Streaming feed client. Cheap to clone; all clones share one link.
#[derive(Clone)]
pub struct FeedClient {
    shared: Arc<Shared>,
}

impl FeedClient {
    pub fn new(
        config: Config,
        nonce: Arc<NonceGen>,
        queue: RequestQueue,
        link_tx: UnboundedSender<LinkEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                nonce,
                queue,
                link_tx,
                http: reqwest::Client::new(),
                history_since: Mutex::new(None),
                cancel,
            }),
        }
    }

    /// Spawn the reconnect loop. Returns immediately.
    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            run(shared).await;
        });
    }
}

async fn run(shared: Arc<Shared>) {
    loop {
        if shared.cancel.is_cancelled() {
            return;
        }
        match run_connection(&shared).await {
            Ok(()) => return, // cancelled
            Err(err) => {
                warn!(%err, "link lost, reconnecting");
            }
        }
        let _ = shared.link_tx.send(LinkEvent::Disconnected);
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// One connection from dial to teardown. `Ok` means cancelled; any `Err`
/// triggers a reconnect.
async fn run_connection(shared: &Arc<Shared>) -> Result<()> {
    info!(url = %shared.config.ws_url, "connecting");
    let (ws, _) = connect_async(shared.config.ws_url.as_str()).await?;
    let (mut sink, mut stream) = ws.split();

    subscribe_channels(shared, &mut sink, true).await?;
    let _ = shared.link_tx.send(LinkEvent::Connected);
    info!(pair = %shared.config.pair(), "subscribed");

    let mut last_received = Instant::now();
    let mut last_subscribed = Instant::now();
    let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    health.reset();

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
            message = stream.next() => {
                let message = message.ok_or(MarlinError::ConnectionClosed)??;
                match message {
                    Message::Text(text) => {
                        last_received = Instant::now();
                        match WireFrame::parse(&text) {
                            Ok(frame) => {
                                let _ = shared.link_tx.send(LinkEvent::Frame(frame));
                            }
                            Err(err) => warn!(%err, "dropping malformed frame"),
                        }
                    }
                    Message::Ping(payload) => {
                        sink.send(Message::Pong(payload)).await?;
                    }
                    Message::Close(_) => return Err(MarlinError::ConnectionClosed),
                    _ => {}
                }
            }
            _ = health.tick() => {
                let silent = last_received.elapsed();
                if silent > STALE_AFTER {
                    return Err(MarlinError::StaleConnection(silent.as_secs()));
                }
                if last_subscribed.elapsed() > RESUBSCRIBE_AFTER {
                    debug!("refreshing subscriptions");
                    subscribe_channels(shared, &mut sink, false).await?;
                    last_subscribed = Instant::now();
                }
            }
        }
    }
}

/// Subscribe the market-data channels and authenticate the account channel.
/// With `download` set the out-of-band snapshot/history fetches and the
/// account bootstrap calls are kicked off as well.
async fn subscribe_channels(shared: &Arc<Shared>, sink: &mut WsSink, download: bool) -> Result<()> {
    let pair = shared.config.pair();
    sink.send(Message::Text(ticker_subscribe_frame(&pair))).await?;
    sink.send(Message::Text(trades_subscribe_frame(&pair))).await?;
    sink.send(Message::Text(book_subscribe_frame(&pair))).await?;

    if let Some(creds) = &shared.config.credentials {
        let frame = auth_frame(&creds.key, &creds.secret, shared.nonce.next())?;
        sink.send(Message::Text(frame)).await?;
        if download {
            shared.queue.enqueue("orders", Default::default(), "orders");
            shared.queue.enqueue("balances", Default::default(), "balances");
            shared
                .queue
                .enqueue("account_infos", Default::default(), "account_infos");
        }
    }

    if download {
        if shared.config.load_fulldepth {
            tokio::spawn(fetch_fulldepth(Arc::clone(shared)));
        }
        if shared.config.load_history {
            tokio::spawn(fetch_history(Arc::clone(shared)));
        }
    }
    Ok(())
}

fn ticker_subscribe_frame(pair: &str) -> String {
    json!({"event": "subscribe", "channel": "ticker", "pair": pair}).to_string()
}

fn trades_subscribe_frame(pair: &str) -> String {
    json!({"event": "subscribe", "channel": "trades", "pair": pair}).to_string()
}

fn book_subscribe_frame(pair: &str) -> String {
    json!({"event": "subscribe", "channel": "book", "pair": pair, "prec": "P0"}).to_string()
}

fn auth_frame(key: &str, secret: &str, nonce: u64) -> Result<String> {
    let payload = format!("AUTH{nonce}");
    let sig = hmac_sha384_hex(secret, &payload)?;
    Ok(json!({
        "event": "auth",
        "apiKey": key,
        "authSig": sig,
        "authPayload": payload,
    })
    .to_string())
}

/// Download the authoritative full book, retrying until it arrives.
async fn fetch_fulldepth(shared: Arc<Shared>) {
    let url = format!("{}/book/{}", shared.config.api_url, shared.config.pair());
    loop {
        match get_json::<DepthSnapshot>(&shared.http, &url).await {
            Ok(snapshot) => {
                let _ = shared.link_tx.send(LinkEvent::Snapshot(snapshot));
                return;
            }
            Err(err) => warn!(%err, "full-depth download failed, retrying"),
        }
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// Download recent trade history, oldest first, retrying until it arrives.
/// Reconnects resume from the newest timestamp already seen.
async fn fetch_history(shared: Arc<Shared>) {
    let since = {
        let stored = shared
            .history_since
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        stored.unwrap_or_else(|| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;
            now - i64::from(shared.config.history_timeframe_mins) * 60 * HISTORY_CANDLES
        })
    };
    let url = format!(
        "{}/trades/{}?timestamp={}&limit_trades={}",
        shared.config.api_url,
        shared.config.pair(),
        since,
        HISTORY_LIMIT
    );
    loop {
        match get_json::<Vec<HistoryTrade>>(&shared.http, &url).await {
            Ok(mut trades) => {
                // Served newest first.
                trades.reverse();
                if let Some(newest) = trades.last() {
                    let mut stored = shared
                        .history_since
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    *stored = Some(newest.timestamp);
                }
                let _ = shared.link_tx.send(LinkEvent::History(trades));
                return;
            }
            Err(err) => warn!(%err, "history download failed, retrying"),
        }
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(client: &reqwest::Client, url: &str) -> Result<T> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(MarlinError::Http {
            status: status.as_u16(),
            message: format!("GET {url}"),
        });
    }
    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[test]
    fn subscribe_frames_carry_channel_and_pair() {
        let frame: Value = serde_json::from_str(&ticker_subscribe_frame("BTCUSD")).unwrap();
        assert_eq!(frame["event"], "subscribe");
        assert_eq!(frame["channel"], "ticker");
        assert_eq!(frame["pair"], "BTCUSD");

        let frame: Value = serde_json::from_str(&book_subscribe_frame("BTCUSD")).unwrap();
        assert_eq!(frame["channel"], "book");
        assert_eq!(frame["prec"], "P0");

        let frame: Value = serde_json::from_str(&trades_subscribe_frame("BTCUSD")).unwrap();
        assert_eq!(frame["channel"], "trades");
    }

    #[test]
    fn auth_frame_signs_the_nonce_payload() {
        let frame: Value =
            serde_json::from_str(&auth_frame("apikey", "secret", 1234567890).unwrap()).unwrap();
        assert_eq!(frame["event"], "auth");
        assert_eq!(frame["apiKey"], "apikey");
        assert_eq!(frame["authPayload"], "AUTH1234567890");
        assert_eq!(
            frame["authSig"],
            "9fa6b1bd5663a029d6d9b28b9af0998bfbef1c29a6378f744c4d73541939e557eb3f3cedd0958bec7ea16afa86398703"
        );
    }
}
