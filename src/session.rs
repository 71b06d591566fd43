//! Session facade.
//!
//! Wires the pieces together: the lifecycle client pumps [`LinkEvent`]s in,
//! the session demultiplexes them into bus events by channel, the book
//! engine consumes those events off the bus and republishes its change
//! notifications, and consumer order operations go out through the signed
//! request queue. The session also tracks per-connection readiness and
//! announces [`Event::Ready`] once the initial downloads have landed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::book::OrderBook;
use crate::bus::{Bus, Subscription};
use crate::client::{FeedClient, LinkEvent};
use crate::config::Config;
use crate::events::{
    Event, OrderStatus, OwnOrder, OwnOrderKind, OwnOrderUpdate, RemoveReason, Side,
};
use crate::nonce::NonceGen;
use crate::rest::{run_worker, AccountRequest, HttpTransport, RequestQueue};
use crate::wire::WireFrame;

/// Balances and fee schedule are re-fetched this long after a fill, once
/// the dust has settled.
const INFO_REFRESH_DELAY: Duration = Duration::from_secs(60);

/// Channel id the account channel is seeded under before the handshake
/// reports its real id.
const AUTH_SEED_CHAN: u64 = 0;

#[derive(Debug, Default)]
struct SessionState {
    /// Subscribed channel name by channel id.
    channels: HashMap<u64, String>,
    /// Last known balance per currency.
    wallet: HashMap<String, Decimal>,
    /// Taker fee as a fraction (0.002 = 0.2%).
    trade_fee: Decimal,
    /// Orders submitted but not yet acknowledged.
    count_submitted: i64,
    ready_depth: bool,
    ready_owns: bool,
    ready_info: bool,
    ready_history: bool,
    announced_ready: bool,
}

impl SessionState {
    fn new() -> Self {
        let mut state = Self::default();
        state.channels.insert(AUTH_SEED_CHAN, "auth".to_string());
        state
    }
}

struct Core {
    config: Config,
    bus: Bus,
    queue: RequestQueue,
    nonce: Arc<NonceGen>,
    book: Arc<Mutex<OrderBook>>,
    state: Mutex<SessionState>,
}

/// One live connection to the exchange for one trading pair.
pub struct Session {
    core: Arc<Core>,
    client: FeedClient,
    cancel: CancellationToken,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: Mutex<Option<UnboundedReceiver<LinkEvent>>>,
    request_rx: Mutex<Option<UnboundedReceiver<AccountRequest>>>,
    /// Keeps the internal bus handlers registered.
    _subs: Vec<Subscription>,
}

impl Session {
    pub fn new(config: Config) -> Self {
        let bus = Bus::new();
        let cancel = CancellationToken::new();
        let nonce = Arc::new(NonceGen::new());
        let (queue, request_rx) = if config.credentials.is_some() {
            let (queue, rx) = RequestQueue::new();
            (queue, Some(rx))
        } else {
            (RequestQueue::disabled(), None)
        };
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let client = FeedClient::new(
            config.clone(),
            Arc::clone(&nonce),
            queue.clone(),
            link_tx.clone(),
            cancel.clone(),
        );

        let core = Arc::new(Core {
            config,
            bus,
            queue,
            nonce,
            book: Arc::new(Mutex::new(OrderBook::new())),
            state: Mutex::new(SessionState::new()),
        });
        let subs = Core::register_handlers(&core);

        Self {
            core,
            client,
            cancel,
            link_tx,
            link_rx: Mutex::new(Some(link_rx)),
            request_rx: Mutex::new(request_rx),
            _subs: subs,
        }
    }

    /// The shared event bus; subscribe here to observe the session.
    pub fn bus(&self) -> &Bus {
        &self.core.bus
    }

    /// Shared book state. Lock briefly; every frame handler takes this lock.
    pub fn book(&self) -> Arc<Mutex<OrderBook>> {
        Arc::clone(&self.core.book)
    }

    /// Last known balance for `currency`.
    pub fn balance(&self, currency: &str) -> Decimal {
        self.core
            .lock_state()
            .wallet
            .get(currency)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Taker fee as a fraction.
    pub fn trade_fee(&self) -> Decimal {
        self.core.lock_state().trade_fee
    }

    /// Orders submitted but not yet acknowledged by the exchange.
    pub fn pending_submits(&self) -> i64 {
        self.core.lock_state().count_submitted
    }

    /// Connect and start pumping. Returns immediately; progress is reported
    /// on the bus.
    pub fn start(&self) {
        if let Some(request_rx) = self.request_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
        {
            if let Some(creds) = self.core.config.credentials.clone() {
                let transport = HttpTransport::new(
                    reqwest::Client::new(),
                    self.core.config.api_url.clone(),
                );
                // Queued-call replies join the inbound stream, so handlers
                // see one serialized feed.
                tokio::spawn(run_worker(
                    transport,
                    creds,
                    Arc::clone(&self.core.nonce),
                    request_rx,
                    self.core.queue.clone(),
                    self.link_tx.clone(),
                    self.cancel.clone(),
                ));
            }
        }

        self.client.start();

        if let Some(mut link_rx) = self.link_rx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let core = Arc::clone(&self.core);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        event = link_rx.recv() => match event {
                            Some(event) => core.handle_link_event(event),
                            None => return,
                        },
                    }
                }
            });
        }
    }

    /// Tear everything down.
    pub fn stop(&self) {
        info!("stopping session");
        self.cancel.cancel();
    }

    // -- order operations ----------------------------------------------------

    /// Submit a limit order (market order when `price` is zero).
    pub fn place_order(&self, side: Side, price: Decimal, volume: Decimal) {
        self.core.place_order(side, price, volume);
    }

    pub fn buy(&self, price: Decimal, volume: Decimal) {
        self.place_order(Side::Bid, price, volume);
    }

    pub fn sell(&self, price: Decimal, volume: Decimal) {
        self.place_order(Side::Ask, price, volume);
    }

    pub fn cancel_order(&self, exchange_id: &str) {
        self.core.cancel_order(exchange_id);
    }

    /// Cancel every own order resting at `price` on `side`.
    pub fn cancel_by_price(&self, side: Side, price: Decimal) {
        let ids: Vec<String> = {
            let book = self.core.lock_book();
            book.owns()
                .iter()
                .filter(|o| o.side == side && o.price == price && !o.exchange_id.is_empty())
                .map(|o| o.exchange_id.clone())
                .collect()
        };
        for id in ids {
            self.cancel_order(&id);
        }
    }

    /// Cancel every own order, or only those on `side`.
    pub fn cancel_all(&self, side: Option<Side>) {
        let ids: Vec<String> = {
            let book = self.core.lock_book();
            book.owns()
                .iter()
                .filter(|o| side.map_or(true, |s| o.side == s) && !o.exchange_id.is_empty())
                .map(|o| o.exchange_id.clone())
                .collect()
        };
        for id in ids {
            self.cancel_order(&id);
        }
    }
}

impl Core {
    fn register_handlers(core: &Arc<Core>) -> Vec<Subscription> {
        let mut subs = Vec::new();

        // Book applier: normalized market/own events in, change notices out.
        let weak = Arc::downgrade(core);
        subs.push(core.bus.subscribe(move |event| {
            if let Some(core) = weak.upgrade() {
                core.apply_to_book(event);
            }
            Ok(())
        }));

        // Readiness and housekeeping.
        let weak: Weak<Core> = Arc::downgrade(core);
        subs.push(core.bus.subscribe(move |event| {
            let Some(core) = weak.upgrade() else {
                return Ok(());
            };
            match event {
                Event::DepthInitialized => {
                    core.lock_state().ready_depth = true;
                    core.check_ready();
                }
                Event::OwnsInitialized => {
                    core.lock_state().ready_owns = true;
                    core.check_ready();
                }
                Event::FullHistory(_) => {
                    core.lock_state().ready_history = true;
                    core.check_ready();
                }
                Event::Connected => core.check_ready(),
                Event::Disconnected => {
                    let mut state = core.lock_state();
                    state.ready_depth = false;
                    state.ready_owns = false;
                    state.ready_info = false;
                    state.ready_history = false;
                    state.announced_ready = false;
                    state.channels.clear();
                    state.channels.insert(AUTH_SEED_CHAN, "auth".to_string());
                }
                Event::OwnFill { .. } => core.schedule_info_refresh(),
                _ => {}
            }
            Ok(())
        }));

        subs
    }

    fn apply_to_book(&self, event: &Event) {
        let notices = {
            let mut book = self.lock_book();
            match event {
                Event::Ticker { bid, ask } => book.apply_ticker(*bid, *ask),
                Event::Depth {
                    side,
                    price,
                    total_volume,
                } => book.apply_depth(*side, *price, *total_volume),
                Event::Trade {
                    side,
                    price,
                    volume,
                    own,
                    ..
                } => book.apply_trade(*side, *price, *volume, *own),
                Event::OwnOrder(update) => book.apply_own_order(update),
                Event::OwnsSnapshot(owns) => book.init_owns(owns.clone()),
                Event::FullDepth(snapshot) => book.apply_snapshot(snapshot),
                _ => Vec::new(),
            }
        };
        for notice in notices {
            self.bus.publish(notice);
        }
    }

    /// Announce `Ready` once everything the config asked for has loaded.
    fn check_ready(&self) {
        let ready = {
            let mut state = self.lock_state();
            if state.announced_ready {
                return;
            }
            let mut ok = true;
            if self.config.load_fulldepth {
                ok &= state.ready_depth;
            }
            if self.config.load_history {
                ok &= state.ready_history;
            }
            if self.config.credentials.is_some() {
                ok &= state.ready_owns && state.ready_info;
            }
            if ok {
                state.announced_ready = true;
            }
            ok
        };
        if ready {
            info!("session ready");
            self.bus.publish(Event::Ready);
        }
    }

    /// After a fill, balances and fee schedule are stale; refresh them once
    /// the exchange has settled the trade.
    fn schedule_info_refresh(&self) {
        let queue = self.queue.clone();
        // Outside a runtime (pure state-machine tests) the refresh is moot.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tokio::time::sleep(INFO_REFRESH_DELAY).await;
                queue.enqueue("balances", Map::new(), "balances");
                queue.enqueue("account_infos", Map::new(), "account_infos");
            });
        }
    }

    // -- inbound demux -------------------------------------------------------

    fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => self.bus.publish(Event::Connected),
            LinkEvent::Disconnected => self.bus.publish(Event::Disconnected),
            LinkEvent::Snapshot(snapshot) => self.bus.publish(Event::FullDepth(snapshot)),
            LinkEvent::History(trades) => self.bus.publish(Event::FullHistory(trades)),
            LinkEvent::Frame(frame) => self.handle_frame(frame),
        }
    }

    fn handle_frame(&self, frame: WireFrame) {
        match frame {
            WireFrame::Subscribed { chan_id, channel } => {
                debug!(chan_id, channel = %channel, "channel mapped");
                self.lock_state().channels.insert(chan_id, channel);
            }
            WireFrame::AuthOk { chan_id } => {
                info!(chan_id, "account channel authenticated");
                self.lock_state().channels.insert(chan_id, "auth".to_string());
            }
            WireFrame::AuthError { message } => {
                warn!(message = %message, "account channel refused");
            }
            WireFrame::Info { payload } => debug!(%payload, "server info"),
            WireFrame::UnknownControl { event } => debug!(event = %event, "ignoring control"),
            WireFrame::Heartbeat { .. } => {}
            WireFrame::ChannelData { chan_id, payload } => {
                let channel = self.lock_state().channels.get(&chan_id).cloned();
                match channel.as_deref() {
                    Some("ticker") => self.handle_ticker(&payload),
                    Some("trades") => self.handle_trades(&payload),
                    Some("book") => self.handle_book(&payload),
                    Some("auth") => self.handle_account(&payload),
                    Some(other) => debug!(chan_id, channel = other, "frame for unhandled channel"),
                    None => debug!(chan_id, "frame for unknown channel"),
                }
            }
            WireFrame::Reply { token, data } => self.route_reply(&token, &data),
        }
    }

    /// Ticker payload: `[bid, bid_size, ask, ask_size, ...]`.
    fn handle_ticker(&self, payload: &[Value]) {
        let (Some(bid), Some(ask)) = (payload.first().and_then(dec), payload.get(2).and_then(dec))
        else {
            warn!("malformed ticker payload");
            return;
        };
        self.bus.publish(Event::Ticker { bid, ask });
    }

    /// Trades payload: snapshot (nested array, ignored), `["te", seq, ts,
    /// price, amount]` executions, or `["tu", ...]` enrichments (ignored,
    /// they duplicate the execution).
    fn handle_trades(&self, payload: &[Value]) {
        let fields: &[Value] = match payload.first() {
            Some(Value::Array(_)) | None => return,
            Some(Value::String(marker)) if marker == "te" => &payload[1..],
            Some(Value::String(_)) => return,
            Some(_) => payload,
        };
        let (Some(timestamp), Some(price), Some(amount)) = (
            fields.get(1).and_then(Value::as_i64),
            fields.get(2).and_then(dec),
            fields.get(3).and_then(dec),
        ) else {
            warn!("malformed trade payload");
            return;
        };
        // Sign of the amount encodes the initiating side.
        let side = if amount < Decimal::ZERO {
            Side::Ask
        } else {
            Side::Bid
        };
        self.bus.publish(Event::Trade {
            timestamp,
            side,
            price,
            volume: amount.abs(),
            own: false,
        });
    }

    /// Book payload: one `[price, count, amount]` delta or a snapshot array
    /// of them. Positive amounts are bids, negative asks; a zero count
    /// clears the level.
    fn handle_book(&self, payload: &[Value]) {
        if let Some(Value::Array(_)) = payload.first() {
            for entry in payload {
                if let Value::Array(fields) = entry {
                    self.handle_book_entry(fields);
                }
            }
            return;
        }
        self.handle_book_entry(payload);
    }

    fn handle_book_entry(&self, fields: &[Value]) {
        let (Some(price), Some(count), Some(amount)) = (
            fields.first().and_then(dec),
            fields.get(1).and_then(Value::as_u64),
            fields.get(2).and_then(dec),
        ) else {
            warn!("malformed book payload");
            return;
        };
        let side = if amount < Decimal::ZERO {
            Side::Ask
        } else {
            Side::Bid
        };
        let total_volume = if count == 0 { Decimal::ZERO } else { amount.abs() };
        self.bus.publish(Event::Depth {
            side,
            price,
            total_volume,
        });
    }

    /// Account channel payload: `[type_code, record]`.
    fn handle_account(&self, payload: &[Value]) {
        let Some(code) = payload.first().and_then(Value::as_str) else {
            return;
        };
        let record = payload.get(1);
        match code {
            "ws" => {
                let Some(Value::Array(entries)) = record else {
                    return;
                };
                for entry in entries {
                    self.handle_wallet_entry(entry);
                }
            }
            "wu" => {
                if let Some(entry) = record {
                    self.handle_wallet_entry(entry);
                }
            }
            "os" => {
                let Some(Value::Array(records)) = record else {
                    return;
                };
                let owns: Vec<OwnOrder> = records
                    .iter()
                    .filter_map(|r| self.parse_order(r))
                    .collect();
                self.bus.publish(Event::OwnsSnapshot(owns));
            }
            "on" | "ou" => {
                let Some(order) = record.and_then(|r| self.parse_order(r)) else {
                    return;
                };
                self.bus.publish(Event::OwnOrder(OwnOrderUpdate {
                    exchange_id: order.exchange_id.clone(),
                    kind: OwnOrderKind::Report {
                        price: order.price,
                        volume: order.volume,
                        side: order.side,
                        status: order.status,
                    },
                }));
            }
            "oc" => {
                let Some(record) = record else { return };
                let Some(id) = order_id(record) else { return };
                let status = record
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let reason = if status.contains("EXECUTED") {
                    // Market orders carry no price; their completion is the
                    // active kind.
                    let price = record.get("price").and_then(dec).unwrap_or(Decimal::ZERO);
                    if price.is_zero() {
                        RemoveReason::CompletedActive
                    } else {
                        RemoveReason::CompletedPassive
                    }
                } else {
                    RemoveReason::Requested
                };
                self.bus.publish(Event::OwnOrder(OwnOrderUpdate {
                    exchange_id: id,
                    kind: OwnOrderKind::Removed { reason },
                }));
            }
            other => debug!(code = other, "ignoring account record"),
        }
    }

    /// Wallet entry: `[wallet_type, currency, amount, ...]`.
    fn handle_wallet_entry(&self, entry: &Value) {
        let Value::Array(fields) = entry else { return };
        let (Some(currency), Some(balance)) = (
            fields.get(1).and_then(Value::as_str),
            fields.get(2).and_then(dec),
        ) else {
            return;
        };
        self.publish_wallet(currency, balance);
    }

    fn publish_wallet(&self, currency: &str, balance: Decimal) {
        self.lock_state()
            .wallet
            .insert(currency.to_string(), balance);
        self.bus.publish(Event::Wallet {
            currency: currency.to_string(),
            balance,
        });
    }

    /// Order record shared by the REST order list and the account channel:
    /// an object with `id`, `symbol`, `price`, `remaining_amount`, `side`
    /// and `is_live`. Records for other pairs are dropped.
    fn parse_order(&self, record: &Value) -> Option<OwnOrder> {
        let symbol = record.get("symbol").and_then(Value::as_str)?;
        if !symbol.eq_ignore_ascii_case(&self.config.pair()) {
            return None;
        }
        let side = match record.get("side").and_then(Value::as_str)? {
            "buy" => Side::Bid,
            "sell" => Side::Ask,
            _ => return None,
        };
        let status = if record.get("is_live").and_then(Value::as_bool).unwrap_or(false) {
            OrderStatus::Open
        } else {
            OrderStatus::Pending
        };
        Some(OwnOrder {
            price: record.get("price").and_then(dec)?,
            volume: record.get("remaining_amount").and_then(dec)?,
            side,
            exchange_id: order_id(record)?,
            status,
        })
    }

    // -- reply routing -------------------------------------------------------

    fn route_reply(&self, token: &str, data: &Value) {
        // Request-level failures come back as an object with a message.
        if let Some(message) = data.get("message").and_then(Value::as_str) {
            self.handle_remote_error(token, message);
            return;
        }
        match token {
            "orders" => self.handle_orders_reply(data),
            "balances" => self.handle_balances_reply(data),
            "account_infos" => self.handle_account_infos_reply(data),
            _ => {
                if token.starts_with("order_add:") {
                    self.handle_order_add_reply(token, data);
                } else if let Some(id) = token.strip_prefix("order_cancel:") {
                    self.handle_order_cancel_reply(id);
                } else {
                    debug!(token, "reply for unknown token");
                }
            }
        }
    }

    fn handle_orders_reply(&self, data: &Value) {
        let owns: Vec<OwnOrder> = data
            .as_array()
            .map(|records| records.iter().filter_map(|r| self.parse_order(r)).collect())
            .unwrap_or_default();
        self.lock_state().count_submitted = 0;
        self.bus.publish(Event::OwnsSnapshot(owns));
    }

    fn handle_balances_reply(&self, data: &Value) {
        let Some(entries) = data.as_array() else {
            warn!("malformed balances reply");
            return;
        };
        self.lock_state().wallet.clear();
        for entry in entries {
            let (Some(currency), Some(amount)) = (
                entry.get("currency").and_then(Value::as_str),
                entry.get("amount").and_then(dec),
            ) else {
                continue;
            };
            self.publish_wallet(currency, amount);
        }
        self.lock_state().ready_info = true;
        self.check_ready();
    }

    /// Fee schedule reply: `[{"taker_fees": "0.2", ...}]`, percent.
    fn handle_account_infos_reply(&self, data: &Value) {
        let fee = data
            .get(0)
            .and_then(|info| info.get("taker_fees"))
            .and_then(dec);
        let Some(fee) = fee else {
            warn!("malformed account_infos reply");
            return;
        };
        self.lock_state().trade_fee = fee / Decimal::from(100);
        debug!(fee = %fee, "trade fee updated");
    }

    fn handle_order_add_reply(&self, token: &str, data: &Value) {
        let Some(id) = order_id(data) else {
            warn!(token, "order reply without id");
            return;
        };
        let Some((side, price, volume)) = parse_order_add_token(token) else {
            warn!(token, "unparsable order token");
            return;
        };
        self.lock_state().count_submitted -= 1;
        self.bus.publish(Event::OwnOrder(OwnOrderUpdate {
            exchange_id: id,
            kind: OwnOrderKind::Report {
                price,
                volume,
                side,
                status: OrderStatus::Pending,
            },
        }));
    }

    fn handle_order_cancel_reply(&self, id: &str) {
        let known = self.lock_book().have_own_id(id);
        if known {
            self.bus.publish(Event::OwnOrder(OwnOrderUpdate {
                exchange_id: id.to_string(),
                kind: OwnOrderKind::Removed {
                    reason: RemoveReason::Requested,
                },
            }));
        }
    }

    /// Classify a failed account call by its message and recover.
    fn handle_remote_error(&self, token: &str, message: &str) {
        if message.contains("Invalid") {
            // The exchange dropped the call on the floor; re-derive the
            // request from its token and send it again.
            warn!(token, message, "invalid call, resending");
            self.resend_from_token(token);
        } else if message.contains("not found") {
            // Cancel raced a fill or a previous cancel; converge by
            // treating the order as gone.
            if let Some(id) = token.strip_prefix("order_cancel:") {
                self.handle_order_cancel_reply(id);
            }
        } else if message.contains("too low") {
            self.lock_state().count_submitted -= 1;
            warn!(token, message, "order rejected");
        } else if message.contains("Too many") {
            self.lock_state().count_submitted -= 1;
            warn!(token, message, "rate limited");
            self.bus.publish(Event::RateLimited);
        } else {
            warn!(token, message, "unclassified account error");
        }
    }

    fn resend_from_token(&self, token: &str) {
        match token {
            "orders" | "balances" | "account_infos" => {
                self.queue.enqueue(token, Map::new(), token);
            }
            _ => {
                if let Some((side, price, volume)) = parse_order_add_token(token) {
                    self.enqueue_order(side, price, volume, token);
                } else if let Some(id) = token.strip_prefix("order_cancel:") {
                    self.enqueue_cancel(id);
                } else {
                    warn!(token, "cannot resend unknown token");
                }
            }
        }
    }

    // -- outbound operations -------------------------------------------------

    fn place_order(&self, side: Side, price: Decimal, volume: Decimal) {
        self.lock_state().count_submitted += 1;
        let token = format!("order_add:{side}:{price}:{volume}");
        self.enqueue_order(side, price, volume, &token);
    }

    fn enqueue_order(&self, side: Side, price: Decimal, volume: Decimal, token: &str) {
        let order_type = if price.is_zero() {
            "exchange market"
        } else {
            "exchange limit"
        };
        let order_side = match side {
            Side::Bid => "buy",
            Side::Ask => "sell",
        };
        let params = params_from(json!({
            "symbol": self.config.pair().to_lowercase(),
            "amount": volume.to_string(),
            "price": price.to_string(),
            "side": order_side,
            "type": order_type,
        }));
        self.queue.enqueue("order/new", params, token);
    }

    fn cancel_order(&self, exchange_id: &str) {
        self.enqueue_cancel(exchange_id);
    }

    fn enqueue_cancel(&self, exchange_id: &str) {
        let params = params_from(json!({ "order_id": exchange_id }));
        self.queue
            .enqueue("order/cancel", params, &format!("order_cancel:{exchange_id}"));
    }

    // -- locks ---------------------------------------------------------------

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_book(&self) -> std::sync::MutexGuard<'_, OrderBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Decimal out of a JSON number or string.
fn dec(v: &Value) -> Option<Decimal> {
    match v {
        Value::Number(n) => n.as_f64().and_then(Decimal::from_f64_retain),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Exchange order id out of an order record; numeric ids are stringified.
fn order_id(record: &Value) -> Option<String> {
    match record.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// `order_add:<side>:<price>:<volume>` back into its parts.
fn parse_order_add_token(token: &str) -> Option<(Side, Decimal, Decimal)> {
    let rest = token.strip_prefix("order_add:")?;
    let mut parts = rest.splitn(3, ':');
    let side = Side::parse(parts.next()?)?;
    let price = parts.next()?.parse().ok()?;
    let volume = parts.next()?.parse().ok()?;
    Some((side, price, volume))
}

fn params_from(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec as d;

    use super::*;
    use crate::config::Credentials;
    use crate::events::{BookEntry, DepthSnapshot, HistoryTrade};

    fn session_with_creds() -> Session {
        let mut config = Config::new("BTC", "USD");
        config.credentials = Some(Credentials {
            key: "k".to_string(),
            secret: "s".to_string(),
        });
        Session::new(config)
    }

    fn collect_events(session: &Session) -> (Arc<Mutex<Vec<Event>>>, Subscription) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let sub = session.bus().subscribe(move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        (log, sub)
    }

    fn frame(session: &Session, raw: &str) {
        session
            .core
            .handle_link_event(LinkEvent::Frame(WireFrame::parse(raw).unwrap()));
    }

    fn snapshot() -> DepthSnapshot {
        DepthSnapshot {
            bids: vec![BookEntry {
                price: d!(99),
                amount: d!(2),
            }],
            asks: vec![BookEntry {
                price: d!(101),
                amount: d!(1),
            }],
        }
    }

    #[test]
    fn ticker_frame_updates_book() {
        let session = session_with_creds();
        frame(&session, r#"{"event":"subscribed","channel":"ticker","chanId":1}"#);
        frame(&session, r#"[1,"99.5",10,"100.5",8,0,0,100,1000,90,110]"#);
        let book = session.book();
        let book = book.lock().unwrap();
        assert_eq!(book.bid(), d!(99.5));
        assert_eq!(book.ask(), d!(100.5));
    }

    #[test]
    fn book_deltas_flow_into_the_engine() {
        let session = session_with_creds();
        frame(&session, r#"{"event":"subscribed","channel":"book","chanId":2}"#);
        // Snapshot form, then one delta, then a removal.
        frame(&session, r#"[2,["100",1,"2"],["101",1,"-3"]]"#);
        frame(&session, r#"[2,"102",2,"-1"]"#);
        frame(&session, r#"[2,"101",0,"-1"]"#);

        let book = session.book();
        let book = book.lock().unwrap();
        assert_eq!(book.bid(), d!(100));
        assert_eq!(book.ask(), d!(102));
        assert_eq!(book.total_ask(), d!(1));
    }

    #[test]
    fn trade_execution_erodes_book() {
        let session = session_with_creds();
        session
            .core
            .handle_link_event(LinkEvent::Snapshot(snapshot()));
        frame(&session, r#"{"event":"subscribed","channel":"trades","chanId":3}"#);
        frame(&session, r#"[3,"te","1",1448398210,"101","0.4"]"#);

        let book = session.book();
        let book = book.lock().unwrap();
        assert_eq!(book.asks()[0].volume, d!(0.6));
    }

    #[test]
    fn wallet_update_reaches_state_and_bus() {
        let session = session_with_creds();
        let (log, _sub) = collect_events(&session);
        frame(&session, r#"[0,"wu",["exchange","USD","2500.5"]]"#);
        assert_eq!(session.balance("USD"), d!(2500.5));
        assert!(log.lock().unwrap().iter().any(|e| matches!(
            e,
            Event::Wallet { currency, .. } if currency == "USD"
        )));
    }

    #[test]
    fn orders_reply_initializes_owns() {
        let session = session_with_creds();
        session.core.lock_state().count_submitted = 2;
        let data = serde_json::json!([
            {"id": 7, "symbol": "btcusd", "price": "99", "remaining_amount": "0.5",
             "side": "buy", "is_live": true},
            {"id": 8, "symbol": "ethusd", "price": "10", "remaining_amount": "1",
             "side": "buy", "is_live": true}
        ]);
        session
            .core
            .handle_link_event(LinkEvent::Frame(WireFrame::Reply {
                token: "orders".to_string(),
                data,
            }));

        let book = session.book();
        let book = book.lock().unwrap();
        // The foreign-pair order was filtered out.
        assert_eq!(book.owns().len(), 1);
        assert!(book.have_own_id("7"));
        drop(book);
        assert_eq!(session.pending_submits(), 0);
    }

    #[test]
    fn order_add_reply_tracks_pending_order() {
        let session = session_with_creds();
        session.core.place_order(Side::Bid, d!(99), d!(0.5));
        assert_eq!(session.pending_submits(), 1);

        session
            .core
            .handle_link_event(LinkEvent::Frame(WireFrame::Reply {
                token: "order_add:bid:99:0.5".to_string(),
                data: serde_json::json!({"id": 42}),
            }));

        assert_eq!(session.pending_submits(), 0);
        let book = session.book();
        let book = book.lock().unwrap();
        assert!(book.have_own_id("42"));
        assert_eq!(book.own_volume_at(Side::Bid, d!(99)), d!(0.5));
    }

    #[test]
    fn order_not_found_synthesizes_removal() {
        let session = session_with_creds();
        let book = session.book();
        book.lock().unwrap().init_owns(vec![OwnOrder {
            price: d!(99),
            volume: d!(0.5),
            side: Side::Bid,
            exchange_id: "42".to_string(),
            status: OrderStatus::Open,
        }]);
        session
            .core
            .handle_link_event(LinkEvent::Frame(WireFrame::Reply {
                token: "order_cancel:42".to_string(),
                data: serde_json::json!({"message": "Order not found"}),
            }));
        assert!(!book.lock().unwrap().have_own_id("42"));
    }

    #[test]
    fn rate_limit_reply_decrements_and_announces() {
        let session = session_with_creds();
        let (log, _sub) = collect_events(&session);
        session.core.lock_state().count_submitted = 1;
        session
            .core
            .handle_link_event(LinkEvent::Frame(WireFrame::Reply {
                token: "order_add:bid:99:0.5".to_string(),
                data: serde_json::json!({"message": "Too many requests"}),
            }));
        assert_eq!(session.pending_submits(), 0);
        assert!(log.lock().unwrap().contains(&Event::RateLimited));
    }

    #[test]
    fn invalid_call_resends_request() {
        let session = session_with_creds();
        let mut request_rx = session.request_rx.lock().unwrap().take().unwrap();
        session
            .core
            .handle_link_event(LinkEvent::Frame(WireFrame::Reply {
                token: "order_add:bid:99:0.5".to_string(),
                data: serde_json::json!({"message": "Invalid call"}),
            }));
        let resent = request_rx.try_recv().unwrap();
        assert_eq!(resent.endpoint, "order/new");
        assert_eq!(resent.token, "order_add:bid:99:0.5");
        assert_eq!(resent.params["side"], "buy");
        assert_eq!(resent.params["price"], "99");
    }

    #[test]
    fn ready_fires_once_after_all_initial_loads() {
        let session = session_with_creds();
        let (log, _sub) = collect_events(&session);
        let ready_count =
            |log: &Arc<Mutex<Vec<Event>>>| log.lock().unwrap().iter().filter(|e| **e == Event::Ready).count();

        session.core.handle_link_event(LinkEvent::Connected);
        session
            .core
            .handle_link_event(LinkEvent::Snapshot(snapshot()));
        session.core.handle_link_event(LinkEvent::History(vec![HistoryTrade {
            timestamp: 1,
            price: d!(100),
            amount: d!(1),
        }]));
        session
            .core
            .handle_link_event(LinkEvent::Frame(WireFrame::Reply {
                token: "orders".to_string(),
                data: serde_json::json!([]),
            }));
        assert_eq!(ready_count(&log), 0);
        session
            .core
            .handle_link_event(LinkEvent::Frame(WireFrame::Reply {
                token: "balances".to_string(),
                data: serde_json::json!([{"currency": "USD", "amount": "100"}]),
            }));
        assert_eq!(ready_count(&log), 1);

        // Further loads do not re-announce.
        session
            .core
            .handle_link_event(LinkEvent::Snapshot(snapshot()));
        assert_eq!(ready_count(&log), 1);

        // A disconnect re-arms the announcement.
        session.core.handle_link_event(LinkEvent::Disconnected);
        session.core.handle_link_event(LinkEvent::Connected);
        session
            .core
            .handle_link_event(LinkEvent::Snapshot(snapshot()));
        session.core.handle_link_event(LinkEvent::History(Vec::new()));
        session
            .core
            .handle_link_event(LinkEvent::Frame(WireFrame::Reply {
                token: "orders".to_string(),
                data: serde_json::json!([]),
            }));
        session
            .core
            .handle_link_event(LinkEvent::Frame(WireFrame::Reply {
                token: "balances".to_string(),
                data: serde_json::json!([]),
            }));
        assert_eq!(ready_count(&log), 2);
    }

    #[test]
    fn ready_without_credentials_needs_only_market_data() {
        let session = Session::new(Config::new("BTC", "USD"));
        let (log, _sub) = collect_events(&session);
        session
            .core
            .handle_link_event(LinkEvent::Snapshot(snapshot()));
        session.core.handle_link_event(LinkEvent::History(Vec::new()));
        assert!(log.lock().unwrap().contains(&Event::Ready));
    }

    #[test]
    fn account_stream_removal_flows_through() {
        let session = session_with_creds();
        let (log, _sub) = collect_events(&session);
        let data = serde_json::json!([
            {"id": 7, "symbol": "btcusd", "price": "99", "remaining_amount": "0.5",
             "side": "buy", "is_live": true}
        ]);
        session
            .core
            .handle_link_event(LinkEvent::Frame(WireFrame::Reply {
                token: "orders".to_string(),
                data,
            }));
        frame(
            &session,
            r#"[0,"oc",{"id":7,"symbol":"btcusd","price":"99","status":"CANCELED"}]"#,
        );
        assert!(!session.book().lock().unwrap().have_own_id("7"));
        assert!(log.lock().unwrap().iter().any(|e| matches!(
            e,
            Event::OwnRemoved {
                reason: RemoveReason::Requested,
                ..
            }
        )));
    }

    #[test]
    fn account_infos_reply_sets_trade_fee() {
        let session = session_with_creds();
        session
            .core
            .handle_link_event(LinkEvent::Frame(WireFrame::Reply {
                token: "account_infos".to_string(),
                data: serde_json::json!([{"taker_fees": "0.2"}]),
            }));
        assert_eq!(session.trade_fee(), d!(0.002));
    }

    #[test]
    fn cancel_all_targets_only_requested_side() {
        let session = session_with_creds();
        let mut request_rx = session.request_rx.lock().unwrap().take().unwrap();
        let book = session.book();
        book.lock().unwrap().init_owns(vec![
            OwnOrder {
                price: d!(99),
                volume: d!(0.5),
                side: Side::Bid,
                exchange_id: "1".to_string(),
                status: OrderStatus::Open,
            },
            OwnOrder {
                price: d!(101),
                volume: d!(0.5),
                side: Side::Ask,
                exchange_id: "2".to_string(),
                status: OrderStatus::Open,
            },
        ]);
        session.cancel_all(Some(Side::Ask));
        let req = request_rx.try_recv().unwrap();
        assert_eq!(req.endpoint, "order/cancel");
        assert_eq!(req.params["order_id"], "2");
        assert!(request_rx.try_recv().is_err());
    }
}
