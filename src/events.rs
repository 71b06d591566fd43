//! The closed event vocabulary carried on the [`Bus`](crate::bus::Bus).
//!
//! Every component communicates exclusively through these payloads: the
//! session facade converts decoded wire frames into the lower-level variants
//! (`Ticker`, `Depth`, `Trade`, ...) and the book engine republishes the
//! higher-level change notifications (`BookChanged`, `OwnOpened`, ...).

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of the book an order or level belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Bid => "bid",
            Side::Ask => "ask",
        }
    }

    /// Inverse of [`Side::as_str`].
    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "bid" => Some(Side::Bid),
            "ask" => Some(Side::Ask),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an own order.
///
/// `pending` until the exchange confirms the order is resting; market orders
/// never reach `open`, they execute and disappear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Open,
}

/// Terminal reason attached to an own-order removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    /// Cancelled on request.
    Requested,
    /// Limit order filled completely.
    CompletedPassive,
    /// Market order filled completely.
    CompletedActive,
}

impl RemoveReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RemoveReason::Requested => "requested",
            RemoveReason::CompletedPassive => "completed_passive",
            RemoveReason::CompletedActive => "completed_active",
        }
    }
}

/// An order belonging to the local account.
///
/// `exchange_id` is empty until the exchange acknowledges creation; before
/// that the order is only represented by the pending-submit counter and the
/// correlation token of its request.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnOrder {
    pub price: Decimal,
    pub volume: Decimal,
    pub side: Side,
    pub exchange_id: String,
    pub status: OrderStatus,
}

/// Normalized own-order event, one of the two wire shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnOrderUpdate {
    pub exchange_id: String,
    pub kind: OwnOrderKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OwnOrderKind {
    /// New order or status/volume report.
    Report {
        price: Decimal,
        volume: Decimal,
        side: Side,
        status: OrderStatus,
    },
    /// The order left the exchange (cancel or complete fill). Carries no
    /// price/volume; the book resolves those from its own list.
    Removed { reason: RemoveReason },
}

/// One entry of the out-of-band full-depth download.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BookEntry {
    pub price: Decimal,
    pub amount: Decimal,
}

/// Authoritative replacement of the entire book state.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct DepthSnapshot {
    pub bids: Vec<BookEntry>,
    pub asks: Vec<BookEntry>,
}

/// One historic trade from the bulk history download.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryTrade {
    pub timestamp: i64,
    pub price: Decimal,
    pub amount: Decimal,
}

/// Immutable fan-out payload published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Authoritative best bid/ask.
    Ticker { bid: Decimal, ask: Decimal },
    /// Depth delta: the level at `price` now holds exactly `total_volume`
    /// (zero removes the level).
    Depth {
        side: Side,
        price: Decimal,
        total_volume: Decimal,
    },
    /// A public trade. `side` is the initiating side; `own` marks fills of
    /// the local account.
    Trade {
        timestamp: i64,
        side: Side,
        price: Decimal,
        volume: Decimal,
        own: bool,
    },
    /// Own-order create/update/remove.
    OwnOrder(OwnOrderUpdate),
    /// Authoritative own-order list after (re)connect.
    OwnsSnapshot(Vec<OwnOrder>),
    /// Authoritative full book, fetched out-of-band.
    FullDepth(DepthSnapshot),
    /// Bulk trade history for the candle aggregator.
    FullHistory(Vec<HistoryTrade>),
    /// A wallet balance changed.
    Wallet { currency: String, balance: Decimal },
    /// Transport connected and subscriptions sent.
    Connected,
    /// Transport lost; the lifecycle manager is reconnecting.
    Disconnected,

    // -- engine notifications ------------------------------------------------
    /// Some book state changed (levels, totals, or own orders).
    BookChanged,
    /// The book was (re)initialized from a full-depth snapshot.
    DepthInitialized,
    /// The own-order list was (re)initialized from the authoritative list.
    OwnsInitialized,
    /// The own-order list changed in some way.
    OwnsChanged,
    /// A new own order is now tracked.
    OwnAdded(OwnOrder),
    /// An own order transitioned to `open`.
    OwnOpened(OwnOrder),
    /// An own order was partially or fully filled; `delta` is the volume
    /// change (negative for fills).
    OwnFill { order: OwnOrder, delta: Decimal },
    /// An own order left the book.
    OwnRemoved {
        order: OwnOrder,
        reason: RemoveReason,
    },
    /// The exchange rejected an operation for pacing reasons.
    RateLimited,
    /// Book, own orders and (if enabled) history finished their initial
    /// load. Emitted once per connection, re-armed on disconnect.
    Ready,
}
