//! Order book engine.
//!
//! Maintains both sides of the book as price-sorted level vectors, the best
//! bid/ask scalars, running totals, and the list of own orders with their
//! per-level volume markers. All mutators are pure state transitions: they
//! take one normalized event, update the book, and return the change
//! notifications for the caller to publish. Nothing here touches the bus or
//! the network.
//!
//! Sorting convention: `asks` ascending by price, `bids` descending, so
//! index 0 is always the best level of its side.

use rust_decimal::Decimal;

use crate::events::{
    BookEntry, DepthSnapshot, Event, OrderStatus, OwnOrder, OwnOrderKind, OwnOrderUpdate,
    RemoveReason, Side,
};

/// One price level.
#[derive(Debug, Clone, PartialEq)]
pub struct Level {
    pub price: Decimal,
    /// Total volume at this price as reported by the exchange.
    pub volume: Decimal,
    /// Portion of `volume` belonging to own orders.
    pub own_volume: Decimal,
    /// Cumulative base volume from the best level through this one.
    /// Valid only up to the side's cache watermark.
    cache_total: Decimal,
    /// Cumulative quote volume (`sum(volume * price)`), same validity.
    cache_total_quote: Decimal,
}

impl Level {
    fn new(price: Decimal, volume: Decimal) -> Self {
        Self {
            price,
            volume,
            own_volume: Decimal::ZERO,
            cache_total: Decimal::ZERO,
            cache_total_quote: Decimal::ZERO,
        }
    }
}

/// Full book state for one trading pair.
#[derive(Debug, Default)]
pub struct OrderBook {
    /// Ascending by price.
    asks: Vec<Level>,
    /// Descending by price.
    bids: Vec<Level>,
    /// Best bid, as last told by ticker or derived from the book.
    bid: Decimal,
    /// Best ask, likewise.
    ask: Decimal,
    /// Total base volume on the ask side.
    total_ask: Decimal,
    /// Total quote volume (`sum(volume * price)`) on the bid side.
    total_bid_quote: Decimal,
    /// Orders belonging to the local account.
    owns: Vec<OwnOrder>,
    /// Highest index whose cumulative caches are valid, -1 for none.
    valid_ask_cache: isize,
    valid_bid_cache: isize,
}

impl OrderBook {
    pub fn new() -> Self {
        Self {
            valid_ask_cache: -1,
            valid_bid_cache: -1,
            ..Default::default()
        }
    }

    // -- accessors -----------------------------------------------------------

    pub fn bid(&self) -> Decimal {
        self.bid
    }

    pub fn ask(&self) -> Decimal {
        self.ask
    }

    /// Total base volume offered on the ask side.
    pub fn total_ask(&self) -> Decimal {
        self.total_ask
    }

    /// Total quote volume bid on the bid side.
    pub fn total_bid_quote(&self) -> Decimal {
        self.total_bid_quote
    }

    pub fn asks(&self) -> &[Level] {
        &self.asks
    }

    pub fn bids(&self) -> &[Level] {
        &self.bids
    }

    pub fn owns(&self) -> &[OwnOrder] {
        &self.owns
    }

    pub fn have_own_id(&self, exchange_id: &str) -> bool {
        self.owns.iter().any(|o| o.exchange_id == exchange_id)
    }

    /// Own volume resting at `price` on `side`.
    pub fn own_volume_at(&self, side: Side, price: Decimal) -> Decimal {
        self.side_levels(side)
            .iter()
            .find(|l| l.price == price)
            .map(|l| l.own_volume)
            .unwrap_or(Decimal::ZERO)
    }

    /// Cumulative `(base, quote)` volume from the best level of `side`
    /// through the level at (or just before) `price`.
    ///
    /// Served from per-level caches; on a miss the walk resumes at the cache
    /// watermark, so repeated queries after one book change stay cheap.
    pub fn total_up_to(&mut self, side: Side, price: Decimal) -> (Decimal, Decimal) {
        let idx = match self.find_index(side, price) {
            Ok(i) => i,
            Err(0) => return (Decimal::ZERO, Decimal::ZERO),
            Err(i) => i - 1,
        };

        let (levels, valid) = match side {
            Side::Ask => (&mut self.asks, &mut self.valid_ask_cache),
            Side::Bid => (&mut self.bids, &mut self.valid_bid_cache),
        };

        if (idx as isize) > *valid {
            let start = (*valid + 1) as usize;
            let (mut total, mut total_quote) = if start == 0 {
                (Decimal::ZERO, Decimal::ZERO)
            } else {
                let prev = &levels[start - 1];
                (prev.cache_total, prev.cache_total_quote)
            };
            for level in &mut levels[start..=idx] {
                total += level.volume;
                total_quote += level.volume * level.price;
                level.cache_total = total;
                level.cache_total_quote = total_quote;
            }
            *valid = idx as isize;
        }

        let level = &levels[idx];
        (level.cache_total, level.cache_total_quote)
    }

    // -- market data ---------------------------------------------------------

    /// Apply one depth delta: the level at `price` now holds exactly
    /// `total_volume`; zero removes the level. Deltas that change nothing
    /// (removal of an absent level, or a volume the level already holds)
    /// emit no notices.
    pub fn apply_depth(&mut self, side: Side, price: Decimal, total_volume: Decimal) -> Vec<Event> {
        match self.find_index(side, price) {
            Ok(i) => {
                let old = self.side_levels(side)[i].volume;
                if total_volume == old {
                    return Vec::new();
                }
                if total_volume.is_zero() {
                    let own = self.side_levels(side)[i].own_volume;
                    if own.is_zero() {
                        self.remove_level(side, i);
                    } else {
                        // Own order still resting here; keep the marker.
                        self.side_levels_mut(side)[i].volume = Decimal::ZERO;
                    }
                } else {
                    self.side_levels_mut(side)[i].volume = total_volume;
                }
                self.adjust_total(side, price, total_volume - old);
                self.invalidate_cache_from(side, i);
            }
            Err(i) => {
                if total_volume.is_zero() {
                    return Vec::new();
                }
                self.side_levels_mut(side)
                    .insert(i, Level::new(price, total_volume));
                self.adjust_total(side, price, total_volume);
                self.invalidate_cache_from(side, i);
            }
        }
        self.refresh_best(side);
        vec![Event::BookChanged]
    }

    /// Apply one public trade.
    ///
    /// Non-own trades erode the top of the opposite book: a bid-initiated
    /// trade consumed ask volume, so the matching top ask shrinks (and stale
    /// crossed levels below the trade price are dropped) before the depth
    /// feed catches up. Own fills are handled through the own-order channel,
    /// so the erosion is skipped for them.
    pub fn apply_trade(
        &mut self,
        side: Side,
        price: Decimal,
        volume: Decimal,
        own: bool,
    ) -> Vec<Event> {
        if !own {
            let eroded_side = side.opposite();
            self.repair_crossed(eroded_side, price);
            self.erode_top(eroded_side, price, volume);
            self.refresh_best(eroded_side);
        }
        vec![Event::BookChanged]
    }

    /// Apply the authoritative best bid/ask. Book levels that cross the new
    /// best prices are stale leftovers and are dropped.
    pub fn apply_ticker(&mut self, bid: Decimal, ask: Decimal) -> Vec<Event> {
        self.bid = bid;
        self.ask = ask;
        self.repair_crossed(Side::Ask, ask);
        self.repair_crossed(Side::Bid, bid);
        vec![Event::BookChanged]
    }

    /// Replace the whole book from an out-of-band full-depth snapshot.
    pub fn apply_snapshot(&mut self, snapshot: &DepthSnapshot) -> Vec<Event> {
        fn build(entries: &[BookEntry]) -> Vec<Level> {
            entries
                .iter()
                .map(|e| Level::new(e.price, e.amount))
                .collect()
        }

        self.asks = build(&snapshot.asks);
        self.bids = build(&snapshot.bids);
        // The download is expected pre-sorted, but a snapshot is the one
        // place where we can restore the invariant cheaply.
        self.asks.sort_by(|a, b| a.price.cmp(&b.price));
        self.bids.sort_by(|a, b| b.price.cmp(&a.price));

        self.total_ask = self.asks.iter().map(|l| l.volume).sum();
        self.total_bid_quote = self.bids.iter().map(|l| l.volume * l.price).sum();
        self.valid_ask_cache = -1;
        self.valid_bid_cache = -1;
        self.refresh_best(Side::Ask);
        self.refresh_best(Side::Bid);

        let marks: Vec<(Side, Decimal)> = self.owns.iter().map(|o| (o.side, o.price)).collect();
        for (side, price) in marks {
            self.refresh_own_volume(side, price);
        }

        vec![Event::DepthInitialized, Event::BookChanged]
    }

    // -- own orders ----------------------------------------------------------

    /// Replace the own-order list from the authoritative snapshot.
    pub fn init_owns(&mut self, owns: Vec<OwnOrder>) -> Vec<Event> {
        let stale: Vec<(Side, Decimal)> = self.owns.iter().map(|o| (o.side, o.price)).collect();
        self.owns = owns;
        let fresh: Vec<(Side, Decimal)> = self.owns.iter().map(|o| (o.side, o.price)).collect();
        for (side, price) in stale.into_iter().chain(fresh) {
            self.refresh_own_volume(side, price);
        }
        vec![
            Event::OwnsInitialized,
            Event::BookChanged,
            Event::OwnsChanged,
        ]
    }

    /// Apply one own-order report or removal.
    pub fn apply_own_order(&mut self, update: &OwnOrderUpdate) -> Vec<Event> {
        match &update.kind {
            OwnOrderKind::Removed { reason } => self.remove_own(&update.exchange_id, *reason),
            OwnOrderKind::Report {
                price,
                volume,
                side,
                status,
            } => self.report_own(&update.exchange_id, *price, *volume, *side, *status),
        }
    }

    fn remove_own(&mut self, exchange_id: &str, reason: RemoveReason) -> Vec<Event> {
        let Some(idx) = self.owns.iter().position(|o| o.exchange_id == exchange_id) else {
            // Removal for an order we never tracked; nothing to undo.
            return Vec::new();
        };
        // Market orders execute immediately and report a spurious passive
        // completion alongside the active one.
        if reason == RemoveReason::CompletedPassive && self.owns[idx].price.is_zero() {
            return Vec::new();
        }
        let order = self.owns.remove(idx);
        self.refresh_own_volume(order.side, order.price);
        vec![
            Event::OwnRemoved { order, reason },
            Event::BookChanged,
            Event::OwnsChanged,
        ]
    }

    fn report_own(
        &mut self,
        exchange_id: &str,
        price: Decimal,
        volume: Decimal,
        side: Side,
        status: OrderStatus,
    ) -> Vec<Event> {
        let mut notices = Vec::new();
        match self.owns.iter().position(|o| o.exchange_id == exchange_id) {
            Some(idx) => {
                let old = self.owns[idx].clone();
                let delta = volume - old.volume;
                let opened = old.status != OrderStatus::Open && status == OrderStatus::Open;
                {
                    let order = &mut self.owns[idx];
                    order.price = price;
                    order.volume = volume;
                    order.side = side;
                    order.status = status;
                }
                let updated = self.owns[idx].clone();
                if old.price != price || !delta.is_zero() {
                    self.refresh_own_volume(old.side, old.price);
                    self.refresh_own_volume(side, price);
                }
                if opened {
                    notices.push(Event::OwnOpened(updated.clone()));
                }
                if !delta.is_zero() {
                    notices.push(Event::OwnFill {
                        order: updated,
                        delta,
                    });
                }
                notices.push(Event::BookChanged);
                notices.push(Event::OwnsChanged);
            }
            None => {
                let order = OwnOrder {
                    price,
                    volume,
                    side,
                    exchange_id: exchange_id.to_string(),
                    status,
                };
                self.owns.push(order.clone());
                self.refresh_own_volume(side, price);
                notices.push(Event::OwnAdded(order.clone()));
                if status == OrderStatus::Open {
                    notices.push(Event::OwnOpened(order));
                }
                notices.push(Event::BookChanged);
                notices.push(Event::OwnsChanged);
            }
        }
        notices
    }

    // -- internals -----------------------------------------------------------

    fn side_levels(&self, side: Side) -> &Vec<Level> {
        match side {
            Side::Ask => &self.asks,
            Side::Bid => &self.bids,
        }
    }

    fn side_levels_mut(&mut self, side: Side) -> &mut Vec<Level> {
        match side {
            Side::Ask => &mut self.asks,
            Side::Bid => &mut self.bids,
        }
    }

    /// Index of the level at `price`, or the insertion point keeping the
    /// side's sort order.
    fn find_index(&self, side: Side, price: Decimal) -> std::result::Result<usize, usize> {
        match side {
            Side::Ask => self.asks.binary_search_by(|l| l.price.cmp(&price)),
            Side::Bid => self.bids.binary_search_by(|l| price.cmp(&l.price)),
        }
    }

    fn adjust_total(&mut self, side: Side, price: Decimal, volume_delta: Decimal) {
        match side {
            Side::Ask => self.total_ask += volume_delta,
            Side::Bid => self.total_bid_quote += volume_delta * price,
        }
    }

    fn remove_level(&mut self, side: Side, idx: usize) {
        self.side_levels_mut(side).remove(idx);
        self.invalidate_cache_from(side, idx);
    }

    /// Cached cumulative totals from `idx` on are stale.
    fn invalidate_cache_from(&mut self, side: Side, idx: usize) {
        let valid = match side {
            Side::Ask => &mut self.valid_ask_cache,
            Side::Bid => &mut self.valid_bid_cache,
        };
        *valid = (*valid).min(idx as isize - 1);
    }

    fn refresh_best(&mut self, side: Side) {
        // An empty side keeps the last known best rather than zeroing it.
        match side {
            Side::Ask => {
                if let Some(top) = self.asks.first() {
                    self.ask = top.price;
                }
            }
            Side::Bid => {
                if let Some(top) = self.bids.first() {
                    self.bid = top.price;
                }
            }
        }
    }

    /// Drop leading levels of `side` that cross `boundary`: asks priced
    /// below it, bids priced above it. They were consumed but the depth feed
    /// has not said so yet.
    fn repair_crossed(&mut self, side: Side, boundary: Decimal) {
        if boundary.is_zero() {
            return;
        }
        loop {
            let Some(top) = self.side_levels(side).first() else {
                break;
            };
            let crossed = match side {
                Side::Ask => top.price < boundary,
                Side::Bid => top.price > boundary,
            };
            if !crossed {
                break;
            }
            let (price, volume) = (top.price, top.volume);
            self.adjust_total(side, price, -volume);
            self.remove_level(side, 0);
        }
    }

    /// Shrink the top level of `side` by `volume` if the trade price matches
    /// it, removing the level when nothing is left.
    fn erode_top(&mut self, side: Side, price: Decimal, volume: Decimal) {
        let Some(top) = self.side_levels(side).first() else {
            return;
        };
        if top.price != price {
            return;
        }
        let remaining = top.volume - volume;
        let mut consumed = -volume;
        if remaining <= Decimal::ZERO {
            // Over-erosion is clamped: only the volume that was actually
            // there leaves the total.
            consumed -= remaining;
            self.remove_level(side, 0);
        } else {
            self.side_levels_mut(side)[0].volume = remaining;
            self.invalidate_cache_from(side, 0);
        }
        self.adjust_total(side, price, consumed);
    }

    /// Recompute the own-volume marker at one price from the own-order list,
    /// creating or pruning the bare level as needed.
    fn refresh_own_volume(&mut self, side: Side, price: Decimal) {
        if price.is_zero() {
            // Market orders carry no resting price.
            return;
        }
        let own: Decimal = self
            .owns
            .iter()
            .filter(|o| o.side == side && o.price == price)
            .map(|o| o.volume)
            .sum();
        match self.find_index(side, price) {
            Ok(i) => {
                self.side_levels_mut(side)[i].own_volume = own;
                let level = &self.side_levels(side)[i];
                if level.volume.is_zero() && level.own_volume.is_zero() {
                    self.remove_level(side, i);
                }
            }
            Err(i) => {
                if !own.is_zero() {
                    // The depth feed has not shown this level yet; track the
                    // own volume on a bare level.
                    let mut level = Level::new(price, Decimal::ZERO);
                    level.own_volume = own;
                    self.side_levels_mut(side).insert(i, level);
                    self.invalidate_cache_from(side, i);
                }
            }
        }
    }
}
