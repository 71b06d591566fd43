//! Streaming exchange client: live order book, own-order tracking, and
//! queued signed account calls for one trading pair.
//!
//! Quick start:
//!
//! ```no_run
//! use marlin::{Config, Event, Session};
//!
//! # async fn run() {
//! let session = Session::new(Config::new("BTC", "USD"));
//! let _sub = session.bus().subscribe(|event| {
//!     if let Event::Ticker { bid, ask } = event {
//!         println!("{bid} / {ask}");
//!     }
//!     Ok(())
//! });
//! session.start();
//! # }
//! ```

pub mod book;
pub mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod nonce;
pub mod rest;
pub mod session;
pub mod signing;
pub mod wire;

pub use book::{Level, OrderBook};
pub use bus::{Bus, Subscription};
pub use config::{Config, Credentials};
pub use error::{MarlinError, Result};
pub use events::{
    BookEntry, DepthSnapshot, Event, HistoryTrade, OrderStatus, OwnOrder, OwnOrderKind,
    OwnOrderUpdate, RemoveReason, Side,
};
pub use session::Session;
