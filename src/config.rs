//! Client configuration.

/// Default streaming endpoint.
pub const DEFAULT_WS_URL: &str = "wss://stream.marlinx.io/ws";

/// Default HTTP API prefix (used for the signed fallback channel and the
/// out-of-band full-depth / history downloads).
pub const DEFAULT_API_URL: &str = "https://api.marlinx.io/v1";

/// API key and secret for the account channel and signed calls.
///
/// Absence of credentials is not an error: the client degrades to
/// market-data-only operation.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub key: String,
    pub secret: String,
}

/// All tuneable parameters for a [`Session`](crate::session::Session).
///
/// Use [`Config::new`] for one trading pair with defaults, then adjust
/// fields as needed.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base currency of the traded pair (e.g. "BTC").
    pub base_currency: String,
    /// Quote currency of the traded pair (e.g. "USD").
    pub quote_currency: String,
    /// WebSocket endpoint.
    pub ws_url: String,
    /// HTTP API prefix, without trailing slash.
    pub api_url: String,
    /// Download the authoritative full book after (re)connect.
    pub load_fulldepth: bool,
    /// Download recent trade history after (re)connect.
    pub load_history: bool,
    /// Candle timeframe in minutes; bounds the initial history request.
    pub history_timeframe_mins: u32,
    /// Account credentials, `None` for market-data-only operation.
    pub credentials: Option<Credentials>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_currency: "BTC".to_string(),
            quote_currency: "USD".to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            load_fulldepth: true,
            load_history: true,
            history_timeframe_mins: 15,
            credentials: None,
        }
    }
}

impl Config {
    /// Config for one trading pair with all defaults.
    pub fn new(base: &str, quote: &str) -> Self {
        Self {
            base_currency: base.to_string(),
            quote_currency: quote.to_string(),
            ..Default::default()
        }
    }

    /// Concatenated pair symbol as the exchange expects it (e.g. "BTCUSD").
    pub fn pair(&self) -> String {
        format!("{}{}", self.base_currency, self.quote_currency)
    }
}
