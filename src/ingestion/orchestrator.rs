use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::exchange::client::ExchangeClient;
use crate::ledger::recorder::TradeFill;
use crate::types::{OrderSide, OrderType, TradeRecordStatus};

const CHANNEL_WATCHDOG_SECS: u64 = 60;
const MAX_BACKOFF_SECS: u64 = 60;
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

#[derive(Clone, Copy, PartialEq, Eq)]
enum ConnectionKind {
    Market,
    User,
}

impl ConnectionKind {
    fn label(self) -> &'static str {
        match self {
            ConnectionKind::Market => "market",
            ConnectionKind::User => "user",
        }
    }
}

fn backoff_for(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt.min(6)).min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs.max(1))
}

/// Runs both the market and user connections concurrently. Each maintains
/// its own reconnect loop and never returns under normal operation.
pub async fn run(state: Arc<AppState>, exchange: Arc<ExchangeClient>) {
    let market_channels: Vec<String> = {
        let symbols = state.runtime_config.read().symbols.clone();
        symbols.iter().map(|s| format!("ticker:{}", s.to_lowercase())).collect()
    };

    tokio::join!(
        run_connection(state.clone(), exchange.clone(), ConnectionKind::Market, market_channels),
        run_connection(state, exchange, ConnectionKind::User, vec!["fills".to_string()]),
    );
}

async fn run_connection(
    state: Arc<AppState>,
    exchange: Arc<ExchangeClient>,
    kind: ConnectionKind,
    channels: Vec<String>,
) {
    let mut attempt: u32 = 0;

    loop {
        let jwt = match exchange.refresh_jwt_if_needed() {
            Ok(t) => t,
            Err(e) => {
                error!(connection = kind.label(), error = %e, "failed to mint JWT, backing off");
                tokio::time::sleep(backoff_for(attempt)).await;
                attempt = (attempt + 1).min(MAX_RECONNECT_ATTEMPTS);
                continue;
            }
        };

        let base_url = match kind {
            ConnectionKind::Market => std::env::var("AURORA_WS_MARKET_URL")
                .unwrap_or_else(|_| "wss://stream.binance.com:9443/ws/ingestion".to_string()),
            ConnectionKind::User => std::env::var("AURORA_WS_USER_URL")
                .unwrap_or_else(|_| "wss://stream.binance.com:9443/ws/user".to_string()),
        };
        let url = format!("{base_url}?token={jwt}");

        info!(connection = kind.label(), attempt, "connecting");
        let stream = match connect_async(&url).await {
            Ok((s, _)) => s,
            Err(e) => {
                warn!(connection = kind.label(), error = %e, attempt, "connect failed");
                tokio::time::sleep(backoff_for(attempt)).await;
                attempt = (attempt + 1).min(MAX_RECONNECT_ATTEMPTS);
                continue;
            }
        };
        attempt = 0;
        info!(connection = kind.label(), "connected");

        let (mut write, mut read) = stream.split();
        let mut subscribed: HashSet<String> = HashSet::new();
        let mut subscribe_failed = false;
        for channel in &channels {
            let frame = serde_json::json!({"op": "subscribe", "channel": channel}).to_string();
            if write.send(Message::Text(frame)).await.is_err() {
                subscribe_failed = true;
                break;
            }
            subscribed.insert(channel.clone());
        }
        if subscribe_failed {
            warn!(connection = kind.label(), "resubscribe failed, reconnecting");
            continue;
        }
        info!(connection = kind.label(), channels = subscribed.len(), "subscribed");

        if kind == ConnectionKind::User {
            *state.ws_user_connected.write() = true;
        }

        let mut last_activity = Instant::now();
        loop {
            match timeout(Duration::from_secs(CHANNEL_WATCHDOG_SECS), read.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    last_activity = Instant::now();
                    dispatch(&state, kind, &text).await;
                }
                Ok(Some(Ok(_))) => {
                    last_activity = Instant::now();
                }
                Ok(Some(Err(e))) => {
                    warn!(connection = kind.label(), error = %e, "read error, reconnecting");
                    break;
                }
                Ok(None) => {
                    warn!(connection = kind.label(), "stream ended, reconnecting");
                    break;
                }
                Err(_) => {
                    warn!(
                        connection = kind.label(),
                        idle_secs = last_activity.elapsed().as_secs(),
                        "channel watchdog timeout, reconnecting"
                    );
                    break;
                }
            }
        }

        if kind == ConnectionKind::User {
            *state.ws_user_connected.write() = false;
        }
    }
}

async fn dispatch(state: &Arc<AppState>, kind: ConnectionKind, text: &str) {
    *state.last_ws_user_event.write() = Instant::now();

    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse ingestion message");
            return;
        }
    };

    match kind {
        ConnectionKind::Market => {
            if let (Some(symbol), Some(price)) = (
                value.get("symbol").and_then(|v| v.as_str()),
                value.get("price").and_then(|v| v.as_str()).and_then(|s| s.parse::<f64>().ok()),
            ) {
                // Ticker-only update; quantity 0 so it doesn't skew CVD/volume
                // tracked from the dedicated aggTrade stream.
                if let Some(tp) = state.trade_processors.read().get(symbol) {
                    tp.process_trade(price, 0.0, false);
                }
            }
        }
        ConnectionKind::User => {
            if value.get("type").and_then(|v| v.as_str()) == Some("fill") {
                if let Some(fill) = parse_fill(&value) {
                    if let Err(e) = state.trade_recorder.enqueue_trade(fill).await {
                        error!(error = %e, "failed to enqueue fill from user stream");
                    }
                }
            }
        }
    }

    state.increment_version();
}

fn parse_fill(value: &serde_json::Value) -> Option<TradeFill> {
    let order_id = value.get("order_id")?.as_str()?.to_string();
    let symbol = value.get("symbol")?.as_str()?.to_string();
    let side = match value.get("side")?.as_str()? {
        "BUY" => OrderSide::Buy,
        "SELL" => OrderSide::Sell,
        _ => return None,
    };
    let price = value.get("price")?.as_str()?.parse().ok()?;
    let size = value.get("size")?.as_str()?.parse().ok()?;
    let fees = value
        .get("fee_usd")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();

    Some(TradeFill {
        order_id,
        symbol,
        side,
        order_time: chrono::Utc::now(),
        price,
        size,
        total_fees_usd: fees,
        trigger: "ws_fill".to_string(),
        order_type: OrderType::Limit,
        status: TradeRecordStatus::Filled,
        source: "websocket".to_string(),
        ingest_via: "ingestion_orchestrator".to_string(),
    })
}
