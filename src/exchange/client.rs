// =============================================================================
// ExchangeClient — spec.md §4.A operations over the Binance REST transport
// =============================================================================
//
// Wraps `BinanceClient` without changing its wire behaviour; this is the
// seam that maps `anyhow::Error` into the closed `BotError` taxonomy and adds
// the operations the rest of the engine needs that the raw client doesn't
// expose on its own (batch cancel, JWT refresh).

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::binance::client::BinanceClient;
use crate::error::BotError;
use crate::exchange::ws;

/// Outcome of a single id within a batch cancel request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CancelResult {
    pub order_id: u64,
    pub ok: bool,
    pub failure_reason: Option<String>,
}

fn map_anyhow(err: anyhow::Error) -> BotError {
    BotError::Unknown(err.to_string())
}

/// Exchange-agnostic operations facade. Holds the JWT cache so repeated
/// `refresh_jwt_if_needed` calls across reconnects reuse a live token.
pub struct ExchangeClient {
    inner: Arc<BinanceClient>,
    jwt: RwLock<Option<(String, i64)>>,
}

impl ExchangeClient {
    pub fn new(inner: Arc<BinanceClient>) -> Self {
        Self {
            inner,
            jwt: RwLock::new(None),
        }
    }

    pub async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        quantity: f64,
        price: Option<f64>,
        time_in_force: Option<&str>,
        client_order_id: Option<&str>,
    ) -> Result<serde_json::Value, BotError> {
        self.inner
            .place_order(symbol, side, order_type, quantity, price, time_in_force, client_order_id)
            .await
            .map_err(map_anyhow)
    }

    /// Binance has no native multi-id cancel endpoint; this issues one
    /// DELETE per id and reports each outcome rather than failing the batch
    /// on the first error.
    pub async fn cancel_orders(&self, symbol: &str, order_ids: &[u64]) -> Vec<CancelResult> {
        let mut results = Vec::with_capacity(order_ids.len());
        for &id in order_ids {
            match self.inner.cancel_order(symbol, id).await {
                Ok(_) => results.push(CancelResult {
                    order_id: id,
                    ok: true,
                    failure_reason: None,
                }),
                Err(e) => {
                    let mapped = map_anyhow(e);
                    warn!(symbol, order_id = id, error = %mapped, "cancel failed");
                    results.push(CancelResult {
                        order_id: id,
                        ok: false,
                        failure_reason: Some(mapped.to_string()),
                    });
                }
            }
        }
        results
    }

    pub async fn get_historical_orders_batch(
        &self,
        symbol: &str,
        order_ids: &[u64],
    ) -> Result<Vec<serde_json::Value>, BotError> {
        let mut out = Vec::with_capacity(order_ids.len());
        for &id in order_ids {
            out.push(self.inner.get_order(symbol, id).await.map_err(map_anyhow)?);
        }
        Ok(out)
    }

    pub async fn get_fills(
        &self,
        symbol: &str,
        order_id: Option<u64>,
    ) -> Result<Vec<serde_json::Value>, BotError> {
        self.inner.get_my_trades(symbol, order_id).await.map_err(map_anyhow)
    }

    /// Mint (or reuse) the JWT the ingestion orchestrator presents on its
    /// WebSocket handshake. Refreshes within 60s of expiry.
    pub fn refresh_jwt_if_needed(&self) -> Result<String, BotError> {
        ws::refresh_jwt_if_needed(&self.jwt, self.inner.api_key(), self.inner.secret())
    }
}
