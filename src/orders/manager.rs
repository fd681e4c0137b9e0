// =============================================================================
// Trade Order Manager (SPEC_FULL.md §4.E)
// =============================================================================
//
// `build_order_data` sizes the intent, `adjust_price_and_size` quantizes it
// to exchange precision, `OrderManager::place` submits it. Placement is
// idempotent on `client_order_id`: a retry that finds the id already in
// `order_tracker` returns the tracked result without re-submitting.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::binance::client::BinanceClient;
use crate::error::BotError;
use crate::snapshot::SnapshotService;
use crate::types::{OrderData, OrderSide, OrderSource, OrderType};

#[derive(Debug, Clone, Copy)]
pub struct SymbolPrecision {
    pub base_increment: Decimal,
    pub quote_increment: Decimal,
    pub price_tick: Decimal,
}

#[derive(Debug, Clone)]
pub struct BuildOrderInputs {
    pub source: OrderSource,
    pub trigger: String,
    pub symbol: String,
    pub base_currency: String,
    pub quote_currency: String,
    pub side: OrderSide,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub available_fiat_balance: Decimal,
    pub available_base_balance: Decimal,
    pub fiat_order_size: Decimal,
    pub taker_fee_pct: Decimal,
    pub snapshot_id: Option<Uuid>,
}

/// Build an `OrderData` intent. Buy sizing derives base quantity from the
/// configured fiat order size divided by the ask-adjusted price with a
/// taker-fee cushion; sell sizing defaults to the full available base
/// balance.
pub fn build_order_data(inputs: &BuildOrderInputs) -> OrderData {
    let (requested_fiat_amount, requested_base_amount) = match inputs.side {
        OrderSide::Buy => {
            let fee_cushion = Decimal::ONE + inputs.taker_fee_pct;
            let effective_price = inputs.best_ask * fee_cushion;
            let base_amount = if effective_price > Decimal::ZERO {
                inputs.fiat_order_size / effective_price
            } else {
                Decimal::ZERO
            };
            (Some(inputs.fiat_order_size), Some(base_amount))
        }
        OrderSide::Sell => (None, Some(inputs.available_base_balance)),
    };

    OrderData {
        client_order_id: Uuid::new_v4(),
        source: inputs.source,
        trigger: inputs.trigger.clone(),
        symbol: inputs.symbol.clone(),
        base_currency: inputs.base_currency.clone(),
        quote_currency: inputs.quote_currency.clone(),
        side: inputs.side,
        order_type: OrderType::Limit,
        requested_fiat_amount,
        requested_base_amount,
        adjusted_price: None,
        adjusted_size: None,
        created_at: Utc::now(),
        snapshot_id: inputs.snapshot_id,
        available_fiat_balance: inputs.available_fiat_balance,
        available_base_balance: inputs.available_base_balance,
    }
}

fn quantize_down(value: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    (value / increment).round_dp_with_strategy(0, RoundingStrategy::ToZero) * increment
}

/// Quantize price/size to the exchange's increments. Buy price sits slightly
/// above the best bid; sell price slightly below the best ask. The offset is
/// the larger of 0.5% of the bid/ask spread and one price tick.
pub fn adjust_price_and_size(
    order: &OrderData,
    precision: &SymbolPrecision,
    best_bid: Decimal,
    best_ask: Decimal,
) -> (Decimal, Decimal) {
    let spread = best_ask - best_bid;
    let offset = (spread * Decimal::new(5, 3)).max(precision.price_tick);

    let raw_price = match order.side {
        OrderSide::Buy => best_bid + offset,
        OrderSide::Sell => best_ask - offset,
    };
    let price = quantize_down(raw_price, precision.price_tick).max(precision.price_tick);

    let raw_size = order.requested_base_amount.unwrap_or(Decimal::ZERO);
    let size = quantize_down(raw_size, precision.base_increment);

    (price, size)
}

struct TrackedOrder {
    order_data: OrderData,
    exchange_response: serde_json::Value,
}

pub struct OrderManager {
    client: std::sync::Arc<BinanceClient>,
    snapshots: std::sync::Arc<SnapshotService>,
    order_tracker: Mutex<HashMap<Uuid, TrackedOrder>>,
}

impl OrderManager {
    pub fn new(client: std::sync::Arc<BinanceClient>, snapshots: std::sync::Arc<SnapshotService>) -> Self {
        Self {
            client,
            snapshots,
            order_tracker: Mutex::new(HashMap::new()),
        }
    }

    /// Place `order` (already price/size-adjusted). Idempotent on
    /// `client_order_id`: a retry that finds the id tracked already returns
    /// the prior response without re-submitting to the exchange.
    #[instrument(skip(self, order), fields(symbol = %order.symbol, side = %order.side))]
    pub async fn place(&self, order: OrderData) -> Result<serde_json::Value, BotError> {
        if let Some(tracked) = self.order_tracker.lock().get(&order.client_order_id) {
            info!(client_order_id = %order.client_order_id, "order already tracked, returning cached result");
            return Ok(tracked.exchange_response.clone());
        }

        let price = order.adjusted_price.ok_or_else(|| {
            BotError::BadRequest("order must be price-adjusted before placement".into())
        })?;
        let size = order.adjusted_size.ok_or_else(|| {
            BotError::BadRequest("order must be size-adjusted before placement".into())
        })?;

        let side_str = order.side.to_string();
        let response = self
            .client
            .place_order(
                &order.symbol,
                &side_str,
                "LIMIT",
                size.to_string().parse::<f64>().unwrap_or(0.0),
                Some(price.to_string().parse::<f64>().unwrap_or(0.0)),
                Some("GTC"),
                Some(&order.client_order_id.to_string()),
            )
            .await
            .map_err(|e| BotError::Unknown(e.to_string()))?;

        if let Some(snapshot_id) = order.snapshot_id {
            if let Err(err) = self.snapshots.link_trade(&order.client_order_id.to_string(), snapshot_id) {
                warn!(error = %err, "failed to write strategy-link row for placed order");
            }
        }

        self.order_tracker.lock().insert(
            order.client_order_id,
            TrackedOrder {
                order_data: order,
                exchange_response: response.clone(),
            },
        );

        Ok(response)
    }

    pub fn is_tracked(&self, client_order_id: &Uuid) -> bool {
        self.order_tracker.lock().contains_key(client_order_id)
    }

    pub fn tracked_order(&self, client_order_id: &Uuid) -> Option<OrderData> {
        self.order_tracker.lock().get(client_order_id).map(|t| t.order_data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_inputs(side: OrderSide) -> BuildOrderInputs {
        BuildOrderInputs {
            source: OrderSource::Websocket,
            trigger: "score".to_string(),
            symbol: "BTC-USD".to_string(),
            base_currency: "BTC".to_string(),
            quote_currency: "USD".to_string(),
            side,
            best_bid: dec!(39990),
            best_ask: dec!(40010),
            available_fiat_balance: dec!(1000),
            available_base_balance: dec!(0.05),
            fiat_order_size: dec!(400),
            taker_fee_pct: dec!(0.001),
            snapshot_id: None,
        }
    }

    #[test]
    fn buy_sizing_applies_fee_cushion() {
        let inputs = sample_inputs(OrderSide::Buy);
        let order = build_order_data(&inputs);
        let base = order.requested_base_amount.unwrap();
        // 400 / (40010 * 1.001) is just under 400/40010
        assert!(base < dec!(400) / dec!(40010));
        assert!(base > dec!(0.0099));
    }

    #[test]
    fn sell_sizing_uses_full_available_balance() {
        let inputs = sample_inputs(OrderSide::Sell);
        let order = build_order_data(&inputs);
        assert_eq!(order.requested_base_amount.unwrap(), dec!(0.05));
    }

    #[test]
    fn buy_price_sits_above_bid_sell_price_below_ask() {
        let precision = SymbolPrecision {
            base_increment: dec!(0.00001),
            quote_increment: dec!(0.01),
            price_tick: dec!(0.01),
        };

        let buy = build_order_data(&sample_inputs(OrderSide::Buy));
        let (buy_price, _) = adjust_price_and_size(&buy, &precision, dec!(39990), dec!(40010));
        assert!(buy_price > dec!(39990));
        assert!(buy_price < dec!(40010));

        let sell = build_order_data(&sample_inputs(OrderSide::Sell));
        let (sell_price, sell_size) = adjust_price_and_size(&sell, &precision, dec!(39990), dec!(40010));
        assert!(sell_price < dec!(40010));
        assert_eq!(sell_size, dec!(0.05));
    }

    #[test]
    fn offset_is_at_least_one_price_tick_on_tight_spread() {
        let precision = SymbolPrecision {
            base_increment: dec!(0.00001),
            quote_increment: dec!(0.01),
            price_tick: dec!(0.5),
        };
        let buy = build_order_data(&sample_inputs(OrderSide::Buy));
        let (buy_price, _) = adjust_price_and_size(&buy, &precision, dec!(40000), dec!(40000.01));
        assert!(buy_price >= dec!(40000) + dec!(0.5));
    }
}
