// =============================================================================
// Aurora Spot Nexus — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety. Users must explicitly
// switch to Live mode via the dashboard or API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod db;
mod decision_envelope;
mod error;
mod exchange;
mod execution;
mod exit;
mod indicators;
mod ingestion;
mod ledger;
mod market_data;
mod orders;
mod position_engine;
mod reconcile;
mod regime;
mod risk;
mod runtime_config;
mod signals;
mod snapshot;
mod types;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::db::Db;
use crate::decision_envelope::DecisionEnvelope;
use crate::exchange::client::ExchangeClient;
use crate::execution::{ExecutionEngine, ExecutionResult};
use crate::exit::monitor::PositionMonitorConfig;
use crate::ledger::recorder::TradeFill;
use crate::runtime_config::RuntimeConfig;
use crate::signals::engine::SignalEngineConfig;
use crate::snapshot::SnapshotInput;
use crate::types::{AccountMode, BracketOrder, BracketStatus, OrderSide, OrderType, SignalAction, TradeRecordStatus};

fn decimal_from_f64(v: f64) -> Decimal {
    Decimal::from_str(&format!("{v:.8}")).unwrap_or(Decimal::ZERO)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Spot Nexus — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: Force Demo + Paused on startup.
    config.trading_mode = types::TradingMode::Paused;
    config.account_mode = AccountMode::Demo;

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("AURORA_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.symbols.is_empty() {
        config.symbols = vec![
            "BTCUSDT".into(),
            "ETHUSDT".into(),
            "BNBUSDT".into(),
            "XRPUSDT".into(),
            "SOLUSDT".into(),
        ];
    }

    info!(symbols = ?config.symbols, "Configured trading pairs");
    info!(
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        "Engine starting in SAFE mode (Demo + Paused)"
    );

    // ── 2. Build the ledger database ─────────────────────────────────────
    let db_path = std::env::var("AURORA_DB_PATH").unwrap_or_else(|_| "aurora.db".to_string());
    let db = Arc::new(Db::open(&db_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %db_path, "failed to open ledger database, falling back to in-memory");
        Db::open_in_memory().expect("in-memory database must always open")
    }));

    // ── 3. Build Binance client ──────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let binance_client = Arc::new(binance::client::BinanceClient::new(api_key, api_secret));

    // ── 4. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config, db, binance_client.clone()));

    // ── 5. Seed the active strategy snapshot ─────────────────────────────
    {
        let signal_config = SignalEngineConfig::default();
        let params = state.runtime_config.read().strategy_params.clone();
        let indicator_weights: BTreeMap<String, f64> = signal_config.indicator_weights.into_iter().collect();
        let snapshot_input = SnapshotInput {
            score_buy_target: signal_config.score_buy_target,
            score_sell_target: signal_config.score_sell_target,
            indicator_weights,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            take_profit_pct: params.tp1_atr_multiplier,
            stop_loss_pct: params.sl_atr_multiplier,
            cooldown_bars: signal_config.cooldown_bars,
            flip_hysteresis_pct: signal_config.flip_hysteresis_pct,
            min_indicators_required: signal_config.min_indicators_required,
            excluded_symbols: Vec::new(),
        };
        match state.snapshot_service.ensure_active(&snapshot_input) {
            Ok(id) => {
                *state.current_snapshot_id.write() = Some(id);
                info!(snapshot_id = %id, "active strategy snapshot ensured");
            }
            Err(e) => error!(error = %e, "failed to ensure active strategy snapshot"),
        }
    }

    // ── 6. Spawn market data streams ─────────────────────────────────────
    let symbols = state.runtime_config.read().symbols.clone();

    for symbol in &symbols {
        // Kline 1m stream
        let cb = state.candle_buffer.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    market_data::candle_buffer::run_kline_stream(&sym, "1m", &cb).await
                {
                    error!(symbol = %sym, error = %e, "Kline 1m stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });

        // Kline 5m stream
        let cb = state.candle_buffer.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    market_data::candle_buffer::run_kline_stream(&sym, "5m", &cb).await
                {
                    error!(symbol = %sym, error = %e, "Kline 5m stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });

        // Trade stream
        {
            let procs = state.trade_processors.read();
            if let Some(tp) = procs.get(symbol) {
                let processor = tp.clone();
                let sym = symbol.clone();
                tokio::spawn(async move {
                    loop {
                        if let Err(e) =
                            market_data::trade_stream::run_trade_stream(&sym, &processor).await
                        {
                            error!(symbol = %sym, error = %e, "Trade stream error — reconnecting in 5s");
                        }
                        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                    }
                });
            }
        }

        // Orderbook stream
        let ob = state.orderbook_manager.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = market_data::orderbook::run_depth_stream(&sym, &ob).await {
                    error!(symbol = %sym, error = %e, "Depth stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }

    info!(count = symbols.len(), "Market data streams launched");

    // ── 7. Ingestion orchestrator (dual JWT-authed ticker/fill connections) ─
    {
        let ingest_state = state.clone();
        let ingest_exchange = state.exchange_client.clone();
        tokio::spawn(async move {
            ingestion::orchestrator::run(ingest_state, ingest_exchange).await;
        });
    }

    // ── 8. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr =
        std::env::var("AURORA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let bind_addr_clone = bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    // ── 9. Execution engine ───────────────────────────────────────────────
    let exec_engine = Arc::new(ExecutionEngine::new(
        binance_client.clone(),
        state.position_manager.clone(),
        state.risk_engine.clone(),
    ));

    // ── Shared exit state (used by the position monitor) ─────────────────
    let trailing_states = exit::monitor::new_trailing_states();

    // ── 10. Strategy loop (every 5 seconds) ──────────────────────────────
    // Pulls closed 5M candles, annotates them through the indicator
    // pipeline, scores them through the signal engine (§4.D), and on a
    // non-Hold action routes the resulting proposal through the execution
    // engine, the ledger recorder, and (on sells) a FIFO replay.
    let strat_state = state.clone();
    let strat_exec = exec_engine.clone();
    tokio::spawn(async move {
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
        info!("Strategy loop starting");

        let thresholds = indicators::pipeline::IndicatorThresholds::default();
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(5));
        loop {
            interval.tick().await;

            let syms = strat_state.runtime_config.read().symbols.clone();
            let is_demo = strat_state.runtime_config.read().account_mode == AccountMode::Demo;

            for symbol in &syms {
                let key_5m = market_data::CandleKey {
                    symbol: symbol.clone(),
                    interval: "5m".to_string(),
                };
                let candles = strat_state.candle_buffer.get_closed(&key_5m, 300);
                if candles.len() < thresholds.min_required_rows {
                    continue;
                }

                if let Some(atr_pct) = indicators::atr::calculate_atr_pct(&candles, 14) {
                    strat_state.atr_pct.write().insert(symbol.clone(), atr_pct);
                }

                let bar_idx = candles.len() as u64;
                let annotated = indicators::pipeline::annotate(symbol, &candles, bar_idx, &thresholds);

                let current_price = candles.last().map(|c| c.close).unwrap_or(0.0);
                if current_price <= 0.0 {
                    continue;
                }

                let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
                let roc_24h = if closes.len() >= 2 {
                    indicators::roc::current_roc(&closes, (closes.len() - 1).min(288))
                } else {
                    None
                };

                let price_decimal = decimal_from_f64(current_price);
                let scores = strat_state
                    .signal_engine
                    .score(symbol, &annotated, roc_24h, price_decimal);
                strat_state
                    .last_signal_action
                    .write()
                    .insert(symbol.clone(), scores.action);

                let envelope = match scores.action {
                    SignalAction::Hold => DecisionEnvelope::blocked(
                        symbol.as_str(),
                        "HOLD",
                        "SignalEngine",
                        "Strategy",
                        format!(
                            "buy={:.3} sell={:.3} trigger={}",
                            scores.buy_score, scores.sell_score, scores.trigger
                        ),
                    ),
                    _ => {
                        let side_str = scores.action.to_string().to_uppercase();
                        let mut env = DecisionEnvelope::allow(symbol.as_str(), side_str.as_str(), "SignalEngine");
                        env.reason = Some(format!(
                            "buy={:.3} sell={:.3} trigger={}",
                            scores.buy_score, scores.sell_score, scores.trigger
                        ));
                        env
                    }
                };
                strat_state.push_decision(envelope);

                if scores.action == SignalAction::Hold {
                    continue;
                }

                // ── SL/TP from 5M ATR with minimum floors (teacher's §8) ──
                let params = strat_state.runtime_config.read().strategy_params.clone();
                let atr = indicators::atr::calculate_atr(&candles, 14).unwrap_or(current_price * 0.01);

                let sl_dist = (atr * params.sl_atr_multiplier).max(current_price * (params.min_sl_pct / 100.0));
                let tp1_dist = (atr * params.tp1_atr_multiplier).max(current_price * (params.min_tp1_pct / 100.0));
                let tp2_dist = (atr * params.tp2_atr_multiplier).max(current_price * (params.min_tp2_pct / 100.0));

                let is_buy = scores.action == SignalAction::Buy;
                let (stop_loss, take_profit_1, take_profit_2) = if is_buy {
                    (current_price - sl_dist, current_price + tp1_dist, current_price + tp2_dist)
                } else {
                    (current_price + sl_dist, current_price - tp1_dist, current_price - tp2_dist)
                };

                let usdt_balance = strat_state
                    .balances
                    .read()
                    .iter()
                    .find(|b| b.asset == "USDT")
                    .map(|b| b.free)
                    .unwrap_or(1000.0);
                let position_value = usdt_balance * (params.base_position_pct / 100.0);
                let quantity = if current_price > 0.0 { position_value / current_price } else { 0.0 };
                if quantity <= 0.0 {
                    continue;
                }

                let side_str = if is_buy { "BUY" } else { "SELL" };
                let result = strat_exec
                    .execute_proposal(
                        symbol,
                        side_str,
                        current_price,
                        quantity,
                        stop_loss,
                        take_profit_1,
                        take_profit_2,
                        is_demo,
                    )
                    .await;
                info!(symbol = %symbol, side = side_str, result = %result, "trade execution result");

                if !matches!(result, ExecutionResult::Placed(_) | ExecutionResult::Simulated(_)) {
                    continue;
                }

                let order_id = uuid::Uuid::new_v4().to_string();
                let bracket = BracketOrder {
                    entry_order_id: order_id.clone(),
                    stop_order_id: None,
                    tp_order_id: None,
                    entry_price: decimal_from_f64(current_price),
                    stop_price: decimal_from_f64(stop_loss),
                    tp_price: decimal_from_f64(take_profit_1),
                    status: BracketStatus::Active,
                };
                strat_state.bracket_orders.write().insert(symbol.clone(), bracket);

                let fill = TradeFill {
                    order_id,
                    symbol: symbol.clone(),
                    side: if is_buy { OrderSide::Buy } else { OrderSide::Sell },
                    order_time: chrono::Utc::now(),
                    price: decimal_from_f64(current_price),
                    size: decimal_from_f64(quantity),
                    total_fees_usd: Decimal::ZERO,
                    trigger: scores.trigger.clone(),
                    order_type: OrderType::Limit,
                    status: TradeRecordStatus::Filled,
                    source: if is_demo { "demo".to_string() } else { "live".to_string() },
                    ingest_via: "strategy_loop".to_string(),
                };
                if let Err(e) = strat_state.trade_recorder.enqueue_trade(fill).await {
                    error!(symbol = %symbol, error = %e, "failed to enqueue trade fill");
                }

                if !is_buy {
                    let version = strat_state.current_state_version() as i64;
                    if let Err(e) = strat_state.fifo_engine.replay_for_symbol(symbol, version).await {
                        warn!(symbol = %symbol, error = %e, "FIFO replay failed");
                    }
                }
            }
        }
    });

    // ── 11. Position monitor loop (priority-ordered exit table) ──────────
    let exit_state = state.clone();
    let exit_trailing = trailing_states.clone();
    tokio::spawn(async move {
        // Price-update loop runs alongside the position monitor.
        let price_state = exit_state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(5));
            loop {
                interval.tick().await;
                let open_positions = price_state.position_manager.get_open_positions();
                for pos in &open_positions {
                    let procs = price_state.trade_processors.read();
                    if let Some(tp) = procs.get(&pos.symbol) {
                        let price = tp.last_price();
                        if price > 0.0 {
                            price_state.position_manager.update_price(&pos.symbol, price);
                        }
                    }
                }
            }
        });

        exit::monitor::run_position_monitor(exit_state, exit_trailing, PositionMonitorConfig::default()).await;
    });

    // ── 12. Reconciliation loop ───────────────────────────────────────────
    let recon_state = state.clone();
    let recon_client = binance_client.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        loop {
            interval.tick().await;

            if recon_state.runtime_config.read().account_mode == AccountMode::Demo {
                continue;
            }

            match reconcile::reconcile_once(
                &recon_client,
                &recon_state.position_manager,
                &recon_state.balances,
            )
            .await
            {
                Ok(result) => {
                    *recon_state.last_reconcile_ok.write() = Some(std::time::Instant::now());
                    *recon_state.last_reconcile_error.write() = None;
                    if result.balance_drift || result.orphan_orders > 0 {
                        recon_state.push_error(format!(
                            "reconciliation drift: {} orphan orders, balance_drift={}",
                            result.orphan_orders, result.balance_drift
                        ));
                    }
                    recon_state.increment_version();
                }
                Err(e) => {
                    *recon_state.last_reconcile_error.write() = Some(format!("{e}"));
                    warn!(error = %e, "reconciliation failed");
                }
            }
        }
    });

    // ── 13. Regime detection loop ─────────────────────────────────────────
    let regime_state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(tokio::time::Duration::from_secs(60)).await;
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let syms = regime_state.runtime_config.read().symbols.clone();
            if let Some(symbol) = syms.first() {
                let key = market_data::CandleKey {
                    symbol: symbol.clone(),
                    interval: "5m".to_string(),
                };
                let candles = regime_state.candle_buffer.get_closed(&key, 100);
                if candles.len() >= 50 {
                    regime_state.regime_detector.write().update(&candles);
                    regime_state.increment_version();
                }
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 14. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.runtime_config.read().save("runtime_config.json") {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Aurora Spot Nexus shut down complete.");
    Ok(())
}
