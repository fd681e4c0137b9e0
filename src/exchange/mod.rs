// =============================================================================
// Exchange Operations Layer
// =============================================================================
//
// Exchange-agnostic facade over the signed REST transport: batch cancel,
// historical order/fill lookups, and the JWT handshake the ingestion
// orchestrator's WebSocket connections need. Every result is mapped into
// `BotError` at this boundary so callers above it never see `anyhow`.

pub mod client;
pub mod ws;

pub use client::{CancelResult, ExchangeClient};
