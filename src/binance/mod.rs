// =============================================================================
// Binance Client Module
// =============================================================================
//
// HMAC-signed REST client plus the weight-based rate limiter guarding it.

pub mod client;
pub mod rate_limit;
