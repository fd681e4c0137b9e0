// =============================================================================
// Closed error taxonomy for exchange-facing operations
// =============================================================================
//
// Indicator/logging failures stay local (logged, no-op). Database failures
// roll back and warn. Everything that crosses the exchange boundary maps
// into one of these kinds so the caller can decide to retry, drop, or
// surface without string-matching HTTP bodies.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("order size too small: {0}")]
    SizeTooSmall(String),

    #[error("bad symbol or product id: {0}")]
    BadSymbolOrProductId(String),

    #[error("exchange in maintenance, retry after {retry_after_secs}s")]
    Maintenance { retry_after_secs: u64 },

    #[error("post-only order would have crossed the book: {0}")]
    PostOnlyViolation(String),

    #[error("price precision exceeded: {0}")]
    PriceTooAccurate(String),

    #[error("internal server error (transient): {0}")]
    InternalServerError(String),

    #[error("retry budget exhausted after {attempts} attempts: {0}", attempts = .attempts)]
    AttemptedRetries { attempts: u32, source: String },

    #[error("circuit breaker open, no calls permitted until {retry_after_secs}s")]
    CircuitBreakerOpen { retry_after_secs: u64 },

    #[error("unknown exchange error: {0}")]
    Unknown(String),
}

impl BotError {
    /// Whether this error category represents a bad order that should be
    /// dropped with a `bad_order` log rather than retried.
    pub fn is_drop_and_log(&self) -> bool {
        matches!(
            self,
            BotError::InsufficientFunds(_)
                | BotError::SizeTooSmall(_)
                | BotError::BadSymbolOrProductId(_)
                | BotError::PostOnlyViolation(_)
        )
    }

    /// Whether the caller should retry this call (with backoff).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BotError::RateLimited { .. }
                | BotError::Maintenance { .. }
                | BotError::InternalServerError(_)
                | BotError::PriceTooAccurate(_)
        )
    }

    /// Maps an HTTP status + exchange error body into the taxonomy.
    ///
    /// `code` is the exchange's own error string (e.g. Coinbase-style
    /// `"INSUFFICIENT_FUND"`), checked before falling back to the HTTP
    /// status code alone.
    pub fn from_http(status: u16, code: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        if let Some(code) = code {
            let upper = code.to_ascii_uppercase();
            if upper.contains("INSUFFICIENT_FUND") {
                return BotError::InsufficientFunds(message);
            }
            if upper.contains("SIZE_TOO_SMALL") || upper.contains("MIN_SIZE") {
                return BotError::SizeTooSmall(message);
            }
            if upper.contains("INVALID_PRODUCT") || upper.contains("INVALID_SYMBOL") {
                return BotError::BadSymbolOrProductId(message);
            }
            if upper.contains("POST_ONLY") {
                return BotError::PostOnlyViolation(message);
            }
            if upper.contains("PRICE_TOO_ACCURATE") || upper.contains("INVALID_PRICE_PRECISION") {
                return BotError::PriceTooAccurate(message);
            }
        }
        match status {
            401 => BotError::Authentication(message),
            403 => BotError::Unauthorized(message),
            400 => BotError::BadRequest(message),
            404 => BotError::NotFound(message),
            429 => BotError::RateLimited {
                retry_after_secs: 30,
            },
            503 => BotError::Maintenance {
                retry_after_secs: 60,
            },
            500..=599 => BotError::InternalServerError(message),
            _ => BotError::Unknown(message),
        }
    }
}

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BotError::InternalServerError(format!("request timed out: {err}"))
        } else if let Some(status) = err.status() {
            BotError::from_http(status.as_u16(), None, err.to_string())
        } else {
            BotError::Unknown(err.to_string())
        }
    }
}

impl From<rusqlite::Error> for BotError {
    fn from(err: rusqlite::Error) -> Self {
        BotError::InternalServerError(format!("database error: {err}"))
    }
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        BotError::BadRequest(format!("malformed payload: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_insufficient_funds_code_over_status() {
        let err = BotError::from_http(400, Some("INSUFFICIENT_FUND"), "balance too low");
        assert!(matches!(err, BotError::InsufficientFunds(_)));
    }

    #[test]
    fn maps_status_when_no_code_matches() {
        let err = BotError::from_http(429, None, "slow down");
        assert!(matches!(err, BotError::RateLimited { .. }));
    }

    #[test]
    fn maps_unknown_status_to_unknown() {
        let err = BotError::from_http(999, None, "???");
        assert!(matches!(err, BotError::Unknown(_)));
    }

    #[test]
    fn drop_and_log_classification() {
        assert!(BotError::InsufficientFunds("x".into()).is_drop_and_log());
        assert!(!BotError::RateLimited { retry_after_secs: 1 }.is_drop_and_log());
    }

    #[test]
    fn retryable_classification() {
        assert!(BotError::Maintenance { retry_after_secs: 1 }.is_retryable());
        assert!(!BotError::InsufficientFunds("x".into()).is_retryable());
    }
}
