// =============================================================================
// JWT mint/refresh + WebSocket connect helper
// =============================================================================
//
// Grounded on original_source/webhook/websocket_helper.py's JWT-authenticated
// handshake, layered over the teacher's `tokio_tungstenite::connect_async`
// usage in market_data/trade_stream.rs.

use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::BotError;

const JWT_TTL_SECS: i64 = 600;
const JWT_REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

fn mint(api_key: &str, secret: &str) -> Result<(String, i64), BotError> {
    let now = Utc::now().timestamp();
    let exp = now + JWT_TTL_SECS;
    let claims = Claims {
        sub: api_key.to_string(),
        iat: now,
        exp,
    };
    let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| BotError::Authentication(format!("failed to mint JWT: {e}")))?;
    Ok((token, exp))
}

/// Returns the cached token if it still has more than
/// `JWT_REFRESH_MARGIN_SECS` left on its clock, otherwise mints and caches a
/// fresh one.
pub fn refresh_jwt_if_needed(
    cache: &RwLock<Option<(String, i64)>>,
    api_key: &str,
    secret: &str,
) -> Result<String, BotError> {
    let now = Utc::now().timestamp();
    if let Some((token, exp)) = cache.read().clone() {
        if exp - now > JWT_REFRESH_MARGIN_SECS {
            return Ok(token);
        }
    }
    let (token, exp) = mint(api_key, secret)?;
    *cache.write() = Some((token.clone(), exp));
    Ok(token)
}

/// Open a JWT-authenticated WebSocket connection, presenting the token as a
/// query parameter the way the original bridge's handshake did.
pub async fn open_authenticated(
    url: &str,
    jwt: &str,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, BotError> {
    let full_url = format!("{url}?token={jwt}");
    let (stream, _) = tokio_tungstenite::connect_async(&full_url)
        .await
        .map_err(|e| BotError::Unknown(format!("websocket connect failed: {e}")))?;
    Ok(stream)
}
