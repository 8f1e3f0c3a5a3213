use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::RelayError;

type HmacSha256 = Hmac<Sha256>;

/// 验证通过后的连接身份 / The identity a validated connection runs as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClaims {
    pub user_id: u64,
    pub username: String,
}

/// 握手鉴权的外部协作点 / The out-of-band seam handshake authentication goes through
///
/// Account systems differ per deployment; the relay only needs "token in,
/// identity out". Failures carry a reason but the socket never echoes it
/// beyond an unauthorized close.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn validate_token(&self, token: &str) -> Result<AuthClaims, RelayError>;
}

/// HMAC-SHA256 签名令牌 / Self-contained HMAC-SHA256 signed tokens
///
/// `user_id.username.expires_at.signature`, signature hex over everything
/// before it. No datastore round-trip during the handshake.
pub struct HmacAuthenticator {
    secret: String,
}

impl HmacAuthenticator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC can take key of any size")
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// 签发令牌，供测试与外围签发服务使用
    /// Issue a token; used by tests and whatever service mints credentials
    pub fn issue_token(&self, user_id: u64, username: &str, ttl: Duration) -> String {
        let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;
        let payload = format!("{user_id}.{username}.{expires_at}");
        let signature = self.sign(&payload);
        format!("{payload}.{signature}")
    }
}

#[async_trait]
impl Authenticator for HmacAuthenticator {
    async fn validate_token(&self, token: &str) -> Result<AuthClaims, RelayError> {
        let (payload, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| RelayError::unauthorized("malformed token"))?;

        let signature =
            hex::decode(signature).map_err(|_| RelayError::unauthorized("malformed signature"))?;
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| RelayError::unauthorized("bad signature"))?;

        let (rest, expires_at) = payload
            .rsplit_once('.')
            .ok_or_else(|| RelayError::unauthorized("malformed token"))?;
        let expires_at: i64 = expires_at
            .parse()
            .map_err(|_| RelayError::unauthorized("malformed expiry"))?;
        if expires_at <= Utc::now().timestamp() {
            return Err(RelayError::unauthorized("token expired"));
        }

        // usernames may contain dots, the id cannot
        let (user_id, username) = rest
            .split_once('.')
            .ok_or_else(|| RelayError::unauthorized("malformed token"))?;
        let user_id: u64 = user_id
            .parse()
            .map_err(|_| RelayError::unauthorized("malformed user id"))?;

        Ok(AuthClaims {
            user_id,
            username: username.to_string(),
        })
    }
}
