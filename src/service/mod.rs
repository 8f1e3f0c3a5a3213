//! 业务服务：鉴权与消息流转 / Services: authentication and message flow

pub mod auth;
pub mod delivery;
pub mod offline;

pub use auth::{AuthClaims, Authenticator, HmacAuthenticator};
