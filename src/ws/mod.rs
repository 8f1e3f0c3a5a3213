//! WebSocket 接入层：监听、握手与逐连接协议
//! WebSocket edge: listener, handshake and the per-connection protocol

pub mod connection;
pub mod handler;
pub mod server;
