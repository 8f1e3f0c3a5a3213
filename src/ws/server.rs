//! WebSocket 服务器主循环
//! WebSocket server accept loop

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::server::RelayContext;
use crate::ws::connection;

impl RelayContext {
    /// 绑定地址并开始接受连接
    /// Bind the configured address and start accepting connections.
    pub async fn run(self: Arc<Self>, host: &str, port: u16) -> Result<()> {
        let addr = format!("{host}:{port}");
        let listener = TcpListener::bind(&addr).await?;
        info!("🚀 im-relay listening on {addr}");
        self.serve(listener).await
    }

    /// 在已绑定的监听器上服务。测试通过它使用临时端口。
    /// Serve on an already-bound listener. Tests use this with an ephemeral port.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("📡 Waiting for connections...");

        while let Ok((stream, peer_addr)) = listener.accept().await {
            let ctx = self.clone();
            tokio::spawn(async move {
                if let Err(err) = connection::handle_connection(stream, peer_addr, ctx).await {
                    error!("Connection error from {peer_addr}: {err:#}");
                }
            });
        }

        Ok(())
    }
}
