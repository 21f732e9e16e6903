use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::GatewayConfig;

/// Source of gateway configuration that can signal when it changes.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn load_config(&self) -> Result<GatewayConfig>;

    /// Change notifications. The receiver is handed out once; later calls get `None`.
    fn watch(&self) -> Option<mpsc::Receiver<()>>;
}
