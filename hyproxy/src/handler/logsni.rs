//! SNI logging handler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::handler::{Action, Handler};
use crate::proxy::session::{Context, KEY_SNI};
use crate::Result;

/// Logs the SNI of each new connection and passes it on.
pub struct LogSniHandler;

impl LogSniHandler {
    pub fn factory(_config: serde_json::Value) -> Result<Arc<dyn Handler>> {
        Ok(Arc::new(LogSniHandler))
    }
}

#[async_trait]
impl Handler for LogSniHandler {
    fn name(&self) -> &'static str {
        "logsni"
    }

    async fn on_connect(&self, ctx: &Arc<Context>) -> Result<Action> {
        let sni = ctx
            .hello
            .as_ref()
            .map(|h| h.sni.as_str())
            .unwrap_or_default();
        info!("[sni] {} from {}", sni, ctx.client_addr);
        ctx.set(KEY_SNI, sni.to_owned());
        Ok(Action::Continue)
    }
}
