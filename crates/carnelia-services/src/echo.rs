use async_trait::async_trait;
use carnelia_runtime::{Handler, Request};
use carnelia_wire::RpcError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EchoPayload {
    Echo { echo: Value },
    EchoOk { echo: Value },
}

/// Answers `echo` with the payload unchanged.
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, request: &Request) -> Result<(), RpcError> {
        match request.decode::<EchoPayload>()? {
            EchoPayload::Echo { echo } => request.reply(&EchoPayload::EchoOk { echo }).await,
            EchoPayload::EchoOk { .. } => Ok(()),
        }
    }
}
