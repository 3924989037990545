use std::sync::Arc;

use error_stack::ResultExt;
use jsonrpsee::{
    core::{async_trait, SubscriptionResult},
    proc_macros::rpc,
    server::{Server, ServerHandle, SubscriptionMessage},
    types::{error::INVALID_PARAMS_CODE, ErrorObject},
    PendingSubscriptionSink,
};
use tracing::{debug, info, warn};

use chainwatch_common::{
    adapter::ChainAdapter,
    error::{Result, WatcherError},
    hub::HubHandle,
};

#[rpc(server, namespace = "watch")]
pub trait WatchApi {
    /// Stream filtered chain data. Params are chain-tagged subscription
    /// settings; each notification frame carries one server response.
    #[subscription(
        name = "subscribeChainData" => "chainData",
        unsubscribe = "unsubscribeChainData",
        item = serde_json::Value
    )]
    async fn subscribe_chain_data(&self, params: serde_json::Value) -> SubscriptionResult;
}

/// Bridges the subscription RPC surface to the hub.
pub struct WatchRpc<A: ChainAdapter> {
    adapter: Arc<A>,
    hub: HubHandle<A>,
}

impl<A: ChainAdapter> WatchRpc<A> {
    pub fn new(adapter: Arc<A>, hub: HubHandle<A>) -> Self {
        Self { adapter, hub }
    }
}

#[async_trait]
impl<A: ChainAdapter> WatchApiServer for WatchRpc<A> {
    async fn subscribe_chain_data(
        &self,
        pending: PendingSubscriptionSink,
        params: serde_json::Value,
    ) -> SubscriptionResult {
        let settings = match self.adapter.parse_settings(&params) {
            Ok(settings) => settings,
            Err(err) => {
                debug!(err = ?err, "rejecting bad subscription");
                pending
                    .reject(ErrorObject::owned(
                        INVALID_PARAMS_CODE,
                        "bad subscription",
                        Some(format!("{err:?}")),
                    ))
                    .await;
                return Ok(());
            }
        };

        let (id, mut responses) = match self.hub.subscribe(settings).await {
            Ok(subscribed) => subscribed,
            Err(err) => {
                warn!(err = ?err, "hub rejected subscription");
                pending
                    .reject(ErrorObject::owned(
                        INVALID_PARAMS_CODE,
                        "subscription failed",
                        None::<()>,
                    ))
                    .await;
                return Ok(());
            }
        };

        let sink = pending.accept().await?;
        loop {
            tokio::select! {
                response = responses.recv() => match response {
                    Some(response) => {
                        let message = SubscriptionMessage::from_json(&response)?;
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    // Range complete, hub shutdown, or slow-consumer
                    // eviction: end the stream.
                    None => break,
                },
                _ = sink.closed() => break,
            }
        }
        self.hub.unsubscribe(id).await;
        Ok(())
    }
}

/// Brings up the WS/HTTP subscription endpoint.
pub async fn start<A: ChainAdapter>(address: &str, rpc: WatchRpc<A>) -> Result<ServerHandle> {
    let server = Server::builder()
        .build(address)
        .await
        .change_context(WatcherError::Configuration)
        .attach_printable_lazy(|| format!("cannot bind rpc server to {address}"))?;
    info!(address, "subscription server listening");
    Ok(server.start(rpc.into_rpc()))
}
