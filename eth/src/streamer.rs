use error_stack::{Report, ResultExt};
use futures::StreamExt;
use jsonrpsee::{
    core::client::{Subscription, SubscriptionClientT},
    rpc_params,
    ws_client::WsClientBuilder,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use chainwatch_common::error::{Result, WatcherError};

use crate::models::RawStateDiff;

/// Live statediff subscription over the upstream node's WebSocket endpoint.
pub struct StateDiffStreamer {
    ws_url: String,
}

impl StateDiffStreamer {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }

    /// Streams payloads onto `out` until the subscription drops or `ct`
    /// fires. A dropped connection surfaces as `UpstreamUnavailable`; the
    /// pipeline reopens with backoff.
    pub async fn stream(
        &self,
        out: mpsc::Sender<RawStateDiff>,
        ct: CancellationToken,
    ) -> Result<()> {
        let client = WsClientBuilder::default()
            .build(&self.ws_url)
            .await
            .change_context(WatcherError::UpstreamUnavailable)
            .attach_printable_lazy(|| format!("cannot reach {}", self.ws_url))?;
        let mut subscription: Subscription<RawStateDiff> = client
            .subscribe("statediff_subscribe", rpc_params![], "statediff_unsubscribe")
            .await
            .change_context(WatcherError::UpstreamUnavailable)
            .attach_printable("statediff subscription rejected")?;
        info!(url = %self.ws_url, "statediff subscription open");

        loop {
            tokio::select! {
                item = subscription.next() => match item {
                    Some(Ok(payload)) => {
                        debug!(block_number = payload.block_number, "streamed raw payload");
                        if out.send(payload).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some(Err(err)) => {
                        return Err(Report::new(WatcherError::UpstreamUnavailable)
                            .attach_printable(format!("statediff notification error: {err}")));
                    }
                    None => {
                        return Err(Report::new(WatcherError::UpstreamUnavailable)
                            .attach_printable("statediff subscription closed by upstream"));
                    }
                },
                _ = ct.cancelled() => return Ok(()),
            }
        }
    }
}
