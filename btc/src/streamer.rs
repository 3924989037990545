use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use chainwatch_common::error::Result;

use crate::{models::RawBlockPayload, rpc::BtcRpcClient};

/// Bitcoin core has no push subscription surface, so live data is a tight
/// poll of `getbestblockhash`.
pub struct BtcHttpStreamer {
    client: BtcRpcClient,
    poll_interval: Duration,
}

impl BtcHttpStreamer {
    pub fn new(client: BtcRpcClient, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    /// Emits each new best block once, in chain order, until `ct` fires.
    /// Upstream errors propagate so the pipeline can reopen with backoff.
    pub async fn stream(
        &self,
        out: mpsc::Sender<RawBlockPayload>,
        ct: CancellationToken,
    ) -> Result<()> {
        let mut last_hash: Option<String> = None;
        info!(interval = ?self.poll_interval, "polling bitcoind for new blocks");
        loop {
            let best = self.client.best_block_hash().await?;
            if last_hash.as_deref() != Some(best.as_str()) {
                let (height, block) = self.client.raw_block(&best).await?;
                debug!(height, hash = %best, "new best block");
                if out.send(RawBlockPayload { height, block }).await.is_err() {
                    return Ok(());
                }
                last_hash = Some(best);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = ct.cancelled() => return Ok(()),
            }
        }
    }
}
