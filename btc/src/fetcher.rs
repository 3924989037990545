use error_stack::{Report, ResultExt};
use futures::{stream, StreamExt, TryStreamExt};
use tracing::debug;

use chainwatch_common::error::{Result, WatcherError};

use crate::{models::RawBlockPayload, rpc::BtcRpcClient};

const FETCH_CONCURRENCY: usize = 8;

/// Historical block pull over bitcoind's JSON-RPC endpoint.
pub struct BtcPayloadFetcher {
    client: BtcRpcClient,
}

impl BtcPayloadFetcher {
    pub fn new(client: BtcRpcClient) -> Self {
        Self { client }
    }

    /// Fetches every height, bounded-parallel, preserving request order.
    /// A height bitcoind cannot serve fails the call with `PartialFetch`.
    pub async fn fetch(&self, heights: &[u64]) -> Result<Vec<RawBlockPayload>> {
        debug!(count = heights.len(), "fetching bitcoin blocks");
        stream::iter(heights.iter().copied())
            .map(|height| self.fetch_one(height))
            .buffered(FETCH_CONCURRENCY)
            .try_collect()
            .await
            .map_err(|err| {
                err.change_context(WatcherError::PartialFetch)
                    .attach_printable("bitcoin batch fetch incomplete")
            })
    }

    async fn fetch_one(&self, height: u64) -> Result<RawBlockPayload> {
        let hash = self.client.block_hash(height).await?;
        let (actual_height, block) = self.client.raw_block(&hash).await?;
        if actual_height != height {
            return Err(Report::new(WatcherError::PartialFetch).attach_printable(format!(
                "bitcoind served height {actual_height} for requested {height}"
            )));
        }
        Ok(RawBlockPayload { height, block })
    }
}
