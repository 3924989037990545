use std::time::Duration;

use error_stack::{Report, ResultExt};
use jsonrpsee::{
    core::{client::ClientT, params::BatchRequestBuilder},
    http_client::{HttpClient, HttpClientBuilder},
    rpc_params,
};
use tracing::debug;

use chainwatch_common::error::{Result, WatcherError};

use crate::models::RawStateDiff;

/// Historical statediff fetch over the upstream node's HTTP endpoint, one
/// JSON-RPC batch per request.
pub struct StateDiffFetcher {
    client: HttpClient,
}

impl StateDiffFetcher {
    pub fn new(http_url: &str, timeout: Duration) -> Result<Self> {
        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .build(http_url)
            .change_context(WatcherError::Configuration)
            .attach_printable_lazy(|| format!("bad upstream http url {http_url}"))?;
        Ok(Self { client })
    }

    /// Fetches the statediff for every height, in request order. Any height
    /// the upstream cannot serve makes the whole call a `PartialFetch`.
    pub async fn fetch(&self, heights: &[u64]) -> Result<Vec<RawStateDiff>> {
        if heights.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = heights.len(), "fetching statediff batch");

        let mut batch = BatchRequestBuilder::new();
        for height in heights {
            batch
                .insert("statediff_stateDiffAt", rpc_params![*height])
                .change_context(WatcherError::Fatal)
                .attach_printable("failed to build batch request")?;
        }
        let responses = self
            .client
            .batch_request::<RawStateDiff>(batch)
            .await
            .change_context(WatcherError::UpstreamUnavailable)
            .attach_printable("statediff batch request failed")?;

        let mut payloads = Vec::with_capacity(heights.len());
        let mut missing = Vec::new();
        for (height, response) in heights.iter().zip(responses) {
            match response {
                Ok(payload) => payloads.push(payload),
                Err(err) => {
                    debug!(height, err = %err, "upstream missing statediff");
                    missing.push(*height);
                }
            }
        }
        if !missing.is_empty() {
            return Err(Report::new(WatcherError::PartialFetch)
                .attach_printable(format!("missing heights {missing:?}")));
        }
        Ok(payloads)
    }
}
