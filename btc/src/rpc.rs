use std::time::Duration;

use error_stack::{Report, ResultExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::trace;

use chainwatch_common::error::{Result, WatcherError};

/// Minimal bitcoind JSON-RPC client. Bitcoin Core only speaks HTTP POST
/// with basic auth.
#[derive(Clone)]
pub struct BtcRpcClient {
    client: reqwest::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl BtcRpcClient {
    pub fn new(
        url: impl Into<String>,
        user: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .change_context(WatcherError::Configuration)
            .attach_printable("failed to build bitcoind http client")?;
        Ok(Self {
            client,
            url: url.into(),
            user,
            password,
        })
    }

    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        trace!(method, "bitcoind rpc call");
        let mut request = self.client.post(&self.url).json(&serde_json::json!({
            "jsonrpc": "1.0",
            "id": "chainwatch",
            "method": method,
            "params": params,
        }));
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }
        let response: RpcResponse<T> = request
            .send()
            .await
            .change_context(WatcherError::UpstreamUnavailable)
            .attach_printable_lazy(|| format!("bitcoind unreachable at {}", self.url))?
            .error_for_status()
            .change_context(WatcherError::UpstreamUnavailable)?
            .json()
            .await
            .change_context(WatcherError::UpstreamUnavailable)
            .attach_printable("undecodable bitcoind response")?;
        if let Some(err) = response.error {
            return Err(Report::new(WatcherError::UpstreamUnavailable)
                .attach_printable(format!("bitcoind error {}: {}", err.code, err.message)));
        }
        response.result.ok_or_else(|| {
            Report::new(WatcherError::UpstreamUnavailable)
                .attach_printable(format!("bitcoind returned no result for {method}"))
        })
    }

    /// Height and raw consensus bytes of the block with the given hash.
    pub async fn raw_block(&self, hash: &str) -> Result<(u64, Vec<u8>)> {
        #[derive(Deserialize)]
        struct HeaderInfo {
            height: u64,
        }
        let info: HeaderInfo = self
            .call("getblockheader", serde_json::json!([hash, true]))
            .await?;
        let hex_block: String = self.call("getblock", serde_json::json!([hash, 0])).await?;
        let bytes = hex::decode(hex_block.trim())
            .change_context(WatcherError::MalformedPayload)
            .attach_printable("bitcoind returned non-hex block")?;
        Ok((info.height, bytes))
    }

    pub async fn best_block_hash(&self) -> Result<String> {
        self.call("getbestblockhash", serde_json::json!([])).await
    }

    pub async fn block_hash(&self, height: u64) -> Result<String> {
        self.call("getblockhash", serde_json::json!([height])).await
    }
}
