use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use error_stack::{Report, ResultExt};

use chainwatch_common::{
    adapter::{HistoricalSource, PartialResponses},
    blockstore::BlockStore,
    error::{Result, WatcherError},
};

use crate::{
    adapter::BtcAdapter,
    models::{CidWrapper, StreamResponse},
    retriever::BtcCidRetriever,
    settings::SubscriptionSettings,
};

/// Reconstructs Bitcoin subscriber responses from persisted CIDs.
///
/// A store shortfall never voids the block: the partial response is kept
/// and an `UnexpectedIpldCount` report rides along for the caller.
pub struct BtcIpldFetcher {
    retriever: Arc<BtcCidRetriever>,
    store: Arc<dyn BlockStore>,
}

impl BtcIpldFetcher {
    pub fn new(retriever: Arc<BtcCidRetriever>, store: Arc<dyn BlockStore>) -> Self {
        Self { retriever, store }
    }

    async fn fetch_one(
        &self,
        wrapper: &CidWrapper,
    ) -> Result<(StreamResponse, Vec<Report<WatcherError>>)> {
        let mut shortfalls = Vec::new();
        let mut response = StreamResponse {
            block_number: wrapper.block_number as u64,
            ..Default::default()
        };

        if let Some(header) = &wrapper.header {
            let cid = parse_cid(&header.cid)?;
            match self.store.get(&cid).await {
                Ok(data) => response.serialized_headers.push(data.into()),
                Err(err) => shortfalls.push(
                    err.change_context(WatcherError::UnexpectedIpldCount)
                        .attach_printable(format!("header ipld {cid} missing")),
                ),
            }
        }

        let tx_cids = wrapper
            .transactions
            .iter()
            .map(|tx| parse_cid(&tx.cid))
            .collect::<Result<Vec<_>>>()?;
        let nodes = self.store.get_batch(&tx_cids).await?;
        if nodes.len() != tx_cids.len() {
            shortfalls.push(
                Report::new(WatcherError::UnexpectedIpldCount).attach_printable(format!(
                    "transactions: expected {} iplds, got {}",
                    tx_cids.len(),
                    nodes.len()
                )),
            );
        }
        for node in nodes {
            response.serialized_txs.push(node.data.into());
        }

        Ok((response, shortfalls))
    }
}

fn parse_cid(s: &str) -> Result<Cid> {
    Cid::from_str(s)
        .change_context(WatcherError::Fatal)
        .attach_printable_lazy(|| format!("corrupt cid in index: {s}"))
}

#[async_trait]
impl HistoricalSource<BtcAdapter> for BtcIpldFetcher {
    async fn responses(
        &self,
        settings: &SubscriptionSettings,
        start: u64,
        end: u64,
    ) -> Result<PartialResponses<BtcAdapter>> {
        let wrappers = self.retriever.retrieve(settings, start, end).await?;
        let mut responses = Vec::with_capacity(wrappers.len());
        let mut shortfalls = Vec::new();
        for wrapper in wrappers {
            let (response, mut errs) = self.fetch_one(&wrapper).await?;
            shortfalls.append(&mut errs);
            if response.has_content() {
                responses.push(response);
            }
        }
        Ok((responses, shortfalls))
    }

    async fn head(&self) -> Result<Option<u64>> {
        use chainwatch_common::adapter::CidRetriever;
        self.retriever.last_block_number().await
    }
}
