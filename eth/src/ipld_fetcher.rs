use std::str::FromStr;
use std::sync::Arc;

use alloy_primitives::B256;
use async_trait::async_trait;
use cid::Cid;
use error_stack::{Report, ResultExt};

use chainwatch_common::{
    adapter::{HistoricalSource, PartialResponses},
    blockstore::BlockStore,
    error::{Result, WatcherError},
};

use crate::{
    adapter::EthAdapter,
    models::{CidWrapper, StreamResponse},
    retriever::EthCidRetriever,
    settings::SubscriptionSettings,
};

/// The historical path: reconstructs subscriber responses from persisted
/// CIDs. Headers, uncles, transactions, and receipts are batch-fetched;
/// state and storage nodes go one by one so each result stays associated
/// with its key metadata from the manifest.
///
/// A store shortfall never voids the block: the partial response is kept
/// and an `UnexpectedIpldCount` report rides along for the caller.
pub struct EthIpldFetcher {
    retriever: Arc<EthCidRetriever>,
    store: Arc<dyn BlockStore>,
}

impl EthIpldFetcher {
    pub fn new(retriever: Arc<EthCidRetriever>, store: Arc<dyn BlockStore>) -> Self {
        Self { retriever, store }
    }

    async fn fetch_batch(
        &self,
        cids: &[String],
        kind: &str,
        shortfalls: &mut Vec<Report<WatcherError>>,
    ) -> Result<Vec<Vec<u8>>> {
        let cids = parse_cids(cids)?;
        let nodes = self.store.get_batch(&cids).await?;
        if nodes.len() != cids.len() {
            shortfalls.push(
                Report::new(WatcherError::UnexpectedIpldCount).attach_printable(format!(
                    "{kind}: expected {} iplds, got {}",
                    cids.len(),
                    nodes.len()
                )),
            );
        }
        Ok(nodes.into_iter().map(|node| node.data).collect())
    }

    async fn fetch_single(
        &self,
        cid: &str,
        kind: &str,
        shortfalls: &mut Vec<Report<WatcherError>>,
    ) -> Result<Option<Vec<u8>>> {
        let cid = parse_cid(cid)?;
        match self.store.get(&cid).await {
            Ok(data) => Ok(Some(data)),
            Err(err) => {
                shortfalls.push(
                    err.change_context(WatcherError::UnexpectedIpldCount)
                        .attach_printable(format!("{kind} ipld {cid} missing")),
                );
                Ok(None)
            }
        }
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
            if let Some(data) = self.fetch_single(&header.cid, "header", &mut shortfalls).await? {
                response.headers_rlp.push(data.into());
            }
        }

        let uncle_cids: Vec<String> = wrapper.uncles.iter().map(|u| u.cid.clone()).collect();
        for data in self.fetch_batch(&uncle_cids, "uncles", &mut shortfalls).await? {
            response.uncles_rlp.push(data.into());
        }

        let tx_cids: Vec<String> = wrapper.transactions.iter().map(|t| t.cid.clone()).collect();
        for data in self
            .fetch_batch(&tx_cids, "transactions", &mut shortfalls)
            .await?
        {
            response.transactions_rlp.push(data.into());
        }

        let receipt_cids: Vec<String> = wrapper.receipts.iter().map(|r| r.cid.clone()).collect();
        for data in self
            .fetch_batch(&receipt_cids, "receipts", &mut shortfalls)
            .await?
        {
            response.receipts_rlp.push(data.into());
        }

        for state in &wrapper.state_nodes {
            let key = parse_key(&state.state_key)?;
            if let Some(data) = self.fetch_single(&state.cid, "state", &mut shortfalls).await? {
                response.state_nodes_rlp.insert(key, data.into());
            }
        }

        for storage in &wrapper.storage_nodes {
            let state_key = parse_key(&storage.state_key)?;
            let storage_key = parse_key(&storage.storage_key)?;
            if let Some(data) = self
                .fetch_single(&storage.cid, "storage", &mut shortfalls)
                .await?
            {
                response
                    .storage_nodes_rlp
                    .entry(state_key)
                    .or_default()
                    .insert(storage_key, data.into());
            }
        }

        Ok((response, shortfalls))
    }
}

fn parse_cid(s: &str) -> Result<Cid> {
    Cid::from_str(s)
        .change_context(WatcherError::Fatal)
        .attach_printable_lazy(|| format!("corrupt cid in index: {s}"))
}

fn parse_cids(cids: &[String]) -> Result<Vec<Cid>> {
    cids.iter().map(|s| parse_cid(s)).collect()
}

fn parse_key(s: &str) -> Result<B256> {
    B256::from_str(s)
        .map_err(|err| Report::new(WatcherError::Fatal).attach_printable(err.to_string()))
        .attach_printable_lazy(|| format!("corrupt key in index: {s}"))
}

#[async_trait]
impl HistoricalSource<EthAdapter> for EthIpldFetcher {
    async fn responses(
        &self,
        settings: &SubscriptionSettings,
        start: u64,
        end: u64,
    ) -> Result<PartialResponses<EthAdapter>> {
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
