use std::collections::BTreeMap;
use std::sync::Arc;

use alloy_primitives::{keccak256, Address};
use async_trait::async_trait;
use error_stack::ResultExt;
use tokio_postgres::Client;

use chainwatch_common::{
    adapter::CidRetriever,
    error::{Result, WatcherError},
    Gap,
};

use crate::{
    models::{
        address_key, hash_key, CidWrapper, HeaderModel, ReceiptModel, StateNodeModel,
        StorageNodeModel, TxModel, UncleModel,
    },
    settings::{ReceiptFilter, SubscriptionSettings},
};

const HEADER_QUERY: &str = "SELECT block_number, cid, mh_key, block_hash, parent_hash, td, reward,
        state_root, tx_root, receipt_root, uncle_root, timestamp
 FROM eth.header_cids
 WHERE node_id = $1 AND block_number BETWEEN $2 AND $3
 ORDER BY block_number";

const UNCLE_QUERY: &str = "SELECT h.block_number, u.cid, u.mh_key, u.block_hash, u.parent_hash, u.reward
 FROM eth.uncle_cids u
 JOIN eth.header_cids h ON u.header_id = h.id
 WHERE h.node_id = $1 AND h.block_number BETWEEN $2 AND $3
 ORDER BY h.block_number";

const TX_QUERY: &str = "SELECT h.block_number, t.cid, t.mh_key, t.tx_hash, t.tx_index, t.src, t.dst
 FROM eth.transaction_cids t
 JOIN eth.header_cids h ON t.header_id = h.id
 WHERE h.node_id = $1 AND h.block_number BETWEEN $2 AND $3
   AND (cardinality($4::text[]) = 0 AND cardinality($5::text[]) = 0
        OR t.src = ANY($4::text[]) OR t.dst = ANY($5::text[]))
 ORDER BY h.block_number, t.tx_index";

const RECEIPT_QUERY: &str = "SELECT h.block_number, r.cid, r.mh_key, t.tx_hash, r.contract,
        r.topic0s, r.topic1s, r.topic2s, r.topic3s
 FROM eth.receipt_cids r
 JOIN eth.transaction_cids t ON r.tx_id = t.id
 JOIN eth.header_cids h ON t.header_id = h.id
 WHERE h.node_id = $1 AND h.block_number BETWEEN $2 AND $3
   AND (
     ((cardinality($4::text[]) = 0 OR r.contract = ANY($4::text[]))
      AND (cardinality($5::text[]) = 0 OR r.topic0s && $5::text[])
      AND (cardinality($6::text[]) = 0 OR r.topic1s && $6::text[])
      AND (cardinality($7::text[]) = 0 OR r.topic2s && $7::text[])
      AND (cardinality($8::text[]) = 0 OR r.topic3s && $8::text[]))
     OR ($9 AND (cardinality($10::text[]) = 0 AND cardinality($11::text[]) = 0
                 OR t.src = ANY($10::text[]) OR t.dst = ANY($11::text[])))
   )
 ORDER BY h.block_number, t.tx_index";

const STATE_QUERY: &str = "SELECT h.block_number, s.cid, s.mh_key, s.state_key, s.node_type, s.path
 FROM eth.state_cids s
 JOIN eth.header_cids h ON s.header_id = h.id
 WHERE h.node_id = $1 AND h.block_number BETWEEN $2 AND $3
   AND (cardinality($4::text[]) = 0 OR s.state_key = ANY($4::text[]))
   AND (s.node_type = 2 OR $5)
 ORDER BY h.block_number";

const STORAGE_QUERY: &str = "SELECT h.block_number, st.cid, st.mh_key, s.state_key, st.storage_key,
        st.node_type, st.path
 FROM eth.storage_cids st
 JOIN eth.state_cids s ON st.state_id = s.id
 JOIN eth.header_cids h ON s.header_id = h.id
 WHERE h.node_id = $1 AND h.block_number BETWEEN $2 AND $3
   AND (cardinality($4::text[]) = 0 OR s.state_key = ANY($4::text[]))
   AND (cardinality($5::text[]) = 0 OR st.storage_key = ANY($5::text[]))
   AND (st.node_type = 2 OR $6)
 ORDER BY h.block_number";

// The queried bounds ride along as sentinel heights so a hole at either
// edge of [from, to] still has a neighbor to compare against.
const GAP_QUERY: &str = "SELECT gap_start, gap_end
 FROM (
     SELECT block_number + 1 AS gap_start,
            LEAD(block_number) OVER (ORDER BY block_number) - 1 AS gap_end
     FROM (
         SELECT $2::bigint - 1 AS block_number
         UNION
         SELECT block_number FROM eth.header_cids
         WHERE node_id = $1 AND block_number BETWEEN $2 AND $3
         UNION
         SELECT $3::bigint + 1 AS block_number
     ) heights
 ) windowed
 WHERE gap_end IS NOT NULL AND gap_start <= gap_end";

const STALE_QUERY: &str = "SELECT DISTINCT block_number FROM eth.header_cids
 WHERE node_id = $1 AND times_validated < $2
   AND block_number BETWEEN $3 AND $4
 ORDER BY block_number";

const CLEAN_QUERY: &str = "DELETE FROM eth.header_cids
 WHERE node_id = $1 AND block_number BETWEEN $2 AND $3";

/// Four text-array parameters for the receipt query's topic slots; missing
/// or empty slots come out empty, which the SQL treats as match-all.
fn topic_slots(filter: &ReceiptFilter) -> [Vec<String>; 4] {
    let mut slots: [Vec<String>; 4] = Default::default();
    for (slot, topics) in filter.topics.iter().take(4).enumerate() {
        slots[slot] = topics.iter().map(hash_key).collect();
    }
    slots
}

/// The state-key filter the index stores: keccak256 of each address, in
/// the same text form the indexer writes. Mirrors the live filterer.
fn keccak_keys(addresses: &[Address]) -> Vec<String> {
    addresses
        .iter()
        .map(|address| hash_key(&keccak256(address.as_slice())))
        .collect()
}

/// The receipt join only fires when the subscriber asked for it and the tx
/// filter is actually producing transactions.
fn match_txs_enabled(settings: &SubscriptionSettings) -> bool {
    settings.receipt_filter.match_txs && !settings.tx_filter.off
}

/// Reads the Ethereum index back: subscription-driven CID queries, gap
/// detection, and validation-level scans.
pub struct EthCidRetriever {
    client: Arc<Client>,
    node_id: i32,
}

impl EthCidRetriever {
    pub fn new(client: Arc<Client>, node_id: i32) -> Self {
        Self { client, node_id }
    }

    /// Rows matching the subscription predicate across `[start, end]`,
    /// grouped per block and ascending by height. The predicate mirrors the
    /// live filterer, evaluated SQL-side.
    pub async fn retrieve(
        &self,
        settings: &SubscriptionSettings,
        start: u64,
        end: u64,
    ) -> Result<Vec<CidWrapper>> {
        let (start, end) = (start as i64, end as i64);
        let mut wrappers: BTreeMap<i64, CidWrapper> = BTreeMap::new();

        if !settings.header_filter.off {
            self.retrieve_headers(settings, start, end, &mut wrappers)
                .await?;
        }
        if !settings.tx_filter.off {
            self.retrieve_transactions(settings, start, end, &mut wrappers)
                .await?;
        }
        if !settings.receipt_filter.off {
            self.retrieve_receipts(settings, start, end, &mut wrappers)
                .await?;
        }
        if !settings.state_filter.off {
            self.retrieve_state(settings, start, end, &mut wrappers)
                .await?;
        }
        if !settings.storage_filter.off {
            self.retrieve_storage(settings, start, end, &mut wrappers)
                .await?;
        }

        Ok(wrappers.into_values().collect())
    }

    async fn retrieve_headers(
        &self,
        settings: &SubscriptionSettings,
        start: i64,
        end: i64,
        wrappers: &mut BTreeMap<i64, CidWrapper>,
    ) -> Result<()> {
        let rows = self
            .client
            .query(HEADER_QUERY, &[&self.node_id, &start, &end])
            .await
            .change_context(WatcherError::IndexFailed)
            .attach_printable("header query failed")?;
        for row in rows {
            let block_number: i64 = row.get(0);
            let wrapper = entry(wrappers, block_number);
            wrapper.header = Some(HeaderModel {
                cid: row.get(1),
                mh_key: row.get(2),
                block_number,
                block_hash: row.get(3),
                parent_hash: row.get(4),
                total_difficulty: row.get(5),
                reward: row.get(6),
                state_root: row.get(7),
                tx_root: row.get(8),
                receipt_root: row.get(9),
                uncle_root: row.get(10),
                timestamp: row.get(11),
            });
        }

        if settings.header_filter.uncles {
            let rows = self
                .client
                .query(UNCLE_QUERY, &[&self.node_id, &start, &end])
                .await
                .change_context(WatcherError::IndexFailed)
                .attach_printable("uncle query failed")?;
            for row in rows {
                let block_number: i64 = row.get(0);
                entry(wrappers, block_number).uncles.push(UncleModel {
                    cid: row.get(1),
                    mh_key: row.get(2),
                    block_hash: row.get(3),
                    parent_hash: row.get(4),
                    reward: row.get(5),
                });
            }
        }
        Ok(())
    }

    async fn retrieve_transactions(
        &self,
        settings: &SubscriptionSettings,
        start: i64,
        end: i64,
        wrappers: &mut BTreeMap<i64, CidWrapper>,
    ) -> Result<()> {
        let src: Vec<String> = settings.tx_filter.src.iter().map(address_key).collect();
        let dst: Vec<String> = settings.tx_filter.dst.iter().map(address_key).collect();
        let rows = self
            .client
            .query(TX_QUERY, &[&self.node_id, &start, &end, &src, &dst])
            .await
            .change_context(WatcherError::IndexFailed)
            .attach_printable("transaction query failed")?;
        for row in rows {
            let block_number: i64 = row.get(0);
            entry(wrappers, block_number).transactions.push(TxModel {
                cid: row.get(1),
                mh_key: row.get(2),
                tx_hash: row.get(3),
                index: row.get(4),
                src: row.get(5),
                dst: row.get(6),
            });
        }
        Ok(())
    }

    async fn retrieve_receipts(
        &self,
        settings: &SubscriptionSettings,
        start: i64,
        end: i64,
        wrappers: &mut BTreeMap<i64, CidWrapper>,
    ) -> Result<()> {
        let filter = &settings.receipt_filter;
        let contracts: Vec<String> = filter.contracts.iter().map(address_key).collect();
        let topics = topic_slots(filter);
        let match_txs = match_txs_enabled(settings);
        let src: Vec<String> = settings.tx_filter.src.iter().map(address_key).collect();
        let dst: Vec<String> = settings.tx_filter.dst.iter().map(address_key).collect();

        let rows = self
            .client
            .query(
                RECEIPT_QUERY,
                &[
                    &self.node_id,
                    &start,
                    &end,
                    &contracts,
                    &topics[0],
                    &topics[1],
                    &topics[2],
                    &topics[3],
                    &match_txs,
                    &src,
                    &dst,
                ],
            )
            .await
            .change_context(WatcherError::IndexFailed)
            .attach_printable("receipt query failed")?;
        for row in rows {
            let block_number: i64 = row.get(0);
            entry(wrappers, block_number).receipts.push(ReceiptModel {
                cid: row.get(1),
                mh_key: row.get(2),
                tx_hash: row.get(3),
                contract: row.get(4),
                topic0s: row.get(5),
                topic1s: row.get(6),
                topic2s: row.get(7),
                topic3s: row.get(8),
            });
        }
        Ok(())
    }

    async fn retrieve_state(
        &self,
        settings: &SubscriptionSettings,
        start: i64,
        end: i64,
        wrappers: &mut BTreeMap<i64, CidWrapper>,
    ) -> Result<()> {
        let filter = &settings.state_filter;
        let keys = keccak_keys(&filter.addresses);
        let rows = self
            .client
            .query(
                STATE_QUERY,
                &[&self.node_id, &start, &end, &keys, &filter.intermediate_nodes],
            )
            .await
            .change_context(WatcherError::IndexFailed)
            .attach_printable("state query failed")?;
        for row in rows {
            let block_number: i64 = row.get(0);
            entry(wrappers, block_number).state_nodes.push(StateNodeModel {
                cid: row.get(1),
                mh_key: row.get(2),
                state_key: row.get(3),
                node_type: row.get(4),
                path: row.get(5),
            });
        }
        Ok(())
    }

    async fn retrieve_storage(
        &self,
        settings: &SubscriptionSettings,
        start: i64,
        end: i64,
        wrappers: &mut BTreeMap<i64, CidWrapper>,
    ) -> Result<()> {
        let filter = &settings.storage_filter;
        let state_keys = keccak_keys(&filter.addresses);
        let storage_keys: Vec<String> = filter.storage_keys.iter().map(hash_key).collect();
        let rows = self
            .client
            .query(
                STORAGE_QUERY,
                &[
                    &self.node_id,
                    &start,
                    &end,
                    &state_keys,
                    &storage_keys,
                    &filter.intermediate_nodes,
                ],
            )
            .await
            .change_context(WatcherError::IndexFailed)
            .attach_printable("storage query failed")?;
        for row in rows {
            let block_number: i64 = row.get(0);
            entry(wrappers, block_number)
                .storage_nodes
                .push(StorageNodeModel {
                    cid: row.get(1),
                    mh_key: row.get(2),
                    state_key: row.get(3),
                    storage_key: row.get(4),
                    node_type: row.get(5),
                    path: row.get(6),
                });
        }
        Ok(())
    }

    /// Drops every row for `[from, to]` so the backfiller can re-fetch the
    /// range; per-object rows cascade with their header.
    pub async fn clean(&self, from: u64, to: u64) -> Result<()> {
        self.client
            .execute(CLEAN_QUERY, &[&self.node_id, &(from as i64), &(to as i64)])
            .await
            .change_context(WatcherError::IndexFailed)
            .attach_printable("clean failed")?;
        Ok(())
    }
}

fn entry(wrappers: &mut BTreeMap<i64, CidWrapper>, block_number: i64) -> &mut CidWrapper {
    wrappers.entry(block_number).or_insert_with(|| CidWrapper {
        block_number,
        ..Default::default()
    })
}

#[async_trait]
impl CidRetriever for EthCidRetriever {
    async fn gaps(&self, from: u64, to: u64) -> Result<Vec<Gap>> {
        let rows = self
            .client
            .query(GAP_QUERY, &[&self.node_id, &(from as i64), &(to as i64)])
            .await
            .change_context(WatcherError::IndexFailed)
            .attach_printable("gap query failed")?;
        Ok(rows
            .into_iter()
            .map(|row| Gap {
                start: row.get::<_, i64>(0) as u64,
                end: row.get::<_, i64>(1) as u64,
            })
            .collect())
    }

    async fn stale_heights(&self, level: i32, from: u64, to: u64) -> Result<Vec<u64>> {
        let rows = self
            .client
            .query(
                STALE_QUERY,
                &[&self.node_id, &level, &(from as i64), &(to as i64)],
            )
            .await
            .change_context(WatcherError::IndexFailed)
            .attach_printable("validation level query failed")?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<_, i64>(0) as u64)
            .collect())
    }

    async fn first_block_number(&self) -> Result<Option<u64>> {
        let row = self
            .client
            .query_one(
                "SELECT MIN(block_number) FROM eth.header_cids WHERE node_id = $1",
                &[&self.node_id],
            )
            .await
            .change_context(WatcherError::IndexFailed)?;
        Ok(row.get::<_, Option<i64>>(0).map(|n| n as u64))
    }

    async fn last_block_number(&self) -> Result<Option<u64>> {
        let row = self
            .client
            .query_one(
                "SELECT MAX(block_number) FROM eth.header_cids WHERE node_id = $1",
                &[&self.node_id],
            )
            .await
            .change_context(WatcherError::IndexFailed)?;
        Ok(row.get::<_, Option<i64>>(0).map(|n| n as u64))
    }
}
