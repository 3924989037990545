use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::ResultExt;
use tokio_postgres::Client;

use chainwatch_common::{
    adapter::CidRetriever,
    error::{Result, WatcherError},
    Gap,
};

use crate::{
    models::{CidWrapper, HeaderModel, TxModel},
    settings::{SubscriptionSettings, TxFilter},
};

const HEADER_QUERY: &str = "SELECT block_number, cid, mh_key, block_hash, parent_hash, timestamp, bits
 FROM btc.header_cids
 WHERE node_id = $1 AND block_number BETWEEN $2 AND $3
 ORDER BY block_number";

const TX_QUERY: &str = "SELECT h.block_number, t.cid, t.mh_key, t.tx_hash, t.tx_index,
        t.segwit, t.witness_hash
 FROM btc.transaction_cids t
 JOIN btc.header_cids h ON t.header_id = h.id
 WHERE h.node_id = $1 AND h.block_number BETWEEN $2 AND $3
   AND (
     (cardinality($4::bigint[]) = 0 AND cardinality($5::text[]) = 0
      AND cardinality($6::text[]) = 0)
     OR t.tx_index = ANY($4::bigint[])
     OR EXISTS (
         SELECT 1 FROM btc.tx_outputs o
         WHERE o.tx_id = t.id
           AND (o.script_class = ANY($5::text[])
                OR o.addresses && $6::text[])
     )
   )
 ORDER BY h.block_number, t.tx_index";

// The queried bounds ride along as sentinel heights so a hole at either
// edge of [from, to] still has a neighbor to compare against.
const GAP_QUERY: &str = "SELECT gap_start, gap_end
 FROM (
     SELECT block_number + 1 AS gap_start,
            LEAD(block_number) OVER (ORDER BY block_number) - 1 AS gap_end
     FROM (
         SELECT $2::bigint - 1 AS block_number
         UNION
         SELECT block_number FROM btc.header_cids
         WHERE node_id = $1 AND block_number BETWEEN $2 AND $3
         UNION
         SELECT $3::bigint + 1 AS block_number
     ) heights
 ) windowed
 WHERE gap_end IS NOT NULL AND gap_start <= gap_end";

const STALE_QUERY: &str = "SELECT DISTINCT block_number FROM btc.header_cids
 WHERE node_id = $1 AND times_validated < $2
   AND block_number BETWEEN $3 AND $4
 ORDER BY block_number";

const CLEAN_QUERY: &str = "DELETE FROM btc.header_cids
 WHERE node_id = $1 AND block_number BETWEEN $2 AND $3";

/// Text-array parameter for the script-class predicate, in the names the
/// indexer writes.
fn class_params(filter: &TxFilter) -> Vec<String> {
    filter
        .pk_script_classes
        .iter()
        .map(|class| class.as_str().to_string())
        .collect()
}

/// Reads the Bitcoin index back.
pub struct BtcCidRetriever {
    client: Arc<Client>,
    node_id: i32,
}

impl BtcCidRetriever {
    pub fn new(client: Arc<Client>, node_id: i32) -> Self {
        Self { client, node_id }
    }

    /// Rows matching the subscription predicate across `[start, end]`,
    /// grouped per block and ascending by height.
    pub async fn retrieve(
        &self,
        settings: &SubscriptionSettings,
        start: u64,
        end: u64,
    ) -> Result<Vec<CidWrapper>> {
        let (start, end) = (start as i64, end as i64);
        let mut wrappers: BTreeMap<i64, CidWrapper> = BTreeMap::new();

        if !settings.header_filter.off {
            let rows = self
                .client
                .query(HEADER_QUERY, &[&self.node_id, &start, &end])
                .await
                .change_context(WatcherError::IndexFailed)
                .attach_printable("header query failed")?;
            for row in rows {
                let block_number: i64 = row.get(0);
                entry(&mut wrappers, block_number).header = Some(HeaderModel {
                    cid: row.get(1),
                    mh_key: row.get(2),
                    block_number,
                    block_hash: row.get(3),
                    parent_hash: row.get(4),
                    timestamp: row.get(5),
                    bits: row.get(6),
                });
            }
        }

        if !settings.tx_filter.off {
            let filter = &settings.tx_filter;
            let classes = class_params(filter);
            let rows = self
                .client
                .query(
                    TX_QUERY,
                    &[
                        &self.node_id,
                        &start,
                        &end,
                        &filter.indexes,
                        &classes,
                        &filter.addresses,
                    ],
                )
                .await
                .change_context(WatcherError::IndexFailed)
                .attach_printable("transaction query failed")?;
            for row in rows {
                let block_number: i64 = row.get(0);
                entry(&mut wrappers, block_number).transactions.push(TxModel {
                    cid: row.get(1),
                    mh_key: row.get(2),
                    tx_hash: row.get(3),
                    index: row.get(4),
                    segwit: row.get(5),
                    witness_hash: row.get(6),
                    inputs: Vec::new(),
                    outputs: Vec::new(),
                });
            }
        }

        Ok(wrappers.into_values().collect())
    }

    /// Drops every row for `[from, to]` so the backfiller can re-fetch the
    /// range.
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
impl CidRetriever for BtcCidRetriever {
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
                "SELECT MIN(block_number) FROM btc.header_cids WHERE node_id = $1",
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
                "SELECT MAX(block_number) FROM btc.header_cids WHERE node_id = $1",
                &[&self.node_id],
            )
            .await
            .change_context(WatcherError::IndexFailed)?;
        Ok(row.get::<_, Option<i64>>(0).map(|n| n as u64))
    }
}
