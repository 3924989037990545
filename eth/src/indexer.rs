use async_trait::async_trait;
use error_stack::ResultExt;
use tokio_postgres::Client;

use chainwatch_common::{
    adapter::CidIndexer,
    error::{Result, WatcherError},
    IpldNode,
};

use crate::{adapter::EthAdapter, models::CidManifest};

pub const ETH_SCHEMA: &str = r#"
CREATE SCHEMA IF NOT EXISTS eth;
CREATE TABLE IF NOT EXISTS eth.header_cids (
    id              SERIAL PRIMARY KEY,
    node_id         INTEGER NOT NULL,
    block_number    BIGINT NOT NULL,
    block_hash      TEXT NOT NULL,
    parent_hash     TEXT NOT NULL,
    cid             TEXT NOT NULL,
    mh_key          TEXT NOT NULL,
    td              TEXT NOT NULL,
    reward          TEXT NOT NULL,
    state_root      TEXT NOT NULL,
    tx_root         TEXT NOT NULL,
    receipt_root    TEXT NOT NULL,
    uncle_root      TEXT NOT NULL,
    timestamp       BIGINT NOT NULL,
    times_validated INTEGER NOT NULL DEFAULT 1,
    UNIQUE (node_id, block_number, block_hash)
);
CREATE INDEX IF NOT EXISTS header_cids_block_number_idx
    ON eth.header_cids (block_number);
CREATE TABLE IF NOT EXISTS eth.uncle_cids (
    id          SERIAL PRIMARY KEY,
    header_id   INTEGER NOT NULL REFERENCES eth.header_cids (id) ON DELETE CASCADE,
    block_hash  TEXT NOT NULL,
    parent_hash TEXT NOT NULL,
    cid         TEXT NOT NULL,
    mh_key      TEXT NOT NULL,
    reward      TEXT NOT NULL,
    UNIQUE (header_id, block_hash)
);
CREATE TABLE IF NOT EXISTS eth.transaction_cids (
    id        SERIAL PRIMARY KEY,
    header_id INTEGER NOT NULL REFERENCES eth.header_cids (id) ON DELETE CASCADE,
    tx_hash   TEXT NOT NULL,
    tx_index  BIGINT NOT NULL,
    src       TEXT NOT NULL,
    dst       TEXT,
    cid       TEXT NOT NULL,
    mh_key    TEXT NOT NULL,
    UNIQUE (header_id, tx_hash)
);
CREATE TABLE IF NOT EXISTS eth.receipt_cids (
    id       SERIAL PRIMARY KEY,
    tx_id    INTEGER NOT NULL REFERENCES eth.transaction_cids (id) ON DELETE CASCADE,
    cid      TEXT NOT NULL,
    mh_key   TEXT NOT NULL,
    contract TEXT,
    topic0s  TEXT[] NOT NULL DEFAULT '{}',
    topic1s  TEXT[] NOT NULL DEFAULT '{}',
    topic2s  TEXT[] NOT NULL DEFAULT '{}',
    topic3s  TEXT[] NOT NULL DEFAULT '{}',
    UNIQUE (tx_id)
);
CREATE TABLE IF NOT EXISTS eth.state_cids (
    id        SERIAL PRIMARY KEY,
    header_id INTEGER NOT NULL REFERENCES eth.header_cids (id) ON DELETE CASCADE,
    state_key TEXT NOT NULL,
    cid       TEXT NOT NULL,
    mh_key    TEXT NOT NULL,
    node_type INTEGER NOT NULL,
    path      BYTEA NOT NULL,
    UNIQUE (header_id, path)
);
CREATE TABLE IF NOT EXISTS eth.storage_cids (
    id          SERIAL PRIMARY KEY,
    state_id    INTEGER NOT NULL REFERENCES eth.state_cids (id) ON DELETE CASCADE,
    storage_key TEXT NOT NULL,
    cid         TEXT NOT NULL,
    mh_key      TEXT NOT NULL,
    node_type   INTEGER NOT NULL,
    path        BYTEA NOT NULL,
    UNIQUE (state_id, path)
);
"#;

/// Writes one block's manifest into the Ethereum index tables, all within a
/// single transaction. Duplicate block hashes at the same height are
/// tolerated for forks; re-indexing a block bumps its validation counter.
pub struct EthCidIndexer {
    client: tokio::sync::Mutex<Client>,
    node_id: i32,
}

impl EthCidIndexer {
    pub async fn new(client: Client, node_id: i32) -> Result<Self> {
        client
            .batch_execute(ETH_SCHEMA)
            .await
            .change_context(WatcherError::Configuration)
            .attach_printable("failed to apply eth schema")?;
        Ok(Self {
            client: tokio::sync::Mutex::new(client),
            node_id,
        })
    }

    async fn insert_manifest(&self, manifest: &CidManifest, nodes: &[IpldNode]) -> Result<()> {
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .change_context(WatcherError::IndexFailed)
            .attach_printable("failed to open index transaction")?;

        // Direct-store mode: the IPLD bytes commit atomically with the rows.
        for node in nodes {
            tx.execute(
                "INSERT INTO public.blocks (key, data) VALUES ($1, $2)
                 ON CONFLICT (key) DO NOTHING",
                &[&node.store_key(), &node.data],
            )
            .await
            .change_context(WatcherError::PublishFailed)
            .attach_printable("failed to write blocks row")?;
        }

        let header = &manifest.header;
        let header_id: i32 = tx
            .query_one(
                "INSERT INTO eth.header_cids
                    (node_id, block_number, block_hash, parent_hash, cid, mh_key, td, reward,
                     state_root, tx_root, receipt_root, uncle_root, timestamp)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                 ON CONFLICT (node_id, block_number, block_hash)
                 DO UPDATE SET times_validated = eth.header_cids.times_validated + 1
                 RETURNING id",
                &[
                    &self.node_id,
                    &header.block_number,
                    &header.block_hash,
                    &header.parent_hash,
                    &header.cid,
                    &header.mh_key,
                    &header.total_difficulty,
                    &header.reward,
                    &header.state_root,
                    &header.tx_root,
                    &header.receipt_root,
                    &header.uncle_root,
                    &header.timestamp,
                ],
            )
            .await
            .change_context(WatcherError::IndexFailed)
            .attach_printable("failed to upsert header row")?
            .get(0);

        for uncle in &manifest.uncles {
            tx.execute(
                "INSERT INTO eth.uncle_cids
                    (header_id, block_hash, parent_hash, cid, mh_key, reward)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (header_id, block_hash) DO NOTHING",
                &[
                    &header_id,
                    &uncle.block_hash,
                    &uncle.parent_hash,
                    &uncle.cid,
                    &uncle.mh_key,
                    &uncle.reward,
                ],
            )
            .await
            .change_context(WatcherError::IndexFailed)
            .attach_printable("failed to insert uncle row")?;
        }

        let mut tx_ids = std::collections::HashMap::with_capacity(manifest.transactions.len());
        for transaction in &manifest.transactions {
            let tx_id: i32 = tx
                .query_one(
                    "INSERT INTO eth.transaction_cids
                        (header_id, tx_hash, tx_index, src, dst, cid, mh_key)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)
                     ON CONFLICT (header_id, tx_hash) DO UPDATE SET cid = EXCLUDED.cid
                     RETURNING id",
                    &[
                        &header_id,
                        &transaction.tx_hash,
                        &transaction.index,
                        &transaction.src,
                        &transaction.dst,
                        &transaction.cid,
                        &transaction.mh_key,
                    ],
                )
                .await
                .change_context(WatcherError::IndexFailed)
                .attach_printable("failed to upsert transaction row")?
                .get(0);
            tx_ids.insert(transaction.tx_hash.clone(), tx_id);
        }

        for receipt in &manifest.receipts {
            let Some(tx_id) = tx_ids.get(&receipt.tx_hash) else {
                return Err(error_stack::Report::new(WatcherError::IndexFailed)
                    .attach_printable(format!("receipt references unknown tx {}", receipt.tx_hash)));
            };
            tx.execute(
                "INSERT INTO eth.receipt_cids
                    (tx_id, cid, mh_key, contract, topic0s, topic1s, topic2s, topic3s)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (tx_id) DO UPDATE SET cid = EXCLUDED.cid",
                &[
                    tx_id,
                    &receipt.cid,
                    &receipt.mh_key,
                    &receipt.contract,
                    &receipt.topic0s,
                    &receipt.topic1s,
                    &receipt.topic2s,
                    &receipt.topic3s,
                ],
            )
            .await
            .change_context(WatcherError::IndexFailed)
            .attach_printable("failed to upsert receipt row")?;
        }

        let mut state_ids = std::collections::HashMap::with_capacity(manifest.state_nodes.len());
        for state in &manifest.state_nodes {
            let state_id: i32 = tx
                .query_one(
                    "INSERT INTO eth.state_cids
                        (header_id, state_key, cid, mh_key, node_type, path)
                     VALUES ($1, $2, $3, $4, $5, $6)
                     ON CONFLICT (header_id, path) DO UPDATE SET cid = EXCLUDED.cid
                     RETURNING id",
                    &[
                        &header_id,
                        &state.state_key,
                        &state.cid,
                        &state.mh_key,
                        &state.node_type,
                        &state.path,
                    ],
                )
                .await
                .change_context(WatcherError::IndexFailed)
                .attach_printable("failed to upsert state row")?
                .get(0);
            state_ids.insert(state.state_key.clone(), state_id);
        }

        for storage in &manifest.storage_nodes {
            let Some(state_id) = state_ids.get(&storage.state_key) else {
                return Err(error_stack::Report::new(WatcherError::IndexFailed)
                    .attach_printable(format!(
                        "storage node references unknown state key {}",
                        storage.state_key
                    )));
            };
            tx.execute(
                "INSERT INTO eth.storage_cids
                    (state_id, storage_key, cid, mh_key, node_type, path)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (state_id, path) DO UPDATE SET cid = EXCLUDED.cid",
                &[
                    state_id,
                    &storage.storage_key,
                    &storage.cid,
                    &storage.mh_key,
                    &storage.node_type,
                    &storage.path,
                ],
            )
            .await
            .change_context(WatcherError::IndexFailed)
            .attach_printable("failed to upsert storage row")?;
        }

        tx.commit()
            .await
            .change_context(WatcherError::IndexFailed)
            .attach_printable("failed to commit index transaction")
    }
}

#[async_trait]
impl CidIndexer<EthAdapter> for EthCidIndexer {
    async fn index(&self, manifest: &CidManifest, nodes: &[IpldNode]) -> Result<()> {
        self.insert_manifest(manifest, nodes).await
    }
}
