use async_trait::async_trait;
use error_stack::ResultExt;
use tokio_postgres::Client;

use chainwatch_common::{
    adapter::CidIndexer,
    error::{Result, WatcherError},
    IpldNode,
};

use crate::{adapter::BtcAdapter, models::CidManifest};

pub const BTC_SCHEMA: &str = r#"
CREATE SCHEMA IF NOT EXISTS btc;
CREATE TABLE IF NOT EXISTS btc.header_cids (
    id              SERIAL PRIMARY KEY,
    node_id         INTEGER NOT NULL,
    block_number    BIGINT NOT NULL,
    block_hash      TEXT NOT NULL,
    parent_hash     TEXT NOT NULL,
    cid             TEXT NOT NULL,
    mh_key          TEXT NOT NULL,
    timestamp       BIGINT NOT NULL,
    bits            BIGINT NOT NULL,
    times_validated INTEGER NOT NULL DEFAULT 1,
    UNIQUE (node_id, block_number, block_hash)
);
CREATE INDEX IF NOT EXISTS btc_header_cids_block_number_idx
    ON btc.header_cids (block_number);
CREATE TABLE IF NOT EXISTS btc.transaction_cids (
    id           SERIAL PRIMARY KEY,
    header_id    INTEGER NOT NULL REFERENCES btc.header_cids (id) ON DELETE CASCADE,
    tx_hash      TEXT NOT NULL,
    tx_index     BIGINT NOT NULL,
    segwit       BOOLEAN NOT NULL,
    witness_hash TEXT NOT NULL,
    cid          TEXT NOT NULL,
    mh_key       TEXT NOT NULL,
    UNIQUE (header_id, tx_hash)
);
CREATE TABLE IF NOT EXISTS btc.tx_inputs (
    id               SERIAL PRIMARY KEY,
    tx_id            INTEGER NOT NULL REFERENCES btc.transaction_cids (id) ON DELETE CASCADE,
    input_index      BIGINT NOT NULL,
    outpoint_tx_hash TEXT NOT NULL,
    outpoint_index   BIGINT NOT NULL,
    sig_script       BYTEA NOT NULL,
    UNIQUE (tx_id, input_index)
);
CREATE TABLE IF NOT EXISTS btc.tx_outputs (
    id           SERIAL PRIMARY KEY,
    tx_id        INTEGER NOT NULL REFERENCES btc.transaction_cids (id) ON DELETE CASCADE,
    output_index BIGINT NOT NULL,
    value        BIGINT NOT NULL,
    pk_script    BYTEA NOT NULL,
    script_class TEXT NOT NULL,
    addresses    TEXT[] NOT NULL DEFAULT '{}',
    UNIQUE (tx_id, output_index)
);
"#;

/// Writes one block's manifest into the Bitcoin index tables within a
/// single transaction.
pub struct BtcCidIndexer {
    client: tokio::sync::Mutex<Client>,
    node_id: i32,
}

impl BtcCidIndexer {
    pub async fn new(client: Client, node_id: i32) -> Result<Self> {
        client
            .batch_execute(BTC_SCHEMA)
            .await
            .change_context(WatcherError::Configuration)
            .attach_printable("failed to apply btc schema")?;
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
                "INSERT INTO btc.header_cids
                    (node_id, block_number, block_hash, parent_hash, cid, mh_key, timestamp, bits)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (node_id, block_number, block_hash)
                 DO UPDATE SET times_validated = btc.header_cids.times_validated + 1
                 RETURNING id",
                &[
                    &self.node_id,
                    &header.block_number,
                    &header.block_hash,
                    &header.parent_hash,
                    &header.cid,
                    &header.mh_key,
                    &header.timestamp,
                    &header.bits,
                ],
            )
            .await
            .change_context(WatcherError::IndexFailed)
            .attach_printable("failed to upsert header row")?
            .get(0);

        for transaction in &manifest.transactions {
            let tx_id: i32 = tx
                .query_one(
                    "INSERT INTO btc.transaction_cids
                        (header_id, tx_hash, tx_index, segwit, witness_hash, cid, mh_key)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)
                     ON CONFLICT (header_id, tx_hash) DO UPDATE SET cid = EXCLUDED.cid
                     RETURNING id",
                    &[
                        &header_id,
                        &transaction.tx_hash,
                        &transaction.index,
                        &transaction.segwit,
                        &transaction.witness_hash,
                        &transaction.cid,
                        &transaction.mh_key,
                    ],
                )
                .await
                .change_context(WatcherError::IndexFailed)
                .attach_printable("failed to upsert transaction row")?
                .get(0);

            for input in &transaction.inputs {
                tx.execute(
                    "INSERT INTO btc.tx_inputs
                        (tx_id, input_index, outpoint_tx_hash, outpoint_index, sig_script)
                     VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (tx_id, input_index) DO NOTHING",
                    &[
                        &tx_id,
                        &(input.index as i64),
                        &input.outpoint_tx_hash,
                        &(input.outpoint_index as i64),
                        &input.sig_script,
                    ],
                )
                .await
                .change_context(WatcherError::IndexFailed)
                .attach_printable("failed to insert tx input row")?;
            }

            for output in &transaction.outputs {
                tx.execute(
                    "INSERT INTO btc.tx_outputs
                        (tx_id, output_index, value, pk_script, script_class, addresses)
                     VALUES ($1, $2, $3, $4, $5, $6)
                     ON CONFLICT (tx_id, output_index) DO NOTHING",
                    &[
                        &tx_id,
                        &(output.index as i64),
                        &output.value,
                        &output.pk_script,
                        &output.script_class.as_str(),
                        &output.addresses,
                    ],
                )
                .await
                .change_context(WatcherError::IndexFailed)
                .attach_printable("failed to insert tx output row")?;
            }
        }

        tx.commit()
            .await
            .change_context(WatcherError::IndexFailed)
            .attach_printable("failed to commit index transaction")
    }
}

#[async_trait]
impl CidIndexer<BtcAdapter> for BtcCidIndexer {
    async fn index(&self, manifest: &CidManifest, nodes: &[IpldNode]) -> Result<()> {
        self.insert_manifest(manifest, nodes).await
    }
}
