use bitcoin::hashes::{sha256d, Hash};
use error_stack::Report;

use chainwatch_common::{
    error::{Result, WatcherError},
    IpldNode,
};

use crate::models::{CidManifest, ConvertedPayload, HeaderModel, TxModel};

// Multicodec table entries for Bitcoin IPLD nodes.
pub const MH_DBL_SHA2_256: u64 = 0x56;
pub const BITCOIN_BLOCK: u64 = 0xb0;
pub const BITCOIN_TX: u64 = 0xb1;

fn sha256d_node(codec: u64, data: Vec<u8>) -> Result<IpldNode> {
    let digest = sha256d::Hash::hash(&data).to_byte_array();
    IpldNode::from_digest(codec, MH_DBL_SHA2_256, &digest, data)
}

/// Builds the canonical IPLD nodes for one converted payload.
///
/// The transaction merkle tree is recomputed and checked against the header
/// before anything is emitted; a mismatch rejects the whole block.
pub fn encode(payload: &ConvertedPayload) -> Result<(Vec<IpldNode>, CidManifest)> {
    let header = &payload.block.header;

    let computed_root = payload.block.compute_merkle_root().ok_or_else(|| {
        Report::new(WatcherError::RootMismatch).attach_printable("block has no transactions")
    })?;
    if computed_root != header.merkle_root {
        return Err(Report::new(WatcherError::RootMismatch).attach_printable(format!(
            "computed merkle root {computed_root} does not match header {}",
            header.merkle_root
        )));
    }

    let mut nodes = Vec::with_capacity(1 + payload.block.txdata.len());

    let header_node = sha256d_node(BITCOIN_BLOCK, bitcoin::consensus::serialize(header))?;
    let header_model = HeaderModel {
        cid: header_node.cid.to_string(),
        mh_key: header_node.store_key(),
        block_number: payload.height as i64,
        block_hash: payload.block.block_hash().to_string(),
        parent_hash: header.prev_blockhash.to_string(),
        // The header carries seconds; the index stores nanoseconds.
        timestamp: header.time as i64 * 1_000_000_000,
        bits: header.bits.to_consensus() as i64,
    };
    nodes.push(header_node);

    let mut transactions = Vec::with_capacity(payload.block.txdata.len());
    for (tx, meta) in payload.block.txdata.iter().zip(&payload.tx_meta) {
        let node = sha256d_node(BITCOIN_TX, bitcoin::consensus::serialize(tx))?;
        transactions.push(TxModel {
            cid: node.cid.to_string(),
            mh_key: node.store_key(),
            tx_hash: meta.tx_hash.clone(),
            index: meta.index as i64,
            segwit: meta.segwit,
            witness_hash: meta.witness_hash.clone(),
            inputs: meta.inputs.clone(),
            outputs: meta.outputs.clone(),
        });
        nodes.push(node);
    }

    let manifest = CidManifest {
        header: header_model,
        transactions,
    };
    Ok((nodes, manifest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{converter, models::RawBlockPayload, test_utils::two_tx_block};
    use bitcoin::hashes::Hash as _;

    fn payload() -> ConvertedPayload {
        let block = two_tx_block();
        converter::convert(RawBlockPayload {
            height: 700_000,
            block: bitcoin::consensus::serialize(&block),
        })
        .unwrap()
    }

    #[test]
    fn header_row_carries_bits_and_nanosecond_timestamp() {
        let payload = payload();
        let (nodes, manifest) = encode(&payload).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(manifest.transactions.len(), 2);
        assert_eq!(
            manifest.header.bits,
            payload.block.header.bits.to_consensus() as i64
        );
        assert_eq!(
            manifest.header.timestamp,
            payload.block.header.time as i64 * 1_000_000_000
        );
    }

    #[test]
    fn cids_use_double_sha_and_bitcoin_codecs() {
        let payload = payload();
        let (nodes, _) = encode(&payload).unwrap();
        assert_eq!(nodes[0].cid.codec(), BITCOIN_BLOCK);
        assert_eq!(nodes[1].cid.codec(), BITCOIN_TX);
        for node in &nodes {
            assert_eq!(node.cid.hash().code(), MH_DBL_SHA2_256);
            let digest = sha256d::Hash::hash(&node.data).to_byte_array();
            assert_eq!(node.cid.hash().digest(), digest);
        }
    }

    #[test]
    fn tampered_merkle_root_is_rejected() {
        let mut payload = payload();
        payload.block.header.merkle_root =
            bitcoin::TxMerkleNode::from_byte_array([0xAB; 32]);
        let err = encode(&payload).unwrap_err();
        assert_eq!(*err.current_context(), WatcherError::RootMismatch);
    }
}
