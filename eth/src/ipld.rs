use alloy_consensus::{proofs, Transaction, TxReceipt};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{keccak256, U256};
use error_stack::Report;

use chainwatch_common::{
    error::{Result, WatcherError},
    IpldNode,
};

use crate::models::{
    address_key, hash_key, CidManifest, ConvertedPayload, HeaderModel, ReceiptModel,
    StateNodeModel, StorageNodeModel, TxModel, UncleModel,
};

// Multicodec table entries for Ethereum IPLD nodes.
pub const MH_KECCAK_256: u64 = 0x1b;
pub const ETH_HEADER: u64 = 0x90;
pub const ETH_HEADER_LIST: u64 = 0x91;
pub const ETH_TX: u64 = 0x93;
pub const ETH_RECEIPT: u64 = 0x95;
pub const ETH_STATE_TRIE: u64 = 0x96;
pub const ETH_STORAGE_TRIE: u64 = 0x98;

fn keccak_node(codec: u64, data: Vec<u8>) -> Result<IpldNode> {
    let digest = keccak256(&data);
    IpldNode::from_digest(codec, MH_KECCAK_256, digest.as_slice(), data)
}

/// Builds the canonical IPLD nodes for one converted payload and the
/// manifest describing them.
///
/// The transaction and receipt tries are recomputed and checked against the
/// header before anything is emitted; a mismatch rejects the whole block.
pub fn encode(payload: &ConvertedPayload) -> Result<(Vec<IpldNode>, CidManifest)> {
    let header = payload.header();

    let tx_root = proofs::calculate_transaction_root(payload.transactions());
    if tx_root != header.transactions_root {
        return Err(Report::new(WatcherError::RootMismatch).attach_printable(format!(
            "computed tx root {tx_root} does not match header {}",
            header.transactions_root
        )));
    }
    let receipt_root = proofs::calculate_receipt_root(&payload.receipts);
    if receipt_root != header.receipts_root {
        return Err(Report::new(WatcherError::RootMismatch).attach_printable(format!(
            "computed receipt root {receipt_root} does not match header {}",
            header.receipts_root
        )));
    }

    let mut nodes = Vec::with_capacity(
        2 + payload.transactions().len() * 2
            + payload.state_nodes.len()
            + payload.storage_nodes.len(),
    );

    let header_node = keccak_node(ETH_HEADER, alloy_rlp::encode(header))?;
    let header_model = HeaderModel {
        cid: header_node.cid.to_string(),
        mh_key: header_node.store_key(),
        block_number: header.number as i64,
        block_hash: hash_key(&header.hash_slow()),
        parent_hash: hash_key(&header.parent_hash),
        total_difficulty: payload.total_difficulty.to_string(),
        reward: block_reward(payload).to_string(),
        state_root: hash_key(&header.state_root),
        tx_root: hash_key(&header.transactions_root),
        receipt_root: hash_key(&header.receipts_root),
        uncle_root: hash_key(&header.ommers_hash),
        timestamp: header.timestamp as i64,
    };
    nodes.push(header_node);

    let mut uncles = Vec::with_capacity(payload.uncles().len());
    for uncle in payload.uncles() {
        let node = keccak_node(ETH_HEADER_LIST, alloy_rlp::encode(uncle))?;
        uncles.push(UncleModel {
            cid: node.cid.to_string(),
            mh_key: node.store_key(),
            block_hash: hash_key(&uncle.hash_slow()),
            parent_hash: hash_key(&uncle.parent_hash),
            reward: uncle_reward(header.number, uncle.number).to_string(),
        });
        nodes.push(node);
    }

    let mut transactions = Vec::with_capacity(payload.transactions().len());
    for (tx, meta) in payload.transactions().iter().zip(&payload.tx_meta) {
        let node = keccak_node(ETH_TX, tx.encoded_2718())?;
        transactions.push(TxModel {
            cid: node.cid.to_string(),
            mh_key: node.store_key(),
            tx_hash: hash_key(&meta.tx_hash),
            index: meta.index as i64,
            src: address_key(&meta.src),
            dst: meta.dst.as_ref().map(address_key),
        });
        nodes.push(node);
    }

    let mut receipts = Vec::with_capacity(payload.receipts.len());
    for (receipt, meta) in payload.receipts.iter().zip(&payload.receipt_meta) {
        let node = keccak_node(ETH_RECEIPT, receipt.encoded_2718())?;
        receipts.push(ReceiptModel {
            cid: node.cid.to_string(),
            mh_key: node.store_key(),
            tx_hash: hash_key(&meta.tx_hash),
            contract: meta.contract.as_ref().map(address_key),
            topic0s: meta.topics[0].iter().map(hash_key).collect(),
            topic1s: meta.topics[1].iter().map(hash_key).collect(),
            topic2s: meta.topics[2].iter().map(hash_key).collect(),
            topic3s: meta.topics[3].iter().map(hash_key).collect(),
        });
        nodes.push(node);
    }

    let mut state_nodes = Vec::with_capacity(payload.state_nodes.len());
    for state in &payload.state_nodes {
        let node = keccak_node(ETH_STATE_TRIE, state.value.clone())?;
        state_nodes.push(StateNodeModel {
            cid: node.cid.to_string(),
            mh_key: node.store_key(),
            state_key: hash_key(&state.state_key),
            node_type: state.kind.as_i32(),
            path: state.path.clone(),
        });
        nodes.push(node);
    }

    let mut storage_nodes = Vec::with_capacity(payload.storage_nodes.len());
    for storage in &payload.storage_nodes {
        let node = keccak_node(ETH_STORAGE_TRIE, storage.value.clone())?;
        storage_nodes.push(StorageNodeModel {
            cid: node.cid.to_string(),
            mh_key: node.store_key(),
            state_key: hash_key(&storage.state_key),
            storage_key: hash_key(&storage.storage_key),
            node_type: storage.kind.as_i32(),
            path: storage.path.clone(),
        });
        nodes.push(node);
    }

    let manifest = CidManifest {
        header: header_model,
        uncles,
        transactions,
        receipts,
        state_nodes,
        storage_nodes,
    };
    Ok((nodes, manifest))
}

const BYZANTIUM: u64 = 4_370_000;
const CONSTANTINOPLE: u64 = 7_280_000;
const MERGE: u64 = 15_537_394;

fn base_block_reward(number: u64) -> U256 {
    const ETHER: u128 = 1_000_000_000_000_000_000;
    if number >= MERGE {
        U256::ZERO
    } else if number >= CONSTANTINOPLE {
        U256::from(2 * ETHER)
    } else if number >= BYZANTIUM {
        U256::from(3 * ETHER)
    } else {
        U256::from(5 * ETHER)
    }
}

/// Static era reward plus transaction fees plus the per-uncle inclusion
/// bonus.
fn block_reward(payload: &ConvertedPayload) -> U256 {
    let header = payload.header();
    let mut reward = base_block_reward(header.number);

    let mut previous_gas = 0u64;
    for (tx, receipt) in payload.transactions().iter().zip(&payload.receipts) {
        let gas_used = receipt.cumulative_gas_used().saturating_sub(previous_gas);
        previous_gas = receipt.cumulative_gas_used();
        let price = tx.gas_price().unwrap_or_else(|| tx.max_fee_per_gas());
        reward += U256::from(price) * U256::from(gas_used);
    }

    let inclusion = base_block_reward(header.number) / U256::from(32);
    reward + inclusion * U256::from(payload.uncles().len())
}

/// Reward of the uncle's miner: scaled down by how far behind the including
/// block it is.
fn uncle_reward(block_number: u64, uncle_number: u64) -> U256 {
    let base = base_block_reward(block_number);
    let depth = block_number.saturating_sub(uncle_number);
    if depth >= 8 {
        return U256::ZERO;
    }
    base * U256::from(8 - depth) / U256::from(8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{converted_payload, payload_with_state};
    use alloy_primitives::{Address, B256};
    use cid::Cid;
    use std::str::FromStr;

    #[test]
    fn encode_emits_one_node_per_object() {
        let payload = converted_payload(3, 3);
        let (nodes, manifest) = encode(&payload).unwrap();
        // header + 3 txs + 3 receipts
        assert_eq!(nodes.len(), 7);
        assert_eq!(manifest.transactions.len(), 3);
        assert_eq!(manifest.receipts.len(), 3);
        assert_eq!(manifest.header.block_number, 1_000_000);
    }

    #[test]
    fn cids_are_derivable_from_bytes() {
        let payload = converted_payload(2, 2);
        let (nodes, manifest) = encode(&payload).unwrap();
        for node in &nodes {
            let recomputed =
                IpldNode::from_digest(node.cid.codec(), MH_KECCAK_256, keccak256(&node.data).as_slice(), node.data.clone())
                    .unwrap();
            assert_eq!(recomputed.cid, node.cid);
        }
        // Manifest CIDs point at emitted nodes.
        let header_cid = Cid::from_str(&manifest.header.cid).unwrap();
        assert!(nodes.iter().any(|n| n.cid == header_cid));
    }

    #[test]
    fn encode_is_deterministic() {
        let payload = converted_payload(2, 2);
        let (first, _) = encode(&payload).unwrap();
        let (second, _) = encode(&payload).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn tampered_receipt_is_a_root_mismatch() {
        let mut payload = converted_payload(3, 3);
        // Swap one receipt for a different one: the recomputed receipt trie
        // no longer matches the header.
        payload.receipts[1] = crate::test_utils::receipt(
            999_999,
            Address::repeat_byte(0xEE),
            vec![B256::repeat_byte(0xEE)],
        );
        let err = encode(&payload).unwrap_err();
        assert_eq!(*err.current_context(), WatcherError::RootMismatch);
    }

    #[test]
    fn state_and_storage_nodes_are_encoded() {
        let payload = payload_with_state();
        let (nodes, manifest) = encode(&payload).unwrap();
        assert_eq!(manifest.state_nodes.len(), 2);
        assert_eq!(manifest.storage_nodes.len(), 1);
        assert!(nodes.iter().any(|n| n.cid.codec() == ETH_STATE_TRIE));
        assert!(nodes.iter().any(|n| n.cid.codec() == ETH_STORAGE_TRIE));
    }

    #[tokio::test]
    async fn every_manifest_cid_lands_in_the_store() {
        use chainwatch_common::blockstore::{BlockStore, MemoryBlockStore};

        let payload = payload_with_state();
        let (nodes, manifest) = encode(&payload).unwrap();
        let store = MemoryBlockStore::new();
        for node in &nodes {
            store.put(node).await.unwrap();
        }

        let mut cids = vec![manifest.header.cid.clone()];
        cids.extend(manifest.transactions.iter().map(|t| t.cid.clone()));
        cids.extend(manifest.receipts.iter().map(|r| r.cid.clone()));
        cids.extend(manifest.state_nodes.iter().map(|s| s.cid.clone()));
        cids.extend(manifest.storage_nodes.iter().map(|s| s.cid.clone()));
        for cid in cids {
            assert!(store.contains(&Cid::from_str(&cid).unwrap()));
        }
    }

    #[test]
    fn pre_merge_rewards_are_nonzero() {
        assert_eq!(base_block_reward(MERGE), U256::ZERO);
        assert!(base_block_reward(MERGE - 1) > U256::ZERO);
        assert!(uncle_reward(1_000_000, 999_999) > uncle_reward(1_000_000, 999_993));
    }
}
