use alloy_consensus::{
    transaction::SignerRecoverable, Block, ReceiptEnvelope, Transaction, TxEnvelope, TxReceipt,
};
use alloy_eips::eip2718::Decodable2718;
use alloy_primitives::{Address, B256};
use alloy_rlp::Decodable;
use error_stack::{Report, ResultExt};

use chainwatch_common::error::{Result, WatcherError};

use crate::models::{ConvertedPayload, RawStateDiff, ReceiptMeta, StateNode, StorageNode, TxMeta};

/// Deterministic parse of a raw statediff payload into canonical decoded
/// form. Pure: the same payload always converts to the same result.
pub fn convert(raw: RawStateDiff) -> Result<ConvertedPayload> {
    let block = Block::<TxEnvelope>::decode(&mut raw.block_rlp.as_ref())
        .change_context(WatcherError::MalformedPayload)
        .attach_printable_lazy(|| format!("undecodable block rlp at height {}", raw.block_number))?;

    if block.header.number != raw.block_number {
        return Err(Report::new(WatcherError::MalformedPayload).attach_printable(format!(
            "payload height {} does not match header number {}",
            raw.block_number, block.header.number
        )));
    }

    let receipts = raw
        .receipts_rlp
        .iter()
        .map(|bytes| ReceiptEnvelope::decode_2718(&mut bytes.as_ref()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .change_context(WatcherError::MalformedPayload)
        .attach_printable("undecodable receipt rlp")?;
    if receipts.len() != block.body.transactions.len() {
        return Err(Report::new(WatcherError::MalformedPayload).attach_printable(format!(
            "{} receipts for {} transactions",
            receipts.len(),
            block.body.transactions.len()
        )));
    }

    let tx_meta = derive_tx_meta(&block.body.transactions)?;
    let contracts: Vec<Option<Address>> = block
        .body
        .transactions
        .iter()
        .zip(&tx_meta)
        .map(|(tx, meta)| created_contract(meta, tx.nonce()))
        .collect();
    let receipt_meta = derive_receipt_meta(&receipts, &tx_meta, &contracts);
    let (state_nodes, storage_nodes) = flatten_state_nodes(&raw);

    Ok(ConvertedPayload {
        block,
        total_difficulty: raw.total_difficulty,
        tx_meta,
        receipts,
        receipt_meta,
        state_nodes,
        storage_nodes,
    })
}

/// Recovers the src address of every transaction and records its dst.
fn derive_tx_meta(transactions: &[TxEnvelope]) -> Result<Vec<TxMeta>> {
    transactions
        .iter()
        .enumerate()
        .map(|(index, tx)| {
            let src = tx
                .recover_signer()
                .change_context(WatcherError::MalformedPayload)
                .attach_printable_lazy(|| format!("unrecoverable signer for tx {index}"))?;
            Ok(TxMeta {
                tx_hash: *tx.tx_hash(),
                index: index as u64,
                src,
                dst: tx.to(),
            })
        })
        .collect()
}

/// Splits every receipt's log topics into the four indexed slots and pairs
/// the receipt with the contract its deploy created, if any.
pub(crate) fn derive_receipt_meta(
    receipts: &[ReceiptEnvelope],
    tx_meta: &[TxMeta],
    contracts: &[Option<Address>],
) -> Vec<ReceiptMeta> {
    receipts
        .iter()
        .zip(tx_meta)
        .zip(contracts)
        .map(|((receipt, meta), contract)| {
            let mut topics: [Vec<B256>; 4] = Default::default();
            for log in receipt.logs() {
                for (slot, topic) in log.data.topics().iter().take(4).enumerate() {
                    topics[slot].push(*topic);
                }
            }
            ReceiptMeta {
                tx_hash: meta.tx_hash,
                topics,
                contract: *contract,
            }
        })
        .collect()
}

/// The address a contract-creating transaction deployed to. `None` for
/// plain calls.
pub(crate) fn created_contract(meta: &TxMeta, nonce: u64) -> Option<Address> {
    meta.dst.is_none().then(|| meta.src.create(nonce))
}

pub(crate) fn flatten_state_nodes(raw: &RawStateDiff) -> (Vec<StateNode>, Vec<StorageNode>) {
    let mut state_nodes = Vec::with_capacity(raw.state_nodes.len());
    let mut storage_nodes = Vec::new();
    for node in &raw.state_nodes {
        state_nodes.push(StateNode {
            state_key: node.state_key,
            kind: node.node_type,
            path: node.path.to_vec(),
            value: node.value.to_vec(),
        });
        for storage in &node.storage {
            storage_nodes.push(StorageNode {
                state_key: node.state_key,
                storage_key: storage.storage_key,
                kind: storage.node_type,
                path: storage.path.to_vec(),
                value: storage.value.to_vec(),
            });
        }
    }
    (state_nodes, storage_nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeKind, RawStateNode, RawStorageNode};
    use crate::test_utils;
    use alloy_primitives::{Bytes, B256, U256};

    #[test]
    fn receipt_meta_splits_topics_into_slots() {
        let tx = test_utils::tx(0, Some(Address::repeat_byte(0xB0)));
        let meta = TxMeta {
            tx_hash: *tx.tx_hash(),
            index: 0,
            src: Address::repeat_byte(0xA0),
            dst: Some(Address::repeat_byte(0xB0)),
        };
        let topics = vec![B256::repeat_byte(0x01), B256::repeat_byte(0x02)];
        let receipt = test_utils::receipt(21_000, Address::repeat_byte(0xD0), topics);
        let derived = derive_receipt_meta(&[receipt], &[meta], &[None]);
        assert_eq!(derived[0].topics[0], vec![B256::repeat_byte(0x01)]);
        assert_eq!(derived[0].topics[1], vec![B256::repeat_byte(0x02)]);
        assert!(derived[0].topics[2].is_empty());
        assert!(derived[0].contract.is_none());
    }

    #[test]
    fn deploys_derive_their_contract_address() {
        let src = Address::repeat_byte(0xA1);
        let call = TxMeta {
            tx_hash: B256::ZERO,
            index: 0,
            src,
            dst: Some(Address::repeat_byte(0xB1)),
        };
        assert!(created_contract(&call, 0).is_none());

        let deploy = TxMeta {
            tx_hash: B256::ZERO,
            index: 1,
            src,
            dst: None,
        };
        assert_eq!(created_contract(&deploy, 7), Some(src.create(7)));
    }

    #[test]
    fn state_nodes_flatten_with_their_storage() {
        let raw = RawStateDiff {
            block_number: 1,
            block_rlp: Bytes::new(),
            receipts_rlp: vec![],
            total_difficulty: U256::from(1),
            state_nodes: vec![RawStateNode {
                path: Bytes::from(vec![0x06]),
                node_type: NodeKind::Leaf,
                state_key: B256::repeat_byte(0x0A),
                value: Bytes::from(vec![0x01]),
                storage: vec![RawStorageNode {
                    path: Bytes::from(vec![0x02]),
                    node_type: NodeKind::Leaf,
                    storage_key: B256::repeat_byte(0x0B),
                    value: Bytes::from(vec![0x03]),
                }],
            }],
        };
        let (state, storage) = flatten_state_nodes(&raw);
        assert_eq!(state.len(), 1);
        assert_eq!(storage.len(), 1);
        assert_eq!(storage[0].state_key, B256::repeat_byte(0x0A));
        assert_eq!(storage[0].storage_key, B256::repeat_byte(0x0B));
    }
}
