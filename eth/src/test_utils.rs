//! Fixture payloads with internally consistent trie roots.

use alloy_consensus::{
    proofs, Block, BlockBody, Header, Receipt, ReceiptEnvelope, ReceiptWithBloom, Signed,
    TxEnvelope, TxLegacy,
};
use alloy_primitives::{
    keccak256, Address, Bloom, Bytes, Log, LogData, Signature, TxKind, B256, U256,
};

use crate::{
    converter::derive_receipt_meta,
    models::{ConvertedPayload, NodeKind, StateNode, StorageNode, TxMeta},
};

/// Topic the first fixture receipt carries in slot 0.
pub const T0: B256 = B256::repeat_byte(0x11);
/// Contract the second fixture transaction deploys.
pub const C1: Address = Address::repeat_byte(0xC1);
/// Account whose state node the fixtures carry.
pub const STATE_ADDRESS: Address = Address::repeat_byte(0xAD);

pub fn tx(nonce: u64, to: Option<Address>) -> TxEnvelope {
    let tx = TxLegacy {
        chain_id: Some(1),
        nonce,
        gas_price: 20,
        gas_limit: 21_000,
        to: to.map_or(TxKind::Create, TxKind::Call),
        value: U256::from(1),
        input: Bytes::new(),
    };
    let signature = Signature::new(U256::from(1), U256::from(2), false);
    let hash = keccak256(nonce.to_be_bytes());
    TxEnvelope::Legacy(Signed::new_unchecked(tx, signature, hash))
}

pub fn receipt(cumulative_gas_used: u64, log_address: Address, topics: Vec<B256>) -> ReceiptEnvelope {
    let receipt = Receipt {
        status: true.into(),
        cumulative_gas_used,
        logs: vec![Log {
            address: log_address,
            data: LogData::new_unchecked(topics, Bytes::new()),
        }],
    };
    ReceiptEnvelope::Legacy(ReceiptWithBloom {
        receipt,
        logs_bloom: Bloom::default(),
    })
}

fn assemble(
    transactions: Vec<TxEnvelope>,
    tx_meta: Vec<TxMeta>,
    receipts: Vec<ReceiptEnvelope>,
    contracts: Vec<Option<Address>>,
    ommers: Vec<Header>,
) -> ConvertedPayload {
    let header = Header {
        number: 1_000_000,
        transactions_root: proofs::calculate_transaction_root(&transactions),
        receipts_root: proofs::calculate_receipt_root(&receipts),
        ommers_hash: proofs::calculate_ommers_root(&ommers),
        ..Default::default()
    };
    let receipt_meta = derive_receipt_meta(&receipts, &tx_meta, &contracts);
    ConvertedPayload {
        block: Block {
            header,
            body: BlockBody {
                transactions,
                ommers,
                withdrawals: None,
            },
        },
        total_difficulty: U256::from(1_000_000_000u64),
        tx_meta,
        receipts,
        receipt_meta,
        state_nodes: Vec::new(),
        storage_nodes: Vec::new(),
    }
}

/// A block with `tx_count` transactions and `receipt_count` receipts.
///
/// The second transaction is a contract deploy whose receipt carries
/// contract [`C1`]; the first receipt carries topic [`T0`] in slot 0.
pub fn converted_payload(tx_count: usize, receipt_count: usize) -> ConvertedPayload {
    let transactions: Vec<TxEnvelope> = (0..tx_count)
        .map(|i| {
            let to = (i != 1).then(|| Address::repeat_byte(0xB0 + i as u8));
            tx(i as u64, to)
        })
        .collect();
    let tx_meta: Vec<TxMeta> = transactions
        .iter()
        .enumerate()
        .map(|(i, tx)| TxMeta {
            tx_hash: *tx.tx_hash(),
            index: i as u64,
            src: Address::repeat_byte(0xA0 + i as u8),
            dst: (i != 1).then(|| Address::repeat_byte(0xB0 + i as u8)),
        })
        .collect();
    let receipts: Vec<ReceiptEnvelope> = (0..receipt_count)
        .map(|i| {
            let topic = if i == 0 { T0 } else { B256::repeat_byte(0x20 + i as u8) };
            receipt(
                21_000 * (i as u64 + 1),
                Address::repeat_byte(0xD0 + i as u8),
                vec![topic],
            )
        })
        .collect();
    let contracts: Vec<Option<Address>> = (0..receipt_count)
        .map(|i| (i == 1).then_some(C1))
        .collect();
    assemble(transactions, tx_meta, receipts, contracts, Vec::new())
}

pub fn payload_with_uncle() -> ConvertedPayload {
    let mut payload = converted_payload(1, 1);
    let uncle = Header {
        number: 999_999,
        ..Default::default()
    };
    payload.block.header.ommers_hash = proofs::calculate_ommers_root(std::slice::from_ref(&uncle));
    payload.block.body.ommers = vec![uncle];
    payload
}

/// Adds two state nodes (one leaf keyed on [`STATE_ADDRESS`], one branch)
/// and one storage leaf under the state leaf.
pub fn payload_with_state() -> ConvertedPayload {
    let mut payload = converted_payload(1, 1);
    let leaf_key = keccak256(STATE_ADDRESS.as_slice());
    payload.state_nodes = vec![
        StateNode {
            state_key: leaf_key,
            kind: NodeKind::Leaf,
            path: vec![0x06],
            value: vec![0x01, 0x02],
        },
        StateNode {
            state_key: B256::repeat_byte(0x42),
            kind: NodeKind::Branch,
            path: vec![],
            value: vec![0x03, 0x04],
        },
    ];
    payload.storage_nodes = vec![StorageNode {
        state_key: leaf_key,
        storage_key: B256::repeat_byte(0x77),
        kind: NodeKind::Leaf,
        path: vec![0x01],
        value: vec![0x05, 0x06],
    }];
    payload
}
