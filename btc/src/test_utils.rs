//! Block fixtures with a consistent merkle root.

use bitcoin::{
    absolute::LockTime, block, hashes::Hash, transaction::Version, Amount, Block, BlockHash,
    CompactTarget, OutPoint, PubkeyHash, ScriptBuf, Sequence, Transaction, TxIn, TxMerkleNode,
    TxOut, Witness,
};

pub fn p2pkh_script() -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([0xAB; 20]))
}

fn coinbase() -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(vec![0x51]),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(625_000_000),
            script_pubkey: p2pkh_script(),
        }],
    }
}

fn spend() -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: coinbase().compute_txid(),
                vout: 0,
            },
            script_sig: ScriptBuf::from_bytes(vec![0x52]),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(100_000),
            script_pubkey: p2pkh_script(),
        }],
    }
}

/// A block with a coinbase and one spend, its header committed to the
/// recomputed merkle root.
pub fn two_tx_block() -> Block {
    let mut block = Block {
        header: block::Header {
            version: block::Version::TWO,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_600_000_000,
            bits: CompactTarget::from_consensus(0x1d00_ffff),
            nonce: 0,
        },
        txdata: vec![coinbase(), spend()],
    };
    block.header.merkle_root = block.compute_merkle_root().expect("fixture has transactions");
    block
}
