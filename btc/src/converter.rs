use bitcoin::{Address, Block, Network, Script, Transaction};
use error_stack::ResultExt;

use chainwatch_common::error::{Result, WatcherError};

use crate::models::{
    BtcTxMeta, ConvertedPayload, RawBlockPayload, ScriptClass, TxInputMeta, TxOutputMeta,
};

/// Deterministic parse of raw consensus bytes into canonical decoded form.
pub fn convert(raw: RawBlockPayload) -> Result<ConvertedPayload> {
    let block: Block = bitcoin::consensus::deserialize(&raw.block)
        .change_context(WatcherError::MalformedPayload)
        .attach_printable_lazy(|| format!("undecodable block at height {}", raw.height))?;
    let tx_meta = derive_tx_meta(&block);
    Ok(ConvertedPayload {
        height: raw.height,
        block,
        tx_meta,
    })
}

fn derive_tx_meta(block: &Block) -> Vec<BtcTxMeta> {
    block
        .txdata
        .iter()
        .enumerate()
        .map(|(index, tx)| tx_meta(index as u64, tx))
        .collect()
}

fn tx_meta(index: u64, tx: &Transaction) -> BtcTxMeta {
    let segwit = tx.input.iter().any(|input| !input.witness.is_empty());
    let inputs = tx
        .input
        .iter()
        .enumerate()
        .map(|(i, input)| TxInputMeta {
            index: i as u64,
            outpoint_tx_hash: input.previous_output.txid.to_string(),
            outpoint_index: input.previous_output.vout,
            sig_script: input.script_sig.to_bytes(),
        })
        .collect();
    let outputs = tx
        .output
        .iter()
        .enumerate()
        .map(|(i, output)| TxOutputMeta {
            index: i as u64,
            value: output.value.to_sat() as i64,
            pk_script: output.script_pubkey.to_bytes(),
            script_class: script_class(&output.script_pubkey),
            addresses: script_addresses(&output.script_pubkey),
        })
        .collect();
    BtcTxMeta {
        tx_hash: tx.compute_txid().to_string(),
        index,
        segwit,
        witness_hash: tx.compute_wtxid().to_string(),
        inputs,
        outputs,
    }
}

fn script_class(script: &Script) -> ScriptClass {
    if script.is_p2pk() {
        ScriptClass::Pubkey
    } else if script.is_p2pkh() {
        ScriptClass::PubkeyHash
    } else if script.is_p2sh() {
        ScriptClass::ScriptHash
    } else if script.is_p2wpkh() {
        ScriptClass::WitnessPubkeyHash
    } else if script.is_p2wsh() {
        ScriptClass::WitnessScriptHash
    } else if script.is_p2tr() {
        ScriptClass::Taproot
    } else if script.is_multisig() {
        ScriptClass::Multisig
    } else if script.is_op_return() {
        ScriptClass::NullData
    } else {
        ScriptClass::NonStandard
    }
}

fn script_addresses(script: &Script) -> Vec<String> {
    Address::from_script(script, Network::Bitcoin)
        .map(|address| vec![address.to_string()])
        .unwrap_or_default()
}
