//! Script inspection: payment-address hashes and stealth output fields.
//!
//! The history and stealth tables key rows by a 20-byte address hash
//! extracted from output (and, for spends, input) scripts. Extraction is
//! best-effort pattern matching; scripts that fit no known template
//! simply produce no history row.

use bitcoin::hashes::{hash160, Hash};
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::script::Instruction;
use bitcoin::Script;

/// 20-byte hash identifying the payment address of an output script.
///
/// Covers p2pkh, p2sh and p2wpkh (the embedded hash) plus bare p2pk
/// (hash160 of the key itself).
pub fn payment_address_hash(script: &Script) -> Option<[u8; 20]> {
    let bytes = script.as_bytes();

    if script.is_p2pkh() {
        return bytes[3..23].try_into().ok();
    }
    if script.is_p2sh() {
        return bytes[2..22].try_into().ok();
    }
    if script.is_p2wpkh() {
        return bytes[2..22].try_into().ok();
    }
    if script.is_p2pk() {
        // [push][key][OP_CHECKSIG]
        let key = &bytes[1..bytes.len() - 1];
        return Some(hash160::Hash::hash(key).to_byte_array());
    }

    None
}

/// 20-byte address hash revealed by an input script: the hash160 of the
/// final push when the script is push-only and ends in a key-sized push
/// (the p2pkh unlock shape `<sig> <pubkey>`).
pub fn input_address_hash(script: &Script) -> Option<[u8; 20]> {
    let mut last: Option<&[u8]> = None;
    for instruction in script.instructions() {
        match instruction.ok()? {
            Instruction::PushBytes(data) => last = Some(data.as_bytes()),
            Instruction::Op(_) => return None,
        }
    }

    let key = last?;
    if key.len() != 33 && key.len() != 65 {
        return None;
    }
    Some(hash160::Hash::hash(key).to_byte_array())
}

/// The OP_RETURN payload of a stealth ephemeral-key output:
/// `[ephemeral_key:32][prefix:4]` and anything after is ignored.
fn stealth_payload(script: &Script) -> Option<&[u8]> {
    let mut instructions = script.instructions();
    match instructions.next()?.ok()? {
        Instruction::Op(op) if op == OP_RETURN => {}
        _ => return None,
    }
    match instructions.next()?.ok()? {
        Instruction::PushBytes(data) if data.len() >= 36 => Some(data.as_bytes()),
        _ => None,
    }
}

/// The unsigned 32-byte ephemeral key of a stealth output script.
pub fn extract_ephemeral_key(script: &Script) -> Option<[u8; 32]> {
    stealth_payload(script)?[..32].try_into().ok()
}

/// The 32-bit stealth prefix of a stealth output script.
pub fn extract_stealth_prefix(script: &Script) -> Option<u32> {
    let payload = stealth_payload(script)?;
    Some(u32::from_le_bytes(payload[32..36].try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::script::Builder;
    use bitcoin::ScriptBuf;

    fn p2pkh(hash: [u8; 20]) -> ScriptBuf {
        ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::from_byte_array(hash))
    }

    #[test]
    fn p2pkh_hash_is_extracted_verbatim() {
        let hash = [0x11u8; 20];
        assert_eq!(payment_address_hash(&p2pkh(hash)), Some(hash));
    }

    #[test]
    fn op_return_yields_no_address() {
        let script = Builder::new().push_opcode(OP_RETURN).into_script();
        assert_eq!(payment_address_hash(&script), None);
    }

    #[test]
    fn p2pkh_unlock_script_reveals_the_key() {
        let signature = [0x30u8; 71];
        let pubkey = [0x02u8; 33];
        let script = Builder::new()
            .push_slice(signature)
            .push_slice(pubkey)
            .into_script();

        let expected = hash160::Hash::hash(&pubkey).to_byte_array();
        assert_eq!(input_address_hash(&script), Some(expected));
    }

    #[test]
    fn non_push_input_scripts_are_ignored() {
        let script = Builder::new()
            .push_slice([0x02u8; 33])
            .push_opcode(bitcoin::opcodes::all::OP_DUP)
            .into_script();
        assert_eq!(input_address_hash(&script), None);
    }

    #[test]
    fn stealth_fields_round_trip_through_op_return() {
        let mut payload = [0u8; 36];
        payload[..32].copy_from_slice(&[0xeeu8; 32]);
        payload[32..].copy_from_slice(&0xdead_beefu32.to_le_bytes());

        let script = Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(payload)
            .into_script();

        assert_eq!(extract_ephemeral_key(&script), Some([0xee; 32]));
        assert_eq!(extract_stealth_prefix(&script), Some(0xdead_beef));
    }

    #[test]
    fn short_op_return_payloads_are_not_stealth() {
        let script = Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice([0u8; 35])
            .into_script();
        assert_eq!(extract_ephemeral_key(&script), None);
        assert_eq!(extract_stealth_prefix(&script), None);
    }
}
