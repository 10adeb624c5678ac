//! Base58Check and recovery of payment addresses from the script shapes the
//! index understands. Recovery is best-effort and never used for validation.

use std::fmt;

use spvkit_network::Network;

use crate::hash::{hash160, sha256d};

const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressError {
    InvalidCharacter,
    InvalidLength,
    BadChecksum,
    UnknownVersion(u8),
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::InvalidCharacter => write!(f, "invalid base58 character"),
            AddressError::InvalidLength => write!(f, "base58check payload too short"),
            AddressError::BadChecksum => write!(f, "base58check checksum mismatch"),
            AddressError::UnknownVersion(version) => {
                write!(f, "unknown address version byte {version:#04x}")
            }
        }
    }
}

impl std::error::Error for AddressError {}

pub fn base58check_encode(version: u8, payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(payload.len() + 5);
    data.push(version);
    data.extend_from_slice(payload);
    let checksum = sha256d(&data);
    data.extend_from_slice(&checksum[..4]);
    base58_encode(&data)
}

pub fn base58check_decode(text: &str) -> Result<(u8, Vec<u8>), AddressError> {
    let bytes = base58_decode(text)?;
    if bytes.len() < 5 {
        return Err(AddressError::InvalidLength);
    }
    let (body, checksum) = bytes.split_at(bytes.len() - 4);
    let expected = sha256d(body);
    if checksum != &expected[..4] {
        return Err(AddressError::BadChecksum);
    }
    Ok((body[0], body[1..].to_vec()))
}

/// Decodes an address and checks its version against the network, returning
/// the HASH160 payload suitable as a bloom filter element.
pub fn address_hash160(text: &str, network: &Network) -> Result<[u8; 20], AddressError> {
    let (version, payload) = base58check_decode(text)?;
    if version != network.pubkey_hash_version && version != network.script_hash_version {
        return Err(AddressError::UnknownVersion(version));
    }
    if payload.len() != 20 {
        return Err(AddressError::InvalidLength);
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&payload);
    Ok(out)
}

fn base58_encode(data: &[u8]) -> String {
    let zeros = data.iter().take_while(|byte| **byte == 0).count();
    // Base-58 digits, least significant first.
    let mut digits: Vec<u8> = Vec::new();
    for &byte in &data[zeros..] {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            carry += (*digit as u32) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }
    let mut out = String::with_capacity(zeros + digits.len());
    for _ in 0..zeros {
        out.push('1');
    }
    for &digit in digits.iter().rev() {
        out.push(ALPHABET[digit as usize] as char);
    }
    out
}

fn base58_decode(text: &str) -> Result<Vec<u8>, AddressError> {
    let ones = text.bytes().take_while(|byte| *byte == b'1').count();
    // Base-256 digits, least significant first.
    let mut bytes: Vec<u8> = Vec::new();
    for ch in text.bytes() {
        let value = ALPHABET
            .iter()
            .position(|candidate| *candidate == ch)
            .ok_or(AddressError::InvalidCharacter)? as u32;
        let mut carry = value;
        for byte in bytes.iter_mut() {
            carry += *byte as u32 * 58;
            *byte = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }
    let mut out = vec![0u8; ones];
    out.extend(bytes.iter().rev());
    Ok(out)
}

mod op {
    pub const PUSHDATA1: u8 = 0x4c;
    pub const PUSHDATA2: u8 = 0x4d;
    pub const PUSHDATA4: u8 = 0x4e;
    pub const ENDIF: u8 = 0x68;
    pub const DUP: u8 = 0x76;
    pub const EQUAL: u8 = 0x87;
    pub const EQUALVERIFY: u8 = 0x88;
    pub const HASH160: u8 = 0xa9;
    pub const CHECKSIG: u8 = 0xac;
    pub const CHECKSIGVERIFY: u8 = 0xad;
    pub const CHECKMULTISIG: u8 = 0xae;
    pub const CHECKMULTISIGVERIFY: u8 = 0xaf;
}

// Opcodes a script-hash redeem script is expected to end with.
const REDEEM_TAIL_OPS: [u8; 5] = [
    op::EQUAL,
    op::CHECKSIG,
    op::CHECKSIGVERIFY,
    op::CHECKMULTISIG,
    op::CHECKMULTISIGVERIFY,
];

/// Recovers the payee address from a P2PKH locking script. Any other script
/// shape yields `None` and the caller records an empty address.
pub fn payee_address(script_pubkey: &[u8], network: &Network) -> Option<String> {
    if script_pubkey.len() == 25
        && script_pubkey[0] == op::DUP
        && script_pubkey[1] == op::HASH160
        && script_pubkey[2] == 20
        && script_pubkey[23] == op::EQUALVERIFY
        && script_pubkey[24] == op::CHECKSIG
    {
        return Some(base58check_encode(
            network.pubkey_hash_version,
            &script_pubkey[3..23],
        ));
    }
    None
}

/// Recovers the payer address from a signature script, trying the
/// script-hash redeem shape, then P2PKH, then P2WPKH nested in P2SH.
pub fn payer_address(script_sig: &[u8], network: &Network) -> Option<String> {
    if let Some(redeem) = p2sh_redeem_script(script_sig) {
        return Some(base58check_encode(
            network.script_hash_version,
            &hash160(redeem),
        ));
    }
    if let Some(pubkey) = p2pkh_pubkey(script_sig) {
        return Some(base58check_encode(
            network.pubkey_hash_version,
            &hash160(pubkey),
        ));
    }
    if let Some(program) = p2wpkh_sh_program(script_sig) {
        return Some(base58check_encode(
            network.script_hash_version,
            &hash160(program),
        ));
    }
    None
}

enum ScriptOp<'a> {
    Push(&'a [u8]),
    Code(u8),
}

fn parse_ops(script: &[u8]) -> Option<Vec<ScriptOp<'_>>> {
    let mut ops = Vec::new();
    let mut cursor = 0;
    while cursor < script.len() {
        let byte = script[cursor];
        cursor += 1;
        let push_len = match byte {
            1..=0x4b => byte as usize,
            op::PUSHDATA1 => {
                let len = *script.get(cursor)? as usize;
                cursor += 1;
                len
            }
            op::PUSHDATA2 => {
                let bytes = script.get(cursor..cursor + 2)?;
                cursor += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            op::PUSHDATA4 => {
                let bytes = script.get(cursor..cursor + 4)?;
                cursor += 4;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            code => {
                ops.push(ScriptOp::Code(code));
                continue;
            }
        };
        let data = script.get(cursor..cursor + push_len)?;
        cursor += push_len;
        ops.push(ScriptOp::Push(data));
    }
    Some(ops)
}

/// The last push of the signature script, when it parses as a redeem script
/// whose final opcode (or the opcode before a terminal OP_ENDIF) belongs to
/// the pay-from-scripthash set.
fn p2sh_redeem_script(script_sig: &[u8]) -> Option<&[u8]> {
    let ops = parse_ops(script_sig)?;
    let redeem = match ops.last()? {
        ScriptOp::Push(data) if !data.is_empty() => *data,
        _ => return None,
    };
    let redeem_ops = parse_ops(redeem)?;
    let mut tail = redeem_ops.iter().rev();
    let last = tail.next()?;
    let decisive = match last {
        ScriptOp::Code(code) if *code == op::ENDIF => tail.next()?,
        other => other,
    };
    match decisive {
        ScriptOp::Code(code) if REDEEM_TAIL_OPS.contains(code) => Some(redeem),
        _ => None,
    }
}

/// `<DER signature push> <pubkey push>` with nothing after the pubkey.
fn p2pkh_pubkey(script_sig: &[u8]) -> Option<&[u8]> {
    if script_sig.len() < 106 {
        return None;
    }
    let sig_len = script_sig[0] as usize;
    if !(71..=74).contains(&sig_len) {
        return None;
    }
    let pubkey_len = *script_sig.get(1 + sig_len)? as usize;
    if pubkey_len != 33 && pubkey_len != 65 {
        return None;
    }
    let pubkey_start = 1 + sig_len + 1;
    if pubkey_start + pubkey_len != script_sig.len() {
        return None;
    }
    Some(&script_sig[pubkey_start..])
}

/// A 22-byte witness program pushed as the whole signature script.
fn p2wpkh_sh_program(script_sig: &[u8]) -> Option<&[u8]> {
    if script_sig.len() != 23 || script_sig[0] != 0x16 || script_sig[2] != 0x14 {
        return None;
    }
    let witness_version = script_sig[1];
    if witness_version != 0 && !(0x51..=0x60).contains(&witness_version) {
        return None;
    }
    Some(&script_sig[1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> Network {
        Network::bitcoin_mainnet()
    }

    #[test]
    fn base58check_roundtrip() {
        let payload = [0x42u8; 20];
        let encoded = base58check_encode(0x00, &payload);
        let (version, decoded) = base58check_decode(&encoded).expect("decode");
        assert_eq!(version, 0x00);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn single_byte_mutation_breaks_checksum() {
        let encoded = base58check_encode(0x00, &[0x42u8; 20]);
        let mut chars: Vec<char> = encoded.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == '2' { '3' } else { '2' };
        let mutated: String = chars.into_iter().collect();
        assert_eq!(
            base58check_decode(&mutated),
            Err(AddressError::BadChecksum)
        );
    }

    #[test]
    fn payee_address_from_p2pkh_script() {
        let network = network();
        let hash = [0x13u8; 20];
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&hash);
        script.extend_from_slice(&[0x88, 0xac]);
        let address = payee_address(&script, &network).expect("address");
        assert_eq!(address, base58check_encode(0x00, &hash));
    }

    #[test]
    fn payee_address_rejects_other_scripts() {
        let network = network();
        assert!(payee_address(&[0x6a, 0x04, 1, 2, 3, 4], &network).is_none());
        assert!(payee_address(&[], &network).is_none());
    }

    #[test]
    fn payer_address_from_p2pkh_input() {
        let network = network();
        let mut script = vec![71u8];
        script.extend_from_slice(&[0x30; 71]);
        let pubkey = [0x02u8; 33];
        script.push(33);
        script.extend_from_slice(&pubkey);
        let address = payer_address(&script, &network).expect("address");
        assert_eq!(address, base58check_encode(0x00, &hash160(&pubkey)));
    }

    #[test]
    fn payer_address_from_p2sh_redeem() {
        let network = network();
        // 1-of-1 style redeem: <pubkey push> OP_CHECKSIG
        let mut redeem = vec![33u8];
        redeem.extend_from_slice(&[0x03; 33]);
        redeem.push(0xac);
        let mut script = vec![0x00];
        script.push(redeem.len() as u8);
        script.extend_from_slice(&redeem);
        let address = payer_address(&script, &network).expect("address");
        assert_eq!(
            address,
            base58check_encode(0x05, &hash160(&redeem))
        );
    }

    #[test]
    fn payer_address_from_nested_witness_program() {
        let network = network();
        let mut script = vec![0x16, 0x00, 0x14];
        script.extend_from_slice(&[0x77; 20]);
        let address = payer_address(&script, &network).expect("address");
        assert_eq!(
            address,
            base58check_encode(0x05, &hash160(&script[1..]))
        );
    }

    #[test]
    fn unrecognized_input_shapes_yield_none() {
        let network = network();
        assert!(payer_address(&[], &network).is_none());
        assert!(payer_address(&[0x51], &network).is_none());
        // Truncated push cannot parse as a script.
        assert!(payer_address(&[0x4c], &network).is_none());
    }

    #[test]
    fn address_hash160_checks_version() {
        let network = network();
        let text = base58check_encode(0x6f, &[0x01; 20]);
        assert_eq!(
            address_hash160(&text, &network),
            Err(AddressError::UnknownVersion(0x6f))
        );
        let text = base58check_encode(0x00, &[0x01; 20]);
        assert_eq!(address_hash160(&text, &network), Ok([0x01; 20]));
    }
}
