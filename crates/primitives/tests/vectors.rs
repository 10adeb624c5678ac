use spvkit_network::hash_to_display_hex;
use spvkit_primitives::{base58check_encode, hash160, sha256, sha256d, BlockHeader, Transaction};

fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    let mut iter = hex.as_bytes().iter().copied();
    while let (Some(high), Some(low)) = (iter.next(), iter.next()) {
        let high = (high as char).to_digit(16)? as u8;
        let low = (low as char).to_digit(16)? as u8;
        bytes.push(high << 4 | low);
    }
    Some(bytes)
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

const GENESIS_HEADER_HEX: &str = "010000000000000000000000000000000000000000000000000000000000000000000000\
3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";

const GENESIS_PUBKEY_HEX: &str = "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb6\
49f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f";

#[test]
fn sha256_matches_published_vectors() {
    assert_eq!(
        bytes_to_hex(&sha256(b"")),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
    assert_eq!(
        bytes_to_hex(&sha256(b"abc")),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(
        bytes_to_hex(&sha256d(b"")),
        "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
    );
}

#[test]
fn genesis_header_decodes_and_hashes_to_known_id() {
    let bytes = hex_to_bytes(GENESIS_HEADER_HEX).expect("genesis header hex");
    let header = BlockHeader::consensus_decode(&bytes).expect("decode genesis header");

    assert_eq!(header.version, 1);
    assert_eq!(header.prev_hash, [0u8; 32]);
    assert_eq!(
        hash_to_display_hex(&header.merkle_root),
        "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
    );
    assert_eq!(header.timestamp, 1_231_006_505);
    assert_eq!(header.bits, 0x1d00_ffff);
    assert_eq!(header.nonce, 2_083_236_893);

    assert_eq!(
        hash_to_display_hex(&header.hash()),
        "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
    );
    assert_eq!(header.consensus_encode(), bytes);
}

#[test]
fn genesis_pubkey_yields_the_first_address() {
    let pubkey = hex_to_bytes(GENESIS_PUBKEY_HEX).expect("genesis pubkey hex");
    let address = base58check_encode(0x00, &hash160(&pubkey));
    assert_eq!(address, "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa");
}

#[test]
fn all_zero_base58check_payload_matches_known_vector() {
    assert_eq!(
        base58check_encode(0x00, &[0u8; 20]),
        "1111111111111111111114oLvT2"
    );
}

#[test]
fn raw_transaction_roundtrips_byte_exact() {
    let hex = [
        "01000000",                                                         // version
        "01",                                                               // input count
        "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", // prev txid
        "00000000",                                                         // prev index
        "01", "51",                                                         // script sig
        "ffffffff",                                                         // sequence
        "01",                                                               // output count
        "e803000000000000",                                                 // 1000 satoshis
        "00",                                                               // empty script
        "00000000",                                                         // lock time
    ]
    .concat();
    let bytes = hex_to_bytes(&hex).expect("transaction hex");
    let tx = Transaction::consensus_decode(&bytes).expect("decode transaction");

    assert_eq!(tx.version, 1);
    assert_eq!(tx.inputs.len(), 1);
    assert_eq!(tx.inputs[0].prev_output.hash, [0xaa; 32]);
    assert_eq!(tx.inputs[0].prev_output.index, 0);
    assert_eq!(tx.inputs[0].script_sig, vec![0x51]);
    assert_eq!(tx.inputs[0].sequence, u32::MAX);
    assert_eq!(tx.outputs.len(), 1);
    assert_eq!(tx.outputs[0].value, 1_000);
    assert!(tx.outputs[0].script_pubkey.is_empty());
    assert_eq!(tx.lock_time, 0);

    assert_eq!(tx.consensus_encode(), bytes);
}
