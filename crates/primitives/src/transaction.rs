use spvkit_network::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

// Smallest serializations accepted when sanity-checking varint counts.
const MIN_TXIN_SIZE: usize = 41;
const MIN_TXOUT_SIZE: usize = 9;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prev_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    /// Value in satoshis.
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_to(&mut encoder);
        encoder.into_inner()
    }

    pub fn encode_to(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.prev_output.encode_to(encoder);
            encoder.write_var_bytes(&input.script_sig);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        decoder.expect_empty()?;
        Ok(tx)
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;

        let input_count = decoder.read_count()?;
        if input_count > decoder.remaining() / MIN_TXIN_SIZE + 1 {
            return Err(DecodeError::UnexpectedEnd);
        }
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            let prev_output = OutPoint::decode_from(decoder)?;
            let script_sig = decoder.read_var_bytes()?;
            let sequence = decoder.read_u32_le()?;
            inputs.push(TxIn {
                prev_output,
                script_sig,
                sequence,
            });
        }

        let output_count = decoder.read_count()?;
        if output_count > decoder.remaining() / MIN_TXOUT_SIZE + 1 {
            return Err(DecodeError::UnexpectedEnd);
        }
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let value = decoder.read_i64_le()?;
            let script_pubkey = decoder.read_var_bytes()?;
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }

        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    /// Double SHA-256 of the canonical serialization, natural byte order.
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn total_output_value(&self) -> i64 {
        self.outputs.iter().map(|output| output.value).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prev_output: OutPoint {
                    hash: [0xab; 32],
                    index: 1,
                },
                script_sig: vec![0x51],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![
                TxOut {
                    value: 5_000,
                    script_pubkey: vec![0x76, 0xa9, 0x14],
                },
                TxOut {
                    value: 1_200,
                    script_pubkey: vec![],
                },
            ],
            lock_time: 0,
        }
    }

    #[test]
    fn transaction_roundtrip() {
        let tx = sample_tx();
        let bytes = tx.consensus_encode();
        assert_eq!(Transaction::consensus_decode(&bytes).expect("decode"), tx);
    }

    #[test]
    fn txid_is_stable() {
        let tx = sample_tx();
        assert_eq!(tx.txid(), tx.txid());
        let mut altered = tx.clone();
        altered.lock_time = 1;
        assert_ne!(tx.txid(), altered.txid());
    }

    #[test]
    fn absurd_input_count_is_rejected() {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(1);
        encoder.write_varint(u32::MAX as u64);
        let bytes = encoder.into_inner();
        assert!(Transaction::consensus_decode(&bytes).is_err());
    }
}
