//! Core ledger types: hashes, addresses, transactions and blocks

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hash type: 256-bit hash
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Amount in base units (1 coin = `COIN` base units)
pub type Amount = u64;

/// Block height
pub type Height = u64;

/// Seconds since the Unix epoch
pub type Timestamp = u64;

/// Accumulated proof of work
pub type ChainWork = u128;

/// Transaction id: sha256d over the unsigned transaction encoding
pub type Txid = Hash;

/// All-zero hash, used as the genesis predecessor
pub const ZERO_HASH: Hash = [0u8; 32];

/// Address: hex(ripemd160(sha256(compressed public key)))
///
/// Always 40 lowercase hex characters once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub const HEX_LEN: usize = 40;

    /// Build an address from the raw 20-byte key hash
    pub fn from_key_hash(hash: [u8; 20]) -> Self {
        Address(hex::encode(hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.len() != Self::HEX_LEN {
            return Err(format!("address must be {} hex chars, got {}", Self::HEX_LEN, s.len()));
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err("address contains non-hex characters".to_string());
        }
        Ok(Address(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for Address {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// OutPoint: reference to output `index` of transaction `txid`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    #[serde(with = "hex_hash")]
    pub txid: Txid,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Txid, index: u32) -> Self {
        OutPoint { txid, index }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.txid), self.index)
    }
}

/// Transaction input: spends `prevout`, authorised by `signature` under `public_key`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prevout: OutPoint,
    #[serde(with = "hex_bytes")]
    pub signature: ByteString,
    #[serde(with = "hex_bytes")]
    pub public_key: ByteString,
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: Address,
    pub amount: Amount,
}

/// Transaction
///
/// The coinbase is the only transaction with no inputs; its `nonce` carries
/// the block height so that coinbase ids never collide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub fee: Amount,
    pub nonce: u64,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub replace_by_fee: bool,
}

impl Transaction {
    /// Content hash; every input signs this value
    pub fn txid(&self) -> Txid {
        crate::transaction::calculate_txid(self)
    }

    /// Serialized size in bytes, signatures included
    pub fn size(&self) -> usize {
        crate::transaction::encode(self).len()
    }

    pub fn is_coinbase(&self) -> bool {
        crate::transaction::is_coinbase(self)
    }

    /// Sum of output amounts, `None` on overflow
    pub fn output_total(&self) -> Option<Amount> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.amount))
    }
}

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: Height,
    #[serde(with = "hex_hash")]
    pub previous_hash: Hash,
    pub timestamp: Timestamp,
    pub nonce: u64,
    /// Compact difficulty target
    pub bits: u32,
    #[serde(with = "hex_hash")]
    pub merkle_root: Hash,
}

/// Block: header plus ordered transactions, coinbase first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        crate::block::calculate_block_hash(&self.header)
    }

    pub fn height(&self) -> Height {
        self.header.height
    }

    /// Serialized size: header bytes plus every transaction's bytes
    pub fn size(&self) -> usize {
        crate::block::block_size(self)
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }
}

/// Unspent output as stored in the UTXO set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub address: Address,
    pub amount: Amount,
    pub height: Height,
    pub coinbase: bool,
}

/// Serde adapter: 32-byte hash as hex string
pub mod hex_hash {
    use super::Hash;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Hash, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Hash, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("hash must be 32 bytes"))
    }
}

/// Serde adapter: byte vector as hex string
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Parse a hex-encoded 32-byte hash
pub fn parse_hash(s: &str) -> Option<Hash> {
    hex::decode(s).ok()?.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse_normalises_case() {
        let addr: Address = "ABCDEF0123456789ABCDEF0123456789ABCDEF01".parse().unwrap();
        assert_eq!(addr.as_str(), "abcdef0123456789abcdef0123456789abcdef01");
    }

    #[test]
    fn test_address_parse_rejects_bad_input() {
        assert!("abc".parse::<Address>().is_err());
        assert!("zz".repeat(20).parse::<Address>().is_err());
    }

    #[test]
    fn test_address_serde_rejects_invalid() {
        let result: std::result::Result<Address, _> = serde_json::from_str("\"not-an-address\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_outpoint_display() {
        let op = OutPoint::new([0xab; 32], 3);
        assert!(op.to_string().ends_with(":3"));
        assert!(op.to_string().starts_with("abab"));
    }

    #[test]
    fn test_output_total_overflow() {
        let addr = Address::from_key_hash([1; 20]);
        let tx = Transaction {
            inputs: vec![],
            outputs: vec![
                TxOutput { address: addr.clone(), amount: u64::MAX },
                TxOutput { address: addr, amount: 1 },
            ],
            fee: 0,
            nonce: 0,
            timestamp: 0,
            replace_by_fee: false,
        };
        assert_eq!(tx.output_total(), None);
    }

    #[test]
    fn test_parse_hash() {
        let h = [7u8; 32];
        assert_eq!(parse_hash(&hex::encode(h)), Some(h));
        assert_eq!(parse_hash("00"), None);
    }
}
