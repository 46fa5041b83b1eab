//! Records shared by the caches, the persisted store and the wallet engine.

use std::fmt;

use bech32::{hrp, segwit};
use bitcoin::base58;
use bitcoin::{BlockHash, Txid};

pub type TransactionId = i32;
pub type AddressId = i64;
pub type WalletId = i32;

/// Wallet id carried by addresses that have not been clustered yet.
pub const UNASSIGNED_WALLET: WalletId = 0;

/// Low bits of an address id hold the per-partition sequence, the bits above
/// hold the address type tag.
pub const ADDRESS_TYPE_SHIFT: u32 = 40;

/// Spent-status byte of an output.
pub mod output_status {
    pub const UNSPENT: i16 = 0;
    pub const SPENT: i16 = 1;
}

/// Address encodings that get their own partition (table) in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressType {
    P2pkh,
    P2sh,
    P2wpkh,
    P2wsh,
}

impl AddressType {
    pub const ALL: [AddressType; 4] = [
        AddressType::P2pkh,
        AddressType::P2sh,
        AddressType::P2wpkh,
        AddressType::P2wsh,
    ];

    fn tag(self) -> i64 {
        match self {
            AddressType::P2pkh => 0,
            AddressType::P2sh => 1,
            AddressType::P2wpkh => 2,
            AddressType::P2wsh => 3,
        }
    }

    /// Position in [`AddressType::ALL`].
    pub fn index(self) -> usize {
        self.tag() as usize
    }

    pub fn table_name(self) -> &'static str {
        match self {
            AddressType::P2pkh => "address_p2pkh",
            AddressType::P2sh => "address_p2sh",
            AddressType::P2wpkh => "address_p2wpkh",
            AddressType::P2wsh => "address_p2wsh",
        }
    }

    /// Smallest id of this partition minus one: an empty partition starts
    /// counting from here.
    pub fn id_base(self) -> AddressId {
        self.tag() << ADDRESS_TYPE_SHIFT
    }

    /// Recovers the partition from an address id. Id 0 is "unresolved".
    pub fn from_address_id(address_id: AddressId) -> Option<AddressType> {
        if address_id <= 0 {
            return None;
        }
        match address_id >> ADDRESS_TYPE_SHIFT {
            0 => Some(AddressType::P2pkh),
            1 => Some(AddressType::P2sh),
            2 => Some(AddressType::P2wpkh),
            3 => Some(AddressType::P2wsh),
            _ => None,
        }
    }

    /// Partitions that can hold a raw address of `len` bytes when the caller
    /// has no type hint.
    ///
    /// This is an approximation: hash-based types are 20 bytes except P2WSH
    /// (32). Any new address type with a 20 or 32 byte payload makes the
    /// answer ambiguous.
    pub fn candidates_for_len(len: usize) -> &'static [AddressType] {
        const HASH160_TYPES: [AddressType; 3] =
            [AddressType::P2pkh, AddressType::P2sh, AddressType::P2wpkh];
        const SCRIPT_HASH_TYPES: [AddressType; 1] = [AddressType::P2wsh];
        if len == 20 {
            &HASH160_TYPES
        } else {
            &SCRIPT_HASH_TYPES
        }
    }

    /// Human readable mainnet form of a raw address, used in log lines.
    pub fn encode(self, bytes: &[u8]) -> Option<String> {
        match self {
            AddressType::P2pkh | AddressType::P2sh => {
                let prefix = if self == AddressType::P2pkh { 0x00 } else { 0x05 };
                let mut data = vec![prefix];
                data.extend_from_slice(bytes);
                Some(base58::encode_check(&data))
            }
            AddressType::P2wpkh | AddressType::P2wsh => {
                segwit::encode(hrp::BC, segwit::VERSION_0, bytes).ok()
            }
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddressType::P2pkh => "P2PKH",
            AddressType::P2sh => "P2SH",
            AddressType::P2wpkh => "P2WPKH",
            AddressType::P2wsh => "P2WSH",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub address_id: AddressId,
    pub address: Vec<u8>,
    pub wallet_id: WalletId,
}

impl Address {
    pub fn address_type(&self) -> Option<AddressType> {
        AddressType::from_address_id(self.address_id)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self
            .address_type()
            .and_then(|t| t.encode(&self.address))
        {
            Some(encoded) => write!(f, "{}#{}", encoded, self.address_id),
            None => write!(f, "{}#{}", hex::encode(&self.address), self.address_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub height: i32,
    pub hash: BlockHash,
    pub txn_count: i32,
}

/// What the block source knows about a block without its transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: BlockHash,
    pub height: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub transaction_id: TransactionId,
    pub txid: Txid,
    pub block_height: i32,
    pub n_inputs: i32,
    pub n_outputs: i32,
}

/// Composite key of an output (and of an input).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputKey {
    pub transaction_id: TransactionId,
    pub pos: i16,
}

impl OutputKey {
    pub fn new(transaction_id: TransactionId, pos: i16) -> Self {
        Self { transaction_id, pos }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub transaction_id: TransactionId,
    pub pos: i16,
    pub address_id: AddressId,
    pub amount: i64,
    pub status: i16,
}

impl TxOutput {
    pub fn key(&self) -> OutputKey {
        OutputKey::new(self.transaction_id, self.pos)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub transaction_id: TransactionId,
    pub pos: i16,
    pub in_transaction_id: TransactionId,
    pub in_pos: i16,
}

impl TxInput {
    /// Key of the output this input spends.
    pub fn spent_output(&self) -> OutputKey {
        OutputKey::new(self.in_transaction_id, self.in_pos)
    }
}
