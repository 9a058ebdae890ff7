//! # Event Schemas
//!
//! Decoding collaborator for the dispatcher. A [`SchemaBook`] answers whether an
//! event signature hash has a known schema and decodes matching logs into named
//! fields, split between indexed topics and ABI-encoded data.
//!
//! [`SignatureBook`] is the JSON-backed implementation. The file maps the hex
//! signature hash to the event's name, textual signature and ABI item:
//!
//! ```json
//! {
//!   "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef": {
//!     "name": "Transfer",
//!     "sig": "Transfer(address,address,uint256)",
//!     "abi": { "type": "event", "name": "Transfer", "anonymous": false, "inputs": [ ... ] }
//!   }
//! }
//! ```

use ethers::abi::{Abi, Event, RawLog, Token};
use ethers::types::{Log, H256};
use ethers::utils::keccak256;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;

/// Keccak-256 hash of a textual event signature such as `Transfer(address,address,uint256)`.
pub fn event_signature_hash(signature: &str) -> H256 {
    H256::from(keccak256(signature.as_bytes()))
}

/// One field of an event schema, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventField {
    pub name: String,
    pub kind: String,
    pub indexed: bool,
}

/// A log decoded against its schema.
#[derive(Debug, Clone, Default)]
pub struct DecodedEvent {
    pub name: String,
    pub fields: Vec<EventField>,
    pub topics: BTreeMap<String, Token>,
    pub data: BTreeMap<String, Token>,
}

#[derive(Debug, thiserror::Error)]
pub enum AbiError {
    #[error("Failed to read signature file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write signature file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid signature JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid signature hash key {0}")]
    InvalidKey(String),
    #[error("Log has no topics")]
    NoTopics,
    #[error("Failed to decode {event}: {source}")]
    Decode {
        event: String,
        #[source]
        source: ethers::abi::Error,
    },
}

/// Schema lookup and decoding for event logs.
pub trait SchemaBook: Send + Sync {
    fn has_schema(&self, signature_hash: &H256) -> bool;

    /// Decode `log` if its first topic has a known schema.
    ///
    /// `Ok(None)` means no schema is known; `Err` means the schema exists but the
    /// log does not match it.
    fn decode(&self, log: &Log) -> Result<Option<DecodedEvent>, AbiError>;
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    sig: Option<String>,
    abi: Event,
}

#[derive(Serialize)]
struct StoredEntry<'a> {
    name: &'a str,
    sig: &'a str,
    abi: &'a Event,
}

#[derive(Debug, Clone)]
struct SchemaEntry {
    signature: String,
    event: Event,
}

/// In-memory signature book, usually loaded from `event_sigs.json`.
#[derive(Debug, Clone, Default)]
pub struct SignatureBook {
    entries: HashMap<H256, SchemaEntry>,
}

impl SignatureBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a signature book file. A missing file yields an empty book.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AbiError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(
                "Signature file {} not found, starting with an empty signature book",
                path.display()
            );
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| AbiError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let book = Self::from_json(&raw)?;
        info!(
            "Loaded {} event signatures from {}",
            book.len(),
            path.display()
        );
        Ok(book)
    }

    pub fn from_json(raw: &str) -> Result<Self, AbiError> {
        let parsed: HashMap<String, RawEntry> = serde_json::from_str(raw)?;
        let mut book = Self::new();
        for (key, entry) in parsed {
            let hash = H256::from_str(key.trim()).map_err(|_| AbiError::InvalidKey(key.clone()))?;
            let computed = entry.abi.signature();
            if computed != hash {
                warn!(
                    "Signature key {} does not match its ABI ({:?}), keeping the key",
                    key, computed
                );
            }
            let signature = entry
                .sig
                .unwrap_or_else(|| canonical_signature(&entry.abi));
            book.entries.insert(
                hash,
                SchemaEntry {
                    signature,
                    event: entry.abi,
                },
            );
        }
        Ok(book)
    }

    /// Write the book in the same format [`load`](Self::load) reads.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), AbiError> {
        let path = path.as_ref();
        let stored: BTreeMap<String, StoredEntry<'_>> = self
            .entries
            .iter()
            .map(|(hash, entry)| {
                (
                    format!("0x{}", hex::encode(hash.as_bytes())),
                    StoredEntry {
                        name: &entry.event.name,
                        sig: &entry.signature,
                        abi: &entry.event,
                    },
                )
            })
            .collect();
        let json = serde_json::to_string_pretty(&stored)?;
        let write_err = |source| AbiError::Write {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(path, json).map_err(write_err)?;
        Ok(())
    }

    /// Add every event of a contract ABI. Returns how many were new.
    pub fn add_contract_abi(&mut self, abi_json: &str) -> Result<usize, AbiError> {
        let abi: Abi = serde_json::from_str(abi_json)?;
        let before = self.entries.len();
        for event in abi.events() {
            self.add_event(event.clone());
        }
        Ok(self.entries.len() - before)
    }

    pub fn add_event(&mut self, event: Event) {
        let signature = canonical_signature(&event);
        self.entries.insert(
            event.signature(),
            SchemaEntry { signature, event },
        );
    }

    /// Parse and add a human-readable event, e.g.
    /// `event Transfer(address indexed from, address indexed to, uint256 value)`.
    pub fn add_human_readable(&mut self, declaration: &str) -> Result<H256, AbiError> {
        let abi = ethers::abi::parse_abi(&[declaration]).map_err(|e| AbiError::Decode {
            event: declaration.to_string(),
            source: ethers::abi::Error::Other(e.to_string().into()),
        })?;
        let mut hash = H256::zero();
        for event in abi.events() {
            hash = event.signature();
            self.add_event(event.clone());
        }
        Ok(hash)
    }

    /// Textual signature for a known hash.
    pub fn signature(&self, hash: &H256) -> Option<&str> {
        self.entries.get(hash).map(|e| e.signature.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SchemaBook for SignatureBook {
    fn has_schema(&self, signature_hash: &H256) -> bool {
        self.entries.contains_key(signature_hash)
    }

    fn decode(&self, log: &Log) -> Result<Option<DecodedEvent>, AbiError> {
        let Some(sig) = log.topics.first() else {
            return Err(AbiError::NoTopics);
        };
        let Some(entry) = self.entries.get(sig) else {
            return Ok(None);
        };

        let parsed = entry
            .event
            .parse_log(RawLog {
                topics: log.topics.clone(),
                data: log.data.to_vec(),
            })
            .map_err(|source| AbiError::Decode {
                event: entry.signature.clone(),
                source,
            })?;

        let fields: Vec<EventField> = entry
            .event
            .inputs
            .iter()
            .map(|input| EventField {
                name: input.name.clone(),
                kind: input.kind.to_string(),
                indexed: input.indexed,
            })
            .collect();

        let mut decoded = DecodedEvent {
            name: entry.event.name.clone(),
            ..Default::default()
        };
        for param in parsed.params {
            let indexed = fields
                .iter()
                .any(|f| f.name == param.name && f.indexed);
            if indexed {
                decoded.topics.insert(param.name, param.value);
            } else {
                decoded.data.insert(param.name, param.value);
            }
        }
        decoded.fields = fields;
        Ok(Some(decoded))
    }
}

fn canonical_signature(event: &Event) -> String {
    let kinds: Vec<String> = event.inputs.iter().map(|i| i.kind.to_string()).collect();
    format!("{}({})", event.name, kinds.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, Bytes, U256};

    const TRANSFER: &str =
        "event Transfer(address indexed from, address indexed to, uint256 value)";

    fn transfer_log(from: Address, to: Address, value: u64) -> Log {
        let mut data = [0u8; 32];
        U256::from(value).to_big_endian(&mut data);
        Log {
            topics: vec![
                event_signature_hash("Transfer(address,address,uint256)"),
                H256::from(from),
                H256::from(to),
            ],
            data: Bytes::from(data.to_vec()),
            ..Default::default()
        }
    }

    #[test]
    fn test_signature_hash_matches_known_transfer_topic() {
        assert_eq!(
            format!("{:?}", event_signature_hash("Transfer(address,address,uint256)")),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn test_decode_splits_topics_and_data() {
        let mut book = SignatureBook::new();
        let hash = book.add_human_readable(TRANSFER).unwrap();
        assert!(book.has_schema(&hash));
        assert_eq!(book.signature(&hash), Some("Transfer(address,address,uint256)"));

        let from = Address::from_low_u64_be(1);
        let to = Address::from_low_u64_be(2);
        let decoded = book.decode(&transfer_log(from, to, 42)).unwrap().unwrap();

        assert_eq!(decoded.name, "Transfer");
        assert_eq!(decoded.fields.len(), 3);
        assert_eq!(decoded.topics.get("from"), Some(&Token::Address(from)));
        assert_eq!(decoded.topics.get("to"), Some(&Token::Address(to)));
        assert_eq!(decoded.data.get("value"), Some(&Token::Uint(U256::from(42))));
    }

    #[test]
    fn test_unknown_signature_is_not_an_error() {
        let book = SignatureBook::new();
        let log = transfer_log(Address::zero(), Address::zero(), 1);
        assert!(book.decode(&log).unwrap().is_none());
    }

    #[test]
    fn test_malformed_log_reports_decode_error() {
        let mut book = SignatureBook::new();
        book.add_human_readable(TRANSFER).unwrap();
        let mut log = transfer_log(Address::zero(), Address::zero(), 1);
        log.topics.truncate(2);
        assert!(matches!(book.decode(&log), Err(AbiError::Decode { .. })));
    }

    #[test]
    fn test_load_from_json_file() {
        let json = r#"{
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef": {
                "name": "Transfer",
                "sig": "Transfer(address,address,uint256)",
                "abi": {
                    "anonymous": false,
                    "inputs": [
                        {"indexed": true, "name": "from", "type": "address"},
                        {"indexed": true, "name": "to", "type": "address"},
                        {"indexed": false, "name": "value", "type": "uint256"}
                    ],
                    "name": "Transfer",
                    "type": "event"
                }
            }
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event_sigs.json");
        std::fs::write(&path, json).unwrap();

        let book = SignatureBook::load(&path).unwrap();
        assert_eq!(book.len(), 1);
        assert!(book.has_schema(&event_signature_hash("Transfer(address,address,uint256)")));
    }

    #[test]
    fn test_contract_abi_events_survive_save_and_load() {
        let abi = r#"[
            {"type": "function", "name": "totalSupply", "inputs": [], "outputs": [{"name": "", "type": "uint256"}], "stateMutability": "view"},
            {"type": "event", "name": "Approval", "anonymous": false, "inputs": [
                {"indexed": true, "name": "owner", "type": "address"},
                {"indexed": true, "name": "spender", "type": "address"},
                {"indexed": false, "name": "value", "type": "uint256"}
            ]}
        ]"#;
        let mut book = SignatureBook::new();
        assert_eq!(book.add_contract_abi(abi).unwrap(), 1);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("event_sigs.json");
        book.save(&path).unwrap();

        let reloaded = SignatureBook::load(&path).unwrap();
        let hash = event_signature_hash("Approval(address,address,uint256)");
        assert_eq!(reloaded.signature(&hash), Some("Approval(address,address,uint256)"));
    }

    #[test]
    fn test_missing_file_gives_empty_book() {
        let book = SignatureBook::load("/nonexistent/event_sigs.json").unwrap();
        assert!(book.is_empty());
    }
}
