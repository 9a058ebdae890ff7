use crate::behavior::BehaviorOptions;
use crate::registry::MAX_TOPIC_SLOTS;
use config::{Config, ConfigError, Environment, File, FileFormat};
use ethers::types::{Address, H256};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::Path;
use std::str::FromStr;

pub const DEFAULT_CONFIG_PATH: &str = "Config.toml";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Invalid address '{value}' in {field}")]
    InvalidAddress { field: String, value: String },
    #[error("Invalid topic hash '{value}' in filter.topics[{slot}]")]
    InvalidTopic { slot: usize, value: String },
    #[error("filter.topics has {count} slots, at most 4 are allowed")]
    TooManyTopicSlots { count: usize },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct Rpc {
    /// Websocket endpoint. http(s) URLs are rewritten to ws(s).
    pub url: String,
    #[serde(default = "default_resubscribe_backoff_ms")]
    pub resubscribe_backoff_ms: u64,
    /// Retries per subscription attempt, 0 = unlimited.
    #[serde(default)]
    pub resubscribe_attempts: usize,
}

fn default_resubscribe_backoff_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Filter {
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Textual signatures, e.g. `Transfer(address,address,uint256)`; hashed into topic slot 0.
    #[serde(default)]
    pub event_signatures: Vec<String>,
    /// Raw topic hashes per slot.
    #[serde(default)]
    pub topics: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Historical {
    #[serde(default)]
    pub from_block: Option<u64>,
    /// Latest block when unset.
    #[serde(default)]
    pub to_block: Option<u64>,
    #[serde(default = "default_step_blocks")]
    pub step_blocks: u64,
    #[serde(default)]
    pub batch_fetch_blocks: bool,
    #[serde(default)]
    pub continue_to_realtime: bool,
}

fn default_step_blocks() -> u64 {
    crate::historical::DEFAULT_STEP_BLOCKS
}

impl Default for Historical {
    fn default() -> Self {
        Self {
            from_block: None,
            to_block: None,
            step_blocks: default_step_blocks(),
            batch_fetch_blocks: false,
            continue_to_realtime: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Limits {
    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: usize,
    #[serde(default = "default_block_batch_size")]
    pub block_batch_size: u64,
    /// 0 = unbounded
    #[serde(default)]
    pub header_cache_capacity: usize,
    /// Trailing backfill blocks kept for the switch to realtime.
    #[serde(default = "default_handoff_window")]
    pub handoff_window: u64,
}

fn default_max_requests_per_second() -> usize {
    crate::throttle::DEFAULT_MAX_REQUESTS_PER_SECOND
}
fn default_block_batch_size() -> u64 {
    crate::historical::DEFAULT_BLOCK_BATCH_SIZE
}
fn default_handoff_window() -> u64 {
    crate::dedup::DEFAULT_HANDOFF_WINDOW
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_requests_per_second: default_max_requests_per_second(),
            block_batch_size: default_block_batch_size(),
            header_cache_capacity: 0,
            handoff_window: default_handoff_window(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Listener {
    #[serde(default = "default_pending_poll_interval_ms")]
    pub pending_poll_interval_ms: u64,
}

fn default_pending_poll_interval_ms() -> u64 {
    50
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            pending_poll_interval_ms: default_pending_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Abi {
    #[serde(default = "default_event_signatures_path")]
    pub event_signatures_path: String,
}

fn default_event_signatures_path() -> String {
    "./data/event_sigs.json".to_string()
}

impl Default for Abi {
    fn default() -> Self {
        Self {
            event_signatures_path: default_event_signatures_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BehaviorSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Address → free-form properties. `enabled = false` excludes an address.
    #[serde(default)]
    pub addresses: HashMap<String, Value>,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub rpc: Rpc,
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub historical: Historical,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub listener: Listener,
    #[serde(default)]
    pub abi: Abi,
    #[serde(default)]
    pub behaviors: BTreeMap<String, BehaviorSettings>,
}

impl Settings {
    /// Load `path` (TOML) with `TRACKER_*` environment overrides
    /// (`TRACKER_LIMITS__MAX_REQUESTS_PER_SECOND=10`) and `TRACKER_RPC_URL`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let builder = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml))
            .add_source(Environment::with_prefix("TRACKER").separator("__"));
        Self::finish(builder.build()?)
    }

    /// Build from an in-memory TOML document (no environment overrides).
    pub fn from_toml_str(raw: &str) -> Result<Self, SettingsError> {
        let config = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?;
        let settings: Self = config.try_deserialize()?;
        Ok(settings)
    }

    fn finish(config: Config) -> Result<Self, SettingsError> {
        let mut settings: Self = config.try_deserialize()?;

        if let Ok(url) = env::var("TRACKER_RPC_URL") {
            let trimmed = url.trim();
            if !trimmed.is_empty() {
                settings.rpc.url = trimmed.to_string();
            }
        }
        Ok(settings)
    }

    /// Global filter addresses.
    pub fn filter_addresses(&self) -> Result<Vec<Address>, SettingsError> {
        self.filter
            .addresses
            .iter()
            .map(|a| parse_address(a, "filter.addresses"))
            .collect()
    }

    pub fn filter_topics(&self) -> Result<Vec<Vec<H256>>, SettingsError> {
        if self.filter.topics.len() > MAX_TOPIC_SLOTS {
            return Err(SettingsError::TooManyTopicSlots {
                count: self.filter.topics.len(),
            });
        }
        self.filter
            .topics
            .iter()
            .enumerate()
            .map(|(slot, hashes)| {
                hashes
                    .iter()
                    .map(|h| {
                        H256::from_str(h.trim()).map_err(|_| SettingsError::InvalidTopic {
                            slot,
                            value: h.clone(),
                        })
                    })
                    .collect()
            })
            .collect()
    }

    /// Every configured behavior as `(name, enabled, options)`.
    pub fn behavior_configs(&self) -> Result<Vec<(&str, bool, BehaviorOptions)>, SettingsError> {
        let mut configs = Vec::with_capacity(self.behaviors.len());
        for (name, behavior) in &self.behaviors {
            let field = format!("behaviors.{}.addresses", name);
            let mut options = BehaviorOptions {
                options: behavior.options.clone(),
                ..Default::default()
            };
            let mut raw: Vec<(&String, &Value)> = behavior.addresses.iter().collect();
            raw.sort_by(|a, b| a.0.cmp(b.0));
            for (hex, properties) in raw {
                if properties.get("enabled") == Some(&Value::Bool(false)) {
                    continue;
                }
                let address = parse_address(hex, &field)?;
                if !options.addresses.contains(&address) {
                    options.addresses.push(address);
                }
                options.address_properties.insert(address, properties.clone());
            }
            configs.push((name.as_str(), behavior.enabled, options));
        }
        Ok(configs)
    }
}

fn parse_address(raw: &str, field: &str) -> Result<Address, SettingsError> {
    Address::from_str(raw.trim()).map_err(|_| SettingsError::InvalidAddress {
        field: field.to_string(),
        value: raw.to_string(),
    })
}
