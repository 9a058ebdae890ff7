//! # Behaviors
//!
//! A behavior is an independently-authored monitoring feature that registers
//! handlers during setup. Behaviors are listed in a static table
//! ([`builtin_behaviors`]) mapping a config name to a constructor; the config's
//! `behaviors.<name>` sections select and parametrise them.
//!
//! Lifecycle:
//! 1. [`Behavior::init`] registers handlers before listening starts.
//! 2. [`Behavior::finished`] runs after a historical run completes (not when the
//!    run continues into realtime).
//! 3. [`Behavior::info`] describes the behavior for the `behaviors` command.

use crate::behaviors;
use crate::handler::HandlerContext;
use crate::registry::HandlerRegistry;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use colored::Colorize;
use ethers::types::Address;
use log::info;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Human-readable description of a behavior.
#[derive(Debug, Clone, Copy)]
pub struct BehaviorInfo {
    pub name: &'static str,
    pub overview: &'static str,
    pub description: &'static str,
    pub options: &'static str,
    pub example: &'static str,
}

/// Per-behavior configuration: enabled addresses with their free-form
/// properties, plus a free-form options table.
#[derive(Debug, Clone, Default)]
pub struct BehaviorOptions {
    pub addresses: Vec<Address>,
    pub address_properties: HashMap<Address, Value>,
    pub options: BTreeMap<String, Value>,
}

impl BehaviorOptions {
    pub fn bool_option(&self, key: &str, default: bool) -> Result<bool> {
        match self.options.get(key) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(anyhow!("Option '{}' must be a bool, got {}", key, other)),
        }
    }

    pub fn address_list_option(&self, key: &str) -> Result<Vec<Address>> {
        let Some(value) = self.options.get(key) else {
            return Ok(Vec::new());
        };
        let Value::Array(items) = value else {
            return Err(anyhow!("Option '{}' must be a list of addresses", key));
        };
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| anyhow!("Option '{}' contains a non-string entry", key))?
                    .trim()
                    .parse::<Address>()
                    .with_context(|| format!("Option '{}' contains an invalid address", key))
            })
            .collect()
    }
}

#[async_trait]
pub trait Behavior: Send + Sync {
    fn info(&self) -> BehaviorInfo;

    /// Register handlers. Called once during setup.
    fn init(&self, options: &BehaviorOptions, registry: &HandlerRegistry) -> Result<()>;

    /// Called after a historical run completes.
    async fn finished(&self, _ctx: &HandlerContext) -> Result<()> {
        Ok(())
    }
}

/// One row of the static behavior table.
pub struct BehaviorEntry {
    /// Key used in `behaviors.<name>` config sections.
    pub name: &'static str,
    pub build: fn() -> Arc<dyn Behavior>,
}

pub fn builtin_behaviors() -> &'static [BehaviorEntry] {
    static TABLE: [BehaviorEntry; 2] = [
        BehaviorEntry {
            name: behaviors::logging::NAME,
            build: behaviors::logging::build,
        },
        BehaviorEntry {
            name: behaviors::transfer_monitor::NAME,
            build: behaviors::transfer_monitor::build,
        },
    ];
    &TABLE
}

pub fn find_behavior(name: &str) -> Option<&'static BehaviorEntry> {
    builtin_behaviors().iter().find(|e| e.name == name)
}

/// Behaviors selected by configuration, in a stable (name) order.
#[derive(Default)]
pub struct BehaviorSet {
    active: Vec<(Arc<dyn Behavior>, BehaviorOptions)>,
}

impl BehaviorSet {
    /// Instantiate every configured behavior. Unknown names are an error;
    /// disabled ones are skipped.
    pub fn from_config<'a>(
        configured: impl IntoIterator<Item = (&'a str, bool, BehaviorOptions)>,
    ) -> Result<Self> {
        let mut active = Vec::new();
        let mut configured: Vec<_> = configured.into_iter().collect();
        configured.sort_by(|a, b| a.0.cmp(b.0));
        for (name, enabled, options) in configured {
            let entry = find_behavior(name).ok_or_else(|| {
                anyhow!("Behavior '{}' does not exist, but was specified in config", name)
            })?;
            if enabled {
                active.push(((entry.build)(), options));
            }
        }
        Ok(Self { active })
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.active.iter().map(|(b, _)| b.info().name).collect()
    }

    pub fn init_all(&self, registry: &HandlerRegistry) -> Result<()> {
        for (behavior, options) in &self.active {
            let name = behavior.info().name;
            info!("Initializing behavior: {}", name);
            behavior
                .init(options, registry)
                .with_context(|| format!("Failed to initialize behavior '{}'", name))?;
        }
        Ok(())
    }

    pub async fn finish_all(&self, ctx: &HandlerContext) -> Result<()> {
        for (behavior, _) in &self.active {
            let name = behavior.info().name;
            info!("Running finished hook of {}", name);
            behavior
                .finished(ctx)
                .await
                .with_context(|| format!("Finished hook of '{}' failed", name))?;
        }
        Ok(())
    }
}

/// Summary lines (`name - overview`) for every built-in behavior.
pub fn list_behaviors() -> String {
    let mut out = String::new();
    for entry in builtin_behaviors() {
        let info = (entry.build)().info();
        out.push_str(&format!("{} - {}\n", entry.name.bold(), info.overview));
    }
    out
}

/// Full description of every behavior whose config name or display name
/// contains `term` (case-insensitive). `None` if nothing matches.
pub fn describe_behaviors(term: &str) -> Option<String> {
    let term = term.to_lowercase();
    let mut out = String::new();
    for entry in builtin_behaviors() {
        let info = (entry.build)().info();
        if !entry.name.to_lowercase().contains(&term) && !info.name.to_lowercase().contains(&term) {
            continue;
        }
        out.push_str(&format!("{} ({})\n\n", info.name.bold().underline(), entry.name));
        out.push_str(&format!("{}\n{}\n\n", "Overview".green(), info.overview));
        out.push_str(&format!("{}\n{}\n\n", "Description".green(), info.description));
        out.push_str(&format!("{}\n{}\n\n", "Options".green(), info.options));
        out.push_str(&format!("{}\n{}\n\n", "Example".green(), info.example));
    }
    (!out.is_empty()).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_names_are_unique_and_resolvable() {
        let names: Vec<&str> = builtin_behaviors().iter().map(|e| e.name).collect();
        let unique: std::collections::HashSet<&str> = names.iter().copied().collect();
        assert_eq!(names.len(), unique.len());
        for name in names {
            assert!(find_behavior(name).is_some());
        }
    }

    #[test]
    fn test_unknown_behavior_is_rejected() {
        let result = BehaviorSet::from_config([("does_not_exist", true, BehaviorOptions::default())]);
        let err = result.err().unwrap();
        assert!(err.to_string().contains("does_not_exist"));
    }

    #[test]
    fn test_disabled_behaviors_are_not_instantiated() {
        let set = BehaviorSet::from_config([
            ("logging", false, BehaviorOptions::default()),
            ("transfer_monitor", true, BehaviorOptions::default()),
        ])
        .unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_option_helpers() {
        let mut options = BehaviorOptions::default();
        options.options.insert("flag".into(), json!(true));
        options.options.insert("count".into(), json!(3));
        options.options.insert(
            "tokens".into(),
            json!(["0xdAC17F958D2ee523a2206206994597C13D831ec7"]),
        );

        assert!(options.bool_option("flag", false).unwrap());
        assert!(options.bool_option("missing", true).unwrap());
        assert!(options.bool_option("count", false).is_err());
        assert_eq!(options.address_list_option("tokens").unwrap().len(), 1);
        assert!(options.address_list_option("missing").unwrap().is_empty());
    }

    #[test]
    fn test_describe_matches_substring_case_insensitively() {
        assert!(describe_behaviors("TRANSFER").is_some());
        assert!(describe_behaviors("nothing-like-this").is_none());
        assert!(list_behaviors().contains("logging"));
    }
}
