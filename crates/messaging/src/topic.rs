//! Symbolic topic names and their resolution to physical topics.
//!
//! Business code only ever names a topic symbolically (`COMMAND_TOPIC_CHARACTER`).
//! The registry maps that name to the physical topic through an environment
//! variable of the same name, memoized for the life of the process.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

pub const COMMAND_TOPIC_SAGA: &str = "COMMAND_TOPIC_SAGA";
pub const EVENT_TOPIC_SAGA_STATUS: &str = "EVENT_TOPIC_SAGA_STATUS";

pub const COMMAND_TOPIC_COMPARTMENT: &str = "COMMAND_TOPIC_COMPARTMENT";
pub const EVENT_TOPIC_ASSET_STATUS: &str = "EVENT_TOPIC_ASSET_STATUS";

pub const COMMAND_TOPIC_COMPARTMENT_TRANSFER: &str = "COMMAND_TOPIC_COMPARTMENT_TRANSFER";
pub const EVENT_TOPIC_COMPARTMENT_TRANSFER_STATUS: &str = "EVENT_TOPIC_COMPARTMENT_TRANSFER_STATUS";

pub const COMMAND_TOPIC_CHARACTER: &str = "COMMAND_TOPIC_CHARACTER";
pub const EVENT_TOPIC_CHARACTER_STATUS: &str = "EVENT_TOPIC_CHARACTER_STATUS";

pub const COMMAND_TOPIC_SKILL: &str = "COMMAND_TOPIC_SKILL";
pub const EVENT_TOPIC_SKILL_STATUS: &str = "EVENT_TOPIC_SKILL_STATUS";

pub const COMMAND_TOPIC_QUEST: &str = "COMMAND_TOPIC_QUEST";
pub const EVENT_TOPIC_QUEST_STATUS: &str = "EVENT_TOPIC_QUEST_STATUS";

pub const COMMAND_TOPIC_WALLET: &str = "COMMAND_TOPIC_WALLET";
pub const EVENT_TOPIC_WALLET_STATUS: &str = "EVENT_TOPIC_WALLET_STATUS";

pub const COMMAND_TOPIC_BUDDY_LIST: &str = "COMMAND_TOPIC_BUDDY_LIST";
pub const EVENT_TOPIC_BUDDY_LIST_STATUS: &str = "EVENT_TOPIC_BUDDY_LIST_STATUS";

pub const COMMAND_TOPIC_PET: &str = "COMMAND_TOPIC_PET";
pub const EVENT_TOPIC_PET_STATUS: &str = "EVENT_TOPIC_PET_STATUS";

pub const COMMAND_TOPIC_CONSUMABLE: &str = "COMMAND_TOPIC_CONSUMABLE";
pub const EVENT_TOPIC_CONSUMABLE_STATUS: &str = "EVENT_TOPIC_CONSUMABLE_STATUS";

/// Suffix appended to a physical topic to form its dead-letter topic.
pub const DEAD_LETTER_SUFFIX: &str = ".dlq";

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves symbolic topic names to physical ones.
///
/// Resolution happens once per name. When no mapping exists the symbolic
/// name itself is used and a single warning is logged.
pub struct TopicRegistry {
    lookup: Lookup,
    resolved: Mutex<HashMap<String, String>>,
}

impl TopicRegistry {
    /// Resolves names through environment variables.
    pub fn from_env() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
    }

    /// Resolves names through an arbitrary lookup function.
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves names from a fixed table.
    pub fn from_map(map: HashMap<String, String>) -> Self {
        Self::with_lookup(move |name| map.get(name).cloned())
    }

    /// Uses every symbolic name as its own physical name.
    pub fn identity() -> Self {
        Self::with_lookup(|_| None)
    }

    /// Returns the physical topic for a symbolic name.
    pub fn resolve(&self, symbolic: &str) -> String {
        let mut resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(physical) = resolved.get(symbolic) {
            return physical.clone();
        }

        let physical = match (self.lookup)(symbolic) {
            Some(physical) => physical,
            None => {
                tracing::warn!(
                    topic = symbolic,
                    "no physical topic configured, using symbolic name"
                );
                symbolic.to_string()
            }
        };
        resolved.insert(symbolic.to_string(), physical.clone());
        physical
    }

    /// Returns the physical dead-letter topic for a symbolic name.
    pub fn dead_letter(&self, symbolic: &str) -> String {
        format!("{}{}", self.resolve(symbolic), DEAD_LETTER_SUFFIX)
    }
}

impl std::fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("TopicRegistry")
            .field("resolved", &*resolved)
            .finish_non_exhaustive()
    }
}
