//! Input stream handler selection.

use serde::{Deserialize, Serialize};

/// Which input policy a node uses, with its options.
///
/// Serialized with a `type` field, e.g. `{ type = "FixedSize", target_queue_size = 2 }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InputStreamHandlerConfig {
    /// Fire at the minimum pending timestamp once every forward stream has settled it.
    Default {
        #[serde(default = "default_batch_size")]
        batch_size: usize,
    },
    /// Every stream is its own sync set.
    Immediate,
    /// Explicit partitions of `TAG` / `TAG:index` entries; unlisted streams form one more set.
    SyncSet {
        #[serde(default)]
        sync_sets: Vec<Vec<String>>,
    },
    /// Default readiness after trimming queues that grew past the trigger size.
    FixedSize {
        #[serde(default = "default_trigger_queue_size")]
        trigger_queue_size: usize,
        #[serde(default = "default_target_queue_size")]
        target_queue_size: usize,
        #[serde(default)]
        fixed_min_size: bool,
    },
    /// Default readiness; closes as soon as any forward stream is done.
    EarlyClose,
}

fn default_batch_size() -> usize {
    1
}

fn default_trigger_queue_size() -> usize {
    2
}

fn default_target_queue_size() -> usize {
    1
}

impl Default for InputStreamHandlerConfig {
    fn default() -> Self {
        InputStreamHandlerConfig::Default {
            batch_size: default_batch_size(),
        }
    }
}

impl InputStreamHandlerConfig {
    pub fn name(&self) -> &'static str {
        match self {
            InputStreamHandlerConfig::Default { .. } => "Default",
            InputStreamHandlerConfig::Immediate => "Immediate",
            InputStreamHandlerConfig::SyncSet { .. } => "SyncSet",
            InputStreamHandlerConfig::FixedSize { .. } => "FixedSize",
            InputStreamHandlerConfig::EarlyClose => "EarlyClose",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_toml() {
        let cfg: InputStreamHandlerConfig = toml::from_str("type = \"FixedSize\"").unwrap();
        assert_eq!(
            cfg,
            InputStreamHandlerConfig::FixedSize {
                trigger_queue_size: 2,
                target_queue_size: 1,
                fixed_min_size: false,
            }
        );
        let cfg: InputStreamHandlerConfig = toml::from_str("type = \"Default\"").unwrap();
        assert_eq!(cfg, InputStreamHandlerConfig::default());
    }

    #[test]
    fn test_sync_sets_from_json() {
        let cfg: InputStreamHandlerConfig =
            serde_json::from_str(r#"{"type":"SyncSet","sync_sets":[["A","B:1"],["C"]]}"#)
                .unwrap();
        match cfg {
            InputStreamHandlerConfig::SyncSet { sync_sets } => assert_eq!(sync_sets.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(InputStreamHandlerConfig::Immediate.name(), "Immediate");
    }
}
