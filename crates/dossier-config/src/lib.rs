//! Configuration management for Dossier
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (DSR_* prefix, highest precedence)
//! 2. dossier.local.toml (gitignored, local overrides)
//! 3. dossier.toml (git-tracked, project config)
//! 4. ~/.config/dossier/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)
//!
//! Every tunable of the coordination core lives here: mailbox and repair
//! queue capacities, timeout defaults, liveness periods, persisted-artifact
//! paths, and the externally-supplied evidence routing table.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Dossier configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DossierConfig {
    pub case: CaseConfig,
    pub bus: BusConfig,
    pub locker: LockerConfig,
    pub sections: SectionsConfig,
    pub diagnostics: DiagnosticsConfig,
    pub routing: RoutingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaseConfig {
    pub name: String,
    /// `Investigative`, `Surveillance`, or `Hybrid`.
    pub report_type: String,
}

impl Default for CaseConfig {
    fn default() -> Self {
        Self {
            name: "dossier-case".to_string(),
            report_type: "Investigative".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Hard mailbox capacity per subscriber.
    pub mailbox_capacity: usize,
    /// Depth above which a mailbox enters backpressure.
    pub mailbox_soft_threshold: usize,
    /// Default timeout for `request()` when the radio code supplies none.
    pub request_timeout_secs: u64,
    /// Minimum time between backpressure state changes per mailbox.
    pub backpressure_window_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
            mailbox_soft_threshold: 800,
            request_timeout_secs: 30,
            backpressure_window_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockerConfig {
    /// Append-only evidence manifest, one JSON record per line.
    pub manifest_path: PathBuf,
    /// Per-item classification budget.
    pub classification_budget_secs: u64,
    /// Classification attempts before the item is marked unknown.
    pub classification_attempts: u32,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::from(".dossier/manifest.jsonl"),
            classification_budget_secs: 120,
            classification_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SectionsConfig {
    /// Revision bound per section before it fails permanently.
    pub max_reruns: u32,
    /// Execution budget per section.
    pub execution_budget_secs: u64,
    /// Worker pool size; `0` means size to available CPU.
    pub worker_pool_size: usize,
    /// Bounded inbox capacity per section worker.
    pub worker_inbox_capacity: usize,
}

impl Default for SectionsConfig {
    fn default() -> Self {
        Self {
            max_reruns: 2,
            execution_budget_secs: 600,
            worker_pool_size: 0,
            worker_inbox_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// STATUS sweep period.
    pub status_period_secs: u64,
    /// Window for a STATUS response before it counts as a miss.
    pub status_reply_window_secs: u64,
    /// Consecutive misses before a component is marked unhealthy.
    pub consecutive_miss_limit: u32,
    /// Minimum interval between rollcalls per originating caller.
    pub rollcall_min_interval_secs: u64,
    /// Append-only fault vault, one JSON record per line.
    pub fault_vault_path: PathBuf,
    /// Active fault table hard ceiling.
    pub fault_ceiling: usize,
    /// Retention for closed faults before eviction.
    pub closed_retention_secs: u64,
    pub repair_queue_hard_cap: usize,
    pub repair_queue_soft_cap: usize,
    pub repair_workers: usize,
    pub repair_max_attempts: u32,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            status_period_secs: 30,
            status_reply_window_secs: 15,
            consecutive_miss_limit: 3,
            rollcall_min_interval_secs: 30,
            fault_vault_path: PathBuf::from(".dossier/faults.jsonl"),
            fault_ceiling: 2000,
            closed_retention_secs: 2 * 60 * 60,
            repair_queue_hard_cap: 1000,
            repair_queue_soft_cap: 800,
            repair_workers: 4,
            repair_max_attempts: 3,
        }
    }
}

/// The classification→section routing table.
///
/// Supplied externally; the core never infers routes. An empty table routes
/// nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    #[serde(rename = "rule")]
    pub rules: Vec<RoutingRule>,
}

/// One routing rule. All present match-fields must match for the rule to
/// fire; absent fields match anything. Section labels use report form
/// (`CP`, `TOC`, `1`–`8`, `DP`, `FR`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingRule {
    pub kind: Option<String>,
    pub classification: Option<String>,
    pub tag: Option<String>,
    pub sections: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_platform_contract() {
        let config = DossierConfig::default();
        assert_eq!(config.bus.mailbox_capacity, 1000);
        assert_eq!(config.bus.mailbox_soft_threshold, 800);
        assert_eq!(config.bus.request_timeout_secs, 30);
        assert_eq!(config.locker.classification_budget_secs, 120);
        assert_eq!(config.locker.classification_attempts, 3);
        assert_eq!(config.sections.max_reruns, 2);
        assert_eq!(config.sections.execution_budget_secs, 600);
        assert_eq!(config.diagnostics.status_period_secs, 30);
        assert_eq!(config.diagnostics.status_reply_window_secs, 15);
        assert_eq!(config.diagnostics.consecutive_miss_limit, 3);
        assert_eq!(config.diagnostics.fault_ceiling, 2000);
        assert_eq!(config.diagnostics.repair_queue_hard_cap, 1000);
        assert_eq!(config.diagnostics.repair_queue_soft_cap, 800);
        assert_eq!(config.diagnostics.repair_workers, 4);
        assert!(config.routing.rules.is_empty());
    }

    #[test]
    fn routing_rules_parse_from_toml() {
        let toml = r#"
            [[routing.rule]]
            kind = "image"
            classification = "surveillance-photo"
            sections = ["3", "8"]

            [[routing.rule]]
            tag = "billing"
            sections = ["6"]
        "#;
        let config: DossierConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.routing.rules.len(), 2);
        assert_eq!(config.routing.rules[0].sections, vec!["3", "8"]);
        assert_eq!(config.routing.rules[1].tag.as_deref(), Some("billing"));
    }
}
