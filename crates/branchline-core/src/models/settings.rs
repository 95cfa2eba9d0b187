//! Agent settings and their override cascade.
//!
//! Settings resolve `defaults < project < conversation`. A layer only
//! overrides the values it sets, so an unset value never clears a lower one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const MIN_THINKING_BUDGET: u32 = 1024;
pub const MAX_THINKING_BUDGET: u32 = 50_000;
pub const DEFAULT_THINKING_BUDGET: u32 = 10_000;

/// One layer of agent settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Tool name to enabled flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<BTreeMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
}

impl AgentSettings {
    /// Apply `upper` on top of `self`. Tool maps merge per tool.
    pub fn overlay(&self, upper: &AgentSettings) -> AgentSettings {
        let tools = match (&self.tools, &upper.tools) {
            (Some(lower), Some(upper)) => {
                let mut merged = lower.clone();
                merged.extend(upper.iter().map(|(name, enabled)| (name.clone(), *enabled)));
                Some(merged)
            }
            (lower, upper) => upper.clone().or_else(|| lower.clone()),
        };

        AgentSettings {
            model: upper.model.clone().or_else(|| self.model.clone()),
            system_prompt: upper
                .system_prompt
                .clone()
                .or_else(|| self.system_prompt.clone()),
            tools,
            cwd: upper.cwd.clone().or_else(|| self.cwd.clone()),
            thinking_budget: upper.thinking_budget.or(self.thinking_budget),
        }
    }

    /// Resolve layers from lowest to highest precedence.
    pub fn cascade<'a>(layers: impl IntoIterator<Item = &'a AgentSettings>) -> AgentSettings {
        layers
            .into_iter()
            .fold(AgentSettings::default(), |acc, layer| acc.overlay(layer))
    }

    pub fn enabled_tools(&self) -> BTreeMap<String, bool> {
        self.tools.clone().unwrap_or_default()
    }

    /// Effective thinking budget, clamped to the supported range.
    pub fn resolved_thinking_budget(&self) -> u32 {
        clamp_thinking_budget(self.thinking_budget.unwrap_or(DEFAULT_THINKING_BUDGET))
    }
}

pub fn clamp_thinking_budget(budget: u32) -> u32 {
    budget.clamp(MIN_THINKING_BUDGET, MAX_THINKING_BUDGET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cascade_precedence() {
        let defaults = AgentSettings {
            model: Some("base".into()),
            thinking_budget: Some(2000),
            ..AgentSettings::default()
        };
        let project = AgentSettings {
            model: Some("project".into()),
            system_prompt: Some("project prompt".into()),
            ..AgentSettings::default()
        };
        let conversation = AgentSettings {
            model: Some("conversation".into()),
            ..AgentSettings::default()
        };

        let resolved = AgentSettings::cascade([&defaults, &project, &conversation]);
        assert_eq!(resolved.model.as_deref(), Some("conversation"));
        assert_eq!(resolved.system_prompt.as_deref(), Some("project prompt"));
        assert_eq!(resolved.thinking_budget, Some(2000));
    }

    #[test]
    fn test_tool_maps_merge_per_tool() {
        let lower = AgentSettings {
            tools: Some(BTreeMap::from([("bash".into(), true), ("web".into(), true)])),
            ..AgentSettings::default()
        };
        let upper = AgentSettings {
            tools: Some(BTreeMap::from([("web".into(), false)])),
            ..AgentSettings::default()
        };

        let tools = lower.overlay(&upper).enabled_tools();
        assert_eq!(tools.get("bash"), Some(&true));
        assert_eq!(tools.get("web"), Some(&false));
    }

    #[test]
    fn test_thinking_budget_is_clamped() {
        assert_eq!(clamp_thinking_budget(10), MIN_THINKING_BUDGET);
        assert_eq!(clamp_thinking_budget(90_000), MAX_THINKING_BUDGET);
        assert_eq!(
            AgentSettings::default().resolved_thinking_budget(),
            DEFAULT_THINKING_BUDGET
        );
    }
}
