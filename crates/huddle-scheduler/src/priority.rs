use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Request priority, ordered from least to most urgent
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Specific,
}

impl Priority {
    /// Scan order used when dequeuing
    pub const DESCENDING: [Priority; 4] = [
        Priority::Specific,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Specific => 3,
        }
    }
}

/// Logical partition of outbound requests, e.g. one backend class
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route(Arc<str>);

impl Route {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Route {
    fn from(name: &str) -> Self {
        Route::new(name)
    }
}

impl From<String> for Route {
    fn from(name: String) -> Self {
        Route::new(name)
    }
}

/// Aging parameters
///
/// Weights share one scale: a task starts at the weight of its priority and
/// every successful dequeue adds `aging_step` to each waiting `Normal`/`Low`
/// task. A `Low` task reaching `normal_threshold` moves to `Normal`, a `Normal`
/// task reaching `high_threshold` moves to `High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightConfig {
    pub aging_step: u32,
    pub normal_threshold: u32,
    pub high_threshold: u32,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            aging_step: 1,
            normal_threshold: 100,
            high_threshold: 200,
        }
    }
}

impl WeightConfig {
    pub fn initial_weight(&self, priority: Priority) -> u32 {
        match priority {
            Priority::Low => 0,
            Priority::Normal => self.normal_threshold,
            Priority::High => self.high_threshold,
            Priority::Specific => self.high_threshold.saturating_mul(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::High < Priority::Specific);
        assert_eq!(Priority::DESCENDING[0], Priority::Specific);
    }

    #[test]
    fn test_initial_weights_follow_priority() {
        let config = WeightConfig::default();
        let weights: Vec<u32> = [
            Priority::Low,
            Priority::Normal,
            Priority::High,
            Priority::Specific,
        ]
        .iter()
        .map(|p| config.initial_weight(*p))
        .collect();
        assert_eq!(weights, vec![0, 100, 200, 400]);
    }
}
