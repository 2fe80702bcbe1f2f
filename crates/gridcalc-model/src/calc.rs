use serde::{Deserialize, Serialize};

/// Workbook-wide recalculation policy.
///
/// Mirrors the legacy calculation modes: `Automatic` recomputes a formula
/// whenever its cached value has been invalidated, `Manual` trusts the cache
/// even when precedents have changed (until an explicit recalculation), and
/// `Always` bypasses the cache on every access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalcMode {
    Automatic,
    Manual,
    Always,
}

impl Default for CalcMode {
    fn default() -> Self {
        CalcMode::Automatic
    }
}

impl CalcMode {
    #[must_use]
    pub fn is_manual(self) -> bool {
        self == CalcMode::Manual
    }
}
