//! Group: the tenant account

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::channel::DEFAULT_SET;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Enabled,
    Disabled,
    /// Internal groups may force channel selection via the channel header
    Internal,
}

impl From<GroupStatus> for i32 {
    fn from(s: GroupStatus) -> i32 {
        match s {
            GroupStatus::Enabled => 1,
            GroupStatus::Disabled => 2,
            GroupStatus::Internal => 3,
        }
    }
}

impl TryFrom<i32> for GroupStatus {
    type Error = String;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(GroupStatus::Enabled),
            2 => Ok(GroupStatus::Disabled),
            3 => Ok(GroupStatus::Internal),
            other => Err(format!("invalid group status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub status: GroupStatus,
    #[serde(default)]
    pub available_sets: Vec<String>,
    /// Effective RPM multiplier from the consumption-level ratio table,
    /// 0 = unscaled
    #[serde(default)]
    pub rpm_ratio: f64,
    #[serde(default)]
    pub tpm_ratio: f64,
    /// Per-model RPM overrides; win over the model config cap
    #[serde(default)]
    pub rpm_overrides: HashMap<String, i64>,
    #[serde(default)]
    pub tpm_overrides: HashMap<String, i64>,
}

impl Group {
    pub fn effective_sets(&self) -> Vec<String> {
        if self.available_sets.is_empty() {
            vec![DEFAULT_SET.to_string()]
        } else {
            self.available_sets.clone()
        }
    }

    /// RPM cap for one model: group override first, else the model cap
    /// scaled by the group ratio. 0 = uncapped.
    pub fn adjusted_rpm(&self, model: &str, model_rpm: i64) -> i64 {
        if let Some(rpm) = self.rpm_overrides.get(model) {
            return *rpm;
        }
        if self.rpm_ratio > 0.0 {
            (model_rpm as f64 * self.rpm_ratio) as i64
        } else {
            model_rpm
        }
    }

    pub fn adjusted_tpm(&self, model: &str, model_tpm: i64) -> i64 {
        if let Some(tpm) = self.tpm_overrides.get(model) {
            return *tpm;
        }
        if self.tpm_ratio > 0.0 {
            (model_tpm as f64 * self.tpm_ratio) as i64
        } else {
            model_tpm
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> Group {
        Group {
            id: "acme".into(),
            status: GroupStatus::Enabled,
            available_sets: Vec::new(),
            rpm_ratio: 0.0,
            tpm_ratio: 0.0,
            rpm_overrides: HashMap::new(),
            tpm_overrides: HashMap::new(),
        }
    }

    #[test]
    fn empty_sets_fall_back_to_default() {
        assert_eq!(group().effective_sets(), vec![DEFAULT_SET.to_string()]);
    }

    #[test]
    fn rpm_override_wins_over_ratio() {
        let mut g = group();
        g.rpm_ratio = 2.0;
        g.rpm_overrides.insert("m".into(), 5);
        assert_eq!(g.adjusted_rpm("m", 100), 5);
        assert_eq!(g.adjusted_rpm("other", 100), 200);
    }
}
