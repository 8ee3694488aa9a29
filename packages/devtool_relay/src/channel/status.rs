use serde::{Deserialize, Serialize};

/// Channel status, derived from how many targets and devtools it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    /// At least one target and at least one devtool.
    Enable,
    /// Targets only.
    TargetAwaits,
    /// Devtools left behind after the last target went away.
    Disabling,
    /// Nothing connected.
    Disable,
}

impl ChannelStatus {
    pub fn from_counts(targets: usize, devtools: usize) -> Self {
        match (targets > 0, devtools > 0) {
            (true, true) => ChannelStatus::Enable,
            (true, false) => ChannelStatus::TargetAwaits,
            (false, true) => ChannelStatus::Disabling,
            (false, false) => ChannelStatus::Disable,
        }
    }
}
