use super::store::StatsStore;
use crate::identity::Identity;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub identity: Identity,
    pub seconds: u64,
    pub display: String,
}

/// Reply to a stats request: the top owners plus the caller's own total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsReport {
    pub leaderboard: Vec<LeaderboardEntry>,
    pub caller: Identity,
    pub caller_seconds: u64,
    pub caller_display: String,
    /// Saves are failing; totals shown are only held in memory.
    pub degraded: bool,
}

impl StatsReport {
    pub fn build(store: &StatsStore, caller: &Identity, limit: usize) -> Self {
        let leaderboard = store
            .leaderboard(limit)
            .into_iter()
            .enumerate()
            .map(|(i, (identity, seconds))| LeaderboardEntry {
                rank: i + 1,
                identity,
                seconds,
                display: format_duration(seconds),
            })
            .collect();
        let caller_seconds = store.total(caller);

        Self {
            leaderboard,
            caller: caller.clone(),
            caller_seconds,
            caller_display: format_duration(caller_seconds),
            degraded: store.is_degraded(),
        }
    }
}

/// "2 hours 5 minutes", or just "5 minutes" under an hour.
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let unit = |n: u64, one: &str, many: &str| {
        if n == 1 {
            format!("{n} {one}")
        } else {
            format!("{n} {many}")
        }
    };

    if hours == 0 {
        unit(minutes, "minute", "minutes")
    } else {
        format!("{} {}", unit(hours, "hour", "hours"), unit(minutes, "minute", "minutes"))
    }
}
