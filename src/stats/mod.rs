mod persister;
pub mod report;
pub mod snapshot;
pub mod store;

pub use report::{format_duration, LeaderboardEntry, StatsReport};
pub use snapshot::{JsonFile, Snapshot, SnapshotPort};
pub use store::StatsStore;
