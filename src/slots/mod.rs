pub mod pool;
pub mod session;
pub mod types;

pub use pool::SlotPool;
pub use session::SlotSession;
pub use types::{ResizeReport, SessionState, SlotId, SlotStatus, Tenure};
