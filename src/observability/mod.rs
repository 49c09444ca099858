pub mod logger;
pub mod stats;

pub use logger::{EventLog, LogLine};
pub use stats::{install_prometheus, StatsCollector, StatsSnapshot};
