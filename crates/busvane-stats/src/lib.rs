mod rate;
mod store;

pub use rate::{scale_bandwidth, BandwidthUnit, RateComputer, RateReport, RateSample};
pub use store::{StatsStore, StoreSnapshot, TopicStats};
