pub mod backend;
pub mod fixtures;
pub mod latency;

pub use backend::{TestAdapter, TestBackend, TestRemote};
pub use latency::LatencyRemote;
