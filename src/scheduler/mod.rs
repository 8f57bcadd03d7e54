pub mod node;
pub mod service;

pub use node::JobState;
pub use service::{DepJobService, JobStats};
