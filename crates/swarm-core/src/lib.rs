pub mod config;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod pacing;
pub mod ramp;
pub mod stats;
pub mod swarm;
pub mod tasks;
pub mod user;

pub use config::*;
pub use error::*;
pub use executor::*;
pub use lifecycle::*;
pub use pacing::*;
pub use ramp::*;
pub use stats::*;
pub use swarm::*;
pub use tasks::*;
pub use user::*;
