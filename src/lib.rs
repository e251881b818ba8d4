pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod exceptions;
pub mod handlers;
pub mod maintenance;
pub mod overage;
pub mod resolver;
pub mod server;
pub mod status;
pub mod tiers;
pub mod usage;

pub use config::Config;
pub use engine::{QuotaEngine, RateLimitDecision};
pub use error::{Error, Result};
pub use server::{build_state, create_app};
