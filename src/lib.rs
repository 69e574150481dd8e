pub mod cache;
pub mod clock;
pub mod config;
pub mod decision;
pub mod error;
pub mod http;
pub mod models;
pub mod pipeline;
pub mod quota;
pub mod storage;
pub mod upstream;
pub mod utils;

pub use cache::{CacheOutcome, ResultCacheService, Source};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use decision::{Decision, DecisionEngine, InterventionLevel};
pub use error::{CounterpointError, Result};
pub use pipeline::{AnalysisPipeline, Caller};
