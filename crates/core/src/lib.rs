pub mod clock;
pub mod config;
pub mod conversation;
pub mod cron;
pub mod drafts;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod notify;
pub mod pipeline;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OutreachCfg;
pub use error::StoreError;
