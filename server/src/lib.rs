pub mod cli;
pub mod config;
pub mod loopback;
pub mod report;

pub use cli::Args;
pub use config::Config;
pub use report::Reporter;
