pub mod config;
pub mod payload;
pub mod retry;
pub mod runner;
pub mod sender;
pub mod stats;
pub mod worker;

pub use config::*;
pub use payload::*;
pub use retry::*;
pub use runner::*;
pub use sender::*;
pub use stats::*;
pub use worker::*;
