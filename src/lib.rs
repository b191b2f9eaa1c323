pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod routing;
pub mod runner;
pub mod tokens;
