pub mod error;
pub mod types;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod provider;
pub mod fallback;
pub mod selector;
pub mod service;
pub mod util;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
