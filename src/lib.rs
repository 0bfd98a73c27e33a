pub mod byzantine;
pub mod client;
pub mod common;
pub mod config;
pub mod context;
pub mod election;
pub mod message;
pub mod monitor;
pub mod multicast;
pub mod server;

pub use client::Client;
pub use config::Config;
pub use context::Context;
pub use monitor::Monitor;
pub use server::Server;
