pub mod config;
pub mod server;
pub mod ws;

pub use config::WebConfig;
pub use server::{AppState, router, serve};
