//! Health and metrics HTTP endpoint

mod handlers;
mod server;

pub use handlers::HealthResponse;
pub use server::{router, run_server};
