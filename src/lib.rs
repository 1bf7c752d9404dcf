// Library entrypoint for the server binary and integration tests.
pub mod api;
pub mod auth;
pub mod config;
pub mod envelope;
pub mod executor;
pub mod result_json;
pub mod session;
pub mod shutdown;
pub mod state;
pub mod storage;

pub use api::build_router;
