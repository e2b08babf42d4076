pub mod audit;
pub mod devices;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod middleware;
pub mod routes;
pub mod snapshots;

pub use routes::create_router;
