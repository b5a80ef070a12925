//! gRPC service implementations.

pub mod api;
pub mod status;

pub use api::TransferApiService;
pub use status::StatusHandler;
