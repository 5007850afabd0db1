//! gRPC services exposed to the application.

pub mod runtime;

pub use runtime::RuntimeService;
