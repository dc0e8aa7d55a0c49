//! Remote compilation: materializes client-supplied sources in an isolated
//! workspace, runs the toolchain against a trusted recipe, and optionally
//! forwards the produced artifact to a storage server.
mod builder;
mod config;
mod errors;
mod request;
mod service;
mod upload;
mod workspace;

pub mod recipe;
pub mod sandbox;

pub use builder::Builder;
pub use config::ServiceArgs;
pub use errors::Error;
pub use request::{CompileFile, CompileRequest, CompileResult};
pub use service::CompileService;
pub use upload::Uploader;
pub use workspace::Workspace;
