//! # ioth-module — default implementations for ioth
//!
//! - `HostStack`: the kernel stack, every primitive native
//! - `DynStack`: a C plugin (`ioth_<name>_*` symbols) adapted to `StackBackend`
//! - `LoaderConfig`: module search path and link-map namespaces
//! - `BackendFactory`: static, by-name backend registrations
//! - `Ioth`: stack registry, FD ownership table and dispatch
//! - `IothBuilder`: wires the above together

pub mod builtin;
pub mod config;
pub mod context;
pub mod dynlib;
pub mod fd_table;
pub mod host;
pub mod loader;
pub mod registry;
pub mod stack;

#[cfg(test)]
mod mock;

pub use builtin::BackendFactory;
pub use config::IothBuilder;
pub use host::HostStack;
pub use loader::LoaderConfig;
pub use registry::{DeleteError, Ioth};
pub use stack::{Stack, StackHandle, StackState};
