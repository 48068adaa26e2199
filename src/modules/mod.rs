//! Module catalog and runtimes

pub mod catalog;
pub mod http;
pub mod local;
pub mod runtime;

pub use catalog::{ModuleCatalog, ModuleSpec};
pub use http::HttpModuleRuntime;
pub use local::LocalModuleRuntime;
pub use runtime::{ModuleHandle, ModuleHealth, ModuleRuntime};
