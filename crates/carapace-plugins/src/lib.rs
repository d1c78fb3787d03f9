//! Tool catalog, plugin manifest/handler contract, and the load/unload/
//! reload sequence that bridges the two. Built-in plugins and
//! out-of-process (user) plugins are both just `Arc<dyn PluginHandler>`
//! values from this crate's point of view — see `host` for the
//! distinction the rest of the workspace draws between them.

pub mod catalog;
pub mod credentials;
pub mod host;
pub mod manifest;

pub use catalog::{CatalogEntry, CatalogError, ToolCatalog};
pub use host::{CoreServices, InvocationContext, LoadFailureCategory, PluginHandler, PluginHost, PluginLoadResult, SessionInfoQuery, SessionLookup};
pub use manifest::{InstallSection, ManifestValidation, PluginManifest, Provides};
