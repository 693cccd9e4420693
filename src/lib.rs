//! vrms - VR multi-scene runtime.
//!
//! Clients hand the server shared-memory descriptors and describe scenes
//! (memory, typed data objects, textures, geometry, meshes, programs, render
//! sets) over a Unix socket. The renderer reads that state straight out of
//! the shared mappings.
//!
//! # Architecture
//!
//! - **Protocol** - request frames in, fixed 8-byte replies out
//! - **Store** - scenes and their objects, validated before every mutation
//! - **Runtime** - the one lock every caller goes through
//! - **Server** - tokio accept loop, one task per connection
//! - **Modules** - background threads feeding head pose, hotplug and scripts
//!
//! # Modules
//!
//! - [`protocol`] - wire codec
//! - [`store`] - object store
//! - [`runtime`] - runtime interface
//! - [`server`] - protocol server
//! - [`modules`] - module host
//! - [`client`] - blocking client library
//! - [`config`] - configuration loading/saving

pub mod client;
pub mod config;
pub mod constants;
pub mod modules;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use runtime::{Runtime, SharedRuntime};
pub use server::{Server, ServerConfig};
pub use store::ObjectStore;
