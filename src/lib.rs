#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! relay-tunnel library: exposes a local HTTP/WebSocket service through a
//! relay tunnel.
//!
//! - `dispatcher` - per-tunnel orchestrator (open/close lifecycle)
//! - `routing` - request classification
//! - `proxy` - HTTP forwarding, header policy, WebSocket bridging
//! - `html` - directory-listing parser and root-relative path rewriter
//! - `transport` - relay listener capability (Hybrid Connections, local)
//! - `provisioning` - dynamic relay resource management
//! - `config` - configuration loading
//! - `credentials`, `assets`, `descriptor` - collaborators and identity types

pub mod assets;
pub mod config;
pub mod credentials;
pub mod descriptor;
pub mod dispatcher;
pub mod html;
pub mod provisioning;
pub mod proxy;
pub mod routing;
pub mod transport;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use descriptor::{TunnelDescriptor, UpstreamTarget};
pub use dispatcher::{DispatchError, DispatcherOptions, DispatcherService, ServiceState};
pub use routing::RouteDecision;
