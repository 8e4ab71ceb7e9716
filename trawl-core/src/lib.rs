//! Trawl Core
//!
//! Shared building blocks for the trawl pipe runner:
//! - Domain types: input records, task markers, alerts
//! - Pipe definitions: the YAML recipes binding an input query to a shell
//!   command to an output transform
//! - Templating: the `${...}` renderer used for commands, idents, output
//!   fields and alert messages
//! - Filter VM: the sandboxed Lua engine evaluating per-line predicates
//! - Net: asset syntax validation and the DNS/CIDR blacklist check

pub mod data;
pub mod filter;
pub mod net;
pub mod pipe;
pub mod template;

pub use data::{map_input, AlertType, Data, Task};
pub use filter::FilterVm;
pub use net::{validate_domain, IpBlacklist};
pub use pipe::Pipe;
