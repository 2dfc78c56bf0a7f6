//! Regex-based HTML handling.
//!
//! Neither module parses HTML properly. Upstream pages can be arbitrary or
//! malformed; both degrade to "fewer matches" instead of failing.

pub mod listing;
pub mod rewrite;

pub use listing::{parse_directory_listing, DirectoryEntry, EntryKind};
pub use rewrite::rewrite_root_relative_paths;
