//! Session management: registry of console sessions and their live links.

pub mod link;
pub mod registry;

pub use link::Link;
pub use registry::SessionRegistry;
