//! Persistent plugin registry shared by the Harmoniq plugin scanner and host.
//!
//! The registry holds verified plugin descriptors plus a blacklist of files
//! that crashed or failed a probe. It is persisted as JSON and exchanged
//! between the host and the scan worker through snapshot files.

mod entry;
mod format;
mod pedal;
mod registry;
mod store_json;
mod unverified;

pub use entry::*;
pub use format::*;
pub use pedal::*;
pub use registry::*;
pub use store_json::*;
pub use unverified::*;
