//! Tool metadata cache
//!
//! Discovery results are kept per [`ConnectionKey`](crate::pool::ConnectionKey)
//! for a configurable TTL (30 minutes by default) so repeated `discover_tools`
//! calls do not reach the server. A forced discovery replaces the entry.

mod registry;

pub use registry::{CachedTools, ToolRegistry};
