//! Destination routing - logical address to physical queue or topic names.

mod router;

pub use router::{DestinationRouter, ResolvedDestination, RoutingOptions};
