//! Message routing in both directions: the outbound dispatcher, the inbound
//! router and the pending-request table that ties responses to requests.

pub(crate) mod dispatcher;
pub mod pending;
pub mod router;

pub use dispatcher::{Destination, Outbound};
pub use pending::{PendingGuard, PendingRequests};
pub use router::{MessageHandler, RouteOutcome, Router};
