//! Quartermaster Manager - Request Resolution Engine
//!
//! [`StandardRequestManager`] owns the request graph. Requesters declare
//! needs, resolvers registered by providers compete to satisfy them, and the
//! manager arbitrates: priority order, prerequisite children, cascading
//! cancellation, overrule on provider removal, and save/load through the
//! type registry.

mod manager;
mod persistence;
mod resolution;
mod tick;

pub use manager::StandardRequestManager;
pub use persistence::DOCUMENT_VERSION;
pub use tick::TickReport;

// The trait resolvers program against; re-exported so hosts need one import.
pub use quartermaster_resolvers::RequestManager;
