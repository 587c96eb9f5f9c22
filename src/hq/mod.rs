//! Multi-server federation (C12): a server can run as an HQ aggregating
//! remotes' sessions, or as a remote registering outward with an HQ, per
//! `[hq]` in the configuration.

pub mod protocol;
pub mod relay;
pub mod remote;

pub use protocol::{HqMessage, HqRequestBody, HqResponseBody};
pub use relay::{hq_router, HqState};
pub use remote::spawn as spawn_remote;
