//! Request scheduling glue: picks a channel, picks a key, calls upstream,
//! classifies the outcome, and retries/fails over/fails.

pub mod dispatch;
pub mod select;
pub mod upstream;

pub use dispatch::Scheduler;
pub use upstream::{DispatchRequest, ReqwestUpstream, Upstream, UpstreamCallError, UpstreamResponse};
