//! Request log persistence, SSE fan-out, and the debug-log table
//! entries, a stats rollup, and a server-sent event stream.

pub mod debug_log;
pub mod error;
pub mod postgres;
pub mod sqlite;
pub mod sse;
pub mod store;

pub use debug_log::{compress_body, decompress_body, mask_headers, DebugLogEntry, DebugLogEntryView};
pub use error::RequestLogError;
pub use postgres::PostgresRequestLogStore;
pub use sqlite::SqliteRequestLogStore;
pub use sse::{LogEvent, LogEventBroadcaster, Subscription};
pub use store::{RequestLogFilter, RequestLogStats, RequestLogStore};
