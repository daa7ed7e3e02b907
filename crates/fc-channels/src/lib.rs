//! Channel pool storage and selection.
//!
//! Three independent pools (messages/responses/gemini) of [`Channel`]s are
//! held behind a [`ChannelStore`], backed by either a JSON file
//! ([`FileChannelStore`]) or Postgres ([`DbChannelStore`]). Both backends
//! share the same mutation semantics via [`mutations`], so behavior never
//! diverges between the two.
//!
//! [`cooldown`] tracks per-key failure state, [`load_balancer`] turns that
//! plus a [`fc_common::LoadBalanceStrategy`] into a concrete key pick, and
//! [`composite`] resolves composite channels to a concrete target channel
//! and effective model.

pub mod composite;
pub mod cooldown;
pub mod db_store;
pub mod document;
pub mod error;
pub mod file_store;
pub mod load_balancer;
pub mod mutations;
pub mod store;

pub use composite::{resolve as resolve_composite, ResolvedTarget};
pub use cooldown::{spawn_reaper as spawn_cooldown_reaper, CooldownConfig, KeyCooldownCache};
pub use db_store::DbChannelStore;
pub use document::GatewayDocument;
pub use error::ChannelStoreError;
pub use file_store::FileChannelStore;
pub use load_balancer::LoadBalancer;
pub use mutations::{ChannelPatch, UpdateOutcome};
pub use store::ChannelStore;
