//! # Controller DB
//!
//! The central data plane of a network-controller instance: authoritative
//! in-memory caches of network and member records, reconciled with a
//! PostgreSQL store of record through a write-behind commit pipeline, fed by
//! pluggable cross-instance change notifications, and draining a high-rate
//! stream of member-liveness reports into a pluggable batched status sink.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Caller Layer                          │
//! │  • save / eraseNetwork / eraseMember / get / nodeIsOnline   │
//! │  • blocked behind the two-phase readiness gate              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  In-Memory Record Caches                    │
//! │  • networks: id → NetworkRecord                             │
//! │  • members: (network, member) → MemberRecord                │
//! │  • always the committed view; reads never touch the store   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                   (write-behind commit queue)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Commit Workers                         │
//! │  • upsert / delete against PostgreSQL                       │
//! │  • (old, new) fan-out to change handlers after success      │
//! │  • cache-side indexes, new-member side effects              │
//! └─────────────────────────────────────────────────────────────┘
//!        ▲                                        │
//!        │ save / erase                           ▼
//! ┌──────────────────┐                 ┌──────────────────────┐
//! │    Listeners     │                 │   Change publisher   │
//! │ pgsql NOTIFY /   │                 │  protobuf → pub/sub  │
//! │ redis streams /  │                 └──────────────────────┘
//! │ pub/sub filter   │
//! └──────────────────┘
//!
//! Separately: nodeIsOnline → liveness map → (10 s tick) → status sink
//! (postgres / redis / bigtable), batched, lossy, at-most one entry per
//! (network, member) per tick.
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use controller_db::{ControllerConfig, ControllerDb, ControllerIdentity};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ControllerConfig {
//!         db_url: "postgres://controller@localhost/central".into(),
//!         ..Default::default()
//!     };
//!     let identity = ControllerIdentity {
//!         address: "deadbeef01".into(),
//!         public: "deadbeef01:0:...".into(),
//!     };
//!
//!     // Connects, verifies the schema, bulk-loads both caches, and starts
//!     // the workers, loops and the configured listener.
//!     let db = ControllerDb::start(config, identity).await.expect("startup");
//!     assert!(db.is_ready());
//!
//!     db.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`db`]: the [`ControllerDb`] façade, commit workers, periodic loops
//! - [`store`]: every SQL statement against the store of record
//! - [`queue`]: the unbounded stop-aware commit queue
//! - [`liveness`]: the swap-on-flush liveness aggregator
//! - [`status`]: the three batched status sinks
//! - [`listener`]: the three change-notification transports
//! - [`wire`]: protobuf change messages for the pub/sub transport
//! - [`publish`]: the optional post-commit change publisher
//! - [`hooks`]: the fire-and-forget member-joined hook

pub mod config;
pub mod db;
pub mod error;
pub mod hooks;
pub mod listener;
pub mod liveness;
pub mod metrics;
pub mod publish;
pub mod queue;
pub mod record;
pub mod status;
pub mod store;
pub mod wire;

pub use config::{BigTableConfig, ControllerConfig, ListenerMode, PubSubConfig, RedisConfig, StatusMode};
pub use db::{AuthInfo, ChangeHandler, ControllerDb, ControllerIdentity, ReadyState};
pub use error::DbError;
pub use record::{CommitItem, MemberId, MemberRecord, NetworkId, NetworkRecord, RecordObject};
pub use status::{PendingStatusEntry, StatusSink};
pub use store::{PgStore, MIN_SCHEMA_VERSION};
pub use wire::{ChangeSource, MemberChange, NetworkChange};
