//! Construction, bulk initialization and shutdown.
//!
//! Startup sequence:
//!
//! 1. Validate configuration, connect the store, verify the schema version
//!    (too old is fatal).
//! 2. Connect the cache and select the status-sink variant.
//! 3. Construct the outbound member-joined hook when the environment
//!    configures one.
//! 4. Bulk-load networks, then members, raising the readiness gate after
//!    each phase. A store failure here is fatal: without the initial view
//!    the controller cannot answer authoritatively, so the process exits
//!    after a brief pause.
//! 5. Start the commit workers, the heartbeat loop and the
//!    online-notification loop, then exactly one listener variant, then the
//!    optional change publisher.
//!
//! Shutdown is cooperative: cancel the token, give loops a beat to observe
//! it, stop the commit queue (which wakes every worker), then join
//! everything.

use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ControllerConfig, ListenerMode, StatusMode};
use crate::error::DbError;
use crate::hooks::{HookTarget, MemberJoinedHook};
use crate::listener;
use crate::liveness::LivenessMap;
use crate::publish::ChangePublisher;
use crate::queue::CommitQueue;
use crate::status::bigtable::BigTableStatusSink;
use crate::status::postgres::PostgresStatusSink;
use crate::status::redis::RedisStatusSink;
use crate::status::StatusSink;
use crate::store::PgStore;

use super::{parse_sso_psk, ControllerDb, ControllerIdentity, ReadyState};

impl ControllerDb {
    /// Convenience one-shot: connect, bulk-load and start the data plane.
    ///
    /// Split into [`connect`](Self::connect) + [`run`](Self::run) when a
    /// change handler must observe the bulk-load events.
    pub async fn start(
        config: ControllerConfig,
        identity: ControllerIdentity,
    ) -> Result<Arc<Self>, DbError> {
        let db = Self::connect(config, identity).await?;
        db.run().await?;
        Ok(db)
    }

    /// Connect every backend and assemble the façade without loading or
    /// starting anything. The readiness gate stays at `Uninitialized` until
    /// [`run`](Self::run).
    pub async fn connect(
        config: ControllerConfig,
        identity: ControllerIdentity,
    ) -> Result<Arc<Self>, DbError> {
        config.validate()?;

        let store = PgStore::connect(&config).await?;
        let cancel = CancellationToken::new();

        let redis_member_status = std::env::var("ZT_REDIS_MEMBER_STATUS")
            .map(|v| v == "true")
            .unwrap_or(false);
        if redis_member_status && config.redis.is_none() {
            warn!("ZT_REDIS_MEMBER_STATUS set but no redis configuration; side indexes disabled");
        }

        let needs_redis = config.redis.is_some()
            && (config.listen_mode == ListenerMode::Redis
                || config.status_mode == StatusMode::Redis
                || redis_member_status);
        let redis = if needs_redis {
            let redis_config = config.redis.as_ref().expect("checked above");
            let client = redis::Client::open(redis_config.url())?;
            let manager_config = ConnectionManagerConfig::new()
                .set_connection_timeout(Duration::from_secs(3))
                .set_response_timeout(Duration::from_secs(5));
            let connection = ConnectionManager::new_with_config(client, manager_config).await?;
            info!(host = %redis_config.hostname, cluster = redis_config.cluster_mode, "cache connected");
            Some(connection)
        } else {
            None
        };

        let status_sink: Arc<dyn StatusSink> = match config.status_mode {
            StatusMode::Pgsql => Arc::new(PostgresStatusSink::new(store.clone())),
            StatusMode::Redis => Arc::new(RedisStatusSink::new(
                redis.clone().expect("validated redis config"),
                &identity.address,
            )),
            StatusMode::Bigtable => Arc::new(
                BigTableStatusSink::connect(config.big_table.as_ref().expect("validated bigtable config"))
                    .await?,
            ),
        };

        let mut startup_tasks = Vec::new();
        let member_joined = match HookTarget::from_env() {
            Some(target) => match MemberJoinedHook::start(target, cancel.clone()).await {
                Some((hook, worker)) => {
                    startup_tasks.push(worker);
                    Some(hook)
                }
                None => None,
            },
            None => {
                info!("member-joined hook not configured");
                None
            }
        };

        let sso_psk = std::env::var("ZT_SSO_PSK")
            .map(|hex| parse_sso_psk(&hex))
            .unwrap_or([0u8; 48]);

        let (ready_tx, ready_rx) = watch::channel(ReadyState::Uninitialized);

        let db = Arc::new(Self {
            config,
            identity,
            store,
            networks: Default::default(),
            members: Default::default(),
            commit_queue: CommitQueue::new(),
            liveness: LivenessMap::new(),
            status_sink,
            redis,
            redis_member_status,
            handlers: Default::default(),
            member_joined,
            ready_tx,
            ready_rx,
            sso_psk,
            cancel,
            tasks: parking_lot::Mutex::new(startup_tasks),
            listener: parking_lot::Mutex::new(None),
        });

        Ok(db)
    }

    /// Bulk-load both caches and start the background machinery.
    pub async fn run(self: &Arc<Self>) -> Result<(), DbError> {
        info!(
            controller_id = %self.identity.address,
            "waiting for initial data download"
        );
        if let Err(e) = self.bulk_initialize().await {
            // Intentional: a controller without its initial view must not
            // serve. The pause gives log shippers a chance to flush.
            error!(error = %e, "fatal error during bulk initialization");
            tokio::time::sleep(Duration::from_secs(5)).await;
            std::process::exit(1);
        }
        info!(
            controller_id = %self.identity.address,
            networks = self.network_count(),
            members = self.member_count(),
            "initial data download complete"
        );

        self.spawn_background().await
    }

    async fn bulk_initialize(self: &Arc<Self>) -> Result<(), DbError> {
        self.initialize_networks().await?;
        self.initialize_members().await?;
        Ok(())
    }

    async fn initialize_networks(self: &Arc<Self>) -> Result<(), DbError> {
        let phase_start = Instant::now();
        info!("loading networks from store");

        let networks = self.store.load_networks(self.controller_id()).await?;
        let count = networks.len() as u64;
        for rec in networks {
            self.insert_network_cache(rec.clone());
            self.notify_network_changed(None, Some(&rec));
        }

        crate::metrics::record_init_phase("networks", count, phase_start.elapsed());
        self.advance_ready(ReadyState::NetworksLoaded);
        info!(count, "network load complete");
        Ok(())
    }

    async fn initialize_members(self: &Arc<Self>) -> Result<(), DbError> {
        let phase_start = Instant::now();
        info!("loading members from store");

        if self.redis.is_some() && self.redis_member_status {
            self.clear_member_side_index().await;
        }

        let members = self.store.load_members(self.controller_id()).await?;
        let count = members.len() as u64;
        let mut network_members: Vec<(String, String)> = Vec::with_capacity(members.len());
        for rec in members {
            if let (Some(network_id), Some(member_id)) = (rec.nwid, rec.id) {
                network_members.push((network_id.to_string(), member_id.to_string()));
            }
            self.insert_member_cache(rec.clone());
            self.notify_member_changed(None, Some(&rec));
        }

        if self.redis.is_some() && self.redis_member_status && !network_members.is_empty() {
            self.warm_member_side_index(&network_members).await;
        }

        crate::metrics::record_init_phase("members", count, phase_start.elapsed());
        self.advance_ready(ReadyState::FullyReady);
        info!(count, "member load complete");
        Ok(())
    }

    /// Drop the per-network membership sets before repopulating them; a
    /// previous run may have left members that no longer exist.
    async fn clear_member_side_index(&self) {
        let Some(connection) = self.redis.clone() else { return };
        let cid = self.controller_id();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for network_id in self.network_ids() {
            pipe.del(format!("network-nodes-all:{{{cid}}}:{network_id}")).ignore();
        }

        let mut conn = connection;
        if let Err(e) = pipe.query_async::<()>(&mut conn).await {
            warn!(error = %e, "failed to clear member side index");
        }
    }

    /// Repopulate `network-nodes-all:{cid}:<network>` in bounded pipelines.
    async fn warm_member_side_index(&self, network_members: &[(String, String)]) {
        const CHUNK: usize = 30_000;
        let Some(connection) = self.redis.clone() else { return };
        let cid = self.controller_id();

        info!(members = network_members.len(), "loading member data into cache");
        let mut conn = connection;
        for chunk in network_members.chunks(CHUNK) {
            let mut pipe = redis::pipe();
            pipe.atomic();
            for (network_id, member_id) in chunk {
                pipe.sadd(format!("network-nodes-all:{{{cid}}}:{network_id}"), member_id)
                    .ignore();
            }
            if let Err(e) = pipe.query_async::<()>(&mut conn).await {
                warn!(error = %e, "failed to warm member side index chunk");
                return;
            }
        }
    }

    /// Start workers, periodic loops, the listener variant and the optional
    /// publisher. Runs strictly after bulk init so no worker can fan out a
    /// load as if it were an insert.
    async fn spawn_background(self: &Arc<Self>) -> Result<(), DbError> {
        let mut tasks = Vec::new();

        for worker in 0..self.config.commit_workers {
            let db = self.clone();
            tasks.push(tokio::spawn(async move {
                super::commit::commit_worker(db, worker).await;
            }));
        }

        {
            let db = self.clone();
            tasks.push(tokio::spawn(async move {
                super::loops::heartbeat_loop(db).await;
            }));
        }
        {
            let db = self.clone();
            tasks.push(tokio::spawn(async move {
                super::loops::online_notification_loop(db).await;
            }));
        }

        let handle = match self.config.listen_mode {
            ListenerMode::Pgsql => listener::pgsql::start(
                self.clone(),
                self.store.pool().clone(),
                self.controller_id(),
            ),
            ListenerMode::Redis => {
                // Dedicated connections per stream: XREAD BLOCK must not
                // ride the shared managed connection.
                let redis_config = self.config.redis.as_ref().expect("validated redis config");
                let client = redis::Client::open(redis_config.url())?;
                listener::redis::start(self.clone(), client, self.controller_id())
            }
            ListenerMode::Pubsub => {
                let pub_sub = self.config.pub_sub.as_ref().expect("validated pubsub config");
                let client = listener::pubsub::client(pub_sub).await?;
                listener::pubsub::start(self.clone(), client, pub_sub, self.controller_id())
            }
        };
        *self.listener.lock() = Some(handle);

        if let Some(pub_sub) = self.config.pub_sub.as_ref() {
            let client = listener::pubsub::client(pub_sub).await?;
            let (publisher, worker) = ChangePublisher::start(
                client,
                pub_sub,
                self.controller_id(),
                pub_sub.frontend.clone(),
                self.cancel.clone(),
            );
            self.register_change_handler(publisher);
            tasks.push(worker);
        }

        self.tasks.lock().extend(tasks);
        Ok(())
    }

    /// Cooperative shutdown: cancel, let loops notice, stop the queue, join
    /// everything, stop the listener.
    pub async fn shutdown(&self) {
        info!("controller db shutting down");
        self.cancel.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.commit_queue.stop();

        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.stop().await;
        }

        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock();
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("controller db shutdown complete");
    }
}
