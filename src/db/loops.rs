//! Periodic loops: controller heartbeat and the online-notification flush.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::liveness::now_ms;
use crate::status::{split_os_arch, PendingStatusEntry};

use super::ControllerDb;

/// Once per second, assert this controller's existence and version in the
/// controllers table, and in the cache's controller set when the side
/// indexes are enabled.
pub(super) async fn heartbeat_loop(db: Arc<ControllerDb>) {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    // Short hostname only, as it would appear in an ops dashboard.
    let host = host.split('.').next().unwrap_or("").to_string();
    let version = format!("v{}", env!("CARGO_PKG_VERSION"));

    let mut interval = tokio::time::interval(Duration::from_secs(db.config.heartbeat_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = db.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let ts = now_ms();
        match db
            .store
            .upsert_controller_heartbeat(
                db.controller_id(),
                &host,
                ts,
                &db.identity.public,
                &version,
            )
            .await
        {
            Ok(()) => crate::metrics::record_heartbeat("success"),
            Err(e) => {
                warn!(error = %e, "heartbeat update failed");
                crate::metrics::record_heartbeat("error");
                continue;
            }
        }

        if db.redis_member_status {
            if let Some(connection) = db.redis.clone() {
                let mut conn = connection;
                let result: Result<i64, redis::RedisError> = redis::cmd("ZADD")
                    .arg("controllers")
                    .arg(ts)
                    .arg(db.controller_id())
                    .query_async(&mut conn)
                    .await;
                if let Err(e) = result {
                    warn!(error = %e, "cache error in heartbeat loop");
                }
            }
        }
    }
    info!("heartbeat loop exited");
}

/// Every flush interval, swap out the liveness map and push the surviving
/// reports into the status sink, then flush the sink once.
pub(super) async fn online_notification_loop(db: Arc<ControllerDb>) {
    db.wait_for_ready().await;

    let mut interval =
        tokio::time::interval(Duration::from_secs(db.config.online_flush_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; consume it so
    // the first flush happens one full interval after readiness.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = db.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let last_online = db.liveness.swap();
        if last_online.is_empty() {
            continue;
        }

        let mut delivered = 0usize;
        let mut skipped = 0usize;
        for ((network_id, member_id), report) in last_online {
            // Skip pairs we no longer hold; deletion raced the report.
            if db.get_member(network_id, member_id).is_none() {
                skipped += 1;
                continue;
            }
            match db.store.member_online_pair_exists(network_id, member_id).await {
                Ok(true) => {}
                Ok(false) => {
                    skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(network_id = %network_id, member_id = %member_id, error = %e,
                        "online flush existence check failed");
                    skipped += 1;
                    continue;
                }
            }

            let (os, arch) = split_os_arch(&report.os_arch);
            db.status_sink.update_node_status(PendingStatusEntry {
                network_id,
                member_id,
                os,
                arch,
                version: report.version.clone(),
                address: report.physical_address,
                last_seen: report.last_seen,
            });
            delivered += 1;
        }

        debug!(delivered, skipped, "online status delivered to sink");
        db.status_sink.write_pending().await;
    }
    info!("online notification loop exited");
}
