// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! PostgreSQL store of record.
//!
//! Every SQL statement the data plane issues lives here: schema version
//! check, the two bulk-load queries, the commit-side upserts and deletes,
//! the heartbeat row, the member-status upsert used by the relational sink,
//! and the SSO nonce/client lookups.
//!
//! Timestamps cross the wire as epoch milliseconds in both directions: reads
//! extract `EPOCH * 1000` as bigint, writes go through
//! `TO_TIMESTAMP($n::double precision / 1000)`. The in-process
//! representation is always `i64` ms.
//!
//! The pool is deliberately small (15 connections, 5 idle) and borrows fail
//! after a 3 second wait rather than queueing forever; a failed borrow is
//! reported as [`DbError::PoolExhausted`] and the caller drops the operation
//! until its next tick.

use std::time::Duration;

use serde_json::json;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::DbError;
use crate::record::{MemberId, MemberRecord, NetworkId, NetworkRecord};

/// Minimum schema version of the store this build can speak to.
pub const MIN_SCHEMA_VERSION: i32 = 38;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and verify the schema version. Fails fast: an old schema is
    /// fatal at startup, there is no degraded mode.
    pub async fn connect(config: &ControllerConfig) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_max_connections)
            .min_connections(config.pool_min_connections)
            .acquire_timeout(Duration::from_secs(config.pool_acquire_timeout_secs))
            .connect(&config.db_url)
            .await
            .map_err(DbError::from_store)?;

        let store = Self { pool };
        let version = store.schema_version().await?;
        if version < MIN_SCHEMA_VERSION {
            return Err(DbError::SchemaTooOld {
                found: version,
                required: MIN_SCHEMA_VERSION,
            });
        }
        info!(schema_version = version, "store of record connected");
        Ok(store)
    }

    /// Access the underlying pool (notification listeners ride on it).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn schema_version(&self) -> Result<i32, DbError> {
        let row = sqlx::query("SELECT version FROM ztc_database")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from_store)?;
        row.try_get::<i32, _>("version").map_err(DbError::from_store)
    }

    // ------------------------------------------------------------------
    // Bulk load
    // ------------------------------------------------------------------

    /// Load every network owned by this controller, normalized.
    pub async fn load_networks(&self, controller_id: &str) -> Result<Vec<NetworkRecord>, DbError> {
        let rows = sqlx::query(
            "SELECT id, name, configuration, \
             (EXTRACT(EPOCH FROM creation_time AT TIME ZONE 'UTC')*1000)::bigint AS creation_time, \
             (EXTRACT(EPOCH FROM last_modified AT TIME ZONE 'UTC')*1000)::bigint AS last_modified, \
             revision \
             FROM networks_ctl WHERE controller_id = $1",
        )
        .bind(controller_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from_store)?;

        let mut networks = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id").map_err(DbError::from_store)?;
            let configuration: String = row.try_get("configuration").map_err(DbError::from_store)?;

            let mut cfg: serde_json::Value =
                serde_json::from_str(&configuration).unwrap_or_else(|_| json!({}));
            cfg["id"] = json!(id);
            cfg["name"] = json!(row
                .try_get::<Option<String>, _>("name")
                .unwrap_or(None)
                .unwrap_or_default());
            cfg["creationTime"] =
                json!(row.try_get::<Option<i64>, _>("creation_time").unwrap_or(None).unwrap_or(0));
            cfg["lastModified"] =
                json!(row.try_get::<Option<i64>, _>("last_modified").unwrap_or(None).unwrap_or(0));
            cfg["revision"] =
                json!(row.try_get::<Option<i64>, _>("revision").unwrap_or(None).unwrap_or(0));

            match NetworkRecord::from_json(&cfg) {
                Some(rec) => networks.push(rec),
                None => warn!(network_id = %id, "skipping network row with unparseable id"),
            }
        }
        Ok(networks)
    }

    /// Load every membership joined to a network owned by this controller.
    pub async fn load_members(&self, controller_id: &str) -> Result<Vec<MemberRecord>, DbError> {
        let rows = sqlx::query(
            "SELECT nm.device_id, nm.network_id, nm.authorized, nm.active_bridge, nm.ip_assignments, \
             nm.no_auto_assign_ips, nm.sso_exempt, \
             (EXTRACT(EPOCH FROM nm.authentication_expiry_time AT TIME ZONE 'UTC')*1000)::bigint AS authentication_expiry_time, \
             (EXTRACT(EPOCH FROM nm.creation_time AT TIME ZONE 'UTC')*1000)::bigint AS creation_time, \
             nm.identity, \
             (EXTRACT(EPOCH FROM nm.last_authorized_time AT TIME ZONE 'UTC')*1000)::bigint AS last_authorized_time, \
             (EXTRACT(EPOCH FROM nm.last_deauthorized_time AT TIME ZONE 'UTC')*1000)::bigint AS last_deauthorized_time, \
             nm.remote_trace_level, nm.remote_trace_target, nm.revision, nm.capabilities, nm.tags, \
             nm.version_major, nm.version_minor, nm.version_revision, nm.version_protocol \
             FROM network_memberships_ctl nm \
             INNER JOIN networks_ctl n ON nm.network_id = n.id \
             WHERE n.controller_id = $1",
        )
        .bind(controller_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from_store)?;

        let mut members = Vec::with_capacity(rows.len());
        for row in rows {
            let device_id: String = row.try_get("device_id").map_err(DbError::from_store)?;
            let network_id: String = row.try_get("network_id").map_err(DbError::from_store)?;

            let identity: Option<String> = row.try_get("identity").unwrap_or(None);
            let capabilities: Option<String> = row.try_get("capabilities").unwrap_or(None);
            let tags: Option<String> = row.try_get("tags").unwrap_or(None);

            let cfg = json!({
                "id": device_id,
                "nwid": network_id,
                "identity": identity,
                "address": identity,
                "authorized": row.try_get::<bool, _>("authorized").unwrap_or(false),
                "activeBridge": row.try_get::<Option<bool>, _>("active_bridge").unwrap_or(None).unwrap_or(false),
                "ipAssignments": row.try_get::<Option<Vec<String>>, _>("ip_assignments").unwrap_or(None).unwrap_or_default(),
                "noAutoAssignIps": row.try_get::<Option<bool>, _>("no_auto_assign_ips").unwrap_or(None).unwrap_or(false),
                "ssoExempt": row.try_get::<Option<bool>, _>("sso_exempt").unwrap_or(None).unwrap_or(false),
                "authenticationExpiryTime": row.try_get::<Option<i64>, _>("authentication_expiry_time").unwrap_or(None).unwrap_or(0),
                "creationTime": row.try_get::<Option<i64>, _>("creation_time").unwrap_or(None).unwrap_or(0),
                "lastAuthorizedTime": row.try_get::<Option<i64>, _>("last_authorized_time").unwrap_or(None).unwrap_or(0),
                "lastDeauthorizedTime": row.try_get::<Option<i64>, _>("last_deauthorized_time").unwrap_or(None).unwrap_or(0),
                "remoteTraceLevel": row.try_get::<Option<i32>, _>("remote_trace_level").unwrap_or(None).unwrap_or(0),
                "remoteTraceTarget": row.try_get::<Option<String>, _>("remote_trace_target").unwrap_or(None),
                "revision": row.try_get::<Option<i64>, _>("revision").unwrap_or(None).unwrap_or(0),
                "capabilities": serde_json::from_str::<serde_json::Value>(capabilities.as_deref().unwrap_or("[]")).unwrap_or_else(|_| json!([])),
                "tags": serde_json::from_str::<serde_json::Value>(tags.as_deref().unwrap_or("[]")).unwrap_or_else(|_| json!([])),
                "vMajor": row.try_get::<Option<i32>, _>("version_major").unwrap_or(None).unwrap_or(-1),
                "vMinor": row.try_get::<Option<i32>, _>("version_minor").unwrap_or(None).unwrap_or(-1),
                "vRev": row.try_get::<Option<i32>, _>("version_revision").unwrap_or(None).unwrap_or(-1),
                "vProto": row.try_get::<Option<i32>, _>("version_protocol").unwrap_or(None).unwrap_or(-1),
            });

            match MemberRecord::from_json(&cfg) {
                Some(rec) => members.push(rec),
                None => warn!(
                    network_id = %network_id,
                    member_id = %device_id,
                    "skipping membership row with unparseable ids"
                ),
            }
        }
        Ok(members)
    }

    // ------------------------------------------------------------------
    // Commit-side mutations
    // ------------------------------------------------------------------

    /// Upsert a network row.
    ///
    /// The enqueue side already bumped the revision; the conflict arm's
    /// GREATEST is a safety increment that keeps the stored revision
    /// advancing even when a racing writer delivered a stale one. Members
    /// have no store-side bump and rely on the enqueue-side one alone.
    pub async fn upsert_network(
        &self,
        rec: &NetworkRecord,
        controller_id: &str,
    ) -> Result<(), DbError> {
        let id = rec.id.map(|n| n.to_string()).unwrap_or_default();
        let configuration = serde_json::to_string(&rec.to_json()).unwrap_or_else(|_| "{}".into());
        sqlx::query(
            "INSERT INTO networks_ctl (id, name, configuration, controller_id, revision) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO UPDATE SET \
             name = EXCLUDED.name, configuration = EXCLUDED.configuration, \
             revision = GREATEST(networks_ctl.revision + 1, EXCLUDED.revision)",
        )
        .bind(&id)
        .bind(&rec.name)
        .bind(&configuration)
        .bind(controller_id)
        .bind(rec.revision as i64)
        .execute(&self.pool)
        .await
        .map_err(DbError::from_store)?;
        debug!(network_id = %id, revision = rec.revision, "network upserted");
        Ok(())
    }

    /// Whether the owning network exists on the Central side. Member commits
    /// for unknown networks are dropped.
    pub async fn network_exists(&self, network_id: NetworkId) -> Result<bool, DbError> {
        let row = sqlx::query("SELECT COUNT(id) AS n FROM ztc_network WHERE id = $1")
            .bind(network_id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from_store)?;
        Ok(row.try_get::<i64, _>("n").map_err(DbError::from_store)? == 1)
    }

    /// Whether the member row already exists; a zero count marks a brand-new
    /// member (the commit worker fires the joined hook for those).
    pub async fn member_exists(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
    ) -> Result<bool, DbError> {
        let row =
            sqlx::query("SELECT COUNT(id) AS n FROM ztc_member WHERE id = $1 AND network_id = $2")
                .bind(member_id.to_string())
                .bind(network_id.to_string())
                .fetch_one(&self.pool)
                .await
                .map_err(DbError::from_store)?;
        Ok(row.try_get::<i64, _>("n").map_err(DbError::from_store)? > 0)
    }

    pub async fn upsert_member(&self, rec: &MemberRecord) -> Result<(), DbError> {
        let member_id = rec.id.map(|m| m.to_string()).unwrap_or_default();
        let network_id = rec.nwid.map(|n| n.to_string()).unwrap_or_default();
        let capabilities = serde_json::to_string(&rec.capabilities).unwrap_or_else(|_| "[]".into());
        let tags = serde_json::to_string(&rec.tags).unwrap_or_else(|_| "[]".into());

        sqlx::query(
            "INSERT INTO network_memberships_ctl (device_id, network_id, authorized, active_bridge, \
             ip_assignments, no_auto_assign_ips, sso_exempt, authentication_expiry_time, capabilities, \
             creation_time, identity, last_authorized_time, last_deauthorized_time, \
             remote_trace_level, remote_trace_target, revision, tags, version_major, version_minor, \
             version_revision, version_protocol) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, TO_TIMESTAMP($8::double precision/1000), $9, \
             TO_TIMESTAMP($10::double precision/1000), $11, TO_TIMESTAMP($12::double precision/1000), \
             TO_TIMESTAMP($13::double precision/1000), $14, $15, $16, $17, $18, $19, $20, $21) \
             ON CONFLICT (device_id, network_id) DO UPDATE SET \
             authorized = EXCLUDED.authorized, active_bridge = EXCLUDED.active_bridge, \
             ip_assignments = EXCLUDED.ip_assignments, no_auto_assign_ips = EXCLUDED.no_auto_assign_ips, \
             sso_exempt = EXCLUDED.sso_exempt, \
             authentication_expiry_time = EXCLUDED.authentication_expiry_time, \
             capabilities = EXCLUDED.capabilities, creation_time = EXCLUDED.creation_time, \
             identity = EXCLUDED.identity, last_authorized_time = EXCLUDED.last_authorized_time, \
             last_deauthorized_time = EXCLUDED.last_deauthorized_time, \
             remote_trace_level = EXCLUDED.remote_trace_level, \
             remote_trace_target = EXCLUDED.remote_trace_target, \
             revision = EXCLUDED.revision, tags = EXCLUDED.tags, \
             version_major = EXCLUDED.version_major, version_minor = EXCLUDED.version_minor, \
             version_revision = EXCLUDED.version_revision, version_protocol = EXCLUDED.version_protocol",
        )
        .bind(&member_id)
        .bind(&network_id)
        .bind(rec.authorized)
        .bind(rec.active_bridge)
        .bind(&rec.ip_assignments)
        .bind(rec.no_auto_assign_ips)
        .bind(rec.sso_exempt)
        .bind(rec.authentication_expiry_time)
        .bind(&capabilities)
        .bind(rec.creation_time)
        .bind(rec.identity.as_deref().unwrap_or(""))
        .bind(rec.last_authorized_time)
        .bind(rec.last_deauthorized_time)
        .bind(rec.remote_trace_level)
        .bind(rec.remote_trace_target.as_deref())
        .bind(rec.revision as i64)
        .bind(&tags)
        .bind(rec.v_major)
        .bind(rec.v_minor)
        .bind(rec.v_rev)
        .bind(rec.v_proto)
        .execute(&self.pool)
        .await
        .map_err(DbError::from_store)?;
        debug!(network_id = %network_id, member_id = %member_id, "member upserted");
        Ok(())
    }

    /// Drop stale per-IP assignment rows for a member that already existed;
    /// the authoritative list now lives on the membership row.
    pub async fn delete_stale_ip_assignments(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
    ) -> Result<(), DbError> {
        sqlx::query("DELETE FROM ztc_member_ip_assignment WHERE member_id = $1 AND network_id = $2")
            .bind(member_id.to_string())
            .bind(network_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from_store)?;
        Ok(())
    }

    /// Delete a network and all of its memberships in one transaction.
    pub async fn delete_network(&self, network_id: NetworkId) -> Result<(), DbError> {
        let id = network_id.to_string();
        let mut tx = self.pool.begin().await.map_err(DbError::from_store)?;
        sqlx::query("DELETE FROM network_memberships_ctl WHERE network_id = $1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from_store)?;
        sqlx::query("DELETE FROM networks_ctl WHERE id = $1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from_store)?;
        tx.commit().await.map_err(DbError::from_store)?;
        info!(network_id = %id, "network deleted");
        Ok(())
    }

    pub async fn delete_member(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
    ) -> Result<(), DbError> {
        sqlx::query(
            "DELETE FROM network_memberships_ctl WHERE device_id = $1 AND network_id = $2",
        )
        .bind(member_id.to_string())
        .bind(network_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from_store)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Heartbeat and liveness
    // ------------------------------------------------------------------

    pub async fn upsert_controller_heartbeat(
        &self,
        controller_id: &str,
        host: &str,
        timestamp_ms: i64,
        public_identity: &str,
        version: &str,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO controllers_ctl (id, hostname, last_heartbeat, public_identity, version) \
             VALUES ($1, $2, TO_TIMESTAMP($3::double precision/1000), $4, $5) \
             ON CONFLICT (id) DO UPDATE SET hostname = EXCLUDED.hostname, \
             last_heartbeat = EXCLUDED.last_heartbeat, \
             public_identity = EXCLUDED.public_identity, version = EXCLUDED.version",
        )
        .bind(controller_id)
        .bind(host)
        .bind(timestamp_ms)
        .bind(public_identity)
        .bind(version)
        .execute(&self.pool)
        .await
        .map_err(DbError::from_store)?;
        Ok(())
    }

    /// Whether the (network, member) pair still exists on the Central side.
    /// Used by the liveness flush; vanished pairs skip silently.
    pub async fn member_online_pair_exists(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
    ) -> Result<bool, DbError> {
        let row = sqlx::query(
            "SELECT id FROM ztc_member WHERE network_id = $1 AND id = $2",
        )
        .bind(network_id.to_string())
        .bind(member_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from_store)?;
        Ok(row.is_some())
    }

    /// Membership existence pre-check for the relational status sink.
    pub async fn membership_exists(
        &self,
        network_id: &str,
        member_id: &str,
    ) -> Result<bool, DbError> {
        let row = sqlx::query(
            "SELECT device_id FROM network_memberships_ctl \
             WHERE device_id = $1 AND network_id = $2",
        )
        .bind(member_id)
        .bind(network_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from_store)?;
        Ok(row.is_some())
    }

    /// Upsert one batched liveness record (relational status sink).
    pub async fn upsert_member_status(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        network_id: &str,
        member_id: &str,
        os: &str,
        arch: &str,
        version: &str,
        address: &str,
        last_seen_ms: i64,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO member_status_ctl (network_id, device_id, os, arch, version, address, last_seen) \
             VALUES ($1, $2, $3, $4, $5, $6, TO_TIMESTAMP($7::double precision/1000)) \
             ON CONFLICT (device_id, network_id) DO UPDATE SET \
             os = EXCLUDED.os, arch = EXCLUDED.arch, version = EXCLUDED.version, \
             address = EXCLUDED.address, last_seen = EXCLUDED.last_seen",
        )
        .bind(network_id)
        .bind(member_id)
        .bind(os)
        .bind(arch)
        .bind(version)
        .bind(address)
        .bind(last_seen_ms)
        .execute(&mut **tx)
        .await
        .map_err(DbError::from_store)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // SSO lookups (read-through; failures surface as empty AuthInfo upstream)
    // ------------------------------------------------------------------

    /// True when the member exists and is not deleted on the Central side.
    pub async fn sso_member_exists(
        &self,
        network_id: &str,
        member_id: &str,
    ) -> Result<bool, DbError> {
        let row = sqlx::query(
            "SELECT count(id) AS n FROM ztc_member \
             WHERE id = $1 AND network_id = $2 AND deleted = false",
        )
        .bind(member_id)
        .bind(network_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from_store)?;
        Ok(row.try_get::<i64, _>("n").map_err(DbError::from_store)? == 1)
    }

    /// Nonces already handed out and still inside both expiry windows.
    pub async fn sso_active_nonces(
        &self,
        network_id: &str,
        member_id: &str,
    ) -> Result<Vec<String>, DbError> {
        let rows = sqlx::query(
            "SELECT nonce FROM ztc_sso_expiry \
             WHERE network_id = $1 AND member_id = $2 \
             AND ((NOW() AT TIME ZONE 'UTC') <= authentication_expiry_time) \
             AND ((NOW() AT TIME ZONE 'UTC') <= nonce_expiration)",
        )
        .bind(network_id)
        .bind(member_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from_store)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("nonce").map_err(DbError::from_store))
            .collect()
    }

    /// Nonces created but never used for an authentication yet.
    pub async fn sso_unused_nonces(
        &self,
        network_id: &str,
        member_id: &str,
    ) -> Result<Vec<String>, DbError> {
        let rows = sqlx::query(
            "SELECT nonce FROM ztc_sso_expiry \
             WHERE network_id = $1 AND member_id = $2 \
             AND authentication_expiry_time IS NULL \
             AND ((NOW() AT TIME ZONE 'UTC') <= nonce_expiration)",
        )
        .bind(network_id)
        .bind(member_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from_store)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("nonce").map_err(DbError::from_store))
            .collect()
    }

    pub async fn sso_insert_nonce(
        &self,
        nonce: &str,
        expiry_ms: i64,
        network_id: &str,
        member_id: &str,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO ztc_sso_expiry (nonce, nonce_expiration, network_id, member_id) \
             VALUES ($1, TO_TIMESTAMP($2::double precision/1000), $3, $4)",
        )
        .bind(nonce)
        .bind(expiry_ms)
        .bind(network_id)
        .bind(member_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::from_store)?;
        Ok(())
    }

    /// OIDC client settings for an SSO-enabled network.
    pub async fn sso_client_info(&self, network_id: &str) -> Result<Option<SsoClientInfo>, DbError> {
        let rows = sqlx::query(
            "SELECT oc.client_id, oc.authorization_endpoint, oc.issuer, oc.provider, oc.sso_impl_version \
             FROM ztc_network AS n \
             INNER JOIN ztc_org o ON o.owner_id = n.owner_id \
             LEFT OUTER JOIN ztc_network_oidc_config noc ON noc.network_id = n.id \
             LEFT OUTER JOIN ztc_oidc_config oc ON noc.client_id = oc.client_id AND oc.org_id = o.org_id \
             WHERE n.id = $1 AND n.sso_enabled = true",
        )
        .bind(network_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from_store)?;

        if rows.len() > 1 {
            warn!(network_id = %network_id, "more than one auth endpoint for an organization");
        }
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        Ok(Some(SsoClientInfo {
            client_id: row.try_get::<Option<String>, _>("client_id").unwrap_or(None).unwrap_or_default(),
            authorization_endpoint: row
                .try_get::<Option<String>, _>("authorization_endpoint")
                .unwrap_or(None)
                .unwrap_or_default(),
            issuer: row.try_get::<Option<String>, _>("issuer").unwrap_or(None).unwrap_or_default(),
            provider: row.try_get::<Option<String>, _>("provider").unwrap_or(None).unwrap_or_default(),
            version: row.try_get::<Option<i64>, _>("sso_impl_version").unwrap_or(None).unwrap_or(1) as u64,
        }))
    }
}

/// One row of the OIDC client join.
#[derive(Debug, Clone, Default)]
pub struct SsoClientInfo {
    pub client_id: String,
    pub authorization_endpoint: String,
    pub issuer: String,
    pub provider: String,
    pub version: u64,
}
