//! Outbound "new member joined" hook.
//!
//! When a commit worker inserts a membership row that did not exist before,
//! it tells an external workflow service so owner-facing automation (welcome
//! hooks, billing, alerts) can run. The contract is strictly fire-and-forget:
//! failures are logged and invisible to the commit path.
//!
//! The hook is configured entirely from the environment and is absent unless
//! every variable is set:
//!
//! - `ZT_TEMPORAL_SCHEME` (defaults to `http`), `ZT_TEMPORAL_HOST`,
//!   `ZT_TEMPORAL_PORT`, `ZT_TEMPORAL_NAMESPACE` — the workflow service
//! - `ZT_SMEE_TASK_QUEUE` — the task queue to enqueue join tasks on
//!
//! Tasks reach the service through its pub/sub ingestion topic (named after
//! the task queue); the endpoint and namespace ride along as attributes.

use std::collections::HashMap;

use gcloud_googleapis::pubsub::v1::PubsubMessage;
use gcloud_pubsub::client::{Client, ClientConfig};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::record::{MemberId, NetworkId};

/// Workflow-service coordinates, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookTarget {
    pub endpoint: String,
    pub namespace: String,
    pub task_queue: String,
}

impl HookTarget {
    /// Assemble the target from the environment; `None` unless every
    /// required variable is present.
    pub fn from_env() -> Option<Self> {
        Self::from_vars(
            std::env::var("ZT_TEMPORAL_SCHEME").ok(),
            std::env::var("ZT_TEMPORAL_HOST").ok(),
            std::env::var("ZT_TEMPORAL_PORT").ok(),
            std::env::var("ZT_TEMPORAL_NAMESPACE").ok(),
            std::env::var("ZT_SMEE_TASK_QUEUE").ok(),
        )
    }

    fn from_vars(
        scheme: Option<String>,
        host: Option<String>,
        port: Option<String>,
        namespace: Option<String>,
        task_queue: Option<String>,
    ) -> Option<Self> {
        let scheme = scheme.unwrap_or_else(|| "http".to_string());
        Some(Self {
            endpoint: format!("{}://{}:{}", scheme, host?, port?),
            namespace: namespace?,
            task_queue: task_queue?,
        })
    }
}

pub struct MemberJoinedHook {
    tx: mpsc::UnboundedSender<(NetworkId, MemberId)>,
}

impl MemberJoinedHook {
    /// Start the hook worker for the given target. Returns `None` when the
    /// client cannot be built; the hook is best-effort and its absence never
    /// blocks startup.
    pub async fn start(
        target: HookTarget,
        cancel: CancellationToken,
    ) -> Option<(Self, JoinHandle<()>)> {
        let config = if std::env::var("PUBSUB_EMULATOR_HOST").is_ok() {
            ClientConfig::default()
        } else {
            match ClientConfig::default().with_auth().await {
                Ok(config) => config,
                Err(e) => {
                    warn!(error = %e, "member-joined hook auth failed, hook disabled");
                    return None;
                }
            }
        };
        let client = match Client::new(config).await {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "member-joined hook client failed, hook disabled");
                return None;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(notify_loop(client, target, rx, cancel));
        Some((Self { tx }, worker))
    }

    /// Fire-and-forget notification that a member joined a network.
    pub fn notify_network_joined(&self, network_id: NetworkId, member_id: MemberId) {
        crate::metrics::record_member_joined_notify();
        let _ = self.tx.send((network_id, member_id));
    }
}

async fn notify_loop(
    client: Client,
    target: HookTarget,
    mut rx: mpsc::UnboundedReceiver<(NetworkId, MemberId)>,
    cancel: CancellationToken,
) {
    info!(task_queue = %target.task_queue, endpoint = %target.endpoint, "member-joined hook starting");

    let publisher = client.topic(&target.task_queue).new_publisher(None);
    let mut attributes: HashMap<String, String> = HashMap::new();
    attributes.insert("endpoint".to_string(), target.endpoint.clone());
    attributes.insert("namespace".to_string(), target.namespace.clone());
    attributes.insert("task_queue".to_string(), target.task_queue.clone());

    loop {
        let (network_id, member_id) = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let task = json!({
            "type": "network_joined",
            "network_id": network_id.to_string(),
            "member_id": member_id.to_string(),
            "namespace": target.namespace,
        });
        let message = PubsubMessage {
            data: task.to_string().into_bytes(),
            attributes: attributes.clone(),
            ..Default::default()
        };

        let awaiter = publisher.publish(message).await;
        match awaiter.get().await {
            Ok(_) => debug!(network_id = %network_id, member_id = %member_id, "join task enqueued"),
            Err(e) => {
                // Invisible to the commit path; the workflow service will
                // see this member on its next reconciliation sweep.
                warn!(network_id = %network_id, member_id = %member_id, error = %e, "join task enqueue failed");
            }
        }
    }

    info!("member-joined hook stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_requires_all_vars() {
        assert_eq!(
            HookTarget::from_vars(None, None, None, None, None),
            None
        );
        assert_eq!(
            HookTarget::from_vars(
                None,
                Some("temporal.internal".into()),
                Some("7233".into()),
                None,
                Some("member-hooks".into()),
            ),
            None
        );
    }

    #[test]
    fn test_target_defaults_scheme() {
        let target = HookTarget::from_vars(
            None,
            Some("temporal.internal".into()),
            Some("7233".into()),
            Some("default".into()),
            Some("member-hooks".into()),
        )
        .unwrap();
        assert_eq!(target.endpoint, "http://temporal.internal:7233");
        assert_eq!(target.namespace, "default");
        assert_eq!(target.task_queue, "member-hooks");
    }

    #[test]
    fn test_target_explicit_scheme() {
        let target = HookTarget::from_vars(
            Some("https".into()),
            Some("temporal.internal".into()),
            Some("443".into()),
            Some("prod".into()),
            Some("member-hooks".into()),
        )
        .unwrap();
        assert_eq!(target.endpoint, "https://temporal.internal:443");
    }
}
