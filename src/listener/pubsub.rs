//! Hosted pub/sub notification listener.
//!
//! Subscribes to the configured change topics with a per-controller filter
//! (`attributes.controller_id = '<cid>'`), so a single topic fans out to
//! every controller without per-controller topics. Subscription names are
//! deterministic per (controller, kind) and created on first start when
//! missing, with message ordering enabled. Payloads are protobuf
//! [`NetworkChange`] / [`MemberChange`] messages; both are normalized to the
//! same envelope shape the other transports produce before dispatch.
//!
//! Messages ack on successful dispatch and nack on failure so the service
//! redelivers them. In emulator mode (`PUBSUB_EMULATOR_HOST`) missing topics
//! are created on the fly.

use std::sync::Arc;
use std::time::Duration;

use gcloud_pubsub::client::{Client, ClientConfig};
use gcloud_pubsub::subscription::SubscriptionConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PubSubConfig;
use crate::db::ControllerDb;
use crate::error::DbError;
use crate::wire::{MemberChange, NetworkChange};

use super::{dispatch_member, dispatch_network, ChangeEnvelope, ListenerHandle, ListenerKind};

const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Build a pub/sub client, authenticating unless the emulator is in play.
pub async fn client(config: &PubSubConfig) -> Result<Client, DbError> {
    let mut client_config = if std::env::var("PUBSUB_EMULATOR_HOST").is_ok() {
        ClientConfig::default()
    } else {
        ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| DbError::Config(format!("pubsub auth failed: {e}")))?
    };
    client_config.project_id = Some(config.project_id.clone());
    Client::new(client_config)
        .await
        .map_err(|e| DbError::Config(format!("pubsub client failed: {e}")))
}

/// Spawn one consumer per record kind and return their handle.
pub fn start(
    db: Arc<ControllerDb>,
    client: Client,
    config: &PubSubConfig,
    controller_id: &str,
) -> ListenerHandle {
    let cancel = CancellationToken::new();
    let tasks: Vec<JoinHandle<()>> = [
        (ListenerKind::Network, config.network_change_topic.clone()),
        (ListenerKind::Member, config.member_change_topic.clone()),
    ]
    .into_iter()
    .map(|(kind, topic_name)| {
        tokio::spawn(consume_loop(
            db.clone(),
            client.clone(),
            topic_name,
            subscription_name(controller_id, kind),
            controller_id.to_string(),
            kind,
            cancel.clone(),
        ))
    })
    .collect();
    ListenerHandle::new(cancel, tasks)
}

/// Deterministic per-(controller, kind) subscription name.
pub fn subscription_name(controller_id: &str, kind: ListenerKind) -> String {
    format!("{controller_id}-{}-change-subscription", kind.as_str())
}

async fn consume_loop(
    db: Arc<ControllerDb>,
    client: Client,
    topic_name: String,
    subscription_name: String,
    controller_id: String,
    kind: ListenerKind,
    cancel: CancellationToken,
) {
    info!(topic = %topic_name, subscription = %subscription_name, "pub/sub listener starting");

    while !cancel.is_cancelled() {
        match ensure_subscription(&client, &topic_name, &subscription_name, &controller_id).await {
            Ok(()) => {}
            Err(e) => {
                warn!(topic = %topic_name, error = %e, "subscription setup failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_BACKOFF) => continue,
                }
            }
        }

        let subscription = client.subscription(&subscription_name);
        let db_for_receive = db.clone();
        let result = subscription
            .receive(
                move |message, _cancel| {
                    let db = db_for_receive.clone();
                    async move {
                        let ok = handle_message(&db, kind, &message.message.data).await;
                        if ok {
                            if let Err(e) = message.ack().await {
                                warn!(error = %e, "failed to ack pub/sub message");
                            }
                        } else if let Err(e) = message.nack().await {
                            warn!(error = %e, "failed to nack pub/sub message");
                        }
                    }
                },
                cancel.clone(),
                None,
            )
            .await;

        if let Err(e) = result {
            warn!(subscription = %subscription_name, error = %e, "pub/sub receive failed, retrying");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RETRY_BACKOFF) => {}
            }
        }
    }

    info!(subscription = %subscription_name, "pub/sub listener stopped");
}

/// Create the topic (dev mode) and the filtered subscription when missing.
async fn ensure_subscription(
    client: &Client,
    topic_name: &str,
    subscription_name: &str,
    controller_id: &str,
) -> Result<(), DbError> {
    let topic = client.topic(topic_name);
    if !topic
        .exists(None)
        .await
        .map_err(|e| DbError::Config(e.to_string()))?
    {
        topic
            .create(None, None)
            .await
            .map_err(|e| DbError::Config(e.to_string()))?;
        info!(topic = %topic_name, "created missing pub/sub topic");
    }

    let subscription = client.subscription(subscription_name);
    if !subscription
        .exists(None)
        .await
        .map_err(|e| DbError::Config(e.to_string()))?
    {
        let config = SubscriptionConfig {
            enable_message_ordering: true,
            filter: format!("attributes.controller_id = '{controller_id}'"),
            ..Default::default()
        };
        subscription
            .create(topic.fully_qualified_name(), config, None)
            .await
            .map_err(|e| DbError::Config(e.to_string()))?;
        info!(subscription = %subscription_name, "created missing pub/sub subscription");
    }
    Ok(())
}

/// Decode and dispatch one message. Returns false when the payload is
/// malformed or carries unparseable records (nacked upstream).
async fn handle_message(db: &Arc<ControllerDb>, kind: ListenerKind, data: &[u8]) -> bool {
    debug!(kind = kind.as_str(), bytes = data.len(), "pub/sub notification received");

    let envelope = match kind {
        ListenerKind::Network => match NetworkChange::decode_from(data) {
            Ok(change) => ChangeEnvelope {
                old: change.old.and_then(|n| n.to_record()).map(|r| r.to_json()),
                new: change.new.and_then(|n| n.to_record()).map(|r| r.to_json()),
            },
            Err(e) => {
                warn!(error = %e, "dropping undecodable network change");
                crate::metrics::record_notification("pubsub", kind.as_str(), "malformed");
                return false;
            }
        },
        ListenerKind::Member => match MemberChange::decode_from(data) {
            Ok(change) => ChangeEnvelope {
                old: change.old.and_then(|m| m.to_record()).map(|r| r.to_json()),
                new: change.new.and_then(|m| m.to_record()).map(|r| r.to_json()),
            },
            Err(e) => {
                warn!(error = %e, "dropping undecodable member change");
                crate::metrics::record_notification("pubsub", kind.as_str(), "malformed");
                return false;
            }
        },
    };

    let ok = match kind {
        ListenerKind::Network => dispatch_network(db, envelope).await,
        ListenerKind::Member => dispatch_member(db, envelope).await,
    };
    crate::metrics::record_notification("pubsub", kind.as_str(), if ok { "success" } else { "malformed" });
    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_name_is_deterministic() {
        assert_eq!(
            subscription_name("deadbeef01", ListenerKind::Network),
            "deadbeef01-network-change-subscription"
        );
        assert_eq!(
            subscription_name("deadbeef01", ListenerKind::Member),
            "deadbeef01-member-change-subscription"
        );
    }
}
