//! Post-commit change publisher.
//!
//! The outbound half of the pub/sub transport: after a commit lands, the
//! change event (old and new record snapshots) is encoded as protobuf and
//! published to the configured topic with a `controller_id` attribute, which
//! is what peer controllers filter their subscriptions on. An optional
//! `frontend` attribute tags the deployment slice that originated the
//! change.
//!
//! Publishing is decoupled from the commit worker through an unbounded
//! queue drained by a single task, so fan-out stays synchronous and cheap
//! while the network I/O happens off the commit path, in commit order.

use std::collections::HashMap;
use std::sync::Arc;

use gcloud_googleapis::pubsub::v1::PubsubMessage;
use gcloud_pubsub::client::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PubSubConfig;
use crate::db::ChangeHandler;
use crate::record::{MemberRecord, NetworkRecord};
use crate::wire::{ChangeSource, MemberChange, NetworkChange};

enum Outbound {
    Network(Vec<u8>),
    Member(Vec<u8>),
}

pub struct ChangePublisher {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChangePublisher {
    /// Spawn the publisher worker. Returns the handler half and the worker's
    /// join handle.
    pub fn start(
        client: Client,
        config: &PubSubConfig,
        controller_id: &str,
        frontend: Option<String>,
        cancel: CancellationToken,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(publish_loop(
            client,
            config.network_change_topic.clone(),
            config.member_change_topic.clone(),
            controller_id.to_string(),
            frontend,
            rx,
            cancel,
        ));
        (Arc::new(Self { tx }), worker)
    }
}

impl ChangeHandler for ChangePublisher {
    fn on_network_change(&self, old: Option<&NetworkRecord>, new: Option<&NetworkRecord>) {
        let change = NetworkChange::from_records(old, new, ChangeSource::Controller);
        let _ = self.tx.send(Outbound::Network(change.encode_to_vec()));
    }

    fn on_member_change(&self, old: Option<&MemberRecord>, new: Option<&MemberRecord>) {
        let change = MemberChange::from_records(old, new, ChangeSource::Controller);
        let _ = self.tx.send(Outbound::Member(change.encode_to_vec()));
    }
}

async fn publish_loop(
    client: Client,
    network_topic: String,
    member_topic: String,
    controller_id: String,
    frontend: Option<String>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) {
    info!(network_topic = %network_topic, member_topic = %member_topic, "change publisher starting");

    let network_publisher = client.topic(&network_topic).new_publisher(None);
    let member_publisher = client.topic(&member_topic).new_publisher(None);

    let mut attributes: HashMap<String, String> = HashMap::new();
    attributes.insert("controller_id".to_string(), controller_id.clone());
    if let Some(frontend) = frontend {
        attributes.insert("frontend".to_string(), frontend);
    }

    loop {
        let outbound = tokio::select! {
            _ = cancel.cancelled() => break,
            outbound = rx.recv() => match outbound {
                Some(outbound) => outbound,
                None => break,
            },
        };

        let (publisher, kind, data) = match outbound {
            Outbound::Network(data) => (&network_publisher, "network", data),
            Outbound::Member(data) => (&member_publisher, "member", data),
        };

        let message = PubsubMessage {
            data,
            attributes: attributes.clone(),
            ordering_key: controller_id.clone(),
            ..Default::default()
        };

        let awaiter = publisher.publish(message).await;
        match awaiter.get().await {
            Ok(_) => {
                crate::metrics::record_published_change(
                    if kind == "network" { "network" } else { "member" },
                    "success",
                );
                debug!(kind, "change published");
            }
            Err(e) => {
                crate::metrics::record_published_change(
                    if kind == "network" { "network" } else { "member" },
                    "error",
                );
                warn!(kind, error = %e, "change publish failed");
            }
        }
    }

    info!("change publisher stopped");
}
