// Transaction service: request/response handling of control frames.
use quiver_wire::Message;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::BrokerError;
use crate::fanout::BrokerShared;
use crate::session::Session;

/// Single-task-per-session handler over the transaction channel. Every
/// request produces either a response frame or a classified error on the
/// session error stream; the session stays open either way unless the
/// supervisor decides otherwise.
pub async fn run(
    session: Arc<Session>,
    mut requests: mpsc::Receiver<Message>,
    shared: Arc<BrokerShared>,
    errors: mpsc::Sender<BrokerError>,
) {
    while let Some(request) = requests.recv().await {
        match handle(&shared, request).await {
            Ok(Some(response)) => {
                if session.write(response).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => {
                if errors.send(err).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn handle(
    shared: &BrokerShared,
    request: Message,
) -> Result<Option<Message>, BrokerError> {
    match request {
        Message::CreateTopicRequest {
            name,
            description,
            num_fragments,
            replication_factor,
        } => {
            shared
                .core
                .create_topic(&name, &description, num_fragments, replication_factor)
                .await?;
            Ok(Some(Message::CreateTopicResponse {}))
        }
        Message::DeleteTopicRequest { name } => {
            shared.core.delete_topic(&name).await?;
            Ok(Some(Message::DeleteTopicResponse {}))
        }
        Message::DescribeTopicRequest { name } => {
            let topic = shared.core.describe_topic(&name).await?;
            Ok(Some(Message::DescribeTopicResponse {
                description: topic.description,
                num_fragments: topic.num_fragments,
                replication_factor: topic.replication_factor,
                num_publishers: topic.num_publishers,
                num_subscribers: topic.num_subscribers,
            }))
        }
        Message::ListTopicsRequest {} => {
            let names = shared.core.list_topics().await?;
            Ok(Some(Message::ListTopicsResponse { names }))
        }
        // Pure liveness; never touches the store.
        Message::HeartbeatRequest { echo, ts } => {
            Ok(Some(Message::HeartbeatResponse { echo, ts }))
        }
        Message::DiscoverBrokerRequest { topic, fragment } => {
            let hosts = shared.core.fragment_hosts(&topic, fragment).await?;
            let addr = hosts.first().ok_or_else(|| {
                BrokerError::CoordinationUnavailable(format!(
                    "no broker hosts {topic}:{fragment}"
                ))
            })?;
            let (host, port) = split_host_port(addr)?;
            Ok(Some(Message::DiscoverBrokerResponse { host, port }))
        }
        other => {
            // Responses and streaming frames never arrive here; anything
            // else is a protocol violation.
            tracing::warn!(frame_type = other.frame_type(), "unexpected transaction frame");
            Err(BrokerError::Unhandled(anyhow::anyhow!(
                "unexpected frame {:#04x} on transaction channel",
                other.frame_type()
            )))
        }
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16), BrokerError> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        BrokerError::CoordinationUnavailable(format!("malformed broker address {addr:?}"))
    })?;
    let port = port.parse().map_err(|_| {
        BrokerError::CoordinationUnavailable(format!("malformed broker address {addr:?}"))
    })?;
    Ok((host.to_string(), port))
}
