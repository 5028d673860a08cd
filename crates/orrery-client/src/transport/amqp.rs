//! AMQP 0-9-1 transport on `lapin`.
//!
//! The testbed publishes every topic of a run to one topic exchange named
//! after the namespace prefix. An observer declares that exchange
//! (non-durable, auto-deleted), declares its own auto-deleted queue
//! `<pattern>.<client_name>`, binds it with the subscription pattern and
//! consumes with explicit acknowledgment and a prefetch of one.
//!
//! The broker authenticates on the access token, presented as the password.
//! A refreshed token is pushed with the `connection.update-secret` method so
//! the subscription survives the refresh.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPScheme, AMQPUri};
use lapin::{Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use orrery_wire::topic::{Namespace, TopicPattern};

use super::{BusConnection, BusTransport, Delivery, SessionId};
use crate::config::BusEndpoint;
use crate::credential::Credential;
use crate::error::ConnectError;

/// Heartbeat negotiated with the broker, in seconds.
pub const HEARTBEAT_SECS: u16 = 600;

/// Unacknowledged deliveries the broker may push ahead of the observer.
pub const PREFETCH: u16 = 1;

const CLOSE_OK: u16 = 200;

// ---------------------------------------------------------------------------
// Broker topology
// ---------------------------------------------------------------------------

/// Exchange, queue and binding key for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Binding {
    /// Map a subscription pattern onto the namespace's exchange.
    ///
    /// The pattern must live inside the namespace: `greenfield.#` and
    /// `greenfield.manager.*` bind to exchange `greenfield`, while
    /// `other.#` or the bare prefix are refused.
    pub fn new(namespace: &Namespace, pattern: &TopicPattern, client_name: &str) -> Result<Self, ConnectError> {
        if namespace.strip(pattern.as_str()).is_none() {
            return Err(ConnectError::Subscribe {
                pattern: pattern.to_string(),
                details: format!("pattern is outside namespace '{namespace}'"),
            });
        }
        if client_name.is_empty() {
            return Err(ConnectError::Subscribe {
                pattern: pattern.to_string(),
                details: "client name must not be empty".to_owned(),
            });
        }
        Ok(Self {
            exchange: namespace.as_str().to_owned(),
            queue: format!("{pattern}.{client_name}"),
            routing_key: pattern.as_str().to_owned(),
        })
    }
}

/// Broker URI for an endpoint, presenting the access token as the password.
pub fn broker_uri(endpoint: &BusEndpoint, credential: &Credential) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.scheme = if endpoint.tls { AMQPScheme::AMQPS } else { AMQPScheme::AMQP };
    uri.authority.host = endpoint.host.clone();
    uri.authority.port = endpoint.port;
    uri.authority.userinfo.username = endpoint.username.clone();
    uri.authority.userinfo.password = credential.access_token().to_owned();
    uri.vhost = endpoint.virtual_host.clone();
    uri.query.heartbeat = Some(HEARTBEAT_SECS);
    uri
}

// ---------------------------------------------------------------------------
// AmqpTransport
// ---------------------------------------------------------------------------

/// Opens broker connections for one namespace.
#[derive(Debug, Clone)]
pub struct AmqpTransport {
    namespace: Namespace,
}

impl AmqpTransport {
    pub fn new(namespace: Namespace) -> Self {
        Self { namespace }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }
}

#[async_trait]
impl BusTransport for AmqpTransport {
    async fn open(
        &self,
        endpoint: &BusEndpoint,
        credential: &Credential,
        session: SessionId,
    ) -> Result<Box<dyn BusConnection>, ConnectError> {
        let unreachable = |e: lapin::Error| ConnectError::Unreachable {
            endpoint: endpoint.to_string(),
            details: e.to_string(),
        };
        let connection = Connection::connect_uri(broker_uri(endpoint, credential), ConnectionProperties::default())
            .await
            .map_err(unreachable)?;
        let channel = connection.create_channel().await.map_err(unreachable)?;
        tracing::debug!(%session, %endpoint, "broker connection open");
        Ok(Box::new(AmqpConnection {
            session,
            namespace: self.namespace.clone(),
            client_name: endpoint.client_name.clone(),
            connection,
            channel,
            consumer: None,
        }))
    }
}

// ---------------------------------------------------------------------------
// AmqpConnection
// ---------------------------------------------------------------------------

/// One broker connection with a single channel.
pub struct AmqpConnection {
    session: SessionId,
    namespace: Namespace,
    client_name: String,
    connection: Connection,
    channel: Channel,
    consumer: Option<Consumer>,
}

impl AmqpConnection {
    fn check_session(&self, delivery: &Delivery) -> Result<(), ConnectError> {
        if delivery.session == self.session {
            Ok(())
        } else {
            Err(ConnectError::StaleSession {
                stale: delivery.session,
                current: Some(self.session),
            })
        }
    }
}

fn closed(e: lapin::Error) -> ConnectError {
    ConnectError::Closed { reason: e.to_string() }
}

#[async_trait]
impl BusConnection for AmqpConnection {
    fn session(&self) -> SessionId {
        self.session
    }

    async fn subscribe(&mut self, pattern: &TopicPattern) -> Result<(), ConnectError> {
        let binding = Binding::new(&self.namespace, pattern, &self.client_name)?;
        let refused = |e: lapin::Error| ConnectError::Subscribe {
            pattern: pattern.to_string(),
            details: e.to_string(),
        };

        self.channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await
            .map_err(refused)?;
        self.channel
            .exchange_declare(
                &binding.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: false,
                    auto_delete: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(refused)?;
        self.channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    durable: false,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(refused)?;
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(refused)?;

        // no_ack stays false: every delivery waits for an explicit ack.
        let consumer = self
            .channel
            .basic_consume(
                &binding.queue,
                &format!("{}-{}", self.client_name, self.session.0),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(refused)?;
        tracing::debug!(
            session = %self.session,
            exchange = %binding.exchange,
            queue = %binding.queue,
            "consumer bound"
        );
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Delivery, ConnectError> {
        let Some(consumer) = self.consumer.as_mut() else {
            return std::future::pending().await;
        };
        match consumer.next().await {
            Some(Ok(delivery)) => Ok(Delivery {
                session: self.session,
                tag: delivery.delivery_tag,
                topic: delivery.routing_key.as_str().to_owned(),
                body: delivery.data,
                redelivered: delivery.redelivered,
            }),
            Some(Err(e)) => Err(closed(e)),
            None => Err(ConnectError::Closed {
                reason: "consumer cancelled by the broker".to_owned(),
            }),
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), ConnectError> {
        self.check_session(delivery)?;
        self.channel
            .basic_ack(delivery.tag, BasicAckOptions::default())
            .await
            .map_err(closed)
    }

    async fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), ConnectError> {
        self.check_session(delivery)?;
        self.channel
            .basic_nack(
                delivery.tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(closed)
    }

    async fn update_secret(&mut self, credential: &Credential) -> Result<(), ConnectError> {
        self.connection
            .update_secret(credential.access_token(), "secret")
            .await
            .map_err(closed)
    }

    async fn close(&mut self) {
        self.consumer = None;
        if let Err(e) = self.channel.close(CLOSE_OK, "observer closing").await {
            tracing::debug!(session = %self.session, error = %e, "channel close failed");
        }
        if let Err(e) = self.connection.close(CLOSE_OK, "observer closing").await {
            tracing::debug!(session = %self.session, error = %e, "connection close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ns(prefix: &str) -> Namespace {
        Namespace::new(prefix).unwrap()
    }

    #[test]
    fn namespace_wildcard_binds_to_the_prefix_exchange() {
        let namespace = ns("greenfield");
        let binding = Binding::new(&namespace, &namespace.wildcard(), "viewer").unwrap();
        assert_eq!(
            binding,
            Binding {
                exchange: "greenfield".into(),
                queue: "greenfield.#.viewer".into(),
                routing_key: "greenfield.#".into(),
            }
        );
    }

    #[test]
    fn dotted_prefixes_keep_their_full_exchange_name() {
        let namespace = ns("lab.sos");
        let binding = Binding::new(&namespace, &TopicPattern::new("lab.sos.manager.*"), "viewer").unwrap();
        assert_eq!(binding.exchange, "lab.sos");
        assert_eq!(binding.routing_key, "lab.sos.manager.*");
        assert_eq!(binding.queue, "lab.sos.manager.*.viewer");
    }

    #[test]
    fn patterns_outside_the_namespace_are_refused() {
        let namespace = ns("greenfield");
        for pattern in ["other.#", "greenfield", "greenfieldx.#"] {
            let err = Binding::new(&namespace, &TopicPattern::new(pattern), "viewer").unwrap_err();
            assert!(matches!(err, ConnectError::Subscribe { .. }), "{pattern}");
        }
        let err = Binding::new(&namespace, &namespace.wildcard(), "").unwrap_err();
        assert!(matches!(err, ConnectError::Subscribe { .. }));
    }

    #[test]
    fn uri_presents_the_token_as_password() {
        let endpoint = BusEndpoint {
            host: "bus.example".into(),
            port: 5671,
            virtual_host: "testbed".into(),
            tls: true,
            ..BusEndpoint::default()
        };
        let credential = Credential::new("tok-1", Duration::from_secs(300));
        let uri = broker_uri(&endpoint, &credential);
        assert_eq!(uri.scheme, AMQPScheme::AMQPS);
        assert_eq!(uri.authority.host, "bus.example");
        assert_eq!(uri.authority.port, 5671);
        assert_eq!(uri.authority.userinfo.username, "");
        assert_eq!(uri.authority.userinfo.password, "tok-1");
        assert_eq!(uri.vhost, "testbed");
        assert_eq!(uri.query.heartbeat, Some(HEARTBEAT_SECS));
    }

    #[test]
    fn plain_endpoint_uses_amqp() {
        let credential = Credential::new("tok", Duration::from_secs(60));
        let uri = broker_uri(&BusEndpoint::default(), &credential);
        assert_eq!(uri.scheme, AMQPScheme::AMQP);
        assert_eq!(uri.vhost, "/");
    }
}
