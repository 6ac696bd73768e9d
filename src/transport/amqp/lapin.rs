//! AMQP transport implementation using `lapin`.
//!
//! Each [`open`](Transport::open) call runs the full connect sequence for one
//! exchange on a fresh broker connection:
//!
//! 1. connect and create a channel,
//! 2. declare the exchange as `fanout` (non-durable, not auto-deleted),
//! 3. declare a server-named, exclusive, auto-deleting queue,
//! 4. bind it to the exchange with an empty routing key,
//! 5. consume it with manual acknowledgements.
//!
//! ## Concurrency model
//!
//! - A background **actor task** owns the connection and channel and
//!   serializes every publish and the final close.
//! - A **consumer task** drains the lapin consumer stream into the session
//!   inbox. When the broker drops the connection the stream ends, the task
//!   exits, and the inbox closes; the owner treats that as connection loss.
//!
//! ## Message mapping
//!
//! | Envelope field | AMQP property |
//! |---|---|
//! | `address` | exchange (routing key always empty) |
//! | `kind` | `type` |
//! | `correlation_id` | `correlation_id` |
//! | `reply_to` | `reply_to` |
//! | `content_type` | `content_type` |
//! | `payload` | body |

use lapin::{
    //
    acker::Acker,
    message::Delivery as AmqpDelivery,
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{FieldTable, ShortString},
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    Consumer,
    ExchangeKind,
};

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    Acknowledge,
    Address,
    Delivery,
    Envelope,
    Link,
    Result,
    RpcConfig,
    RpcError,
    Session,
    SubscriptionHandle,
    Transport,
    TransportBase,
    TransportPtr,
};

const INBOX_CAPACITY: usize = 64;

//
// Actor commands
//

enum Cmd {
    //
    Publish {
        env: Envelope,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// AMQP transport implementation using lapin.
pub struct AmqpTransport {
    // ---
    base: TransportBase,
}

/// Background actor task that owns one connection and its channel.
struct Actor {
    // ---
    label: String,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_debug!("[{}] AMQP actor started", self.label);

        let mut close_resp = None;
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Cmd::Publish { env, resp } => {
                    let result = self.do_publish(env).await;
                    let _ = resp.send(result);
                }
                Cmd::Close { resp } => {
                    close_resp = Some(resp);
                    break;
                }
            }
        }

        let result = self.shutdown().await;
        if let Some(resp) = close_resp {
            let _ = resp.send(result);
        }

        log_debug!("[{}] AMQP actor stopped", self.label);
    }

    async fn do_publish(&mut self, env: Envelope) -> Result<()> {
        // ---
        let exchange = env.address.as_str();
        let properties = properties_of(&env);

        self.channel
            .basic_publish(
                exchange.into(),
                "".into(), // fanout ignores the routing key
                BasicPublishOptions::default(),
                &env.payload,
                properties,
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: publish failed: {e}")))?;

        log_debug!("[{}] published {:?} to {exchange}", self.label, env.kind);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        // ---
        if let Err(_e) = self.channel.close(200, "Normal shutdown".into()).await {
            log_debug!("[{}] channel close: {_e}", self.label);
        }

        self.connection
            .close(200, "Normal shutdown".into())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: connection close failed: {e}")))
    }
}

fn properties_of(env: &Envelope) -> BasicProperties {
    // ---
    let mut properties = BasicProperties::default();

    if let Some(content_type) = &env.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.as_ref()));
    }
    if let Some(correlation_id) = &env.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id.as_ref()));
    }
    if let Some(reply_to) = &env.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.as_str()));
    }
    if let Some(kind) = &env.kind {
        properties = properties.with_type(ShortString::from(kind.as_ref()));
    }
    properties
}

fn envelope_of(delivery: &AmqpDelivery) -> Envelope {
    envelope_from_parts(delivery.exchange.as_str(), &delivery.properties, &delivery.data)
}

fn envelope_from_parts(exchange: &str, properties: &BasicProperties, data: &[u8]) -> Envelope {
    // ---
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| Arc::<str>::from(s.as_str()));

    Envelope {
        address: Address::from(exchange),
        kind: text(properties.kind()),
        payload: Bytes::copy_from_slice(data),
        correlation_id: text(properties.correlation_id()),
        reply_to: text(properties.reply_to()).map(Address),
        content_type: text(properties.content_type()),
    }
}

/// Positive acknowledgement for one AMQP delivery.
struct AmqpAcker(Acker);

#[async_trait::async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        // ---
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| RpcError::Transport(format!("amqp: ack failed: {e}")))
    }
}

/// Publishing half of one AMQP session.
struct AmqpLink {
    // ---
    cmd_tx: mpsc::Sender<Cmd>,
}

#[async_trait::async_trait]
impl Link for AmqpLink {
    async fn publish(&self, env: Envelope) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        self.cmd_tx
            .send(Cmd::Publish { env, resp: tx })
            .await
            .map_err(|_| RpcError::Transport("amqp: connection closed".into()))?;

        rx.await.map_err(|e| {
            let msg = format!("actor responder channel read failed:{e}");
            RpcError::Transport(msg)
        })?
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        if self.cmd_tx.send(Cmd::Close { resp: tx }).await.is_err() {
            // Actor already gone with its connection.
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }
}

/// Forward consumer deliveries into the session inbox until the stream ends.
async fn pump(label: String, mut consumer: Consumer, inbox: mpsc::Sender<Delivery>) {
    // ---
    use futures_lite::stream::StreamExt;

    while let Some(delivery_result) = consumer.next().await {
        match delivery_result {
            Ok(delivery) => {
                let envelope = envelope_of(&delivery);
                let acker = AmqpAcker(delivery.acker);

                if inbox.send(Delivery::new(envelope, Some(Box::new(acker)))).await.is_err() {
                    log_debug!("[{label}] inbox dropped, consumer exiting");
                    return;
                }
            }
            Err(_e) => {
                log_error!("[{label}] consumer error: {_e}");
                break;
            }
        }
    }

    log_info!("[{label}] delivery stream ended");
}

impl AmqpTransport {
    // ---
    async fn connect(&self, exchange: &str) -> Result<(Connection, Channel, Consumer)> {
        // ---
        let uri = self
            .base
            .uri
            .as_deref()
            .ok_or_else(|| RpcError::Transport("AMQP transport requires transport_uri".to_string()))?;

        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: connection failed: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: channel creation failed: {e}")))?;

        let exchange_opts = ExchangeDeclareOptions {
            passive: false,
            durable: false,
            auto_delete: false,
            internal: false,
            nowait: false,
        };
        channel
            .exchange_declare(
                exchange.into(),
                ExchangeKind::Fanout,
                exchange_opts,
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: exchange declare failed: {e}")))?;

        let queue_opts = QueueDeclareOptions {
            passive: false,
            durable: false,
            exclusive: true,
            auto_delete: true,
            nowait: false,
        };
        let queue = channel
            .queue_declare("".into(), queue_opts, FieldTable::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: queue declare failed: {e}")))?;

        channel
            .queue_bind(
                queue.name().as_str(),
                exchange.into(),
                "".into(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: queue bind failed: {e}")))?;

        let consumer = channel
            .basic_consume(
                queue.name().as_str(),
                "".into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: consume failed: {e}")))?;

        log_info!(
            "[{}] consuming {} bound to {exchange}",
            self.base.transport_id,
            queue.name().as_str()
        );

        Ok((connection, channel, consumer))
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    async fn open(&self, exchange: &str) -> Result<Session> {
        // ---
        let (connection, channel, consumer) = self.connect(exchange).await?;
        let label = format!("{}/{exchange}", self.base.transport_id);

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);

        let actor = Actor {
            label: label.clone(),
            connection,
            channel,
            cmd_rx,
        };
        tokio::spawn(actor.run());
        tokio::spawn(pump(label.clone(), consumer, inbox_tx));

        log_info!("[{label}] AMQP session open");

        Ok(Session {
            link: Arc::new(AmqpLink { cmd_tx }),
            deliveries: SubscriptionHandle { inbox: inbox_rx },
        })
    }
}

/// Creates a lapin-based AMQP transport from the given configuration.
///
/// No connection is made here; every [`Transport::open`] dials the broker
/// afresh so a reconnect never reuses a dead connection.
///
/// # Errors
///
/// Returns [`RpcError::MissingConfig`] if the broker URI is missing.
pub async fn create_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    let uri = config
        .transport_uri
        .clone()
        .ok_or_else(|| RpcError::MissingConfig("transport_uri".into()))?;

    log_info!("AMQP transport {} targeting {uri}", config.transport_id);

    Ok(Arc::new(AmqpTransport {
        base: TransportBase::new(config.transport_id.clone(), Some(uri)),
    }))
}
