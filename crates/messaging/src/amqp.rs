//! RabbitMQ transport over `lapin`.
//!
//! Publisher confirms are awaited on a spawned task per message and turned
//! into [`ChannelEvent`]s. A basic.return attached to a confirm is emitted
//! before the confirm itself. Connection errors flip the close signal and
//! close every channel's event feed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{mpsc, watch};

use crate::settings::BrokerSettings;
use crate::transport::{
    BrokerChannel, BrokerConnection, ChannelEvent, ChannelEvents, ChannelMode, Connector,
    DeathInfo, Delivery, DeliveryStream, ExchangeKind, Flow, HeaderValue, MessageProperties,
    OutboundMessage, QueueArguments,
};
use crate::{MessageId, MessagingError, Result};

const DELIVERY_MODE_PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

type EventSenders = Arc<Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>>;

fn channel_error(err: lapin::Error) -> MessagingError {
    match err {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            MessagingError::ConnectionReset(err.to_string())
        }
        other => MessagingError::Channel(other.to_string()),
    }
}

fn topology_error(err: lapin::Error) -> MessagingError {
    match channel_error(err) {
        MessagingError::Channel(reason) => MessagingError::Topology(reason),
        other => other,
    }
}

fn long_string(value: &LongString) -> String {
    String::from_utf8_lossy(value.as_bytes()).into_owned()
}

fn field<'a>(table: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
    table
        .inner()
        .iter()
        .find(|(name, _)| name.as_str() == key)
        .map(|(_, value)| value)
}

fn value_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(long_string(s)),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

fn value_int(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

fn queue_arguments_table(arguments: &QueueArguments) -> Result<FieldTable> {
    let mut table = FieldTable::default();
    if let Some(exchange) = &arguments.dead_letter_exchange {
        table.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.as_str().into()),
        );
    }
    if let Some(routing_key) = &arguments.dead_letter_routing_key {
        table.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.as_str().into()),
        );
    }
    if let Some(ttl) = arguments.message_ttl {
        let millis = i64::try_from(ttl.as_millis()).map_err(|_| {
            MessagingError::Topology(format!("message ttl {ttl:?} is out of range"))
        })?;
        table.insert("x-message-ttl".into(), AMQPValue::LongLongInt(millis));
    }
    if let Some(max_length) = arguments.max_length {
        table.insert(
            "x-max-length".into(),
            AMQPValue::LongLongInt(i64::from(max_length)),
        );
    }
    if let Some(overflow) = arguments.overflow {
        table.insert(
            "x-overflow".into(),
            AMQPValue::LongString(overflow.as_str().into()),
        );
    }
    Ok(table)
}

fn outbound_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(id.as_str()));
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.as_str()));
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.as_str()));
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    if !properties.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (name, value) in &properties.headers {
            let value = match value {
                HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
                HeaderValue::Text(text) => AMQPValue::LongString(text.as_str().into()),
            };
            headers.insert(name.as_str().into(), value);
        }
        basic = basic.with_headers(headers);
    }
    basic
}

fn inbound_properties(basic: &BasicProperties) -> MessageProperties {
    let mut headers = BTreeMap::new();
    if let Some(table) = basic.headers() {
        for (name, value) in table.inner() {
            let converted = value_int(value)
                .map(HeaderValue::Int)
                .or_else(|| value_text(value).map(HeaderValue::Text));
            if let Some(converted) = converted {
                headers.insert(name.as_str().to_string(), converted);
            }
        }
    }
    MessageProperties {
        message_id: basic
            .message_id()
            .as_ref()
            .map(|id| MessageId::from(id.as_str())),
        correlation_id: basic
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        content_type: basic
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str().to_string()),
        persistent: *basic.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT),
        timestamp: *basic.timestamp(),
        headers,
    }
}

/// Reads the most recent `x-death` entry.
fn death_info(basic: &BasicProperties) -> Option<DeathInfo> {
    let headers = basic.headers().as_ref()?;
    let AMQPValue::FieldArray(deaths) = field(headers, "x-death")? else {
        return None;
    };
    let AMQPValue::FieldTable(entry) = deaths.as_slice().first()? else {
        return None;
    };
    let text = |key: &str| field(entry, key).and_then(value_text).unwrap_or_default();
    let routing_keys = match field(entry, "routing-keys") {
        Some(AMQPValue::FieldArray(keys)) => keys.as_slice().iter().filter_map(value_text).collect(),
        _ => Vec::new(),
    };
    Some(DeathInfo {
        queue: text("queue"),
        exchange: text("exchange"),
        routing_keys,
        reason: text("reason"),
        count: field(entry, "count").and_then(value_int).unwrap_or(1),
    })
}

fn convert_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        death: death_info(&delivery.properties),
        properties: inbound_properties(&delivery.properties),
        body: delivery.data,
    }
}

/// Opens connections to RabbitMQ.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    settings: BrokerSettings,
}

impl AmqpConnector {
    pub fn new(settings: BrokerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    #[tracing::instrument(skip(self), fields(host = %self.settings.host))]
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let properties = ConnectionProperties::default()
            .with_connection_name(self.settings.connection_name.as_str().into());
        let connection = Connection::connect(&self.settings.amqp_url(), properties)
            .await
            .map_err(|e| MessagingError::ResourceUnavailable(e.to_string()))?;

        let (close_tx, close_rx) = watch::channel(false);
        let close_tx = Arc::new(close_tx);
        let senders: EventSenders = Arc::default();
        {
            let close_tx = close_tx.clone();
            let senders = senders.clone();
            connection.on_error(move |err| {
                tracing::error!(error = %err, "broker connection error");
                let _ = close_tx.send(true);
                let reason = err.to_string();
                let mut senders = senders.lock().unwrap_or_else(PoisonError::into_inner);
                for sender in senders.drain(..) {
                    let _ = sender.send(ChannelEvent::Closed {
                        reason: reason.clone(),
                    });
                }
            });
        }

        Ok(Arc::new(AmqpConnection {
            connection,
            close_tx,
            close_rx,
            senders,
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    close_tx: Arc<watch::Sender<bool>>,
    close_rx: watch::Receiver<bool>,
    senders: EventSenders,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && !*self.close_rx.borrow()
    }

    fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_rx.clone()
    }

    async fn open_channel(&self, mode: ChannelMode) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await.map_err(channel_error)?;
        if mode == ChannelMode::Confirm {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(channel_error)?;
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(events_tx.clone());
        Ok(Arc::new(AmqpChannel {
            channel,
            mode,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            consume_lock: tokio::sync::Mutex::new(()),
        }))
    }

    async fn close(&self) -> Result<()> {
        let result = self
            .connection
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(channel_error);
        let _ = self.close_tx.send(true);
        result
    }
}

struct AmqpChannel {
    channel: Channel,
    mode: ChannelMode,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<ChannelEvents>>,
    /// basic.qos applies to consumers started after it; keeps each
    /// qos + consume pair together.
    consume_lock: tokio::sync::Mutex<()>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn take_events(&self) -> Option<ChannelEvents> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let kind = match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        let options = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(name, kind, options, FieldTable::default())
            .await
            .map_err(topology_error)
    }

    async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> Result<()> {
        let options = QueueDeclareOptions {
            durable: arguments.durable,
            ..QueueDeclareOptions::default()
        };
        let arguments = queue_arguments_table(arguments)?;
        self.channel
            .queue_declare(name, options, arguments)
            .await
            .map(|_| ())
            .map_err(topology_error)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(topology_error)
    }

    /// lapin buffers writes internally and exposes no fill level, so the
    /// returned flow is always [`Flow::Ready`].
    async fn publish(&self, message: OutboundMessage) -> Result<Flow> {
        let options = BasicPublishOptions {
            mandatory: message.mandatory,
            ..BasicPublishOptions::default()
        };
        let properties = outbound_properties(&message.properties);
        let confirm = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                options,
                &message.body,
                properties,
            )
            .await
            .map_err(channel_error)?;

        if self.mode == ChannelMode::Confirm {
            let Some(message_id) = message.properties.message_id else {
                return Err(MessagingError::Channel(
                    "confirm-mode publish requires a message id".to_string(),
                ));
            };
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                let returned = |ret: &lapin::message::BasicReturnMessage| ChannelEvent::Returned {
                    message_id: Some(message_id.clone()),
                    exchange: ret.delivery.exchange.as_str().to_string(),
                    routing_key: ret.delivery.routing_key.as_str().to_string(),
                    reply_code: ret.reply_code,
                    reply_text: ret.reply_text.as_str().to_string(),
                };
                match confirm.await {
                    Ok(Confirmation::Ack(ret)) => {
                        if let Some(ret) = ret {
                            let _ = events.send(returned(&ret));
                        }
                        let _ = events.send(ChannelEvent::Acked {
                            message_id: message_id.clone(),
                        });
                    }
                    Ok(Confirmation::Nack(ret)) => {
                        if let Some(ret) = ret {
                            let _ = events.send(returned(&ret));
                        }
                        let _ = events.send(ChannelEvent::Nacked {
                            message_id: message_id.clone(),
                        });
                    }
                    Ok(Confirmation::NotRequested) => {
                        let _ = events.send(ChannelEvent::Acked {
                            message_id: message_id.clone(),
                        });
                    }
                    Err(err) => {
                        let _ = events.send(ChannelEvent::Closed {
                            reason: err.to_string(),
                        });
                    }
                }
            });
        }
        Ok(Flow::Ready)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        let _guard = self.consume_lock.lock().await;
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(channel_error)?;
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;

        let queue = queue.to_string();
        let stream = consumer
            .take_while(move |item| {
                if let Err(err) = item {
                    tracing::warn!(queue = %queue, error = %err, "consumer stream failed");
                }
                futures_util::future::ready(item.is_ok())
            })
            .filter_map(|item| futures_util::future::ready(item.ok().map(convert_delivery)));
        Ok(Box::pin(stream))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(channel_error)
    }

    async fn close(&self) -> Result<()> {
        let result = self
            .channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(channel_error);
        let _ = self.events_tx.send(ChannelEvent::Closed {
            reason: "closed by application".to_string(),
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::Overflow;

    #[test]
    fn queue_arguments_map_to_x_arguments() {
        let arguments = QueueArguments::durable()
            .with_dead_letter("dlx.direct", "events.dlq")
            .with_message_ttl(Duration::from_secs(86_400))
            .with_max_length(100_000, Overflow::DropHead);
        let table = queue_arguments_table(&arguments).unwrap();

        assert_eq!(
            field(&table, "x-dead-letter-exchange").and_then(value_text),
            Some("dlx.direct".to_string())
        );
        assert_eq!(
            field(&table, "x-message-ttl").and_then(value_int),
            Some(86_400_000)
        );
        assert_eq!(field(&table, "x-max-length").and_then(value_int), Some(100_000));
        assert_eq!(
            field(&table, "x-overflow").and_then(value_text),
            Some("drop-head".to_string())
        );
    }

    #[test]
    fn oversized_ttl_is_a_topology_error() {
        let arguments = QueueArguments::durable().with_message_ttl(Duration::MAX);
        assert!(matches!(
            queue_arguments_table(&arguments),
            Err(MessagingError::Topology(_))
        ));
    }

    #[test]
    fn properties_survive_conversion() {
        let mut headers = BTreeMap::new();
        headers.insert("x-replay-count".to_string(), HeaderValue::Int(2));
        let properties = MessageProperties {
            message_id: Some(MessageId::from("m1")),
            correlation_id: Some("c1".to_string()),
            content_type: Some("application/json".to_string()),
            persistent: true,
            timestamp: Some(1_700_000_000),
            headers,
        };
        assert_eq!(inbound_properties(&outbound_properties(&properties)), properties);
    }
}
