//! Redis-Streams-backed stream bus (durable, at-least-once delivery).
//!
//! One `RedisStreamBus<M>` instance backs one logical topic:
//! - **Durable delivery**: messages persist until acknowledged (XACK)
//! - **At-least-once**: unacknowledged messages are reclaimed and redelivered
//! - **Consumer groups**: each worker pool reads through its own group
//!   (XREADGROUP), giving the partitioned-log semantics the pipeline expects
//! - **Dead-letter stream**: messages that exhaust their redeliveries land
//!   on `<topic>:dlq` with their retry count
//!
//! The generic default `subscribe()` joins an ephemeral consumer; pipelines
//! use [`RedisStreamBus::subscribe_with_group`] with the configured group
//! ids (`aggregation-service-group`, `re-rating-group`).

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{error, warn};

use meterflow_events::{StreamBus, Subscription};

/// Messages idle longer than this in another consumer are reclaimed.
const DEFAULT_PENDING_TIMEOUT_MS: u64 = 60_000;

/// Redeliveries before a message moves to the dead-letter stream.
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Poll cadence of the subscription thread.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamError {
    #[error("redis connection error: {0}")]
    Connection(String),

    #[error("redis command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// One logical topic over a Redis stream key.
#[derive(Debug)]
pub struct RedisStreamBus<M> {
    client: Arc<redis::Client>,
    stream_key: String,
    dlq_key: String,
    max_retries: u32,
    pending_timeout_ms: u64,
    _marker: PhantomData<fn() -> M>,
}

impl<M> Clone for RedisStreamBus<M> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            stream_key: self.stream_key.clone(),
            dlq_key: self.dlq_key.clone(),
            max_retries: self.max_retries,
            pending_timeout_ms: self.pending_timeout_ms,
            _marker: PhantomData,
        }
    }
}

impl<M> RedisStreamBus<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    /// Open a bus for one topic.
    ///
    /// `topic` is one of the logical names in `meterflow_events::topics`;
    /// the stream key is `meterflow:<topic>` and the dead-letter stream
    /// `meterflow:<topic>:dlq`.
    pub fn new(redis_url: impl AsRef<str>, topic: &str) -> Result<Self, RedisStreamError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            stream_key: format!("meterflow:{topic}"),
            dlq_key: format!("meterflow:{topic}:dlq"),
            max_retries: DEFAULT_MAX_RETRIES,
            pending_timeout_ms: DEFAULT_PENDING_TIMEOUT_MS,
            _marker: PhantomData,
        })
    }

    /// Ensure a consumer group exists (idempotent).
    pub fn ensure_consumer_group(&self, group: &str) -> Result<(), RedisStreamError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisStreamError::Connection(e.to_string()))?;

        // XGROUP CREATE with MKSTREAM creates the stream if needed; an
        // existing group returns BUSYGROUP, which we ignore.
        let _: Result<String, _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        Ok(())
    }

    fn publish_sync(&self, message: &M) -> Result<(), RedisStreamError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| RedisStreamError::Serialization(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisStreamError::Connection(e.to_string()))?;

        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| RedisStreamError::Command(format!("XADD failed: {e}")))?;

        Ok(())
    }

    fn acknowledge_sync(&self, group: &str, ids: &[String]) -> Result<(), RedisStreamError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisStreamError::Connection(e.to_string()))?;

        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(group)
            .arg(ids)
            .query(&mut conn)
            .map_err(|e| RedisStreamError::Command(format!("XACK failed: {e}")))?;

        Ok(())
    }

    fn send_to_dlq_sync(
        &self,
        raw_payload: &str,
        original_id: &str,
        retry_count: u32,
    ) -> Result<(), RedisStreamError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisStreamError::Connection(e.to_string()))?;

        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("original_message_id")
            .arg(original_id)
            .arg("retry_count")
            .arg(retry_count.to_string())
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("payload")
            .arg(raw_payload)
            .query(&mut conn)
            .map_err(|e| RedisStreamError::Command(format!("DLQ XADD failed: {e}")))?;

        warn!(
            message_id = %original_id,
            retry_count,
            dlq = %self.dlq_key,
            "message dead-lettered"
        );
        Ok(())
    }

    /// Claim pending entries idle past the timeout, then read new ones.
    fn read_group_sync(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<RawMessage>, RedisStreamError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisStreamError::Connection(e.to_string()))?;

        let reclaimed = self.autoclaim_sync(&mut conn, group, consumer, count)?;
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }

        self.read_new_sync(&mut conn, group, consumer, count, block_ms)
    }

    fn autoclaim_sync(
        &self,
        conn: &mut redis::Connection,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<RawMessage>, RedisStreamError> {
        // XAUTOCLAIM transfers ownership of entries pending longer than the
        // idle timeout and reports their delivery count via XPENDING below.
        let reply: redis::RedisResult<redis::Value> = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(group)
            .arg(consumer)
            .arg(self.pending_timeout_ms.to_string())
            .arg("0-0")
            .arg("COUNT")
            .arg(count.to_string())
            .query(conn);

        let entries = match reply {
            // Reply shape: [next_cursor, [entries...], (deleted...)]
            Ok(redis::Value::Bulk(mut parts)) if parts.len() >= 2 => {
                match parts.swap_remove(1) {
                    redis::Value::Bulk(entries) => entries,
                    _ => return Ok(vec![]),
                }
            }
            _ => return Ok(vec![]),
        };

        let mut messages = Vec::new();
        for entry in entries {
            if let Some(mut msg) = parse_entry(entry) {
                msg.retry_count = self.delivery_count_sync(conn, group, &msg.message_id);
                messages.push(msg);
            }
        }
        Ok(messages)
    }

    fn delivery_count_sync(
        &self,
        conn: &mut redis::Connection,
        group: &str,
        message_id: &str,
    ) -> u32 {
        let reply: redis::RedisResult<Vec<(String, String, u64, u64)>> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(group)
            .arg(message_id)
            .arg(message_id)
            .arg("1")
            .query(conn);

        match reply {
            Ok(rows) => rows
                .first()
                .map(|(_, _, _, deliveries)| *deliveries as u32)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn read_new_sync(
        &self,
        conn: &mut redis::Connection,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<RawMessage>, RedisStreamError> {
        let reply: redis::RedisResult<redis::Value> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count.to_string())
            .arg("BLOCK")
            .arg(block_ms.to_string())
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(conn);

        let streams = match reply {
            Ok(redis::Value::Bulk(streams)) => streams,
            // Nil reply = blocking timeout with no new entries.
            Ok(_) => return Ok(vec![]),
            Err(e) => {
                return Err(RedisStreamError::Command(format!("XREADGROUP failed: {e}")));
            }
        };

        let mut messages = Vec::new();
        for stream in streams {
            // Stream shape: [key, [entries...]]
            let redis::Value::Bulk(mut parts) = stream else {
                continue;
            };
            if parts.len() < 2 {
                continue;
            }
            if let redis::Value::Bulk(entries) = parts.swap_remove(1) {
                messages.extend(entries.into_iter().filter_map(parse_entry));
            }
        }
        Ok(messages)
    }
}

/// A stream entry before payload decoding.
#[derive(Debug, Clone)]
struct RawMessage {
    message_id: String,
    payload: String,
    retry_count: u32,
}

/// Entry shape: `[message_id, [field, value, ...]]`.
fn parse_entry(entry: redis::Value) -> Option<RawMessage> {
    let redis::Value::Bulk(parts) = entry else {
        return None;
    };
    if parts.len() < 2 {
        return None;
    }

    let message_id = match &parts[0] {
        redis::Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        _ => return None,
    };

    let redis::Value::Bulk(fields) = &parts[1] else {
        return None;
    };

    let mut payload = None;
    for pair in fields.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = pair {
            if key.as_slice() == b"payload".as_slice() {
                payload = Some(String::from_utf8_lossy(value).to_string());
            }
        }
    }

    payload.map(|payload| RawMessage {
        message_id,
        payload,
        retry_count: 0,
    })
}

impl<M> RedisStreamBus<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    /// Subscribe through a consumer group.
    ///
    /// A background thread polls the group, forwards decoded payloads into
    /// the subscription channel, and acknowledges them. Messages that
    /// exhaust their redelivery budget are moved to the dead-letter stream
    /// instead of being delivered again.
    pub fn subscribe_with_group(&self, group: &str, consumer: &str) -> Subscription<M> {
        if let Err(e) = self.ensure_consumer_group(group) {
            error!(group, error = %e, "failed to ensure consumer group");
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let bus = self.clone();
        let group = group.to_string();
        let consumer = consumer.to_string();

        std::thread::spawn(move || {
            loop {
                let batch = match bus.read_group_sync(&group, &consumer, 10, 100) {
                    Ok(batch) => batch,
                    Err(e) => {
                        error!(stream = %bus.stream_key, error = %e, "stream read failed");
                        std::thread::sleep(POLL_INTERVAL);
                        continue;
                    }
                };

                let mut acked = Vec::new();
                for msg in batch {
                    if msg.retry_count >= bus.max_retries {
                        if let Err(e) =
                            bus.send_to_dlq_sync(&msg.payload, &msg.message_id, msg.retry_count)
                        {
                            error!(error = %e, "dead-letter write failed");
                            continue; // stays pending for a later claim
                        }
                        acked.push(msg.message_id);
                        continue;
                    }

                    match serde_json::from_str::<M>(&msg.payload) {
                        Ok(decoded) => {
                            if tx.send(decoded).is_err() {
                                return; // receiver dropped
                            }
                            acked.push(msg.message_id);
                        }
                        Err(e) => {
                            // Malformed payloads are logged and dropped so
                            // they cannot wedge the partition.
                            warn!(message_id = %msg.message_id, error = %e, "malformed message dropped");
                            acked.push(msg.message_id);
                        }
                    }
                }

                if let Err(e) = bus.acknowledge_sync(&group, &acked) {
                    error!(error = %e, "acknowledge failed");
                }

                std::thread::sleep(POLL_INTERVAL);
            }
        });

        Subscription::new(rx)
    }
}

impl<M> StreamBus<M> for RedisStreamBus<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    type Error = RedisStreamError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        self.publish_sync(&message)
    }

    fn subscribe(&self) -> Subscription<M> {
        // Ephemeral consumer in a throwaway group; pipelines use
        // subscribe_with_group with the configured group ids.
        self.subscribe_with_group(
            "default",
            &format!("consumer-{}", uuid::Uuid::now_v7()),
        )
    }
}

/// The four pipeline topics over one Redis instance.
pub struct RedisTopics {
    pub events: RedisStreamBus<meterflow_telemetry::TelemetryEvent>,
    pub late: RedisStreamBus<meterflow_events::LateEnvelope<meterflow_telemetry::TelemetryEvent>>,
    pub usage: RedisStreamBus<meterflow_metering::FinalizedUsage>,
    pub charges: RedisStreamBus<meterflow_pricing::RatedCharge>,
}

impl RedisTopics {
    pub fn open(redis_url: impl AsRef<str>) -> Result<Self, RedisStreamError> {
        use meterflow_events::topics;

        let url = redis_url.as_ref();
        Ok(Self {
            events: RedisStreamBus::new(url, topics::TELEMETRY_EVENTS)?,
            late: RedisStreamBus::new(url, topics::TELEMETRY_EVENTS_LATE)?,
            usage: RedisStreamBus::new(url, topics::AGGREGATED_USAGE)?,
            charges: RedisStreamBus::new(url, topics::RATED_CHARGES)?,
        })
    }
}
