use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::Offset;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const SEEK_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The payload can never be processed; retrying is pointless.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// Processing failed and may succeed on another attempt.
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: &str, payload: &str) -> Result<(), HandlerError>;
}

/// What to do with a message's offset once handling stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handled, or can never be handled. Commit it.
    Ack,
    /// Still failing after every attempt. Must not be committed.
    Redeliver,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Longest wait between attempts; also the pause before a rewound
    /// message is fetched again.
    pub fn max_delay(&self) -> Duration {
        backoff(self.backoff, u32::MAX)
    }
}

/// Runs the handler with retries. Malformed payloads are acknowledged so they
/// never stall a partition; a message that keeps failing is handed back.
pub async fn deliver<H: MessageHandler + ?Sized>(
    handler: &H,
    topic: &str,
    payload: &str,
    policy: RetryPolicy,
) -> Delivery {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match handler.handle(topic, payload).await {
            Ok(()) => return Delivery::Ack,
            Err(HandlerError::Malformed(reason)) => {
                warn!("Dropping malformed message on {}: {}", topic, reason);
                return Delivery::Ack;
            }
            Err(HandlerError::Failed(reason)) if attempt >= max_attempts => {
                error!(
                    "Message on {} still failing after {} attempts, leaving it for redelivery: {}",
                    topic, attempt, reason
                );
                return Delivery::Redeliver;
            }
            Err(HandlerError::Failed(reason)) => {
                let delay = backoff(policy.backoff, attempt);
                warn!(
                    "Attempt {} for message on {} failed, retrying in {:?}: {}",
                    attempt, topic, delay, reason
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// At-least-once consumer. Offsets are committed by hand, and only for
/// messages that were handled or can never be handled. A message whose handler
/// keeps failing is rewound and fetched again.
pub struct EventConsumer {
    consumer: StreamConsumer,
    retry: RetryPolicy,
}

impl EventConsumer {
    pub fn new(
        brokers: &str,
        group_id: &str,
        topics: &[&str],
        max_attempts: u32,
        retry_backoff_ms: u64,
    ) -> Result<Self, rdkafka::error::KafkaError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        consumer.subscribe(topics)?;
        info!("Subscribed to {:?} as {}", topics, group_id);

        Ok(Self {
            consumer,
            retry: RetryPolicy {
                max_attempts: max_attempts.max(1),
                backoff: Duration::from_millis(retry_backoff_ms),
            },
        })
    }

    pub async fn run<H: MessageHandler>(&self, handler: &H) {
        loop {
            match self.consumer.recv().await {
                Err(e) => error!("Kafka error: {}", e),
                Ok(m) => match self.process(&m, handler).await {
                    Delivery::Ack => {
                        if let Err(e) = self.consumer.commit_message(&m, CommitMode::Async) {
                            error!("Failed to commit offset {} on {}: {}", m.offset(), m.topic(), e);
                        }
                    }
                    Delivery::Redeliver => self.rewind(&m).await,
                },
            }
        }
    }

    async fn process<H: MessageHandler>(&self, m: &BorrowedMessage<'_>, handler: &H) -> Delivery {
        let topic = m.topic();
        let payload = match m.payload_view::<str>() {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                warn!("Dropping non-UTF-8 message on {}: {}", topic, e);
                return Delivery::Ack;
            }
            None => {
                warn!("Dropping empty message on {}", topic);
                return Delivery::Ack;
            }
        };

        let delivery = deliver(handler, topic, payload, self.retry).await;
        if delivery == Delivery::Ack {
            debug!("Done with message at offset {} on {}", m.offset(), topic);
        }
        delivery
    }

    /// Points the partition back at `m` so the next fetch returns it again.
    /// If the partition was revoked the seek fails; the new owner starts from
    /// the last committed offset, which is still before `m`.
    async fn rewind(&self, m: &BorrowedMessage<'_>) {
        tokio::time::sleep(self.retry.max_delay()).await;
        for attempt in 1..=SEEK_ATTEMPTS {
            match self
                .consumer
                .seek(m.topic(), m.partition(), Offset::Offset(m.offset()), SEEK_TIMEOUT)
            {
                Ok(()) => {
                    info!("Rewound {}[{}] to offset {}", m.topic(), m.partition(), m.offset());
                    return;
                }
                Err(e) => warn!(
                    "Seek to offset {} on {}[{}] failed (attempt {}): {}",
                    m.offset(),
                    m.topic(),
                    m.partition(),
                    attempt,
                    e
                ),
            }
        }
        error!(
            "Could not rewind {}[{}] to offset {}; it stays uncommitted",
            m.topic(),
            m.partition(),
            m.offset()
        );
    }
}

/// Doubles per attempt, capped at 32x the base delay.
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    base * 2u32.pow(attempt.saturating_sub(1).min(5))
}
