// ============================================================================
// PUBLISHER
// ============================================================================
// Serializes a message and delivers it to one channel. Delivery is an explicit
// state machine:
//
//   Attempting --ack--------------------------> Sent
//   Attempting --timeout, retries left--> Waiting --delay--> Attempting
//   Attempting --timeout, retries spent-------> Failed
//   Attempting --any other broker error-------> Failed
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::broker::Broker;
use crate::config::PublishConfig;
use crate::error::{BrokerError, BrokerResult, PublishError};

// ----------------------------------------------------------------------------
// Retry Policy
// ----------------------------------------------------------------------------

/// Bounded exponential backoff for timed-out sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn from_config(config: &PublishConfig) -> Self {
        Self::new(config.max_retries, config.base_delay())
    }

    /// `base_delay * 2^(attempt - 1)` for the 1-based timed-out attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    /// Total time spent sleeping when every attempt times out.
    pub fn worst_case_wait(&self) -> Duration {
        (1..=self.max_retries).map(|attempt| self.delay_for(attempt)).sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PublishConfig::default())
    }
}

// ----------------------------------------------------------------------------
// Delivery State Machine
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Sending; `attempt` counts timeouts so far
    Attempting { attempt: u32 },
    /// Backing off before the next attempt
    Waiting { attempt: u32, delay: Duration },
    Sent,
    Failed,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Sent | DeliveryState::Failed)
    }
}

/// Attempts and backoff delays of a single publish call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    pub timeouts: u32,
    pub delays: Vec<Duration>,
}

impl RetryState {
    pub fn retries(&self) -> u32 {
        self.delays.len() as u32
    }
}

/// Terminal outcome of a publish call.
#[derive(Debug)]
pub struct PublishReport {
    pub channel: String,
    pub state: DeliveryState,
    pub retry: RetryState,
    pub error: Option<PublishError>,
}

impl PublishReport {
    pub fn is_success(&self) -> bool {
        self.state == DeliveryState::Sent
    }

    pub fn retries(&self) -> u32 {
        self.retry.retries()
    }

    pub fn into_result(self) -> Result<(), PublishError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// ----------------------------------------------------------------------------
// Publisher
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    policy: RetryPolicy,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, policy: RetryPolicy) -> Self {
        Self { broker, policy }
    }

    /// Publish with the configured retry policy.
    pub async fn publish<T>(&self, channel: &str, message: &T) -> PublishReport
    where
        T: Serialize + ?Sized,
    {
        self.publish_with(channel, message, self.policy).await
    }

    /// Serialize `message` and deliver it to `channel`, returning only once
    /// it is acknowledged or given up on. Dropped messages are not requeued.
    pub async fn publish_with<T>(
        &self,
        channel: &str,
        message: &T,
        policy: RetryPolicy,
    ) -> PublishReport
    where
        T: Serialize + ?Sized,
    {
        let mut report = PublishReport {
            channel: channel.to_string(),
            state: DeliveryState::Attempting { attempt: 0 },
            retry: RetryState::default(),
            error: None,
        };

        let payload = match serde_json::to_vec(message) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                error!(
                    target: "telemetry::publisher",
                    channel,
                    error = %e,
                    "Failed to serialize message"
                );
                report.state = DeliveryState::Failed;
                report.error = Some(PublishError::Serialization {
                    channel: channel.to_string(),
                    message: e.to_string(),
                });
                return report;
            }
        };

        while !report.state.is_terminal() {
            report.state = match report.state {
                DeliveryState::Attempting { attempt } => {
                    match self.deliver(channel, &payload).await {
                        Ok(()) => {
                            debug!(
                                target: "telemetry::publisher",
                                channel,
                                attempt,
                                bytes = payload.len(),
                                "Message sent"
                            );
                            DeliveryState::Sent
                        }
                        Err(err) => Self::after_failure(&mut report, attempt, err, policy),
                    }
                }
                DeliveryState::Waiting { attempt, delay } => {
                    debug!(
                        target: "telemetry::publisher",
                        channel,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Backing off"
                    );
                    tokio::time::sleep(delay).await;
                    report.retry.delays.push(delay);
                    DeliveryState::Attempting { attempt }
                }
                terminal => terminal,
            };
        }

        report
    }

    /// Next state after a failed attempt: back off on a timeout with retries
    /// left, otherwise record why the message was dropped.
    fn after_failure(
        report: &mut PublishReport,
        attempt: u32,
        err: BrokerError,
        policy: RetryPolicy,
    ) -> DeliveryState {
        let channel = report.channel.as_str();

        if !err.is_transient() {
            error!(
                target: "telemetry::publisher",
                channel,
                error = %err,
                "Broker error, message dropped"
            );
            report.error = Some(PublishError::Broker {
                channel: channel.to_string(),
                source: err,
            });
            return DeliveryState::Failed;
        }

        let attempt = attempt + 1;
        report.retry.timeouts = attempt;
        warn!(
            target: "telemetry::publisher",
            channel,
            attempt,
            max_retries = policy.max_retries,
            error = %err,
            "Timeout sending to {} (attempt {}/{})",
            channel,
            attempt,
            policy.max_retries
        );

        if attempt > policy.max_retries {
            error!(
                target: "telemetry::publisher",
                channel,
                attempts = attempt,
                "Maximum number of attempts met"
            );
            report.error = Some(PublishError::SendTimeout {
                channel: channel.to_string(),
                attempts: attempt,
            });
            return DeliveryState::Failed;
        }

        DeliveryState::Waiting { attempt, delay: policy.delay_for(attempt) }
    }

    async fn deliver(&self, channel: &str, payload: &Bytes) -> BrokerResult<()> {
        self.broker.send(channel, payload.clone()).await?;
        self.broker.flush().await
    }
}
