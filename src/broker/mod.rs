//! Broker client capability.
//!
//! A broker accepts messages for named channels. Sending only enqueues;
//! `flush` blocks until every enqueued message has been acknowledged, which is
//! what makes a publish synchronous.

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BrokerResult;

mod tcp;

pub use tcp::TcpBroker;

#[async_trait]
pub trait Broker: Send + Sync + Debug {
    /// Enqueue `payload` for `channel`.
    async fn send(&self, channel: &str, payload: Bytes) -> BrokerResult<()>;

    /// Wait for acknowledgement of everything enqueued so far.
    async fn flush(&self) -> BrokerResult<()>;
}
