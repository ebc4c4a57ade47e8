//! Framed TCP producer.
//!
//! Wire format, one frame per message:
//!
//! ```text
//! PUB <channel> <len>\n<len payload bytes>\n
//! ```
//!
//! The broker answers every frame, in order, with `+OK` or `-ERR <reason>`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

use super::Broker;
use crate::config::BrokerConfig;
use crate::error::{AgentError, AgentResult, BrokerError, BrokerResult};

const ACK_OK: &str = "+OK";
const ACK_ERR: &str = "-ERR";

/// One long-lived connection, re-established lazily after it breaks.
#[derive(Debug)]
pub struct TcpBroker {
    address: String,
    connect_timeout: Duration,
    send_timeout: Duration,
    connection: TokioMutex<Option<BufReader<TcpStream>>>,
    pending: Mutex<Vec<(String, Bytes)>>,
}

impl TcpBroker {
    /// Connect at startup. Any failure here is fatal for the agent.
    pub async fn connect(config: &BrokerConfig) -> AgentResult<Self> {
        let stream = open(&config.address, config.connect_timeout())
            .await
            .map_err(|e| AgentError::startup_connectivity(&config.address, e))?;

        info!(target: "telemetry::broker", address = %config.address, "Connected to broker");

        Ok(Self {
            address: config.address.clone(),
            connect_timeout: config.connect_timeout(),
            send_timeout: config.send_timeout(),
            connection: TokioMutex::new(Some(BufReader::new(stream))),
            pending: Mutex::new(Vec::new()),
        })
    }

    async fn exchange(
        connection: &mut BufReader<TcpStream>,
        batch: &[(String, Bytes)],
    ) -> BrokerResult<()> {
        let mut frames = Vec::new();
        for (channel, payload) in batch {
            frames.extend_from_slice(format!("PUB {} {}\n", channel, payload.len()).as_bytes());
            frames.extend_from_slice(payload);
            frames.push(b'\n');
        }
        connection.get_mut().write_all(&frames).await?;
        connection.get_mut().flush().await?;

        let mut rejection = None;
        let mut line = String::new();
        for _ in batch {
            line.clear();
            if connection.read_line(&mut line).await? == 0 {
                return Err(BrokerError::disconnected("connection closed before acknowledgement"));
            }
            match line.trim_end() {
                ACK_OK => {}
                reply => match reply.strip_prefix(ACK_ERR) {
                    Some(reason) => {
                        rejection.get_or_insert_with(|| reason.trim().to_string());
                    }
                    None => {
                        let reason = format!("unexpected reply '{}'", reply);
                        return Err(BrokerError::disconnected(reason));
                    }
                },
            }
        }

        match rejection {
            Some(reason) => Err(BrokerError::rejected(reason)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Broker for TcpBroker {
    async fn send(&self, channel: &str, payload: Bytes) -> BrokerResult<()> {
        if channel.is_empty() || channel.contains(char::is_whitespace) {
            return Err(BrokerError::rejected(format!("invalid channel name '{}'", channel)));
        }
        self.pending.lock().push((channel.to_string(), payload));
        Ok(())
    }

    async fn flush(&self) -> BrokerResult<()> {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(());
        }

        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            debug!(target: "telemetry::broker", address = %self.address, "Reconnecting to broker");
            let stream = open(&self.address, self.connect_timeout).await?;
            *guard = Some(BufReader::new(stream));
        }

        let Some(connection) = guard.as_mut() else {
            return Err(BrokerError::disconnected("no connection"));
        };

        let exchange = Self::exchange(connection, &batch);
        let result = match tokio::time::timeout(self.send_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::timeout("flush", self.send_timeout.as_millis() as u64)),
        };

        // Replies may still be in flight or the stream is gone; start clean.
        if let Err(err) = &result {
            if !matches!(err, BrokerError::Rejected { .. }) {
                warn!(target: "telemetry::broker", error = %err, "Dropping broker connection");
                *guard = None;
            }
        }
        result
    }
}

async fn open(address: &str, timeout: Duration) -> BrokerResult<TcpStream> {
    tokio::select! {
        _ = tokio::time::sleep(timeout) => {
            Err(BrokerError::timeout(format!("connect {}", address), timeout.as_millis() as u64))
        }
        stream = TcpStream::connect(address) => {
            let stream = stream.map_err(BrokerError::disconnected)?;
            stream.set_nodelay(true)?;
            Ok(stream)
        }
    }
}
