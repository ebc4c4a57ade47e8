//! Publisher and TcpBroker against an in-process broker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use telemetry_agent::config::BrokerConfig;
use telemetry_agent::{Broker, DeliveryState, PublishError, Publisher, RetryPolicy, TcpBroker};

#[derive(Debug, Clone, Copy)]
enum Reply {
    Ack,
    Reject,
    Silent,
}

/// Accepts connections and answers every frame according to `replies`,
/// falling back to `Ack` once the list is exhausted.
async fn spawn_broker(replies: Vec<Reply>) -> (String, Arc<Mutex<Vec<(String, String)>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let received = Arc::new(Mutex::new(Vec::new()));
    let replies = Arc::new(Mutex::new(replies.into_iter().collect::<VecDeque<_>>()));

    let sink = received.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            let sink = sink.clone();
            let replies = replies.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stream);
                let mut header = String::new();
                loop {
                    header.clear();
                    if reader.read_line(&mut header).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let parts: Vec<&str> = header.split_whitespace().collect();
                    assert_eq!(parts[0], "PUB");
                    let len: usize = parts[2].parse().unwrap();
                    let mut payload = vec![0u8; len + 1];
                    reader.read_exact(&mut payload).await.unwrap();
                    payload.pop();
                    sink.lock().push((parts[1].to_string(), String::from_utf8(payload).unwrap()));

                    let reply = replies.lock().pop_front().unwrap_or(Reply::Ack);
                    let line: &[u8] = match reply {
                        Reply::Ack => b"+OK\n",
                        Reply::Reject => b"-ERR not authorized\n",
                        Reply::Silent => continue,
                    };
                    if reader.get_mut().write_all(line).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    (address, received)
}

fn config(address: String) -> BrokerConfig {
    BrokerConfig {
        address,
        connect_timeout_ms: 1_000,
        send_timeout_ms: 100,
    }
}

#[tokio::test]
async fn publish_is_acknowledged() {
    let (address, received) = spawn_broker(vec![]).await;
    let broker = Arc::new(TcpBroker::connect(&config(address)).await.unwrap());
    let publisher = Publisher::new(broker, RetryPolicy::new(3, Duration::from_millis(10)));

    let report = publisher
        .publish("cpu_stats", &serde_json::json!({"host": "node-1", "cpu_count": 4}))
        .await;

    assert!(report.is_success());
    assert_eq!(
        received.lock().clone(),
        vec![("cpu_stats".to_string(), r#"{"cpu_count":4,"host":"node-1"}"#.to_string())]
    );
}

#[tokio::test]
async fn rejection_is_not_retried() {
    let (address, received) = spawn_broker(vec![Reply::Reject]).await;
    let broker = Arc::new(TcpBroker::connect(&config(address)).await.unwrap());
    let publisher = Publisher::new(broker, RetryPolicy::new(3, Duration::from_millis(10)));

    let report = publisher.publish("disk_stats", &serde_json::json!({})).await;

    assert_eq!(report.state, DeliveryState::Failed);
    assert_eq!(report.retries(), 0);
    assert!(matches!(report.error, Some(PublishError::Broker { .. })));
    assert_eq!(received.lock().len(), 1);
}

#[tokio::test]
async fn silent_broker_times_out_then_recovers_on_new_connection() {
    let (address, received) = spawn_broker(vec![Reply::Silent]).await;
    let broker = Arc::new(TcpBroker::connect(&config(address)).await.unwrap());
    let publisher = Publisher::new(broker, RetryPolicy::new(3, Duration::from_millis(10)));

    let report = publisher.publish("memory_stats", &serde_json::json!({"a": 1})).await;

    assert!(report.is_success());
    assert_eq!(report.retries(), 1);
    assert_eq!(report.retry.delays, [Duration::from_millis(10)]);
    // The timed-out message was re-sent, not requeued by the broker client.
    assert_eq!(received.lock().len(), 2);
}

#[tokio::test]
async fn flush_without_messages_is_a_no_op() {
    let (address, received) = spawn_broker(vec![]).await;
    let broker = TcpBroker::connect(&config(address)).await.unwrap();

    broker.flush().await.unwrap();
    assert!(received.lock().is_empty());
}
