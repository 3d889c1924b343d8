#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{
    SinkExt, StreamExt,
    channel::mpsc as fmpsc,
    future::{self, BoxFuture},
};
use fwdpanel_client::{
    ChannelClient, ChannelConfig, ChannelError, ConnectionState, Envelope,
    transport::{Connector, Transport},
};
use fwdpanel_core::BackoffPolicy;
use serde_json::Value;
use tokio::{
    sync::mpsc,
    time::{Instant, timeout},
};

pub const URL: &str = "ws://127.0.0.1:8080/ws";

/// What the scripted connector does with the next connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Fail,
    Hang,
    Accept,
}

/// Server side of an accepted in-memory transport.
pub struct MockServer {
    pub from_client: fmpsc::UnboundedReceiver<String>,
    pub to_client: fmpsc::UnboundedSender<Result<String, ChannelError>>,
}

impl MockServer {
    pub fn push(&self, text: impl Into<String>) {
        self.to_client
            .unbounded_send(Ok(text.into()))
            .expect("client stream alive");
    }

    pub fn push_error(&self, message: &str) {
        self.to_client
            .unbounded_send(Err(ChannelError::Transport(message.to_owned())))
            .expect("client stream alive");
    }

    /// Next frame the client wrote, parsed as JSON.
    pub async fn next_json(&mut self) -> Option<Value> {
        let text = self.from_client.next().await?;
        serde_json::from_str(&text).ok()
    }

    /// Ends the client's read stream, as if the peer had gone away.
    pub fn drop_connection(self) {}
}

struct Script {
    steps: VecDeque<Step>,
    fallback: Step,
    attempts: Vec<Instant>,
}

#[derive(Clone)]
pub struct MockConnector {
    script: Arc<Mutex<Script>>,
    servers: mpsc::UnboundedSender<MockServer>,
}

impl MockConnector {
    pub fn new(steps: &[Step], fallback: Step) -> (Self, mpsc::UnboundedReceiver<MockServer>) {
        let (servers, servers_rx) = mpsc::unbounded_channel();
        let connector = Self {
            script: Arc::new(Mutex::new(Script {
                steps: steps.iter().copied().collect(),
                fallback,
                attempts: Vec::new(),
            })),
            servers,
        };
        (connector, servers_rx)
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.script.lock().unwrap().attempts.clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.script.lock().unwrap().attempts.len()
    }
}

impl Connector for MockConnector {
    fn connect(&self, _url: &str) -> BoxFuture<'static, Result<Transport, ChannelError>> {
        let step = {
            let mut script = self.script.lock().unwrap();
            script.attempts.push(Instant::now());
            let fallback = script.fallback;
            script.steps.pop_front().unwrap_or(fallback)
        };

        match step {
            Step::Fail => Box::pin(future::ready(Err(ChannelError::Transport(
                "connection refused".to_owned(),
            )))),
            Step::Hang => Box::pin(future::pending()),
            Step::Accept => {
                let (client_tx, from_client) = fmpsc::unbounded::<String>();
                let (to_client, client_rx) = fmpsc::unbounded::<Result<String, ChannelError>>();
                let _ = self.servers.send(MockServer {
                    from_client,
                    to_client,
                });
                let sink = client_tx.sink_map_err(|_| ChannelError::Closed);
                Box::pin(future::ready(Ok(Transport::new(sink, client_rx))))
            }
        }
    }
}

pub fn fast_config(max_attempts: u32) -> ChannelConfig {
    ChannelConfig {
        heartbeat_interval: Duration::from_secs(30),
        pong_timeout: None,
        connect_timeout: Duration::from_secs(10),
        reconnect: BackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(1_000),
            max_attempts,
        ),
    }
}

/// Forwards every envelope a handler sees into a channel the test can await.
pub fn recorder() -> (
    impl Fn(&Envelope) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Envelope>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |envelope: &Envelope| {
            let _ = tx.send(envelope.clone());
        },
        rx,
    )
}

pub fn client_with(connector: &MockConnector, config: ChannelConfig) -> ChannelClient {
    ChannelClient::with_connector(URL, config, Arc::new(connector.clone())).expect("valid client")
}

pub async fn wait_for_state(client: &ChannelClient, want: ConnectionState) {
    let mut rx = client.state_receiver();
    timeout(Duration::from_secs(120), rx.wait_for(|state| *state == want))
        .await
        .unwrap_or_else(|_| panic!("client never reached {want}"))
        .expect("state channel open");
}
