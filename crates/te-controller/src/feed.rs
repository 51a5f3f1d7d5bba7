//! Flow event feed
//!
//! Newline-delimited JSON over TCP, one event per line:
//!
//! ```text
//! {"type":"started","src":"10.0.1.7/24","dst":"10.0.2.0/24","size":500000}
//! {"type":"ended","id":"6f1c..."}
//! {"type":"reevaluate","id":"6f1c..."}
//! ```

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use te_engine::{FlowEvent, FlowId, FlowSource, FlowSpec};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Wire form of a flow event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    Started {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<FlowId>,
        src: IpNetwork,
        dst: IpNetwork,
        /// Bits per second
        size: u64,
    },
    Ended {
        id: FlowId,
    },
    Reevaluate {
        id: FlowId,
    },
}

impl From<WireEvent> for FlowEvent {
    fn from(event: WireEvent) -> Self {
        match event {
            WireEvent::Started { id, src, dst, size } => {
                let spec = FlowSpec::new(src, dst, size);
                FlowEvent::Started(match id {
                    Some(id) => spec.with_id(id),
                    None => spec,
                })
            }
            WireEvent::Ended { id } => FlowEvent::Ended(id),
            WireEvent::Reevaluate { id } => FlowEvent::Reevaluate(id),
        }
    }
}

/// Decode one feed line
pub fn parse_line(line: &str) -> Result<FlowEvent, serde_json::Error> {
    serde_json::from_str::<WireEvent>(line).map(FlowEvent::from)
}

/// Bounded event queue between listeners and the worker
pub fn channel(queue_size: usize) -> (mpsc::Sender<FlowEvent>, ChannelFlowSource) {
    let (tx, rx) = mpsc::channel(queue_size);
    (tx, ChannelFlowSource { rx })
}

/// `FlowSource` reading from the event queue
#[derive(Debug)]
pub struct ChannelFlowSource {
    rx: mpsc::Receiver<FlowEvent>,
}

#[async_trait]
impl FlowSource for ChannelFlowSource {
    async fn next_event(&mut self) -> Option<FlowEvent> {
        self.rx.recv().await
    }
}

/// TCP listener of the flow feed
pub struct FeedListener {
    listener: TcpListener,
    events: mpsc::Sender<FlowEvent>,
}

impl FeedListener {
    /// Bind the feed socket
    pub async fn bind(addr: SocketAddr, events: mpsc::Sender<FlowEvent>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, events })
    }

    /// Bound address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> std::io::Result<()> {
        info!(addr = %self.local_addr()?, "Flow feed listening");
        loop {
            let (socket, peer) = self.listener.accept().await?;
            debug!(peer = %peer, "Flow feed connection");
            let events = self.events.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, peer, events).await {
                    warn!(peer = %peer, error = %e, "Flow feed connection error");
                }
            });
        }
    }
}

async fn handle_connection(socket: TcpStream, peer: SocketAddr, events: mpsc::Sender<FlowEvent>) -> std::io::Result<()> {
    let mut lines = BufReader::new(socket).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event = match parse_line(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Malformed flow event skipped");
                continue;
            }
        };
        if events.send(event).await.is_err() {
            debug!(peer = %peer, "Worker gone, closing feed connection");
            break;
        }
    }
    debug!(peer = %peer, "Flow feed connection closed");
    Ok(())
}
