//! TCP control channel.
//!
//! One tokio task owns the [`Publisher`] and multiplexes four sources of
//! work: the accept listener, frames read from connected consumers, the
//! heartbeat timer and the housekeeping timer. Every connection gets a reader
//! task that cuts the byte stream into frames and a writer task that drains
//! the proxy's outbound queue.
//!
//! ```text
//! accept ──► register_client ──► [reader task] ──Frame──┐
//!                             └─► [writer task] ◄── ConsumerProxy
//! heartbeat tick ─────────────────────────────────────────┤──► Publisher
//! housekeeping tick ──────────────────────────────────────┤
//! admin (clear book) ─────────────────────────────────────┘
//! ```

use std::{net::SocketAddr, time::Duration};

use ahash::AHashMap;
use anyhow::Result;
use mdx_core::{
    protocol::{FrameHeader, HEADER_LEN},
    time_util::now_ms,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::publisher::Publisher;

enum ConnEvent {
    Frame(u64, Vec<u8>),
    Closed(u64),
}

/// Operator requests injected into the control loop.
#[derive(Debug, Clone)]
pub enum AdminCommand {
    ClearBook { exchange: u16, symbol: Option<String> },
}

/// Running control endpoint.
pub struct ControlChannel {
    local_addr: SocketAddr,
    admin_tx: mpsc::UnboundedSender<AdminCommand>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl ControlChannel {
    /// Bind `addr` and start serving with `publisher`.
    pub async fn start(addr: SocketAddr, publisher: Publisher) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (admin_tx, admin_rx) = mpsc::unbounded_channel();
        info!("[control] listening on {local_addr}");

        let task = tokio::spawn(control_loop(listener, publisher, admin_rx, shutdown_rx));
        Ok(Self { local_addr, admin_tx, shutdown_tx: Some(shutdown_tx), task: Some(task) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Blank one book (or all books) of `exchange` on the next loop turn.
    pub fn clear_book(&self, exchange: u16, symbol: Option<&str>) -> bool {
        self.admin_tx.send(AdminCommand::ClearBook { exchange, symbol: symbol.map(str::to_string) }).is_ok()
    }

    /// Stop serving, drop every session and wait for the loop to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn control_loop(
    listener: TcpListener,
    mut publisher: Publisher,
    mut admin_rx: mpsc::UnboundedReceiver<AdminCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut readers: AHashMap<u64, JoinHandle<()>> = AHashMap::new();
    let mut next_conn_id: u64 = 1;

    let mut heartbeat = tokio::time::interval(Duration::from_millis(publisher.settings().heartbeat_interval_ms));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut house_keeping =
        tokio::time::interval(Duration::from_millis(publisher.settings().house_keeping_interval_ms));
    house_keeping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("[control] shutdown signal received");
                break;
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn_id = next_conn_id;
                    next_conn_id += 1;
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("[control] conn {conn_id}: set_nodelay: {e}");
                    }
                    let (read_half, write_half) = stream.into_split();
                    let (out_tx, out_rx) = mpsc::unbounded_channel();
                    publisher.register_client(conn_id, peer, out_tx, now_ms());
                    tokio::spawn(write_loop(conn_id, write_half, out_rx));
                    readers.insert(conn_id, tokio::spawn(read_loop(conn_id, read_half, event_tx.clone())));
                    info!("[control] conn {conn_id} accepted from {peer}");
                }
                Err(e) => warn!("[control] accept failed: {e}"),
            },

            Some(event) = event_rx.recv() => match event {
                ConnEvent::Frame(conn_id, frame) => publisher.on_frame(conn_id, &frame, now_ms()),
                ConnEvent::Closed(conn_id) => publisher.unregister_client(conn_id),
            },

            Some(command) = admin_rx.recv() => match command {
                AdminCommand::ClearBook { exchange, symbol } => {
                    publisher.clear_book(exchange, symbol.as_deref());
                }
            },

            _ = heartbeat.tick() => publisher.send_control_heartbeats(),

            _ = house_keeping.tick() => {
                publisher.on_house_keeping(now_ms());
            }
        }

        for conn_id in publisher.take_closed() {
            if let Some(reader) = readers.remove(&conn_id) {
                reader.abort();
            }
        }
    }

    publisher.shutdown();
    for (_, reader) in readers.drain() {
        reader.abort();
    }
    info!("[control] loop exited");
}

/// Cut the stream into header + payload frames.
async fn read_loop(conn_id: u64, mut stream: OwnedReadHalf, events: mpsc::UnboundedSender<ConnEvent>) {
    let mut header = [0u8; HEADER_LEN];
    loop {
        if let Err(e) = stream.read_exact(&mut header).await {
            debug!("[control] conn {conn_id}: read ended: {e}");
            break;
        }
        let size = match FrameHeader::decode(&header) {
            Ok(h) => h.size as usize,
            Err(e) => {
                warn!("[control] conn {conn_id}: bad header: {e}");
                break;
            }
        };
        let mut frame = vec![0u8; HEADER_LEN + size];
        frame[..HEADER_LEN].copy_from_slice(&header);
        if let Err(e) = stream.read_exact(&mut frame[HEADER_LEN..]).await {
            warn!("[control] conn {conn_id}: truncated frame: {e}");
            break;
        }
        if events.send(ConnEvent::Frame(conn_id, frame)).is_err() {
            return;
        }
    }
    let _ = events.send(ConnEvent::Closed(conn_id));
}

/// Flush queued frames until the proxy closes its end, then shut down.
async fn write_loop(conn_id: u64, mut stream: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = stream.write_all(&frame).await {
            warn!("[control] conn {conn_id}: write failed: {e}");
            return;
        }
    }
    let _ = stream.shutdown().await;
    debug!("[control] conn {conn_id}: writer closed");
}
