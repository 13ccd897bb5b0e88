//! Producer-side handle for one connected consumer.
//!
//! A [`ConsumerProxy`] is created when a socket is accepted and becomes a
//! session once the connect handshake succeeds. Control replies are encoded
//! here and handed to the connection's writer task; data events go straight
//! into the consumer's shared-memory rings, one per market-data source, so
//! every ring keeps a single writer thread.
//!
//! ```text
//! md thread ──► Ticker ──► ConsumerProxy::send_book_* ──► DataChannel[queue] (shm ring)
//! control   ──► Publisher ──► ConsumerProxy::send_*_response ──► writer task ──► TCP
//! ```

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use mdx_core::{
    error::Result,
    protocol::{
        self, BookChanged, BookRefreshed, ConnectResponse, ConnectStatus, Message, STREAM_ID_CONTROL, ShmType,
        SubscribeResponse, SubscribeStatus, TradingAction, flags,
    },
    ring::RingBuffer,
    shm::{ShmSegment, shm_path},
    symbol_table::LOCATOR_INVALID,
    time_util::now_ns,
    types::EXCHANGE_NONE,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::ticker::{Ticker, TickerState};

/// What the consumer declared in its `CtrlConnect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDetails {
    pub pid: u32,
    pub client_id: u8,
    pub flags: u32,
    pub user: String,
    pub shm_key: String,
}

/// A book cache granted to a consumer in the connect response.
#[derive(Debug, Clone)]
pub struct CacheGrant {
    pub exchange: u16,
    pub path: PathBuf,
    pub size: u64,
}

// ---------------------------------------------------------------------------
// DataChannel
// ---------------------------------------------------------------------------

struct DataQueue {
    path: PathBuf,
    size: u64,
    ring: Mutex<RingBuffer<ShmSegment>>,
}

/// Snapshot of a data channel's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub written: u64,
    pub written_bytes: u64,
    pub dropped: u64,
    pub dropped_bytes: u64,
}

/// The consumer's shared-memory event queues, indexed by source queue index.
pub struct DataChannel {
    queues: Vec<DataQueue>,
    written: AtomicU64,
    written_bytes: AtomicU64,
    dropped: AtomicU64,
    dropped_bytes: AtomicU64,
}

impl DataChannel {
    /// Create `count` rings named `{prefix}.{shm_key}.{i}` under `dir`.
    pub fn create(dir: &Path, prefix: &str, shm_key: &str, count: usize, capacity: usize) -> Result<Self> {
        let mut queues = Vec::with_capacity(count);
        for i in 0..count {
            let path = shm_path(dir, &format!("{prefix}.{shm_key}.{i}"));
            let ring = RingBuffer::create_shm(&path, capacity)?;
            let size = ring.memory().len() as u64;
            info!("[consumer] created data queue {} ({capacity} bytes)", path.display());
            queues.push(DataQueue { path, size, ring: Mutex::new(ring) });
        }
        Ok(Self {
            queues,
            written: AtomicU64::new(0),
            written_bytes: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            dropped_bytes: AtomicU64::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn queue_path(&self, index: usize) -> Option<&Path> {
        self.queues.get(index).map(|q| q.path.as_path())
    }

    /// Encode one frame into queue `index`. A full ring counts as a drop.
    pub fn write_frame(&self, index: u8, session: u64, sequence: u64, xmit_ts: u64, messages: &[Message]) -> bool {
        let Some(queue) = self.queues.get(index as usize) else {
            warn!("[consumer] no data queue {index}");
            return false;
        };
        let len = protocol::frame_len(messages) as u64;
        let mut ring = queue.ring.lock().unwrap_or_else(PoisonError::into_inner);
        let written = protocol::write_frame(&mut ring, session, sequence, index, xmit_ts, messages).unwrap_or_else(|e| {
            warn!("[consumer] queue {index}: {e}");
            false
        });
        if written {
            self.written.fetch_add(1, Ordering::Relaxed);
            self.written_bytes.fetch_add(len, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            self.dropped_bytes.fetch_add(len, Ordering::Relaxed);
        }
        written
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            written: self.written.load(Ordering::Relaxed),
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            dropped_bytes: self.dropped_bytes.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// ConsumerProxy
// ---------------------------------------------------------------------------

pub struct ConsumerProxy {
    conn_id: u64,
    peer: SocketAddr,
    session: u64,
    send_book_update: bool,
    details: OnceLock<ConsumerDetails>,
    data: OnceLock<DataChannel>,
    control_tx: Mutex<Option<UnboundedSender<Vec<u8>>>>,
    control_seq: AtomicU64,
    last_activity_ms: AtomicU64,
}

impl ConsumerProxy {
    pub fn new(
        conn_id: u64,
        peer: SocketAddr,
        session: u64,
        control_tx: UnboundedSender<Vec<u8>>,
        send_book_update: bool,
        now_ms: u64,
    ) -> Self {
        info!("[consumer] proxy for {peer} (conn {conn_id})");
        Self {
            conn_id,
            peer,
            session,
            send_book_update,
            details: OnceLock::new(),
            data: OnceLock::new(),
            control_tx: Mutex::new(Some(control_tx)),
            control_seq: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn details(&self) -> Option<&ConsumerDetails> {
        self.details.get()
    }

    /// Record the handshake details. Only the first call wins.
    pub fn set_details(&self, details: ConsumerDetails) -> bool {
        info!(
            "[consumer] {} pid={} user={} client_id={} key={} flags={:#x}",
            self.peer, details.pid, details.user, details.client_id, details.shm_key, details.flags
        );
        self.details.set(details).is_ok()
    }

    pub fn client_id(&self) -> Option<u8> {
        self.details.get().map(|d| d.client_id)
    }

    pub fn shm_key(&self) -> Option<&str> {
        self.details.get().map(|d| d.shm_key.as_str())
    }

    /// Connected means the handshake finished and the data queues exist.
    pub fn is_connected(&self) -> bool {
        self.details.get().is_some() && self.data.get().is_some()
    }

    pub fn attach_data_channel(&self, channel: DataChannel) -> bool {
        self.data.set(channel).is_ok()
    }

    pub fn data_channel(&self) -> Option<&DataChannel> {
        self.data.get()
    }

    fn wants(&self, flag: u32) -> bool {
        self.details.get().is_some_and(|d| d.flags & flag != 0)
    }

    pub fn touch(&self, now_ms: u64) {
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    /// Stop sending on the control socket; the writer task flushes what is
    /// queued and shuts the connection down.
    pub fn close(&self) {
        if self.control_tx.lock().unwrap_or_else(PoisonError::into_inner).take().is_some() {
            debug!("[consumer] closing control stream for {}", self.peer);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.control_tx.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    // -----------------------------------------------------------------------
    // Control replies
    // -----------------------------------------------------------------------

    fn send_control(&self, messages: &[Message]) -> bool {
        let seq = self.control_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = match protocol::encode_frame(self.session, seq, STREAM_ID_CONTROL, now_ns(), messages) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[consumer] conn {}: {e}", self.conn_id);
                return false;
            }
        };
        match self.control_tx.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Header-only frame on the control socket.
    pub fn send_control_heartbeat(&self) -> bool {
        self.send_control(&[])
    }

    /// One record per data queue and per book cache on success, a single
    /// status record otherwise.
    pub fn send_connect_response(&self, client_id: u8, status: ConnectStatus, caches: &[CacheGrant]) -> bool {
        let mut records = Vec::new();
        match (status, self.data.get()) {
            (ConnectStatus::Ok, Some(channel)) => {
                for queue in &channel.queues {
                    records.push(Message::ConnectResponse(ConnectResponse {
                        client_id,
                        status,
                        shm_type: ShmType::EventQueue,
                        shm_path: queue.path.to_string_lossy().into_owned(),
                        shm_size: queue.size,
                        exchange: EXCHANGE_NONE,
                    }));
                }
                for cache in caches {
                    records.push(Message::ConnectResponse(ConnectResponse {
                        client_id,
                        status,
                        shm_type: ShmType::BookCache,
                        shm_path: cache.path.to_string_lossy().into_owned(),
                        shm_size: cache.size,
                        exchange: cache.exchange,
                    }));
                }
            }
            _ => records.push(Message::ConnectResponse(ConnectResponse {
                client_id,
                status,
                shm_type: ShmType::EventQueue,
                shm_path: String::new(),
                shm_size: 0,
                exchange: EXCHANGE_NONE,
            })),
        }
        self.send_control(&records)
    }

    pub fn send_disconnect_response(&self, status: ConnectStatus) -> bool {
        self.send_control(&[Message::DisconnectResponse { status }])
    }

    pub fn send_subscribe_response(&self, status: SubscribeStatus, locate: u16, symbol: &str, exchange: u16) -> bool {
        self.send_control(&[Message::SubscribeResponse(SubscribeResponse {
            status,
            locate,
            symbol: symbol.to_string(),
            exchange,
        })])
    }

    /// Subscribe reply reflecting the ticker's current state.
    pub fn send_ticker_subscribe_response(&self, ticker: &Ticker) -> bool {
        if ticker.state() == TickerState::BadSymbol {
            let (symbol, exchange) = (ticker.symbol(), ticker.exchange());
            self.send_subscribe_response(SubscribeStatus::BadSymbol, LOCATOR_INVALID, symbol, exchange)
        } else {
            self.send_subscribe_response(SubscribeStatus::Ok, ticker.locate(), ticker.symbol(), ticker.exchange())
        }
    }

    pub fn send_unsubscribe_response(&self, ticker: &Ticker) -> bool {
        self.send_control(&[Message::UnsubscribeResponse(SubscribeResponse {
            status: SubscribeStatus::Ok,
            locate: ticker.locate(),
            symbol: ticker.symbol().to_string(),
            exchange: ticker.exchange(),
        })])
    }

    // -----------------------------------------------------------------------
    // Data events
    // -----------------------------------------------------------------------

    fn send_data(&self, ticker: &Ticker, xmit_ts: u64, message: Message) -> bool {
        let Some(channel) = self.data.get() else {
            return false;
        };
        let stream = ticker.stream();
        channel.write_frame(stream.queue_index(), self.session, stream.step(), xmit_ts, &[message])
    }

    pub fn send_book_refreshed(&self, ticker: &Ticker) -> bool {
        if !self.wants(flags::SEND_BOOK_REFRESHED) {
            return false;
        }
        let msg = Message::BookRefreshed(BookRefreshed {
            locate: ticker.locate(),
            symbol: ticker.symbol().to_string(),
            exchange: ticker.exchange(),
        });
        self.send_data(ticker, now_ns(), msg)
    }

    pub fn send_book_changed(&self, ticker: &Ticker) -> bool {
        if !self.send_book_update || !self.wants(flags::SEND_BOOK_CHANGED) {
            return false;
        }
        let xmit = now_ns();
        let mut timestamps = ticker.timestamps();
        timestamps.producer_transmit = xmit;
        let msg = Message::BookChanged(BookChanged {
            locate: ticker.locate(),
            symbol: ticker.symbol().to_string(),
            exchange: ticker.exchange(),
            side: ticker.changed_side(),
            timestamps,
        });
        self.send_data(ticker, xmit, msg)
    }

    pub fn send_trading_action(&self, ticker: &Ticker) -> bool {
        if !self.wants(flags::SEND_TRADING_ACTION) {
            return false;
        }
        let xmit = now_ns();
        let mut timestamps = ticker.timestamps();
        timestamps.producer_transmit = xmit;
        let msg = Message::TradingAction(TradingAction {
            locate: ticker.locate(),
            symbol: ticker.symbol().to_string(),
            exchange: ticker.exchange(),
            status: ticker.trade_status(),
            timestamps,
        });
        self.send_data(ticker, xmit, msg)
    }

    /// Header-only frame on one data queue.
    pub fn send_data_heartbeat(&self, queue_index: u8, sequence: u64) -> bool {
        if !self.wants(flags::SEND_DATA_HEARTBEAT) {
            return false;
        }
        match self.data.get() {
            Some(channel) => channel.write_frame(queue_index, self.session, sequence, now_ns(), &[]),
            None => false,
        }
    }
}

impl Drop for ConsumerProxy {
    fn drop(&mut self) {
        if let Some(channel) = self.data.get() {
            let s = channel.stats();
            info!(
                "[consumer] {} released: written={} ({} bytes) dropped={} ({} bytes)",
                self.peer, s.written, s.written_bytes, s.dropped, s.dropped_bytes
            );
        }
    }
}

/// Identity comparison for proxies held in subscriber lists.
#[inline]
pub fn same_consumer(a: &Arc<ConsumerProxy>, b: &Arc<ConsumerProxy>) -> bool {
    Arc::ptr_eq(a, b)
}

#[cfg(test)]
mod tests {
    use mdx_core::protocol::{FrameHeader, HEADER_LEN, decode_frame, poll_frame};
    use tokio::sync::mpsc;

    use super::*;

    fn proxy(flags: u32) -> (Arc<ConsumerProxy>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let p = ConsumerProxy::new(1, "127.0.0.1:5000".parse().unwrap(), 77, tx, true, 0);
        p.set_details(ConsumerDetails {
            pid: 42,
            client_id: 3,
            flags,
            user: "u".into(),
            shm_key: "k".into(),
        });
        (Arc::new(p), rx)
    }

    #[test]
    fn control_frames_carry_session_and_sequence() {
        let (p, mut rx) = proxy(flags::ALL);
        assert!(p.send_subscribe_response(SubscribeStatus::BadSymbol, LOCATOR_INVALID, "ZZZZ", 1));
        assert!(p.send_control_heartbeat());

        let (h1, msgs) = decode_frame(&rx.try_recv().unwrap()).unwrap();
        assert_eq!((h1.session, h1.sequence, h1.stream_id), (77, 1, STREAM_ID_CONTROL));
        let Message::SubscribeResponse(r) = &msgs[0] else { panic!("expected subscribe response") };
        assert_eq!((r.status, r.locate, r.symbol.as_str()), (SubscribeStatus::BadSymbol, 0xFFFF, "ZZZZ"));

        let hb = rx.try_recv().unwrap();
        assert_eq!(hb.len(), HEADER_LEN);
        assert_eq!(FrameHeader::decode(&hb).unwrap().sequence, 2);
    }

    #[test]
    fn closed_proxy_stops_sending() {
        let (p, mut rx) = proxy(flags::ALL);
        p.close();
        assert!(p.is_closed());
        assert!(!p.send_control_heartbeat());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn connect_response_lists_queues_then_caches() {
        let dir = tempfile::tempdir().unwrap();
        let (p, mut rx) = proxy(flags::ALL);
        let channel = DataChannel::create(dir.path(), "mdx", "k", 2, 4096).unwrap();
        assert!(channel.queue_path(1).unwrap().ends_with("mdx.k.1"));
        assert!(p.attach_data_channel(channel));
        assert!(p.is_connected());

        let grant = CacheGrant { exchange: 5, path: dir.path().join("book"), size: 1234 };
        p.send_connect_response(3, ConnectStatus::Ok, &[grant]);
        let (header, msgs) = decode_frame(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(header.count, 3);
        let types: Vec<_> = msgs
            .iter()
            .map(|m| match m {
                Message::ConnectResponse(r) => (r.shm_type, r.exchange),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(types, vec![(ShmType::EventQueue, 0), (ShmType::EventQueue, 0), (ShmType::BookCache, 5)]);
    }

    #[test]
    fn heartbeat_respects_flags_and_counts_drops() {
        let dir = tempfile::tempdir().unwrap();
        let (quiet, _rx) = proxy(flags::SEND_BOOK_REFRESHED);
        quiet.attach_data_channel(DataChannel::create(dir.path(), "mdx", "quiet", 1, 1024).unwrap());
        assert!(!quiet.send_data_heartbeat(0, 1));

        let (p, _rx2) = proxy(flags::ALL);
        p.attach_data_channel(DataChannel::create(dir.path(), "mdx", "loud", 1, 1024).unwrap());
        let mut sent = 0u64;
        while p.send_data_heartbeat(0, sent + 1) {
            sent += 1;
        }
        assert_eq!(sent, (1024 / HEADER_LEN) as u64);
        let stats = p.data_channel().unwrap().stats();
        assert_eq!((stats.written, stats.dropped), (sent, 1));

        let mut reader = RingBuffer::open_shm(dir.path().join("mdx.loud.0")).unwrap();
        let (h, msgs) = poll_frame(&mut reader).unwrap().unwrap();
        assert!(h.is_heartbeat() && msgs.is_empty());
        assert_eq!(h.sequence, 1);
    }
}
