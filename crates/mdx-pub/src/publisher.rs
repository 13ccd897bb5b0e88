//! Consumer session management.
//!
//! The [`Publisher`] holds every control connection and runs the
//! connect / subscribe / unsubscribe / disconnect protocol against them. It
//! is plain synchronous state: the control channel feeds it decoded frames
//! and timer ticks, and the publisher replies through each connection's
//! [`ConsumerProxy`].
//!
//! Subscriptions are not executed inline. They wait on a per-connection
//! queue until [`Publisher::on_house_keeping`] hands a bounded batch to the
//! owning market-data source; a source that is not ready leaves the command
//! queued for the next tick.

use std::{collections::VecDeque, net::SocketAddr, path::PathBuf, sync::Arc};

use ahash::AHashMap;
use mdx_core::{
    config::PublisherConfig,
    lock::MAX_READERS,
    protocol::{self, Connect, ConnectStatus, Message, Subscribe, SubscribeStatus, Unsubscribe, first_record_type},
    symbol_table::LOCATOR_INVALID,
    time_util::now_ns,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::{
    consumer::{ConsumerDetails, ConsumerProxy, DataChannel},
    registry::CacheRegistry,
    source::SourceHandle,
};

/// Publisher knobs, resolved from [`PublisherConfig`].
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub name: String,
    pub shm_dir: PathBuf,
    pub queue_size: usize,
    pub heartbeat_interval_ms: u64,
    pub max_missing_heartbeats: u32,
    pub house_keeping_interval_ms: u64,
    pub house_keeping_batch: usize,
    pub send_book_update: bool,
}

impl From<&PublisherConfig> for PublisherSettings {
    fn from(cfg: &PublisherConfig) -> Self {
        Self {
            name: cfg.effective_name(),
            shm_dir: PathBuf::from(cfg.effective_shm_dir()),
            queue_size: cfg.effective_queue_size(),
            heartbeat_interval_ms: cfg.effective_heartbeat_interval_ms(),
            max_missing_heartbeats: cfg.effective_max_missing_heartbeats(),
            house_keeping_interval_ms: cfg.effective_house_keeping_interval_ms(),
            house_keeping_batch: cfg.effective_house_keeping_batch(),
            send_book_update: cfg.effective_send_book_update(),
        }
    }
}

impl PublisherSettings {
    /// Silence longer than this drops the session.
    pub fn heartbeat_timeout_ms(&self) -> u64 {
        self.heartbeat_interval_ms * self.max_missing_heartbeats as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingCommand {
    Subscribe { symbol: String, exchange: u16 },
    Unsubscribe { symbol: String, exchange: u16 },
}

impl PendingCommand {
    fn exchange(&self) -> u16 {
        match self {
            Self::Subscribe { exchange, .. } | Self::Unsubscribe { exchange, .. } => *exchange,
        }
    }
}

struct Connection {
    proxy: Arc<ConsumerProxy>,
    commands: VecDeque<PendingCommand>,
}

pub struct Publisher {
    settings: PublisherSettings,
    session: u64,
    registry: Arc<CacheRegistry>,
    sources: Vec<SourceHandle>,
    connections: AHashMap<u64, Connection>,
    closed: Vec<u64>,
}

impl Publisher {
    /// `sources[i]` must own data queue `i` of every consumer.
    pub fn new(settings: PublisherSettings, registry: Arc<CacheRegistry>, sources: Vec<SourceHandle>) -> Self {
        let session = now_ns();
        info!(
            "[publisher] {} session {session}: {} source(s), queue {} bytes, heartbeat {}ms x{}",
            settings.name,
            sources.len(),
            settings.queue_size,
            settings.heartbeat_interval_ms,
            settings.max_missing_heartbeats
        );
        Self { settings, session, registry, sources, connections: AHashMap::new(), closed: Vec::new() }
    }

    pub fn settings(&self) -> &PublisherSettings {
        &self.settings
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn consumer(&self, conn_id: u64) -> Option<&Arc<ConsumerProxy>> {
        self.connections.get(&conn_id).map(|c| &c.proxy)
    }

    /// Commands still waiting for their source.
    pub fn pending_commands(&self, conn_id: u64) -> usize {
        self.connections.get(&conn_id).map_or(0, |c| c.commands.len())
    }

    fn source(&self, exchange: u16) -> Option<&SourceHandle> {
        self.sources.iter().find(|s| s.exchange() == exchange)
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// A socket was accepted. The proxy stays unregistered until its
    /// connect handshake succeeds.
    pub fn register_client(
        &mut self,
        conn_id: u64,
        peer: SocketAddr,
        control_tx: UnboundedSender<Vec<u8>>,
        now_ms: u64,
    ) -> Arc<ConsumerProxy> {
        let proxy = Arc::new(ConsumerProxy::new(
            conn_id,
            peer,
            self.session,
            control_tx,
            self.settings.send_book_update,
            now_ms,
        ));
        self.connections.insert(conn_id, Connection { proxy: Arc::clone(&proxy), commands: VecDeque::new() });
        proxy
    }

    /// Tear a connection down and purge its subscriptions on every source.
    pub fn unregister_client(&mut self, conn_id: u64) {
        let Some(conn) = self.connections.remove(&conn_id) else {
            return;
        };
        if conn.proxy.is_connected() {
            for source in &self.sources {
                source.unregister_consumer(&conn.proxy);
            }
        }
        conn.proxy.close();
        self.closed.push(conn_id);
        info!(
            "[publisher] conn {conn_id} ({}) unregistered, {} pending command(s) discarded",
            conn.proxy.peer(),
            conn.commands.len()
        );
    }

    /// Unregister every connection.
    pub fn shutdown(&mut self) {
        let ids: Vec<u64> = self.connections.keys().copied().collect();
        for conn_id in ids {
            self.unregister_client(conn_id);
        }
    }

    /// Connections closed since the last call.
    pub fn take_closed(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.closed)
    }

    /// Handle one complete frame read from `conn_id`.
    pub fn on_frame(&mut self, conn_id: u64, frame: &[u8], now_ms: u64) {
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        let proxy = Arc::clone(&conn.proxy);
        proxy.touch(now_ms);

        let messages = match protocol::decode_frame(frame) {
            Ok((_, messages)) => messages,
            Err(e) => {
                let payload = frame.get(protocol::HEADER_LEN..).unwrap_or_default();
                if first_record_type(payload) == Some(protocol::MSG_CONNECT) {
                    warn!("[publisher] conn {conn_id}: incompatible connect: {e}");
                    proxy.send_connect_response(u8::MAX, ConnectStatus::VersionMismatch, &[]);
                } else {
                    warn!("[publisher] conn {conn_id}: malformed frame: {e}");
                }
                self.unregister_client(conn_id);
                return;
            }
        };

        for message in messages {
            if !self.connections.contains_key(&conn_id) {
                break;
            }
            self.dispatch(&proxy, message);
        }
    }

    fn dispatch(&mut self, proxy: &Arc<ConsumerProxy>, message: Message) {
        match message {
            Message::Connect(req) => self.on_connect(proxy, req),
            Message::Disconnect { pid } => self.on_disconnect(proxy, pid),
            Message::Subscribe(req) => self.on_subscribe(proxy, req),
            Message::Unsubscribe(req) => self.on_unsubscribe(proxy, req),
            other => {
                warn!("[publisher] conn {}: unexpected message {:#04x}", proxy.conn_id(), other.msg_type());
            }
        }
    }

    fn reject_connect(&mut self, proxy: &Arc<ConsumerProxy>, client_id: u8, status: ConnectStatus) {
        warn!("[publisher] conn {} ({}): connect rejected: {status:?}", proxy.conn_id(), proxy.peer());
        proxy.send_connect_response(client_id, status, &[]);
        self.unregister_client(proxy.conn_id());
    }

    fn on_connect(&mut self, proxy: &Arc<ConsumerProxy>, req: Connect) {
        if proxy.is_connected() {
            return self.reject_connect(proxy, req.client_id, ConnectStatus::AlreadyConnected);
        }
        if req.client_id >= MAX_READERS || req.pid == 0 || req.shm_key.is_empty() {
            return self.reject_connect(proxy, req.client_id, ConnectStatus::InvalidId);
        }
        let taken = self.connections.values().any(|c| {
            c.proxy
                .details()
                .is_some_and(|d| d.client_id == req.client_id || d.shm_key == req.shm_key)
        });
        if taken {
            return self.reject_connect(proxy, req.client_id, ConnectStatus::AlreadyConnected);
        }

        let channel = match DataChannel::create(
            &self.settings.shm_dir,
            &self.settings.name,
            &req.shm_key,
            self.sources.len(),
            self.settings.queue_size,
        ) {
            Ok(channel) => channel,
            Err(e) => {
                warn!("[publisher] conn {}: data queues for {}: {e}", proxy.conn_id(), req.shm_key);
                return self.reject_connect(proxy, req.client_id, ConnectStatus::SharedMemoryFailure);
            }
        };

        proxy.set_details(ConsumerDetails {
            pid: req.pid,
            client_id: req.client_id,
            flags: req.flags,
            user: req.user,
            shm_key: req.shm_key,
        });
        proxy.attach_data_channel(channel);
        for source in &self.sources {
            source.register_consumer(proxy);
        }
        proxy.send_connect_response(req.client_id, ConnectStatus::Ok, &self.registry.grants());
    }

    fn reject_unregistered(&mut self, proxy: &Arc<ConsumerProxy>) {
        warn!("[publisher] conn {}: request before connect", proxy.conn_id());
        proxy.send_connect_response(u8::MAX, ConnectStatus::UnregisteredConnection, &[]);
        self.unregister_client(proxy.conn_id());
    }

    fn on_disconnect(&mut self, proxy: &Arc<ConsumerProxy>, pid: u32) {
        if !proxy.is_connected() {
            return self.reject_unregistered(proxy);
        }
        debug!("[publisher] conn {}: disconnect from pid {pid}", proxy.conn_id());
        proxy.send_disconnect_response(ConnectStatus::Ok);
        self.unregister_client(proxy.conn_id());
    }

    fn on_subscribe(&mut self, proxy: &Arc<ConsumerProxy>, req: Subscribe) {
        if !proxy.is_connected() {
            return self.reject_unregistered(proxy);
        }
        if !self.registry.has_exchange(req.exchange) || self.source(req.exchange).is_none() {
            proxy.send_subscribe_response(SubscribeStatus::BadExchange, LOCATOR_INVALID, &req.symbol, req.exchange);
            return;
        }
        self.enqueue(proxy.conn_id(), PendingCommand::Subscribe { symbol: req.symbol, exchange: req.exchange });
    }

    fn on_unsubscribe(&mut self, proxy: &Arc<ConsumerProxy>, req: Unsubscribe) {
        if !proxy.is_connected() {
            return self.reject_unregistered(proxy);
        }
        if self.source(req.exchange).is_none() {
            debug!("[publisher] conn {}: unsubscribe on unknown exchange {}", proxy.conn_id(), req.exchange);
            return;
        }
        self.enqueue(proxy.conn_id(), PendingCommand::Unsubscribe { symbol: req.symbol, exchange: req.exchange });
    }

    fn enqueue(&mut self, conn_id: u64, command: PendingCommand) {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.commands.push_back(command);
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Hand up to one batch of queued commands to their sources, then drop
    /// sessions that went silent. Returns the number of commands executed.
    pub fn on_house_keeping(&mut self, now_ms: u64) -> usize {
        let mut budget = self.settings.house_keeping_batch;
        let mut executed = 0;
        for conn in self.connections.values_mut() {
            while budget > 0 {
                let Some(command) = conn.commands.pop_front() else {
                    break;
                };
                let Some(source) = self.sources.iter().find(|s| s.exchange() == command.exchange()) else {
                    continue;
                };
                let accepted = match &command {
                    PendingCommand::Subscribe { symbol, .. } => source.subscribe(&conn.proxy, symbol),
                    PendingCommand::Unsubscribe { symbol, .. } => source.unsubscribe(&conn.proxy, symbol),
                };
                if !accepted {
                    conn.commands.push_front(command);
                    break;
                }
                budget -= 1;
                executed += 1;
            }
        }

        let timeout = self.settings.heartbeat_timeout_ms();
        let expired: Vec<u64> = self
            .connections
            .iter()
            .filter(|(_, c)| now_ms.saturating_sub(c.proxy.last_activity_ms()) > timeout)
            .map(|(&id, _)| id)
            .collect();
        for conn_id in expired {
            warn!("[publisher] conn {conn_id}: no traffic for {timeout}ms, dropping");
            self.unregister_client(conn_id);
        }
        executed
    }

    /// Header-only frame on every connected session's control socket.
    pub fn send_control_heartbeats(&self) {
        for conn in self.connections.values() {
            if conn.proxy.is_connected() {
                conn.proxy.send_control_heartbeat();
            }
        }
    }

    /// Ask the source for `exchange` to blank one book, or all of them.
    pub fn clear_book(&self, exchange: u16, symbol: Option<&str>) -> bool {
        match self.source(exchange) {
            Some(source) => source.clear_book(symbol),
            None => {
                warn!("[publisher] clear book: no source for exchange {exchange}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mdx_core::{
        book::ExchangeDepth,
        book_cache::SharedBookCache,
        config::SourceConfig,
        protocol::{HEADER_LEN, STREAM_ID_CONTROL, ShmType, decode_frame, encode_frame, flags},
        symbol_table::{OpenMode, SymbolTable},
        types::EXCHANGE_SHFE,
    };
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;
    use crate::{
        feed::StaticFeed,
        registry::CacheEntry,
        source::MarketDataSource,
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        publisher: Publisher,
        source: MarketDataSource<StaticFeed>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let entry = CacheEntry {
            cache: Arc::new(
                SharedBookCache::create(
                    dir.path().join("book"),
                    &[ExchangeDepth { exchange: EXCHANGE_SHFE, depth: 2 }],
                    8,
                )
                .unwrap(),
            ),
            symbols: Arc::new(SymbolTable::open(dir.path().join("symbols"), OpenMode::ReadWrite).unwrap()),
            write_timeout_cycles: 10_000,
        };
        let mut registry = CacheRegistry::new();
        registry.insert(entry.clone()).unwrap();

        let config = SourceConfig {
            exchange: EXCHANGE_SHFE,
            cpu_affinity: None,
            can_unsubscribe: None,
            instruments: vec!["cu2409".into()],
        };
        let (source, handle) =
            MarketDataSource::new(&config, 0, StaticFeed::new("shfe", &config.instruments), &entry, 1_000);
        let settings = PublisherSettings {
            name: "mdx".into(),
            shm_dir: dir.path().to_path_buf(),
            queue_size: 4096,
            heartbeat_interval_ms: 100,
            max_missing_heartbeats: 3,
            house_keeping_interval_ms: 20,
            house_keeping_batch: 2,
            send_book_update: true,
        };
        let publisher = Publisher::new(settings, Arc::new(registry), vec![handle]);
        Fixture { _dir: dir, publisher, source }
    }

    fn frame(messages: &[Message]) -> Vec<u8> {
        encode_frame(0, 1, STREAM_ID_CONTROL, 0, messages).unwrap()
    }

    fn connect(client_id: u8, pid: u32, key: &str) -> Vec<u8> {
        frame(&[Message::Connect(Connect {
            pid,
            client_id,
            flags: flags::ALL,
            user: "u".into(),
            pwd: String::new(),
            shm_key: key.into(),
        })])
    }

    fn subscribe(symbol: &str, exchange: u16) -> Vec<u8> {
        frame(&[Message::Subscribe(Subscribe { symbol: symbol.into(), exchange, flags: 0 })])
    }

    fn open(p: &mut Publisher, conn_id: u64) -> UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        p.register_client(conn_id, "127.0.0.1:1".parse().unwrap(), tx, 0);
        rx
    }

    fn reply(rx: &mut UnboundedReceiver<Vec<u8>>) -> Vec<Message> {
        decode_frame(&rx.try_recv().unwrap()).unwrap().1
    }

    fn connect_status(msgs: &[Message]) -> ConnectStatus {
        match &msgs[0] {
            Message::ConnectResponse(r) => r.status,
            other => panic!("expected connect response, got {other:?}"),
        }
    }

    #[test]
    fn connect_provisions_queues_and_caches() {
        let mut f = fixture();
        let mut rx = open(&mut f.publisher, 1);
        f.publisher.on_frame(1, &connect(0, 1234, "a"), 0);

        let msgs = reply(&mut rx);
        assert_eq!(msgs.len(), 2);
        let Message::ConnectResponse(queue) = &msgs[0] else { panic!("expected connect response") };
        assert_eq!((queue.status, queue.shm_type), (ConnectStatus::Ok, ShmType::EventQueue));
        assert!(queue.shm_path.ends_with("mdx.a.0"));
        let Message::ConnectResponse(cache) = &msgs[1] else { panic!("expected connect response") };
        assert_eq!((cache.shm_type, cache.exchange), (ShmType::BookCache, EXCHANGE_SHFE));
        assert!(f.publisher.consumer(1).unwrap().is_connected());
    }

    #[test]
    fn invalid_ids_are_rejected() {
        let mut f = fixture();
        for (conn, frame) in [(1, connect(12, 1, "a")), (2, connect(0, 0, "b")), (3, connect(0, 1, ""))] {
            let mut rx = open(&mut f.publisher, conn);
            f.publisher.on_frame(conn, &frame, 0);
            assert_eq!(connect_status(&reply(&mut rx)), ConnectStatus::InvalidId);
            assert!(f.publisher.consumer(conn).is_none());
        }
        assert_eq!(f.publisher.take_closed(), vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_client_id_or_key_is_already_connected() {
        let mut f = fixture();
        let mut a = open(&mut f.publisher, 1);
        f.publisher.on_frame(1, &connect(0, 10, "a"), 0);
        assert_eq!(connect_status(&reply(&mut a)), ConnectStatus::Ok);

        let mut b = open(&mut f.publisher, 2);
        f.publisher.on_frame(2, &connect(0, 11, "b"), 0);
        assert_eq!(connect_status(&reply(&mut b)), ConnectStatus::AlreadyConnected);

        let mut c = open(&mut f.publisher, 3);
        f.publisher.on_frame(3, &connect(1, 12, "a"), 0);
        assert_eq!(connect_status(&reply(&mut c)), ConnectStatus::AlreadyConnected);

        assert_eq!(f.publisher.connection_count(), 1);
        f.publisher.on_frame(1, &connect(0, 10, "a"), 0);
        assert_eq!(connect_status(&reply(&mut a)), ConnectStatus::AlreadyConnected);
        assert_eq!(f.publisher.connection_count(), 0);
    }

    #[test]
    fn requests_before_connect_are_unregistered() {
        let mut f = fixture();
        let mut rx = open(&mut f.publisher, 1);
        f.publisher.on_frame(1, &subscribe("cu2409", EXCHANGE_SHFE), 0);
        assert_eq!(connect_status(&reply(&mut rx)), ConnectStatus::UnregisteredConnection);
        assert!(f.publisher.consumer(1).is_none());
    }

    #[test]
    fn connect_with_wrong_layout_is_version_mismatch() {
        let mut f = fixture();
        let mut rx = open(&mut f.publisher, 1);
        let mut bytes = connect(0, 1, "a");
        bytes[HEADER_LEN + 1] -= 1;
        f.publisher.on_frame(1, &bytes, 0);
        assert_eq!(connect_status(&reply(&mut rx)), ConnectStatus::VersionMismatch);
        assert_eq!(f.publisher.connection_count(), 0);
    }

    #[test]
    fn subscribe_to_unknown_exchange_is_bad_exchange() {
        let mut f = fixture();
        let mut rx = open(&mut f.publisher, 1);
        f.publisher.on_frame(1, &connect(0, 1, "a"), 0);
        reply(&mut rx);
        f.publisher.on_frame(1, &subscribe("cu2409", 42), 0);
        let Message::SubscribeResponse(r) = &reply(&mut rx)[0] else { panic!("expected subscribe response") };
        assert_eq!((r.status, r.locate), (SubscribeStatus::BadExchange, LOCATOR_INVALID));
        assert_eq!(f.publisher.pending_commands(1), 0);
    }

    #[test]
    fn house_keeping_batches_and_requeues() {
        let mut f = fixture();
        let mut rx = open(&mut f.publisher, 1);
        f.publisher.on_frame(1, &connect(0, 1, "a"), 0);
        reply(&mut rx);
        for _ in 0..3 {
            f.publisher.on_frame(1, &subscribe("cu2409", EXCHANGE_SHFE), 0);
        }
        assert_eq!(f.publisher.pending_commands(1), 3);

        f.source.feed_mut().set_ready(false);
        f.source.poll_once();
        assert_eq!(f.publisher.on_house_keeping(0), 0);
        assert_eq!(f.publisher.pending_commands(1), 3);

        f.source.feed_mut().set_ready(true);
        f.source.poll_once();
        assert_eq!(f.publisher.on_house_keeping(0), 2);
        assert_eq!(f.publisher.on_house_keeping(0), 1);
        assert_eq!(f.publisher.pending_commands(1), 0);

        f.source.poll_commands();
        let Message::SubscribeResponse(r) = &reply(&mut rx)[0] else { panic!("expected subscribe response") };
        assert_eq!(r.status, SubscribeStatus::Ok);
        assert_eq!(f.source.ticker("cu2409").unwrap().subscriber_count(), 1);
    }

    #[test]
    fn silent_sessions_time_out() {
        let mut f = fixture();
        let _a = open(&mut f.publisher, 1);
        let _b = open(&mut f.publisher, 2);
        f.publisher.on_frame(1, &connect(0, 1, "a"), 250);

        f.publisher.on_house_keeping(300);
        assert_eq!(f.publisher.connection_count(), 2);

        f.publisher.on_house_keeping(301);
        assert!(f.publisher.consumer(2).is_none());
        assert!(f.publisher.consumer(1).is_some());

        f.publisher.on_house_keeping(551);
        assert_eq!(f.publisher.connection_count(), 0);
        assert_eq!(f.publisher.take_closed(), vec![2, 1]);
    }

    #[test]
    fn disconnect_is_acknowledged() {
        let mut f = fixture();
        let mut rx = open(&mut f.publisher, 1);
        f.publisher.on_frame(1, &connect(0, 1, "a"), 0);
        reply(&mut rx);
        f.publisher.on_frame(1, &frame(&[Message::Disconnect { pid: 1 }]), 0);
        assert!(matches!(reply(&mut rx)[0], Message::DisconnectResponse { status: ConnectStatus::Ok }));
        assert_eq!(f.publisher.take_closed(), vec![1]);
        assert!(!f.publisher.clear_book(7, None));
        assert!(f.publisher.clear_book(EXCHANGE_SHFE, None));
    }
}
