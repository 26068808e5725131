//! The gossip mesh service.
//!
//! Each connection gets one reader task and one writer task. Outbound
//! traffic goes through a bounded per-peer queue that sheds the oldest
//! gossip message on overflow, never a handshake or sync reply. Incoming
//! envelopes are signature-checked, deduplicated against the seen cache,
//! applied locally, then forwarded with an incremented hop count.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::config::GovernanceParams;
use crate::errors::{NodeError, StateError};
use crate::identity::NodeIdentity;
use crate::ledger::worker::LedgerHandle;
use crate::ledger::AcceptResult;
use crate::types::{Block, BlockHeight, Transaction};

use super::codec;
use super::{AddressBook, Envelope, Message, SeenCache, MAX_HOPS, SEEN_CACHE};

/// Per-peer outbound queue depth.
const PEER_QUEUE: usize = 64;

/// Idle interval before probing a peer with a ping.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace for a pong (or any traffic) after an idle probe.
const PONG_TIMEOUT: Duration = Duration::from_secs(15);

/// Dial timeout for outbound connections.
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Keep dialing discovered addresses until this many live connections.
const TARGET_CONNS: usize = 8;

/// Consecutive sync chunks that fail entirely before greylisting a peer.
const MAX_SYNC_FAILURES: u32 = 3;

// --- Transport -------------------------------------------------------------

/// Write half of a peer connection: framed TCP or a WebSocket sink.
pub enum FrameSink {
    Tcp(OwnedWriteHalf),
    Ws(SplitSink<axum::extract::ws::WebSocket, axum::extract::ws::Message>),
}

/// Read half of a peer connection.
pub enum FrameSource {
    Tcp(OwnedReadHalf),
    Ws(SplitStream<axum::extract::ws::WebSocket>),
}

impl FrameSink {
    async fn send(&mut self, payload: &[u8]) -> Result<(), NodeError> {
        match self {
            FrameSink::Tcp(writer) => codec::write_frame(writer, payload)
                .await
                .map_err(|e| NodeError::Network(e.to_string())),
            FrameSink::Ws(sink) => sink
                .send(axum::extract::ws::Message::Binary(payload.to_vec()))
                .await
                .map_err(|e| NodeError::Network(e.to_string())),
        }
    }
}

impl FrameSource {
    /// Next frame, `None` on close. WebSocket frames share the 1 MiB cap.
    async fn next(&mut self) -> Result<Option<Vec<u8>>, NodeError> {
        match self {
            FrameSource::Tcp(reader) => codec::read_frame(reader)
                .await
                .map_err(|e| NodeError::Network(e.to_string())),
            FrameSource::Ws(stream) => loop {
                match stream.next().await {
                    Some(Ok(axum::extract::ws::Message::Binary(bytes))) => {
                        if bytes.len() > codec::MAX_FRAME_BYTES {
                            return Err(NodeError::Network("oversized ws frame".into()));
                        }
                        return Ok(Some(bytes));
                    }
                    Some(Ok(axum::extract::ws::Message::Text(text))) => {
                        return Ok(Some(text.into_bytes()));
                    }
                    Some(Ok(axum::extract::ws::Message::Close(_))) | None => return Ok(None),
                    Some(Ok(_)) => continue, // ws-level ping/pong
                    Some(Err(e)) => return Err(NodeError::Network(e.to_string())),
                }
            },
        }
    }
}

// --- Outbound queue --------------------------------------------------------

struct OutboundQueue {
    items: StdMutex<VecDeque<Envelope>>,
    notify: Notify,
    closed: AtomicBool,
}

impl OutboundQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            items: StdMutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Enqueue an envelope. Returns false when a gossip message had to be
    /// shed to make room (the caller decrements the peer's score).
    fn push(&self, env: Envelope) -> bool {
        let mut items = self.items.lock().expect("queue poisoned");
        let mut shed = false;
        if items.len() >= PEER_QUEUE {
            if let Some(pos) = items.iter().position(|e| e.msg.is_gossip()) {
                items.remove(pos);
                shed = true;
            } else if env.msg.is_gossip() {
                // Queue full of priority traffic; the new gossip loses.
                return false;
            }
        }
        items.push_back(env);
        drop(items);
        self.notify.notify_one();
        !shed
    }

    async fn pop(&self) -> Option<Envelope> {
        loop {
            {
                let mut items = self.items.lock().expect("queue poisoned");
                if let Some(env) = items.pop_front() {
                    return Some(env);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

struct PeerConn {
    queue: Arc<OutboundQueue>,
    node_id: Option<String>,
    remote_head: BlockHeight,
    sent_hello: bool,
    sync_failures: u32,
    /// Height the last GetBlocks to this peer started from; walked back
    /// when a whole chunk fails so a diverged fork point is found.
    sync_cursor: BlockHeight,
}

// --- Mesh ------------------------------------------------------------------

pub struct Mesh {
    identity: Arc<NodeIdentity>,
    ledger: LedgerHandle,
    params: watch::Receiver<Arc<GovernanceParams>>,
    listen_addr: String,
    pub(crate) book: Mutex<AddressBook>,
    seen: Mutex<SeenCache>,
    conns: Mutex<HashMap<u64, PeerConn>>,
    next_conn: AtomicU64,
    nonce_seq: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl Mesh {
    pub fn new(
        identity: Arc<NodeIdentity>,
        ledger: LedgerHandle,
        params: watch::Receiver<Arc<GovernanceParams>>,
        listen_addr: String,
        book: AddressBook,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            identity,
            ledger,
            params,
            listen_addr,
            book: Mutex::new(book),
            seen: Mutex::new(SeenCache::new(SEEN_CACHE)),
            conns: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            nonce_seq: AtomicU64::new(1),
            shutdown_tx,
        })
    }

    fn next_nonce(&self) -> u64 {
        self.nonce_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn params(&self) -> Arc<GovernanceParams> {
        self.params.borrow().clone()
    }

    /// Bind the TCP listener and dial the seed list.
    pub async fn start(self: &Arc<Self>, bind: &str, seeds: &[String]) -> Result<(), NodeError> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| NodeError::Network(format!("bind {bind}: {e}")))?;
        info!(addr = %bind, "p2p listener up");

        let mesh = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            debug!(%addr, "inbound peer connection");
                            mesh.attach_tcp(stream, false).await;
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });

        for seed in seeds {
            self.dial(seed.clone());
        }
        Ok(())
    }

    /// Dial a peer address in the background.
    pub fn dial(self: &Arc<Self>, addr: String) {
        let mesh = self.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => {
                    debug!(%addr, "dialed peer");
                    mesh.attach_tcp(stream, true).await;
                }
                Ok(Err(e)) => warn!(%addr, "dial failed: {e}"),
                Err(_) => warn!(%addr, "dial timed out"),
            }
        });
    }

    async fn attach_tcp(self: &Arc<Self>, stream: TcpStream, outbound: bool) {
        let (read, write) = stream.into_split();
        self.attach(FrameSink::Tcp(write), FrameSource::Tcp(read), outbound).await;
    }

    /// Attach an inbound WebSocket peer (the `/ws/p2p` bridge).
    pub async fn attach_websocket(self: &Arc<Self>, socket: axum::extract::ws::WebSocket) {
        let (sink, stream) = socket.split();
        self.attach(FrameSink::Ws(sink), FrameSource::Ws(stream), false).await;
    }

    /// Register the connection and spawn its reader/writer task pair.
    async fn attach(self: &Arc<Self>, mut sink: FrameSink, source: FrameSource, outbound: bool) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let queue = OutboundQueue::new();
        {
            let mut conns = self.conns.lock().await;
            conns.insert(
                conn_id,
                PeerConn {
                    queue: queue.clone(),
                    node_id: None,
                    remote_head: 0,
                    sent_hello: outbound,
                    sync_failures: 0,
                    sync_cursor: 0,
                },
            );
        }

        // Writer task: drain the queue into the sink.
        let writer_queue = queue.clone();
        tokio::spawn(async move {
            while let Some(env) = writer_queue.pop().await {
                let payload = match serde_json::to_vec(&env) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("unencodable envelope: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(&payload).await {
                    debug!("peer write failed: {e}");
                    break;
                }
            }
        });

        // An outbound dialer opens with Hello; inbound replies after one.
        if outbound {
            self.send_hello(conn_id).await;
        }

        // Reader task with idle ping discipline.
        let mesh = self.clone();
        tokio::spawn(async move {
            mesh.reader_loop(conn_id, source).await;
            mesh.drop_conn(conn_id).await;
        });
    }

    async fn reader_loop(self: &Arc<Self>, conn_id: u64, mut source: FrameSource) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let frame = tokio::select! {
                frame = tokio::time::timeout(IDLE_TIMEOUT, source.next()) => frame,
                _ = shutdown.changed() => return,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(_) => {
                    // Idle: probe, then give the peer a short grace.
                    self.send_to(conn_id, Message::Ping { nonce: self.next_nonce() }).await;
                    match tokio::time::timeout(PONG_TIMEOUT, source.next()).await {
                        Ok(frame) => frame,
                        Err(_) => {
                            debug!(conn_id, "peer idle past grace, closing");
                            return;
                        }
                    }
                }
            };
            match frame {
                Ok(Some(bytes)) => {
                    if !self.handle_frame(conn_id, &bytes).await {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    debug!(conn_id, "peer read failed: {e}");
                    return;
                }
            }
        }
    }

    async fn drop_conn(self: &Arc<Self>, conn_id: u64) {
        let mut conns = self.conns.lock().await;
        if let Some(conn) = conns.remove(&conn_id) {
            conn.queue.close();
            debug!(conn_id, node_id = ?conn.node_id, "peer disconnected");
        }
    }

    /// Returns false when the connection should close (protocol error).
    async fn handle_frame(self: &Arc<Self>, conn_id: u64, bytes: &[u8]) -> bool {
        let envelope: Envelope = match serde_json::from_slice(bytes) {
            Ok(env) => env,
            Err(e) => {
                debug!(conn_id, "unparseable frame: {e}");
                self.penalize_conn(conn_id, 0.2).await;
                return false;
            }
        };
        if envelope.verify().is_err() {
            debug!(conn_id, "envelope signature rejected");
            self.penalize_conn(conn_id, 0.3).await;
            return true; // dropped silently
        }
        self.handle_message(conn_id, envelope).await;
        true
    }

    async fn handle_message(self: &Arc<Self>, conn_id: u64, envelope: Envelope) {
        let sender = envelope.sender_pubkey.clone();
        {
            let mut book = self.book.lock().await;
            book.touch(&sender);
        }

        match envelope.msg {
            Message::Hello { node_id, listen_addr, head_height, head_hash: _, known_peers } => {
                if node_id != sender {
                    self.penalize_conn(conn_id, 0.3).await;
                    return;
                }
                {
                    let mut book = self.book.lock().await;
                    book.upsert(&node_id, &listen_addr);
                }
                let should_reply = {
                    let mut conns = self.conns.lock().await;
                    let Some(conn) = conns.get_mut(&conn_id) else { return };
                    conn.node_id = Some(node_id.clone());
                    conn.remote_head = head_height;
                    let reply = !conn.sent_hello;
                    conn.sent_hello = true;
                    reply
                };
                if should_reply {
                    self.send_hello(conn_id).await;
                }

                // Discovery: dial shared addresses while under target.
                let live = self.conns.lock().await.len();
                if live < TARGET_CONNS {
                    for addr in known_peers.into_iter().take(TARGET_CONNS - live) {
                        if addr != self.listen_addr {
                            self.dial(addr);
                        }
                    }
                }

                let ours = self.ledger.snapshot().head_height;
                if head_height > ours {
                    self.request_blocks(conn_id, ours + 1).await;
                }
            }
            Message::GetBlocks { from_height, limit } => {
                let batch = self.params().sync_batch.min(limit).max(1);
                let blocks = self.ledger.snapshot().blocks_range(from_height, batch as usize);
                self.send_to(conn_id, Message::Blocks { blocks }).await;
            }
            Message::Blocks { blocks } => {
                self.handle_sync_chunk(conn_id, blocks).await;
            }
            Message::NewTx { tx, hop_count } => {
                let fresh = self.seen.lock().await.insert(&tx.id);
                if !fresh {
                    self.penalize_conn(conn_id, 0.02).await;
                    return;
                }
                match self.ledger.submit_tx(tx.clone(), false).await {
                    Ok(_) => self.forward(conn_id, Message::NewTx { tx, hop_count }).await,
                    Err(NodeError::State(StateError::DuplicateTx(_))) => {}
                    Err(e) => {
                        debug!(conn_id, %e, "gossiped tx rejected");
                        self.penalize_conn(conn_id, 0.1).await;
                    }
                }
            }
            Message::NewBlock { block, hop_count } => {
                let hash = block.hash();
                let fresh = self.seen.lock().await.insert(&hash);
                if !fresh {
                    self.penalize_conn(conn_id, 0.02).await;
                    return;
                }
                match self.ledger.accept_block(block.clone()).await {
                    Ok(summary) => {
                        if !matches!(summary.result, AcceptResult::AlreadyKnown) {
                            self.forward(conn_id, Message::NewBlock { block, hop_count }).await;
                        }
                    }
                    Err(NodeError::Validation(reason)) if reason.contains("unknown parent") => {
                        // We are behind; catch up from this peer.
                        let ours = self.ledger.snapshot().head_height;
                        self.request_blocks(conn_id, ours + 1).await;
                    }
                    Err(e) => {
                        debug!(conn_id, %e, "gossiped block rejected");
                        self.penalize_conn(conn_id, 0.1).await;
                    }
                }
            }
            Message::Ping { nonce } => {
                self.send_to(conn_id, Message::Pong { nonce }).await;
            }
            Message::Pong { .. } => {}
        }
    }

    /// Record the sync cursor and ask a peer for a chunk of blocks.
    async fn request_blocks(self: &Arc<Self>, conn_id: u64, from_height: BlockHeight) {
        let batch = self.params().sync_batch;
        {
            let mut conns = self.conns.lock().await;
            if let Some(conn) = conns.get_mut(&conn_id) {
                conn.sync_cursor = from_height;
            }
        }
        self.send_to(conn_id, Message::GetBlocks { from_height, limit: batch }).await;
    }

    async fn handle_sync_chunk(self: &Arc<Self>, conn_id: u64, blocks: Vec<Block>) {
        if blocks.is_empty() {
            return;
        }
        let mut accepted = 0usize;
        let mut progressed = false;
        for block in blocks {
            match self.ledger.accept_block(block).await {
                Ok(summary) => {
                    accepted += 1;
                    if matches!(summary.result, AcceptResult::Extended(_)) || summary.reorg.is_some()
                    {
                        progressed = true;
                    }
                }
                Err(e) => debug!(conn_id, %e, "sync block rejected"),
            }
        }

        let batch = self.params().sync_batch;
        let (remote_head, cursor, diverged) = {
            let mut conns = self.conns.lock().await;
            let Some(conn) = conns.get_mut(&conn_id) else { return };
            if progressed {
                conn.sync_failures = 0;
            } else {
                // Either nothing decoded or only non-advancing side blocks:
                // a chain that consistently fails to validate greylists.
                conn.sync_failures += 1;
            }
            (conn.remote_head, conn.sync_cursor, conn.sync_failures >= MAX_SYNC_FAILURES)
        };

        if diverged {
            warn!(conn_id, "peer chain consistently fails validation");
            self.penalize_conn(conn_id, 1.0).await;
            return;
        }

        if !progressed {
            // The chunk hung on an unknown parent or known side blocks:
            // the fork point is earlier, so walk the request window back.
            debug!(conn_id, accepted, cursor, "sync made no progress, walking back");
            let from = cursor.saturating_sub(batch).max(1);
            if from < cursor {
                self.request_blocks(conn_id, from).await;
            }
            return;
        }

        let ours = self.ledger.snapshot().head_height;
        if ours < remote_head {
            self.request_blocks(conn_id, ours + 1).await;
        }
    }

    async fn send_hello(self: &Arc<Self>, conn_id: u64) {
        let snapshot = self.ledger.snapshot();
        let known = self.book.lock().await.shareable_addresses(16);
        let envelope = super::hello_for(
            &self.identity,
            &self.listen_addr,
            snapshot.head_height,
            snapshot.head_hash.clone(),
            known,
            self.next_nonce(),
        );
        self.push_to(conn_id, envelope).await;
    }

    async fn send_to(self: &Arc<Self>, conn_id: u64, msg: Message) {
        let envelope = Envelope::seal(&self.identity, msg, self.next_nonce());
        self.push_to(conn_id, envelope).await;
    }

    async fn push_to(self: &Arc<Self>, conn_id: u64, envelope: Envelope) {
        let shed = {
            let conns = self.conns.lock().await;
            match conns.get(&conn_id) {
                Some(conn) => !conn.queue.push(envelope),
                None => false,
            }
        };
        if shed {
            self.penalize_conn(conn_id, 0.05).await;
        }
    }

    /// Forward a gossip message to every live peer except the source,
    /// respecting the hop budget and greylist.
    async fn forward(self: &Arc<Self>, from_conn: u64, msg: Message) {
        let msg = match msg {
            Message::NewTx { tx, hop_count } => {
                if hop_count + 1 > MAX_HOPS.min(self.params().max_hops) {
                    return;
                }
                Message::NewTx { tx, hop_count: hop_count + 1 }
            }
            Message::NewBlock { block, hop_count } => {
                if hop_count + 1 > MAX_HOPS.min(self.params().max_hops) {
                    return;
                }
                Message::NewBlock { block, hop_count: hop_count + 1 }
            }
            other => other,
        };
        self.broadcast_internal(Some(from_conn), msg).await;
    }

    async fn broadcast_internal(self: &Arc<Self>, except: Option<u64>, msg: Message) {
        let envelope = Envelope::seal(&self.identity, msg, self.next_nonce());
        let targets: Vec<(u64, Arc<OutboundQueue>, Option<String>)> = {
            let conns = self.conns.lock().await;
            conns
                .iter()
                .filter(|(id, _)| Some(**id) != except)
                .map(|(id, c)| (*id, c.queue.clone(), c.node_id.clone()))
                .collect()
        };
        let book = self.book.lock().await;
        let mut shed_conns = Vec::new();
        for (conn_id, queue, node_id) in targets {
            if let Some(node_id) = &node_id {
                if book.is_greylisted(node_id) {
                    continue;
                }
            }
            if !queue.push(envelope.clone()) {
                shed_conns.push(conn_id);
            }
        }
        drop(book);
        for conn_id in shed_conns {
            self.penalize_conn(conn_id, 0.05).await;
        }
    }

    /// Gossip a locally submitted tx.
    pub async fn broadcast_tx(self: &Arc<Self>, tx: Transaction) {
        self.seen.lock().await.insert(&tx.id);
        self.broadcast_internal(None, Message::NewTx { tx, hop_count: 0 }).await;
    }

    /// Gossip a locally sealed block.
    pub async fn broadcast_block(self: &Arc<Self>, block: Block) {
        self.seen.lock().await.insert(&block.hash());
        self.broadcast_internal(None, Message::NewBlock { block, hop_count: 0 }).await;
    }

    async fn penalize_conn(self: &Arc<Self>, conn_id: u64, amount: f64) {
        let node_id = {
            let conns = self.conns.lock().await;
            conns.get(&conn_id).and_then(|c| c.node_id.clone())
        };
        if let Some(node_id) = node_id {
            let grey = self.params().greylist_secs;
            let mut book = self.book.lock().await;
            book.penalize(&node_id, amount, grey);
        }
    }

    pub async fn peer_table(&self) -> serde_json::Value {
        let book = self.book.lock().await;
        super::peer_table_json(&book)
    }

    pub async fn live_conns(&self) -> usize {
        self.conns.lock().await.len()
    }

    /// Stop accepting connections and close every peer queue.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let conns = self.conns.lock().await;
        for conn in conns.values() {
            conn.queue.close();
        }
    }
}
