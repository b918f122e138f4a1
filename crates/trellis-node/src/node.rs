//! Node controller.
//!
//! Owns the listener, dials peers, runs one receive loop per connection and
//! exposes the send API. Per inbound envelope the receive loop:
//!
//! 1. drops it if its timestamp is outside the replay window
//! 2. merges its Lamport stamp
//! 3. drops it if it arrived with no hops left
//! 4. opens it with the link key and checks the origin signature
//! 5. delivers it locally once (addressed here, or flooded)
//! 6. forwards it with one hop less (addressed elsewhere, or flooded)
//!
//! HELLO is link-local: it binds a peer id to the handshake key of the
//! session it arrives on and is never forwarded.

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use trellis_common::config::split_host_port;
use trellis_common::helpers::now_millis;
use trellis_common::{Error, NodeConfig, Result};
use trellis_core::{
    read_frame, Body, Envelope, Frame, MessageType, PeerRecord, WireError, BROADCAST_ADDRESS,
};
use trellis_crypto::{handshake, HandshakeError, Identity, PeerKey};

use crate::authorizer::{AllowAll, AllowList, Authorizer};
use crate::directory::{PeerDirectory, StaticDirectory};
use crate::files::{split_chunks, FileAssembler};
use crate::lamport::LamportClock;
use crate::membership::{Membership, PinResult};
use crate::router::{RouteOutcome, Router};
use crate::seen::SeenSet;
use crate::session::{Session, PENDING_PREFIX};
use crate::sink::{DirectorySink, FileSink};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Something the application should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// PRIVATE or GROUP text.
    Message {
        from: String,
        kind: MessageType,
        text: String,
    },
    FileReceived {
        from: String,
        path: PathBuf,
    },
    FileAck {
        from: String,
        status: String,
    },
    FileFailed {
        from: String,
        reason: String,
    },
    /// Membership changed; carries the new sorted list.
    PeersChanged(Vec<String>),
}

type EventCallback = Arc<dyn Fn(NodeEvent) + Send + Sync>;

pub struct NodeBuilder {
    config: NodeConfig,
    identity: Option<Identity>,
    directory: Option<Arc<dyn PeerDirectory>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    sink: Option<Arc<dyn FileSink>>,
}

impl NodeBuilder {
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn PeerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn file_sink(mut self, sink: Arc<dyn FileSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Node> {
        let NodeBuilder {
            config,
            identity,
            directory,
            authorizer,
            sink,
        } = self;
        config.validate()?;

        let directory: Arc<dyn PeerDirectory> = match directory {
            Some(directory) => directory,
            None => Arc::new(StaticDirectory::new(config.peers.clone())),
        };
        let authorizer: Arc<dyn Authorizer> = match (authorizer, &config.authorized_peers) {
            (Some(authorizer), _) => authorizer,
            (None, Some(peers)) => Arc::new(AllowList::new(peers.iter().cloned())),
            (None, None) => Arc::new(AllowAll),
        };
        let sink: Arc<dyn FileSink> = match sink {
            Some(sink) => sink,
            None => Arc::new(DirectorySink::new(config.download_dir.clone())),
        };

        let inner = Inner {
            identity: identity.unwrap_or_else(Identity::generate),
            router: Router::new(config.replay_window(), config.seen_capacity),
            delivered: SeenSet::new(config.replay_window(), config.seen_capacity),
            files: Mutex::new(FileAssembler::new(
                config.max_file_bytes,
                config.partial_file_timeout(),
            )),
            pool: Arc::new(Semaphore::new(config.max_connections)),
            membership: Membership::new(),
            clock: LamportClock::new(),
            directory,
            authorizer,
            sink,
            callback: StdRwLock::new(None),
            next_conn_id: AtomicU64::new(1),
            dialing: Mutex::new(HashSet::new()),
            local_addr: OnceLock::new(),
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
            config,
        };
        Ok(Node {
            inner: Arc::new(inner),
        })
    }
}

/// A running overlay node. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    config: NodeConfig,
    identity: Identity,
    router: Router,
    membership: Membership,
    clock: LamportClock,
    /// Message ids already handed to the application.
    delivered: SeenSet,
    files: Mutex<FileAssembler>,
    directory: Arc<dyn PeerDirectory>,
    authorizer: Arc<dyn Authorizer>,
    sink: Arc<dyn FileSink>,
    callback: StdRwLock<Option<EventCallback>>,
    /// One permit per live connection task.
    pool: Arc<Semaphore>,
    next_conn_id: AtomicU64,
    /// Peer ids with an auto-connect in flight.
    dialing: Mutex<HashSet<String>>,
    local_addr: OnceLock<SocketAddr>,
    closing: AtomicBool,
    shutdown: Notify,
}

impl Node {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder {
            config,
            identity: None,
            directory: None,
            authorizer: None,
            sink: None,
        }
    }

    /// Build with a fresh identity and collaborators derived from `config`.
    pub fn new(config: NodeConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.config.peer_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn fingerprint(&self) -> String {
        self.inner.identity.public().fingerprint()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    /// Bind the listener and start accepting. Port 0 picks a free port.
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        let host = self.inner.config.listen_host.as_str();
        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        self.inner
            .local_addr
            .set(addr)
            .map_err(|_| Error::internal("node already started"))?;

        info!(
            peer = %self.peer_id(),
            %addr,
            fingerprint = %self.fingerprint(),
            "listening"
        );
        tokio::spawn(self.inner.clone().accept_loop(listener));
        Ok(addr)
    }

    /// Dial a peer, run the handshake and wait until its HELLO is accepted.
    pub async fn connect(&self, peer_id: &str, host: &str, port: u16) -> Result<()> {
        self.inner.connect(peer_id, host, port).await
    }

    /// Send PRIVATE or GROUP text to one online peer or to `all`.
    pub async fn send_message(&self, to: &str, kind: MessageType, text: &str) -> Result<()> {
        self.inner.send_message(to, kind, text).await
    }

    /// Send a file to one online peer. Returns the number of chunks sent.
    pub async fn send_file(&self, to: &str, data: Bytes) -> Result<usize> {
        self.inner.send_file(to, data).await
    }

    /// Register the application callback, replacing any previous one.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(NodeEvent) + Send + Sync + 'static,
    {
        *self
            .inner
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Peers currently believed reachable, sorted.
    pub async fn list_peers(&self) -> Vec<String> {
        self.inner.membership.list().await
    }

    /// Peers with a direct, verified link.
    pub async fn connected_peers(&self) -> Vec<String> {
        let mut connected = Vec::new();
        for id in self.inner.router.session_ids().await {
            if self.inner.router.is_connected(&id).await {
                connected.push(id);
            }
        }
        connected
    }

    pub fn lamport(&self) -> i64 {
        self.inner.clock.current()
    }

    /// Stop accepting and close every session.
    pub async fn shutdown(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.pool.close();
        self.inner.shutdown.notify_waiters();
        self.inner.router.close_all().await;
        info!(peer = %self.peer_id(), "node stopped");
    }
}

impl Inner {
    fn self_id(&self) -> &str {
        &self.config.peer_id
    }

    fn emit(&self, event: NodeEvent) {
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    async fn emit_peers(&self) {
        self.emit(NodeEvent::PeersChanged(self.membership.list().await));
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);

        loop {
            // Wait for capacity before accepting; excess clients queue in the backlog.
            let permit = tokio::select! {
                permit = self.pool.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown.notified() => break,
            };

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "accepted connection");
                        let inner = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inner.clone().establish(stream, addr, true, permit).await {
                                warn!(%addr, "inbound handshake failed: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        drop(permit);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = cleanup.tick() => {
                    drop(permit);
                    self.cleanup().await;
                }
                _ = self.shutdown.notified() => break,
            }
        }
        debug!(peer = %self.self_id(), "accept loop stopped");
    }

    async fn cleanup(&self) {
        let evicted = self.files.lock().await.evict_stalled(Instant::now());
        if evicted > 0 {
            info!(evicted, "stalled file transfers dropped");
        }
    }

    /// Handshake on a fresh stream, register the session and start its reader.
    async fn establish(
        self: Arc<Self>,
        mut stream: TcpStream,
        addr: SocketAddr,
        inbound: bool,
        permit: OwnedSemaphorePermit,
    ) -> Result<Arc<Session>> {
        let step = self.config.handshake_timeout();
        let handshake = if inbound {
            handshake::respond(&mut stream, &self.identity, step).await
        } else {
            handshake::initiate(&mut stream, &self.identity, step).await
        };
        let link = handshake.map_err(handshake_error)?;

        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Session::new(
            conn_id,
            addr,
            inbound,
            link,
            writer,
            self.config.write_timeout(),
        ));
        self.router
            .add_session(&session.peer_id(), session.clone())
            .await;
        debug!(
            conn = conn_id,
            %addr,
            inbound,
            remote = %session.remote_fingerprint(),
            "link established"
        );

        tokio::spawn(self.clone().read_loop(session.clone(), reader, permit));
        Ok(session)
    }

    // Explicit `Send`: the loop indirectly spawns further read loops.
    fn read_loop(
        self: Arc<Self>,
        session: Arc<Session>,
        mut reader: OwnedReadHalf,
        permit: OwnedSemaphorePermit,
    ) -> impl Future<Output = ()> + Send + 'static {
        async move {
            let _permit = permit;
            self.receive(&session, &mut reader).await;
            self.session_lost(&session).await;
        }
    }

    async fn receive(self: &Arc<Self>, session: &Arc<Session>, reader: &mut OwnedReadHalf) {
        loop {
            let frame = tokio::select! {
                _ = session.closed() => break,
                frame = read_frame(reader) => frame,
            };

            match frame {
                Ok(Frame::Envelope(body)) => {
                    if let Err(e) = self.handle_envelope(session, body).await {
                        if e.is_session_fatal() {
                            warn!(peer = %session.peer_id(), "session failed: {}", e);
                            break;
                        }
                        warn!(peer = %session.peer_id(), "envelope dropped: {}", e);
                    }
                }
                Ok(other) => {
                    warn!(peer = %session.peer_id(), frame = other.name(), "unexpected frame after handshake");
                }
                Err(WireError::UnknownFrameType(kind)) => {
                    warn!(peer = %session.peer_id(), "unknown frame type 0x{:02x}", kind);
                }
                Err(e) if e.is_disconnect() => break,
                Err(e) => {
                    warn!(peer = %session.peer_id(), "stream error: {}", e);
                    break;
                }
            }
        }
    }

    async fn session_lost(&self, session: &Arc<Session>) {
        session.shutdown().await;
        let Some(id) = self.router.remove_if_current(session).await else {
            debug!(conn = session.conn_id(), "replaced session closed");
            return;
        };
        if !session.is_verified() {
            debug!(conn = session.conn_id(), addr = %session.remote_addr(), "pending link closed");
            return;
        }

        info!(peer = %id, "lost connection");
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        if self.membership.remove(&id).await {
            self.emit_peers().await;
            self.broadcast_peer_list().await;
        }
    }

    async fn handle_envelope(self: &Arc<Self>, session: &Arc<Session>, raw: Bytes) -> Result<()> {
        let envelope = Envelope::decode(raw).map_err(Error::protocol)?;

        let window = self.config.replay_window_ms as i64;
        let age = envelope.age_ms(now_millis());
        if age > window || age < -window {
            return Err(Error::protocol(format!(
                "stale envelope {} ({} ms old)",
                envelope.message_id, age
            )));
        }

        self.clock.observe(envelope.lamport);

        if envelope.ttl <= 0 {
            return Err(Error::protocol(format!(
                "envelope {} arrived with ttl {}",
                envelope.message_id, envelope.ttl
            )));
        }

        let envelope = session.open(envelope).map_err(Error::crypto)?;

        if envelope.kind == MessageType::Hello {
            return self.handle_hello(session, envelope).await;
        }
        if !session.is_verified() {
            return Err(Error::protocol(format!(
                "{} before HELLO on {}",
                envelope.kind,
                session.peer_id()
            )));
        }

        self.verify_origin(&envelope).await?;

        if envelope.sender_id == self.self_id() {
            return Ok(());
        }

        let for_me = envelope.receiver_id == self.self_id();
        let flooded = envelope.is_flooded();

        if (for_me || flooded) && self.delivered.insert(&envelope.message_id).await {
            debug!(
                msg = %envelope.message_id,
                from = %envelope.sender_id,
                kind = %envelope.kind,
                lamport = envelope.lamport,
                "delivering"
            );
            self.dispatch(&envelope).await?;
        }

        if flooded || !for_me {
            let ttl = envelope.ttl - 1;
            if ttl <= 0 {
                debug!(msg = %envelope.message_id, "hop budget spent, not forwarding");
            } else {
                self.router
                    .forward(&envelope.clone().with_ttl(ttl), session)
                    .await;
            }
        }
        Ok(())
    }

    async fn verify_origin(&self, envelope: &Envelope) -> Result<()> {
        let Some(key) = self.membership.key(&envelope.sender_id).await else {
            return Err(Error::crypto(format!(
                "no known key for {}",
                envelope.sender_id
            )));
        };
        let Some(signature) = &envelope.signature else {
            return Err(Error::crypto(format!(
                "unsigned envelope from {}",
                envelope.sender_id
            )));
        };
        if !key.verify(&envelope.signing_bytes(), signature) {
            return Err(Error::crypto(format!(
                "signature mismatch on {} from {}",
                envelope.message_id, envelope.sender_id
            )));
        }
        if !self.authorizer.is_authorized(&envelope.sender_id, &key) {
            return Err(Error::auth(format!("{} is not authorized", envelope.sender_id)));
        }
        Ok(())
    }

    async fn handle_hello(self: &Arc<Self>, session: &Arc<Session>, envelope: Envelope) -> Result<()> {
        let Body::Hello(record) = Body::from_envelope(&envelope).map_err(Error::protocol)? else {
            return Err(Error::protocol("HELLO without a peer record"));
        };
        let id = record.peer_id.as_str();

        if id != envelope.sender_id {
            return Err(Error::protocol(format!(
                "HELLO record {} sent by {}",
                id, envelope.sender_id
            )));
        }
        if id == self.self_id() || id.starts_with(PENDING_PREFIX) {
            session.close();
            return Err(Error::protocol(format!("refusing HELLO as {id}")));
        }

        let key = session.remote_key();
        let signed = envelope
            .signature
            .as_ref()
            .map(|sig| key.verify(&envelope.signing_bytes(), sig))
            .unwrap_or(false);
        if !signed {
            return Err(Error::crypto(format!("HELLO from {id} not signed by handshake key")));
        }
        if let Some(encoded) = &record.signing_key {
            if PeerKey::parse(encoded).ok() != Some(key) {
                return Err(Error::crypto(format!("HELLO from {id} advertises a foreign key")));
            }
        }

        if !self.authorizer.is_authorized(id, &key) {
            session.close();
            return Err(Error::auth(format!("{id} is not authorized")));
        }

        let current = session.peer_id();
        if session.is_verified() && current != id {
            session.close();
            return Err(Error::protocol(format!(
                "link verified as {current} sent HELLO as {id}"
            )));
        }

        match self.membership.pin_key(id, key).await {
            PinResult::Conflict => {
                session.close();
                return Err(Error::auth(format!("{id} presented a key other than the pinned one")));
            }
            PinResult::Replaced => {
                warn!(peer = %id, "HELLO key replaces a key learned from gossip");
            }
            PinResult::Pinned | PinResult::Unchanged => {}
        }

        if current != id && !self.router.rekey(&current, id).await {
            return Err(Error::routing(format!("session {current} vanished before HELLO")));
        }
        if let Some(addr) = &record.addr {
            self.membership.learn_addr(id, addr).await;
        }

        let first = session.mark_verified();
        let added = self.membership.add(id).await;
        if !first {
            return Ok(());
        }

        info!(
            peer = %id,
            addr = %session.remote_addr(),
            fingerprint = %key.fingerprint(),
            "peer joined"
        );
        if session.is_inbound() {
            self.send_hello(session, id).await?;
        }
        if added {
            self.emit_peers().await;
        }
        self.broadcast_peer_list().await;
        Ok(())
    }

    async fn dispatch(self: &Arc<Self>, envelope: &Envelope) -> Result<()> {
        let from = envelope.sender_id.clone();
        match Body::from_envelope(envelope).map_err(Error::protocol)? {
            Body::Hello(_) => {
                // Handled per link before dispatch.
            }
            Body::Private(text) | Body::Group(text) => {
                self.emit(NodeEvent::Message {
                    from,
                    kind: envelope.kind,
                    text,
                });
            }
            Body::File {
                chunk_index,
                total_chunks,
                data,
            } => {
                let assembled = self
                    .files
                    .lock()
                    .await
                    .accept(&from, chunk_index, total_chunks, data);
                match assembled {
                    Ok(Some(file)) => self.store_file(from, file).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(from = %from, "file transfer rejected: {}", e);
                        self.send_control(&from, Body::FileFail(e.to_string())).await;
                    }
                }
            }
            Body::FileAck(status) => {
                info!(from = %from, "file delivered");
                self.emit(NodeEvent::FileAck { from, status });
            }
            Body::FileFail(reason) => {
                warn!(from = %from, "file transfer failed: {}", reason);
                self.emit(NodeEvent::FileFailed { from, reason });
            }
            Body::PeerList(records) => {
                let report = self
                    .membership
                    .merge(&records, self.self_id(), self.authorizer.as_ref())
                    .await;
                for rejected in &report.rejected {
                    warn!(peer = %rejected, via = %from, "gossiped peer refused");
                }
                if !report.added.is_empty() {
                    debug!(added = ?report.added, via = %from, "peers learned");
                    self.emit_peers().await;
                }
                let candidates: Vec<String> = records.into_iter().map(|r| r.peer_id).collect();
                self.auto_connect(candidates).await;
            }
        }
        Ok(())
    }

    async fn store_file(&self, from: String, data: Bytes) {
        let name = format!("recv_{}_{}", from, now_millis());
        let sink = self.sink.clone();
        let size = data.len();
        let written = tokio::task::spawn_blocking(move || sink.write(&name, &data)).await;

        match written {
            Ok(Ok(path)) => {
                info!(from = %from, path = %path.display(), size, "file received");
                self.emit(NodeEvent::FileReceived {
                    from: from.clone(),
                    path,
                });
                self.send_control(&from, Body::FileAck("OK".into())).await;
            }
            Ok(Err(e)) => {
                warn!(from = %from, "file write failed: {}", e);
                self.send_control(&from, Body::FileFail(e.to_string())).await;
            }
            Err(e) => {
                warn!(from = %from, "file write task failed: {}", e);
                self.send_control(&from, Body::FileFail(e.to_string())).await;
            }
        }
    }

    /// Dial peers learned from gossip that we have no link to.
    ///
    /// Only the side with the smaller id dials, so two peers never race to
    /// connect to each other.
    async fn auto_connect(self: &Arc<Self>, candidates: Vec<String>) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        for id in candidates {
            if id.as_str() <= self.self_id() || self.router.session(&id).await.is_some() {
                continue;
            }
            let Some(addr) = self.resolve(&id).await else {
                continue;
            };
            if !self.dialing.lock().await.insert(id.clone()) {
                continue;
            }

            let inner = self.clone();
            tokio::spawn(async move {
                match split_host_port(&addr) {
                    Some((host, port)) => {
                        if let Err(e) = inner.connect(&id, host, port).await {
                            debug!(peer = %id, %addr, "auto-connect failed: {}", e);
                        }
                    }
                    None => warn!(peer = %id, %addr, "unusable peer address"),
                }
                inner.dialing.lock().await.remove(&id);
            });
        }
    }

    async fn resolve(&self, peer_id: &str) -> Option<String> {
        match self.membership.addr(peer_id).await {
            Some(addr) => Some(addr),
            None => self.directory.resolve(peer_id),
        }
    }

    async fn connect(self: &Arc<Self>, peer_id: &str, host: &str, port: u16) -> Result<()> {
        if peer_id == self.self_id() {
            return Err(Error::protocol("cannot connect to self"));
        }
        if self.router.is_connected(peer_id).await {
            return Ok(());
        }

        let step = self.config.handshake_timeout();
        let stream = timeout(step, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::timeout(format!("connecting to {host}:{port}")))??;
        let addr = stream.peer_addr()?;
        let permit = self
            .pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::internal("node is shutting down"))?;

        let session = self.clone().establish(stream, addr, false, permit).await?;
        self.send_hello(&session, peer_id).await?;

        match timeout(step, session.wait_verified()).await {
            Ok(true) => {
                let actual = session.peer_id();
                if actual != peer_id {
                    info!(expected = %peer_id, actual = %actual, "peer answered under another id");
                }
                Ok(())
            }
            Ok(false) => Err(Error::auth(format!("{peer_id} closed the link before HELLO"))),
            Err(_) => {
                self.router.remove_if_current(&session).await;
                Err(Error::timeout(format!("waiting for HELLO from {peer_id}")))
            }
        }
    }

    fn own_record(&self) -> PeerRecord {
        let mut record = PeerRecord::new(self.self_id())
            .with_signing_key(self.identity.public().peer_key().encode());
        let advertised = self
            .local_addr
            .get()
            .and_then(|addr| self.config.advertised_addr(addr.port()));
        if let Some(addr) = advertised {
            record = record.with_addr(addr);
        }
        record
    }

    fn sign(&self, mut envelope: Envelope) -> Envelope {
        let signature = self.identity.sign(&envelope.signing_bytes());
        envelope.signature = Some(Bytes::copy_from_slice(&signature));
        envelope
    }

    async fn send_hello(&self, session: &Session, receiver: &str) -> Result<()> {
        let body = Body::Hello(self.own_record());
        let envelope = Envelope::new(
            self.self_id(),
            receiver,
            MessageType::Hello,
            self.clock.tick(),
            body.to_payload(),
        )
        .with_ttl(1);
        session.send(&self.sign(envelope)).await?;
        Ok(())
    }

    /// Build, stamp and sign a new envelope, marking it delivered locally.
    async fn originate(&self, receiver: &str, body: Body) -> Envelope {
        let (chunk_index, total_chunks) = body.chunk_fields();
        let envelope = Envelope::new(
            self.self_id(),
            receiver,
            body.kind(),
            self.clock.tick(),
            body.to_payload(),
        )
        .with_ttl(self.config.default_ttl)
        .with_chunk(chunk_index, total_chunks);
        let envelope = self.sign(envelope);
        self.delivered.insert(&envelope.message_id).await;
        envelope
    }

    async fn send_control(&self, receiver: &str, body: Body) {
        let envelope = self.originate(receiver, body).await;
        if self.router.route(&envelope).await == RouteOutcome::NoRoute {
            debug!(receiver = %receiver, kind = %envelope.kind, "control message undeliverable");
        }
    }

    async fn broadcast_peer_list(&self) {
        let mut records = vec![self.own_record()];
        records.extend(self.membership.records().await);
        let envelope = self
            .originate(BROADCAST_ADDRESS, Body::PeerList(records))
            .await;
        self.router.route(&envelope).await;
    }

    async fn ensure_online(&self, to: &str) -> Result<()> {
        if self.membership.contains(to).await {
            Ok(())
        } else {
            Err(Error::routing(format!("{to} is not online")))
        }
    }

    async fn send_message(&self, to: &str, kind: MessageType, text: &str) -> Result<()> {
        let to_all = to.eq_ignore_ascii_case(BROADCAST_ADDRESS);
        let body = match kind {
            MessageType::Private => Body::Private(text.to_string()),
            MessageType::Group => Body::Group(text.to_string()),
            other => {
                return Err(Error::protocol(format!(
                    "{other} cannot be sent as a text message"
                )))
            }
        };
        if !to_all {
            self.ensure_online(to).await?;
        }
        let receiver = if to_all { BROADCAST_ADDRESS } else { to };

        let envelope = self.originate(receiver, body).await;
        match self.router.route(&envelope).await {
            RouteOutcome::NoRoute => Err(Error::routing(format!("no route to {receiver}"))),
            _ => Ok(()),
        }
    }

    async fn send_file(&self, to: &str, data: Bytes) -> Result<usize> {
        if to.eq_ignore_ascii_case(BROADCAST_ADDRESS) {
            return Err(Error::protocol("files are sent to a single peer"));
        }
        self.ensure_online(to).await?;
        if data.len() as u64 > self.config.max_file_bytes {
            return Err(Error::protocol(format!(
                "file of {} bytes exceeds the {} byte limit",
                data.len(),
                self.config.max_file_bytes
            )));
        }

        let chunks = split_chunks(&data, self.config.file_chunk_size);
        let total = chunks.len() as u32;
        for (index, data) in chunks.into_iter().enumerate() {
            let body = Body::File {
                chunk_index: index as u32,
                total_chunks: total,
                data,
            };
            let envelope = self.originate(to, body).await;
            if self.router.route(&envelope).await == RouteOutcome::NoRoute {
                return Err(Error::routing(format!("no route to {to}")));
            }
        }
        debug!(to = %to, chunks = total, size = data.len(), "file sent");
        Ok(total as usize)
    }
}

fn handshake_error(err: HandshakeError) -> Error {
    match err {
        HandshakeError::Timeout(step) => Error::timeout(format!("handshake waiting for {step}")),
        HandshakeError::Crypto(e) => Error::crypto(e),
        HandshakeError::Wire(WireError::Io(e)) => Error::Transport(e),
        other => Error::protocol(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback(id: &str) -> NodeConfig {
        let mut config = NodeConfig::for_peer(id);
        config.listen_host = "127.0.0.1".into();
        config
    }

    #[test]
    fn builder_validates_config() {
        assert!(matches!(
            Node::new(NodeConfig::default()),
            Err(Error::Config(_))
        ));
        let mut config = loopback("a");
        config.default_ttl = 0;
        assert!(Node::new(config).is_err());
    }

    #[tokio::test]
    async fn own_record_advertises_bound_address() {
        let node = Node::new(loopback("a")).unwrap();
        assert_eq!(node.inner.own_record().addr, None);

        let addr = node.start(0).await.unwrap();
        let record = node.inner.own_record();
        assert_eq!(record.addr, Some(format!("127.0.0.1:{}", addr.port())));
        assert_eq!(
            record.signing_key,
            Some(node.inner.identity.public().peer_key().encode())
        );
        assert!(matches!(node.start(0).await, Err(Error::Internal(_))));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn only_text_kinds_are_sent_as_messages() {
        let node = Node::new(loopback("a")).unwrap();
        let err = node
            .send_message("all", MessageType::FileAck, "OK")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn broadcast_without_links_reaches_nobody() {
        let node = Node::new(loopback("a")).unwrap();
        node.send_message("all", MessageType::Group, "anyone?")
            .await
            .unwrap();
        assert!(node.connected_peers().await.is_empty());
    }

    #[tokio::test]
    async fn originated_envelopes_are_signed_and_stamped() {
        let node = Node::new(loopback("a")).unwrap();
        let inner = &node.inner;
        let envelope = inner
            .originate("b", Body::Private("hi".into()))
            .await;

        assert_eq!(envelope.ttl, inner.config.default_ttl);
        assert_eq!(envelope.lamport, 1);
        assert!(inner.delivered.contains(&envelope.message_id).await);
        let key = inner.identity.public().peer_key();
        let signature = envelope.signature.as_ref().unwrap();
        assert!(key.verify(&envelope.signing_bytes(), signature));
    }

    #[test]
    fn handshake_timeouts_map_to_timeout_errors() {
        assert!(matches!(
            handshake_error(HandshakeError::Timeout("WrappedKeyMsg")),
            Error::Timeout(_)
        ));
    }
}
