//! Connection worker: one per accepted stream.
//!
//! Lifecycle:
//! 1. read the handshake request (bounded by the handshake timeout)
//! 2. answer it; stop here unless accepted
//! 3. replay the backlog for returning identities; a shutdown or a peer
//!    that stops reading abandons the replay
//! 4. start the writer task that drains the session's outbound queue
//! 5. read client records and publish them until logout, EOF, a fatal
//!    read error or shutdown
//! 6. tear the session down exactly once, also when the worker is aborted

use crate::handshake::{self, Accepted, SessionKind};
use crate::relay::{publish_message, replay};
use crate::server::{shutdown_requested, Shared};
use crate::session::Outbound;
use crate::store::MessageId;
use crate::transport::{RecordReader, RecordWriter};
use courier_core::{CourierError, CourierResult, HandshakeRequest, MessageRecord};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long teardown waits for the writer to flush queued records.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Logout,
    PeerClosed,
    ReadError,
    Shutdown,
}

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Drive one client connection to completion.
pub async fn serve_connection<S>(
    shared: Arc<Shared>,
    stream: S,
    remote: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = RecordReader::new(read_half, shared.config.max_line_bytes);
    let mut writer = RecordWriter::with_timeout(write_half, shared.config.write_timeout);

    let request = match read_handshake(&shared, &mut reader, &mut shutdown).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            debug!(remote = %remote, "connection closed before handshake");
            return;
        }
        Err(e) => {
            warn!(remote = %remote, error = %e, "handshake not received");
            if !matches!(e, CourierError::Timeout) {
                let _ = writer.send(&handshake::malformed_response()).await;
            }
            let _ = writer.shutdown().await;
            return;
        }
    };

    let (tx, rx) = mpsc::channel(shared.config.outbound_buffer);
    let outcome = handshake::perform(
        &request,
        shared.store.as_ref(),
        &shared.sessions,
        tx,
        now_unix(),
    )
    .await;

    let Some(accepted) = outcome.accepted else {
        let _ = writer.send(&outcome.response).await;
        let _ = writer.shutdown().await;
        return;
    };
    let identity = accepted.identity.clone();
    let kind = accepted.kind;
    let guard = SessionGuard::new(shared.clone(), accepted);

    if let Err(e) = writer.send(&outcome.response).await {
        warn!(remote = %remote, login = %identity.login, error = %e, "handshake response not delivered");
        guard.release(None).await;
        return;
    }
    info!(remote = %remote, login = %identity.login, "session started");

    let watermark = if kind == SessionKind::Returning {
        let replayed = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => {
                Err(CourierError::Other("shutdown during backlog replay".into()))
            }
            replayed = replay(shared.store.as_ref(), &identity, &mut writer) => replayed,
        };
        match replayed {
            Ok(watermark) => watermark,
            Err(e) => {
                warn!(login = %identity.login, error = %e, "backlog replay aborted");
                let _ = writer.shutdown().await;
                guard.release(None).await;
                return;
            }
        }
    } else {
        None
    };

    let login = identity.login;
    let writer_task = tokio::spawn(write_loop(writer, rx, watermark, login.clone()));

    let reason = read_loop(&shared, &mut reader, &login, &mut shutdown).await;
    info!(remote = %remote, login = %login, reason = ?reason, "session ending");

    guard.release(Some(writer_task)).await;
}

/// Holds an accepted session until it is released. A worker aborted before
/// [`SessionGuard::release`] still gives the session back when dropped.
struct SessionGuard {
    shared: Arc<Shared>,
    accepted: Option<Accepted>,
}

impl SessionGuard {
    fn new(shared: Arc<Shared>, accepted: Accepted) -> Self {
        Self {
            shared,
            accepted: Some(accepted),
        }
    }

    async fn release(mut self, writer_task: Option<JoinHandle<()>>) {
        if let Some(accepted) = self.accepted.take() {
            teardown(&self.shared, accepted, writer_task).await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(accepted) = self.accepted.take() else {
            return;
        };
        warn!(login = %accepted.identity.login, "connection worker cancelled, releasing session");
        let shared = self.shared.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { teardown(&shared, accepted, None).await });
            }
            Err(e) => {
                warn!(login = %accepted.identity.login, error = %e, "no runtime to release session");
            }
        }
    }
}

async fn read_handshake<R: AsyncRead + Unpin>(
    shared: &Shared,
    reader: &mut RecordReader<R>,
    shutdown: &mut watch::Receiver<bool>,
) -> CourierResult<Option<HandshakeRequest>> {
    let timeout = shared.config.handshake_timeout;
    tokio::select! {
        biased;
        _ = shutdown_requested(shutdown) => Ok(None),
        read = tokio::time::timeout(timeout, reader.next_record::<HandshakeRequest>()) => {
            read.map_err(|_| CourierError::Timeout)?
        }
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    shared: &Shared,
    reader: &mut RecordReader<R>,
    login: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> ExitReason {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => return ExitReason::Shutdown,
            next = reader.next_record::<MessageRecord>() => next,
        };

        let mut record = match next {
            Ok(Some(record)) => record,
            Ok(None) => return ExitReason::PeerClosed,
            Err(e) if e.is_recoverable() => {
                warn!(login = %login, error = %e, "malformed record skipped");
                continue;
            }
            Err(e) => {
                debug!(login = %login, error = %e, "read failed");
                return ExitReason::ReadError;
            }
        };

        if let Err(e) = record.validate_inbound() {
            warn!(login = %login, error = %e, "invalid record skipped");
            continue;
        }
        if record.is_logout() {
            return ExitReason::Logout;
        }
        if record.sender != login {
            warn!(login = %login, claimed = %record.sender.escape_debug(), "sender overwritten with session login");
            record.sender = login.to_string();
        }
        if record.timestamp <= 0 {
            record.timestamp = now_unix();
        }

        if let Err(e) = publish_message(shared.bus.as_ref(), &shared.config.topic, &record).await {
            warn!(login = %login, receiver = %record.receiver, error = %e, "publish failed, message dropped");
        }
    }
}

/// Drain the outbound queue onto the connection until every sender is gone.
///
/// Persisted messages at or below `watermark` were already written by the
/// backlog replay and are skipped.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: RecordWriter<W>,
    mut rx: mpsc::Receiver<Outbound>,
    watermark: Option<MessageId>,
    login: String,
) {
    while let Some(outbound) = rx.recv().await {
        if let (Some(id), Some(mark)) = (outbound.message_id, watermark) {
            if id <= mark {
                debug!(login = %login, message_id = id, "already replayed, skipped");
                continue;
            }
        }
        if let Err(e) = writer.send(&outbound.record).await {
            debug!(login = %login, error = %e, "write failed, writer stopping");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Release everything an accepted session holds: table entry, online flag,
/// outbound queue and transport.
async fn teardown(
    shared: &Shared,
    accepted: Accepted,
    writer_task: Option<JoinHandle<()>>,
) {
    let Accepted {
        identity, session, ..
    } = accepted;

    shared.sessions.unregister(&identity.login).await;
    if let Err(e) = shared.store.set_online(session.identity_id, false).await {
        warn!(login = %identity.login, error = %e, "failed to clear online flag");
    }
    let connected_for = session.connected_at.elapsed();
    // Last sender owned by this worker; the writer exits once the queue is empty.
    drop(session);

    if let Some(mut task) = writer_task {
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut task)
            .await
            .is_err()
        {
            warn!(login = %identity.login, "writer did not drain in time, aborting");
            task.abort();
        }
    }
    info!(
        login = %identity.login,
        connected_secs = connected_for.as_secs(),
        "session closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::ServerConfig;
    use crate::session::SessionTable;
    use crate::store::{MemoryStore, Store};
    use courier_core::{credential, HandshakeResponse, HandshakeStatus, Intent, MessageStatus};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    const WAIT: Duration = Duration::from_secs(5);

    fn shared_with(config: ServerConfig, store: Arc<MemoryStore>) -> Arc<Shared> {
        Arc::new(Shared {
            bus: Arc::new(MemoryBus::new(&config.topic)),
            config,
            store,
            sessions: Arc::new(SessionTable::new()),
        })
    }

    async fn seed_backlog(store: &MemoryStore, count: i64, size: usize) {
        let hash = credential::hash("pw").to_hex();
        let alice = store.create_identity("alice", &hash, 0).await.unwrap();
        let bob = store.create_identity("bob", &hash, 0).await.unwrap();
        let conversation = store.get_or_create_conversation(alice.id, bob.id).await.unwrap();
        let body = "x".repeat(size);
        for sent_at in 1..=count {
            store
                .append_message(conversation.id, alice.id, &body, sent_at)
                .await
                .unwrap();
        }
    }

    struct Peer {
        reader: RecordReader<ReadHalf<DuplexStream>>,
        writer: RecordWriter<WriteHalf<DuplexStream>>,
    }

    /// Start a worker on one end of an in-memory pipe and log in on the other.
    async fn connect(
        shared: &Arc<Shared>,
        login: &str,
        intent: Intent,
        shutdown: watch::Receiver<bool>,
    ) -> (Peer, JoinHandle<()>) {
        let (server, client) = tokio::io::duplex(1024);
        let remote = "127.0.0.1:40000".parse().unwrap();
        let worker = tokio::spawn(serve_connection(shared.clone(), server, remote, shutdown));

        let (read, write) = tokio::io::split(client);
        let mut peer = Peer {
            reader: RecordReader::new(read, 64 * 1024),
            writer: RecordWriter::new(write),
        };
        peer.writer
            .send(&HandshakeRequest::new(login, "pw", intent, 1))
            .await
            .unwrap();
        let response: HandshakeResponse = peer.reader.next_record().await.unwrap().unwrap();
        assert_eq!(response.status, HandshakeStatus::Accepted);
        (peer, worker)
    }

    async fn wait_released(shared: &Shared, login: &str) {
        tokio::time::timeout(WAIT, async {
            loop {
                let online = shared
                    .store
                    .get_identity_by_login(login)
                    .await
                    .unwrap()
                    .is_some_and(|i| i.online);
                if !online && !shared.sessions.is_online(login).await {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session was not released");
    }

    #[tokio::test]
    async fn writer_skips_messages_covered_by_replay() {
        let (server, client) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::channel(8);
        for id in [3, 4, 5] {
            let record = MessageRecord::new("alice", "bob", &format!("m{id}"), id);
            tx.send(Outbound::message(record, id)).await.unwrap();
        }
        let missed = MessageRecord::new("bob", "ghost", "?", 6);
        tx.send(Outbound::notice(MessageRecord::recipient_unknown(&missed)))
            .await
            .unwrap();
        drop(tx);

        write_loop(RecordWriter::new(server), rx, Some(4), "bob".into()).await;

        let mut reader = RecordReader::new(client, 1024);
        let first: MessageRecord = reader.next_record().await.unwrap().unwrap();
        assert_eq!(first.text, "m5");
        let second: MessageRecord = reader.next_record().await.unwrap().unwrap();
        assert_eq!(second.status, MessageStatus::RecipientUnknown);
        assert!(reader.next_record::<MessageRecord>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writer_without_replay_sends_everything() {
        let (server, client) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::channel(8);
        for id in [1, 2] {
            let record = MessageRecord::new("alice", "bob", "hi", id);
            tx.send(Outbound::message(record, id)).await.unwrap();
        }
        drop(tx);

        write_loop(RecordWriter::new(server), rx, None, "bob".into()).await;

        let mut reader = RecordReader::new(client, 1024);
        let mut count = 0;
        while reader.next_record::<MessageRecord>().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_stalled_replay() {
        let store = Arc::new(MemoryStore::new());
        seed_backlog(&store, 200, 512).await;
        let shared = shared_with(ServerConfig::default(), store);
        let (shutdown_tx, shutdown) = watch::channel(false);

        // bob never reads past the handshake response
        let (_bob, worker) = connect(&shared, "bob", Intent::Authenticate, shutdown).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!worker.is_finished());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(WAIT, worker)
            .await
            .expect("worker stuck in replay")
            .unwrap();
        wait_released(&shared, "bob").await;
    }

    #[tokio::test]
    async fn stalled_reader_times_out_during_replay() {
        let store = Arc::new(MemoryStore::new());
        seed_backlog(&store, 200, 512).await;
        let config = ServerConfig {
            write_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let shared = shared_with(config, store);
        let (_shutdown_tx, shutdown) = watch::channel(false);

        let (_bob, worker) = connect(&shared, "bob", Intent::Authenticate, shutdown).await;
        tokio::time::timeout(WAIT, worker)
            .await
            .expect("worker stuck in replay")
            .unwrap();
        wait_released(&shared, "bob").await;
    }

    #[tokio::test]
    async fn aborted_worker_releases_its_session() {
        let shared = shared_with(ServerConfig::default(), Arc::new(MemoryStore::new()));
        let (_shutdown_tx, shutdown) = watch::channel(false);

        let (_alice, worker) = connect(&shared, "alice", Intent::Register, shutdown).await;
        assert!(shared.sessions.is_online("alice").await);

        worker.abort();
        assert!(worker.await.unwrap_err().is_cancelled());
        wait_released(&shared, "alice").await;
    }
}
