//! A single accepted connection: its stream, its registry entry and the one
//! deadline that bounds whatever I/O it is currently doing.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{self, Instant};

use super::error::ServeError;
use super::gate::ShutdownGate;
use super::registry::{ConnectionHandle, Registration};
use super::session::Stage;

/// Deadline computed from a stage timeout. A zero timeout means none.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    (!timeout.is_zero()).then(|| Instant::now() + timeout)
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Drives `io` until it completes, the deadline passes or the connection is
/// closed, whichever happens first.
///
/// An expired deadline closes the connection (through the gate) and yields
/// [`ServeError::Timeout`]. A close from elsewhere yields
/// [`ServeError::Aborted`].
pub(crate) async fn guarded<T, F>(
    handle: &ConnectionHandle,
    gate: &Arc<ShutdownGate>,
    deadline: Option<Instant>,
    stage: Stage,
    io: F,
) -> Result<T, ServeError>
where
    F: Future<Output = io::Result<T>>,
{
    if handle.is_closed() {
        return Err(ServeError::Aborted);
    }
    tokio::select! {
        biased;
        () = handle.closed() => Err(ServeError::Aborted),
        () = expire(deadline) => {
            let Some(_token) = gate.enter() else {
                return Err(ServeError::Aborted);
            };
            handle.close();
            Err(ServeError::Timeout { stage })
        }
        result = io => result.map_err(|err| ServeError::transport(stage, err)),
    }
}

/// Owns the stream of one connection for as long as the HTTP pipeline runs
/// on it.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    registration: Registration,
    gate: Arc<ShutdownGate>,
    deadline: Option<Instant>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, registration: Registration, gate: Arc<ShutdownGate>) -> Self {
        Self {
            stream,
            registration,
            gate,
            deadline: None,
        }
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        self.registration.handle()
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.handle().remote()
    }

    pub fn is_closed(&self) -> bool {
        self.handle().is_closed()
    }

    /// Closes the connection; pending I/O fails with `Aborted`.
    pub fn close(&self) {
        self.handle().close();
    }

    /// Arms the deadline, replacing any previous one. A zero duration
    /// disarms it.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = deadline_after(timeout);
    }

    pub fn cancel_timeout(&mut self) {
        self.deadline = None;
    }

    /// Reads at most `limit` more bytes into `buf`. Returns `0` on EOF or
    /// when `limit` is zero.
    pub async fn read_into(
        &mut self,
        buf: &mut BytesMut,
        limit: usize,
        stage: Stage,
    ) -> Result<usize, ServeError> {
        if limit == 0 {
            return Ok(0);
        }
        let Self {
            stream,
            registration,
            gate,
            deadline,
        } = self;
        let mut limited = buf.limit(limit);
        guarded(
            registration.handle(),
            gate,
            *deadline,
            stage,
            stream.read_buf(&mut limited),
        )
        .await
    }

    /// Writes and flushes all of `bytes`.
    pub async fn write_all(&mut self, bytes: &[u8], stage: Stage) -> Result<(), ServeError> {
        let Self {
            stream,
            registration,
            gate,
            deadline,
        } = self;
        guarded(registration.handle(), gate, *deadline, stage, async {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await
    }

    /// Shuts the stream down gracefully within `timeout`, unless the
    /// connection was already closed, in which case it is simply dropped.
    pub async fn finish(mut self, timeout: Duration) {
        if !self.is_closed() {
            self.set_timeout(timeout);
            let _ = self.shutdown(Stage::Closing).await;
        }
        self.close();
    }

    /// Closes the write half. Reading stays possible until the peer closes
    /// its side.
    pub async fn shutdown(&mut self, stage: Stage) -> Result<(), ServeError> {
        let Self {
            stream,
            registration,
            gate,
            deadline,
        } = self;
        guarded(registration.handle(), gate, *deadline, stage, stream.shutdown()).await
    }

    /// Gives up the stream. The connection leaves the registry and the
    /// pipeline no longer tracks it.
    pub fn into_upgraded(self) -> S {
        let Self {
            stream,
            registration,
            ..
        } = self;
        drop(registration);
        stream
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;
    use crate::server::registry::ConnectionRegistry;

    fn connection<S>(stream: S) -> (Connection<S>, Arc<ConnectionRegistry>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let registry = ConnectionRegistry::new();
        let registration = registry.register(None);
        (Connection::new(stream, registration, ShutdownGate::new()), registry)
    }

    #[tokio::test]
    async fn read_respects_the_limit() {
        let (client, server) = duplex(64);
        let (mut conn, _registry) = connection(server);
        let mut client = client;
        client.write_all(b"abcdefgh").await.unwrap();

        let mut buf = BytesMut::new();
        let n = conn.read_into(&mut buf, 3, Stage::AwaitingHeader).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..], b"abc");
        assert_eq!(conn.read_into(&mut buf, 0, Stage::AwaitingHeader).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_deadline_closes_the_connection() {
        let (_client, server) = duplex(64);
        let (mut conn, _registry) = connection(server);
        conn.set_timeout(Duration::from_millis(30));

        let mut buf = BytesMut::new();
        let err = conn
            .read_into(&mut buf, 16, Stage::AwaitingHeader)
            .await
            .unwrap_err();
        assert!(matches!(err, ServeError::Timeout { stage: Stage::AwaitingHeader }));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn zero_timeout_means_no_deadline() {
        let (mut client, server) = duplex(64);
        let (mut conn, _registry) = connection(server);
        conn.set_timeout(Duration::ZERO);

        let writer = tokio::spawn(async move {
            time::sleep(Duration::from_millis(30)).await;
            client.write_all(b"x").await.unwrap();
            client
        });
        let mut buf = BytesMut::new();
        assert_eq!(conn.read_into(&mut buf, 16, Stage::AwaitingHeader).await.unwrap(), 1);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn close_aborts_pending_io() {
        let (_client, server) = duplex(64);
        let (mut conn, registry) = connection(server);
        let handle = Arc::clone(conn.handle());

        tokio::spawn(async move {
            time::sleep(Duration::from_millis(20)).await;
            registry.close_all();
        });
        let mut buf = BytesMut::new();
        let err = conn
            .read_into(&mut buf, 16, Stage::AwaitingHeader)
            .await
            .unwrap_err();
        assert!(err.is_aborted());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn shutdown_keeps_the_read_half_open() {
        let (mut client, server) = duplex(64);
        let (mut conn, _registry) = connection(server);
        conn.shutdown(Stage::Closing).await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());

        client.write_all(b"late").await.unwrap();
        let mut buf = BytesMut::new();
        assert_eq!(conn.read_into(&mut buf, 16, Stage::Closing).await.unwrap(), 4);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn upgrade_leaves_the_registry() {
        let (_client, server) = duplex(64);
        let (conn, registry) = connection(server);
        assert_eq!(registry.len(), 1);
        let _stream = conn.into_upgraded();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn finish_shuts_the_stream_down() {
        let (mut client, server) = duplex(64);
        let (mut conn, registry) = connection(server);
        conn.write_all(b"bye", Stage::Sending).await.unwrap();
        conn.finish(Duration::from_secs(1)).await;

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
        assert!(registry.is_empty());
    }
}
