//! Relay Pair
//!
//! One proxied session: the accepted client connection, the upstream
//! connection dialed on its behalf, and the two relay loops moving bytes
//! between them.
//!
//! Each loop reads into its own buffer, writes exactly the bytes read to the
//! other side and only reads again once that write has completed, so a slow
//! destination stalls its source instead of growing a queue. The first loop
//! to hit EOF or an error wins; the other loop is dropped mid-operation and
//! both connections are closed before the pair reports `Closed`.

use std::future::{poll_fn, Future};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::buffer::{BufferPool, PooledBuffer};
use super::session::{CloseReason, Direction, PairState, RelaySession};
use crate::shutdown::ShutdownListener;
use crate::Result;

/// Upper bound on flushing a FIN to a peer during teardown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Which endpoint of a pair a connection is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

/// A live transport endpoint owned by a relay pair
pub struct Connection<S> {
    side: Side,
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    closed: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(side: Side, stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            side,
            reader,
            writer,
            closed: false,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Shut down the write side so the peer sees EOF. Closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        match timeout(CLOSE_TIMEOUT, self.writer.shutdown()).await {
            Ok(Ok(())) => trace!(side = ?self.side, "Connection shut down"),
            Ok(Err(e)) => debug!(side = ?self.side, "Shutdown of closed connection: {}", e),
            Err(_) => debug!(side = ?self.side, "Shutdown timed out, dropping connection"),
        }
    }
}

/// Client connection plus everything needed to bring up and run its session
pub struct RelayPair<C> {
    session: Arc<RelaySession>,
    client: Connection<C>,
    buffers: Arc<BufferPool>,
}

impl<C> RelayPair<C>
where
    C: AsyncRead + AsyncWrite,
{
    /// Wrap a freshly accepted client; the pair starts out `Connecting`
    pub fn new(session: Arc<RelaySession>, client: C, buffers: Arc<BufferPool>) -> Self {
        session.set_state(PairState::Connecting);
        Self {
            session,
            client: Connection::new(Side::Client, client),
            buffers,
        }
    }

    pub fn session(&self) -> &Arc<RelaySession> {
        &self.session
    }

    /// Drive the pair to completion: wait for `dial`, relay both directions,
    /// then tear everything down. Returns once the pair is `Closed`.
    pub async fn run<U, F>(self, dial: F, shutdown: &mut ShutdownListener) -> CloseReason
    where
        U: AsyncRead + AsyncWrite,
        F: Future<Output = Result<(U, SocketAddr)>>,
    {
        let RelayPair {
            session,
            mut client,
            buffers,
        } = self;

        let mut up_buf = buffers.acquire();

        let (upstream, early) =
            match await_upstream(&session, &mut client, &mut up_buf, dial, shutdown).await {
                Ok(dialed) => dialed,
                Err(reason) => {
                    teardown(&session, reason, &mut client, None::<&mut Connection<U>>).await;
                    drop(up_buf);
                    return finish(&session);
                }
            };

        let mut upstream = Connection::new(Side::Upstream, upstream);

        let early = if shutdown.is_triggered() {
            Err(CloseReason::Shutdown)
        } else {
            confirm_client_open(&mut client, &mut up_buf, early).await
        };
        let early = match early {
            Ok(early) => early,
            Err(reason) => {
                teardown(&session, reason, &mut client, Some(&mut upstream)).await;
                drop(up_buf);
                return finish(&session);
            }
        };

        session.set_state(PairState::Active);
        let mut down_buf = buffers.acquire();

        let reason = {
            let up = pump(
                Direction::ClientToUpstream,
                &mut client.reader,
                &mut upstream.writer,
                &mut up_buf,
                early,
                &session,
            );
            let down = pump(
                Direction::UpstreamToClient,
                &mut upstream.reader,
                &mut client.writer,
                &mut down_buf,
                0,
                &session,
            );

            tokio::select! {
                reason = up => reason,
                reason = down => reason,
                _ = shutdown.recv() => CloseReason::Shutdown,
            }
        };

        teardown(&session, reason, &mut client, Some(&mut upstream)).await;
        drop(up_buf);
        drop(down_buf);
        drop(upstream);
        drop(client);
        finish(&session)
    }
}

/// Wait for the upstream dial while watching the client.
///
/// Early client data accumulates in `buf`, leaving its last byte free for the
/// check in `confirm_client_open`. Those bytes are returned alongside the
/// upstream so they go out first. EOF from the client cancels the dial.
async fn await_upstream<C, U, F>(
    session: &RelaySession,
    client: &mut Connection<C>,
    buf: &mut PooledBuffer,
    dial: F,
    shutdown: &mut ShutdownListener,
) -> std::result::Result<(U, usize), CloseReason>
where
    C: AsyncRead + AsyncWrite,
    F: Future<Output = Result<(U, SocketAddr)>>,
{
    tokio::pin!(dial);
    let limit = buf.len().saturating_sub(1);
    let mut early = 0usize;

    loop {
        tokio::select! {
            dialed = &mut dial => {
                return match dialed {
                    Ok((upstream, addr)) => {
                        info!(pair_id = %session.pair_id, upstream_addr = %addr, "Upstream connected");
                        Ok((upstream, early))
                    }
                    Err(e) => {
                        warn!(pair_id = %session.pair_id, "Upstream dial failed: {:#}", e);
                        Err(CloseReason::DialFailed { error: format!("{:#}", e) })
                    }
                };
            }
            read = client.reader.read(&mut buf[early..limit]), if early < limit => {
                match read {
                    Ok(0) => {
                        debug!(pair_id = %session.pair_id, "Client closed before upstream connected");
                        return Err(CloseReason::ClientClosedDuringDial);
                    }
                    Ok(n) => {
                        early += n;
                        trace!(pair_id = %session.pair_id, bytes = early, "Holding early client data");
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => {
                        return Err(CloseReason::ReadError {
                            direction: Direction::ClientToUpstream,
                            error: e.to_string(),
                        });
                    }
                }
            }
            _ = shutdown.recv() => return Err(CloseReason::Shutdown),
        }
    }
}

/// Drain whatever the client has ready without waiting, after the dial and
/// before `Active`.
///
/// A read that would block means the client is still open. EOF that arrived
/// while the dial was finishing fails the pair. Data read here joins the early
/// bytes, up to the end of `buf`.
async fn confirm_client_open<C>(
    client: &mut Connection<C>,
    buf: &mut PooledBuffer,
    early: usize,
) -> std::result::Result<usize, CloseReason>
where
    C: AsyncRead + AsyncWrite,
{
    let reader = &mut client.reader;
    let mut filled = early;

    let open = poll_fn(|cx| loop {
        if filled == buf.len() {
            return Poll::Ready(Ok(true));
        }
        let mut read_buf = ReadBuf::new(&mut buf[filled..]);
        match Pin::new(&mut *reader).poll_read(cx, &mut read_buf) {
            Poll::Pending => return Poll::Ready(Ok(true)),
            Poll::Ready(Ok(())) => match read_buf.filled().len() {
                0 => return Poll::Ready(Ok(false)),
                n => filled += n,
            },
            Poll::Ready(Err(e)) if e.kind() == ErrorKind::Interrupted => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
        }
    })
    .await;

    match open {
        Ok(true) => Ok(filled),
        Ok(false) => Err(CloseReason::ClientClosedDuringDial),
        Err(e) => Err(CloseReason::ReadError {
            direction: Direction::ClientToUpstream,
            error: e.to_string(),
        }),
    }
}

/// One relay loop. `pending` bytes already sitting in `buf` are written before the first read.
async fn pump<R, W>(
    direction: Direction,
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    mut pending: usize,
    session: &RelaySession,
) -> CloseReason
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        if pending > 0 {
            session.begin_write(direction, pending);
            if let Err(e) = write_chunk(writer, &buf[..pending]).await {
                return CloseReason::WriteError {
                    direction,
                    error: e.to_string(),
                };
            }
            session.end_write(direction, pending);
            trace!(%direction, bytes = pending, "Relayed chunk");
        }

        // `buf` is never empty, so a zero-length read can only mean EOF.
        pending = match reader.read(buf).await {
            Ok(0) => {
                return match direction {
                    Direction::ClientToUpstream => CloseReason::ClientEof,
                    Direction::UpstreamToClient => CloseReason::UpstreamEof,
                };
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => 0,
            Err(e) => {
                return CloseReason::ReadError {
                    direction,
                    error: e.to_string(),
                };
            }
        };
    }
}

async fn write_chunk<W>(writer: &mut W, chunk: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(chunk).await?;
    writer.flush().await
}

async fn teardown<C, U>(
    session: &RelaySession,
    reason: CloseReason,
    client: &mut Connection<C>,
    upstream: Option<&mut Connection<U>>,
) where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    if session.terminate(reason.clone()) {
        debug!(pair_id = %session.pair_id, reason = %reason, "Tearing down relay pair");
    }
    session.set_state(PairState::Closing);

    client.close().await;
    if let Some(upstream) = upstream {
        upstream.close().await;
    }
}

fn finish(session: &RelaySession) -> CloseReason {
    session.set_state(PairState::Closed);
    session
        .close_reason()
        .unwrap_or(CloseReason::Shutdown)
}
