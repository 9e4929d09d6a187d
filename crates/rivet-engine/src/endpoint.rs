//! Stream endpoints: ordered, full-duplex byte conduits.
//!
//! An [`Endpoint`] owns one connected socket and enforces the engine's
//! strictest contract: at most one outstanding read and one outstanding write
//! at any time. Overlapping operations are programmer errors and abort the
//! process. Completion is delivered through the engine's ready queue; the
//! buffer handed to an operation travels with it and comes back through the
//! callback. Every read allocation is charged to the endpoint's allocator so
//! the memory quota can observe the connection's footprint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{watch, Mutex};

use crate::addr::ResolvedAddress;
use crate::config::TcpOptions;
use crate::engine::EngineInner;
use crate::error::{invalid_usage, EngineError, Result};
use crate::quota::MemoryAllocator;
use crate::slice::SliceBuffer;

type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

struct EndpointInner {
    engine: Arc<EngineInner>,
    // The halves become None once the socket has been torn down; together
    // they own the descriptor, so the close happens exactly once.
    read_half: Mutex<Option<ReadHalf>>,
    write_half: Mutex<Option<WriteHalf>>,
    read_busy: AtomicBool,
    write_busy: AtomicBool,
    failed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    allocator: MemoryAllocator,
    options: TcpOptions,
}

impl EndpointInner {
    /// Ends a pending operation that lost the race to shutdown or failure.
    fn interrupted_status(&self) -> EngineError {
        if self.failed.load(Ordering::Acquire) {
            EngineError::internal("endpoint failed")
        } else {
            EngineError::cancelled("endpoint shut down")
        }
    }

    /// Tears the socket down after a fatal I/O error.
    ///
    /// A half that is still pinned by a concurrent operation is skipped; that
    /// operation has been woken by the shutdown signal and runs this cleanup
    /// itself when it unwinds.
    fn close_after_failure(&self) {
        if let Ok(mut guard) = self.read_half.try_lock() {
            guard.take();
        }
        if let Ok(mut guard) = self.write_half.try_lock() {
            guard.take();
        }
    }

    fn record_failure(&self, err: &EngineError) {
        if !err.is_cancelled() {
            self.failed.store(true, Ordering::Release);
            // Wake the other pending operation, if any.
            let _ = self.shutdown_tx.send(true);
            self.close_after_failure();
            tracing::debug!(error = %err, "endpoint I/O failed");
        }
    }
}

/// One side of an established byte-stream connection.
///
/// Dropping the endpoint cancels any pending read or write (their callbacks
/// run exactly once, with a cancelled status) and closes the socket. After
/// any I/O failure the endpoint is dead: the socket is torn down and
/// subsequent operations fail immediately without touching it.
pub struct Endpoint {
    inner: Arc<EndpointInner>,
    peer: ResolvedAddress,
    local: ResolvedAddress,
}

impl Endpoint {
    pub(crate) fn from_tcp(
        stream: TcpStream,
        engine: Arc<EngineInner>,
        allocator: MemoryAllocator,
        options: TcpOptions,
    ) -> Result<Endpoint> {
        if options.nodelay {
            stream
                .set_nodelay(true)
                .map_err(|e| EngineError::from_io("set_nodelay", e))?;
        }
        let peer = stream
            .peer_addr()
            .map(ResolvedAddress::from)
            .map_err(|e| EngineError::from_io("peer_addr", e))?;
        let local = stream
            .local_addr()
            .map(ResolvedAddress::from)
            .map_err(|e| EngineError::from_io("local_addr", e))?;
        let (read, write) = stream.into_split();
        Ok(Self::build(
            Box::new(read),
            Box::new(write),
            peer,
            local,
            engine,
            allocator,
            options,
        ))
    }

    pub(crate) fn from_unix(
        stream: UnixStream,
        peer: ResolvedAddress,
        engine: Arc<EngineInner>,
        allocator: MemoryAllocator,
        options: TcpOptions,
    ) -> Result<Endpoint> {
        let local = stream
            .local_addr()
            .ok()
            .and_then(|a| {
                a.as_pathname()
                    .and_then(|p| p.to_str())
                    .and_then(|p| ResolvedAddress::from_unix_path(p).ok())
            })
            .unwrap_or_else(|| ResolvedAddress::from_unix_path("").unwrap());
        let (read, write) = stream.into_split();
        Ok(Self::build(
            Box::new(read),
            Box::new(write),
            peer,
            local,
            engine,
            allocator,
            options,
        ))
    }

    fn build(
        read_half: ReadHalf,
        write_half: WriteHalf,
        peer: ResolvedAddress,
        local: ResolvedAddress,
        engine: Arc<EngineInner>,
        allocator: MemoryAllocator,
        options: TcpOptions,
    ) -> Endpoint {
        engine.live_endpoints.fetch_add(1, Ordering::AcqRel);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tracing::debug!(peer = %peer, local = %local, "endpoint established");
        Endpoint {
            inner: Arc::new(EndpointInner {
                engine,
                read_half: Mutex::new(Some(read_half)),
                write_half: Mutex::new(Some(write_half)),
                read_busy: AtomicBool::new(false),
                write_busy: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                shutdown_tx,
                shutdown_rx,
                allocator,
                options,
            }),
            peer,
            local,
        }
    }

    /// Starts a read; received bytes are appended to `buffer` as
    /// quota-backed slices and handed back through `on_read`.
    ///
    /// At most one read may be outstanding; a second concurrent read aborts
    /// the process. On failure the buffer contents are best-effort.
    pub fn read(
        &self,
        on_read: impl FnOnce(Result<()>, SliceBuffer) + Send + 'static,
        buffer: SliceBuffer,
    ) {
        if self.inner.read_busy.swap(true, Ordering::AcqRel) {
            invalid_usage("overlapping read on endpoint");
        }
        let inner = Arc::clone(&self.inner);
        if inner.failed.load(Ordering::Acquire) {
            inner.read_busy.store(false, Ordering::Release);
            inner.engine.enqueue(Box::new(move || {
                on_read(Err(EngineError::internal("endpoint failed")), buffer)
            }));
            return;
        }
        self.inner.engine.rt.spawn(async move {
            let mut buffer = buffer;
            let mut shutdown = inner.shutdown_rx.clone();
            let result = tokio::select! {
                res = Self::read_once(&inner, &mut buffer) => res,
                _ = shutdown.wait_for(|v| *v) => Err(inner.interrupted_status()),
            };
            if let Err(err) = &result {
                inner.record_failure(err);
            }
            inner.read_busy.store(false, Ordering::Release);
            inner
                .engine
                .enqueue(Box::new(move || on_read(result, buffer)));
        });
    }

    async fn read_once(inner: &Arc<EndpointInner>, buffer: &mut SliceBuffer) -> Result<()> {
        let mut chunk = inner.allocator.allocate(inner.options.read_chunk_size)?;
        let mut guard = inner.read_half.lock().await;
        let half = guard
            .as_mut()
            .ok_or_else(|| EngineError::internal("endpoint failed"))?;
        let n = half
            .read_buf(chunk.bytes_mut())
            .await
            .map_err(|e| EngineError::from_io("endpoint read", e))?;
        drop(guard);
        if n == 0 {
            return Err(EngineError::internal("socket closed by peer"));
        }
        buffer.append(chunk.freeze());
        Ok(())
    }

    /// Starts a write of every byte in `data`.
    ///
    /// Slices drain front-to-back as they reach the kernel; on success the
    /// buffer handed back through `on_writable` is empty. At most one write
    /// may be outstanding; a second concurrent write aborts the process.
    pub fn write(
        &self,
        on_writable: impl FnOnce(Result<()>, SliceBuffer) + Send + 'static,
        data: SliceBuffer,
    ) {
        if self.inner.write_busy.swap(true, Ordering::AcqRel) {
            invalid_usage("overlapping write on endpoint");
        }
        let inner = Arc::clone(&self.inner);
        if inner.failed.load(Ordering::Acquire) {
            inner.write_busy.store(false, Ordering::Release);
            inner.engine.enqueue(Box::new(move || {
                on_writable(Err(EngineError::internal("endpoint failed")), data)
            }));
            return;
        }
        self.inner.engine.rt.spawn(async move {
            let mut data = data;
            let mut shutdown = inner.shutdown_rx.clone();
            let result = tokio::select! {
                res = Self::write_all(&inner, &mut data) => res,
                _ = shutdown.wait_for(|v| *v) => Err(inner.interrupted_status()),
            };
            if let Err(err) = &result {
                inner.record_failure(err);
            }
            inner.write_busy.store(false, Ordering::Release);
            inner
                .engine
                .enqueue(Box::new(move || on_writable(result, data)));
        });
    }

    async fn write_all(inner: &Arc<EndpointInner>, data: &mut SliceBuffer) -> Result<()> {
        let mut guard = inner.write_half.lock().await;
        let half = guard
            .as_mut()
            .ok_or_else(|| EngineError::internal("endpoint failed"))?;
        let vectored =
            inner.options.zerocopy_enabled && data.len() >= inner.options.zerocopy_threshold;
        while !data.is_empty() {
            if vectored {
                let n = {
                    let iovs = data.as_io_slices();
                    half.write_vectored(&iovs)
                        .await
                        .map_err(|e| EngineError::from_io("endpoint write", e))?
                };
                if n == 0 {
                    return Err(EngineError::internal("kernel accepted zero bytes"));
                }
                data.consume_prefix(n);
            } else {
                let front = data.iter().next().expect("non-empty buffer").clone();
                half.write_all(&front)
                    .await
                    .map_err(|e| EngineError::from_io("endpoint write", e))?;
                data.consume_prefix(front.len());
            }
        }
        half.flush()
            .await
            .map_err(|e| EngineError::from_io("endpoint flush", e))
    }

    /// Peer address, valid for the endpoint's lifetime.
    pub fn peer_address(&self) -> &ResolvedAddress {
        &self.peer
    }

    /// Local address, valid for the endpoint's lifetime.
    pub fn local_address(&self) -> &ResolvedAddress {
        &self.local
    }

    /// The allocator charged for this endpoint's buffers.
    pub fn allocator(&self) -> &MemoryAllocator {
        &self.inner.allocator
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // Wakes any pending operation; each delivers its status exactly once.
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.engine.live_endpoints.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(peer = %self.peer, "endpoint destroyed");
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("peer", &self.peer)
            .field("local", &self.local)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::engine::Engine;
    use crate::quota::MemoryQuota;
    use std::sync::mpsc;
    use std::time::Duration;

    fn tcp_pair(engine: &Engine, allocator: MemoryAllocator) -> (Endpoint, Endpoint) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();
        let rt = engine.inner().rt.clone();
        let _ctx = rt.enter();
        let client = TcpStream::from_std(client).unwrap();
        let server = TcpStream::from_std(server).unwrap();
        let options = TcpOptions::default();
        let a = Endpoint::from_tcp(
            client,
            Arc::clone(engine.inner()),
            allocator.clone(),
            options.clone(),
        )
        .unwrap();
        let b = Endpoint::from_tcp(server, Arc::clone(engine.inner()), allocator, options).unwrap();
        (a, b)
    }

    fn read_exactly(endpoint: &Endpoint, want: usize) -> Vec<u8> {
        let mut collected = SliceBuffer::new();
        while collected.len() < want {
            let (tx, rx) = mpsc::channel();
            endpoint.read(
                move |res, buf| {
                    tx.send((res, buf)).unwrap();
                },
                SliceBuffer::new(),
            );
            let (res, mut buf) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            res.unwrap();
            collected.extend(&mut buf);
        }
        collected.to_vec()
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let engine = Engine::new(&EndpointConfig::new()).unwrap();
        let quota = MemoryQuota::unlimited("test");
        let allocator = MemoryAllocator::new(quota, "pair");
        let (a, b) = tcp_pair(&engine, allocator);

        let mut payload = SliceBuffer::new();
        payload.append_copy(b"hello over the wire");
        let (tx, rx) = mpsc::channel();
        a.write(
            move |res, rest| {
                tx.send((res, rest)).unwrap();
            },
            payload,
        );
        let (res, rest) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        res.unwrap();
        assert!(rest.is_empty());

        assert_eq!(read_exactly(&b, 19), b"hello over the wire");
    }

    #[test]
    fn test_multi_slice_write_drains_in_order() {
        let engine = Engine::new(&EndpointConfig::new()).unwrap();
        let quota = MemoryQuota::unlimited("test");
        let allocator = MemoryAllocator::new(quota, "pair");
        let (a, b) = tcp_pair(&engine, allocator);

        let mut payload = SliceBuffer::new();
        payload.append_copy(b"one-");
        payload.append_copy(b"two-");
        payload.append_copy(b"three");
        let (tx, rx) = mpsc::channel();
        a.write(move |res, rest| tx.send((res, rest)).unwrap(), payload);
        let (res, rest) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        res.unwrap();
        assert!(rest.is_empty());
        assert_eq!(read_exactly(&b, 13), b"one-two-three");
    }

    #[test]
    fn test_drop_cancels_pending_read() {
        let engine = Engine::new(&EndpointConfig::new()).unwrap();
        let quota = MemoryQuota::unlimited("test");
        let allocator = MemoryAllocator::new(quota, "pair");
        let (a, _b) = tcp_pair(&engine, allocator);

        let (tx, rx) = mpsc::channel();
        a.read(
            move |res, _buf| {
                tx.send(res).unwrap();
            },
            SliceBuffer::new(),
        );
        drop(a);
        let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(res.unwrap_err().is_cancelled());
        // The callback ran exactly once.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_peer_close_fails_read_and_latches() {
        let engine = Engine::new(&EndpointConfig::new()).unwrap();
        let quota = MemoryQuota::unlimited("test");
        let allocator = MemoryAllocator::new(quota, "pair");
        let (a, b) = tcp_pair(&engine, allocator);
        drop(b);

        let (tx, rx) = mpsc::channel();
        a.read(move |res, _| tx.send(res).unwrap(), SliceBuffer::new());
        let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(res.is_err());
        assert!(!res.unwrap_err().is_cancelled());

        // Latched: the next read fails without touching the socket.
        let (tx, rx) = mpsc::channel();
        a.read(move |res, _| tx.send(res).unwrap(), SliceBuffer::new());
        let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(res.unwrap_err(), EngineError::Internal(_)));

        // Writes fail the same way once the endpoint is dead.
        let (tx, rx) = mpsc::channel();
        let mut data = SliceBuffer::new();
        data.append_copy(b"late");
        a.write(move |res, _| tx.send(res).unwrap(), data);
        let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(res.unwrap_err(), EngineError::Internal(_)));
    }

    #[test]
    fn test_quota_refusal_surfaces_resource_exhausted() {
        let engine = Engine::new(&EndpointConfig::new()).unwrap();
        // Too small for a single read chunk.
        let quota = MemoryQuota::new("tiny", 64);
        let allocator = MemoryAllocator::new(quota, "pair");
        let (a, b) = tcp_pair(&engine, allocator);

        let (tx, rx) = mpsc::channel();
        a.read(move |res, _| tx.send(res).unwrap(), SliceBuffer::new());
        let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(res.unwrap_err().is_resource_exhausted());
        drop(b);
    }

    #[test]
    fn test_addresses_are_stable() {
        let engine = Engine::new(&EndpointConfig::new()).unwrap();
        let quota = MemoryQuota::unlimited("test");
        let allocator = MemoryAllocator::new(quota, "pair");
        let (a, b) = tcp_pair(&engine, allocator);
        assert_eq!(
            a.peer_address().to_socket_addr().unwrap(),
            b.local_address().to_socket_addr().unwrap()
        );
        assert_eq!(
            a.local_address().to_socket_addr().unwrap(),
            b.peer_address().to_socket_addr().unwrap()
        );
    }
}
