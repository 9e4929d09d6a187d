//! Passive listeners: bind, accept, and hand endpoints upward.
//!
//! A [`Listener`] accumulates bound addresses before `start`, then runs one
//! accept loop per socket. Each accepted connection gets its own allocator
//! from the listener's factory and is delivered to the accept callback at
//! most once. Dropping the listener stops the loops and fires the shutdown
//! callback exactly once.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpSocket, UnixListener};
use tokio::task::AbortHandle;

use crate::addr::ResolvedAddress;
use crate::config::{EndpointConfig, TcpOptions};
use crate::endpoint::Endpoint;
use crate::engine::{Engine, EngineInner};
use crate::error::{EngineError, Result};
use crate::quota::{MemoryAllocator, MemoryAllocatorFactory};

type AcceptFn = dyn Fn(Endpoint, MemoryAllocator) + Send + Sync;
type ShutdownFn = Box<dyn FnOnce(Result<()>) + Send>;

enum BoundSocket {
    Tcp(TcpSocket),
    Unix(String),
}

struct ListenerState {
    started: bool,
    pending: Vec<BoundSocket>,
    loops: Vec<AbortHandle>,
}

struct ListenerInner {
    engine: Arc<EngineInner>,
    state: Mutex<ListenerState>,
    on_accept: Arc<AcceptFn>,
    on_shutdown: Mutex<Option<ShutdownFn>>,
    factory: MemoryAllocatorFactory,
    options: TcpOptions,
}

/// A passive acceptor bound to one or more addresses.
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Engine {
    /// Creates a listener.
    ///
    /// `on_accept` runs once per established connection with the new
    /// [`Endpoint`] and an allocator reserved for that endpoint's lifetime.
    /// `on_shutdown` runs exactly once, when the listener is destroyed. A
    /// synchronous error here means `on_shutdown` will never be called.
    pub fn create_listener(
        &self,
        on_accept: impl Fn(Endpoint, MemoryAllocator) + Send + Sync + 'static,
        on_shutdown: impl FnOnce(Result<()>) + Send + 'static,
        config: &EndpointConfig,
        factory: MemoryAllocatorFactory,
    ) -> Result<Listener> {
        let options = TcpOptions::from_config(config);
        self.inner().live_listeners.fetch_add(1, Ordering::AcqRel);
        Ok(Listener {
            inner: Arc::new(ListenerInner {
                engine: Arc::clone(self.inner()),
                state: Mutex::new(ListenerState {
                    started: false,
                    pending: Vec::new(),
                    loops: Vec::new(),
                }),
                on_accept: Arc::new(on_accept),
                on_shutdown: Mutex::new(Some(Box::new(on_shutdown))),
                factory,
                options,
            }),
        })
    }
}

impl Listener {
    /// Binds an address; callable repeatedly before [`start`](Self::start).
    ///
    /// Port 0 requests an ephemeral port; the concrete port is returned.
    /// Unix-domain addresses return port 0.
    pub fn bind(&self, addr: &ResolvedAddress) -> Result<u16> {
        let mut state = self.inner.state.lock().unwrap();
        if state.started {
            return Err(EngineError::internal("bind called after start"));
        }
        if let Some(path) = addr.unix_path() {
            // A stale socket file from a previous run would fail the bind.
            let _ = std::fs::remove_file(path);
            state.pending.push(BoundSocket::Unix(path.to_string()));
            return Ok(0);
        }
        let saddr = addr
            .to_socket_addr()
            .ok_or_else(|| EngineError::internal(format!("unsupported address family: {addr}")))?;
        let socket = if saddr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| EngineError::from_io("socket", e))?;
        socket
            .set_reuseaddr(true)
            .map_err(|e| EngineError::from_io("set_reuseaddr", e))?;
        socket
            .bind(saddr)
            .map_err(|e| EngineError::from_io("bind", e))?;
        let port = socket
            .local_addr()
            .map_err(|e| EngineError::from_io("local_addr", e))?
            .port();
        tracing::debug!(addr = %addr, port, "listener bound");
        state.pending.push(BoundSocket::Tcp(socket));
        Ok(port)
    }

    /// Starts accepting on every bound address. Bind fails after this.
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.started {
            return Err(EngineError::internal("listener already started"));
        }
        if state.pending.is_empty() {
            return Err(EngineError::internal("no addresses bound"));
        }
        state.started = true;
        let _ctx = self.inner.engine.rt.enter();
        for socket in state.pending.drain(..).collect::<Vec<_>>() {
            match socket {
                BoundSocket::Tcp(socket) => {
                    let listener = socket
                        .listen(self.inner.options.backlog)
                        .map_err(|e| EngineError::from_io("listen", e))?;
                    let inner = Arc::clone(&self.inner);
                    let task = self
                        .inner
                        .engine
                        .rt
                        .spawn(async move { accept_tcp(inner, listener).await });
                    state.loops.push(task.abort_handle());
                }
                BoundSocket::Unix(path) => {
                    let listener =
                        UnixListener::bind(&path).map_err(|e| EngineError::from_io("bind", e))?;
                    let inner = Arc::clone(&self.inner);
                    let task = self
                        .inner
                        .engine
                        .rt
                        .spawn(async move { accept_unix(inner, listener).await });
                    state.loops.push(task.abort_handle());
                }
            }
        }
        tracing::debug!(loops = state.loops.len(), "listener started");
        Ok(())
    }
}

async fn accept_tcp(inner: Arc<ListenerInner>, listener: tokio::net::TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let peer = ResolvedAddress::from(peer);
                deliver(&inner, peer, |allocator| {
                    Endpoint::from_tcp(
                        stream,
                        Arc::clone(&inner.engine),
                        allocator,
                        inner.options.clone(),
                    )
                });
            }
            Err(err) => {
                // Transient failures (e.g. out of descriptors) back off and
                // keep the listener alive.
                tracing::warn!(error = %err, "accept failed, retrying");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept_unix(inner: Arc<ListenerInner>, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let peer = peer
                    .as_pathname()
                    .and_then(|p| p.to_str())
                    .and_then(|p| ResolvedAddress::from_unix_path(p).ok())
                    .unwrap_or_else(|| ResolvedAddress::from_unix_path("").unwrap());
                deliver(&inner, peer, |allocator| {
                    Endpoint::from_unix(
                        stream,
                        peer,
                        Arc::clone(&inner.engine),
                        allocator,
                        inner.options.clone(),
                    )
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed, retrying");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn deliver(
    inner: &Arc<ListenerInner>,
    peer: ResolvedAddress,
    make: impl FnOnce(MemoryAllocator) -> Result<Endpoint>,
) {
    let allocator = inner.factory.create_allocator(peer.to_string());
    match make(allocator.clone()) {
        Ok(endpoint) => {
            tracing::debug!(peer = %peer, "connection accepted");
            (inner.on_accept)(endpoint, allocator);
        }
        Err(err) => {
            tracing::warn!(peer = %peer, error = %err, "failed to wrap accepted connection");
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            for handle in state.loops.drain(..) {
                handle.abort();
            }
        }
        if let Some(on_shutdown) = self.inner.on_shutdown.lock().unwrap().take() {
            self.inner
                .engine
                .enqueue(Box::new(move || on_shutdown(Ok(()))));
        }
        self.inner.engine.live_listeners.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!("listener shut down");
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Listener")
            .field("started", &state.started)
            .field("loops", &state.loops.len())
            .finish()
    }
}
