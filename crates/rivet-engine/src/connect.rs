//! Outbound connection establishment with deadlines and cancellation.
//!
//! A connect attempt either fails synchronously (socket setup), in which case
//! the callback never runs, or produces exactly one asynchronous callback
//! invocation with the new endpoint or a failure status. An outstanding
//! attempt can be aborted through its handle; completion and cancellation
//! race by claiming the pending-connect entry, and the claimant owns the
//! callback's fate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::{TcpSocket, UnixStream};
use tokio::task::AbortHandle;

use crate::addr::ResolvedAddress;
use crate::config::{EndpointConfig, TcpOptions};
use crate::endpoint::Endpoint;
use crate::engine::{Engine, EngineInner};
use crate::error::{EngineError, Result};
use crate::quota::MemoryAllocator;
use crate::task::ConnectionHandle;

pub(crate) struct PendingConnect {
    abort: Option<AbortHandle>,
}

enum Target {
    Tcp(SocketAddr, TcpSocket),
    Unix(String),
}

impl Engine {
    /// Initiates an outbound connection to `addr`.
    ///
    /// Synchronous setup failure returns the error immediately and
    /// `on_connect` is never invoked. Otherwise `on_connect` runs exactly
    /// once with either a new [`Endpoint`] or a failure status; expiry of
    /// `deadline` surfaces as `DeadlineExceeded`, though the kernel may
    /// report a reset first — both are valid outcomes.
    pub fn connect(
        &self,
        on_connect: impl FnOnce(Result<Endpoint>) + Send + 'static,
        addr: &ResolvedAddress,
        config: &EndpointConfig,
        allocator: MemoryAllocator,
        deadline: Instant,
    ) -> Result<ConnectionHandle> {
        let options = TcpOptions::from_config(config);
        let target = if let Some(path) = addr.unix_path() {
            Target::Unix(path.to_string())
        } else {
            let saddr = addr.to_socket_addr().ok_or_else(|| {
                EngineError::internal(format!("unsupported address family: {addr}"))
            })?;
            let socket = if saddr.is_ipv4() {
                TcpSocket::new_v4()
            } else {
                TcpSocket::new_v6()
            }
            .map_err(|e| EngineError::from_io("socket", e))?;
            Target::Tcp(saddr, socket)
        };

        let inner = Arc::clone(self.inner());
        let (index, generation) = inner.connects.insert(PendingConnect { abort: None });
        let handle = ConnectionHandle::from_parts(index, generation);
        let peer = *addr;
        let task_inner = Arc::clone(&inner);
        let task = inner.rt.spawn(async move {
            let result = establish(target, peer, &task_inner, allocator, options, deadline).await;
            // Claiming the entry decides the race against cancel_connect: a
            // lost claim means the callback must not run.
            if task_inner.connects.take(index, generation).is_some() {
                match &result {
                    Ok(_) => tracing::debug!(peer = %peer, "connect completed"),
                    Err(err) => tracing::debug!(peer = %peer, error = %err, "connect failed"),
                }
                task_inner.enqueue(Box::new(move || on_connect(result)));
            }
        });
        inner.connects.with_mut(index, generation, |entry| {
            entry.abort = Some(task.abort_handle())
        });
        Ok(handle)
    }

    /// Attempts to abort an outstanding connection attempt.
    ///
    /// On `true` the callback will never run. On `false` the attempt already
    /// completed (or is completing) and the callback runs with its outcome.
    pub fn cancel_connect(&self, handle: ConnectionHandle) -> bool {
        let (index, generation) = handle.parts();
        match self.inner().connects.take(index, generation) {
            Some(entry) => {
                if let Some(abort) = entry.abort {
                    abort.abort();
                }
                tracing::debug!("connect attempt cancelled");
                true
            }
            None => false,
        }
    }
}

async fn establish(
    target: Target,
    peer: ResolvedAddress,
    engine: &Arc<EngineInner>,
    allocator: MemoryAllocator,
    options: TcpOptions,
    deadline: Instant,
) -> Result<Endpoint> {
    let budget = deadline.saturating_duration_since(Instant::now());
    match target {
        Target::Tcp(saddr, socket) => {
            match tokio::time::timeout(budget, socket.connect(saddr)).await {
                Err(_) => Err(EngineError::deadline_exceeded(format!(
                    "connect to {peer} timed out"
                ))),
                Ok(Err(err)) => Err(EngineError::from_io("connect", err)),
                Ok(Ok(stream)) => {
                    Endpoint::from_tcp(stream, Arc::clone(engine), allocator, options)
                }
            }
        }
        Target::Unix(path) => match tokio::time::timeout(budget, UnixStream::connect(&path)).await
        {
            Err(_) => Err(EngineError::deadline_exceeded(format!(
                "connect to {peer} timed out"
            ))),
            Ok(Err(err)) => Err(EngineError::from_io("connect", err)),
            Ok(Ok(stream)) => {
                Endpoint::from_unix(stream, peer, Arc::clone(engine), allocator, options)
            }
        },
    }
}
