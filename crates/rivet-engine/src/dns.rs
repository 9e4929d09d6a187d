//! Asynchronous DNS resolution with deadlines and cancellation.
//!
//! Hostname lookups go through the runtime's native resolver, with a numeric
//! fast path that skips the resolver entirely (results are still delivered
//! asynchronously). SRV and TXT lookups carry the full handle, deadline, and
//! cancellation plumbing but complete with `Unimplemented` on this backend.
//! Cancellation follows the engine-wide contract: `true` means the callback
//! never runs.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::AbortHandle;

use crate::addr::{split_host_port, ResolvedAddress};
use crate::engine::{Engine, EngineInner};
use crate::error::{EngineError, Result};
use crate::task::LookupHandle;

pub(crate) struct PendingLookup {
    abort: Option<AbortHandle>,
}

/// One DNS SRV record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SrvRecord {
    /// Target host name.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Record priority; lower is preferred.
    pub priority: u16,
    /// Relative weight among records of equal priority.
    pub weight: u16,
}

/// Asynchronous name resolver bound to one engine.
#[derive(Clone)]
pub struct DnsResolver {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Returns a resolver sharing this engine's workers and queues.
    pub fn dns_resolver(&self) -> DnsResolver {
        DnsResolver {
            inner: Arc::clone(self.inner()),
        }
    }
}

impl DnsResolver {
    /// Resolves `name` to socket addresses.
    ///
    /// `default_port` applies only when `name` carries no embedded port.
    /// An empty result set is a successful outcome. Deadline expiry surfaces
    /// as `DeadlineExceeded`; resolver failure as `NotFound`.
    pub fn lookup_hostname(
        &self,
        on_resolve: impl FnOnce(Result<Vec<ResolvedAddress>>) + Send + 'static,
        name: &str,
        default_port: u16,
        deadline: Instant,
    ) -> LookupHandle {
        let name = name.to_string();
        let (index, generation) = self.inner.lookups.insert(PendingLookup { abort: None });
        let inner = Arc::clone(&self.inner);
        let task = self.inner.rt.spawn(async move {
            let result = resolve_hostname(&name, default_port, deadline).await;
            if inner.lookups.take(index, generation).is_some() {
                inner.enqueue(Box::new(move || on_resolve(result)));
            }
        });
        self.inner.lookups.with_mut(index, generation, |entry| {
            entry.abort = Some(task.abort_handle())
        });
        LookupHandle::from_parts(index, generation)
    }

    /// Performs an SRV record lookup.
    ///
    /// This backend completes SRV lookups with `Unimplemented`; the handle,
    /// deadline, and cancellation semantics are identical to hostname
    /// lookups.
    pub fn lookup_srv(
        &self,
        on_resolve: impl FnOnce(Result<Vec<SrvRecord>>) + Send + 'static,
        name: &str,
        _deadline: Instant,
    ) -> LookupHandle {
        self.unsupported_lookup("SRV", name, on_resolve)
    }

    /// Performs a TXT record lookup.
    ///
    /// This backend completes TXT lookups with `Unimplemented`; the handle,
    /// deadline, and cancellation semantics are identical to hostname
    /// lookups.
    pub fn lookup_txt(
        &self,
        on_resolve: impl FnOnce(Result<Vec<String>>) + Send + 'static,
        name: &str,
        _deadline: Instant,
    ) -> LookupHandle {
        self.unsupported_lookup("TXT", name, on_resolve)
    }

    /// Attempts to cancel an in-flight lookup.
    ///
    /// On `true` the callback will never run; on `false` it runs exactly
    /// once with the lookup's outcome.
    pub fn cancel_lookup(&self, handle: LookupHandle) -> bool {
        let (index, generation) = handle.parts();
        match self.inner.lookups.take(index, generation) {
            Some(entry) => {
                if let Some(abort) = entry.abort {
                    abort.abort();
                }
                true
            }
            None => false,
        }
    }

    fn unsupported_lookup<T: Send + 'static>(
        &self,
        kind: &str,
        name: &str,
        on_resolve: impl FnOnce(Result<T>) + Send + 'static,
    ) -> LookupHandle {
        let (index, generation) = self.inner.lookups.insert(PendingLookup { abort: None });
        let inner = Arc::clone(&self.inner);
        let message = format!("{kind} lookup for {name} is not supported by this resolver");
        let task = self.inner.rt.spawn(async move {
            if inner.lookups.take(index, generation).is_some() {
                inner.enqueue(Box::new(move || {
                    on_resolve(Err(EngineError::Unimplemented(message)))
                }));
            }
        });
        self.inner.lookups.with_mut(index, generation, |entry| {
            entry.abort = Some(task.abort_handle())
        });
        LookupHandle::from_parts(index, generation)
    }
}

async fn resolve_hostname(
    name: &str,
    default_port: u16,
    deadline: Instant,
) -> Result<Vec<ResolvedAddress>> {
    let (host, port) = split_host_port(name)?;
    let port = port.unwrap_or(default_port);
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ResolvedAddress::from(SocketAddr::new(ip, port))]);
    }
    let budget = deadline.saturating_duration_since(Instant::now());
    let result = tokio::time::timeout(budget, tokio::net::lookup_host((host.as_str(), port))).await;
    match result {
        Err(_) => Err(EngineError::deadline_exceeded(format!(
            "lookup of {name} timed out"
        ))),
        Ok(Err(err)) => Err(EngineError::NotFound(format!(
            "failed to resolve {name}: {err}"
        ))),
        Ok(Ok(addrs)) => Ok(addrs.map(ResolvedAddress::from).collect()),
    }
}
