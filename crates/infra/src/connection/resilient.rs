//! Reconnect/backoff state machine and the connection handle.
//!
//! One supervisor thread per logical connection owns every transition out of
//! `Disconnected`, `Resolving`, `Connecting` and `BackoffWait`; callers only
//! ever move the machine from `Connected` to `BackoffWait` (a command saw the
//! connection die) or to `Closed`. All state sits behind one mutex, and the
//! condvar wakes both the supervisor and callers waiting for a connection.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use keyline_core::{
    Backoff, BackoffStep, ClientOptions, ConnectionError, ConnectionId, ConnectionResult,
    Endpoint, Reply, Request, StoreError,
};
use keyline_events::{ConnectionEvent, InMemoryNotifier, Notice, Notifier, Subscription};

use super::state::ConnectionState;
use crate::discovery::DiscoveryGroup;
use crate::store::{StoreConnection, StoreConnector};

/// A live store connection tagged with the epoch it was opened in.
///
/// Disconnect reports carry the epoch, so several commands failing on the same
/// dead socket trigger one reconnect cycle, not one each.
#[derive(Clone)]
struct Link {
    epoch: u64,
    conn: Arc<Mutex<Box<dyn StoreConnection>>>,
}

struct Inner {
    state: ConnectionState,
    /// Cleared by `close()` only.
    keepalive: bool,
    current: Option<Endpoint>,
    link: Option<Link>,
    epoch: u64,
    backoff: Backoff,
}

struct Shared {
    id: ConnectionId,
    name: String,
    options: ClientOptions,
    group: Arc<DiscoveryGroup>,
    connector: Arc<dyn StoreConnector>,
    inner: Mutex<Inner>,
    changed: Condvar,
    notifier: InMemoryNotifier<Notice<ConnectionEvent>>,
}

/// Handle to one logical connection; cheap to clone, all clones share state.
#[derive(Clone)]
pub struct ResilientConnection {
    shared: Arc<Shared>,
}

impl core::fmt::Debug for ResilientConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResilientConnection")
            .field("id", &self.shared.id)
            .field("logical_name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ResilientConnection {
    /// Start a connection for `logical_name`.
    ///
    /// Returns immediately; resolution and connecting happen on a background
    /// supervisor thread. Commands issued before the first connect wait for
    /// it.
    pub fn open(
        group: Arc<DiscoveryGroup>,
        connector: Arc<dyn StoreConnector>,
        logical_name: impl Into<String>,
        options: ClientOptions,
    ) -> ConnectionResult<Self> {
        let shared = Arc::new(Shared {
            id: ConnectionId::new(),
            name: logical_name.into(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                keepalive: true,
                current: None,
                link: None,
                epoch: 0,
                backoff: Backoff::from_options(&options),
            }),
            options,
            group,
            connector,
            changed: Condvar::new(),
            notifier: InMemoryNotifier::new(),
        });

        let supervisor = shared.clone();
        thread::Builder::new()
            .name(format!("keyline-conn-{}", shared.name))
            .spawn(move || supervisor.supervise())
            .map_err(|e| ConnectionError::Spawn(e.to_string()))?;

        info!(
            connection_id = %shared.id,
            logical_name = %shared.name,
            agents = shared.group.len(),
            "resilient connection opened"
        );

        Ok(Self { shared })
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn logical_name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state.clone()
    }

    /// Last primary address discovery reported (None before the first).
    pub fn current_endpoint(&self) -> Option<Endpoint> {
        self.shared.lock().current.clone()
    }

    /// True once `close()` has been called.
    pub fn is_closing(&self) -> bool {
        !self.shared.lock().keepalive
    }

    /// Lifecycle notifications (advisory). Each subscription buffers a
    /// bounded number of notices and drops newer ones while full.
    pub fn subscribe(&self) -> Subscription<Notice<ConnectionEvent>> {
        self.shared.notifier.subscribe()
    }

    /// Block until connected (returns the primary) or terminal.
    pub fn wait_ready(&self, timeout: Option<Duration>) -> ConnectionResult<Endpoint> {
        self.shared.wait_link(timeout).map(|(_, addr)| addr)
    }

    /// Run one command against the current primary.
    ///
    /// Waits while the connection is (re)connecting. A command that observes a
    /// disconnect or a read-only primary gets `ConnectionLost` and the
    /// connection starts a reconnect cycle; any other store error comes back
    /// as `Command` and leaves the connection alone.
    pub fn command(&self, request: &Request) -> ConnectionResult<Reply> {
        let (link, addr) = self.shared.wait_link(None)?;

        let result = link
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .execute(request);

        match result {
            Ok(reply) => Ok(reply),
            Err(StoreError::Command(message)) => Err(ConnectionError::Command(message)),
            Err(err) => {
                let reason = err.to_string();
                if self.shared.connection_lost(link.epoch, &reason) {
                    debug!(
                        connection_id = %self.shared.id,
                        addr = %addr,
                        command = request.name(),
                        "command observed a dead or demoted primary"
                    );
                }
                Err(ConnectionError::ConnectionLost {
                    name: self.shared.name.clone(),
                    reason,
                })
            }
        }
    }

    /// Stop for good. Idempotent; a pending retry timer or in-flight
    /// resolution never leads to another connect afterwards.
    pub fn close(&self) {
        let mut inner = self.shared.lock();
        if !inner.keepalive {
            return;
        }

        inner.keepalive = false;
        inner.state = ConnectionState::Closed;
        inner.link = None;

        info!(
            connection_id = %self.shared.id,
            logical_name = %self.shared.name,
            "resilient connection closed"
        );
        self.shared.notify(ConnectionEvent::Closed);
        self.shared.changed.notify_all();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, Inner>,
        timeout: Duration,
    ) -> (MutexGuard<'a, Inner>, bool) {
        let (guard, result) = self
            .changed
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, result.timed_out())
    }

    fn notify(&self, event: ConnectionEvent) {
        self.notifier.notify(Notice::new(self.name.as_str(), event));
    }

    fn supervise(&self) {
        debug!(connection_id = %self.id, logical_name = %self.name, "supervisor started");

        let mut inner = self.lock();
        loop {
            match inner.state.clone() {
                ConnectionState::Closed | ConnectionState::Failed { .. } => break,
                ConnectionState::Disconnected => inner.state = ConnectionState::Resolving,
                ConnectionState::BackoffWait { until, .. } => {
                    let now = Instant::now();
                    if now >= until {
                        inner.state = ConnectionState::Resolving;
                    } else {
                        inner = self.wait_timeout(inner, until - now).0;
                    }
                }
                ConnectionState::Resolving => {
                    drop(inner);
                    let resolved = self.group.resolve(&self.name);
                    inner = self.lock();

                    // Closed while the agents were being asked.
                    if inner.state != ConnectionState::Resolving {
                        continue;
                    }

                    match resolved {
                        Ok(addr) => {
                            debug!(connection_id = %self.id, addr = %addr, "connecting to primary");
                            inner.current = Some(addr.clone());
                            inner.state = ConnectionState::Connecting { addr };
                        }
                        Err(err) => {
                            warn!(
                                connection_id = %self.id,
                                logical_name = %self.name,
                                error = %err,
                                "primary discovery failed"
                            );
                            self.schedule_retry(&mut inner, format!("discovery failed: {err}"));
                        }
                    }
                }
                ConnectionState::Connecting { addr } => {
                    drop(inner);
                    let connected = self.connector.connect(&addr);
                    inner = self.lock();

                    // Closed during the handshake; the new socket is dropped.
                    if !matches!(inner.state, ConnectionState::Connecting { .. }) {
                        continue;
                    }

                    match connected {
                        Ok(conn) => self.mark_connected(&mut inner, addr, conn),
                        Err(err) => {
                            warn!(
                                connection_id = %self.id,
                                addr = %addr,
                                error = %err,
                                "connect to primary failed"
                            );
                            self.schedule_retry(&mut inner, format!("connect to {addr} failed: {err}"));
                        }
                    }
                }
                ConnectionState::Connected { .. } => {
                    let interval = self.options.ping_interval();
                    if interval.is_zero() {
                        inner = self.wait(inner);
                    } else {
                        let (guard, timed_out) = self.wait_timeout(inner, interval);
                        inner = guard;
                        if timed_out && inner.state.is_connected() {
                            inner = self.probe(inner);
                        }
                    }
                }
            }
        }

        debug!(connection_id = %self.id, state = %inner.state, "supervisor stopped");
    }

    fn mark_connected(&self, inner: &mut Inner, addr: Endpoint, conn: Box<dyn StoreConnection>) {
        inner.epoch += 1;
        inner.link = Some(Link {
            epoch: inner.epoch,
            conn: Arc::new(Mutex::new(conn)),
        });
        inner.backoff.reset();
        inner.state = ConnectionState::Connected { addr: addr.clone() };

        info!(
            connection_id = %self.id,
            logical_name = %self.name,
            addr = %addr,
            "connected to primary"
        );
        self.notify(ConnectionEvent::Connected { addr });
        self.changed.notify_all();
    }

    /// Move to `BackoffWait`, or to `Failed` once the retry budget is spent.
    fn schedule_retry(&self, inner: &mut Inner, reason: String) {
        if !inner.keepalive || inner.state.is_terminal() {
            return;
        }

        match inner.backoff.next() {
            BackoffStep::Wait(delay) => {
                let attempt = inner.backoff.attempts();
                inner.state = ConnectionState::BackoffWait {
                    until: Instant::now() + delay,
                    delay,
                };

                info!(
                    connection_id = %self.id,
                    logical_name = %self.name,
                    delay_ms = millis(delay),
                    attempt,
                    "retrying connection"
                );
                self.notify(ConnectionEvent::Retrying {
                    delay_ms: millis(delay),
                    attempt,
                    reason,
                });
            }
            BackoffStep::Exhausted { total } => {
                inner.state = ConnectionState::Failed { total };
                inner.link = None;

                error!(
                    connection_id = %self.id,
                    logical_name = %self.name,
                    total_ms = millis(total),
                    reason = %reason,
                    "retry budget exhausted; connection gone"
                );
                self.notify(ConnectionEvent::Failed {
                    total_ms: millis(total),
                });
            }
        }

        self.changed.notify_all();
    }

    /// Report that the connection opened in `epoch` is dead.
    ///
    /// Returns `true` if this report started the reconnect cycle.
    fn connection_lost(&self, epoch: u64, reason: &str) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch || !inner.state.is_connected() || !inner.keepalive {
            return false;
        }

        inner.link = None;
        warn!(
            connection_id = %self.id,
            logical_name = %self.name,
            reason,
            "connection to primary lost"
        );
        self.notify(ConnectionEvent::Disconnected {
            reason: reason.to_string(),
        });
        self.schedule_retry(&mut inner, reason.to_string());
        true
    }

    /// PING an idle connection; skipped while a command holds it.
    fn probe<'a>(&'a self, inner: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        let Some(link) = inner.link.clone() else {
            return inner;
        };
        drop(inner);

        let outcome = match link.conn.try_lock() {
            Ok(mut conn) => Some(conn.execute(&Request::ping())),
            Err(_) => None,
        };

        match outcome {
            Some(Err(err)) if err.is_disconnect() => {
                self.connection_lost(link.epoch, &format!("liveness probe failed: {err}"));
            }
            Some(Err(err)) => {
                debug!(connection_id = %self.id, error = %err, "liveness probe returned an error");
            }
            _ => {}
        }

        self.lock()
    }

    fn wait_link(&self, timeout: Option<Duration>) -> ConnectionResult<(Link, Endpoint)> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();

        loop {
            match &inner.state {
                ConnectionState::Connected { addr } => {
                    if let Some(link) = &inner.link {
                        return Ok((link.clone(), addr.clone()));
                    }
                }
                ConnectionState::Closed => {
                    return Err(ConnectionError::Closed {
                        name: self.name.clone(),
                    });
                }
                ConnectionState::Failed { total } => {
                    return Err(ConnectionError::RetryBudgetExceeded {
                        name: self.name.clone(),
                        total_ms: millis(*total),
                    });
                }
                _ => {}
            }

            inner = match deadline {
                None => self.wait(inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ConnectionError::NotReady {
                            name: self.name.clone(),
                        });
                    }
                    self.wait_timeout(inner, deadline - now).0
                }
            };
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
