//! In-memory store cluster for tests/dev.
//!
//! Several nodes share one dataset (as if replication were instantaneous).
//! Each node can be taken down (open connections fail, new ones are refused)
//! or demoted to read-only (writes answer `READONLY`), which is enough to
//! replay a primary failover without a real server.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use keyline_core::{Endpoint, Reply, Request, StoreError};

use super::{StoreConnection, StoreConnector};

#[derive(Debug, Default)]
struct ClusterState {
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    nodes: HashMap<Endpoint, NodeState>,
    commands: HashMap<String, u64>,
    connects: HashMap<Endpoint, u64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct NodeState {
    down: bool,
    read_only: bool,
    /// Bumped whenever existing connections to the node must die.
    generation: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<ClusterState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared-dataset cluster of in-memory nodes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCluster {
    shared: Arc<Shared>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node that accepts connections.
    pub fn add_node(&self, addr: Endpoint) {
        self.shared.lock().nodes.entry(addr).or_default();
    }

    /// Take a node down (or bring it back). Going down kills every open
    /// connection to it, including ones blocked in `BLPOP`.
    pub fn set_down(&self, addr: &Endpoint, down: bool) {
        let mut state = self.shared.lock();
        let node = state.nodes.entry(addr.clone()).or_default();
        node.down = down;
        if down {
            node.generation += 1;
        }
        self.shared.changed.notify_all();
    }

    /// Demote (or promote) a node; a read-only node rejects writes.
    pub fn set_read_only(&self, addr: &Endpoint, read_only: bool) {
        let mut state = self.shared.lock();
        state.nodes.entry(addr.clone()).or_default().read_only = read_only;
    }

    /// Reset every open connection to `addr` while leaving the node up.
    pub fn drop_connections(&self, addr: &Endpoint) {
        let mut state = self.shared.lock();
        if let Some(node) = state.nodes.get_mut(addr) {
            node.generation += 1;
        }
        self.shared.changed.notify_all();
    }

    /// Current contents of list `key`, head first.
    pub fn list(&self, key: &str) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .lists
            .get(key)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// How many times a command was executed, across all nodes.
    pub fn command_count(&self, name: &str) -> u64 {
        self.shared
            .lock()
            .commands
            .get(&name.to_ascii_uppercase())
            .copied()
            .unwrap_or(0)
    }

    /// Connection attempts made against `addr` (successful or not).
    pub fn connect_count(&self, addr: &Endpoint) -> u64 {
        self.shared.lock().connects.get(addr).copied().unwrap_or(0)
    }
}

impl StoreConnector for InMemoryCluster {
    fn connect(&self, addr: &Endpoint) -> Result<Box<dyn StoreConnection>, StoreError> {
        let mut state = self.shared.lock();
        *state.connects.entry(addr.clone()).or_default() += 1;

        match state.nodes.get(addr) {
            Some(node) if !node.down => Ok(Box::new(MemoryConnection {
                shared: self.shared.clone(),
                addr: addr.clone(),
                generation: node.generation,
            })),
            Some(_) => Err(StoreError::Transport(format!("connection refused: {addr}"))),
            None => Err(StoreError::Transport(format!("no route to host: {addr}"))),
        }
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    addr: Endpoint,
    generation: u64,
}

impl MemoryConnection {
    fn node(&self, state: &ClusterState) -> Result<NodeState, StoreError> {
        match state.nodes.get(&self.addr) {
            Some(node) if !node.down && node.generation == self.generation => Ok(*node),
            _ => Err(StoreError::Transport(format!(
                "connection reset by peer: {}",
                self.addr
            ))),
        }
    }

    fn writable(&self, state: &ClusterState) -> Result<(), StoreError> {
        if self.node(state)?.read_only {
            return Err(StoreError::ReadOnly(
                "READONLY You can't write against a read only replica.".to_string(),
            ));
        }
        Ok(())
    }

    fn push(
        &self,
        state: &mut ClusterState,
        request: &Request,
        front: bool,
    ) -> Result<Reply, StoreError> {
        self.writable(state)?;

        let (key, values) = match request.args() {
            [key, values @ ..] if !values.is_empty() => (key, values),
            _ => return Err(wrong_arity(request)),
        };

        let list = state
            .lists
            .entry(String::from_utf8_lossy(key).into_owned())
            .or_default();
        for value in values {
            if front {
                list.push_front(value.clone());
            } else {
                list.push_back(value.clone());
            }
        }
        let len = list.len() as i64;

        self.shared.changed.notify_all();
        Ok(Reply::Int(len))
    }

    fn blocking_pop<'a>(
        &self,
        mut state: MutexGuard<'a, ClusterState>,
        request: &Request,
    ) -> Result<Reply, StoreError> {
        self.writable(&state)?;

        let args = request.args();
        if args.len() < 2 {
            return Err(wrong_arity(request));
        }
        let (keys, timeout) = args.split_at(args.len() - 1);
        let timeout_secs: f64 = std::str::from_utf8(&timeout[0])
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|secs: &f64| secs.is_finite() && *secs >= 0.0)
            .ok_or_else(|| {
                StoreError::Command("ERR timeout is not a float or out of range".to_string())
            })?;
        let deadline = (timeout_secs > 0.0)
            .then(|| Instant::now() + Duration::from_secs_f64(timeout_secs));

        loop {
            for key in keys {
                let key = String::from_utf8_lossy(key).into_owned();
                if let Some(item) = state.lists.get_mut(&key).and_then(VecDeque::pop_front) {
                    return Ok(Reply::Array(vec![
                        Reply::Data(key.into_bytes()),
                        Reply::Data(item),
                    ]));
                }
            }

            state = match deadline {
                None => self
                    .shared
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Reply::Nil);
                    }
                    self.shared
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };

            self.node(&state)?;
        }
    }
}

impl StoreConnection for MemoryConnection {
    fn execute(&mut self, request: &Request) -> Result<Reply, StoreError> {
        let mut state = self.shared.lock();
        self.node(&state)?;

        let name = request.name().to_ascii_uppercase();
        *state.commands.entry(name.clone()).or_default() += 1;

        match name.as_str() {
            "PING" => Ok(Reply::Status("PONG".to_string())),
            "RPUSH" => self.push(&mut state, request, false),
            "LPUSH" => self.push(&mut state, request, true),
            "LLEN" => match request.args() {
                [key] => {
                    let key = String::from_utf8_lossy(key);
                    let len = state.lists.get(key.as_ref()).map_or(0, VecDeque::len);
                    Ok(Reply::Int(len as i64))
                }
                _ => Err(wrong_arity(request)),
            },
            "BLPOP" => self.blocking_pop(state, request),
            _ => Err(StoreError::Command(format!(
                "ERR unknown command '{}'",
                request.name()
            ))),
        }
    }
}

fn wrong_arity(request: &Request) -> StoreError {
    StoreError::Command(format!(
        "ERR wrong number of arguments for '{}' command",
        request.name().to_ascii_lowercase()
    ))
}
