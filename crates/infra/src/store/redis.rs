//! Redis-backed store adapter.
//!
//! Connections are plain synchronous `redis::Connection`s opened with a
//! connect timeout and no client-side retry: reconnecting is the resilient
//! connection's job, not the client library's.
//!
//! Every read and write on the socket is bounded. The client library's own
//! handshake reads replies before a timeout can be set, so it is kept to a
//! bare TCP connect (no `CLIENT SETINFO`, no credentials, db 0) and `AUTH` and
//! `SELECT` are sent here once the timeouts are in place. A peer that accepts
//! the socket but never answers then surfaces as a transport error instead of
//! pinning the caller.

use std::time::Duration;

use tracing::debug;

use keyline_core::{Endpoint, Reply, Request, StoreError, is_read_only_reply};

use super::{StoreConnection, StoreConnector};

/// Opens Redis connections to whatever node discovery reports.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    connect_timeout: Duration,
    db: i64,
    username: Option<String>,
    password: Option<String>,
}

impl RedisConnector {
    /// `connect_timeout` also bounds every reply (plus the server-side wait
    /// of blocking pops).
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            db: 0,
            username: None,
            password: None,
        }
    }

    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    pub fn with_credentials(mut self, username: Option<String>, password: impl Into<String>) -> Self {
        self.username = username;
        self.password = Some(password.into());
        self
    }

    fn handshake(&self, conn: &mut redis::Connection) -> redis::RedisResult<()> {
        if let Some(password) = &self.password {
            let mut auth = redis::cmd("AUTH");
            if let Some(username) = &self.username {
                auth.arg(username);
            }
            auth.arg(password).query::<()>(conn)?;
        }
        if self.db != 0 {
            redis::cmd("SELECT").arg(self.db).query::<()>(conn)?;
        }
        Ok(())
    }
}

impl StoreConnector for RedisConnector {
    fn connect(&self, addr: &Endpoint) -> Result<Box<dyn StoreConnection>, StoreError> {
        let mut conn = open_bounded(addr, self.connect_timeout).map_err(classify)?;
        self.handshake(&mut conn).map_err(classify)?;

        debug!(addr = %addr, db = self.db, "redis connection established");
        Ok(Box::new(RedisConnection {
            conn,
            io_timeout: self.connect_timeout,
        }))
    }
}

/// Connect with `timeout` on the TCP connect and on every later read/write.
pub(crate) fn open_bounded(
    addr: &Endpoint,
    timeout: Duration,
) -> redis::RedisResult<redis::Connection> {
    let client = redis::Client::open(connection_info(addr))?;
    let conn = client.get_connection_with_timeout(timeout)?;
    conn.set_read_timeout(Some(timeout))?;
    conn.set_write_timeout(Some(timeout))?;
    Ok(conn)
}

struct RedisConnection {
    conn: redis::Connection,
    io_timeout: Duration,
}

impl StoreConnection for RedisConnection {
    fn execute(&mut self, request: &Request) -> Result<Reply, StoreError> {
        // A blocking pop legitimately stays silent for its whole timeout.
        let read_timeout = request
            .blocking_timeout()
            .map_or(self.io_timeout, |wait| wait.saturating_add(self.io_timeout));
        self.conn
            .set_read_timeout(Some(read_timeout))
            .map_err(classify)?;

        let mut cmd = redis::cmd(request.name());
        for arg in request.args() {
            cmd.arg(arg.as_slice());
        }

        cmd.query::<redis::Value>(&mut self.conn)
            .map(reply_from_value)
            .map_err(classify)
    }
}

pub(crate) fn connection_info(addr: &Endpoint) -> redis::ConnectionInfo {
    redis::ConnectionInfo {
        addr: redis::ConnectionAddr::Tcp(addr.host().to_string(), addr.port()),
        redis: redis::RedisConnectionInfo::default(),
    }
}

pub(crate) fn reply_from_value(value: redis::Value) -> Reply {
    match value {
        redis::Value::Nil => Reply::Nil,
        redis::Value::Int(i) => Reply::Int(i),
        redis::Value::Data(data) => Reply::Data(data),
        redis::Value::Bulk(items) => Reply::Array(items.into_iter().map(reply_from_value).collect()),
        redis::Value::Status(status) => Reply::Status(status),
        redis::Value::Okay => Reply::Okay,
    }
}

/// Map a client error onto the store taxonomy.
///
/// `READONLY` replies (a demoted primary) are told apart from ordinary
/// command errors so the connection manager can force a rediscovery.
pub(crate) fn classify(err: redis::RedisError) -> StoreError {
    let message = err.to_string();

    if err.kind() == redis::ErrorKind::ReadOnly || is_read_only_reply(err.code(), &message) {
        StoreError::ReadOnly(message)
    } else if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        StoreError::Transport(message)
    } else {
        StoreError::Command(message)
    }
}
