//! Store command values (mechanics only).
//!
//! The store speaks a request/response protocol: a request is a command name
//! plus binary arguments, a reply is a small tree of typed values. Adapters
//! translate these to and from their client library; everything above the
//! adapters (connection manager, work queue) only sees these types.

use core::fmt;
use core::time::Duration;

/// A single store command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    name: String,
    args: Vec<Vec<u8>>,
}

impl Request {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append one binary-safe argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(arg.as_ref().to_vec());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    pub fn ping() -> Self {
        Self::new("PING")
    }

    /// Append `value` to the tail of list `key`.
    pub fn rpush(key: &str, value: impl AsRef<[u8]>) -> Self {
        Self::new("RPUSH").arg(key).arg(value)
    }

    /// Prepend `value` to the head of list `key`.
    pub fn lpush(key: &str, value: impl AsRef<[u8]>) -> Self {
        Self::new("LPUSH").arg(key).arg(value)
    }

    /// Pop the head of list `key`, waiting up to `timeout_secs` for an item.
    pub fn blpop(key: &str, timeout_secs: u64) -> Self {
        Self::new("BLPOP").arg(key).arg(timeout_secs.to_string())
    }

    pub fn llen(key: &str) -> Self {
        Self::new("LLEN").arg(key)
    }

    /// How long the server may hold this command before replying.
    ///
    /// `Some` only for blocking pops with a finite, non-zero timeout; the
    /// timeout is their last argument, in (possibly fractional) seconds.
    pub fn blocking_timeout(&self) -> Option<Duration> {
        if !["BLPOP", "BRPOP"]
            .iter()
            .any(|name| self.name.eq_ignore_ascii_case(name))
        {
            return None;
        }

        let secs: f64 = core::str::from_utf8(self.args.last()?).ok()?.trim().parse().ok()?;
        Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|timeout| !timeout.is_zero())
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.args {
            write!(f, " {}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

/// A store reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Int(i64),
    Data(Vec<u8>),
    Status(String),
    Okay,
    Array(Vec<Reply>),
}

impl Reply {
    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Data(data) => Some(data),
            Reply::Status(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Reply::Int(i) => Some(*i),
            Reply::Data(data) => std::str::from_utf8(data).ok()?.parse().ok(),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Nil => f.write_str("(nil)"),
            Reply::Int(i) => write!(f, "(integer) {i}"),
            Reply::Data(data) => write!(f, "\"{}\"", String::from_utf8_lossy(data)),
            Reply::Status(s) => f.write_str(s),
            Reply::Okay => f.write_str("OK"),
            Reply::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Classify a store error reply as "this node no longer accepts writes".
///
/// Right after a failover the old primary is demoted to a replica and answers
/// writes with `READONLY ...` (older servers: "... read only slave"). Prefer
/// the protocol error code when the adapter exposes one; fall back to the
/// message text otherwise.
pub fn is_read_only_reply(code: Option<&str>, message: &str) -> bool {
    if code.is_some_and(|c| c.eq_ignore_ascii_case("READONLY")) {
        return true;
    }

    let message = message.trim_start().to_ascii_lowercase();
    message.starts_with("readonly") || message.contains("read only")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_timeout_only_for_bounded_blocking_pops() {
        assert_eq!(
            Request::blpop("jobs", 5).blocking_timeout(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            Request::new("brpop").arg("a").arg("b").arg("0.5").blocking_timeout(),
            Some(Duration::from_millis(500))
        );
        // 0 means "forever" to the server; there is no bound to derive.
        assert_eq!(Request::blpop("jobs", 0).blocking_timeout(), None);
        assert_eq!(Request::rpush("jobs", "5").blocking_timeout(), None);
        assert_eq!(Request::new("BLPOP").blocking_timeout(), None);
    }

    #[test]
    fn builds_queue_commands() {
        let push = Request::rpush("jobs", "payload");
        assert_eq!(push.name(), "RPUSH");
        assert_eq!(push.args(), &[b"jobs".to_vec(), b"payload".to_vec()]);

        let pop = Request::blpop("jobs", 5);
        assert_eq!(pop.to_string(), "BLPOP jobs 5");
    }

    #[test]
    fn reads_reply_values() {
        assert_eq!(Reply::Int(3).as_int(), Some(3));
        assert_eq!(Reply::Data(b"42".to_vec()).as_int(), Some(42));
        assert_eq!(Reply::Data(b"x".to_vec()).as_bytes(), Some(&b"x"[..]));
        assert!(Reply::Nil.is_nil());
        assert_eq!(Reply::Okay.into_array(), None);
    }

    #[test]
    fn detects_read_only_replies() {
        assert!(is_read_only_reply(Some("READONLY"), "You can't write"));
        assert!(is_read_only_reply(
            None,
            "READONLY You can't write against a read only replica."
        ));
        assert!(is_read_only_reply(
            None,
            "ERR You can't write against a Read Only Slave."
        ));
        assert!(!is_read_only_reply(
            Some("WRONGTYPE"),
            "Operation against a key holding the wrong kind of value"
        ));
        assert!(!is_read_only_reply(None, "ERR unknown command"));
    }
}
