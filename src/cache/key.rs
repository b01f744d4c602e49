use std::fmt;

use crate::core::{Error, Result};
use crate::driver::{Connection, ConnectionToken};

/// Cache key of one physical connection.
///
/// Derived from the connection's physical token, never from the object the
/// caller holds, so pool wrappers around the same connection share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(ConnectionToken);

impl ConnectionKey {
    pub fn derive(conn: Option<&dyn Connection>) -> Result<Self> {
        let conn = conn.ok_or_else(|| Error::ConnectionState("no connection is bound".into()))?;
        if conn.is_closed() {
            return Err(Error::ConnectionState("connection is closed".into()));
        }
        conn.physical_token()
            .map(Self)
            .ok_or_else(|| Error::ConnectionState("connection does not expose a physical identity".into()))
    }

    pub fn token(&self) -> ConnectionToken {
        self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
