use crate::protocol::{self, Request, Response};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use hoard::domain::{CachedValue, CasToken};
use hoard::expiry::to_relative;
use hoard::ports::CacheStore;
use shared::{Error, Result};
use std::fmt::Debug;
use std::net::SocketAddr;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

struct Connection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    /// Set while a request is on the wire. Still set on entry means an earlier
    /// call was dropped mid-exchange and its response may be pending.
    in_flight: bool,
}

/// [`CacheStore`] backed by a remote server over one TCP connection.
/// Requests are serialised: one in flight at a time.
///
/// CAS support mirrors the serving store, as advertised in the PONG that
/// `connect` waits for, so merges against a server without CAS go through
/// the lock.
pub struct RemoteStore {
    conn: Mutex<Connection>,
    peer: SocketAddr,
    supports_cas: bool,
}

impl RemoteStore {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        debug!("Connected to cache server at {}", peer);

        let mut remote = Self {
            conn: Mutex::new(Connection {
                framed: Framed::new(stream, protocol::codec()),
                in_flight: false,
            }),
            peer,
            supports_cas: false,
        };
        remote.supports_cas = remote.ping().await?;
        debug!("Server at {} supports CAS: {}", peer, remote.supports_cas);

        Ok(remote)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Round-trip a PING. Returns whether the serving store supports CAS.
    pub async fn ping(&self) -> Result<bool> {
        match self.call(Request::Ping).await? {
            Response::Pong { cas } => Ok(cas),
            other => Err(unexpected(other)),
        }
    }

    async fn call(&self, request: Request) -> Result<Response> {
        let mut conn = self.conn.lock().await;
        if conn.in_flight {
            return Err(Error::Protocol(
                "connection out of sync after an abandoned request".to_string(),
            ));
        }

        conn.in_flight = true;
        conn.framed.send(request.encode()).await?;
        let response = match conn.framed.next().await {
            Some(frame) => Response::decode(frame?.freeze())?,
            None => return Err(Error::Protocol("connection closed by server".to_string())),
        };
        conn.in_flight = false;

        match response {
            Response::Error { msg } => Err(Error::Storage(format!("server error: {}", msg))),
            response => Ok(response),
        }
    }

    async fn store(&self, request: Request) -> Result<bool> {
        match self.call(request).await? {
            Response::Stored => Ok(true),
            Response::NotStored => Ok(false),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> Error {
    Error::Protocol(format!("unexpected response: {:?}", response))
}

#[async_trait]
impl CacheStore for RemoteStore {
    async fn get(&self, key: &str) -> Result<Option<CachedValue>> {
        let request = Request::Get { key: key.to_string() };
        match self.call(request).await? {
            Response::Value { token, value } => {
                let cas = (token != 0).then_some(CasToken(token));
                Ok(Some(CachedValue::new(value, cas)))
            }
            Response::NotFound => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    async fn set(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        self.store(Request::Set {
            key: key.to_string(),
            value,
            expiry: to_relative(expiry),
        })
        .await
    }

    async fn cas(&self, token: CasToken, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        self.store(Request::Cas {
            token: token.0,
            key: key.to_string(),
            value,
            expiry: to_relative(expiry),
        })
        .await
    }

    async fn delete(&self, key: &str, delay: u64) -> Result<bool> {
        let request = Request::Delete {
            key: key.to_string(),
            delay,
        };
        match self.call(request).await? {
            Response::Deleted => Ok(true),
            Response::NotFound => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    async fn add(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        self.store(Request::Add {
            key: key.to_string(),
            value,
            expiry: to_relative(expiry),
        })
        .await
    }

    fn supports_cas(&self) -> bool {
        self.supports_cas
    }
}

impl Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("peer", &self.peer)
            .finish()
    }
}
