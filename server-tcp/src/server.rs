use crate::protocol::{self, Request, Response};
use futures::{SinkExt, StreamExt};
use hoard::domain::{CasToken, validate_key};
use hoard::ports::CacheStore;
use shared::Result;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Accept connections forever, serving each on its own task
pub async fn serve(listener: TcpListener, store: Arc<dyn CacheStore>) -> Result<()> {
    loop {
        let (socket, addr) = listener.accept().await?;
        let store = store.clone();
        tokio::spawn(async move {
            debug!("Connection {addr} successful.");

            if let Err(err) = process_connection(socket, store).await {
                warn!("Connection {addr} error: {err:?}");
            }
        });
    }
}

pub async fn process_connection(
    socket: TcpStream,
    store: Arc<dyn CacheStore>,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    socket.set_nodelay(true).ok();

    let mut framed = Framed::new(socket, protocol::codec());

    while let Some(frame_result) = framed.next().await {
        let frame = frame_result?;

        let response = match Request::decode(frame.freeze()) {
            Ok(request) => {
                debug!("Received request: {:?}", request);
                execute(store.as_ref(), request).await
            }
            Err(e) => {
                warn!("Failed to decode request: {}", e);
                Response::Error { msg: e.to_string() }
            }
        };

        framed.send(response.encode()).await?;
    }

    info!("Connection closed");
    Ok(())
}

/// Run one request against the store. Store failures become ERROR responses
/// so the connection survives them.
async fn execute(store: &dyn CacheStore, request: Request) -> Response {
    if let Some(key) = request.key() {
        if let Err(e) = validate_key(key) {
            return Response::Error { msg: e.to_string() };
        }
    }

    let outcome = match request {
        Request::Ping => Ok(Response::Pong {
            cas: store.supports_cas(),
        }),
        Request::Set { key, value, expiry } => {
            store.set(&key, value, expiry).await.map(Response::stored)
        }
        Request::Get { key } => store.get(&key).await.map(|found| match found {
            Some(entry) => Response::Value {
                token: entry.cas.map(|t| t.0).unwrap_or(0),
                value: entry.value,
            },
            None => Response::NotFound,
        }),
        Request::Delete { key, delay } => store.delete(&key, delay).await.map(|deleted| {
            if deleted { Response::Deleted } else { Response::NotFound }
        }),
        Request::Add { key, value, expiry } => {
            store.add(&key, value, expiry).await.map(Response::stored)
        }
        Request::Cas { token, key, value, expiry } => store
            .cas(CasToken(token), &key, value, expiry)
            .await
            .map(Response::stored),
    };

    outcome.unwrap_or_else(|e| Response::Error { msg: e.to_string() })
}
