use bytes::{Buf, BufMut, Bytes, BytesMut};
use shared::{Error, Result};
use tokio_util::codec::LengthDelimitedCodec;

/// Largest frame either side accepts
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

// Command type identifiers
pub const CMD_PING: u8 = 0x00;
pub const CMD_SET: u8 = 0x01;
pub const CMD_GET: u8 = 0x02;
pub const CMD_DELETE: u8 = 0x03;
pub const CMD_ADD: u8 = 0x04;
pub const CMD_CAS: u8 = 0x05;

// Response type identifiers
pub const RESP_PONG: u8 = 0x00;
pub const RESP_STORED: u8 = 0x01;
pub const RESP_NOT_STORED: u8 = 0x02;
pub const RESP_VALUE: u8 = 0x03;
pub const RESP_NOT_FOUND: u8 = 0x04;
pub const RESP_ERROR: u8 = 0x05;
pub const RESP_DELETED: u8 = 0x06;

/// PONG flag: the serving store hands out CAS tokens
pub const FLAG_CAS: u8 = 0x01;

/// Length-delimited codec with a 4-byte big-endian length prefix, shared by
/// server and client
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Expiries travel as relative seconds (0 = never)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping,
    Set { key: String, value: Bytes, expiry: u64 },
    Get { key: String },
    Delete { key: String, delay: u64 },
    Add { key: String, value: Bytes, expiry: u64 },
    Cas { token: u64, key: String, value: Bytes, expiry: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `cas` advertises whether the serving store supports compare-and-swap
    Pong { cas: bool },
    Stored,
    NotStored,
    /// `token` is the entry's CAS token, 0 when the backend has none
    Value { token: u64, value: Bytes },
    NotFound,
    Error { msg: String },
    Deleted,
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn get_u64(buf: &mut Bytes, what: &str) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(Error::Protocol(format!("Invalid {}: missing u64 field", what)));
    }
    Ok(buf.get_u64())
}

fn get_bytes(buf: &mut Bytes, what: &str) -> Result<Bytes> {
    if buf.remaining() < 4 {
        return Err(Error::Protocol(format!("Invalid {}: missing length", what)));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(Error::Protocol(format!(
            "Invalid {}: expected {} bytes, got {}",
            what,
            len,
            buf.remaining()
        )));
    }
    Ok(buf.copy_to_bytes(len))
}

fn get_string(buf: &mut Bytes, what: &str) -> Result<String> {
    let bytes = get_bytes(buf, what)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::Protocol(format!("Invalid {} key UTF-8: {}", what, e)))
}

fn expect_end(buf: &Bytes, what: &str) -> Result<()> {
    if buf.has_remaining() {
        return Err(Error::Protocol(format!(
            "Invalid {}: {} trailing bytes",
            what,
            buf.remaining()
        )));
    }
    Ok(())
}

impl Request {
    /// The key a request addresses, if any
    pub fn key(&self) -> Option<&str> {
        match self {
            Request::Ping => None,
            Request::Set { key, .. }
            | Request::Get { key }
            | Request::Delete { key, .. }
            | Request::Add { key, .. }
            | Request::Cas { key, .. } => Some(key),
        }
    }

    /// Encode a Request into Bytes for transmission
    ///
    /// Format:
    /// - PING: [0x00]
    /// - SET: [0x01][key_len: u32][key][value_len: u32][value][expiry: u64]
    /// - GET: [0x02][key_len: u32][key]
    /// - DELETE: [0x03][key_len: u32][key][delay: u64]
    /// - ADD: [0x04][key_len: u32][key][value_len: u32][value][expiry: u64]
    /// - CAS: [0x05][token: u64][key_len: u32][key][value_len: u32][value][expiry: u64]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Request::Ping => {
                buf.put_u8(CMD_PING);
            }
            Request::Set { key, value, expiry } => {
                buf.put_u8(CMD_SET);
                put_bytes(&mut buf, key.as_bytes());
                put_bytes(&mut buf, value);
                buf.put_u64(*expiry);
            }
            Request::Get { key } => {
                buf.put_u8(CMD_GET);
                put_bytes(&mut buf, key.as_bytes());
            }
            Request::Delete { key, delay } => {
                buf.put_u8(CMD_DELETE);
                put_bytes(&mut buf, key.as_bytes());
                buf.put_u64(*delay);
            }
            Request::Add { key, value, expiry } => {
                buf.put_u8(CMD_ADD);
                put_bytes(&mut buf, key.as_bytes());
                put_bytes(&mut buf, value);
                buf.put_u64(*expiry);
            }
            Request::Cas { token, key, value, expiry } => {
                buf.put_u8(CMD_CAS);
                buf.put_u64(*token);
                put_bytes(&mut buf, key.as_bytes());
                put_bytes(&mut buf, value);
                buf.put_u64(*expiry);
            }
        }

        buf.freeze()
    }

    /// Decode a Request from one frame extracted by the codec
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.is_empty() {
            return Err(Error::Protocol("Empty buffer".to_string()));
        }

        let cmd = buf.get_u8();
        let request = match cmd {
            CMD_PING => Request::Ping,
            CMD_SET => Request::Set {
                key: get_string(&mut buf, "SET")?,
                value: get_bytes(&mut buf, "SET")?,
                expiry: get_u64(&mut buf, "SET")?,
            },
            CMD_GET => Request::Get {
                key: get_string(&mut buf, "GET")?,
            },
            CMD_DELETE => Request::Delete {
                key: get_string(&mut buf, "DELETE")?,
                delay: get_u64(&mut buf, "DELETE")?,
            },
            CMD_ADD => Request::Add {
                key: get_string(&mut buf, "ADD")?,
                value: get_bytes(&mut buf, "ADD")?,
                expiry: get_u64(&mut buf, "ADD")?,
            },
            CMD_CAS => Request::Cas {
                token: get_u64(&mut buf, "CAS")?,
                key: get_string(&mut buf, "CAS")?,
                value: get_bytes(&mut buf, "CAS")?,
                expiry: get_u64(&mut buf, "CAS")?,
            },
            _ => return Err(Error::Protocol(format!("Unknown command: 0x{:02X}", cmd))),
        };

        expect_end(&buf, "request")?;
        Ok(request)
    }
}

impl Response {
    /// Encode a Response into Bytes for transmission
    ///
    /// Format:
    /// - PONG: [0x00][flags: u8]
    /// - STORED: [0x01]
    /// - NOT_STORED: [0x02]
    /// - VALUE: [0x03][token: u64][value_len: u32][value]
    /// - NOT_FOUND: [0x04]
    /// - ERROR: [0x05][msg_len: u32][msg]
    /// - DELETED: [0x06]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Response::Pong { cas } => {
                buf.put_u8(RESP_PONG);
                buf.put_u8(if *cas { FLAG_CAS } else { 0 });
            }
            Response::Stored => buf.put_u8(RESP_STORED),
            Response::NotStored => buf.put_u8(RESP_NOT_STORED),
            Response::Value { token, value } => {
                buf.put_u8(RESP_VALUE);
                buf.put_u64(*token);
                put_bytes(&mut buf, value);
            }
            Response::NotFound => buf.put_u8(RESP_NOT_FOUND),
            Response::Error { msg } => {
                buf.put_u8(RESP_ERROR);
                put_bytes(&mut buf, msg.as_bytes());
            }
            Response::Deleted => buf.put_u8(RESP_DELETED),
        }

        buf.freeze()
    }

    /// Decode a Response from one frame extracted by the codec
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.is_empty() {
            return Err(Error::Protocol("Empty buffer".to_string()));
        }

        let resp_type = buf.get_u8();
        let response = match resp_type {
            RESP_PONG => {
                if !buf.has_remaining() {
                    return Err(Error::Protocol("Invalid PONG: missing flags".to_string()));
                }
                Response::Pong {
                    cas: buf.get_u8() & FLAG_CAS != 0,
                }
            }
            RESP_STORED => Response::Stored,
            RESP_NOT_STORED => Response::NotStored,
            RESP_VALUE => Response::Value {
                token: get_u64(&mut buf, "VALUE")?,
                value: get_bytes(&mut buf, "VALUE")?,
            },
            RESP_NOT_FOUND => Response::NotFound,
            RESP_ERROR => {
                let msg = get_bytes(&mut buf, "ERROR")?;
                Response::Error {
                    msg: String::from_utf8_lossy(&msg).to_string(),
                }
            }
            RESP_DELETED => Response::Deleted,
            _ => {
                return Err(Error::Protocol(format!(
                    "Unknown response type: 0x{:02X}",
                    resp_type
                )));
            }
        };

        expect_end(&buf, "response")?;
        Ok(response)
    }

    /// Map a stored/not-stored outcome
    pub fn stored(written: bool) -> Self {
        if written { Response::Stored } else { Response::NotStored }
    }
}
