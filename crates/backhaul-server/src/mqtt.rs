//! Minimal MQTT 3.1.1 packet codec for publishing reports
//!
//! Covers what a QoS 0 publisher needs: `CONNECT`, `PUBLISH`, `DISCONNECT` out and
//! `CONNACK` in. Any other inbound packet is surfaced by type so the caller can
//! reject it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Largest value the variable-length "remaining length" field can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const PROTOCOL_NAME: &[u8] = b"MQTT";
const PROTOCOL_LEVEL: u8 = 4;

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH: u8 = 0x30;
const DISCONNECT: u8 = 0xE0;

const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_USERNAME: u8 = 0x80;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Packet too large: {0} bytes (max {MAX_REMAINING_LENGTH})")]
    PacketTooLarge(usize),

    #[error("String field too long: {0} bytes")]
    StringTooLong(usize),

    #[error("Malformed remaining length")]
    MalformedLength,

    #[error("Malformed CONNACK")]
    MalformedConnAck,

    #[error("Unexpected packet type {0:#04x}")]
    UnexpectedPacket(u8),

    #[error("Broker refused connection with code {0}")]
    Refused(u8),

    #[error("Broker closed the connection")]
    Closed,

    #[error("Timed out waiting for the broker")]
    Timeout,
}

/// Packets a publisher sends
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Connect {
        client_id: String,
        username: Option<String>,
        password: Option<String>,
        keep_alive_secs: u16,
    },
    Publish {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    Disconnect,
}

/// Packets a publisher reads
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    ConnAck { session_present: bool, code: u8 },
    Other(u8),
}

#[derive(Debug, Default)]
pub struct MqttCodec;

impl MqttCodec {
    pub fn new() -> Self {
        Self
    }
}

fn put_remaining_length(dst: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

/// Parse the remaining length after the fixed header byte
///
/// Returns `(value, bytes used)`, or `None` if more input is needed.
fn read_remaining_length(src: &[u8]) -> Result<Option<(usize, usize)>, MqttError> {
    let mut value = 0usize;
    for (index, byte) in src.iter().take(4).enumerate() {
        value += usize::from(byte & 0x7F) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
    }
    if src.len() >= 4 {
        return Err(MqttError::MalformedLength);
    }
    Ok(None)
}

fn put_string(dst: &mut BytesMut, value: &[u8]) -> Result<(), MqttError> {
    let len = u16::try_from(value.len()).map_err(|_| MqttError::StringTooLong(value.len()))?;
    dst.put_u16(len);
    dst.put_slice(value);
    Ok(())
}

impl Encoder<Outgoing> for MqttCodec {
    type Error = MqttError;

    fn encode(&mut self, item: Outgoing, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        let header = match item {
            Outgoing::Connect {
                client_id,
                username,
                password,
                keep_alive_secs,
            } => {
                let mut flags = FLAG_CLEAN_SESSION;
                if username.is_some() {
                    flags |= FLAG_USERNAME;
                    // 3.1.1 only allows a password alongside a username
                    if password.is_some() {
                        flags |= FLAG_PASSWORD;
                    }
                }

                put_string(&mut body, PROTOCOL_NAME)?;
                body.put_u8(PROTOCOL_LEVEL);
                body.put_u8(flags);
                body.put_u16(keep_alive_secs);
                put_string(&mut body, client_id.as_bytes())?;
                if let Some(username) = &username {
                    put_string(&mut body, username.as_bytes())?;
                    if let Some(password) = &password {
                        put_string(&mut body, password.as_bytes())?;
                    }
                }
                CONNECT
            }
            Outgoing::Publish {
                topic,
                payload,
                retain,
            } => {
                put_string(&mut body, topic.as_bytes())?;
                body.put_slice(&payload);
                PUBLISH | u8::from(retain)
            }
            Outgoing::Disconnect => DISCONNECT,
        };

        if body.len() > MAX_REMAINING_LENGTH {
            return Err(MqttError::PacketTooLarge(body.len()));
        }

        dst.reserve(5 + body.len());
        dst.put_u8(header);
        put_remaining_length(dst, body.len());
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for MqttCodec {
    type Item = Incoming;
    type Error = MqttError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let Some((length, used)) = read_remaining_length(&src[1..])? else {
            return Ok(None);
        };

        let total_len = 1 + used + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let header = src[0];
        src.advance(1 + used);
        let body = src.split_to(length);

        match header & 0xF0 {
            CONNACK => {
                if body.len() != 2 {
                    return Err(MqttError::MalformedConnAck);
                }
                Ok(Some(Incoming::ConnAck {
                    session_present: body[0] & 0x01 == 1,
                    code: body[1],
                }))
            }
            other => Ok(Some(Incoming::Other(other))),
        }
    }
}
