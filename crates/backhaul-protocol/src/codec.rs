use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Length-delimited JSON codec for tunnel messages
///
/// Decodes `In` and encodes `Out`, so one codec drives both directions of a
/// `Framed` stream. The server side is `TunnelCodec<ClientMessage, ServerMessage>`.
///
/// Wire format:
/// ```text
/// +----------------+------------------+
/// | Length (4 bytes| JSON payload     |
/// | big-endian u32)| (variable)       |
/// +----------------+------------------+
/// ```
pub struct TunnelCodec<In, Out = In> {
    _phantom: PhantomData<fn(Out) -> In>,
}

impl<In, Out> TunnelCodec<In, Out> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<In, Out> Default for TunnelCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: DeserializeOwned, Out> Decoder for TunnelCodec<In, Out> {
    type Item = In;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek at the length without consuming
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        let total_len = 4 + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let payload = src.split_to(length);

        let message = serde_json::from_slice(&payload)?;
        Ok(Some(message))
    }
}

impl<In, Out: Serialize> Encoder<Out> for TunnelCodec<In, Out> {
    type Error = CodecError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;

        if json.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(json.len()));
        }

        dst.reserve(4 + json.len());
        dst.put_u32(json.len() as u32);
        dst.put_slice(&json);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ClientMessage, Protocol, ServerMessage};

    #[test]
    fn test_server_side_codec_directions() {
        // Client writes with the mirrored codec, server reads with its own
        let mut client = TunnelCodec::<ServerMessage, ClientMessage>::new();
        let mut server = TunnelCodec::<ClientMessage, ServerMessage>::new();

        let mut buf = BytesMut::new();
        client
            .encode(
                ClientMessage::ReqTunnel {
                    req_id: "1".to_string(),
                    protocol: Protocol::Http,
                    hostname: None,
                    subdomain: Some("foo".to_string()),
                    remote_port: None,
                    local_addr: "127.0.0.1:3000".to_string(),
                },
                &mut buf,
            )
            .unwrap();

        match server.decode(&mut buf).unwrap().unwrap() {
            ClientMessage::ReqTunnel { subdomain, protocol, .. } => {
                assert_eq!(subdomain.as_deref(), Some("foo"));
                assert_eq!(protocol, Protocol::Http);
            }
            _ => panic!("Wrong variant"),
        }

        server.encode(ServerMessage::ReqProxy, &mut buf).unwrap();
        assert!(matches!(
            client.decode(&mut buf).unwrap(),
            Some(ServerMessage::ReqProxy)
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = TunnelCodec::<ClientMessage>::new();

        let mut buf = BytesMut::new();
        codec
            .encode(
                ClientMessage::Auth {
                    client_id: "aa:bb:cc".to_string(),
                    version: "2".to_string(),
                    user: None,
                },
                &mut buf,
            )
            .unwrap();

        let full_len = buf.len();
        let mut partial = buf.split_to(full_len / 2);

        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);

        match codec.decode(&mut partial).unwrap().unwrap() {
            ClientMessage::Auth { client_id, .. } => assert_eq!(client_id, "aa:bb:cc"),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = TunnelCodec::<ClientMessage>::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_garbage_payload_is_json_error() {
        let mut codec = TunnelCodec::<ClientMessage>::new();
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_slice(b"hello");

        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Json(_))));
    }
}
