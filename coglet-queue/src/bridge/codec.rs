//! Framed codec for worker communication.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, etc).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames above this size are rejected in both directions.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Codec that frames messages with a 4-byte length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        // Must not be shipped over IPC: WorkerTracingLayer drops this target,
        // otherwise encoding a WorkerLog would log, which would encode a WorkerLog...
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{WorkerMessage, WorkerRequest};
    use serde_json::json;

    #[test]
    fn decodes_request_encoded_by_same_codec() {
        let mut codec = JsonCodec::<WorkerRequest>::new();
        let mut buf = BytesMut::new();

        let req = WorkerRequest::Predict {
            id: "p1".to_string(),
            input: json!({"num": 3}),
        };
        codec.encode(req.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(req));
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_has_big_endian_length_prefix() {
        let mut codec = JsonCodec::<WorkerRequest>::new();
        let mut buf = BytesMut::new();
        codec.encode(WorkerRequest::Shutdown, &mut buf).unwrap();

        let body = br#"{"type":"shutdown"}"#;
        assert_eq!(&buf[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&buf[4..], body);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<WorkerMessage>::new();
        let mut full = BytesMut::new();
        codec
            .encode(
                WorkerMessage::CancelAck {
                    id: "p1".to_string(),
                },
                &mut full,
            )
            .unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 3..]);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(WorkerMessage::CancelAck {
                id: "p1".to_string()
            })
        );
    }

    #[test]
    fn invalid_json_is_invalid_data() {
        let mut codec = JsonCodec::<WorkerMessage>::new();
        let mut buf = BytesMut::new();
        let body = b"not json";
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(body);

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = JsonCodec::<WorkerMessage>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&((MAX_FRAME_LENGTH + 1) as u32).to_be_bytes());

        assert!(codec.decode(&mut buf).is_err());
    }
}
