//! Sends the mutated wire bytes at the target, exactly as mutated.
//!
//! The codec is a pass-through: what the mutator serialized is what goes
//! on the wire, and the response comes back as raw bytes for the caller
//! to re-type if it cares.

use std::time::Duration;

use bytes::{Buf, BufMut};
use http::uri::PathAndQuery;
use log::debug;
use tonic::{
    client::Grpc,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
    transport::{Channel, Endpoint},
    Code, Status,
};

use crate::Error;

/// Pass-through codec: bytes in, bytes out.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Encode = Vec<u8>;
    type Decode = Vec<u8>;
    type Encoder = RawCodec;
    type Decoder = RawCodec;

    fn encoder(&mut self) -> Self::Encoder {
        RawCodec
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawCodec
    }
}

impl Encoder for RawCodec {
    type Item = Vec<u8>;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

impl Decoder for RawCodec {
    type Item = Vec<u8>;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let mut buf = vec![0u8; src.remaining()];
        src.copy_to_slice(&mut buf);
        Ok(Some(buf))
    }
}

/// Maps a call failure into the fuzzer's error taxonomy.
///
/// Unreachable-target failures surface as `Unavailable`; anything else
/// with a proper code is the target talking back.
#[must_use]
pub fn classify_status(status: &Status) -> Error {
    match status.code() {
        Code::Unavailable => Error::Network(status.message().to_string()),
        Code::Unknown if status.message().contains("transport error") => {
            Error::Network(status.message().to_string())
        }
        _ => Error::RpcStatus(format!("{}: {}", status.code(), status.message())),
    }
}

/// A blocking-call-shaped unary RPC client over a lazily dialed channel.
///
/// The channel is dropped on network failures so the next send re-dials,
/// the way a fresh fuzz iteration against a restarted target needs.
#[derive(Debug)]
pub struct RpcExecutor {
    endpoint_uri: String,
    dial_timeout: Duration,
    channel: Option<Channel>,
}

impl RpcExecutor {
    /// An executor for `host:port`, dialing with the given timeout
    #[must_use]
    pub fn new(host: &str, port: u16, dial_timeout: Duration) -> Self {
        Self {
            endpoint_uri: format!("http://{host}:{port}"),
            dial_timeout,
            channel: None,
        }
    }

    async fn channel(&mut self) -> Result<Channel, Error> {
        if let Some(channel) = &self.channel {
            return Ok(channel.clone());
        }
        let endpoint = Endpoint::from_shared(self.endpoint_uri.clone())
            .map_err(|err| Error::Unknown(format!("bad endpoint: {err}")))?
            .connect_timeout(self.dial_timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|err| Error::Network(format!("dial {}: {err}", self.endpoint_uri)))?;
        debug!("dialed {}", self.endpoint_uri);
        self.channel = Some(channel.clone());
        Ok(channel)
    }

    /// Sends the payload to the given request path, unary.
    ///
    /// Returns the raw response bytes, or an error already classified
    /// into network / RPC-status / unknown.
    pub async fn send(&mut self, path: &str, payload: Vec<u8>) -> Result<Vec<u8>, Error> {
        let path_and_query: PathAndQuery = normalize_path(path)
            .parse()
            .map_err(|err| Error::Unknown(format!("bad path {path}: {err}")))?;

        let channel = self.channel().await?;
        let mut grpc = Grpc::new(channel);
        if let Err(err) = grpc.ready().await {
            self.channel = None;
            return Err(Error::Network(format!("service not ready: {err}")));
        }

        match grpc
            .unary(tonic::Request::new(payload), path_and_query, RawCodec)
            .await
        {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => {
                let err = classify_status(&status);
                if matches!(err, Error::Network(_)) {
                    self.channel = None;
                }
                Err(err)
            }
        }
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_a_network_error() {
        let status = Status::unavailable("connection refused");
        assert!(matches!(classify_status(&status), Error::Network(_)));
    }

    #[test]
    fn proper_status_codes_are_rpc_errors() {
        let status = Status::invalid_argument("bad field");
        match classify_status(&status) {
            Error::RpcStatus(msg) => assert!(msg.contains("bad field")),
            other => panic!("expected RpcStatus, got {other:?}"),
        }
    }

    #[test]
    fn paths_are_rooted() {
        assert_eq!(normalize_path("pkg.Svc/Hello"), "/pkg.Svc/Hello");
        assert_eq!(normalize_path("/pkg.Svc/Hello"), "/pkg.Svc/Hello");
    }

    #[tokio::test]
    async fn unreachable_target_classifies_as_network() {
        // Nothing listens on this port.
        let mut exec = RpcExecutor::new("127.0.0.1", 1, Duration::from_millis(200));
        match exec.send("/pkg.Svc/Hello", vec![1, 2, 3]).await {
            Err(Error::Network(_)) => {}
            other => panic!("expected Network, got {other:?}"),
        }
    }
}
