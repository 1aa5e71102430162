//! Passive HTTP/2 frame decoding for one bidirectional TCP flow.
//!
//! This is a capture-side decoder, not a protocol implementation: it walks
//! frames, tracks header blocks well enough to recover `:path`/`:status`,
//! and peels length-prefixed RPC messages out of DATA frames. Flow control,
//! settings and priorities are skipped over.

use std::sync::RwLock;

use hashbrown::HashMap;
use log::{debug, warn};

use crate::capture::Direction;

/// The fixed client connection preface.
pub const CLIENT_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

/// A schema payload recovered from a DATA frame, not yet typed.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// HTTP/2 stream id within the flow
    pub stream_id: u32,
    /// Request path the stream was opened with
    pub path: String,
    /// Taken from which side of the stream the bytes appeared on
    pub direction: Direction,
    /// Inner message bytes, compression flag and length prefix stripped
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct StreamState {
    path: String,
    /// `true` when `:path` was seen on the flow's forward direction
    request_forward: bool,
    /// Partially accumulated RPC bytes, per direction
    request_buf: Vec<u8>,
    response_buf: Vec<u8>,
}

/// Decoder state for one direction of the flow.
struct DirectionState {
    preface_checked: bool,
    buf: Vec<u8>,
    hpack: hpack::Decoder<'static>,
    /// Header-block fragments accumulated until END_HEADERS
    continuation: Option<(u32, Vec<u8>)>,
}

impl DirectionState {
    fn new() -> Self {
        Self {
            preface_checked: false,
            buf: Vec::new(),
            hpack: hpack::Decoder::new(),
            continuation: None,
        }
    }
}

/// Frame decoder for one bidirectional flow.
///
/// The stream → path map is shared behind a read/write lock: flows can be
/// decoded concurrently and both directions of a flow consult the map.
pub struct Http2FlowDecoder {
    forward: DirectionState,
    reverse: DirectionState,
    streams: RwLock<HashMap<u32, StreamState>>,
}

impl Default for Http2FlowDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Http2FlowDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            forward: DirectionState::new(),
            reverse: DirectionState::new(),
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Feeds contiguous bytes of one direction, pushing every completed
    /// message to `out`.
    pub fn feed(&mut self, forward: bool, data: &[u8], out: &mut Vec<RawMessage>) {
        let (state, streams) = if forward {
            (&mut self.forward, &self.streams)
        } else {
            (&mut self.reverse, &self.streams)
        };
        state.buf.extend_from_slice(data);

        loop {
            if !state.preface_checked {
                if state.buf.len() < CLIENT_PREFACE.len() && CLIENT_PREFACE.starts_with(&state.buf)
                {
                    // Could still become the preface, wait for more bytes.
                    return;
                }
                if state.buf.starts_with(CLIENT_PREFACE) {
                    state.buf.drain(..CLIENT_PREFACE.len());
                }
                state.preface_checked = true;
            }

            if state.buf.len() < 9 {
                return;
            }
            let length =
                usize::from(state.buf[0]) << 16 | usize::from(state.buf[1]) << 8 | usize::from(state.buf[2]);
            let typ = state.buf[3];
            let flags = state.buf[4];
            let stream_id =
                u32::from_be_bytes([state.buf[5], state.buf[6], state.buf[7], state.buf[8]])
                    & 0x7fff_ffff;
            if state.buf.len() < 9 + length {
                return;
            }
            let payload: Vec<u8> = state.buf[9..9 + length].to_vec();
            state.buf.drain(..9 + length);

            match typ {
                FRAME_HEADERS => {
                    let Some(fragment) = strip_headers_padding(&payload, flags) else {
                        warn!("malformed HEADERS frame on stream {stream_id}, skipped");
                        continue;
                    };
                    if flags & FLAG_END_HEADERS != 0 {
                        on_header_block(state, streams, forward, stream_id, &fragment);
                    } else {
                        state.continuation = Some((stream_id, fragment));
                    }
                }
                FRAME_CONTINUATION => match &mut state.continuation {
                    Some((id, fragment)) if *id == stream_id => {
                        fragment.extend_from_slice(&payload);
                        if flags & FLAG_END_HEADERS != 0 {
                            let (id, fragment) = state.continuation.take().unwrap();
                            on_header_block(state, streams, forward, id, &fragment);
                        }
                    }
                    _ => debug!("stray CONTINUATION on stream {stream_id}, dropped"),
                },
                FRAME_DATA => {
                    let Some(data) = strip_data_padding(&payload, flags) else {
                        warn!("malformed DATA frame on stream {stream_id}, skipped");
                        continue;
                    };
                    on_data(streams, forward, stream_id, &data, out);
                }
                // SETTINGS, PING, WINDOW_UPDATE, GOAWAY, RST_STREAM,
                // PRIORITY, PUSH_PROMISE: nothing in them for us.
                _ => {}
            }
        }
    }
}

fn on_header_block(
    state: &mut DirectionState,
    streams: &RwLock<HashMap<u32, StreamState>>,
    forward: bool,
    stream_id: u32,
    fragment: &[u8],
) {
    let headers = match state.hpack.decode(fragment) {
        Ok(headers) => headers,
        Err(err) => {
            warn!("HPACK decode failed on stream {stream_id}: {err:?}");
            return;
        }
    };

    for (name, value) in &headers {
        if name.as_slice() == b":path" {
            let path = String::from_utf8_lossy(value).into_owned();
            debug!("stream {stream_id} opened for {path}");
            let mut streams = streams.write().unwrap();
            let entry = streams.entry(stream_id).or_default();
            entry.path = path;
            entry.request_forward = forward;
        }
        // A `:status` pseudo-header confirms the stream answered; the
        // response payload is attributed by direction below.
    }
}

fn on_data(
    streams: &RwLock<HashMap<u32, StreamState>>,
    forward: bool,
    stream_id: u32,
    data: &[u8],
    out: &mut Vec<RawMessage>,
) {
    {
        let mut streams = streams.write().unwrap();
        let Some(stream) = streams.get_mut(&stream_id) else {
            debug!("DATA for unknown stream {stream_id}, dropped");
            return;
        };

        let direction = if forward == stream.request_forward {
            Direction::Request
        } else {
            Direction::Response
        };
        let buf = match direction {
            Direction::Request => &mut stream.request_buf,
            Direction::Response => &mut stream.response_buf,
        };
        buf.extend_from_slice(data);

        // An RPC message is [compressed: u8][length: u32 BE][payload]; it
        // may span DATA frames, and a DATA frame may hold several.
        while buf.len() >= 5 {
            let compressed = buf[0] == 1;
            let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
            if buf.len() < 5 + length {
                break;
            }
            if compressed {
                warn!(
                    "compressed payload on stream {stream_id} ({}), dropped",
                    stream.path
                );
            } else if length > 0 {
                out.push(RawMessage {
                    stream_id,
                    path: stream.path.clone(),
                    direction,
                    payload: buf[5..5 + length].to_vec(),
                });
            }
            buf.drain(..5 + length);
        }
    }
}

/// Strips pad length and priority fields off a HEADERS payload.
fn strip_headers_padding(payload: &[u8], flags: u8) -> Option<Vec<u8>> {
    let mut start = 0;
    let mut end = payload.len();
    if flags & FLAG_PADDED != 0 {
        let pad = usize::from(*payload.first()?);
        start += 1;
        end = end.checked_sub(pad)?;
    }
    if flags & FLAG_PRIORITY != 0 {
        start += 5;
    }
    (start <= end).then(|| payload[start..end].to_vec())
}

fn strip_data_padding(payload: &[u8], flags: u8) -> Option<Vec<u8>> {
    if flags & FLAG_PADDED != 0 {
        let pad = usize::from(*payload.first()?);
        let end = payload.len().checked_sub(pad)?;
        (1 <= end).then(|| payload[1..end].to_vec())
    } else {
        Some(payload.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(typ: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + payload.len());
        let len = payload.len() as u32;
        out.extend_from_slice(&len.to_be_bytes()[1..]);
        out.push(typ);
        out.push(flags);
        out.extend_from_slice(&stream_id.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn headers_frame(stream_id: u32, headers: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut encoder = hpack::Encoder::new();
        let block = encoder.encode(headers.iter().copied());
        frame(FRAME_HEADERS, FLAG_END_HEADERS, stream_id, &block)
    }

    fn grpc_data_frame(stream_id: u32, inner: &[u8]) -> Vec<u8> {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&(inner.len() as u32).to_be_bytes());
        payload.extend_from_slice(inner);
        frame(FRAME_DATA, 0, stream_id, &payload)
    }

    #[test]
    fn request_and_response_are_attributed_by_direction() {
        let mut decoder = Http2FlowDecoder::new();
        let mut out = Vec::new();

        let mut fwd = CLIENT_PREFACE.to_vec();
        fwd.extend_from_slice(&headers_frame(1, &[(b":path", b"/pkg.Svc/Hello")]));
        fwd.extend_from_slice(&grpc_data_frame(1, b"\x0a\x02hi"));
        decoder.feed(true, &fwd, &mut out);

        let mut rev = headers_frame(1, &[(b":status", b"200")]);
        rev.extend_from_slice(&grpc_data_frame(1, b"\x0a\x02ok"));
        decoder.feed(false, &rev, &mut out);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].direction, Direction::Request);
        assert_eq!(out[0].path, "/pkg.Svc/Hello");
        assert_eq!(out[0].payload, b"\x0a\x02hi");
        assert_eq!(out[1].direction, Direction::Response);
        assert_eq!(out[1].stream_id, 1);
        assert_eq!(out[1].payload, b"\x0a\x02ok");
    }

    #[test]
    fn message_split_across_data_frames_is_reassembled() {
        let mut decoder = Http2FlowDecoder::new();
        let mut out = Vec::new();

        let inner = b"\x0a\x06Jeremy";
        let mut whole = vec![0u8];
        whole.extend_from_slice(&(inner.len() as u32).to_be_bytes());
        whole.extend_from_slice(inner);
        let (first, second) = whole.split_at(4);

        let mut fwd = headers_frame(3, &[(b":path", b"/pkg.Svc/Hello")]);
        fwd.extend_from_slice(&frame(FRAME_DATA, 0, 3, first));
        decoder.feed(true, &fwd, &mut out);
        assert!(out.is_empty());

        decoder.feed(true, &frame(FRAME_DATA, 0, 3, second), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, inner);
    }

    #[test]
    fn unknown_stream_and_compressed_payloads_are_dropped() {
        let mut decoder = Http2FlowDecoder::new();
        let mut out = Vec::new();

        decoder.feed(true, &grpc_data_frame(7, b"zz"), &mut out);
        assert!(out.is_empty());

        let mut fwd = headers_frame(1, &[(b":path", b"/pkg.Svc/Hello")]);
        let mut compressed = vec![1u8];
        compressed.extend_from_slice(&2u32.to_be_bytes());
        compressed.extend_from_slice(b"zz");
        fwd.extend_from_slice(&frame(FRAME_DATA, 0, 1, &compressed));
        decoder.feed(true, &fwd, &mut out);
        assert!(out.is_empty());

        // Empty payloads never surface either.
        decoder.feed(true, &grpc_data_frame(1, b""), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn continuation_frames_complete_the_header_block() {
        let mut decoder = Http2FlowDecoder::new();
        let mut out = Vec::new();

        let mut encoder = hpack::Encoder::new();
        let block = encoder.encode([(b":path".as_slice(), b"/pkg.Svc/Hello".as_slice())]);
        let (first, second) = block.split_at(block.len() / 2);

        let mut fwd = frame(FRAME_HEADERS, 0, 5, first);
        fwd.extend_from_slice(&frame(FRAME_CONTINUATION, FLAG_END_HEADERS, 5, second));
        fwd.extend_from_slice(&grpc_data_frame(5, b"\x0a\x01x"));
        decoder.feed(true, &fwd, &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, "/pkg.Svc/Hello");
    }
}
