//! Corpus synthesis from a packet capture: pcap → TCP flows → HTTP/2
//! frames → schema-typed messages.

pub mod http2;
pub mod stream;

use std::{
    fs::File,
    net::IpAddr,
    path::Path,
};

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use hashbrown::HashMap;
use log::{debug, info, warn};
use pcap_parser::{traits::PcapReaderIterator, LegacyPcapReader, Linktype, PcapBlockOwned, PcapError};
use prost_reflect::MessageDescriptor;

use crate::{
    capture::{http2::Http2FlowDecoder, http2::RawMessage, stream::TcpReassembler},
    schema::SchemaSet,
    Error,
};

/// Flows with no traffic for this long get dropped mid-decode.
const FLOW_IDLE_SECS: u32 = 120;
/// How often idle flows are swept.
const FLOW_SWEEP_SECS: u32 = 60;

/// Which side of a stream a message appeared on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    /// Sent towards the service
    Request,
    /// Sent back by the service
    Response,
}

/// A captured message, re-typed against the schema set.
///
/// Immutable once emitted; the payload is the raw bytes of the inner
/// message, with transport framing and the compression prefix stripped.
#[derive(Debug, Clone)]
pub struct TypedMessage {
    /// Request path of the stream that carried the message
    pub path: String,
    /// Request or response side
    pub direction: Direction,
    /// HTTP/2 stream id, for request/response pairing
    pub stream_id: u32,
    /// Descriptor of the payload's message type
    pub schema: MessageDescriptor,
    /// Raw inner message bytes
    pub payload: Vec<u8>,
}

type Endpoint = (IpAddr, u16);

struct Flow {
    /// Endpoint the first-seen packet came from; that side is "forward"
    forward_from: Endpoint,
    forward_asm: TcpReassembler,
    reverse_asm: TcpReassembler,
    decoder: Http2FlowDecoder,
    last_seen: u32,
}

enum LinkKind {
    Ethernet,
    Raw,
    Null,
}

/// Decodes a capture into the ordered message list the fuzzer seeds from.
///
/// Undecodable packets and frames are skipped with a log line; only an
/// unreadable capture or an uncompilable schema set is fatal.
pub fn decode(capture_path: &Path, schemas: &SchemaSet) -> Result<Vec<TypedMessage>, Error> {
    let raw = read_capture(capture_path)?;
    info!("capture yielded {} raw messages", raw.len());

    let mut out = Vec::new();
    for msg in raw {
        let Some(method) = schemas.find_method(&msg.path) else {
            debug!("no schema method for {}, message dropped", msg.path);
            continue;
        };
        let descriptor = match msg.direction {
            Direction::Request => method.input(),
            Direction::Response => method.output(),
        };
        match schemas.decode(&descriptor, &msg.payload) {
            Ok(_) => out.push(TypedMessage {
                path: msg.path,
                direction: msg.direction,
                stream_id: msg.stream_id,
                schema: descriptor,
                payload: msg.payload,
            }),
            Err(err) => {
                warn!("payload on {} does not decode ({err}), dropped", msg.path);
            }
        }
    }
    Ok(out)
}

fn read_capture(capture_path: &Path) -> Result<Vec<RawMessage>, Error> {
    let file = File::open(capture_path)
        .map_err(|err| Error::BadCapture(format!("{}: {err}", capture_path.display())))?;
    let mut reader = LegacyPcapReader::new(65536, file)
        .map_err(|err| Error::BadCapture(format!("{err:?}")))?;

    let mut link: Option<LinkKind> = None;
    let mut flows: HashMap<(Endpoint, Endpoint), Flow> = HashMap::new();
    let mut out = Vec::new();
    let mut last_sweep = 0u32;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                match block {
                    PcapBlockOwned::LegacyHeader(hdr) => {
                        link = Some(match hdr.network {
                            Linktype::ETHERNET => LinkKind::Ethernet,
                            Linktype::RAW | Linktype::IPV4 | Linktype::IPV6 => LinkKind::Raw,
                            Linktype::NULL => LinkKind::Null,
                            other => {
                                return Err(Error::BadCapture(format!(
                                    "unsupported link type {other:?}"
                                )))
                            }
                        });
                    }
                    PcapBlockOwned::Legacy(pkt) => {
                        if let Some(link) = &link {
                            handle_packet(link, pkt.ts_sec, pkt.data, &mut flows, &mut out);
                        }
                        if pkt.ts_sec.saturating_sub(last_sweep) >= FLOW_SWEEP_SECS {
                            last_sweep = pkt.ts_sec;
                            sweep_idle_flows(pkt.ts_sec, &mut flows);
                        }
                    }
                    PcapBlockOwned::NG(_) => {
                        return Err(Error::BadCapture(
                            "pcapng captures are not supported".to_string(),
                        ))
                    }
                }
                reader.consume(offset);
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|err| Error::BadCapture(format!("{err:?}")))?;
            }
            Err(err) => return Err(Error::BadCapture(format!("{err:?}"))),
        }
    }

    Ok(out)
}

fn handle_packet(
    link: &LinkKind,
    ts_sec: u32,
    data: &[u8],
    flows: &mut HashMap<(Endpoint, Endpoint), Flow>,
    out: &mut Vec<RawMessage>,
) {
    let sliced = match link {
        LinkKind::Ethernet => SlicedPacket::from_ethernet(data),
        LinkKind::Raw => SlicedPacket::from_ip(data),
        LinkKind::Null => {
            if data.len() < 4 {
                return;
            }
            SlicedPacket::from_ip(&data[4..])
        }
    };
    let sliced = match sliced {
        Ok(sliced) => sliced,
        Err(_) => return,
    };

    let Some(TransportSlice::Tcp(tcp)) = &sliced.transport else {
        return;
    };
    let (src_ip, dst_ip): (IpAddr, IpAddr) = match &sliced.net {
        Some(NetSlice::Ipv4(v4)) => (
            v4.header().source_addr().into(),
            v4.header().destination_addr().into(),
        ),
        Some(NetSlice::Ipv6(v6)) => (
            v6.header().source_addr().into(),
            v6.header().destination_addr().into(),
        ),
        _ => return,
    };

    let src: Endpoint = (src_ip, tcp.source_port());
    let dst: Endpoint = (dst_ip, tcp.destination_port());
    let key = if src <= dst { (src, dst) } else { (dst, src) };

    let flow = flows.entry(key).or_insert_with(|| Flow {
        forward_from: src,
        forward_asm: TcpReassembler::new(),
        reverse_asm: TcpReassembler::new(),
        decoder: Http2FlowDecoder::new(),
        last_seen: ts_sec,
    });
    flow.last_seen = ts_sec;

    let forward = flow.forward_from == src;
    let asm = if forward {
        &mut flow.forward_asm
    } else {
        &mut flow.reverse_asm
    };
    let contiguous = asm.push(tcp.sequence_number(), tcp.syn(), tcp.payload());
    if !contiguous.is_empty() {
        flow.decoder.feed(forward, &contiguous, out);
    }
}

fn sweep_idle_flows(now: u32, flows: &mut HashMap<(Endpoint, Endpoint), Flow>) {
    flows.retain(|_, flow| {
        let keep = now.saturating_sub(flow.last_seen) < FLOW_IDLE_SECS;
        if !keep {
            let parked = flow.forward_asm.pending_bytes() + flow.reverse_asm.pending_bytes();
            if parked > 0 {
                warn!("flushing idle flow with {parked} undelivered bytes");
            }
        }
        keep
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::testutil::{compile_schema, HELLO_PROTO};
    use etherparse::PacketBuilder;
    use std::io::Write;

    fn h2_frame(typ: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
        out.push(typ);
        out.push(flags);
        out.extend_from_slice(&stream_id.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn headers(stream_id: u32, pairs: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut encoder = hpack::Encoder::new();
        let block = encoder.encode(pairs.iter().copied());
        h2_frame(0x1, 0x4, stream_id, &block)
    }

    fn grpc_data(stream_id: u32, inner: &[u8]) -> Vec<u8> {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&(inner.len() as u32).to_be_bytes());
        payload.extend_from_slice(inner);
        h2_frame(0x0, 0x0, stream_id, &payload)
    }

    fn tcp_packet(client_to_server: bool, seq: u32, payload: &[u8]) -> Vec<u8> {
        tcp_packet_from(40000, client_to_server, seq, payload)
    }

    fn tcp_packet_from(client_port: u16, client_to_server: bool, seq: u32, payload: &[u8]) -> Vec<u8> {
        let (src_ip, dst_ip, src_port, dst_port) = if client_to_server {
            ([10, 0, 0, 1], [10, 0, 0, 2], client_port, 50051)
        } else {
            ([10, 0, 0, 2], [10, 0, 0, 1], 50051, client_port)
        };
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv4(src_ip, dst_ip, 64)
            .tcp(src_port, dst_port, seq, 65535);
        let mut packet = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut packet, payload).unwrap();
        packet
    }

    fn pcap_file(packets: &[Vec<u8>]) -> tempfile::NamedTempFile {
        let timed: Vec<(u32, Vec<u8>)> = packets
            .iter()
            .enumerate()
            .map(|(i, pkt)| (i as u32, pkt.clone()))
            .collect();
        pcap_file_timed(&timed)
    }

    fn pcap_file_timed(packets: &[(u32, Vec<u8>)]) -> tempfile::NamedTempFile {
        let mut out = Vec::new();
        out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&65535u32.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        for (ts, pkt) in packets {
            out.extend_from_slice(&ts.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&(pkt.len() as u32).to_le_bytes());
            out.extend_from_slice(&(pkt.len() as u32).to_le_bytes());
            out.extend_from_slice(pkt);
        }
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&out).unwrap();
        file
    }

    #[test]
    fn full_exchange_is_decoded_and_typed() {
        let schemas = compile_schema(HELLO_PROTO);

        // name: "Jeremy"
        let request_payload = b"\x0a\x06\x4a\x65\x72\x65\x6d\x79";
        // message: "hello"
        let response_payload = b"\x0a\x05hello";

        let mut c2s = http2::CLIENT_PREFACE.to_vec();
        c2s.extend_from_slice(&headers(1, &[(b":path", b"/pkg.Svc/Hello")]));
        c2s.extend_from_slice(&grpc_data(1, request_payload));

        let mut s2c = headers(1, &[(b":status", b"200")]);
        s2c.extend_from_slice(&grpc_data(1, response_payload));

        let file = pcap_file(&[
            tcp_packet(true, 1000, &c2s),
            tcp_packet(false, 5000, &s2c),
        ]);

        let messages = decode(file.path(), &schemas).unwrap();
        assert_eq!(messages.len(), 2);

        assert_eq!(messages[0].direction, Direction::Request);
        assert_eq!(messages[0].path, "/pkg.Svc/Hello");
        assert_eq!(messages[0].stream_id, 1);
        assert_eq!(messages[0].schema.full_name(), "pkg.HelloRequest");
        assert_eq!(messages[0].payload, request_payload);

        assert_eq!(messages[1].direction, Direction::Response);
        assert_eq!(messages[1].schema.full_name(), "pkg.HelloReply");
        assert_eq!(messages[1].payload, response_payload);
    }

    #[test]
    fn undecodable_payloads_are_skipped_not_fatal() {
        let schemas = compile_schema(HELLO_PROTO);

        let mut c2s = http2::CLIENT_PREFACE.to_vec();
        c2s.extend_from_slice(&headers(1, &[(b":path", b"/pkg.Svc/Hello")]));
        // Field 1 claims 200 bytes of string but the payload ends here.
        c2s.extend_from_slice(&grpc_data(1, b"\x0a\xc8\x01"));
        c2s.extend_from_slice(&grpc_data(1, b"\x0a\x02ok"));

        let file = pcap_file(&[tcp_packet(true, 1, &c2s)]);
        let messages = decode(file.path(), &schemas).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, b"\x0a\x02ok");
    }

    #[test]
    fn idle_flows_are_flushed_after_two_minutes() {
        let schemas = compile_schema(HELLO_PROTO);

        // Flow A starts a message at t=0 but only delivers half of it.
        let inner = b"\x0a\x06Jeremy";
        let mut whole = vec![0u8];
        whole.extend_from_slice(&(inner.len() as u32).to_be_bytes());
        whole.extend_from_slice(inner);
        let (first_half, second_half) = whole.split_at(4);

        let mut a_start = headers(1, &[(b":path", b"/pkg.Svc/Hello")]);
        a_start.extend_from_slice(&h2_frame(0x0, 0x0, 1, first_half));
        let a_rest = h2_frame(0x0, 0x0, 1, second_half);

        // Flow B completes an exchange three minutes later.
        let mut b_whole = headers(1, &[(b":path", b"/pkg.Svc/Hello")]);
        b_whole.extend_from_slice(&grpc_data(1, b"\x0a\x03Bob"));

        let a_first = tcp_packet_from(40000, true, 1000, &a_start);
        let b_pkt = tcp_packet_from(40002, true, 9000, &b_whole);
        let a_second_len = a_start.len() as u32;
        let a_second = tcp_packet_from(40000, true, 1000 + a_second_len, &a_rest);

        let file = pcap_file_timed(&[(0, a_first), (200, b_pkt), (201, a_second)]);
        let messages = decode(file.path(), &schemas).unwrap();

        // Flow A was dropped idle; its late half resolves to nothing.
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, b"\x0a\x03Bob");
    }

    #[test]
    fn garbage_file_is_a_bad_capture() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"this is not a capture").unwrap();
        match decode(file.path(), &compile_schema(HELLO_PROTO)) {
            Err(Error::BadCapture(_)) => {}
            other => panic!("expected BadCapture, got {other:?}"),
        }
    }
}
