//! # RPC-over-HTTP Packet Framing
//!
//! Grounded in Wine's `RPCRT4_BuildHttpHeader`/`RPCRT4_BuildHttpFlowControlHeader`
//! and the receive-side demux at the bottom of `rpcrt4_ncacn_http_receive_fragment`
//! (`dlls/rpcrt4/rpc_transport.c`): every frame on an RPC-over-HTTP virtual pipe
//! carries a common header plus an HTTP-specific header with a `flags` word.
//! `flags == 0x0001` marks a keepalive idle packet (no payload, discarded by
//! the reader); `flags == 0x0002` marks a flow-control report (bytes
//! transmitted, the increment to apply, and the pipe this report is about);
//! any other value is a protocol error. Ordinary RPC payload frames carry
//! `flags == 0x0000`.

use crate::error::{Result, TransportError};
use uuid::Uuid;

pub const HTTP_FLAG_NONE: u16 = 0x0000;
pub const HTTP_FLAG_IDLE: u16 = 0x0001;
pub const HTTP_FLAG_FLOW_CONTROL: u16 = 0x0002;

/// Flag values for the one-time virtual-pipe preparation handshake (the
/// connect header each pipe writes first, and the two protocol packets the
/// server answers the OUT pipe with). These values are this transport's own
/// invention for that phase — they never appear outside the handshake and
/// are never compared against an external registry.
pub const HTTP_FLAG_CONNECT: u16 = 0x0003;
pub const HTTP_FLAG_PREPARE_1: u16 = 0x0010;
pub const HTTP_FLAG_PREPARE_2: u16 = 0x0011;

/// Sentinel `ptype` this transport uses on the wire to mark a frame as one
/// of its own control packets (idle/flow-control) rather than an opaque RPC
/// PDU handed to it by the caller. Picking a concrete numeric value only
/// matters for this transport's own round-trip self-consistency, never
/// against an external registry.
pub const PKT_HTTP: u8 = 0x14;

pub const COMMON_HEADER_LEN: usize = 16;

/// The 16-byte DCE common header every PDU (ours or the caller's) starts
/// with, enough of it for this layer to tell its own control frames apart
/// from opaque RPC payload frames sharing the same virtual pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DceCommonHeader {
    pub rpc_vers: u8,
    pub rpc_vers_minor: u8,
    pub ptype: u8,
    pub pfc_flags: u8,
    pub packed_drep: [u8; 4],
    pub frag_len: u16,
    pub auth_len: u16,
    pub call_id: u32,
}

impl DceCommonHeader {
    pub fn control(body_len: usize) -> Self {
        Self {
            rpc_vers: 5,
            rpc_vers_minor: 0,
            ptype: PKT_HTTP,
            pfc_flags: 0,
            packed_drep: [0x10, 0, 0, 0], // NDR_LOCAL_DATA_REPRESENTATION
            frag_len: (COMMON_HEADER_LEN + body_len) as u16,
            auth_len: 0,
            call_id: 0,
        }
    }

    pub fn encode(&self) -> [u8; COMMON_HEADER_LEN] {
        let mut out = [0u8; COMMON_HEADER_LEN];
        out[0] = self.rpc_vers;
        out[1] = self.rpc_vers_minor;
        out[2] = self.ptype;
        out[3] = self.pfc_flags;
        out[4..8].copy_from_slice(&self.packed_drep);
        out[8..10].copy_from_slice(&self.frag_len.to_le_bytes());
        out[10..12].copy_from_slice(&self.auth_len.to_le_bytes());
        out[12..16].copy_from_slice(&self.call_id.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8; COMMON_HEADER_LEN]) -> Self {
        Self {
            rpc_vers: data[0],
            rpc_vers_minor: data[1],
            ptype: data[2],
            pfc_flags: data[3],
            packed_drep: [data[4], data[5], data[6], data[7]],
            frag_len: u16::from_le_bytes([data[8], data[9]]),
            auth_len: u16::from_le_bytes([data[10], data[11]]),
            call_id: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
        }
    }
}

/// Frame a control [`HttpPacket`] (idle or flow-control) with its common
/// header, ready to write to the IN channel.
pub fn frame_control_packet(packet: &HttpPacket) -> Vec<u8> {
    let body = packet.encode();
    let header = DceCommonHeader::control(body.len());
    let mut out = Vec::with_capacity(COMMON_HEADER_LEN + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&body);
    out
}

/// A fully framed packet ready for the wire, or as parsed off it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpPacket {
    /// Ordinary RPC PDU payload, passed through untouched.
    Data(Vec<u8>),
    /// Keepalive packet sent by the server every `HTTP_IDLE_TIME` of
    /// inactivity on the IN channel; carries no data items.
    Idle,
    /// Flow-control report: how many bytes the sender has relayed, how much
    /// to raise the receive window by, and which virtual pipe this is about.
    FlowControl {
        bytes_transmitted: u32,
        flow_control_increment: u32,
        pipe_uuid: Uuid,
    },
    /// The one-shot packet each pipe writes as the first bytes of its
    /// request body, telling the server which connection/pipe/association
    /// this HTTP request carries. `association_uuid` is only ever set on
    /// the IN pipe's connect header.
    Connect {
        is_out_pipe: bool,
        connection_uuid: Uuid,
        pipe_uuid: Uuid,
        association_uuid: Option<Uuid>,
    },
    /// First of the two protocol packets the server answers the OUT pipe's
    /// connect header with. The carried field is traced and otherwise
    /// unused.
    Prepare1 { value: u32 },
    /// Second of the two protocol packets; carries the real flow-control
    /// increment the OUT channel's [`FlowControlTracker`] should use for the
    /// rest of the session.
    Prepare2 {
        field1: u32,
        flow_control_increment: u32,
        field3: u32,
    },
}

const HEADER_LEN: usize = 4; // flags: u16 LE, num_data_items: u16 LE
const FLOW_CONTROL_BODY_LEN: usize = 4 + 4 + 16; // bytes_transmitted, increment, uuid
const CONNECT_BODY_LEN: usize = 4 + 16 + 16; // is_out_pipe (padded to 4), connection_uuid, pipe_uuid
const CONNECT_ASSOCIATION_LEN: usize = 16;
const PREPARE_1_BODY_LEN: usize = 4;
const PREPARE_2_BODY_LEN: usize = 4 + 4 + 4;

fn write_header(out: &mut Vec<u8>, flags: u16, num_data_items: u16) {
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&num_data_items.to_le_bytes());
}

impl HttpPacket {
    /// Serialize into the bytes that follow the outer PDU's common header on
    /// the wire (the HTTP-specific portion only — the caller's framing layer
    /// owns `ptype`/`frag_len`).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            HttpPacket::Data(payload) => {
                write_header(&mut out, HTTP_FLAG_NONE, 0);
                out.extend_from_slice(payload);
            }
            HttpPacket::Idle => {
                write_header(&mut out, HTTP_FLAG_IDLE, 0);
            }
            HttpPacket::FlowControl {
                bytes_transmitted,
                flow_control_increment,
                pipe_uuid,
            } => {
                write_header(&mut out, HTTP_FLAG_FLOW_CONTROL, 1);
                out.extend_from_slice(&bytes_transmitted.to_le_bytes());
                out.extend_from_slice(&flow_control_increment.to_le_bytes());
                out.extend_from_slice(pipe_uuid.as_bytes());
            }
            HttpPacket::Connect {
                is_out_pipe,
                connection_uuid,
                pipe_uuid,
                association_uuid,
            } => {
                write_header(&mut out, HTTP_FLAG_CONNECT, if association_uuid.is_some() { 3 } else { 2 });
                out.push(if *is_out_pipe { 1 } else { 0 });
                out.extend_from_slice(&[0u8; 3]);
                out.extend_from_slice(connection_uuid.as_bytes());
                out.extend_from_slice(pipe_uuid.as_bytes());
                if let Some(assoc) = association_uuid {
                    out.extend_from_slice(assoc.as_bytes());
                }
            }
            HttpPacket::Prepare1 { value } => {
                write_header(&mut out, HTTP_FLAG_PREPARE_1, 1);
                out.extend_from_slice(&value.to_le_bytes());
            }
            HttpPacket::Prepare2 {
                field1,
                flow_control_increment,
                field3,
            } => {
                write_header(&mut out, HTTP_FLAG_PREPARE_2, 3);
                out.extend_from_slice(&field1.to_le_bytes());
                out.extend_from_slice(&flow_control_increment.to_le_bytes());
                out.extend_from_slice(&field3.to_le_bytes());
            }
        }
        out
    }

    /// Parse the HTTP-specific portion of a frame given its flags/
    /// num_data_items header plus whatever body bytes followed it.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(TransportError::ProtocolError(
                "http packet shorter than its header".into(),
            ));
        }
        let flags = u16::from_le_bytes([data[0], data[1]]);
        let num_data_items = u16::from_le_bytes([data[2], data[3]]);
        let body = &data[HEADER_LEN..];

        match flags {
            HTTP_FLAG_NONE => Ok(HttpPacket::Data(body.to_vec())),
            HTTP_FLAG_IDLE => {
                if num_data_items != 0 {
                    return Err(TransportError::ProtocolError(format!(
                        "http idle packet should have no data items, got {}",
                        num_data_items
                    )));
                }
                Ok(HttpPacket::Idle)
            }
            HTTP_FLAG_FLOW_CONTROL => {
                if body.len() < FLOW_CONTROL_BODY_LEN {
                    return Err(TransportError::ProtocolError(
                        "truncated http flow control packet".into(),
                    ));
                }
                let bytes_transmitted = u32::from_le_bytes(body[0..4].try_into().unwrap());
                let flow_control_increment = u32::from_le_bytes(body[4..8].try_into().unwrap());
                let pipe_uuid =
                    Uuid::from_slice(&body[8..24]).map_err(|_| TransportError::ProtocolError(
                        "malformed pipe uuid in flow control packet".into(),
                    ))?;
                Ok(HttpPacket::FlowControl {
                    bytes_transmitted,
                    flow_control_increment,
                    pipe_uuid,
                })
            }
            HTTP_FLAG_CONNECT => {
                if body.len() < CONNECT_BODY_LEN {
                    return Err(TransportError::ProtocolError(
                        "truncated http connect packet".into(),
                    ));
                }
                let is_out_pipe = body[0] != 0;
                let connection_uuid = Uuid::from_slice(&body[4..20]).map_err(|_| {
                    TransportError::ProtocolError("malformed connection uuid in connect packet".into())
                })?;
                let pipe_uuid = Uuid::from_slice(&body[20..36]).map_err(|_| {
                    TransportError::ProtocolError("malformed pipe uuid in connect packet".into())
                })?;
                let association_uuid = if num_data_items >= 3 {
                    if body.len() < CONNECT_BODY_LEN + CONNECT_ASSOCIATION_LEN {
                        return Err(TransportError::ProtocolError(
                            "connect packet missing association uuid".into(),
                        ));
                    }
                    Some(Uuid::from_slice(&body[36..52]).map_err(|_| {
                        TransportError::ProtocolError("malformed association uuid in connect packet".into())
                    })?)
                } else {
                    None
                };
                Ok(HttpPacket::Connect {
                    is_out_pipe,
                    connection_uuid,
                    pipe_uuid,
                    association_uuid,
                })
            }
            HTTP_FLAG_PREPARE_1 => {
                if body.len() < PREPARE_1_BODY_LEN {
                    return Err(TransportError::ProtocolError(
                        "truncated first http prepare header".into(),
                    ));
                }
                let value = u32::from_le_bytes(body[0..4].try_into().unwrap());
                Ok(HttpPacket::Prepare1 { value })
            }
            HTTP_FLAG_PREPARE_2 => {
                if body.len() < PREPARE_2_BODY_LEN {
                    return Err(TransportError::ProtocolError(
                        "truncated second http prepare header".into(),
                    ));
                }
                let field1 = u32::from_le_bytes(body[0..4].try_into().unwrap());
                let flow_control_increment = u32::from_le_bytes(body[4..8].try_into().unwrap());
                let field3 = u32::from_le_bytes(body[8..12].try_into().unwrap());
                Ok(HttpPacket::Prepare2 {
                    field1,
                    flow_control_increment,
                    field3,
                })
            }
            other => Err(TransportError::ProtocolError(format!(
                "unrecognised http packet flags 0x{:04x}",
                other
            ))),
        }
    }
}

/// Per-pipe flow control tracker, mirroring `RpcConnection_http`'s
/// `bytes_received`/`flow_control_mark`/`flow_control_increment` fields.
///
/// The server-facing side (`httpc` in the original) raises the mark by half
/// the increment every time it emits a report, so reports trail consumption
/// instead of firing on every single frame.
#[derive(Debug, Clone)]
pub struct FlowControlTracker {
    pub bytes_received: u32,
    pub flow_control_mark: u32,
    pub flow_control_increment: u32,
}

impl FlowControlTracker {
    pub fn new(flow_control_increment: u32) -> Self {
        Self {
            bytes_received: 0,
            flow_control_mark: flow_control_increment / 2,
            flow_control_increment,
        }
    }

    /// Record `frag_len` bytes of a just-received data frame; returns a
    /// flow-control report to send back when the accumulated total has
    /// crossed the current mark.
    pub fn on_data_received(&mut self, frag_len: u32, pipe_uuid: Uuid) -> Option<HttpPacket> {
        self.bytes_received += frag_len;
        if self.bytes_received <= self.flow_control_mark {
            return None;
        }
        self.flow_control_mark = self.bytes_received + self.flow_control_increment / 2;
        Some(HttpPacket::FlowControl {
            bytes_transmitted: self.bytes_received,
            flow_control_increment: self.flow_control_increment,
            pipe_uuid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_packet_round_trips() {
        let pkt = HttpPacket::Data(vec![1, 2, 3, 4]);
        let bytes = pkt.encode();
        assert_eq!(HttpPacket::decode(&bytes).unwrap(), pkt);
    }

    #[test]
    fn idle_packet_has_no_data_items() {
        let bytes = HttpPacket::Idle.encode();
        assert_eq!(&bytes[0..2], &HTTP_FLAG_IDLE.to_le_bytes());
        assert_eq!(&bytes[2..4], &0u16.to_le_bytes());
        assert_eq!(HttpPacket::decode(&bytes).unwrap(), HttpPacket::Idle);
    }

    #[test]
    fn idle_packet_with_data_items_is_protocol_error() {
        let mut bytes = HttpPacket::Idle.encode();
        bytes[2] = 1; // forge a nonzero num_data_items
        assert!(HttpPacket::decode(&bytes).is_err());
    }

    #[test]
    fn flow_control_packet_round_trips() {
        let uuid = Uuid::new_v4();
        let pkt = HttpPacket::FlowControl {
            bytes_transmitted: 0x4000,
            flow_control_increment: 0x10000,
            pipe_uuid: uuid,
        };
        let bytes = pkt.encode();
        assert_eq!(HttpPacket::decode(&bytes).unwrap(), pkt);
    }

    #[test]
    fn unrecognised_flags_are_rejected() {
        let mut bytes = vec![0u8; 4];
        bytes[0..2].copy_from_slice(&0x00FFu16.to_le_bytes());
        assert!(HttpPacket::decode(&bytes).is_err());
    }

    #[test]
    fn control_packet_framing_round_trips_frag_len() {
        let framed = frame_control_packet(&HttpPacket::Idle);
        let header_bytes: [u8; COMMON_HEADER_LEN] = framed[..COMMON_HEADER_LEN].try_into().unwrap();
        let header = DceCommonHeader::decode(&header_bytes);
        assert_eq!(header.ptype, PKT_HTTP);
        assert_eq!(header.frag_len as usize, framed.len());
        let body = HttpPacket::decode(&framed[COMMON_HEADER_LEN..]).unwrap();
        assert_eq!(body, HttpPacket::Idle);
    }

    #[test]
    fn tracker_emits_report_only_after_crossing_mark() {
        let uuid = Uuid::new_v4();
        // initial mark is half the increment, per spec.
        let mut tracker = FlowControlTracker::new(1000);
        assert_eq!(tracker.flow_control_mark, 500);
        assert!(tracker.on_data_received(400, uuid).is_none());
        let report = tracker.on_data_received(400, uuid);
        assert!(matches!(report, Some(HttpPacket::FlowControl { bytes_transmitted: 800, .. })));
        // mark is now bytes_received(800) + increment/2(500) = 1300
        assert_eq!(tracker.flow_control_mark, 1300);
    }

    #[test]
    fn connect_packet_round_trips_with_association_uuid() {
        let pkt = HttpPacket::Connect {
            is_out_pipe: false,
            connection_uuid: Uuid::new_v4(),
            pipe_uuid: Uuid::new_v4(),
            association_uuid: Some(Uuid::new_v4()),
        };
        let bytes = pkt.encode();
        assert_eq!(HttpPacket::decode(&bytes).unwrap(), pkt);
    }

    #[test]
    fn connect_packet_round_trips_without_association_uuid() {
        let pkt = HttpPacket::Connect {
            is_out_pipe: true,
            connection_uuid: Uuid::new_v4(),
            pipe_uuid: Uuid::new_v4(),
            association_uuid: None,
        };
        let bytes = pkt.encode();
        assert_eq!(HttpPacket::decode(&bytes).unwrap(), pkt);
    }

    #[test]
    fn prepare_headers_round_trip() {
        let first = HttpPacket::Prepare1 { value: 7 };
        assert_eq!(HttpPacket::decode(&first.encode()).unwrap(), first);

        let second = HttpPacket::Prepare2 {
            field1: 1,
            flow_control_increment: 0x10000,
            field3: 2,
        };
        assert_eq!(HttpPacket::decode(&second.encode()).unwrap(), second);
    }
}
