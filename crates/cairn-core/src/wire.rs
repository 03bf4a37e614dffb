//! Cairn wire format — on-wire types for all gossip communication.
//!
//! These types ARE the protocol. The framing is a 4-byte TLV header
//! (type, version, big-endian length) followed by `length` body bytes;
//! six packet kinds are defined and all current versions are 0. The wire
//! numbers are fixed — changing anything here is a breaking change against
//! every deployed daemon on the mesh.
//!
//! Bodies are decoded explicitly, field by field, from the framed bytes.
//! Every decode error carries the number of bytes consumed so a stream
//! caller can resynchronize.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::hwaddr::HardwareAddr;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Default UDP port for the gossip fabric.
pub const UDP_PORT: u16 = 0x4242;

/// IPv6 all-nodes link-local multicast group the daemon announces on.
pub const MULTICAST_ADDR: &str = "ff02::1";

/// Current wire format version for every packet kind.
pub const WIRE_VERSION: u8 = 0;

/// Maximum payload carried by a single data record.
/// Larger blobs must be split by the application.
pub const MAX_PAYLOAD: usize = 65535 - 20;

/// Maximum size of a single datagram.
pub const MAX_DATAGRAM: usize = 0xffff;

/// Fixed width of one interface name in a ChangeInterface table.
pub const IFNAMSIZ: usize = 16;

/// Total size of the ChangeInterface name table: 16 slots of IFNAMSIZ bytes.
pub const IFACE_TABLE_LEN: usize = IFNAMSIZ * 16;

/// Requesting this type returns records of every type.
pub const PACKETTYPE_ALL: u8 = 0;

/// Packet kind bytes. Wire numbers are fixed.
pub mod kind {
    pub const PUSH_DATA: u8 = 0;
    pub const ANNOUNCE_MASTER: u8 = 1;
    pub const REQUEST: u8 = 2;
    pub const STATUS_TXEND: u8 = 3;
    pub const STATUS_ERROR: u8 = 4;
    pub const MODE_SWITCH: u8 = 5;
    pub const CHANGE_INTERFACE: u8 = 6;
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
///
/// `consumed` is the byte count read before the error was detected; stream
/// callers use it to decide how much input is unrecoverable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated packet after {consumed} bytes")]
    Truncated { consumed: usize },

    #[error("malformed packet body after {consumed} bytes")]
    Malformed { consumed: usize },

    #[error("unknown packet kind {kind}")]
    UnknownKind { kind: u8, consumed: usize },

    #[error("unknown version {version} for packet kind {kind}")]
    UnknownVersion { kind: u8, version: u8, consumed: usize },

    #[error("payload length {length} exceeds maximum {MAX_PAYLOAD}")]
    Oversize { length: usize },
}

impl WireError {
    /// Bytes consumed from the input before the error surfaced.
    pub fn consumed(&self) -> usize {
        match *self {
            WireError::Truncated { consumed }
            | WireError::Malformed { consumed }
            | WireError::UnknownKind { consumed, .. }
            | WireError::UnknownVersion { consumed, .. } => consumed,
            WireError::Oversize { .. } => 0,
        }
    }
}

// ── TLV header ────────────────────────────────────────────────────────────────

/// The type/version/length descriptor prefixed to every packet and nested
/// inside every data record. `length` counts the bytes that follow the
/// header. All multi-byte integers on the wire are big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv {
    pub kind: u8,
    pub version: u8,
    pub length: u16,
}

impl Tlv {
    pub const WIRE_SIZE: usize = 4;

    pub fn decode(buf: &[u8]) -> Result<Tlv, WireError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(WireError::Truncated { consumed: buf.len() });
        }
        Ok(Tlv {
            kind: buf[0],
            version: buf[1],
            length: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.kind);
        out.push(self.version);
        out.extend_from_slice(&self.length.to_be_bytes());
    }
}

// ── Transaction identifier ────────────────────────────────────────────────────

/// Identifies a multi-datagram push: the initiator picks `id` at random,
/// `seq_no` counts the datagram-sized chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionId {
    pub id: u16,
    pub seq_no: u16,
}

impl TransactionId {
    pub const WIRE_SIZE: usize = 4;

    pub fn decode(buf: &[u8]) -> Result<TransactionId, WireError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(WireError::Truncated { consumed: buf.len() });
        }
        Ok(TransactionId {
            id: u16::from_be_bytes([buf[0], buf[1]]),
            seq_no: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.seq_no.to_be_bytes());
    }
}

// ── Data record ───────────────────────────────────────────────────────────────

/// One payload record inside a push: source address, nested TLV describing
/// the payload's type and version, and the opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub source: HardwareAddr,
    pub header: Tlv,
    pub payload: Bytes,
}

impl Data {
    pub fn new(source: HardwareAddr, kind: u8, version: u8, payload: Bytes) -> Data {
        Data {
            source,
            header: Tlv {
                kind,
                version,
                length: payload.len() as u16,
            },
            payload,
        }
    }

    /// Size on the wire: 6-byte source, nested TLV, payload.
    pub fn wire_size(&self) -> usize {
        6 + Tlv::WIRE_SIZE + self.payload.len()
    }

    /// Decode one record from the front of `buf`, returning it together
    /// with the bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Data, usize), WireError> {
        if buf.len() < 6 {
            return Err(WireError::Truncated { consumed: buf.len() });
        }
        let source = HardwareAddr::from_bytes(&buf[..6]).expect("six bytes");
        let header = Tlv::decode(&buf[6..]).map_err(|_| WireError::Truncated {
            consumed: buf.len(),
        })?;
        let end = 6 + Tlv::WIRE_SIZE + header.length as usize;
        if buf.len() < end {
            return Err(WireError::Truncated { consumed: buf.len() });
        }
        let payload = Bytes::copy_from_slice(&buf[6 + Tlv::WIRE_SIZE..end]);
        Ok((
            Data {
                source,
                header,
                payload,
            },
            end,
        ))
    }

    /// Encode the record. The nested length is recomputed from the payload.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(WireError::Oversize {
                length: self.payload.len(),
            });
        }
        out.extend_from_slice(self.source.as_bytes());
        Tlv {
            kind: self.header.kind,
            version: self.header.version,
            length: self.payload.len() as u16,
        }
        .encode_into(out);
        out.extend_from_slice(&self.payload);
        Ok(())
    }
}

// ── Server mode ───────────────────────────────────────────────────────────────

/// Operation mode of a daemon, switched at runtime via ModeSwitch packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    /// Forward requests to the preferred master, push local data only.
    Slave = 0,
    /// Answer from the own store, announce on and sync to every interface.
    Master = 1,
    /// Like a master towards clients, but announces and syncs by unicast
    /// to the preferred master only. Not present in the C implementation.
    StealthMaster = 2,
}

impl TryFrom<u8> for Mode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Mode::Slave),
            1 => Ok(Mode::Master),
            2 => Ok(Mode::StealthMaster),
            _ => Err(WireError::Malformed { consumed: 1 }),
        }
    }
}

// ── Packet ────────────────────────────────────────────────────────────────────

/// One decoded wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Sequenced chunk of a push transaction carrying data records.
    PushData {
        tx: TransactionId,
        data: Vec<Data>,
    },
    /// Header-only announcement that the sender is an available master.
    AnnounceMaster,
    /// Ask for all records of `requested_type` under transaction `tx_id`.
    Request { requested_type: u8, tx_id: u16 },
    /// Final packet of a push: `tx.seq_no` is the chunk count.
    StatusTxEnd(TransactionId),
    /// The referenced transaction failed.
    StatusError(TransactionId),
    /// Switch the server's operation mode.
    ModeSwitch { mode: u8 },
    /// Rebind the server's listeners to the named interfaces.
    /// The body is a fixed 16x16 byte NUL-padded name table.
    ChangeInterface { ifaces: Box<[u8; IFACE_TABLE_LEN]> },
}

impl Packet {
    pub fn kind(&self) -> u8 {
        match self {
            Packet::PushData { .. } => kind::PUSH_DATA,
            Packet::AnnounceMaster => kind::ANNOUNCE_MASTER,
            Packet::Request { .. } => kind::REQUEST,
            Packet::StatusTxEnd(_) => kind::STATUS_TXEND,
            Packet::StatusError(_) => kind::STATUS_ERROR,
            Packet::ModeSwitch { .. } => kind::MODE_SWITCH,
            Packet::ChangeInterface { .. } => kind::CHANGE_INTERFACE,
        }
    }

    fn body_size(&self) -> usize {
        match self {
            Packet::PushData { data, .. } => {
                TransactionId::WIRE_SIZE + data.iter().map(Data::wire_size).sum::<usize>()
            }
            Packet::AnnounceMaster => 0,
            Packet::Request { .. } => 3,
            Packet::StatusTxEnd(_) | Packet::StatusError(_) => TransactionId::WIRE_SIZE,
            Packet::ModeSwitch { .. } => 1,
            Packet::ChangeInterface { .. } => IFACE_TABLE_LEN,
        }
    }

    /// Size of the packet when put onto the wire, header included.
    pub fn wire_size(&self) -> usize {
        Tlv::WIRE_SIZE + self.body_size()
    }

    /// Encode into a fresh buffer. The outer length is always recomputed
    /// from the serialized body.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let body = self.body_size();
        if body > u16::MAX as usize {
            return Err(WireError::Oversize { length: body });
        }
        let mut out = Vec::with_capacity(Tlv::WIRE_SIZE + body);
        Tlv {
            kind: self.kind(),
            version: WIRE_VERSION,
            length: body as u16,
        }
        .encode_into(&mut out);
        match self {
            Packet::PushData { tx, data } => {
                tx.encode_into(&mut out);
                for d in data {
                    d.encode_into(&mut out)?;
                }
            }
            Packet::AnnounceMaster => {}
            Packet::Request {
                requested_type,
                tx_id,
            } => {
                out.push(*requested_type);
                out.extend_from_slice(&tx_id.to_be_bytes());
            }
            Packet::StatusTxEnd(tx) | Packet::StatusError(tx) => tx.encode_into(&mut out),
            Packet::ModeSwitch { mode } => out.push(*mode),
            Packet::ChangeInterface { ifaces } => out.extend_from_slice(ifaces.as_ref()),
        }
        Ok(out)
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns the packet and the total bytes consumed. Errors carry the
    /// consumed count so the caller may resynchronize stream input; on UDP
    /// the whole enclosing datagram is discarded.
    pub fn decode(buf: &[u8]) -> Result<(Packet, usize), WireError> {
        let tlv = Tlv::decode(buf)?;
        let total = Tlv::WIRE_SIZE + tlv.length as usize;
        if buf.len() < total {
            return Err(WireError::Truncated { consumed: buf.len() });
        }
        let body = &buf[Tlv::WIRE_SIZE..total];
        if tlv.version != WIRE_VERSION {
            return Err(WireError::UnknownVersion {
                kind: tlv.kind,
                version: tlv.version,
                consumed: Tlv::WIRE_SIZE,
            });
        }
        let packet = match tlv.kind {
            kind::PUSH_DATA => Self::decode_push_data(body)?,
            kind::ANNOUNCE_MASTER => Packet::AnnounceMaster,
            kind::REQUEST => {
                if body.len() != 3 {
                    return Err(WireError::Malformed {
                        consumed: Tlv::WIRE_SIZE + body.len(),
                    });
                }
                Packet::Request {
                    requested_type: body[0],
                    tx_id: u16::from_be_bytes([body[1], body[2]]),
                }
            }
            kind::STATUS_TXEND | kind::STATUS_ERROR => {
                if body.len() != TransactionId::WIRE_SIZE {
                    return Err(WireError::Malformed {
                        consumed: Tlv::WIRE_SIZE + body.len(),
                    });
                }
                let tx = TransactionId::decode(body)?;
                if tlv.kind == kind::STATUS_TXEND {
                    Packet::StatusTxEnd(tx)
                } else {
                    Packet::StatusError(tx)
                }
            }
            kind::MODE_SWITCH => {
                if body.len() != 1 {
                    return Err(WireError::Malformed {
                        consumed: Tlv::WIRE_SIZE + body.len(),
                    });
                }
                Packet::ModeSwitch { mode: body[0] }
            }
            kind::CHANGE_INTERFACE => {
                if body.len() != IFACE_TABLE_LEN {
                    return Err(WireError::Malformed {
                        consumed: Tlv::WIRE_SIZE + body.len(),
                    });
                }
                let mut ifaces = Box::new([0u8; IFACE_TABLE_LEN]);
                ifaces.copy_from_slice(body);
                Packet::ChangeInterface { ifaces }
            }
            other => {
                return Err(WireError::UnknownKind {
                    kind: other,
                    consumed: Tlv::WIRE_SIZE,
                })
            }
        };
        Ok((packet, total))
    }

    // Body: 4-byte transaction header, then data records until the outer
    // length is used up. A record overrunning the body is malformed.
    fn decode_push_data(body: &[u8]) -> Result<Packet, WireError> {
        let tx = TransactionId::decode(body).map_err(|_| WireError::Malformed {
            consumed: Tlv::WIRE_SIZE + body.len(),
        })?;
        let mut data = Vec::new();
        let mut cursor = TransactionId::WIRE_SIZE;
        while cursor < body.len() {
            let (record, used) =
                Data::decode(&body[cursor..]).map_err(|_| WireError::Malformed {
                    consumed: Tlv::WIRE_SIZE + cursor,
                })?;
            data.push(record);
            cursor += used;
        }
        Ok(Packet::PushData { tx, data })
    }
}

// ── Stream framing ────────────────────────────────────────────────────────────

/// Read one packet from a stream socket.
///
/// Returns `Ok(None)` on a clean EOF at a packet boundary. EOF inside a
/// packet is `Truncated`.
pub async fn read_packet<R>(r: &mut R) -> Result<Option<Packet>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; Tlv::WIRE_SIZE];
    let mut filled = 0usize;
    while filled < header.len() {
        match r.read(&mut header[filled..]).await {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(WireError::Truncated { consumed: filled }),
            Ok(n) => filled += n,
            Err(_) => return Err(WireError::Truncated { consumed: filled }),
        }
    }
    let tlv = Tlv::decode(&header)?;
    let mut frame = vec![0u8; Tlv::WIRE_SIZE + tlv.length as usize];
    frame[..Tlv::WIRE_SIZE].copy_from_slice(&header);
    if r.read_exact(&mut frame[Tlv::WIRE_SIZE..]).await.is_err() {
        return Err(WireError::Truncated {
            consumed: Tlv::WIRE_SIZE,
        });
    }
    Packet::decode(&frame).map(|(p, _)| Some(p))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(source: [u8; 6], kind: u8, version: u8, payload: &[u8]) -> Data {
        Data::new(
            HardwareAddr(source),
            kind,
            version,
            Bytes::copy_from_slice(payload),
        )
    }

    #[test]
    fn tlv_encodes_big_endian() {
        let mut out = Vec::new();
        Tlv {
            kind: 2,
            version: 0,
            length: 3,
        }
        .encode_into(&mut out);
        assert_eq!(out, [0x02, 0x00, 0x00, 0x03]);
        assert_eq!(
            Tlv::decode(&out).unwrap(),
            Tlv {
                kind: 2,
                version: 0,
                length: 3
            }
        );
    }

    #[test]
    fn request_round_trip() {
        let p = Packet::Request {
            requested_type: 158,
            tx_id: 0xbeef,
        };
        let bytes = p.encode().unwrap();
        assert_eq!(bytes.len(), 7);
        assert_eq!(bytes[..4], [0x02, 0x00, 0x00, 0x03]);
        let (back, consumed) = Packet::decode(&bytes).unwrap();
        assert_eq!(back, p);
        assert_eq!(consumed, 7);
    }

    #[test]
    fn announce_master_is_header_only() {
        let bytes = Packet::AnnounceMaster.encode().unwrap();
        assert_eq!(bytes, [0x01, 0x00, 0x00, 0x00]);
        let (back, consumed) = Packet::decode(&bytes).unwrap();
        assert_eq!(back, Packet::AnnounceMaster);
        assert_eq!(consumed, 4);
    }

    #[test]
    fn status_kind_is_in_the_type_byte() {
        let tx = TransactionId {
            id: 7,
            seq_no: 3,
        };
        let end = Packet::StatusTxEnd(tx).encode().unwrap();
        let err = Packet::StatusError(tx).encode().unwrap();
        assert_eq!(end[0], kind::STATUS_TXEND);
        assert_eq!(err[0], kind::STATUS_ERROR);
        // identical bodies
        assert_eq!(end[1..], err[1..]);
        assert_eq!(Packet::decode(&end).unwrap().0, Packet::StatusTxEnd(tx));
        assert_eq!(Packet::decode(&err).unwrap().0, Packet::StatusError(tx));
    }

    #[test]
    fn push_data_round_trip() {
        let p = Packet::PushData {
            tx: TransactionId {
                id: 0x1234,
                seq_no: 1,
            },
            data: vec![
                sample_data([1, 2, 3, 4, 5, 6], 158, 0, b"abc"),
                sample_data([6, 5, 4, 3, 2, 1], 1, 1, &[0u8; 40]),
            ],
        };
        let bytes = p.encode().unwrap();
        // outer length covers tx header plus both records
        let outer = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        assert_eq!(outer, bytes.len() - 4);
        let (back, consumed) = Packet::decode(&bytes).unwrap();
        assert_eq!(back, p);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn push_data_length_is_recomputed_on_encode() {
        let mut record = sample_data([1, 1, 1, 1, 1, 1], 64, 0, b"hello");
        // lie about the nested length; encode must ignore it
        record.header.length = 9999;
        let p = Packet::PushData {
            tx: TransactionId { id: 1, seq_no: 0 },
            data: vec![record],
        };
        let bytes = p.encode().unwrap();
        let (back, _) = Packet::decode(&bytes).unwrap();
        match back {
            Packet::PushData { data, .. } => assert_eq!(data[0].header.length, 5),
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn mode_switch_and_change_interface_round_trip() {
        let m = Packet::ModeSwitch { mode: 2 };
        let bytes = m.encode().unwrap();
        assert_eq!(bytes.len(), 5);
        assert_eq!(Packet::decode(&bytes).unwrap().0, m);

        let mut table = Box::new([0u8; IFACE_TABLE_LEN]);
        table[..5].copy_from_slice(b"mesh0");
        let c = Packet::ChangeInterface { ifaces: table };
        let bytes = c.encode().unwrap();
        assert_eq!(bytes.len(), 4 + IFACE_TABLE_LEN);
        assert_eq!(Packet::decode(&bytes).unwrap().0, c);
    }

    #[test]
    fn truncated_input_reports_consumed_bytes() {
        let p = Packet::Request {
            requested_type: 1,
            tx_id: 42,
        };
        let bytes = p.encode().unwrap();
        match Packet::decode(&bytes[..5]) {
            Err(WireError::Truncated { consumed }) => assert_eq!(consumed, 5),
            other => panic!("expected truncation, got {other:?}"),
        }
        match Packet::decode(&bytes[..2]) {
            Err(WireError::Truncated { consumed }) => assert_eq!(consumed, 2),
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_and_version_are_rejected() {
        let bytes = [0x63, 0x00, 0x00, 0x00];
        assert!(matches!(
            Packet::decode(&bytes),
            Err(WireError::UnknownKind { kind: 0x63, .. })
        ));
        let bytes = [0x01, 0x09, 0x00, 0x00];
        assert!(matches!(
            Packet::decode(&bytes),
            Err(WireError::UnknownVersion {
                kind: 1,
                version: 9,
                ..
            })
        ));
    }

    #[test]
    fn short_data_record_poisons_the_push() {
        let p = Packet::PushData {
            tx: TransactionId { id: 9, seq_no: 0 },
            data: vec![sample_data([1, 2, 3, 4, 5, 6], 158, 0, b"xyz")],
        };
        let mut bytes = p.encode().unwrap();
        // shrink the outer length so the record overruns the body
        bytes[3] -= 2;
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            Packet::decode(&bytes),
            Err(WireError::Malformed { .. })
        ));
    }

    #[test]
    fn oversize_payload_refuses_to_encode() {
        let record = sample_data([0; 6], 64, 0, &vec![0u8; MAX_PAYLOAD + 1]);
        let p = Packet::PushData {
            tx: TransactionId { id: 1, seq_no: 0 },
            data: vec![record],
        };
        assert!(matches!(p.encode(), Err(WireError::Oversize { .. })));
    }

    #[test]
    fn mode_conversions() {
        assert_eq!(Mode::try_from(0).unwrap(), Mode::Slave);
        assert_eq!(Mode::try_from(1).unwrap(), Mode::Master);
        assert_eq!(Mode::try_from(2).unwrap(), Mode::StealthMaster);
        assert!(Mode::try_from(3).is_err());
    }

    #[tokio::test]
    async fn read_packet_frames_a_stream() {
        let first = Packet::Request {
            requested_type: 159,
            tx_id: 5,
        };
        let second = Packet::AnnounceMaster;
        let mut stream = first.encode().unwrap();
        stream.extend(second.encode().unwrap());
        let mut cursor = std::io::Cursor::new(stream);
        assert_eq!(read_packet(&mut cursor).await.unwrap(), Some(first));
        assert_eq!(read_packet(&mut cursor).await.unwrap(), Some(second));
        assert_eq!(read_packet(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_packet_mid_frame_eof_is_truncated() {
        let bytes = Packet::Request {
            requested_type: 1,
            tx_id: 1,
        }
        .encode()
        .unwrap();
        let mut cursor = std::io::Cursor::new(bytes[..5].to_vec());
        assert!(matches!(
            read_packet(&mut cursor).await,
            Err(WireError::Truncated { .. })
        ));
    }
}
