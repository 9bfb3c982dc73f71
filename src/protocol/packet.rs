use bytes::{Buf, BufMut, Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload size (16MB - 1)
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// MySQL wire protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Build a `COM_QUERY` packet for `sql`
    pub fn query(sql: &str) -> Self {
        let mut payload = BytesMut::with_capacity(sql.len() + 1);
        payload.put_u8(Command::Query as u8);
        payload.extend_from_slice(sql.as_bytes());
        Self::new(0, payload.freeze())
    }

    /// Encode packet to bytes (header + payload)
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(PACKET_HEADER_SIZE + self.payload.len());
        dst.extend_from_slice(&encode_header(self.payload.len(), self.sequence_id));
        dst.extend_from_slice(&self.payload);
    }

    /// Wire representation (header + payload)
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Command byte of a client packet
    pub fn command(&self) -> Command {
        self.payload
            .first()
            .copied()
            .map(Command::from)
            .unwrap_or(Command::Unknown)
    }

    /// Try to decode packet from bytes, returns None if not enough data
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }

        let len = payload_len(&src[..PACKET_HEADER_SIZE]);
        if src.len() < PACKET_HEADER_SIZE + len {
            return None;
        }

        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }
}

/// Payload length from a packet header (3 bytes, little endian)
pub fn payload_len(header: &[u8]) -> usize {
    header[0] as usize | ((header[1] as usize) << 8) | ((header[2] as usize) << 16)
}

pub fn encode_header(len: usize, sequence_id: u8) -> [u8; PACKET_HEADER_SIZE] {
    let mut header = [0u8; PACKET_HEADER_SIZE];
    let mut buf = &mut header[..];
    buf.put_u8((len & 0xFF) as u8);
    buf.put_u8(((len >> 8) & 0xFF) as u8);
    buf.put_u8(((len >> 16) & 0xFF) as u8);
    buf.put_u8(sequence_id);
    header
}

/// MySQL command types the router cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    Statistics = 0x09,
    Ping = 0x0e,
    ChangeUser = 0x11,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtClose = 0x19,
    SetOption = 0x1b,
    ResetConnection = 0x1f,
    Unknown = 0xff,
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x09 => Command::Statistics,
            0x0e => Command::Ping,
            0x11 => Command::ChangeUser,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x19 => Command::StmtClose,
            0x1b => Command::SetOption,
            0x1f => Command::ResetConnection,
            _ => Command::Unknown,
        }
    }
}
