use bytes::{Buf, BufMut, BytesMut};

use super::packet::Packet;

const OK_HEADER: u8 = 0x00;
const ERR_HEADER: u8 = 0xFF;

/// OK packet
#[derive(Debug, Clone)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: 0x0002, // SERVER_STATUS_AUTOCOMMIT
            warnings: 0,
        }
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u8(OK_HEADER);
        encode_length_encoded_int(&mut buf, self.affected_rows);
        encode_length_encoded_int(&mut buf, self.last_insert_id);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(self.warnings);
        Packet::new(sequence_id, buf.freeze())
    }
}

impl Default for OkPacket {
    fn default() -> Self {
        Self::new()
    }
}

/// ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.into(),
        }
    }

    /// ER_CONNECTION_KILLED: the client may retry on a new connection
    pub fn connection_killed(reason: &str) -> Self {
        Self::new(1927, "70100", format!("Connection was killed: {}", reason))
    }

    /// CR_SERVER_LOST: the statement was lost together with its backend
    pub fn server_lost(reason: &str) -> Self {
        Self::new(2013, "HY000", format!("Lost connection to backend during query: {}", reason))
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u8(ERR_HEADER);
        buf.put_u16_le(self.error_code);
        buf.put_u8(b'#');
        buf.extend_from_slice(self.sql_state.as_bytes());
        buf.extend_from_slice(self.error_message.as_bytes());
        Packet::new(sequence_id, buf.freeze())
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&ERR_HEADER) || payload.len() < 3 {
            return None;
        }

        let mut buf = &payload[1..];
        let error_code = buf.get_u16_le();

        let (sql_state, error_message) = if buf.len() >= 6 && buf[0] == b'#' {
            buf.advance(1);
            let state = String::from_utf8_lossy(&buf[..5]).into_owned();
            (state, String::from_utf8_lossy(&buf[5..]).into_owned())
        } else {
            ("HY000".to_string(), String::from_utf8_lossy(buf).into_owned())
        };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

/// Encode a length-encoded integer
fn encode_length_encoded_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 16777216 {
        buf.put_u8(0xFD);
        buf.put_uint_le(value, 3);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// Check if packet is OK packet
pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&OK_HEADER)
}

/// Check if packet is ERR packet
pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&ERR_HEADER)
}
