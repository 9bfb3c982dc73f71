//! Reply boundaries in a backend's packet stream
//!
//! Relaying never buffers a whole reply, so the end of one is found by
//! looking at the first bytes of every packet. Backends are expected to send
//! classic EOF packets (no `CLIENT_DEPRECATE_EOF`).

use super::packet::MAX_PACKET_SIZE;

/// Bytes of each payload needed to classify it
pub const INSPECT_LEN: usize = 32;

/// SERVER_MORE_RESULTS_EXISTS
pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;

const OK_HEADER: u8 = 0x00;
const ERR_HEADER: u8 = 0xFF;
const EOF_HEADER: u8 = 0xFE;
const LOCAL_INFILE_HEADER: u8 = 0xFB;

/// Largest payload that can still be an EOF packet
const EOF_MAX_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    /// Between replies
    #[default]
    Idle,
    /// The previous result announced another one
    MoreResults,
    /// Column definitions still to come
    Columns(u64),
    /// EOF after the column definitions
    ColumnsEof,
    Rows,
}

/// Follows a backend's replies packet by packet
#[derive(Debug, Clone, Default)]
pub struct ReplyTracker {
    phase: Phase,
    /// The last packet had the maximum length; the next one continues it
    continued: bool,
}

impl ReplyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next packet's payload length and its first bytes
    ///
    /// Returns true when this packet completes a reply.
    pub fn on_packet(&mut self, len: usize, head: &[u8]) -> bool {
        let continuation = self.continued;
        self.continued = len == MAX_PACKET_SIZE;
        if continuation {
            return !self.continued && self.phase == Phase::Idle;
        }

        let first = head.first().copied();
        self.phase = match (self.phase, first) {
            (Phase::Idle | Phase::MoreResults, Some(OK_HEADER)) => next_result(ok_status(head)),
            (Phase::Idle | Phase::MoreResults, Some(ERR_HEADER | LOCAL_INFILE_HEADER) | None) => {
                Phase::Idle
            }
            (Phase::Idle | Phase::MoreResults, Some(EOF_HEADER)) if len < EOF_MAX_LEN => {
                next_result(eof_status(head))
            }
            (Phase::Idle | Phase::MoreResults, Some(_)) => match read_lenenc(head) {
                Some((0, _)) | None => Phase::Idle,
                Some((columns, _)) => Phase::Columns(columns),
            },
            (Phase::Columns(1), _) => Phase::ColumnsEof,
            (Phase::Columns(n), _) => Phase::Columns(n - 1),
            (Phase::ColumnsEof, Some(ERR_HEADER)) => Phase::Idle,
            (Phase::ColumnsEof, _) => Phase::Rows,
            (Phase::Rows, Some(ERR_HEADER)) => Phase::Idle,
            (Phase::Rows, Some(EOF_HEADER)) if len < EOF_MAX_LEN => next_result(eof_status(head)),
            (Phase::Rows, _) => Phase::Rows,
        };

        !self.continued && self.phase == Phase::Idle
    }

    /// A reply has started and not yet completed
    pub fn in_reply(&self) -> bool {
        self.continued || self.phase != Phase::Idle
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn next_result(status: u16) -> Phase {
    if status & SERVER_MORE_RESULTS_EXISTS != 0 {
        Phase::MoreResults
    } else {
        Phase::Idle
    }
}

/// Status flags of an OK packet: header, affected rows, insert id, status
fn ok_status(head: &[u8]) -> u16 {
    let rest = head.get(1..).unwrap_or_default();
    let Some((_, affected)) = read_lenenc(rest) else {
        return 0;
    };
    let Some((_, insert_id)) = read_lenenc(&rest[affected..]) else {
        return 0;
    };
    read_u16(&rest[affected + insert_id..])
}

/// Status flags of an EOF packet: header, warnings, status
fn eof_status(head: &[u8]) -> u16 {
    read_u16(head.get(3..).unwrap_or_default())
}

fn read_u16(buf: &[u8]) -> u16 {
    match buf {
        [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
        _ => 0,
    }
}

/// Length-encoded integer and the number of bytes it occupies
fn read_lenenc(buf: &[u8]) -> Option<(u64, usize)> {
    let (&first, rest) = buf.split_first()?;
    let width = match first {
        0..=0xFA => return Some((first as u64, 1)),
        0xFC => 2,
        0xFD => 3,
        0xFE => 8,
        _ => return None,
    };
    let bytes = rest.get(..width)?;
    let mut value = [0u8; 8];
    value[..width].copy_from_slice(bytes);
    Some((u64::from_le_bytes(value), width + 1))
}
