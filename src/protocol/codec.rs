use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{payload_len, Packet, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

/// MySQL packet codec for use with tokio Framed
#[derive(Debug, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() >= PACKET_HEADER_SIZE {
            let len = payload_len(&src[..PACKET_HEADER_SIZE]);
            src.reserve((PACKET_HEADER_SIZE + len).saturating_sub(src.len()));
        }
        Ok(Packet::decode(src))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload of {} bytes needs packet splitting", item.payload.len()),
            ));
        }
        item.encode(dst);
        Ok(())
    }
}
