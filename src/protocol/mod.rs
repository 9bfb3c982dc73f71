pub mod codec;
pub mod command;
pub mod packet;
pub mod reply;
pub mod response;

pub use codec::PacketCodec;
pub use command::ClientCommand;
pub use packet::{Command, Packet, PACKET_HEADER_SIZE};
pub use reply::ReplyTracker;
pub use response::{is_err_packet, is_ok_packet, ErrPacket, OkPacket};
