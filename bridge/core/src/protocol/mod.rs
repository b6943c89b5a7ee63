//! Bridge wire protocol: packet model, codec, and op vocabulary

pub mod codec;
pub mod ops;
pub mod packet;

pub use codec::{decode, encode, salvage_id, DecodeError, MAX_PACKET_SIZE};
pub use ops::{Op, OpFamily};
pub use packet::{into_payload, new_packet_id, now_ms, ErrorInfo, Packet, Payload};
