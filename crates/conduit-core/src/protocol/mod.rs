//! Wire protocol: message model, JSON codec and length-prefixed framing.

pub mod frame;
pub mod message;

pub use frame::{encode_frame, read_frame, write_frame, FRAME_HEADER_LEN, MIN_FRAME_SIZE};
pub use message::{generate_message_id, now_millis, Message, MessageKind, RESPONSE_CHANNEL};
