//! Wire protocol shared by the tether relay and its devices.
//!
//! Every message is a UTF-8 JSON object tagged by `type`. Datagram
//! transports carry one message per datagram; stream transports separate
//! messages with a newline (see [`frame`]).

pub mod codec;
pub mod error_code;
pub mod frame;
pub mod message;

pub use codec::{decode, decode_with, encode, encode_with, DecodeError, PayloadCodec, Plain};
pub use error_code::ErrorCode;
pub use frame::{encode_line, LineDecoder, LineError, MAX_LINE_LEN};
pub use message::{
    Channel, DeviceType, Message, MessageKind, RegisterAck, RegisterData, Registration, Uid,
};
