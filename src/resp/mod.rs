//! RESP protocol support: framing, message classification, connections.

pub mod connection;
pub mod message;
pub mod reader;

pub use connection::{Conn, IoStream};
pub use message::{
    Msg, MsgOp, MSG_INVALID_PASS, MSG_NO_AUTH, MSG_NO_PASSWORD_SET, MSG_OK, MSG_PARSE_ERROR,
};
pub use reader::{RespError, RespReader};
