//! RESP messages and their classification.
//!
//! A [`Msg`] carries the exact bytes that framed one RESP object on the
//! wire. The proxy forwards those bytes verbatim; the only parsing it ever
//! does is a prefix match against the handful of commands that carry
//! meaning for it (AUTH, SELECT, SYNC, PSYNC). The majority of messages
//! mean nothing to the proxy and are never inspected beyond that prefix.

use std::sync::OnceLock;
use std::fmt;

/// Canned reply for a successful command.
pub const MSG_OK: &[u8] = b"+OK\r\n";
/// Reply for commands sent before a required client AUTH.
pub const MSG_NO_AUTH: &[u8] = b"-NOAUTH Authentication required.\r\n";
/// Reply for an AUTH with the wrong password.
pub const MSG_INVALID_PASS: &[u8] = b"-ERR invalid password\r\n";
/// Reply for an AUTH when the listen endpoint has no password.
pub const MSG_NO_PASSWORD_SET: &[u8] = b"-ERR Client sent AUTH, but no password is set\r\n";
/// Reply sent before terminating a session over an unparseable command.
pub const MSG_PARSE_ERROR: &[u8] = b"-ERR Command parse error (redis-proxy)\r\n";

/// Classification of a message, from the proxy's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgOp {
    Auth,
    Select,
    Sync,
    Psync,
    Broken,
    Other,
}

impl MsgOp {
    pub fn as_str(self) -> &'static str {
        match self {
            MsgOp::Auth => "auth",
            MsgOp::Select => "select",
            MsgOp::Sync => "sync",
            MsgOp::Psync => "psync",
            MsgOp::Broken => "-broken-",
            MsgOp::Other => "-other-",
        }
    }
}

impl fmt::Display for MsgOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands the proxy recognizes, matched byte-exact (command token
/// case-insensitive) against the start of the message.
const MSG_PREFIXES: [(&[u8], MsgOp); 4] = [
    (b"*2\r\n$4\r\nAUTH\r\n$", MsgOp::Auth),
    (b"*2\r\n$6\r\nSELECT\r\n$", MsgOp::Select),
    (b"*1\r\n$4\r\nSYNC\r\n", MsgOp::Sync),
    (b"*3\r\n$5\r\nPSYNC\r\n$", MsgOp::Psync),
];

#[derive(Clone, Debug)]
struct Analysis {
    op: MsgOp,
    first_arg: Option<String>,
    first_arg_int: Option<u64>,
}

/// One framed RESP object, immutable once constructed.
///
/// Equality is byte equality of the wire representation.
#[derive(Clone, Debug, Default)]
pub struct Msg {
    data: Vec<u8>,
    analysis: OnceLock<Analysis>,
}

impl Msg {
    pub fn new(data: Vec<u8>) -> Self {
        Msg {
            data,
            analysis: OnceLock::new(),
        }
    }

    /// Build a command message from its arguments: `*N\r\n` followed by a
    /// `$len\r\n<arg>\r\n` bulk string per argument.
    pub fn from_args(args: &[&str]) -> Self {
        let mut data = Vec::with_capacity(16 * args.len());
        data.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            data.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            data.extend_from_slice(arg.as_bytes());
            data.extend_from_slice(b"\r\n");
        }
        Msg::new(data)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_ok(&self) -> bool {
        self.data == MSG_OK
    }

    pub fn op(&self) -> MsgOp {
        self.analyse().op
    }

    /// First bulk-string argument, present for AUTH and SELECT messages.
    pub fn first_arg(&self) -> Option<&str> {
        self.analyse().first_arg.as_deref()
    }

    /// First argument parsed as a database index, present for SELECT.
    pub fn first_arg_int(&self) -> Option<u64> {
        self.analyse().first_arg_int
    }

    fn analyse(&self) -> &Analysis {
        self.analysis.get_or_init(|| classify(&self.data))
    }
}

impl PartialEq for Msg {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Msg {}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.data))
    }
}

fn classify(data: &[u8]) -> Analysis {
    let mut analysis = Analysis {
        op: MsgOp::Other,
        first_arg: None,
        first_arg_int: None,
    };

    for (prefix, op) in MSG_PREFIXES {
        if prefix.len() > data.len() || !data[..prefix.len()].eq_ignore_ascii_case(prefix) {
            continue;
        }
        analysis.op = op;

        let suffix = &data[prefix.len()..];
        let Some(end) = suffix.iter().position(|&b| b == b'\r') else {
            // No argument follows the prefix. Only legal for commands
            // that take none.
            if !data.starts_with(b"*1\r") {
                analysis.op = MsgOp::Broken;
            }
            return analysis;
        };

        let len = std::str::from_utf8(&suffix[..end])
            .ok()
            .and_then(|s| s.parse::<usize>().ok());
        let Some(len) = len else {
            analysis.op = MsgOp::Broken;
            return analysis;
        };
        let start = end + 2;
        if suffix.len() < start + len {
            analysis.op = MsgOp::Broken;
            return analysis;
        }
        analysis.first_arg = Some(String::from_utf8_lossy(&suffix[start..start + len]).into_owned());
        break;
    }

    if analysis.op == MsgOp::Select {
        match analysis.first_arg.as_deref().and_then(|s| s.parse::<u64>().ok()) {
            Some(db) => analysis.first_arg_int = Some(db),
            None => {
                analysis.op = MsgOp::Broken;
                analysis.first_arg = None;
            }
        }
    }

    analysis
}
