//! The wire grammar: whitespace-separated tokens, `\r\n` terminated. The
//! verb is case-insensitive; trailing tokens beyond the recognized arity are
//! ignored.

/// Upper bound on a single framed request. Longer lines are truncated before
/// parsing, so keys and values are bounded transitively.
pub const MAX_REQUEST: usize = 1024;

#[derive(Debug, Eq, PartialEq)]
pub enum Command<'a> {
    Get(&'a [u8]),
    Set(&'a [u8], &'a [u8]),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ParseError {
    /// Fewer than two tokens.
    InvalidFormat,
    /// Unrecognized verb, or a recognized verb with the wrong arity.
    UnknownCommand,
}

pub fn parse(request: &[u8]) -> Result<Command, ParseError> {
    let mut tokens = request
        .split(|byte| byte.is_ascii_whitespace())
        .filter(|token| !token.is_empty());

    let verb = tokens.next().ok_or(ParseError::InvalidFormat)?;
    let key = tokens.next().ok_or(ParseError::InvalidFormat)?;

    if verb.eq_ignore_ascii_case(b"GET") {
        Ok(Command::Get(key))
    } else if verb.eq_ignore_ascii_case(b"SET") {
        match tokens.next() {
            Some(value) => Ok(Command::Set(key, value)),
            None => Err(ParseError::UnknownCommand),
        }
    } else {
        Err(ParseError::UnknownCommand)
    }
}

/// The response surface of the protocol, one variant per reply line.
#[derive(Debug, Eq, PartialEq)]
pub enum Reply {
    Value(Vec<u8>),
    NotFound,
    Ok,
    UnknownCommand,
    InvalidFormat,
}

impl Reply {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Reply::Value(value) => {
                let mut line = Vec::with_capacity(value.len() + 3);
                line.push(b'+');
                line.extend_from_slice(value);
                line.extend_from_slice(b"\r\n");
                line
            }
            Reply::NotFound => b"$-1\r\n".to_vec(),
            Reply::Ok => b"+OK\r\n".to_vec(),
            Reply::UnknownCommand => b"-ERR Unknown command or wrong args\r\n".to_vec(),
            Reply::InvalidFormat => b"-ERR Invalid command format\r\n".to_vec(),
        }
    }
}
