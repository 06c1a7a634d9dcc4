use crate::params::{ParamError, ParamKey, ParamValue, MAX_LINE_CAP};
use arrayvec::ArrayString;
use core::fmt::Write;
use core::str::FromStr;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_OUT_LINE: usize = 192;
pub const MAX_NAME_LEN: usize = 24;
/// Stands in for a non-ASCII byte in an assembled line.
pub const NON_ASCII_MARK: char = '\x7f';

pub type LineBuffer = ArrayString<MAX_LINE_CAP>;
pub type OutLine = ArrayString<MAX_OUT_LINE>;
pub type Name = ArrayString<MAX_NAME_LEN>;

/// Commands understood on the host link. Produced by [`parse_line`], consumed
/// by the engine's dispatcher with an exhaustive match.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Twist { vx: f32, wz: f32, seq: u32 },
    Safe { enabled: bool },
    Ping { seq: u32 },
    Range { meters: f32, id: u16 },
    Set { key: ParamKey, value: ParamValue },
    Get(GetTarget),
    Led { mask: u8 },
    Pause,
    Resume,
    Replay { since_eid: u32 },
    Stats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetTarget {
    Param(ParamKey),
    Event(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("wrong number of fields")]
    Arity,
    #[error("malformed numeric field")]
    Number,
    #[error("non-ASCII byte in line")]
    Ascii,
    #[error("line exceeds max_line_len")]
    Overflow,
    #[error("checksum mismatch")]
    Checksum,
    #[error("unknown command `{0}`")]
    UnknownCommand(Name),
    #[error("unknown parameter `{0}`")]
    UnknownParam(Name),
}

impl ParseError {
    /// The `ERR,...` body reported to the host for this failure.
    pub fn reply(&self) -> OutLine {
        let mut line = OutLine::new();
        let _ = match self {
            ParseError::Arity => write!(line, "ERR,parse,arity"),
            ParseError::Number => write!(line, "ERR,parse,num"),
            ParseError::Ascii => write!(line, "ERR,parse,ascii"),
            ParseError::Overflow => write!(line, "ERR,parse,overflow"),
            ParseError::Checksum => write!(line, "ERR,crc"),
            ParseError::UnknownCommand(name) => write!(line, "ERR,cmd,{}", name),
            ParseError::UnknownParam(name) => write!(line, "ERR,param,{}", name),
        };
        line
    }
}

impl From<ParamError> for ParseError {
    fn from(err: ParamError) -> Self {
        match err {
            ParamError::UnknownKey => ParseError::UnknownParam(Name::new()),
            ParamError::InvalidNumber => ParseError::Number,
            ParamError::OutOfRange(key) => ParseError::UnknownParam(name_of(key.as_str())),
        }
    }
}

/// Copy a field into a bounded name, truncating if needed. Lines are ASCII by
/// the time they get here so any byte index is a char boundary.
pub fn name_of(text: &str) -> Name {
    let mut name = Name::new();
    let cut = text.len().min(MAX_NAME_LEN);
    name.push_str(&text[..cut]);
    name
}

/// XOR of every byte, the `*HH` checksum used on the host link.
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Append `*HH` to a line, for clients that want framing validation.
pub fn append_checksum(line: &str) -> alloc::string::String {
    alloc::format!("{}*{:02X}", line, xor_checksum(line.as_bytes()))
}

/// Strip and verify an optional trailing `*HH`. Returns the body on success.
pub fn strip_checksum(line: &str) -> Result<&str, ParseError> {
    let Some(star) = line.rfind('*') else {
        return Ok(line);
    };

    let (body, suffix) = (&line[..star], &line[star + 1..]);
    if suffix.len() != 2 {
        return Err(ParseError::Checksum);
    }
    let expected = u8::from_str_radix(suffix, 16).map_err(|_| ParseError::Checksum)?;
    if xor_checksum(body.as_bytes()) != expected {
        return Err(ParseError::Checksum);
    }
    Ok(body)
}

fn num<T: FromStr>(field: &str) -> Result<T, ParseError> {
    field.trim().parse::<T>().map_err(|_| ParseError::Number)
}

fn finite(field: &str) -> Result<f32, ParseError> {
    let value: f32 = num(field)?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ParseError::Number)
    }
}

/// Parse one delimiter-stripped line into a [`Command`].
pub fn parse_line(line: &str) -> Result<Command, ParseError> {
    if !line.is_ascii() || line.contains(NON_ASCII_MARK) {
        return Err(ParseError::Ascii);
    }
    let body = strip_checksum(line)?;

    let (name, args) = match body.split_once(',') {
        Some((name, args)) => (name, Some(args)),
        None => (body, None),
    };
    let fields: Vec<&str, 8> = match args {
        Some(args) => args.split(',').take(8).collect(),
        None => Vec::new(),
    };
    let fields = fields.as_slice();

    match name.trim() {
        "TWIST" => match fields {
            [vx, wz, seq] => Ok(Command::Twist {
                vx: finite(vx)?,
                wz: finite(wz)?,
                seq: num(seq)?,
            }),
            _ => Err(ParseError::Arity),
        },
        "SAFE" => match fields {
            [flag] => match flag.trim() {
                "0" => Ok(Command::Safe { enabled: false }),
                "1" => Ok(Command::Safe { enabled: true }),
                _ => Err(ParseError::Number),
            },
            _ => Err(ParseError::Arity),
        },
        "PING" => match fields {
            [seq] => Ok(Command::Ping { seq: num(seq)? }),
            _ => Err(ParseError::Arity),
        },
        "RANGE" => match fields {
            [meters, id] => {
                let meters = finite(meters)?;
                if meters < 0.0 {
                    return Err(ParseError::Number);
                }
                Ok(Command::Range { meters, id: num(id)? })
            }
            _ => Err(ParseError::Arity),
        },
        "SET" => match fields {
            [key, value] => {
                let key = ParamKey::lookup(key.trim())
                    .ok_or_else(|| ParseError::UnknownParam(name_of(key.trim())))?;
                let value = key.parse_value(value)?;
                Ok(Command::Set { key, value })
            }
            _ => Err(ParseError::Arity),
        },
        "GET" => match fields {
            [key] => ParamKey::lookup(key.trim())
                .map(|key| Command::Get(GetTarget::Param(key)))
                .ok_or_else(|| ParseError::UnknownParam(name_of(key.trim()))),
            [evt, eid] if evt.trim() == "evt" => Ok(Command::Get(GetTarget::Event(num(eid)?))),
            _ => Err(ParseError::Arity),
        },
        "LED" => match fields {
            [mask] => Ok(Command::Led { mask: num(mask)? }),
            _ => Err(ParseError::Arity),
        },
        "PAUSE" if fields.is_empty() => Ok(Command::Pause),
        "RESUME" if fields.is_empty() => Ok(Command::Resume),
        "STATS" if fields.is_empty() => Ok(Command::Stats),
        "PAUSE" | "RESUME" | "STATS" => Err(ParseError::Arity),
        "REPLAY" => match fields {
            [since] => Ok(Command::Replay { since_eid: num(since)? }),
            _ => Err(ParseError::Arity),
        },
        other => Err(ParseError::UnknownCommand(name_of(other))),
    }
}

/// Result of feeding one byte into the [`LineAssembler`].
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Line(LineBuffer),
    Overflow,
}

/// Reassembles CR/LF-terminated lines without ever growing past the
/// configured cap. An oversized line is dropped whole: the caller gets one
/// `Overflow` event and the rest of that line is skipped up to its terminator.
#[derive(Debug)]
pub struct LineAssembler {
    buffer: LineBuffer,
    discarding: bool,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self {
            buffer: LineBuffer::new(),
            discarding: false,
        }
    }

    pub fn push_byte(&mut self, byte: u8, max_len: usize) -> Option<LineEvent> {
        let max_len = max_len.min(MAX_LINE_CAP);
        match byte {
            b'\r' | b'\n' => {
                if self.discarding {
                    self.discarding = false;
                    return None;
                }
                if self.buffer.is_empty() {
                    return None;
                }
                let line = self.buffer;
                self.buffer.clear();
                Some(LineEvent::Line(line))
            }
            // NUL wakes the link on some hosts; it carries no content
            0 => None,
            _ if self.discarding => None,
            _ => {
                if self.buffer.len() >= max_len {
                    self.buffer.clear();
                    self.discarding = true;
                    return Some(LineEvent::Overflow);
                }
                // Non-ASCII bytes take one slot as DEL so the line fails
                // parsing instead of being silently shortened
                let ch = if byte.is_ascii() { byte as char } else { NON_ASCII_MARK };
                if self.buffer.try_push(ch).is_err() {
                    self.buffer.clear();
                    self.discarding = true;
                    return Some(LineEvent::Overflow);
                }
                None
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProtocolStats {
    pub lines_ok: u32,
    pub parse_errors: u32,
    pub crc_errors: u32,
    pub overflows: u32,
}

/// Host-facing inbound side: assembler plus per-line validation counters.
#[derive(Debug, Default)]
pub struct ProtocolEngine {
    assembler: LineAssembler,
    stats: ProtocolStats,
}

impl ProtocolEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one host byte. Returns a parsed command or the error to report
    /// once a line completes (or overflows).
    pub fn push_byte(&mut self, byte: u8, max_len: usize) -> Option<Result<Command, ParseError>> {
        match self.assembler.push_byte(byte, max_len)? {
            LineEvent::Overflow => {
                self.stats.overflows = self.stats.overflows.saturating_add(1);
                Some(Err(ParseError::Overflow))
            }
            LineEvent::Line(line) => {
                let result = parse_line(&line);
                match &result {
                    Ok(_) => self.stats.lines_ok = self.stats.lines_ok.saturating_add(1),
                    Err(ParseError::Checksum) => {
                        self.stats.crc_errors = self.stats.crc_errors.saturating_add(1);
                    }
                    Err(_) => self.stats.parse_errors = self.stats.parse_errors.saturating_add(1),
                }
                Some(result)
            }
        }
    }

    pub fn stats(&self) -> &ProtocolStats {
        &self.stats
    }
}
