use crate::net::buffer::Buffer;
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;

/// Hard cap on a whole frame, header included.
pub const MAX_PACKET_SIZE: usize = 512;
/// Frame header: u32 payload length + u32 type code, both big-endian.
pub const HEADER_SIZE: usize = 8;
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Magic number a client must present to enter raw mode.
pub const RAW_MAGIC: u32 = 0xDEAD_BEEF;

/// Key-delivery mode requested at GETTTY time.
pub const HOW_KEYCODES: u32 = 1;
pub const HOW_COMMANDS: u32 = 2;

/// Wire type codes. The values are the ASCII bytes of the historical
/// protocol and must not change.
pub mod opcode {
    pub const AUTHKEY: u32 = b'K' as u32;
    pub const BYE: u32 = b'B' as u32;
    pub const GETDRIVERID: u32 = b'd' as u32;
    pub const GETDRIVERNAME: u32 = b'n' as u32;
    pub const GETDISPLAYSIZE: u32 = b's' as u32;
    pub const GETTTY: u32 = b't' as u32;
    pub const LEAVETTY: u32 = b'L' as u32;
    pub const KEY: u32 = b'k' as u32;
    pub const COMMAND: u32 = b'c' as u32;
    pub const MASKKEYS: u32 = b'm' as u32;
    pub const UNMASKKEYS: u32 = b'u' as u32;
    pub const WRITE: u32 = b'W' as u32;
    pub const WRITEDOTS: u32 = b'D' as u32;
    pub const STATWRITE: u32 = b'S' as u32;
    pub const GETRAW: u32 = b'*' as u32;
    pub const LEAVERAW: u32 = b'#' as u32;
    pub const PACKET: u32 = b'p' as u32;
    pub const ACK: u32 = b'A' as u32;
    pub const ERROR: u32 = b'E' as u32;
}

/// Reads one complete frame off the buffer. Returns `Wait` until a whole
/// frame is available; a declared length above `MAX_PAYLOAD_SIZE` is fatal
/// for the connection before any of the frame is consumed.
pub fn read_frame(buffer: &mut Buffer) -> NetworkResult<(u32, Vec<u8>)> {
    let mut stream = buffer.read_slice();

    if stream.len() < HEADER_SIZE {
        return Err(NetworkError::Wait);
    }

    let length = stream.read_u32::<BigEndian>()? as usize;
    let code = stream.read_u32::<BigEndian>()?;

    if length > MAX_PAYLOAD_SIZE {
        return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
    }

    if stream.len() < length {
        return Err(NetworkError::Wait);
    }

    let payload = stream[..length].to_vec();
    buffer.move_head(HEADER_SIZE + length);

    Ok((code, payload))
}

/// Writes one complete frame into the buffer, atomically: either the whole
/// frame fits into the free capacity or nothing is written and `Wait` is
/// returned.
pub fn write_frame(buffer: &mut Buffer, code: u32, payload: &[u8]) -> NetworkResult<()> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
    }

    let total = HEADER_SIZE + payload.len();

    if total > buffer.free_capacity() {
        return Err(NetworkError::Wait);
    }

    {
        let mut stream = buffer.write_slice();
        stream.write_u32::<BigEndian>(payload.len() as u32)?;
        stream.write_u32::<BigEndian>(code)?;
        stream.write_all(payload)?;
    }

    buffer.move_tail(total);
    Ok(())
}

/// A decoded client request. Structural violations of the payload layout
/// surface as `Fatal(BadFrame)`; semantic checks (value ranges, UTF-8 text)
/// are the dispatcher's business.
#[derive(Debug, Eq, PartialEq)]
pub enum Request {
    AuthKey(Vec<u8>),
    Bye,
    GetDriverId,
    GetDriverName,
    GetDisplaySize,
    GetTty {
        tty: u32,
        how: u32,
        binding: Vec<u8>,
    },
    LeaveTty,
    MaskKeys {
        lo: u32,
        hi: u32,
    },
    UnmaskKeys {
        lo: u32,
        hi: u32,
    },
    Write {
        cursor: u32,
        text: Vec<u8>,
    },
    WriteDots(Vec<u8>),
    StatWrite(Vec<u8>),
    GetRaw {
        magic: u32,
    },
    LeaveRaw,
    RawPacket(Vec<u8>),
    /// Structurally valid frame with a type code the server does not know.
    Unknown(u32),
}

impl Request {
    pub fn decode(code: u32, payload: Vec<u8>) -> NetworkResult<Request> {
        let request = match code {
            opcode::AUTHKEY => Request::AuthKey(payload),
            opcode::BYE => Request::empty(payload, Request::Bye)?,
            opcode::GETDRIVERID => Request::empty(payload, Request::GetDriverId)?,
            opcode::GETDRIVERNAME => Request::empty(payload, Request::GetDriverName)?,
            opcode::GETDISPLAYSIZE => Request::empty(payload, Request::GetDisplaySize)?,
            opcode::GETTTY => {
                let (tty, how) = Request::pair(&payload)?;
                Request::GetTty {
                    tty,
                    how,
                    binding: payload[8..].to_vec(),
                }
            }
            opcode::LEAVETTY => Request::empty(payload, Request::LeaveTty)?,
            opcode::MASKKEYS => {
                let (lo, hi) = Request::exact_pair(&payload)?;
                Request::MaskKeys { lo, hi }
            }
            opcode::UNMASKKEYS => {
                let (lo, hi) = Request::exact_pair(&payload)?;
                Request::UnmaskKeys { lo, hi }
            }
            opcode::WRITE => {
                if payload.len() < 4 {
                    return Err(NetworkError::Fatal(ErrorType::BadFrame));
                }
                let cursor = (&payload[..4]).read_u32::<BigEndian>()?;
                Request::Write {
                    cursor,
                    text: payload[4..].to_vec(),
                }
            }
            opcode::WRITEDOTS => Request::WriteDots(payload),
            opcode::STATWRITE => Request::StatWrite(payload),
            opcode::GETRAW => {
                let magic = Request::single(&payload)?;
                Request::GetRaw { magic }
            }
            opcode::LEAVERAW => Request::empty(payload, Request::LeaveRaw)?,
            opcode::PACKET => Request::RawPacket(payload),
            other => Request::Unknown(other),
        };

        Ok(request)
    }

    #[inline]
    fn empty(payload: Vec<u8>, request: Request) -> NetworkResult<Request> {
        match payload.is_empty() {
            true => Ok(request),
            false => Err(NetworkError::Fatal(ErrorType::BadFrame)),
        }
    }

    #[inline]
    fn single(payload: &[u8]) -> NetworkResult<u32> {
        if payload.len() != 4 {
            return Err(NetworkError::Fatal(ErrorType::BadFrame));
        }
        Ok((&payload[..]).read_u32::<BigEndian>()?)
    }

    #[inline]
    fn pair(payload: &[u8]) -> NetworkResult<(u32, u32)> {
        if payload.len() < 8 {
            return Err(NetworkError::Fatal(ErrorType::BadFrame));
        }
        let mut stream = payload;
        Ok((
            stream.read_u32::<BigEndian>()?,
            stream.read_u32::<BigEndian>()?,
        ))
    }

    #[inline]
    fn exact_pair(payload: &[u8]) -> NetworkResult<(u32, u32)> {
        if payload.len() != 8 {
            return Err(NetworkError::Fatal(ErrorType::BadFrame));
        }
        Request::pair(payload)
    }
}

/// A server-to-client packet.
#[derive(Debug, Eq, PartialEq)]
pub enum Reply<'a> {
    Ack(&'a [u8]),
    Error(u32),
    Key(u32),
    Command(u32),
    RawPacket(&'a [u8]),
}

impl<'a> Reply<'a> {
    #[inline]
    pub fn code(&self) -> u32 {
        match self {
            Reply::Ack(_) => opcode::ACK,
            Reply::Error(_) => opcode::ERROR,
            Reply::Key(_) => opcode::KEY,
            Reply::Command(_) => opcode::COMMAND,
            Reply::RawPacket(_) => opcode::PACKET,
        }
    }

    /// Encodes the reply into the buffer, atomically.
    pub fn write_into(&self, buffer: &mut Buffer) -> NetworkResult<()> {
        match *self {
            Reply::Ack(payload) => write_frame(buffer, opcode::ACK, payload),
            Reply::RawPacket(payload) => write_frame(buffer, opcode::PACKET, payload),
            Reply::Error(value) | Reply::Key(value) | Reply::Command(value) => {
                let mut word = [0u8; 4];
                (&mut word[..]).write_u32::<BigEndian>(value)?;
                write_frame(buffer, self.code(), &word)
            }
        }
    }
}
