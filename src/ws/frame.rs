//! RFC 6455 frame codec and message reassembly.
//!
//! The parser handles the client-to-server direction only, so a clear
//! mask bit is a protocol violation. The builder produces unmasked
//! frames for the server-to-client direction; masked building exists
//! for exercising the parser.

use tokio::io::AsyncRead;

use crate::error::Error;
use crate::stream::SocketReader;

/// Frame opcodes. Control opcodes have values above `0x7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    pub(crate) fn from_u8(value: u8) -> Option<OpCode> {
        match value {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    pub fn is_control(self) -> bool {
        (self as u8) > 0x7
    }
}

/// A single parsed frame, payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }
}

/// A complete message: one unfragmented frame, or a reassembled
/// fragment sequence. Control frames surface as their own messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Close(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

impl Message {
    /// The status code of a close message, when one was supplied.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Message::Close(body) if body.len() >= 2 => {
                Some(u16::from_be_bytes([body[0], body[1]]))
            }
            _ => None,
        }
    }
}

/// Read one frame. `None` on a short read where more bytes were
/// expected; [`Error::Format`] on any RFC 6455 violation.
pub(crate) async fn parse_frame<R>(reader: &mut SocketReader<R>) -> Result<Option<Frame>, Error>
where
    R: AsyncRead + Unpin,
{
    let head = match reader.read_exact(2).await? {
        Some(head) => head,
        None => return Ok(None),
    };
    let (first, second) = (head[0], head[1]);

    let fin = first & 0x80 != 0;
    let rsv = first & 0x70;
    let opcode_bits = first & 0x0F;
    let masked = second & 0x80 != 0;
    let mut length = u64::from(second & 0x7F);

    let opcode = OpCode::from_u8(opcode_bits)
        .ok_or_else(|| Error::format(format!("unknown opcode 0x{:X}", opcode_bits)))?;

    if rsv != 0 {
        return Err(Error::format("reserved bits must be zero"));
    }
    if opcode.is_control() {
        if !fin {
            return Err(Error::format("control frames must not be fragmented"));
        }
        if length > 125 {
            return Err(Error::format("control frame payload exceeds 125 bytes"));
        }
    }
    if !masked {
        return Err(Error::format("client frames must be masked"));
    }

    if length == 126 {
        let ext = match reader.read_exact(2).await? {
            Some(ext) => ext,
            None => return Ok(None),
        };
        length = u64::from(u16::from_be_bytes([ext[0], ext[1]]));
    } else if length == 127 {
        let ext = match reader.read_exact(8).await? {
            Some(ext) => ext,
            None => return Ok(None),
        };
        length = u64::from_be_bytes([
            ext[0], ext[1], ext[2], ext[3], ext[4], ext[5], ext[6], ext[7],
        ]);
    }

    let mask = match reader.read_exact(4).await? {
        Some(mask) => mask,
        None => return Ok(None),
    };

    let mut payload = if length > 0 {
        match reader.read_exact(length as usize).await? {
            Some(payload) => payload.to_vec(),
            None => return Ok(None),
        }
    } else {
        Vec::new()
    };

    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }

    Ok(Some(Frame { fin, opcode, payload }))
}

/// Reassembles frames into messages for one connection.
///
/// Control frames are yielded immediately and never join an in-progress
/// fragment sequence.
#[derive(Default)]
pub(crate) struct MessageParser {
    frames: Vec<Frame>,
}

impl MessageParser {
    pub(crate) fn new() -> MessageParser {
        MessageParser::default()
    }

    /// Next complete message, or `None` once the stream ends.
    pub(crate) async fn next_message<R>(
        &mut self,
        reader: &mut SocketReader<R>,
    ) -> Result<Option<Message>, Error>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = match parse_frame(reader).await? {
                Some(frame) => frame,
                None => return Ok(None),
            };

            if frame.is_control() {
                let msg = match frame.opcode {
                    OpCode::Close => Message::Close(frame.payload),
                    OpCode::Ping => Message::Ping(frame.payload),
                    _ => Message::Pong(frame.payload),
                };
                return Ok(Some(msg));
            }

            if self.frames.is_empty()
                && !matches!(frame.opcode, OpCode::Text | OpCode::Binary)
            {
                return Err(Error::format("first data frame must be text or binary"));
            }
            if !self.frames.is_empty() && frame.opcode != OpCode::Continuation {
                return Err(Error::format(
                    "data frames of different messages cannot be interleaved",
                ));
            }

            let fin = frame.fin;
            self.frames.push(frame);
            if fin {
                return Ok(Some(self.build_message()?));
            }
        }
    }

    fn build_message(&mut self) -> Result<Message, Error> {
        let frames = std::mem::take(&mut self.frames);
        let opcode = frames[0].opcode;
        let mut payload = Vec::new();
        for frame in frames {
            payload.extend_from_slice(&frame.payload);
        }
        match opcode {
            OpCode::Text => {
                let text = String::from_utf8(payload)
                    .map_err(|_| Error::format("invalid utf-8 in text message"))?;
                Ok(Message::Text(text))
            }
            _ => Ok(Message::Binary(payload)),
        }
    }
}

/// Builds wire frames.
pub struct FrameBuilder;

impl FrameBuilder {
    /// Encode one frame. `masked` generates a random client-side mask;
    /// server frames are unmasked.
    pub fn build(fin: bool, opcode: OpCode, payload: &[u8], masked: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 14);

        let mut first = opcode as u8;
        if fin {
            first |= 0x80;
        }
        out.push(first);

        let mask_bit = if masked { 0x80 } else { 0x00 };
        let len = payload.len();
        if len <= 125 {
            out.push(mask_bit | len as u8);
        } else if len < 65536 {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        if masked {
            let mask: [u8; 4] = rand::random();
            out.extend_from_slice(&mask);
            out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        } else {
            out.extend_from_slice(payload);
        }
        out
    }

    pub fn text(payload: &str) -> Vec<u8> {
        FrameBuilder::build(true, OpCode::Text, payload.as_bytes(), false)
    }

    pub fn binary(payload: &[u8]) -> Vec<u8> {
        FrameBuilder::build(true, OpCode::Binary, payload, false)
    }

    pub fn ping(payload: &[u8]) -> Vec<u8> {
        FrameBuilder::build(true, OpCode::Ping, payload, false)
    }

    pub fn pong(payload: &[u8]) -> Vec<u8> {
        FrameBuilder::build(true, OpCode::Pong, payload, false)
    }

    /// A close frame: empty body, or a big-endian status code followed
    /// by the reason. A reason without a code defaults to `1000`.
    pub fn close(code: Option<u16>, reason: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        if code.is_some() || !reason.is_empty() {
            body.extend_from_slice(&code.unwrap_or(1000).to_be_bytes());
            body.extend_from_slice(reason);
        }
        FrameBuilder::build(true, OpCode::Close, &body, false)
    }

    pub(crate) fn close_with_body(body: &[u8]) -> Vec<u8> {
        FrameBuilder::build(true, OpCode::Close, body, false)
    }
}
