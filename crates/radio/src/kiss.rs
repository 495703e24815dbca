//! KISS framing between the host and a TNC.
//!
//! ```text
//! FEND | port<<4 | command | escaped data ... | FEND
//! ```
//! Inside a frame `FEND` is sent as `FESC TFEND` and `FESC` as `FESC TFESC`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

pub const FEND: u8 = 0xC0;
pub const FESC: u8 = 0xDB;
pub const TFEND: u8 = 0xDC;
pub const TFESC: u8 = 0xDD;

const RETURN: u8 = 0xFF;

#[derive(Debug, Error)]
pub enum KissError {
    #[error("invalid escape sequence FESC {0:#04x}")]
    InvalidEscape(u8),

    #[error("frame ends inside an escape sequence")]
    TruncatedEscape,

    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KissCommand {
    Data,
    TxDelay,
    Persistence,
    SlotTime,
    TxTail,
    FullDuplex,
    SetHardware,
    /// Leave KISS mode. Not port addressed.
    Return,
    Unknown(u8),
}

impl KissCommand {
    fn from_nibble(n: u8) -> Self {
        match n {
            0 => KissCommand::Data,
            1 => KissCommand::TxDelay,
            2 => KissCommand::Persistence,
            3 => KissCommand::SlotTime,
            4 => KissCommand::TxTail,
            5 => KissCommand::FullDuplex,
            6 => KissCommand::SetHardware,
            other => KissCommand::Unknown(other),
        }
    }

    fn nibble(self) -> u8 {
        match self {
            KissCommand::Data => 0,
            KissCommand::TxDelay => 1,
            KissCommand::Persistence => 2,
            KissCommand::SlotTime => 3,
            KissCommand::TxTail => 4,
            KissCommand::FullDuplex => 5,
            KissCommand::SetHardware => 6,
            KissCommand::Return => 0x0F,
            KissCommand::Unknown(n) => n & 0x0F,
        }
    }
}

/// One KISS frame: the port/command byte split up, plus unescaped data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KissFrame {
    pub port: u8,
    pub command: KissCommand,
    pub data: Bytes,
}

impl KissFrame {
    pub fn data(port: u8, data: Bytes) -> Self {
        Self {
            port,
            command: KissCommand::Data,
            data,
        }
    }

    pub fn command(port: u8, command: KissCommand, value: u8) -> Self {
        Self {
            port,
            command,
            data: Bytes::copy_from_slice(&[value]),
        }
    }

    fn type_byte(&self) -> u8 {
        match self.command {
            KissCommand::Return => RETURN,
            cmd => ((self.port & 0x0F) << 4) | cmd.nibble(),
        }
    }

    fn from_type_byte(b: u8, data: Bytes) -> Self {
        if b == RETURN {
            return Self {
                port: 0x0F,
                command: KissCommand::Return,
                data,
            };
        }
        Self {
            port: b >> 4,
            command: KissCommand::from_nibble(b & 0x0F),
            data,
        }
    }
}

/// Stateless apart from the bytes retained by the caller's buffer and the
/// skip-to-next-delimiter flag after an oversize frame.
#[derive(Debug, Clone)]
pub struct KissCodec {
    max_frame: usize,
    discarding: bool,
}

impl KissCodec {
    /// `max_frame` bounds the unescaped data of a frame.
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame,
            discarding: false,
        }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    fn unescape(&self, raw: &[u8]) -> Result<BytesMut, KissError> {
        let mut out = BytesMut::with_capacity(raw.len());
        let mut iter = raw.iter();
        while let Some(&b) = iter.next() {
            if b == FESC {
                match iter.next() {
                    Some(&TFEND) => out.put_u8(FEND),
                    Some(&TFESC) => out.put_u8(FESC),
                    Some(&other) => return Err(KissError::InvalidEscape(other)),
                    None => return Err(KissError::TruncatedEscape),
                }
            } else {
                out.put_u8(b);
            }
        }
        Ok(out)
    }
}

fn put_escaped(dst: &mut BytesMut, b: u8) {
    match b {
        FEND => dst.put_slice(&[FESC, TFEND]),
        FESC => dst.put_slice(&[FESC, TFESC]),
        _ => dst.put_u8(b),
    }
}

impl Decoder for KissCodec {
    type Item = KissFrame;
    type Error = KissError;

    /// Yields one frame per call. A malformed frame is consumed before the
    /// error is returned, so decoding can resume with the next call.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<KissFrame>, KissError> {
        loop {
            if self.discarding {
                match src.iter().position(|&b| b == FEND) {
                    Some(pos) => {
                        src.advance(pos);
                        self.discarding = false;
                    }
                    None => {
                        src.clear();
                        return Ok(None);
                    }
                }
            }

            let leading = src.iter().take_while(|&&b| b == FEND).count();
            src.advance(leading);
            if src.is_empty() {
                return Ok(None);
            }

            let Some(end) = src.iter().position(|&b| b == FEND) else {
                // one command byte on top of the data
                let escapes = src.iter().filter(|&&b| b == FESC).count();
                let size = src.len() - escapes;
                if size > self.max_frame + 1 {
                    self.discarding = true;
                    src.clear();
                    return Err(KissError::FrameTooLarge {
                        size,
                        max: self.max_frame,
                    });
                }
                return Ok(None);
            };

            let raw = src.split_to(end);
            src.advance(1);

            let mut frame = self.unescape(&raw)?;
            if frame.is_empty() {
                continue;
            }
            let type_byte = frame.get_u8();
            if frame.len() > self.max_frame {
                return Err(KissError::FrameTooLarge {
                    size: frame.len(),
                    max: self.max_frame,
                });
            }
            return Ok(Some(KissFrame::from_type_byte(type_byte, frame.freeze())));
        }
    }
}

impl Encoder<KissFrame> for KissCodec {
    type Error = KissError;

    fn encode(&mut self, item: KissFrame, dst: &mut BytesMut) -> Result<(), KissError> {
        if item.data.len() > self.max_frame {
            return Err(KissError::FrameTooLarge {
                size: item.data.len(),
                max: self.max_frame,
            });
        }
        dst.reserve(item.data.len() * 2 + 3);
        dst.put_u8(FEND);
        put_escaped(dst, item.type_byte());
        for &b in item.data.iter() {
            put_escaped(dst, b);
        }
        dst.put_u8(FEND);
        Ok(())
    }
}
