//! AX.25 frame model and its on-air encoding (modulo 8).

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::types::{Callsign, ProtocolId, ADDRESS_LEN, MAX_DIGIPEATERS};
use crate::FrameError;

/// Sequence numbers are three bit counters.
pub const SEQ_MODULUS: u8 = 8;

const POLL_FINAL: u8 = 0x10;

const U_SABM: u8 = 0x2F;
const U_DISC: u8 = 0x43;
const U_UA: u8 = 0x63;
const U_DM: u8 = 0x0F;
const U_UI: u8 = 0x03;
const U_FRMR: u8 = 0x87;

const S_RR: u8 = 0x00;
const S_RNR: u8 = 0x01;
const S_REJ: u8 = 0x02;

/// Control field of a frame.
///
/// Only `Information` and the supervisory variants carry sequence numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Control {
    /// SABM, a connect request.
    Connect,
    /// DISC, a disconnect request.
    Disconnect,
    /// UA, acknowledges a CONNECT or a DISCONNECT.
    UnnumberedAck,
    /// DM, refuses a connect or reports that no link exists.
    DisconnectedMode,
    FrameReject,
    Information { ns: u8, nr: u8 },
    /// RR, acknowledges everything before `nr`.
    ReceiveReady { nr: u8 },
    ReceiveNotReady { nr: u8 },
    /// REJ, requests retransmission starting at `nr`.
    Reject { nr: u8 },
    /// UI, unnumbered information used for unacknowledged traffic.
    Unproto,
}

impl Control {
    pub fn to_byte(self, poll_final: bool) -> u8 {
        let pf = if poll_final { POLL_FINAL } else { 0 };
        match self {
            Control::Connect => U_SABM | pf,
            Control::Disconnect => U_DISC | pf,
            Control::UnnumberedAck => U_UA | pf,
            Control::DisconnectedMode => U_DM | pf,
            Control::FrameReject => U_FRMR | pf,
            Control::Unproto => U_UI | pf,
            Control::Information { ns, nr } => ((nr & 7) << 5) | pf | ((ns & 7) << 1),
            Control::ReceiveReady { nr } => ((nr & 7) << 5) | pf | (S_RR << 2) | 0x01,
            Control::ReceiveNotReady { nr } => ((nr & 7) << 5) | pf | (S_RNR << 2) | 0x01,
            Control::Reject { nr } => ((nr & 7) << 5) | pf | (S_REJ << 2) | 0x01,
        }
    }

    /// Decode a control byte into the control field and its poll/final bit.
    pub fn from_byte(b: u8) -> Result<(Self, bool), FrameError> {
        let pf = b & POLL_FINAL != 0;
        let nr = b >> 5;
        if b & 0x01 == 0 {
            return Ok((Control::Information { ns: (b >> 1) & 7, nr }, pf));
        }
        if b & 0x03 == 0x01 {
            let control = match (b >> 2) & 0x03 {
                S_RR => Control::ReceiveReady { nr },
                S_RNR => Control::ReceiveNotReady { nr },
                S_REJ => Control::Reject { nr },
                _ => return Err(FrameError::UnsupportedControl(b)),
            };
            return Ok((control, pf));
        }
        let control = match b & !POLL_FINAL {
            U_SABM => Control::Connect,
            U_DISC => Control::Disconnect,
            U_UA => Control::UnnumberedAck,
            U_DM => Control::DisconnectedMode,
            U_FRMR => Control::FrameReject,
            U_UI => Control::Unproto,
            _ => return Err(FrameError::UnsupportedControl(b)),
        };
        Ok((control, pf))
    }

    /// Whether frames of this kind carry a PID byte.
    pub fn has_pid(self) -> bool {
        matches!(self, Control::Information { .. } | Control::Unproto)
    }

    pub fn send_sequence(self) -> Option<u8> {
        match self {
            Control::Information { ns, .. } => Some(ns),
            _ => None,
        }
    }

    pub fn receive_sequence(self) -> Option<u8> {
        match self {
            Control::Information { nr, .. }
            | Control::ReceiveReady { nr }
            | Control::ReceiveNotReady { nr }
            | Control::Reject { nr } => Some(nr),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Control::Connect => "SABM",
            Control::Disconnect => "DISC",
            Control::UnnumberedAck => "UA",
            Control::DisconnectedMode => "DM",
            Control::FrameReject => "FRMR",
            Control::Information { .. } => "I",
            Control::ReceiveReady { .. } => "RR",
            Control::ReceiveNotReady { .. } => "RNR",
            Control::Reject { .. } => "REJ",
            Control::Unproto => "UI",
        }
    }
}

/// A decoded link layer frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub destination: Callsign,
    pub source: Callsign,
    /// Digipeater path. Decoded and preserved only.
    pub digipeaters: Vec<Callsign>,
    /// Command (true) or response (false).
    pub command: bool,
    pub control: Control,
    pub poll_final: bool,
    /// Present exactly when `control.has_pid()`.
    pub pid: Option<ProtocolId>,
    pub payload: Bytes,
}

impl Frame {
    /// A frame without information field.
    pub fn new(
        destination: Callsign,
        source: Callsign,
        control: Control,
        command: bool,
        poll_final: bool,
    ) -> Self {
        Self {
            destination,
            source,
            digipeaters: Vec::new(),
            command,
            control,
            poll_final,
            pid: None,
            payload: Bytes::new(),
        }
    }

    pub fn information(
        destination: Callsign,
        source: Callsign,
        ns: u8,
        nr: u8,
        poll: bool,
        pid: ProtocolId,
        payload: Bytes,
    ) -> Self {
        Self {
            destination,
            source,
            digipeaters: Vec::new(),
            command: true,
            control: Control::Information { ns: ns % SEQ_MODULUS, nr: nr % SEQ_MODULUS },
            poll_final: poll,
            pid: Some(pid),
            payload,
        }
    }

    pub fn unproto(destination: Callsign, source: Callsign, pid: ProtocolId, payload: Bytes) -> Self {
        Self {
            destination,
            source,
            digipeaters: Vec::new(),
            command: true,
            control: Control::Unproto,
            poll_final: false,
            pid: Some(pid),
            payload,
        }
    }

    /// Encoded length without KISS framing.
    pub fn encoded_len(&self) -> usize {
        let pid = usize::from(self.pid.is_some());
        ADDRESS_LEN * (2 + self.digipeaters.len()) + 1 + pid + self.payload.len()
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        if self.digipeaters.len() > MAX_DIGIPEATERS {
            return Err(FrameError::TooManyDigipeaters(self.digipeaters.len()));
        }
        if self.control.has_pid() != self.pid.is_some() {
            return Err(FrameError::PidMismatch);
        }

        let mut out = BytesMut::with_capacity(self.encoded_len());
        let no_digis = self.digipeaters.is_empty();
        out.put_slice(&self.destination.to_address_bytes(self.command, false));
        out.put_slice(&self.source.to_address_bytes(!self.command, no_digis));
        for (i, digi) in self.digipeaters.iter().enumerate() {
            let last = i + 1 == self.digipeaters.len();
            out.put_slice(&digi.to_address_bytes(false, last));
        }
        out.put_u8(self.control.to_byte(self.poll_final));
        if let Some(pid) = self.pid {
            out.put_u8(pid.to_byte());
        }
        out.put_slice(&self.payload);
        Ok(out.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < ADDRESS_LEN * 2 + 1 {
            return Err(FrameError::Truncated);
        }

        let (destination, dest_c, dest_last) = Callsign::from_address_bytes(&data[..ADDRESS_LEN])?;
        if dest_last {
            return Err(FrameError::InvalidAddress);
        }
        let (source, src_c, mut last) =
            Callsign::from_address_bytes(&data[ADDRESS_LEN..ADDRESS_LEN * 2])?;

        let mut offset = ADDRESS_LEN * 2;
        let mut digipeaters = Vec::new();
        while !last {
            if digipeaters.len() == MAX_DIGIPEATERS {
                return Err(FrameError::TooManyDigipeaters(digipeaters.len() + 1));
            }
            let entry = data
                .get(offset..offset + ADDRESS_LEN)
                .ok_or(FrameError::Truncated)?;
            let (digi, _repeated, is_last) = Callsign::from_address_bytes(entry)?;
            digipeaters.push(digi);
            last = is_last;
            offset += ADDRESS_LEN;
        }

        let control_byte = *data.get(offset).ok_or(FrameError::Truncated)?;
        offset += 1;
        let (control, poll_final) = Control::from_byte(control_byte)?;

        let pid = if control.has_pid() {
            let b = *data.get(offset).ok_or(FrameError::Truncated)?;
            offset += 1;
            Some(ProtocolId::from(b))
        } else {
            None
        };

        // version 1 stations leave both C bits equal; treat that as a command
        let command = dest_c || !src_c;

        Ok(Self {
            destination,
            source,
            digipeaters,
            command,
            control,
            poll_final,
            pid,
            payload: Bytes::copy_from_slice(&data[offset..]),
        })
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}>{}", self.source, self.destination)?;
        for digi in &self.digipeaters {
            write!(f, ",{}", digi)?;
        }
        write!(f, " {}", self.control.label())?;
        if let Some(ns) = self.control.send_sequence() {
            write!(f, " s{}", ns)?;
        }
        if let Some(nr) = self.control.receive_sequence() {
            write!(f, " r{}", nr)?;
        }
        if self.poll_final {
            f.write_str(if self.command { " P" } else { " F" })?;
        }
        if let Some(pid) = self.pid {
            write!(f, " pid={:02X} len={}", pid.to_byte(), self.payload.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calls() -> (Callsign, Callsign) {
        ("BBS-1".parse().unwrap(), "N0CALL".parse().unwrap())
    }

    #[test]
    fn test_control_bytes_match_ax25() {
        assert_eq!(Control::Connect.to_byte(true), 0x3F);
        assert_eq!(Control::Disconnect.to_byte(true), 0x53);
        assert_eq!(Control::UnnumberedAck.to_byte(true), 0x73);
        assert_eq!(Control::DisconnectedMode.to_byte(false), 0x0F);
        assert_eq!(Control::Unproto.to_byte(false), 0x03);
        assert_eq!(Control::ReceiveReady { nr: 3 }.to_byte(false), 0x61);
        assert_eq!(Control::Reject { nr: 1 }.to_byte(true), 0x39);
        assert_eq!(Control::Information { ns: 2, nr: 5 }.to_byte(false), 0xA4);
    }

    #[test]
    fn test_control_decode_recovers_fields() {
        for b in [0x3F, 0x53, 0x73, 0x0F, 0x03, 0x61, 0x39, 0xA4, 0xB4, 0x87] {
            let (control, pf) = Control::from_byte(b).unwrap();
            assert_eq!(control.to_byte(pf), b);
        }
        // SREJ and SABME are not spoken here
        assert!(Control::from_byte(0x0D).is_err());
        assert!(Control::from_byte(0x6F).is_err());
    }

    #[test]
    fn test_information_frame_roundtrip() {
        let (bbs, user) = calls();
        let frame = Frame::information(bbs, user, 3, 6, true, ProtocolId::Text, Bytes::from_static(b"mail\r"));
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), frame.encoded_len());
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_command_response_bits() {
        let (bbs, user) = calls();
        let response = Frame::new(user, bbs, Control::UnnumberedAck, false, true);
        let encoded = response.encode().unwrap();
        assert_eq!(encoded[6] & 0x80, 0);
        assert_eq!(encoded[13] & 0x80, 0x80);
        let decoded = Frame::decode(&encoded).unwrap();
        assert!(!decoded.command);
        assert_eq!(decoded.to_string(), "BBS-1>N0CALL UA F");
    }

    #[test]
    fn test_digipeater_path_is_preserved() {
        let (bbs, user) = calls();
        let mut frame = Frame::unproto(bbs, user, ProtocolId::Text, Bytes::from_static(b"hi"));
        frame.digipeaters = vec!["WIDE1-1".parse().unwrap(), "RELAY".parse().unwrap()];
        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.digipeaters, frame.digipeaters);
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn test_truncated_frames_fail() {
        let (bbs, user) = calls();
        let frame = Frame::information(bbs, user, 0, 0, false, ProtocolId::Text, Bytes::new());
        let encoded = frame.encode().unwrap();
        assert!(matches!(Frame::decode(&encoded[..10]), Err(FrameError::Truncated)));
        // I frame without its PID byte
        assert!(matches!(Frame::decode(&encoded[..15]), Err(FrameError::Truncated)));
    }

    #[test]
    fn test_pid_must_match_control() {
        let (bbs, user) = calls();
        let mut frame = Frame::new(bbs, user, Control::Connect, true, true);
        frame.pid = Some(ProtocolId::Text);
        assert!(matches!(frame.encode(), Err(FrameError::PidMismatch)));
    }
}
