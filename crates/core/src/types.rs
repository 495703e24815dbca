use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::FrameError;

pub const MAX_CALLSIGN_LEN: usize = 6;
pub const MAX_SSID: u8 = 15;
/// Encoded size of one address entry.
pub const ADDRESS_LEN: usize = 7;
pub const MAX_DIGIPEATERS: usize = 8;

/// A station identifier: base callsign plus SSID, e.g. `N0CALL-7`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Callsign {
    call: [u8; MAX_CALLSIGN_LEN],
    len: u8,
    ssid: u8,
}

impl Callsign {
    pub fn new(call: &str, ssid: u8) -> Result<Self, FrameError> {
        if call.is_empty() || call.len() > MAX_CALLSIGN_LEN {
            return Err(FrameError::InvalidCallsign(call.to_string()));
        }
        if ssid > MAX_SSID {
            return Err(FrameError::InvalidSsid(ssid));
        }
        let mut buf = [b' '; MAX_CALLSIGN_LEN];
        for (slot, c) in buf.iter_mut().zip(call.bytes()) {
            if !c.is_ascii_alphanumeric() {
                return Err(FrameError::InvalidCallsign(call.to_string()));
            }
            *slot = c.to_ascii_uppercase();
        }
        Ok(Self {
            call: buf,
            len: call.len() as u8,
            ssid,
        })
    }

    pub fn call(&self) -> &str {
        // only ASCII alphanumerics are ever stored
        std::str::from_utf8(&self.call[..self.len as usize]).unwrap_or("")
    }

    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    /// Same base callsign with a different SSID.
    pub fn with_ssid(&self, ssid: u8) -> Result<Self, FrameError> {
        Self::new(self.call(), ssid)
    }

    /// Encode as a 7-byte AX.25 address entry.
    ///
    /// `high_bit` is the C bit for source/destination entries and the
    /// has-been-repeated bit for digipeaters.
    pub fn to_address_bytes(&self, high_bit: bool, last: bool) -> [u8; ADDRESS_LEN] {
        let mut out = [0u8; ADDRESS_LEN];
        for (i, b) in self.call.iter().enumerate() {
            out[i] = b << 1;
        }
        out[6] = 0b0110_0000 | (self.ssid << 1) | last as u8 | ((high_bit as u8) << 7);
        out
    }

    /// Decode a 7-byte address entry, returning the callsign, the high bit
    /// and the address-extension (last entry) bit.
    pub fn from_address_bytes(bytes: &[u8]) -> Result<(Self, bool, bool), FrameError> {
        if bytes.len() < ADDRESS_LEN {
            return Err(FrameError::Truncated);
        }
        let mut call = String::with_capacity(MAX_CALLSIGN_LEN);
        for b in &bytes[..MAX_CALLSIGN_LEN] {
            if b & 0x01 != 0 {
                return Err(FrameError::InvalidAddress);
            }
            let c = (b >> 1) as char;
            if c != ' ' {
                call.push(c);
            }
        }
        let ssid_byte = bytes[6];
        let ssid = (ssid_byte >> 1) & 0x0F;
        let callsign = Self::new(call.trim_end(), ssid)?;
        Ok((callsign, ssid_byte & 0x80 != 0, ssid_byte & 0x01 != 0))
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.call())
        } else {
            write!(f, "{}-{}", self.call(), self.ssid)
        }
    }
}

impl fmt::Debug for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callsign({})", self)
    }
}

impl FromStr for Callsign {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((call, ssid)) => {
                let ssid = ssid
                    .parse::<u8>()
                    .map_err(|_| FrameError::InvalidCallsign(s.to_string()))?;
                Self::new(call, ssid)
            }
            None => Self::new(s, 0),
        }
    }
}

impl TryFrom<String> for Callsign {
    type Error = FrameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Callsign> for String {
    fn from(value: Callsign) -> Self {
        value.to_string()
    }
}

/// Protocol identifier carried by I and UI frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolId {
    /// No layer 3, plain text. The usual BBS traffic.
    Text,
    NetRom,
    Other(u8),
}

impl ProtocolId {
    pub const TEXT: u8 = 0xF0;
    pub const NETROM: u8 = 0xCF;

    pub fn to_byte(self) -> u8 {
        match self {
            ProtocolId::Text => Self::TEXT,
            ProtocolId::NetRom => Self::NETROM,
            ProtocolId::Other(b) => b,
        }
    }
}

impl From<u8> for ProtocolId {
    fn from(b: u8) -> Self {
        match b {
            Self::TEXT => ProtocolId::Text,
            Self::NETROM => ProtocolId::NetRom,
            other => ProtocolId::Other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_and_displays_ssid() {
        let c: Callsign = "n0call-7".parse().unwrap();
        assert_eq!(c.call(), "N0CALL");
        assert_eq!(c.ssid(), 7);
        assert_eq!(c.to_string(), "N0CALL-7");

        let plain: Callsign = "BBS".parse().unwrap();
        assert_eq!(plain.to_string(), "BBS");
    }

    #[test]
    fn test_rejects_bad_callsigns() {
        assert!("TOOLONGCALL".parse::<Callsign>().is_err());
        assert!("N0CALL-16".parse::<Callsign>().is_err());
        assert!("".parse::<Callsign>().is_err());
        assert!("N0/CALL".parse::<Callsign>().is_err());
    }

    #[test]
    fn test_address_bytes_are_shifted() {
        let c: Callsign = "AB1C-3".parse().unwrap();
        let bytes = c.to_address_bytes(true, true);
        assert_eq!(bytes[0], b'A' << 1);
        assert_eq!(bytes[4], b' ' << 1);
        assert_eq!(bytes[6], 0b1110_0111);

        let (back, high, last) = Callsign::from_address_bytes(&bytes).unwrap();
        assert_eq!(back, c);
        assert!(high);
        assert!(last);
    }

    #[test]
    fn test_pid_bytes() {
        assert_eq!(ProtocolId::from(0xF0), ProtocolId::Text);
        assert_eq!(ProtocolId::from(0x08), ProtocolId::Other(0x08));
        assert_eq!(ProtocolId::NetRom.to_byte(), 0xCF);
    }
}
