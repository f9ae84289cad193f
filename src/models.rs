use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use time::OffsetDateTime;

/// Bluetooth MAC address of a sensor, stored as 6 bytes.
///
/// Displayed upper-case with colons, which is also the form used in the
/// database `mac` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ParseMacError {
    #[error("invalid MAC address '{0}': expected 6 colon-separated parts")]
    WrongPartCount(String),
    #[error("invalid MAC address '{0}': '{1}' is not a hex byte")]
    InvalidByte(String, String),
}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(ParseMacError::WrongPartCount(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (byte, part) in bytes.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(ParseMacError::InvalidByte(s.to_string(), part.to_string()));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| ParseMacError::InvalidByte(s.to_string(), part.to_string()))?;
        }

        Ok(MacAddress(bytes))
    }
}

impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        MacAddress(addr.0)
    }
}

/// A configured sensor: its radio address and the name used in output and storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorIdentity {
    pub address: MacAddress,
    pub name: String,
}

/// One advertisement as delivered by a discovery source.
///
/// `service_data` is the whole service-data element: the 16-bit UUID tag
/// (little-endian) followed by the vendor payload.
#[derive(Debug, Clone)]
pub struct RawAdvertisement {
    pub address: MacAddress,
    pub service_data: Vec<u8>,
    pub rssi: Option<i16>,
    pub observed_at: OffsetDateTime,
}

/// A fully decoded measurement from one sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub address: MacAddress,
    pub name: String,
    /// Derived once from a tenth-degree integer, so it always has one decimal.
    pub temperature: f64,
    pub humidity: u8,
    pub battery_percent: u8,
    pub battery_mv: u16,
    pub counter: u8,
    pub rssi: Option<i16>,
    pub captured_at: OffsetDateTime,
}
