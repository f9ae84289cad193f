/// Decoding of the ATC (atc1441 custom firmware) advertisement format
use thiserror::Error;

use crate::models::{RawAdvertisement, Reading};

// Environmental Sensing service 0x181A, as it appears on air (little-endian)
pub const ATC_SERVICE_TAG: [u8; 2] = [0x1a, 0x18];
pub const MIN_PAYLOAD_LEN: usize = 13;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame too short: payload has {len} bytes, need at least {MIN_PAYLOAD_LEN}")]
    FrameTooShort { len: usize },
    #[error("malformed frame: {0}")]
    FrameMalformed(String),
}

/// Sensor values carried by one ATC advertisement, before any identity is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtcFrame {
    /// Temperature in tenths of a degree Celsius
    pub temperature_decidegrees: i16,
    pub humidity: u8,
    pub battery_percent: u8,
    pub battery_mv: u16,
    pub counter: u8,
}

impl AtcFrame {
    /// Decode a service-data element (tag + payload) in the atc1441 layout.
    ///
    /// Payload layout after the 2-byte tag:
    /// - Bytes 0-5: MAC address (not used, the radio stack already reports it)
    /// - Bytes 6-7: Temperature (signed 16-bit, big-endian, 0.1°C)
    /// - Byte 8: Humidity (%)
    /// - Byte 9: Battery (%)
    /// - Bytes 10-11: Battery voltage (unsigned 16-bit, big-endian, mV)
    /// - Byte 12: Rotating frame counter
    ///
    /// # Arguments
    ///
    /// * `service_data` - The 2-byte `1a 18` tag followed by the payload
    ///
    /// # Returns
    ///
    /// The raw fields, `FrameMalformed` for a missing or wrong tag, or
    /// `FrameTooShort` when the payload is under 13 bytes.
    pub fn decode(service_data: &[u8]) -> Result<Self, DecodeError> {
        let Some((tag, payload)) = service_data.split_first_chunk::<2>() else {
            return Err(DecodeError::FrameMalformed(format!(
                "{} bytes, no service tag",
                service_data.len()
            )));
        };
        if *tag != ATC_SERVICE_TAG {
            return Err(DecodeError::FrameMalformed(format!(
                "unexpected service tag {:02x}{:02x}",
                tag[0], tag[1]
            )));
        }
        if payload.len() < MIN_PAYLOAD_LEN {
            return Err(DecodeError::FrameTooShort { len: payload.len() });
        }

        Ok(AtcFrame {
            temperature_decidegrees: i16::from_be_bytes([payload[6], payload[7]]),
            humidity: payload[8],
            battery_percent: payload[9],
            battery_mv: u16::from_be_bytes([payload[10], payload[11]]),
            counter: payload.get(12).copied().unwrap_or(0),
        })
    }

    pub fn temperature(&self) -> f64 {
        f64::from(self.temperature_decidegrees) / 10.0
    }
}

/// Decode an advertisement into a complete [`Reading`] for the named sensor.
///
/// The advertisement's own observation time becomes `captured_at`, so the
/// result depends only on the input.
///
/// # Arguments
///
/// * `adv` - Advertisement from an allow-listed sensor
/// * `name` - Configured name of that sensor
///
/// # Returns
///
/// A `Reading` carrying the advertisement's RSSI, or the frame's `DecodeError`.
pub fn decode_advertisement(adv: &RawAdvertisement, name: &str) -> Result<Reading, DecodeError> {
    let frame = AtcFrame::decode(&adv.service_data)?;

    Ok(Reading {
        address: adv.address,
        name: name.to_string(),
        temperature: frame.temperature(),
        humidity: frame.humidity,
        battery_percent: frame.battery_percent,
        battery_mv: frame.battery_mv,
        counter: frame.counter,
        rssi: adv.rssi,
        captured_at: adv.observed_at,
    })
}
