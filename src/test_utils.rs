use time::macros::datetime;
use time::OffsetDateTime;

use crate::bluetooth::decoder::ATC_SERVICE_TAG;
use crate::models::{MacAddress, RawAdvertisement, SensorIdentity};

pub const SALON: MacAddress = MacAddress([0xA4, 0xC1, 0x38, 0x00, 0x00, 0x01]);
pub const CHAMBRE: MacAddress = MacAddress([0xA4, 0xC1, 0x38, 0x00, 0x00, 0x02]);
pub const VOISIN: MacAddress = MacAddress([0xA4, 0xC1, 0x38, 0xFF, 0xFF, 0xFF]);

pub const OBSERVED_AT: OffsetDateTime = datetime!(2026-01-15 08:30:00 UTC);

/// Build a service-data element in the atc1441 layout.
pub fn atc_service_data(
    temperature_decidegrees: i16,
    humidity: u8,
    battery_percent: u8,
    battery_mv: u16,
    counter: u8,
) -> Vec<u8> {
    let mut data = ATC_SERVICE_TAG.to_vec();
    data.extend_from_slice(&[0xA4, 0xC1, 0x38, 0x00, 0x00, 0x01]);
    data.extend_from_slice(&temperature_decidegrees.to_be_bytes());
    data.push(humidity);
    data.push(battery_percent);
    data.extend_from_slice(&battery_mv.to_be_bytes());
    data.push(counter);
    data
}

pub fn advertisement(address: MacAddress, service_data: Vec<u8>) -> RawAdvertisement {
    RawAdvertisement {
        address,
        service_data,
        rssi: Some(-67),
        observed_at: OBSERVED_AT,
    }
}

pub fn identities() -> Vec<SensorIdentity> {
    vec![
        SensorIdentity {
            address: SALON,
            name: "Salon".to_string(),
        },
        SensorIdentity {
            address: CHAMBRE,
            name: "Chambre".to_string(),
        },
    ]
}
