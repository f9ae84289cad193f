/// Formatting helpers for console output
use time::macros::format_description;
use time::OffsetDateTime;

use crate::bluetooth::ScanOutcome;
use crate::models::Reading;

/// Format a timestamp as YYYY-MM-DD HH:MM for status lines
///
/// Falls back to the default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    dt.format(format_description!("[year]-[month]-[day] [hour]:[minute]"))
        .unwrap_or_else(|_| dt.to_string())
}

/// One line per decoded sensor, printed on stdout.
pub fn format_status_line(reading: &Reading) -> String {
    let rssi = reading
        .rssi
        .map(|rssi| format!("{:4} dBm", rssi))
        .unwrap_or_else(|| "   ? dBm".to_string());

    format!(
        "{}  {}  {}  {:5.1}°C  {:3}%  batt {:3}% ({} mV)  {}  #{:03}",
        format_datetime(&reading.captured_at),
        reading.name,
        reading.address,
        reading.temperature,
        reading.humidity,
        reading.battery_percent,
        reading.battery_mv,
        rssi,
        reading.counter,
    )
}

/// Summary of a finished scan, for the log.
pub fn format_scan_summary(outcome: &ScanOutcome, target: usize) -> String {
    let stats = &outcome.stats;
    format!(
        "Scan {:?}: {}/{} sensor(s), {} advertisement(s), {} unknown, {} duplicate(s), {} undecodable, {} poll error(s)",
        outcome.state,
        outcome.readings.len(),
        target,
        stats.advertisements,
        stats.unknown,
        stats.duplicates,
        stats.decode_failures,
        stats.poll_errors,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::decoder::decode_advertisement;
    use crate::bluetooth::session::ScanStats;
    use crate::bluetooth::ScanState;
    use crate::test_utils::{advertisement, atc_service_data, OBSERVED_AT, SALON};

    #[test]
    fn datetime_format() {
        assert_eq!(format_datetime(&OBSERVED_AT), "2026-01-15 08:30");
    }

    #[test]
    fn status_line_contains_decoded_values() {
        let reading =
            decode_advertisement(&advertisement(SALON, atc_service_data(-55, 61, 92, 2987, 7)), "Salon")
                .unwrap();
        assert_eq!(
            format_status_line(&reading),
            "2026-01-15 08:30  Salon  A4:C1:38:00:00:01   -5.5°C   61%  batt  92% (2987 mV)   -67 dBm  #007"
        );
    }

    #[test]
    fn status_line_without_rssi() {
        let mut adv = advertisement(SALON, atc_service_data(200, 45, 87, 2950, 0));
        adv.rssi = None;
        let reading = decode_advertisement(&adv, "Salon").unwrap();
        assert!(format_status_line(&reading).contains("   ? dBm"));
    }

    #[test]
    fn summary_mentions_counts() {
        let outcome = ScanOutcome {
            state: ScanState::TimedOut,
            readings: Vec::new(),
            stats: ScanStats {
                advertisements: 9,
                unknown: 4,
                duplicates: 3,
                decode_failures: 2,
                poll_errors: 0,
            },
        };
        assert_eq!(
            format_scan_summary(&outcome, 2),
            "Scan TimedOut: 0/2 sensor(s), 9 advertisement(s), 4 unknown, 3 duplicate(s), 2 undecodable, 0 poll error(s)"
        );
    }
}
