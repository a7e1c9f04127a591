//! Minimal NMEA 0183 handling for the reference provider.
//!
//! The grandmaster only needs two things from the serial stream: the UTC
//! second a sentence describes and whether the receiver claims a valid
//! fix. `$--RMC` carries both plus the date; `$--ZDA` carries time and
//! date with full year. Everything else is ignored.

use chrono::NaiveDate;

/// Time information extracted from one sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmeaTime {
    /// Unix seconds of the described UTC second (fractional part dropped;
    /// sentences label whole PPS edges).
    pub utc_sec: u64,
    pub fix_valid: bool,
}

/// Parse one line. Returns `None` for sentences without usable time, for
/// unknown types and for checksum failures.
pub fn parse_sentence(line: &str) -> Option<NmeaTime> {
    let line = line.trim();
    let body = verify_checksum(line)?;

    let mut fields = body.split(',');
    let tag = fields.next()?;
    if tag.len() != 5 {
        return None;
    }
    // Talker ID (GP/GN/GL/GA/...) varies by constellation; match the type.
    match &tag[2..] {
        "RMC" => parse_rmc(body),
        "ZDA" => parse_zda(body),
        _ => None,
    }
}

/// Strip `$`, verify the `*hh` XOR checksum, return the sentence body.
fn verify_checksum(line: &str) -> Option<&str> {
    let rest = line.strip_prefix('$')?;
    let (body, sum_hex) = rest.rsplit_once('*')?;
    if sum_hex.len() != 2 {
        return None;
    }
    let expected = u8::from_str_radix(sum_hex, 16).ok()?;
    let actual = body.bytes().fold(0u8, |acc, b| acc ^ b);
    if actual != expected {
        return None;
    }
    Some(body)
}

/// `$--RMC,hhmmss.ss,A,lat,N,lon,E,sog,cog,ddmmyy,...`
fn parse_rmc(body: &str) -> Option<NmeaTime> {
    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() < 10 {
        return None;
    }
    let (hour, min, sec) = parse_hms(fields[1])?;
    let fix_valid = fields[2] == "A";

    let date = fields[9];
    if date.len() != 6 || !date.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let day: u32 = date[0..2].parse().ok()?;
    let month: u32 = date[2..4].parse().ok()?;
    let year: i32 = 2000 + date[4..6].parse::<i32>().ok()?;

    let utc_sec = to_unix_seconds(year, month, day, hour, min, sec)?;
    Some(NmeaTime { utc_sec, fix_valid })
}

/// `$--ZDA,hhmmss.ss,dd,mm,yyyy,zh,zm`
fn parse_zda(body: &str) -> Option<NmeaTime> {
    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() < 5 {
        return None;
    }
    let (hour, min, sec) = parse_hms(fields[1])?;
    let day: u32 = fields[2].parse().ok()?;
    let month: u32 = fields[3].parse().ok()?;
    let year: i32 = fields[4].parse().ok()?;

    let utc_sec = to_unix_seconds(year, month, day, hour, min, sec)?;
    // ZDA carries no fix status; a receiver emitting ZDA has time.
    Some(NmeaTime {
        utc_sec,
        fix_valid: true,
    })
}

fn parse_hms(field: &str) -> Option<(u32, u32, u32)> {
    if field.len() < 6 {
        return None;
    }
    let whole = &field[..6];
    if !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hour: u32 = whole[0..2].parse().ok()?;
    let min: u32 = whole[2..4].parse().ok()?;
    let sec: u32 = whole[4..6].parse().ok()?;
    Some((hour, min, sec))
}

fn to_unix_seconds(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<u64> {
    let dt = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, min, sec)?;
    let ts = dt.and_utc().timestamp();
    u64::try_from(ts).ok()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn with_checksum(body: &str) -> String {
        let sum = body.bytes().fold(0u8, |acc, b| acc ^ b);
        format!("${}*{:02X}", body, sum)
    }

    #[test]
    fn test_rmc_valid_fix() {
        let line = with_checksum("GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W");
        let t = parse_sentence(&line).expect("RMC should parse");
        assert!(t.fix_valid);
        // 1994-03-23 12:35:19 UTC
        assert_eq!(t.utc_sec, 764_426_119);
    }

    #[test]
    fn test_rmc_void_fix() {
        let line = with_checksum("GPRMC,123519,V,,,,,,,230394,,");
        let t = parse_sentence(&line).expect("void RMC still carries time");
        assert!(!t.fix_valid);
    }

    #[test]
    fn test_rmc_fractional_seconds_truncated() {
        let a = with_checksum("GNRMC,120000.00,A,,,,,,,010124,,");
        let b = with_checksum("GNRMC,120000.75,A,,,,,,,010124,,");
        let ta = parse_sentence(&a).unwrap();
        let tb = parse_sentence(&b).unwrap();
        assert_eq!(ta.utc_sec, tb.utc_sec);
    }

    #[test]
    fn test_zda() {
        let line = with_checksum("GPZDA,160012.71,11,03,2004,-1,00");
        let t = parse_sentence(&line).expect("ZDA should parse");
        assert!(t.fix_valid);
        // 2004-03-11 16:00:12 UTC
        assert_eq!(t.utc_sec, 1_079_020_812);
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let line = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*00";
        assert_eq!(parse_sentence(line), None);
    }

    #[test]
    fn test_missing_checksum_rejected() {
        assert_eq!(
            parse_sentence("$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W"),
            None
        );
    }

    #[test]
    fn test_unrelated_sentences_ignored() {
        let gga = with_checksum("GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,");
        assert_eq!(parse_sentence(&gga), None);
    }

    #[test]
    fn test_garbage_tolerated() {
        assert_eq!(parse_sentence(""), None);
        assert_eq!(parse_sentence("not nmea at all"), None);
        assert_eq!(parse_sentence("$*00"), None);
        assert_eq!(parse_sentence("$GPRMC,*4A"), None);
    }

    #[test]
    fn test_alternate_talkers_accepted() {
        let gn = with_checksum("GNRMC,000000,A,,,,,,,010100,,");
        let t = parse_sentence(&gn).expect("GN talker should parse");
        // 2000-01-01 00:00:00 UTC (RMC years are two-digit, 2000-based).
        assert_eq!(t.utc_sec, 946_684_800);
    }
}
