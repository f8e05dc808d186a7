use crate::error::IngestError;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

const DEFAULT_MONUMENT: &str = "00";
const DEFAULT_COUNTRY: &str = "XXX";

/// Station identifier in its 4-char and 9-char (`SSSSMRCCC`) forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteId {
    four: String,
    nine: String,
}

impl SiteId {
    pub fn parse(raw: &str) -> Result<Self, IngestError> {
        let clean = raw.trim().to_ascii_uppercase();
        if clean.len() < 4 || !clean.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(IngestError::InvalidConfig(format!(
                "site id `{raw}` must be at least 4 alphanumeric characters"
            )));
        }
        let four = clean[..4].to_string();
        let nine = if clean.len() >= 9 {
            clean[..9].to_string()
        } else {
            format!("{four}{DEFAULT_MONUMENT}{DEFAULT_COUNTRY}")
        };
        Ok(Self { four, nine })
    }

    pub fn four(&self) -> &str {
        &self.four
    }

    pub fn nine(&self) -> &str {
        &self.nine
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.four)
    }
}

/// What a file name says about its station and start epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileNameInfo {
    pub site: Option<SiteId>,
    pub epoch: Option<DateTime<Utc>>,
}

fn long_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9]{9})_[A-Za-z]_(\d{4})(\d{3})(\d{2})(\d{2})_")
            .expect("long-name regex is valid")
    })
}

fn short_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9]{4})(\d{3})([a-xA-X0])(\d{2})?\.(\d{2})[A-Za-z]")
            .expect("short-name regex is valid")
    })
}

fn doy_epoch(year: i32, doy: u32, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let date = NaiveDate::from_yo_opt(year, doy)?;
    let naive = date.and_hms_opt(hour, minute, 0)?;
    Some(naive.and_utc())
}

/// Hour-of-day letter used in short file names: `a` for 00h .. `x` for 23h.
pub fn hour_letter(hour: u32) -> char {
    if hour > 23 {
        return '0';
    }
    (b'a' + hour as u8) as char
}

fn letter_hour(letter: char) -> Option<u32> {
    let lower = letter.to_ascii_lowercase();
    if ('a'..='x').contains(&lower) {
        return Some(u32::from(lower as u8 - b'a'));
    }
    None
}

/// Infers station and start epoch from long (`SSSSMRCCC_S_YYYYDDDHHMM_...`)
/// or short (`ssssDDDf.YYt`) RINEX-style names.
pub fn infer_from_filename(name: &str) -> FileNameInfo {
    if let Some(caps) = long_name_re().captures(name) {
        let site = SiteId::parse(&caps[1]).ok();
        let epoch = (|| {
            let year = caps[2].parse::<i32>().ok()?;
            let doy = caps[3].parse::<u32>().ok()?;
            let hour = caps[4].parse::<u32>().ok()?;
            let minute = caps[5].parse::<u32>().ok()?;
            doy_epoch(year, doy, hour, minute)
        })();
        return FileNameInfo { site, epoch };
    }

    if let Some(caps) = short_name_re().captures(name) {
        let site = SiteId::parse(&caps[1]).ok();
        let epoch = (|| {
            let doy = caps[2].parse::<u32>().ok()?;
            let session = caps[3].chars().next()?;
            let minute = caps
                .get(4)
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .unwrap_or(0);
            let yy = caps[5].parse::<i32>().ok()?;
            let year = if yy < 80 { 2000 + yy } else { 1900 + yy };
            let hour = letter_hour(session).unwrap_or(0);
            doy_epoch(year, doy, hour, minute)
        })();
        return FileNameInfo { site, epoch };
    }

    let prefix: String = name
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .take(4)
        .collect();
    FileNameInfo {
        site: SiteId::parse(&prefix).ok(),
        epoch: None,
    }
}

/// GPS week number and day-of-week of an instant.
pub fn gps_week(instant: DateTime<Utc>) -> (i64, i64) {
    let origin = doy_epoch(1980, 6, 0, 0).unwrap_or_default();
    let days = (instant - origin).num_days();
    (days.div_euclid(7), days.rem_euclid(7))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_id_expands_short_form() {
        let site = SiteId::parse("mlvl").expect("site");
        assert_eq!(site.four(), "MLVL");
        assert_eq!(site.nine(), "MLVL00XXX");

        let long = SiteId::parse("mlvl00fra").expect("site");
        assert_eq!(long.nine(), "MLVL00FRA");
        assert!(SiteId::parse("ab").is_err());
        assert!(SiteId::parse("ab-d").is_err());
    }

    #[test]
    fn long_names_yield_site_and_epoch() {
        let info = infer_from_filename("MLVL00FRA_R_20240150300_01H_30S_MO.crx.gz");
        assert_eq!(info.site.as_ref().map(SiteId::nine), Some("MLVL00FRA"));
        assert_eq!(
            info.epoch,
            Some(
                DateTime::parse_from_rfc3339("2024-01-15T03:00:00Z")
                    .expect("rfc")
                    .with_timezone(&Utc)
            )
        );
    }

    #[test]
    fn short_names_use_session_letter() {
        let info = infer_from_filename("smne032c.24o");
        assert_eq!(info.site.as_ref().map(SiteId::four), Some("SMNE"));
        assert_eq!(
            info.epoch,
            Some(
                DateTime::parse_from_rfc3339("2024-02-01T02:00:00Z")
                    .expect("rfc")
                    .with_timezone(&Utc)
            )
        );

        let daily = infer_from_filename("smne0320.99d.Z");
        assert_eq!(
            daily.epoch.map(|e| e.to_rfc3339()),
            Some("1999-02-01T00:00:00+00:00".to_string())
        );
    }

    #[test]
    fn unknown_names_fall_back_to_prefix() {
        let info = infer_from_filename("abcd_raw_dump.sbf");
        assert_eq!(info.site.as_ref().map(SiteId::four), Some("ABCD"));
        assert_eq!(info.epoch, None);
    }

    #[test]
    fn hour_letters_cover_the_day() {
        assert_eq!(hour_letter(0), 'a');
        assert_eq!(hour_letter(23), 'x');
        assert_eq!(letter_hour('c'), Some(2));
        assert_eq!(letter_hour('0'), None);
    }

    #[test]
    fn gps_week_of_known_date() {
        let instant = DateTime::parse_from_rfc3339("2024-01-10T12:00:00Z")
            .expect("rfc")
            .with_timezone(&Utc);
        assert_eq!(gps_week(instant), (2296, 3));
    }
}
