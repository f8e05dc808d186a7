use crate::error::IngestError;
use chrono::offset::LocalResult;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;

const GPS_EPOCH_YMD: (i32, u32, u32) = (1980, 1, 6);
/// Longest accepted period: 100 years of days.
const MAX_PERIOD_SECS: i64 = 36_525 * 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundMethod {
    Ceil,
    Floor,
    Round,
    None,
}

impl FromStr for RoundMethod {
    type Err = IngestError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ceil" => Ok(Self::Ceil),
            "floor" => Ok(Self::Floor),
            "round" => Ok(Self::Round),
            "none" | "" => Ok(Self::None),
            _ => Err(IngestError::InvalidRoundMethod(raw.to_string())),
        }
    }
}

impl fmt::Display for RoundMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Ceil => "ceil",
            Self::Floor => "floor",
            Self::Round => "round",
            Self::None => "none",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
}

impl PeriodUnit {
    fn secs(self) -> i64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
            Self::Week => 604_800,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::Second => "S",
            Self::Minute => "M",
            Self::Hour => "H",
            Self::Day => "D",
            Self::Week => "W",
        }
    }
}

/// Fixed-length schedule period such as `01D`, `15min` or `30s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    count: u32,
    unit: PeriodUnit,
}

impl Period {
    pub fn parse(raw: &str) -> Result<Self, IngestError> {
        let trimmed = raw.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);
        let count = if digits.is_empty() {
            1
        } else {
            digits
                .parse::<u32>()
                .map_err(|_| IngestError::InvalidPeriod(raw.to_string()))?
        };
        if count == 0 {
            return Err(IngestError::InvalidPeriod(raw.to_string()));
        }
        let unit = match unit.trim() {
            "s" | "S" | "sec" | "secs" => PeriodUnit::Second,
            "min" | "mins" | "T" | "M" => PeriodUnit::Minute,
            "h" | "H" => PeriodUnit::Hour,
            "d" | "D" => PeriodUnit::Day,
            "w" | "W" => PeriodUnit::Week,
            _ => return Err(IngestError::InvalidPeriod(raw.to_string())),
        };
        let period = Self { count, unit };
        if period.as_secs() > MAX_PERIOD_SECS {
            return Err(IngestError::InvalidPeriod(raw.to_string()));
        }
        Ok(period)
    }

    pub fn from_secs(secs: i64) -> Result<Self, IngestError> {
        let count = u32::try_from(secs)
            .ok()
            .filter(|c| *c > 0 && i64::from(*c) <= MAX_PERIOD_SECS)
            .ok_or_else(|| IngestError::InvalidPeriod(format!("{secs}s")))?;
        Ok(Self {
            count,
            unit: PeriodUnit::Second,
        })
    }

    pub fn as_secs(&self) -> i64 {
        i64::from(self.count) * self.unit.secs()
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.as_secs())
    }

    pub fn unit(&self) -> PeriodUnit {
        self.unit
    }
}

impl FromStr for Period {
    type Err = IngestError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}{}", self.count, self.unit.suffix())
    }
}

/// Anchor of a rolling window: an explicit instant, or an index into the
/// epoch list being rounded (negative counts from the end).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollingRef {
    Instant(DateTime<Utc>),
    Index(isize),
}

/// Schedule turned into discrete work epochs.
///
/// Both bounds are `None` for the invalid sentinel; consumers treat that as
/// "no work". Generation is pure: the same range always yields the same list.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochRange {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    period: Period,
    round_method: RoundMethod,
    timezone: Tz,
    manual: bool,
    explicit_epochs: Vec<DateTime<Utc>>,
    tick: Duration,
}

impl EpochRange {
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        period: Period,
        round_method: RoundMethod,
        timezone: Tz,
    ) -> Result<Self, IngestError> {
        let mut out = Self::invalid(period, timezone);
        out.round_method = round_method;
        let start = out.round_date(start);
        let end = out.round_date(end);
        if start > end {
            return Err(IngestError::InvalidRange {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        out.start = Some(start);
        out.end = Some(end);
        Ok(out)
    }

    /// Builds a range from user-facing strings (see [`parse_instant`]).
    pub fn from_strings(
        start: &str,
        end: &str,
        period: &str,
        round_method: &str,
        timezone: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, IngestError> {
        let tz = parse_timezone(timezone)?;
        let period = Period::parse(period)?;
        let round_method = round_method.parse::<RoundMethod>()?;
        let start = parse_instant(start, tz, now)?;
        let end = parse_instant(end, tz, now)?;
        Self::new(start, end, period, round_method, tz)
    }

    /// Explicit epoch list, returned verbatim by [`EpochRange::generate`].
    pub fn manual(epochs: Vec<DateTime<Utc>>, period: Period, timezone: Tz) -> Self {
        let start = epochs.iter().min().copied();
        let end = epochs.iter().max().copied();
        Self {
            start,
            end,
            period,
            round_method: RoundMethod::None,
            timezone,
            manual: true,
            explicit_epochs: epochs,
            tick: Duration::seconds(1),
        }
    }

    pub fn invalid(period: Period, timezone: Tz) -> Self {
        Self {
            start: None,
            end: None,
            period,
            round_method: RoundMethod::Floor,
            timezone,
            manual: false,
            explicit_epochs: Vec::new(),
            tick: Duration::seconds(1),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn is_valid(&self) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => start <= end,
            _ => false,
        }
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn round_method(&self) -> RoundMethod {
        self.round_method
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Ordered epoch list. With `end_bound` each entry is the end of its
    /// interval: the next boundary minus one tick (manual lists add one
    /// period instead).
    ///
    /// Stepping stops at the first boundary at or past `end`, so an end that
    /// falls between two boundaries still gets the interval after it.
    pub fn generate(&self, end_bound: bool) -> Vec<DateTime<Utc>> {
        let step = self.period.duration();
        if self.manual {
            if end_bound {
                return self
                    .explicit_epochs
                    .iter()
                    .filter_map(|e| e.checked_add_signed(step))
                    .collect();
            }
            return self.explicit_epochs.clone();
        }

        let (Some(start), Some(end)) = (self.start, self.end) else {
            return Vec::new();
        };
        if start > end {
            return Vec::new();
        }

        let mut out = Vec::new();
        let mut cursor = start;
        loop {
            let next = cursor.checked_add_signed(step);
            if end_bound {
                match next.and_then(|n| n.checked_sub_signed(self.tick)) {
                    Some(bound) => out.push(bound),
                    None => break,
                }
            } else {
                out.push(cursor);
            }
            match next {
                Some(next) if cursor < end => cursor = next,
                _ => break,
            }
        }
        out
    }

    /// Rounds one instant to the calendar grid of the range's period,
    /// evaluated in the range's timezone. An instant whose rounded value
    /// leaves chrono's range comes back unchanged.
    pub fn round_date(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        if self.round_method == RoundMethod::None {
            return instant;
        }
        let local = instant.with_timezone(&self.timezone).naive_local();
        let anchor = calendar_anchor(self.period.unit);
        let diff = (local - anchor).num_seconds();
        let rounded = round_secs(diff, self.period.as_secs(), self.round_method);
        Duration::try_seconds(rounded)
            .and_then(|delta| anchor.checked_add_signed(delta))
            .map_or(instant, |naive| local_to_utc(self.timezone, naive))
    }

    pub fn round_dates(&self, instants: &[DateTime<Utc>]) -> Vec<DateTime<Utc>> {
        instants.iter().map(|i| self.round_date(*i)).collect()
    }

    /// Rounds `epochs` to windows of one period. Without a rolling
    /// reference this is calendar rounding; with one, each instant is rounded
    /// relative to the reference so windows are anchored on it.
    pub fn round_epochs(
        &self,
        epochs: &[DateTime<Utc>],
        rolling: Option<RollingRef>,
    ) -> Vec<DateTime<Utc>> {
        let Some(reference) = rolling.and_then(|r| resolve_rolling_ref(r, epochs)) else {
            return self.round_dates(epochs);
        };
        let step = self.period.as_secs();
        epochs
            .iter()
            .map(|epoch| {
                let diff = (*epoch - reference).num_seconds();
                Duration::try_seconds(round_secs(diff, step, self.round_method))
                    .and_then(|delta| reference.checked_add_signed(delta))
                    .unwrap_or(*epoch)
            })
            .collect()
    }
}

fn resolve_rolling_ref(rolling: RollingRef, epochs: &[DateTime<Utc>]) -> Option<DateTime<Utc>> {
    match rolling {
        RollingRef::Instant(instant) => Some(instant),
        RollingRef::Index(index) => {
            let len = epochs.len() as isize;
            let resolved = if index < 0 { len + index } else { index };
            if resolved < 0 || resolved >= len {
                return None;
            }
            epochs.get(resolved as usize).copied()
        }
    }
}

fn calendar_anchor(unit: PeriodUnit) -> NaiveDateTime {
    let (y, m, d) = match unit {
        PeriodUnit::Week => GPS_EPOCH_YMD,
        _ => (1970, 1, 1),
    };
    NaiveDate::from_ymd_opt(y, m, d)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

fn round_secs(value: i64, step: i64, method: RoundMethod) -> i64 {
    if step <= 0 {
        return value;
    }
    let floor = value.div_euclid(step) * step;
    match method {
        RoundMethod::None => value,
        RoundMethod::Floor => floor,
        RoundMethod::Ceil => {
            if floor == value {
                floor
            } else {
                floor + step
            }
        }
        RoundMethod::Round => {
            if (value - floor) * 2 >= step {
                floor + step
            } else {
                floor
            }
        }
    }
}

/// Interprets a naive wall-clock time in `tz`. Ambiguous times take the
/// earliest mapping; times inside a DST gap use the offset in force just
/// before the gap.
pub fn local_to_utc(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(early, _) => early.with_timezone(&Utc),
        LocalResult::None => {
            let offset = tz.offset_from_utc_datetime(&naive).fix().local_minus_utc();
            Utc.from_utc_datetime(&(naive - Duration::seconds(i64::from(offset))))
        }
    }
}

pub fn parse_timezone(raw: &str) -> Result<Tz, IngestError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Tz::UTC);
    }
    trimmed
        .parse::<Tz>()
        .map_err(|_| IngestError::InvalidConfig(format!("unknown timezone `{raw}`")))
}

/// Parses the instant forms accepted on the command line and in config:
/// RFC 3339, `YYYY-MM-DD[ HH:MM[:SS]]`, `YYYY-DDD`, `now`, `today`,
/// `yesterday` and `N <unit>s ago`. Naive values are read in `tz`.
pub fn parse_instant(raw: &str, tz: Tz, now: DateTime<Utc>) -> Result<DateTime<Utc>, IngestError> {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    let today = || {
        let date = now.with_timezone(&tz).date_naive();
        local_to_utc(tz, date.and_hms_opt(0, 0, 0).unwrap_or_default())
    };

    match lower.as_str() {
        "now" => return Ok(now),
        "today" => return Ok(today()),
        "yesterday" => return Ok(today() - Duration::days(1)),
        _ => {}
    }

    if let Some(rest) = lower.strip_suffix(" ago") {
        return parse_relative(rest, now).ok_or_else(|| IngestError::InvalidInstant(raw.to_string()));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(local_to_utc(tz, naive));
        }
    }

    for fmt in ["%Y-%m-%d", "%Y-%j", "%Y%j"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            let naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
            return Ok(local_to_utc(tz, naive));
        }
    }

    Err(IngestError::InvalidInstant(raw.to_string()))
}

fn parse_relative(rest: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut parts = rest.split_whitespace();
    let count = parts.next()?.parse::<i64>().ok()?;
    let unit = parts.next()?.trim_end_matches('s');
    if parts.next().is_some() {
        return None;
    }
    let delta = match unit {
        "second" | "sec" => Duration::try_seconds(count),
        "minute" | "min" => Duration::try_minutes(count),
        "hour" => Duration::try_hours(count),
        "day" => Duration::try_days(count),
        "week" => Duration::try_weeks(count),
        _ => return None,
    }?;
    now.checked_sub_signed(delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .expect("rfc3339")
            .with_timezone(&Utc)
    }

    fn daily(start: &str, end: &str) -> EpochRange {
        EpochRange::new(
            utc(start),
            utc(end),
            Period::parse("1d").expect("period"),
            RoundMethod::Floor,
            Tz::UTC,
        )
        .expect("range")
    }

    #[test]
    fn period_parsing_accepts_common_spellings() {
        assert_eq!(Period::parse("01D").expect("01D").as_secs(), 86_400);
        assert_eq!(Period::parse("15min").expect("15min").as_secs(), 900);
        assert_eq!(Period::parse("30s").expect("30s").as_secs(), 30);
        assert_eq!(Period::parse("1H").expect("1H").as_secs(), 3_600);
        assert_eq!(Period::parse("h").expect("h").as_secs(), 3_600);
        assert_eq!(Period::parse("1W").expect("1W").as_secs(), 604_800);
        assert_eq!(Period::parse("1d").expect("1d").to_string(), "01D");
        let quarter = Period::parse("15min").expect("15min");
        assert_eq!(quarter.to_string(), "15M");
        assert_eq!(Period::parse(&quarter.to_string()).expect("15M"), quarter);
    }

    #[test]
    fn oversized_periods_are_rejected() {
        for raw in ["100000000d", "4294967295W", "99999999999d"] {
            assert!(
                matches!(Period::parse(raw), Err(IngestError::InvalidPeriod(_))),
                "{raw} should be rejected"
            );
        }
        assert!(EpochRange::from_strings(
            "2024-01-01",
            "2024-01-02",
            "100000000d",
            "floor",
            "UTC",
            Utc::now(),
        )
        .is_err());
        assert!(Period::from_secs(i64::from(u32::MAX)).is_err());
    }

    #[test]
    fn longest_period_generates_without_overflow() {
        let range = EpochRange::from_strings(
            "2024-01-01",
            "2024-01-02",
            "36525d",
            "floor",
            "UTC",
            Utc::now(),
        )
        .expect("range");
        assert_eq!(range.generate(false).len(), 1);
        assert_eq!(range.generate(true).len(), 1);
    }

    #[test]
    fn period_parsing_rejects_garbage() {
        for raw in ["", "0d", "1y", "d1", "1 fortnight"] {
            assert!(
                matches!(Period::parse(raw), Err(IngestError::InvalidPeriod(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn round_method_parsing_is_strict() {
        assert_eq!("FLOOR".parse::<RoundMethod>().expect("floor"), RoundMethod::Floor);
        assert!(matches!(
            "sideways".parse::<RoundMethod>(),
            Err(IngestError::InvalidRoundMethod(_))
        ));
    }

    #[test]
    fn three_day_range_yields_three_midnights() {
        let range = EpochRange::from_strings(
            "2024-01-01",
            "2024-01-03",
            "1d",
            "floor",
            "UTC",
            Utc::now(),
        )
        .expect("range");
        assert_eq!(
            range.generate(false),
            vec![
                utc("2024-01-01T00:00:00Z"),
                utc("2024-01-02T00:00:00Z"),
                utc("2024-01-03T00:00:00Z"),
            ]
        );
    }

    #[test]
    fn generated_length_matches_period_count() {
        let start = utc("2024-03-01T00:00:00Z");
        for (period, end, expected) in [
            ("1h", "2024-03-01T05:00:00Z", 6),
            ("15min", "2024-03-01T01:00:00Z", 5),
            ("1d", "2024-03-10T00:00:00Z", 10),
            ("6h", "2024-03-02T00:00:00Z", 5),
        ] {
            let range = EpochRange::new(
                start,
                utc(end),
                Period::parse(period).expect("period"),
                RoundMethod::Floor,
                Tz::UTC,
            )
            .expect("range");
            let epochs = range.generate(false);
            assert_eq!(epochs.len(), expected, "period {period}");
            assert!(epochs.windows(2).all(|w| w[0] < w[1]), "strictly increasing");
        }
    }

    #[test]
    fn end_bound_is_next_start_minus_tick() {
        let range = daily("2024-01-01T00:00:00Z", "2024-01-05T00:00:00Z");
        let starts = range.generate(false);
        let ends = range.generate(true);
        assert_eq!(starts.len(), ends.len());
        for i in 0..starts.len() - 1 {
            assert_eq!(ends[i], starts[i + 1] - Duration::seconds(1));
        }
        assert_eq!(
            ends.last().copied(),
            Some(utc("2024-01-05T23:59:59Z"))
        );
    }

    #[test]
    fn custom_tick_shifts_end_bound() {
        let range = daily("2024-01-01T00:00:00Z", "2024-01-02T00:00:00Z")
            .with_tick(Duration::milliseconds(1));
        let ends = range.generate(true);
        assert_eq!(
            ends[0],
            utc("2024-01-02T00:00:00Z") - Duration::milliseconds(1)
        );
    }

    #[test]
    fn bounds_are_rounded_at_construction() {
        let range = daily("2024-01-01T13:45:00Z", "2024-01-02T01:00:00Z");
        assert_eq!(range.start(), Some(utc("2024-01-01T00:00:00Z")));
        assert_eq!(range.end(), Some(utc("2024-01-02T00:00:00Z")));
    }

    #[test]
    fn reversed_bounds_are_rejected() {
        let err = EpochRange::new(
            utc("2024-01-05T00:00:00Z"),
            utc("2024-01-01T00:00:00Z"),
            Period::parse("1d").expect("period"),
            RoundMethod::Floor,
            Tz::UTC,
        );
        assert!(matches!(err, Err(IngestError::InvalidRange { .. })));
    }

    #[test]
    fn invalid_sentinel_generates_nothing() {
        let range = EpochRange::invalid(Period::parse("1d").expect("period"), Tz::UTC);
        assert!(!range.is_valid());
        assert!(range.generate(false).is_empty());
        assert!(range.generate(true).is_empty());
    }

    #[test]
    fn manual_list_is_returned_verbatim() {
        let epochs = vec![
            utc("2024-02-01T10:17:00Z"),
            utc("2024-01-01T00:00:00Z"),
        ];
        let range = EpochRange::manual(
            epochs.clone(),
            Period::parse("1h").expect("period"),
            Tz::UTC,
        );
        assert!(range.is_manual());
        assert!(range.is_valid());
        assert_eq!(range.generate(false), epochs);
        assert_eq!(
            range.generate(true),
            vec![utc("2024-02-01T11:17:00Z"), utc("2024-01-01T01:00:00Z")]
        );
    }

    #[test]
    fn rounding_methods_behave() {
        let base = |method: RoundMethod| {
            EpochRange::invalid(Period::parse("1h").expect("period"), Tz::UTC)
                .tap_round(method)
        };
        let t = utc("2024-01-01T10:40:00Z");
        assert_eq!(base(RoundMethod::Floor).round_date(t), utc("2024-01-01T10:00:00Z"));
        assert_eq!(base(RoundMethod::Ceil).round_date(t), utc("2024-01-01T11:00:00Z"));
        assert_eq!(base(RoundMethod::Round).round_date(t), utc("2024-01-01T11:00:00Z"));
        assert_eq!(base(RoundMethod::None).round_date(t), t);
        let aligned = utc("2024-01-01T10:00:00Z");
        assert_eq!(base(RoundMethod::Ceil).round_date(aligned), aligned);
    }

    #[test]
    fn daily_rounding_follows_timezone() {
        let mut range = EpochRange::invalid(Period::parse("1d").expect("period"), chrono_tz::Europe::Paris);
        range.round_method = RoundMethod::Floor;
        let rounded = range.round_date(utc("2024-06-10T21:30:00Z"));
        assert_eq!(rounded, utc("2024-06-09T22:00:00Z"));
    }

    #[test]
    fn weekly_rounding_anchors_on_gps_week() {
        let mut range = EpochRange::invalid(Period::parse("1W").expect("period"), Tz::UTC);
        range.round_method = RoundMethod::Floor;
        // 2024-01-10 is a Wednesday; the GPS week started Sunday 2024-01-07.
        let rounded = range.round_date(utc("2024-01-10T12:00:00Z"));
        assert_eq!(rounded, utc("2024-01-07T00:00:00Z"));
    }

    #[test]
    fn rolling_rounding_groups_relative_to_reference() {
        let mut range = EpochRange::invalid(Period::parse("1h").expect("period"), Tz::UTC);
        range.round_method = RoundMethod::Floor;
        let epochs = vec![
            utc("2024-01-01T10:05:00Z"),
            utc("2024-01-01T10:20:00Z"),
            utc("2024-01-01T11:10:00Z"),
        ];
        let by_index = range.round_epochs(&epochs, Some(RollingRef::Index(0)));
        assert_eq!(
            by_index,
            vec![
                utc("2024-01-01T10:05:00Z"),
                utc("2024-01-01T10:05:00Z"),
                utc("2024-01-01T11:05:00Z"),
            ]
        );

        let by_last = range.round_epochs(&epochs, Some(RollingRef::Index(-1)));
        assert_eq!(by_last[0], utc("2024-01-01T09:10:00Z"));
        assert_eq!(by_last[2], utc("2024-01-01T11:10:00Z"));

        let calendar = range.round_epochs(&epochs, None);
        assert_eq!(calendar[0], utc("2024-01-01T10:00:00Z"));

        let out_of_bounds = range.round_epochs(&epochs, Some(RollingRef::Index(9)));
        assert_eq!(out_of_bounds, calendar);
    }

    #[test]
    fn instant_parsing_covers_supported_forms() {
        let now = utc("2024-05-20T15:30:00Z");
        let tz = Tz::UTC;
        assert_eq!(parse_instant("now", tz, now).expect("now"), now);
        assert_eq!(
            parse_instant("today", tz, now).expect("today"),
            utc("2024-05-20T00:00:00Z")
        );
        assert_eq!(
            parse_instant("yesterday", tz, now).expect("yesterday"),
            utc("2024-05-19T00:00:00Z")
        );
        assert_eq!(
            parse_instant("3 days ago", tz, now).expect("ago"),
            utc("2024-05-17T15:30:00Z")
        );
        assert_eq!(
            parse_instant("2024-032", tz, now).expect("doy"),
            utc("2024-02-01T00:00:00Z")
        );
        assert_eq!(
            parse_instant("2024-02-01 06:00", tz, now).expect("hm"),
            utc("2024-02-01T06:00:00Z")
        );
        assert_eq!(
            parse_instant("2024-02-01T06:00:00+02:00", tz, now).expect("rfc"),
            utc("2024-02-01T04:00:00Z")
        );
        assert!(parse_instant("next tuesday", tz, now).is_err());
    }

    #[test]
    fn huge_relative_instants_are_rejected() {
        let now = utc("2024-05-20T15:30:00Z");
        for raw in [
            "999999999999999 days ago",
            "9223372036854775807 seconds ago",
            "99999999999 weeks ago",
        ] {
            assert!(
                matches!(parse_instant(raw, Tz::UTC, now), Err(IngestError::InvalidInstant(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn unaligned_end_gets_the_interval_after_it() {
        let range = EpochRange::new(
            utc("2024-01-01T00:00:00Z"),
            utc("2024-01-02T12:00:00Z"),
            Period::parse("1d").expect("period"),
            RoundMethod::None,
            Tz::UTC,
        )
        .expect("range");
        assert_eq!(
            range.generate(false),
            vec![
                utc("2024-01-01T00:00:00Z"),
                utc("2024-01-02T00:00:00Z"),
                utc("2024-01-03T00:00:00Z"),
            ]
        );
        assert_eq!(range.generate(true).len(), 3);

        let single = EpochRange::new(
            utc("2024-01-01T06:00:00Z"),
            utc("2024-01-01T06:00:00Z"),
            Period::parse("1h").expect("period"),
            RoundMethod::None,
            Tz::UTC,
        )
        .expect("range");
        assert_eq!(single.generate(false), vec![utc("2024-01-01T06:00:00Z")]);
    }

    impl EpochRange {
        fn tap_round(mut self, method: RoundMethod) -> Self {
            self.round_method = method;
            self
        }
    }
}
