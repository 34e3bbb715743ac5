//! Resolution of time-range codes into concrete date windows.
//!
//! A time-range code such as `30d` names a policy, and [`resolve_window`] applies it to a
//! point in time. Calendar-aligned windows end at the start of the current week, month,
//! quarter, year or even-year biennium; daily windows end at today's midnight. Codes ending
//! in `p` select the window immediately preceding the unsuffixed one.

use std::fmt;
use std::str::FromStr;

use calcmetric_config::shared::MetricConfig;
use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveDateTime, Utc};

use crate::bail;
use crate::error::{ErrorKind, MetricError, MetricResult};
use crate::metric_error;
use crate::types::DateWindow;

/// Formats accepted for custom bounds, tried in order.
///
/// Each entry pads the input with the given suffix before parsing, so that coarser inputs
/// such as `2023-10` are completed to a full timestamp.
const DATE_FORMATS: &[(&str, &str)] = &[
    ("%Y-%m-%dT%H:%M:%SZ", ""),
    ("%Y-%m-%d %H:%M:%S", ""),
    ("%Y-%m-%d %H:%M", ""),
    ("%Y-%m-%d %H:%M", ":00"),
    ("%Y-%m-%d %H:%M", " 00:00"),
    ("%Y-%m-%d %H:%M", "-01 00:00"),
    ("%Y-%m-%d %H:%M", "-01-01 00:00"),
];

/// Symbolic time range a metric is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeRange {
    /// `7d`
    Week,
    /// `7dp`
    PreviousWeek,
    /// `30d`
    Month,
    /// `30dp`
    PreviousMonth,
    /// `q`
    Quarter,
    /// `qp`
    PreviousQuarter,
    /// `ty`
    YearToDate,
    /// `typ`
    PreviousYearToDate,
    /// `y`
    Year,
    /// `yp`
    PreviousYear,
    /// `2y`
    TwoYears,
    /// `2yp`
    PreviousTwoYears,
    /// `a`
    AllTime,
    /// `c`
    Custom,
}

impl TimeRange {
    pub const ALL: [TimeRange; 14] = [
        TimeRange::Week,
        TimeRange::PreviousWeek,
        TimeRange::Month,
        TimeRange::PreviousMonth,
        TimeRange::Quarter,
        TimeRange::PreviousQuarter,
        TimeRange::YearToDate,
        TimeRange::PreviousYearToDate,
        TimeRange::Year,
        TimeRange::PreviousYear,
        TimeRange::TwoYears,
        TimeRange::PreviousTwoYears,
        TimeRange::AllTime,
        TimeRange::Custom,
    ];

    /// Returns the code stored in the `time_range` column.
    pub fn code(&self) -> &'static str {
        match self {
            TimeRange::Week => "7d",
            TimeRange::PreviousWeek => "7dp",
            TimeRange::Month => "30d",
            TimeRange::PreviousMonth => "30dp",
            TimeRange::Quarter => "q",
            TimeRange::PreviousQuarter => "qp",
            TimeRange::YearToDate => "ty",
            TimeRange::PreviousYearToDate => "typ",
            TimeRange::Year => "y",
            TimeRange::PreviousYear => "yp",
            TimeRange::TwoYears => "2y",
            TimeRange::PreviousTwoYears => "2yp",
            TimeRange::AllTime => "a",
            TimeRange::Custom => "c",
        }
    }

    /// Returns `true` for ranges selecting the period before the current one.
    pub fn is_previous(&self) -> bool {
        matches!(
            self,
            TimeRange::PreviousWeek
                | TimeRange::PreviousMonth
                | TimeRange::PreviousQuarter
                | TimeRange::PreviousYearToDate
                | TimeRange::PreviousYear
                | TimeRange::PreviousTwoYears
        )
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for TimeRange {
    type Err = MetricError;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        TimeRange::ALL
            .into_iter()
            .find(|range| range.code() == code)
            .ok_or_else(|| {
                metric_error!(
                    ErrorKind::InvalidTimeRange,
                    "Unknown time range",
                    format!("unknown time range: '{code}'")
                )
            })
    }
}

/// Settings that influence how a [`TimeRange`] resolves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowOptions {
    pub week_daily: bool,
    pub month_daily: bool,
    pub quarter_daily: bool,
    pub year_daily: bool,
    pub year2_daily: bool,
    /// Lower bound of a custom range, in any format accepted by [`parse_any_date`].
    pub date_from: Option<String>,
    /// Upper bound of a custom range, in any format accepted by [`parse_any_date`].
    pub date_to: Option<String>,
}

impl WindowOptions {
    pub fn from_config(config: &MetricConfig) -> Self {
        Self {
            week_daily: config.calc_week_daily,
            month_daily: config.calc_month_daily,
            quarter_daily: config.calc_quarter_daily,
            year_daily: config.calc_year_daily,
            year2_daily: config.calc_year2_daily,
            date_from: config.date_from.clone(),
            date_to: config.date_to.clone(),
        }
    }
}

/// Resolves `range` into a day-aligned window relative to `now`.
///
/// `ty` resolved on January 1st yields an empty window, since the year has not started yet.
pub fn resolve_window(
    range: TimeRange,
    options: &WindowOptions,
    now: DateTime<Utc>,
) -> MetricResult<DateWindow> {
    let today = now.date_naive();

    let window = match range {
        TimeRange::Week | TimeRange::PreviousWeek => {
            let to = if options.week_daily {
                today
            } else {
                week_start(today)
            };
            let window = DateWindow::new(sub_days(to, 7)?, to);
            shift_days(window, range.is_previous(), 7)?
        }
        TimeRange::Month | TimeRange::PreviousMonth => {
            if options.month_daily {
                let window = DateWindow::new(sub_days(today, 30)?, today);
                shift_days(window, range.is_previous(), 30)?
            } else {
                months_back(month_start(today), 1, range.is_previous())?
            }
        }
        TimeRange::Quarter | TimeRange::PreviousQuarter => {
            let to = if options.quarter_daily {
                today
            } else {
                quarter_start(today)
            };
            months_back(to, 3, range.is_previous())?
        }
        TimeRange::YearToDate | TimeRange::PreviousYearToDate => {
            let window = DateWindow::new(year_start(today), today);
            let days = window.days().unsigned_abs();
            shift_days(window, range.is_previous(), days)?
        }
        TimeRange::Year | TimeRange::PreviousYear => {
            let to = if options.year_daily {
                today
            } else {
                year_start(today)
            };
            months_back(to, 12, range.is_previous())?
        }
        TimeRange::TwoYears | TimeRange::PreviousTwoYears => {
            let to = if options.year2_daily {
                today
            } else {
                biennium_start(today)?
            };
            months_back(to, 24, range.is_previous())?
        }
        TimeRange::AllTime => DateWindow::new(ymd(1970, 1, 1)?, ymd(2100, 1, 1)?),
        TimeRange::Custom => custom_window(options)?,
    };

    Ok(window)
}

/// Parses a date written in one of the progressively coarser formats of [`DATE_FORMATS`],
/// truncated to the start of its day.
pub fn parse_any_date(value: &str) -> MetricResult<NaiveDate> {
    let value = value.trim();

    for (format, suffix) in DATE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(&format!("{value}{suffix}"), format) {
            return Ok(parsed.date());
        }
    }

    bail!(
        ErrorKind::DateParseError,
        "Date parsing failed",
        format!("cannot parse date: '{value}'")
    )
}

fn custom_window(options: &WindowOptions) -> MetricResult<DateWindow> {
    let Some(date_from) = options.date_from.as_deref() else {
        bail!(
            ErrorKind::ConfigError,
            "Custom time range requires explicit bounds",
            "you must specify V3_DATE_FROM when using V3_TIME_RANGE=c"
        );
    };
    let Some(date_to) = options.date_to.as_deref() else {
        bail!(
            ErrorKind::ConfigError,
            "Custom time range requires explicit bounds",
            "you must specify V3_DATE_TO when using V3_TIME_RANGE=c"
        );
    };

    let window = DateWindow::new(parse_any_date(date_from)?, parse_any_date(date_to)?);
    if window.is_empty() {
        bail!(
            ErrorKind::InvalidTimeRange,
            "Custom time range is empty",
            format!("custom time range {window} must end after it starts")
        );
    }

    Ok(window)
}

/// Builds the window of `months` months ending at `to`, moved back by its own length when
/// `previous` is set. Month arithmetic clamps to the last day of the month.
fn months_back(to: NaiveDate, months: u32, previous: bool) -> MetricResult<DateWindow> {
    let to = if previous { sub_months(to, months)? } else { to };

    Ok(DateWindow::new(sub_months(to, months)?, to))
}

fn shift_days(window: DateWindow, previous: bool, days: u64) -> MetricResult<DateWindow> {
    if !previous {
        return Ok(window);
    }

    window.shifted_back(days).ok_or_else(out_of_range)
}

fn sub_days(date: NaiveDate, days: u64) -> MetricResult<NaiveDate> {
    date.checked_sub_days(Days::new(days))
        .ok_or_else(out_of_range)
}

fn sub_months(date: NaiveDate, months: u32) -> MetricResult<NaiveDate> {
    date.checked_sub_months(Months::new(months))
        .ok_or_else(out_of_range)
}

fn ymd(year: i32, month: u32, day: u32) -> MetricResult<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(out_of_range)
}

fn out_of_range() -> MetricError {
    metric_error!(
        ErrorKind::InvalidTimeRange,
        "Time range is out of the supported date range"
    )
}

/// Monday of the week containing `date`.
fn week_start(date: NaiveDate) -> NaiveDate {
    date - Days::new(u64::from(date.weekday().num_days_from_monday()))
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn quarter_start(date: NaiveDate) -> NaiveDate {
    let month = (date.month0() / 3) * 3 + 1;
    NaiveDate::from_ymd_opt(date.year(), month, 1).unwrap_or(date)
}

fn year_start(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date)
}

/// January 1st of the latest even year not after `date`.
fn biennium_start(date: NaiveDate) -> MetricResult<NaiveDate> {
    let year = date.year() - date.year().rem_euclid(2);
    ymd(year, 1, 1)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 13, 45, 12).unwrap()
    }

    fn window(from: NaiveDate, to: NaiveDate) -> DateWindow {
        DateWindow::new(from, to)
    }

    fn resolve(code: &str, options: &WindowOptions, now: DateTime<Utc>) -> DateWindow {
        resolve_window(code.parse().unwrap(), options, now).unwrap()
    }

    fn daily() -> WindowOptions {
        WindowOptions {
            week_daily: true,
            month_daily: true,
            quarter_daily: true,
            year_daily: true,
            year2_daily: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_codes() {
        for range in TimeRange::ALL {
            assert_eq!(range.code().parse::<TimeRange>().unwrap(), range);
        }

        let err = "3m".parse::<TimeRange>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTimeRange);
        assert_eq!(err.detail(), Some("unknown time range: '3m'"));
    }

    #[test]
    fn test_calendar_windows() {
        // 2024-05-15 is a Wednesday.
        let now = at(2024, 5, 15);
        let options = WindowOptions::default();

        assert_eq!(
            resolve("7d", &options, now),
            window(date(2024, 5, 6), date(2024, 5, 13))
        );
        assert_eq!(
            resolve("7dp", &options, now),
            window(date(2024, 4, 29), date(2024, 5, 6))
        );
        assert_eq!(
            resolve("30d", &options, now),
            window(date(2024, 4, 1), date(2024, 5, 1))
        );
        assert_eq!(
            resolve("30dp", &options, now),
            window(date(2024, 3, 1), date(2024, 4, 1))
        );
        assert_eq!(
            resolve("q", &options, now),
            window(date(2024, 1, 1), date(2024, 4, 1))
        );
        assert_eq!(
            resolve("qp", &options, now),
            window(date(2023, 10, 1), date(2024, 1, 1))
        );
        assert_eq!(
            resolve("y", &options, now),
            window(date(2023, 1, 1), date(2024, 1, 1))
        );
        assert_eq!(
            resolve("yp", &options, now),
            window(date(2022, 1, 1), date(2023, 1, 1))
        );
        assert_eq!(
            resolve("2y", &options, now),
            window(date(2022, 1, 1), date(2024, 1, 1))
        );
        assert_eq!(
            resolve("2yp", &options, now),
            window(date(2020, 1, 1), date(2022, 1, 1))
        );
        assert_eq!(
            resolve("a", &options, now),
            window(date(1970, 1, 1), date(2100, 1, 1))
        );
    }

    #[test]
    fn test_daily_windows() {
        let now = at(2024, 5, 15);
        let options = daily();

        assert_eq!(
            resolve("7d", &options, now),
            window(date(2024, 5, 8), date(2024, 5, 15))
        );
        assert_eq!(
            resolve("7dp", &options, now),
            window(date(2024, 5, 1), date(2024, 5, 8))
        );
        assert_eq!(
            resolve("30d", &options, now),
            window(date(2024, 4, 15), date(2024, 5, 15))
        );
        assert_eq!(
            resolve("30dp", &options, now),
            window(date(2024, 3, 16), date(2024, 4, 15))
        );
        assert_eq!(
            resolve("q", &options, now),
            window(date(2024, 2, 15), date(2024, 5, 15))
        );
        assert_eq!(
            resolve("qp", &options, now),
            window(date(2023, 11, 15), date(2024, 2, 15))
        );
        assert_eq!(
            resolve("y", &options, now),
            window(date(2023, 5, 15), date(2024, 5, 15))
        );
        assert_eq!(
            resolve("2yp", &options, now),
            window(date(2020, 5, 15), date(2022, 5, 15))
        );
    }

    #[test]
    fn test_year_to_date() {
        let now = at(2024, 5, 15);
        let options = WindowOptions::default();

        assert_eq!(
            resolve("ty", &options, now),
            window(date(2024, 1, 1), date(2024, 5, 15))
        );
        // The previous window has the same 135 days.
        assert_eq!(
            resolve("typ", &options, now),
            window(date(2023, 8, 19), date(2024, 1, 1))
        );
        assert!(resolve("ty", &options, at(2024, 1, 1)).is_empty());
    }

    #[test]
    fn test_biennium_in_odd_year() {
        let options = WindowOptions::default();
        assert_eq!(
            resolve("2y", &options, at(2025, 3, 2)),
            window(date(2022, 1, 1), date(2024, 1, 1))
        );
    }

    #[test]
    fn test_month_arithmetic_clamps() {
        let options = daily();
        assert_eq!(
            resolve("q", &options, at(2024, 5, 31)),
            window(date(2024, 2, 29), date(2024, 5, 31))
        );
    }

    #[test]
    fn test_week_starts_on_monday() {
        let options = WindowOptions::default();
        // Sunday and Monday of the same ISO week.
        assert_eq!(
            resolve("7d", &options, at(2024, 5, 19)),
            window(date(2024, 5, 6), date(2024, 5, 13))
        );
        assert_eq!(
            resolve("7d", &options, at(2024, 5, 20)),
            window(date(2024, 5, 13), date(2024, 5, 20))
        );
    }

    #[test]
    fn test_windows_are_ordered_and_previous_is_adjacent() {
        let nows = [at(2024, 5, 15), at(2023, 12, 31), at(2025, 3, 1), at(2024, 2, 29)];
        let pairs = [
            ("7d", "7dp"),
            ("30d", "30dp"),
            ("q", "qp"),
            ("ty", "typ"),
            ("y", "yp"),
            ("2y", "2yp"),
        ];

        for options in [WindowOptions::default(), daily()] {
            for now in nows {
                for (current, previous) in pairs {
                    let current = resolve(current, &options, now);
                    let previous = resolve(previous, &options, now);

                    assert!(current.from < current.to, "{current} at {now}");
                    assert!(previous.from < previous.to, "{previous} at {now}");
                    assert_eq!(previous.to, current.from, "{previous} vs {current}");
                    assert!(current.to <= now.date_naive());
                }
            }
        }
    }

    #[test]
    fn test_custom_window() {
        let options = WindowOptions {
            date_from: Some("2023-10".to_string()),
            date_to: Some("2023-11".to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve("c", &options, at(2024, 5, 15)),
            window(date(2023, 10, 1), date(2023, 11, 1))
        );
    }

    #[test]
    fn test_custom_window_requires_bounds() {
        let options = WindowOptions {
            date_from: Some("2023-10".to_string()),
            ..Default::default()
        };
        let err = resolve_window(TimeRange::Custom, &options, at(2024, 5, 15)).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert_eq!(
            err.detail(),
            Some("you must specify V3_DATE_TO when using V3_TIME_RANGE=c")
        );
    }

    #[test]
    fn test_custom_window_rejects_bad_dates() {
        let options = WindowOptions {
            date_from: Some("last tuesday".to_string()),
            date_to: Some("2023-11".to_string()),
            ..Default::default()
        };
        let err = resolve_window(TimeRange::Custom, &options, at(2024, 5, 15)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DateParseError);

        let options = WindowOptions {
            date_from: Some("2023-11".to_string()),
            date_to: Some("2023-10".to_string()),
            ..Default::default()
        };
        let err = resolve_window(TimeRange::Custom, &options, at(2024, 5, 15)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTimeRange);
    }

    #[test]
    fn test_parse_any_date() {
        let expected = date(2023, 10, 7);
        assert_eq!(parse_any_date("2023-10-07T18:30:00Z").unwrap(), expected);
        assert_eq!(parse_any_date("2023-10-07 18:30:15").unwrap(), expected);
        assert_eq!(parse_any_date("2023-10-07 18:30").unwrap(), expected);
        assert_eq!(parse_any_date("2023-10-07 18").unwrap(), expected);
        assert_eq!(parse_any_date("2023-10-07").unwrap(), expected);
        assert_eq!(parse_any_date(" 2023-10-07 ").unwrap(), expected);
        assert_eq!(parse_any_date("2023-10").unwrap(), date(2023, 10, 1));
        assert_eq!(parse_any_date("2023").unwrap(), date(2023, 1, 1));

        let err = parse_any_date("2023-13").unwrap_err();
        assert_eq!(err.detail(), Some("cannot parse date: '2023-13'"));
    }
}
