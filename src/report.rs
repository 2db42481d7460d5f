//! Aggregate report over a run: KPIs, per-station OK/NG, NG rate over time,
//! top root causes and the troubleshooting table. Serialized as JSON.
//!
//! Counts come from two places. OK/NG figures use the `Result` column the
//! stations recorded themselves; root causes use the `Prediction` and
//! `Root_Cause` columns the analysis appended.

use crate::analysis::AnalyzedStation;
use crate::config::AppConfig;
use crate::error::{RcaError, Result};
use crate::table::{text_column, DATE_TIME_COLUMN, PREDICTION_COLUMN, RESULT_COLUMN, ROOT_CAUSE_COLUMN};
use crate::troubleshooting::{TroubleshootingGuide, TroubleshootingMethod};
use chrono::{Datelike, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use itertools::Itertools;
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

pub const TOP_ROOT_CAUSES: usize = 5;
pub const TOP_TROUBLESHOOTING_ROWS: usize = 10;
const DEFAULT_FILENAME: &str = "Report";
const DEFAULT_TITLE: &str = "Report Title";

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Parse a `Date_Time` cell; date-only values land on midnight.
pub fn parse_date_time(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    DATE_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            ["%Y-%m-%d", "%Y/%m/%d"]
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
                .map(|date| date.and_time(NaiveTime::MIN))
        })
}

fn date_times(df: &DataFrame) -> Result<Vec<Option<NaiveDateTime>>> {
    Ok(text_column(df, DATE_TIME_COLUMN)?
        .into_iter()
        .map(|cell| cell.as_deref().and_then(parse_date_time))
        .collect())
}

fn upper_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    Ok(text_column(df, name)?
        .into_iter()
        .map(|cell| cell.map(|text| text.to_uppercase()))
        .collect())
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationSummary {
    pub station: String,
    pub ok: usize,
    pub ng: usize,
    /// NG / (OK + NG) * 100
    pub ng_percent: f64,
}

impl StationSummary {
    pub fn from_frame(station: &str, df: &DataFrame) -> Result<Self> {
        let results = upper_column(df, RESULT_COLUMN)?;
        let ok = results.iter().filter(|r| r.as_deref() == Some("OK")).count();
        let ng = results.iter().filter(|r| r.as_deref() == Some("NG")).count();
        Ok(Self {
            station: station.to_string(),
            ok,
            ng,
            ng_percent: percent(ng, ok + ng),
        })
    }
}

/// Headline figures taken from the station with the most NG units; units
/// travel from one station table to the next, so summing would double count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kpi {
    pub station: String,
    pub total_units: usize,
    pub total_ok: usize,
    pub total_ng: usize,
    pub ng_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeRange {
    pub fn span_days(&self) -> i64 {
        (self.end.date() - self.start.date()).num_days()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    FourHours,
    Day,
    /// Weeks ending on Sunday.
    Week,
    Month,
}

impl Granularity {
    pub fn for_span(days: i64) -> Self {
        match days {
            d if d <= 1 => Granularity::FourHours,
            d if d <= 10 => Granularity::Day,
            d if d <= 30 => Granularity::Week,
            _ => Granularity::Month,
        }
    }

    fn bucket(&self, ts: NaiveDateTime) -> NaiveDateTime {
        let date = ts.date();
        match self {
            Granularity::FourHours => {
                let hour = ts.hour() - ts.hour() % 4;
                date.and_time(NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN))
            }
            Granularity::Day => date.and_time(NaiveTime::MIN),
            Granularity::Week => {
                let to_sunday = 6 - i64::from(date.weekday().num_days_from_monday());
                (date + Duration::days(to_sunday)).and_time(NaiveTime::MIN)
            }
            Granularity::Month => date
                .with_day(1)
                .unwrap_or(date)
                .and_time(NaiveTime::MIN),
        }
    }

    fn next(&self, bucket: NaiveDateTime) -> NaiveDateTime {
        match self {
            Granularity::FourHours => bucket + Duration::hours(4),
            Granularity::Day => bucket + Duration::days(1),
            Granularity::Week => bucket + Duration::days(7),
            Granularity::Month => {
                let date = bucket.date();
                let (year, month) = if date.month() == 12 {
                    (date.year() + 1, 1)
                } else {
                    (date.year(), date.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1)
                    .map(|d| d.and_time(NaiveTime::MIN))
                    .unwrap_or(bucket + Duration::days(31))
            }
        }
    }

    fn label(&self, bucket: NaiveDateTime) -> String {
        let format = match self {
            Granularity::FourHours => "%Y-%m-%d %H:%M",
            Granularity::Day | Granularity::Week => "%Y-%m-%d",
            Granularity::Month => "%Y-%m",
        };
        bucket.format(format).to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NgRatePoint {
    pub bucket: String,
    pub total: usize,
    pub ng: usize,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NgRateSeries {
    pub station: String,
    pub granularity: Granularity,
    pub points: Vec<NgRatePoint>,
}

impl NgRateSeries {
    /// Bucket the frame's rows by `Date_Time`; buckets without rows stay at zero.
    pub fn from_frame(station: &str, df: &DataFrame, granularity: Granularity) -> Result<Option<Self>> {
        let times = date_times(df)?;
        let results = upper_column(df, RESULT_COLUMN)?;

        let mut counts: BTreeMap<NaiveDateTime, (usize, usize)> = BTreeMap::new();
        for (ts, result) in times.iter().zip(results.iter()) {
            let Some(ts) = ts else { continue };
            let entry = counts.entry(granularity.bucket(*ts)).or_insert((0, 0));
            entry.0 += 1;
            if result.as_deref() == Some("NG") {
                entry.1 += 1;
            }
        }

        let (first, last) = match (counts.keys().next(), counts.keys().next_back()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Ok(None),
        };

        let mut points = Vec::new();
        let mut bucket = first;
        while bucket <= last {
            let (total, ng) = counts.get(&bucket).copied().unwrap_or((0, 0));
            points.push(NgRatePoint {
                bucket: granularity.label(bucket),
                total,
                ng,
                rate: percent(ng, total),
            });
            bucket = granularity.next(bucket);
        }

        Ok(Some(Self {
            station: station.to_string(),
            granularity,
            points,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootCauseCount {
    pub cause: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationRootCauses {
    pub station: String,
    pub causes: Vec<RootCauseCount>,
}

/// NG root causes of an analyzed frame, most frequent first.
pub fn ng_root_causes(df: &DataFrame) -> Result<Vec<RootCauseCount>> {
    let predictions = upper_column(df, PREDICTION_COLUMN)?;
    let causes = text_column(df, ROOT_CAUSE_COLUMN)?;
    Ok(predictions
        .iter()
        .zip(causes)
        .filter(|(prediction, _)| prediction.as_deref() == Some("NG"))
        .filter_map(|(_, cause)| cause)
        .counts()
        .into_iter()
        .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
        .map(|(cause, count)| RootCauseCount { cause, count })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TroubleshootingRow {
    pub station: String,
    pub root_cause: String,
    /// Empty when no methods are defined for this cause.
    pub methods: Vec<TroubleshootingMethod>,
    pub count: usize,
    /// Share of the KPI station's NG count.
    pub percentage: f64,
}

/// Report naming, taken from the application config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportSettings {
    pub filename: String,
    pub title: String,
    pub include_week_no: bool,
}

impl From<&AppConfig> for ReportSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            filename: config.html_filename.trim().to_string(),
            title: config.html_title.trim().to_string(),
            include_week_no: config.include_week_no,
        }
    }
}

impl ReportSettings {
    pub fn file_name(&self, week: u32) -> String {
        let stem = if self.filename.is_empty() {
            DEFAULT_FILENAME
        } else {
            self.filename.as_str()
        };
        if self.include_week_no {
            format!("{}_Week_{}.json", stem, week)
        } else {
            format!("{}.json", stem)
        }
    }

    pub fn title(&self, week: u32) -> String {
        let title = if self.title.is_empty() {
            DEFAULT_TITLE
        } else {
            self.title.as_str()
        };
        if self.include_week_no {
            format!("{} - Week {}", title, week)
        } else {
            title.to_string()
        }
    }
}

/// Everything a report is computed from.
pub struct ReportInput<'a> {
    pub selected_tables: &'a [String],
    pub retrieved: &'a HashMap<String, DataFrame>,
    pub analyzed: &'a [AnalyzedStation],
    pub troubleshooting: &'a TroubleshootingGuide,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub run_id: Uuid,
    pub generated_at: NaiveDateTime,
    pub title: String,
    pub file_name: String,
    pub week: u32,
    pub time_range: Option<TimeRange>,
    pub kpi: Option<Kpi>,
    pub stations: Vec<StationSummary>,
    pub ng_rate: Option<NgRateSeries>,
    pub root_causes: Vec<StationRootCauses>,
    pub troubleshooting: Vec<TroubleshootingRow>,
}

impl Report {
    pub fn build(input: &ReportInput<'_>, settings: &ReportSettings) -> Result<Self> {
        let time_range = overall_time_range(input.retrieved)?;
        let start_date = time_range
            .map(|range| range.start.date())
            .unwrap_or_else(|| Local::now().date_naive());
        let week = start_date.iso_week().week();

        let mut stations = Vec::new();
        let mut kpi: Option<Kpi> = None;
        for table in input.selected_tables {
            let Some(df) = input.retrieved.get(table) else {
                continue;
            };
            let summary = StationSummary::from_frame(table, df)?;
            // First station wins ties.
            if kpi.as_ref().map_or(true, |k| summary.ng > k.total_ng) {
                kpi = Some(Kpi {
                    station: table.clone(),
                    total_units: df.height(),
                    total_ok: summary.ok,
                    total_ng: summary.ng,
                    ng_percent: percent(summary.ng, df.height()),
                });
            }
            stations.push(summary);
        }

        let ng_rate = match (&kpi, time_range) {
            (Some(k), Some(range)) if k.total_ng > 0 => match input.retrieved.get(&k.station) {
                Some(df) => {
                    NgRateSeries::from_frame(&k.station, df, Granularity::for_span(range.span_days()))?
                }
                None => None,
            },
            _ => None,
        };

        let total_ng = kpi.as_ref().map_or(0, |k| k.total_ng);
        let mut root_causes = Vec::new();
        let mut troubleshooting = Vec::new();
        for analyzed in input.analyzed {
            let causes = ng_root_causes(&analyzed.frame)?;
            for cause in &causes {
                troubleshooting.push(TroubleshootingRow {
                    station: analyzed.station.clone(),
                    root_cause: cause.cause.clone(),
                    methods: input
                        .troubleshooting
                        .methods(&analyzed.station, &cause.cause)
                        .to_vec(),
                    count: cause.count,
                    percentage: percent(cause.count, total_ng),
                });
            }
            root_causes.push(StationRootCauses {
                station: analyzed.station.clone(),
                causes: causes.into_iter().take(TOP_ROOT_CAUSES).collect(),
            });
        }
        troubleshooting.sort_by(|a, b| b.count.cmp(&a.count));
        troubleshooting.truncate(TOP_TROUBLESHOOTING_ROWS);

        Ok(Self {
            run_id: Uuid::new_v4(),
            generated_at: Local::now().naive_local(),
            title: settings.title(week),
            file_name: settings.file_name(week),
            week,
            time_range,
            kpi,
            stations,
            ng_rate,
            root_causes,
            troubleshooting,
        })
    }

    /// Write the report as pretty JSON into `dir` (or the working directory).
    pub fn write(&self, dir: Option<&Path>) -> Result<PathBuf> {
        let path = match dir {
            Some(dir) => dir.join(&self.file_name),
            None => PathBuf::from(&self.file_name),
        };
        info!("Generating report: {}", path.display());
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content).map_err(|e| {
            RcaError::Report(format!("Failed to write {}: {}", path.display(), e))
        })?;
        Ok(path)
    }
}

/// Earliest and latest parseable `Date_Time` across all retrieved tables.
pub fn overall_time_range(tables: &HashMap<String, DataFrame>) -> Result<Option<TimeRange>> {
    let mut range: Option<TimeRange> = None;
    for df in tables.values() {
        for ts in date_times(df)?.into_iter().flatten() {
            range = Some(match range {
                None => TimeRange { start: ts, end: ts },
                Some(r) => TimeRange {
                    start: r.start.min(ts),
                    end: r.end.max(ts),
                },
            });
        }
    }
    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::df;

    fn ts(text: &str) -> NaiveDateTime {
        parse_date_time(text).unwrap()
    }

    #[test]
    fn test_parse_date_time_formats() {
        assert_eq!(ts("2024-05-01").to_string(), "2024-05-01 00:00:00");
        assert_eq!(ts("2024/05/01 09:30:00").to_string(), "2024-05-01 09:30:00");
        assert_eq!(ts("2024-05-01 09:30:00.250").second(), 0);
        assert!(parse_date_time("yesterday").is_none());
    }

    #[test]
    fn test_granularity_thresholds() {
        assert_eq!(Granularity::for_span(0), Granularity::FourHours);
        assert_eq!(Granularity::for_span(1), Granularity::FourHours);
        assert_eq!(Granularity::for_span(7), Granularity::Day);
        assert_eq!(Granularity::for_span(30), Granularity::Week);
        assert_eq!(Granularity::for_span(31), Granularity::Month);
    }

    #[test]
    fn test_week_buckets_end_on_sunday() {
        // 2024-05-01 is a Wednesday.
        let bucket = Granularity::Week.bucket(ts("2024-05-01 10:00:00"));
        assert_eq!(Granularity::Week.label(bucket), "2024-05-05");
        let bucket = Granularity::Week.bucket(ts("2024-05-05 23:00:00"));
        assert_eq!(Granularity::Week.label(bucket), "2024-05-05");
    }

    #[test]
    fn test_ng_rate_fills_empty_buckets() {
        let df = df![
            "Date_Time" => ["2024-05-01 01:00:00", "2024-05-01 02:00:00", "2024-05-01 13:00:00"],
            "Result" => ["NG", "ok", "ng"]
        ]
        .unwrap();
        let series = NgRateSeries::from_frame("ST10", &df, Granularity::FourHours)
            .unwrap()
            .unwrap();
        let labels: Vec<&str> = series.points.iter().map(|p| p.bucket.as_str()).collect();
        assert_eq!(
            labels,
            vec!["2024-05-01 00:00", "2024-05-01 04:00", "2024-05-01 08:00", "2024-05-01 12:00"]
        );
        assert_eq!(series.points[0].rate, 50.0);
        assert_eq!(series.points[1].total, 0);
        assert_eq!(series.points[1].rate, 0.0);
        assert_eq!(series.points[3].rate, 100.0);
    }

    #[test]
    fn test_root_causes_sorted_by_count_then_label() {
        let df = df![
            "Prediction" => ["NG", "ng", "NG", "OK", "NG", "NG"],
            "Root_Cause" => ["Leak", "Torque", "Torque", "Good Condition", "Leak", "Align"]
        ]
        .unwrap();
        let causes = ng_root_causes(&df).unwrap();
        let labels: Vec<(&str, usize)> = causes.iter().map(|c| (c.cause.as_str(), c.count)).collect();
        assert_eq!(labels, vec![("Leak", 2), ("Torque", 2), ("Align", 1)]);
    }

    #[test]
    fn test_settings_naming() {
        let settings = ReportSettings {
            filename: String::new(),
            title: String::new(),
            include_week_no: true,
        };
        assert_eq!(settings.file_name(18), "Report_Week_18.json");
        assert_eq!(settings.title(18), "Report Title - Week 18");

        let settings = ReportSettings {
            filename: "Line3".to_string(),
            title: "Line 3 RCA".to_string(),
            include_week_no: false,
        };
        assert_eq!(settings.file_name(18), "Line3.json");
        assert_eq!(settings.title(18), "Line 3 RCA");
    }

    #[test]
    fn test_kpi_uses_station_with_most_ng() {
        let mut retrieved = HashMap::new();
        retrieved.insert(
            "ST10".to_string(),
            df![
                "Date_Time" => ["2024-05-01 09:00:00", "2024-05-02 09:00:00"],
                "Result" => ["OK", "NG"]
            ]
            .unwrap(),
        );
        retrieved.insert(
            "ST20".to_string(),
            df![
                "Date_Time" => ["2024-05-01 09:00:00", "2024-05-03 09:00:00", "2024-05-03 10:00:00"],
                "Result" => ["NG", "NG", "OK"]
            ]
            .unwrap(),
        );
        let selected = vec!["ST10".to_string(), "ST20".to_string()];
        let guide = TroubleshootingGuide::default();
        let input = ReportInput {
            selected_tables: &selected,
            retrieved: &retrieved,
            analyzed: &[],
            troubleshooting: &guide,
        };
        let report = Report::build(&input, &ReportSettings::default()).unwrap();

        let kpi = report.kpi.unwrap();
        assert_eq!(kpi.station, "ST20");
        assert_eq!(kpi.total_units, 3);
        assert_eq!(kpi.total_ng, 2);
        assert_eq!(report.stations[0].ng_percent, 50.0);
        assert_eq!(report.ng_rate.unwrap().granularity, Granularity::Day);
        assert_eq!(report.time_range.unwrap().span_days(), 2);
        assert_eq!(report.week, 18);
        assert_eq!(report.file_name, "Report.json");
    }
}
