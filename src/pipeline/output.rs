//! Pipeline output table
//!
//! One row per `(date, sid)` that passed the screen, sorted by date and
//! then sid, with one column per named term.

use crate::error::{PipelineError, Result};
use crate::pipeline::term::OutputKind;
use crate::types::{fmt_date, Sid};
use chrono::NaiveDate;
use polars::prelude::{DataFrame, DateChunked, IntoSeries, NamedFrom, Series};
use std::io::Write;

/// Values of one output column
#[derive(Debug, Clone, PartialEq)]
pub enum OutputColumn {
    Numeric(Vec<f64>),
    Boolean(Vec<bool>),
    /// Codes into `categories`; `categories[0]` is the missing value
    Categorical { codes: Vec<u32>, categories: Vec<String> },
}

impl OutputColumn {
    pub fn empty(kind: OutputKind, categories: Vec<String>) -> Self {
        match kind {
            OutputKind::Numeric => OutputColumn::Numeric(Vec::new()),
            OutputKind::Boolean => OutputColumn::Boolean(Vec::new()),
            OutputKind::Categorical => OutputColumn::Categorical {
                codes: Vec::new(),
                categories,
            },
        }
    }

    pub fn kind(&self) -> OutputKind {
        match self {
            OutputColumn::Numeric(_) => OutputKind::Numeric,
            OutputColumn::Boolean(_) => OutputKind::Boolean,
            OutputColumn::Categorical { .. } => OutputKind::Categorical,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            OutputColumn::Numeric(v) => v.len(),
            OutputColumn::Boolean(v) => v.len(),
            OutputColumn::Categorical { codes, .. } => codes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cell rendered as text
    pub fn display(&self, row: usize) -> String {
        match self {
            OutputColumn::Numeric(v) => v[row].to_string(),
            OutputColumn::Boolean(v) => v[row].to_string(),
            OutputColumn::Categorical { codes, categories } => categories[codes[row] as usize].clone(),
        }
    }

    fn to_series(&self, name: &str) -> Series {
        match self {
            OutputColumn::Numeric(v) => Series::new(name, v.as_slice()),
            OutputColumn::Boolean(v) => Series::new(name, v.as_slice()),
            OutputColumn::Categorical { codes, categories } => {
                let labels: Vec<&str> = codes.iter().map(|c| categories[*c as usize].as_str()).collect();
                Series::new(name, labels)
            }
        }
    }
}

/// Result of `run_pipeline`
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    dates: Vec<NaiveDate>,
    sids: Vec<Sid>,
    columns: Vec<(String, OutputColumn)>,
}

impl PipelineOutput {
    pub fn new(dates: Vec<NaiveDate>, sids: Vec<Sid>, columns: Vec<(String, OutputColumn)>) -> Result<Self> {
        if dates.len() != sids.len() {
            return Err(PipelineError::InvalidInput(format!(
                "{} dates for {} sids",
                dates.len(),
                sids.len()
            )));
        }
        for (name, column) in &columns {
            if column.len() != dates.len() {
                return Err(PipelineError::InvalidInput(format!(
                    "Column {} has {} rows, expected {}",
                    name,
                    column.len(),
                    dates.len()
                )));
            }
        }
        Ok(Self { dates, sids, columns })
    }

    /// Table without rows, keeping the column schema
    pub fn empty(columns: Vec<(String, OutputColumn)>) -> Self {
        Self {
            dates: Vec::new(),
            sids: Vec::new(),
            columns: columns
                .into_iter()
                .map(|(name, column)| {
                    let categories = match &column {
                        OutputColumn::Categorical { categories, .. } => categories.clone(),
                        _ => Vec::new(),
                    };
                    (name, OutputColumn::empty(column.kind(), categories))
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn sids(&self) -> &[Sid] {
        &self.sids
    }

    pub fn columns(&self) -> &[(String, OutputColumn)] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&OutputColumn> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub(crate) fn into_parts(self) -> (Vec<NaiveDate>, Vec<Sid>, Vec<(String, OutputColumn)>) {
        (self.dates, self.sids, self.columns)
    }

    /// Row index of `(date, sid)`, if that asset passed the screen that day
    pub fn row(&self, date: NaiveDate, sid: Sid) -> Option<usize> {
        let lo = self.dates.partition_point(|d| *d < date);
        let hi = self.dates.partition_point(|d| *d <= date);
        self.sids[lo..hi].binary_search(&sid).ok().map(|i| lo + i)
    }

    /// Sids present on `date`
    pub fn sids_on(&self, date: NaiveDate) -> &[Sid] {
        let lo = self.dates.partition_point(|d| *d < date);
        let hi = self.dates.partition_point(|d| *d <= date);
        &self.sids[lo..hi]
    }

    pub fn unique_dates(&self) -> Vec<NaiveDate> {
        let mut dates = self.dates.clone();
        dates.dedup();
        dates
    }

    pub fn get_f64(&self, date: NaiveDate, sid: Sid, column: &str) -> Option<f64> {
        match self.column(column)? {
            OutputColumn::Numeric(v) => self.row(date, sid).map(|r| v[r]),
            _ => None,
        }
    }

    pub fn get_bool(&self, date: NaiveDate, sid: Sid, column: &str) -> Option<bool> {
        match self.column(column)? {
            OutputColumn::Boolean(v) => self.row(date, sid).map(|r| v[r]),
            _ => None,
        }
    }

    pub fn get_label(&self, date: NaiveDate, sid: Sid, column: &str) -> Option<&str> {
        match self.column(column)? {
            OutputColumn::Categorical { codes, categories } => {
                self.row(date, sid).map(|r| categories[codes[r] as usize].as_str())
            }
            _ => None,
        }
    }

    /// Long-format CSV: `date,sid,<columns...>`
    pub fn to_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv = csv::Writer::from_writer(writer);
        let mut header = vec!["date".to_string(), "sid".to_string()];
        header.extend(self.columns.iter().map(|(n, _)| n.clone()));
        csv.write_record(&header)?;
        for row in 0..self.len() {
            let mut record = vec![fmt_date(self.dates[row]), self.sids[row].to_string()];
            record.extend(self.columns.iter().map(|(_, c)| c.display(row)));
            csv.write_record(&record)?;
        }
        csv.flush()?;
        Ok(())
    }

    /// Long-format polars frame; categorical columns become strings
    pub fn to_frame(&self) -> Result<DataFrame> {
        let mut series = Vec::with_capacity(self.columns.len() + 2);
        series.push(DateChunked::from_naive_date("date", self.dates.iter().copied()).into_series());
        let sids: Vec<u64> = self.sids.clone();
        series.push(Series::new("sid", sids));
        for (name, column) in &self.columns {
            series.push(column.to_series(name));
        }
        Ok(DataFrame::new(series)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 1, day).unwrap()
    }

    fn sample() -> PipelineOutput {
        PipelineOutput::new(
            vec![d(4), d(4), d(5)],
            vec![1, 3, 3],
            vec![
                ("close".to_string(), OutputColumn::Numeric(vec![10.0, f64::NAN, 11.0])),
                (
                    "sector".to_string(),
                    OutputColumn::Categorical {
                        codes: vec![1, 0, 2],
                        categories: vec!["NA".to_string(), "Energy".to_string(), "Utilities".to_string()],
                    },
                ),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_by_date_and_sid() {
        let out = sample();
        assert_eq!(out.get_f64(d(4), 1, "close"), Some(10.0));
        assert_eq!(out.get_f64(d(5), 1, "close"), None);
        assert_eq!(out.get_label(d(5), 3, "sector"), Some("Utilities"));
        assert_eq!(out.sids_on(d(4)), &[1, 3]);
        assert_eq!(out.unique_dates(), vec![d(4), d(5)]);
    }

    #[test]
    fn test_rejects_ragged_columns() {
        let result = PipelineOutput::new(
            vec![d(4)],
            vec![1],
            vec![("x".to_string(), OutputColumn::Boolean(vec![true, false]))],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_csv_export() {
        let mut buf = Vec::new();
        sample().to_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "date,sid,close,sector");
        assert_eq!(lines[1], "2021-01-04,1,10,Energy");
        assert_eq!(lines[2], "2021-01-04,3,NaN,NA");
    }

    #[test]
    fn test_frame_export() {
        let frame = sample().to_frame().unwrap();
        assert_eq!(frame.shape(), (3, 4));
    }
}
