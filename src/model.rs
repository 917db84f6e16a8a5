//! Data carried between the stages of a run.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::errors::{FanoutError, Result};
use crate::core::config::RecordFields;

/// Date format used for the run directory, e.g. `04-30-2020`
pub const RUN_DATE_FORMAT: &str = "%m-%d-%Y";

/// One upstream record: an ordered list of string fields
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub Vec<String>);

impl Record {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    pub fn field(&self, position: usize) -> Option<&str> {
        self.0.get(position).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Ordered record list produced by the upstream collector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordBatch(pub Vec<Record>);

impl RecordBatch {
    pub fn new(records: Vec<Record>) -> Self {
        Self(records)
    }

    pub fn records(&self) -> &[Record] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Record> for RecordBatch {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A contiguous slice of the batch handled by exactly one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub records: Vec<Record>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One row of result data returned by the external query
pub type CaseRecord = Vec<String>;

/// One case as returned by the query service: a list of rows
pub type CaseGroup = Vec<CaseRecord>;

/// The query key a worker extracts from a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject<'a> {
    pub name: &'a str,
    pub date_of_birth: &'a str,
}

impl<'a> Subject<'a> {
    /// Extract the query key from `record`, which sits at `position` in its chunk
    pub fn from_record(record: &'a Record, fields: RecordFields, position: usize) -> Result<Self> {
        let name = record.field(fields.name).ok_or_else(|| FanoutError::InvalidRecord {
            position,
            reason: format!("missing name field at {}", fields.name),
        })?;
        let date_of_birth =
            record
                .field(fields.date_of_birth)
                .ok_or_else(|| FanoutError::InvalidRecord {
                    position,
                    reason: format!("missing date of birth field at {}", fields.date_of_birth),
                })?;
        Ok(Self {
            name,
            date_of_birth,
        })
    }
}

/// Identity of one logical pipeline run
///
/// Everything derived from a run (artifact keys, persisted state) is keyed by
/// this value, never by wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId {
    pub pipeline: String,
    pub logical_date: NaiveDate,
}

impl RunId {
    pub fn new(pipeline: impl Into<String>, logical_date: NaiveDate) -> Self {
        Self {
            pipeline: pipeline.into(),
            logical_date,
        }
    }

    /// Relative directory of the run, e.g. `jail_scraper/04-30-2020`
    pub fn path_prefix(&self) -> String {
        format!(
            "{}/{}",
            self.pipeline,
            self.logical_date.format(RUN_DATE_FORMAT)
        )
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path_prefix())
    }
}
