use chrono::{Days, NaiveDate};
use qtrail_core::{OutputFormat, PartitionKey, ProcessingWindow};
use thiserror::Error;

use crate::config::AuditConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// The 24 hours of the day before `today`.
    Daily { today: NaiveDate },
    /// Every hour of `start..=end`.
    Backfill { start: NaiveDate, end: NaiveDate },
}

impl PlanMode {
    /// Backfill when both test dates are configured, daily otherwise.
    pub fn from_config(config: &AuditConfig, today: NaiveDate) -> Result<Self, PlanError> {
        match (config.test_start_date, config.test_end_date) {
            (Some(start), Some(end)) => Ok(Self::Backfill { start, end }),
            (None, None) => Ok(Self::Daily { today }),
            (start, end) => Err(PlanError::IncompleteRange { start, end }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("backfill end {end} is before start {start}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error("backfill needs both TEST_START_DATE and TEST_END_DATE (got {start:?} / {end:?})")]
    IncompleteRange {
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    },
    #[error("date arithmetic overflowed around {0}")]
    OutOfRange(NaiveDate),
}

#[derive(Debug, Clone, Copy)]
pub struct WindowPlanner {
    format: OutputFormat,
}

impl WindowPlanner {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// UTC days covered by `mode`, oldest first.
    pub fn days(&self, mode: PlanMode) -> Result<Vec<NaiveDate>, PlanError> {
        match mode {
            PlanMode::Daily { today } => today
                .checked_sub_days(Days::new(1))
                .map(|d| vec![d])
                .ok_or(PlanError::OutOfRange(today)),
            PlanMode::Backfill { start, end } => {
                if end < start {
                    return Err(PlanError::InvalidRange { start, end });
                }
                Ok(start.iter_days().take_while(|d| *d <= end).collect())
            }
        }
    }

    pub fn windows_for_day(&self, day: NaiveDate) -> Vec<ProcessingWindow> {
        (0..24)
            .filter_map(|hour| PartitionKey::for_date_hour(day, hour).ok())
            .map(|key| ProcessingWindow::new(key, self.format))
            .collect()
    }

    /// Chronological hour windows for `mode`.
    pub fn plan(&self, mode: PlanMode) -> Result<Vec<ProcessingWindow>, PlanError> {
        Ok(self
            .days(mode)?
            .into_iter()
            .flat_map(|day| self.windows_for_day(day))
            .collect())
    }
}
