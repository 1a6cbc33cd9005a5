//! Log of observed upshifts

use crate::units::samples_to_ms;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::info;

/// Records kept before the oldest are dropped
pub const MAX_RECORDS: usize = 500;

/// One observed upshift
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftRecord {
    pub timestamp: DateTime<Utc>,

    /// Lowest RPM the cue targeted, if a cue fired
    pub target_rpm: Option<f64>,

    /// RPM the player actually shifted at
    pub shift_rpm: f64,

    /// Gear shifted out of
    pub gear: i8,

    /// Time from cue to shift
    pub lead_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShiftHistory {
    tick_rate: f64,
    records: VecDeque<ShiftRecord>,
}

impl ShiftHistory {
    pub fn new(tick_rate: f64) -> Self {
        Self {
            tick_rate,
            records: VecDeque::new(),
        }
    }

    pub fn record(
        &mut self,
        target_rpm: Option<f64>,
        shift_rpm: f64,
        gear: i8,
        lead_samples: Option<i64>,
    ) -> ShiftRecord {
        let record = ShiftRecord {
            timestamp: Utc::now(),
            target_rpm,
            shift_rpm,
            gear,
            lead_ms: lead_samples.map(|n| samples_to_ms(n as f64, self.tick_rate)),
        };

        let fmt_opt = |v: Option<String>| v.unwrap_or_else(|| "N/A".to_string());
        info!(
            "Gear {}-{}: shifted at {:.0}, target {}, difference {}, {} ms after cue",
            gear,
            gear + 1,
            shift_rpm,
            fmt_opt(target_rpm.map(|t| format!("{t:.0}"))),
            fmt_opt(target_rpm.map(|t| format!("{:.0}", shift_rpm - t))),
            fmt_opt(record.lead_ms.map(|ms| ms.to_string())),
        );

        self.records.push_back(record.clone());
        while self.records.len() > MAX_RECORDS {
            self.records.pop_front();
        }
        record
    }

    pub fn records(&self) -> impl Iterator<Item = &ShiftRecord> {
        self.records.iter()
    }

    pub fn last(&self) -> Option<&ShiftRecord> {
        self.records.back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn reset(&mut self) {
        self.records.clear();
    }
}
