/// Module des types du domaine
///
/// Regroupe les enregistrements qui circulent entre les composants:
/// bougies, ticks, gaps, jobs de backfill et enregistrements d'intégrité.
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::calendar::InstrumentClass;
use crate::error::PipelineError;
use crate::timeframe::Timeframe;

/// Instrument suivi par le pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub class: InstrumentClass,
}

impl Instrument {
    /// Construit un instrument en classant son symbole
    pub fn new(symbol: impl Into<String>) -> Self {
        let symbol = symbol.into().to_uppercase();
        let class = InstrumentClass::classify(&symbol);
        Instrument { symbol, class }
    }
}

/// Bougie OHLCV, clé (symbol, timeframe, timestamp) en base
///
/// `timestamp` est le début du créneau, en millisecondes epoch UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub spread: Option<f64>,
}

impl Candle {
    /// Bougie dégénérée: OHLC identiques, suspectée incomplète
    pub fn is_degenerate(&self) -> bool {
        self.open == self.high && self.high == self.low && self.low == self.close
    }

    /// Vérifie les invariants d'une bougie stockable
    ///
    /// - low ≤ open, close ≤ high et low ≤ high
    /// - volume ≥ 0
    /// - timestamp aligné sur la grille du timeframe
    pub fn validate(&self, tf: Timeframe) -> Result<(), PipelineError> {
        if !self.low.is_finite()
            || !self.high.is_finite()
            || !self.open.is_finite()
            || !self.close.is_finite()
        {
            return Err(PipelineError::InvariantViolation(format!(
                "prix non fini à {}",
                self.timestamp
            )));
        }
        if self.low > self.high {
            return Err(PipelineError::InvariantViolation(format!(
                "low {} > high {} à {}",
                self.low, self.high, self.timestamp
            )));
        }
        if self.open < self.low
            || self.open > self.high
            || self.close < self.low
            || self.close > self.high
        {
            return Err(PipelineError::InvariantViolation(format!(
                "open/close hors de [low, high] à {}",
                self.timestamp
            )));
        }
        if !(self.volume >= 0.0) {
            return Err(PipelineError::InvariantViolation(format!(
                "volume négatif à {}",
                self.timestamp
            )));
        }
        if !tf.is_aligned(self.timestamp) {
            return Err(PipelineError::InvariantViolation(format!(
                "timestamp {} non aligné sur {}",
                self.timestamp, tf
            )));
        }
        Ok(())
    }
}

/// Tick brut, entrée du constructeur M1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub timestamp: i64,
    pub price: f64,
    pub volume: f64,
}

/// Position d'un gap dans la plage analysée
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    /// Aucune bougie dans la plage
    FullGap,
    /// Les données commencent en retard sur la plage
    StartGap,
    /// Trou entre deux bougies existantes
    MidGap,
    /// Les données s'arrêtent avant la fin de la plage
    EndGap,
}

impl GapKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GapKind::FullGap => "full_gap",
            GapKind::StartGap => "start_gap",
            GapKind::MidGap => "mid_gap",
            GapKind::EndGap => "end_gap",
        }
    }
}

/// Plage de bougies manquantes [start, end)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start: i64,
    pub end: i64,
    pub kind: GapKind,
}

impl Gap {
    /// Nombre de bougies couvertes par le gap
    pub fn missing_candles(&self) -> i64 {
        (self.end - self.start) / self.timeframe.duration_ms()
    }
}

/// Statut d'un job de backfill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Un job terminal ne participe plus à l'unicité ni au leasing
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Job de backfill durable
///
/// Unicité: au plus un job non terminal par
/// (symbol, timeframe, gap_start, gap_end).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillJob {
    pub id: i64,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub gap_start: i64,
    pub gap_end: i64,
    pub priority: i64,
    pub status: JobStatus,
    pub attempts: i64,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub leased_until: Option<i64>,
    pub not_before: Option<i64>,
}

/// Statut d'un contrôle d'intégrité journalier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityStatus {
    Ok,
    Gaps,
}

impl IntegrityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IntegrityStatus::Ok => "ok",
            IntegrityStatus::Gaps => "gaps",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "ok" => Some(IntegrityStatus::Ok),
            "gaps" => Some(IntegrityStatus::Gaps),
            _ => None,
        }
    }
}

/// Résultat persistant d'un contrôle d'intégrité, clé (symbol, timeframe, date)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityRecord {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub date: NaiveDate,
    pub expected_candles: i64,
    pub actual_candles: i64,
    pub missing_candles: i64,
    pub incomplete_candles: i64,
    pub last_checked: i64,
    pub status: IntegrityStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: 1_739_354_820_000, // 2025-02-12 10:07:00, aligné M1
            open,
            high,
            low,
            close,
            volume: 10.0,
            spread: None,
        }
    }

    #[test]
    fn test_valid_candle() {
        assert!(candle(1.08, 1.09, 1.07, 1.085).validate(Timeframe::M1).is_ok());
    }

    #[test]
    fn test_low_above_high_rejected() {
        let err = candle(1.08, 1.07, 1.09, 1.08).validate(Timeframe::M1);
        assert!(matches!(err, Err(PipelineError::InvariantViolation(_))));
    }

    #[test]
    fn test_open_outside_range_rejected() {
        assert!(candle(1.10, 1.09, 1.07, 1.08).validate(Timeframe::M1).is_err());
    }

    #[test]
    fn test_negative_volume_rejected() {
        let mut c = candle(1.08, 1.09, 1.07, 1.085);
        c.volume = -1.0;
        assert!(c.validate(Timeframe::M1).is_err());
    }

    #[test]
    fn test_unaligned_timestamp_rejected() {
        let mut c = candle(1.08, 1.09, 1.07, 1.085);
        c.timestamp += 1_500;
        assert!(c.validate(Timeframe::M1).is_err());
    }

    #[test]
    fn test_degenerate_detection() {
        assert!(candle(1.08, 1.08, 1.08, 1.08).is_degenerate());
        assert!(!candle(1.08, 1.09, 1.07, 1.085).is_degenerate());
    }

    #[test]
    fn test_gap_missing_candles() {
        let gap = Gap {
            symbol: "EURUSD".to_string(),
            timeframe: Timeframe::M1,
            start: 0,
            end: 5 * 60_000,
            kind: GapKind::StartGap,
        };
        assert_eq!(gap.missing_candles(), 5);
    }

    #[test]
    fn test_job_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert!(!JobStatus::Pending.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }
}
