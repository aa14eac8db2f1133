/// Module de détection des gaps et de contrôle d'intégrité
///
/// ALGORITHME DE DÉTECTION:
/// 1. Charge les timestamps existants de la plage, triés croissants
/// 2. Fenêtre glissante: un écart entre voisins supérieur à 2×durée
///    signale un gap (une seule bougie manquante est tolérée comme jitter
///    normal de l'amont)
/// 3. Mêmes seuils aux bords: gap de début si la première bougie est en
///    retard sur align(from), gap de fin symétriquement, gap total si la
///    plage est vide
/// 4. Les gaps entièrement en période de marché fermé sont supprimés
///    (échantillonnage du point médian via le calendrier)
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

use crate::calendar::{InstrumentClass, MarketCalendar};
use crate::models::{Candle, Gap, GapKind, IntegrityRecord, IntegrityStatus};
use crate::store::Store;
use crate::timeframe::Timeframe;
use crate::utils::now_ms;

/// Couverture minimale pour qu'un instrument soit déclaré sain
pub const COVERAGE_THRESHOLD: f64 = 0.95;

/// Résultat d'un contrôle d'intégrité complet sur une plage
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub from: i64,
    pub to: i64,
    pub gaps: Vec<Gap>,
    pub degenerate: Vec<Candle>,
    pub expected_candles: i64,
    pub actual_candles: i64,
    pub coverage: f64,
}

impl IntegrityReport {
    /// Sain: aucun gap, aucune bougie dégénérée, couverture suffisante
    pub fn healthy(&self) -> bool {
        self.gaps.is_empty()
            && self.degenerate.is_empty()
            && self.coverage >= COVERAGE_THRESHOLD
    }

    /// Total des bougies manquantes sur l'ensemble des gaps
    pub fn missing_candles(&self) -> i64 {
        self.gaps.iter().map(Gap::missing_candles).sum()
    }
}

/// Détecteur de gaps et de bougies suspectes
#[derive(Clone)]
pub struct GapDetector {
    store: Store,
    calendar: MarketCalendar,
}

impl GapDetector {
    pub fn new(store: Store, calendar: MarketCalendar) -> Self {
        GapDetector { store, calendar }
    }

    /// Exécute une opération bloquante depuis un contexte asynchrone
    pub async fn with<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&GapDetector) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let detector = self.clone();
        Ok(tokio::task::spawn_blocking(move || f(&detector)).await??)
    }

    /// Détecte les plages de bougies manquantes dans [from, to)
    pub fn detect_gaps(
        &self,
        symbol: &str,
        tf: Timeframe,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Gap>> {
        if from_ms >= to_ms {
            return Ok(Vec::new());
        }

        let class = InstrumentClass::classify(symbol);
        let timestamps = self.store.candle_timestamps(symbol, tf, from_ms, to_ms)?;

        let dur = tf.duration_ms();
        let threshold = 2 * dur;
        let aligned_from = tf.align_ms(from_ms);

        let mut gaps: Vec<Gap> = Vec::new();
        let gap = |start: i64, end: i64, kind: GapKind| Gap {
            symbol: symbol.to_string(),
            timeframe: tf,
            start,
            end,
            kind,
        };

        if timestamps.is_empty() {
            gaps.push(gap(aligned_from, to_ms, GapKind::FullGap));
        } else {
            // Gap de début: la première bougie est en retard sur la plage
            let first = timestamps[0];
            if first - aligned_from > threshold {
                gaps.push(gap(aligned_from, first, GapKind::StartGap));
            }

            // Gaps intermédiaires: fenêtre glissante sur les voisins
            for pair in timestamps.windows(2) {
                let (previous, next) = (pair[0], pair[1]);
                if next - previous > threshold {
                    gaps.push(gap(previous + dur, next, GapKind::MidGap));
                }
            }

            // Gap de fin: les données s'arrêtent avant la fin de la plage
            let last_end = timestamps[timestamps.len() - 1] + dur;
            if to_ms - last_end > threshold {
                gaps.push(gap(last_end, to_ms, GapKind::EndGap));
            }
        }

        // Supprimer les gaps entièrement en marché fermé (week-end, fériés)
        gaps.retain(|g| self.calendar.is_range_open(class, g.start, g.end));

        Ok(gaps)
    }

    /// Contrôle d'intégrité complet sur les `days` derniers jours
    ///
    /// Calcule gaps, bougies dégénérées et couverture
    /// (actual / expected, 1.0 quand expected vaut 0), puis met à jour
    /// l'enregistrement d'intégrité du jour.
    pub fn full_integrity_check(
        &self,
        symbol: &str,
        tf: Timeframe,
        days: i64,
    ) -> Result<IntegrityReport> {
        let to = now_ms();
        let from = to - days * 86_400_000;
        self.integrity_check_range(symbol, tf, from, to)
    }

    /// Variante à bornes explicites (utilisée aussi par les tests)
    pub fn integrity_check_range(
        &self,
        symbol: &str,
        tf: Timeframe,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<IntegrityReport> {
        let class = InstrumentClass::classify(symbol);

        let gaps = self.detect_gaps(symbol, tf, from_ms, to_ms)?;
        let degenerate = self.store.find_degenerate(symbol, tf, from_ms, to_ms)?;
        let expected = self.calendar.expected_candles(class, tf, from_ms, to_ms);
        let actual = self.store.candle_count(symbol, tf, from_ms, to_ms)?;

        let coverage = if expected == 0 {
            1.0
        } else {
            actual as f64 / expected as f64
        };

        let report = IntegrityReport {
            symbol: symbol.to_string(),
            timeframe: tf,
            from: from_ms,
            to: to_ms,
            gaps,
            degenerate,
            expected_candles: expected,
            actual_candles: actual,
            coverage,
        };

        let record = IntegrityRecord {
            symbol: symbol.to_string(),
            timeframe: tf,
            date: Utc::now().date_naive(),
            expected_candles: report.expected_candles,
            actual_candles: report.actual_candles,
            missing_candles: report.missing_candles(),
            incomplete_candles: report.degenerate.len() as i64,
            last_checked: now_ms(),
            status: if report.healthy() {
                IntegrityStatus::Ok
            } else {
                IntegrityStatus::Gaps
            },
        };
        self.store.upsert_integrity(&record)?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2025-02-12 10:00:00 UTC, un mercredi
    const WED_10_00: i64 = 1_739_354_400_000;
    const MIN: i64 = 60_000;

    fn detector() -> (Store, GapDetector) {
        let store = Store::open_in_memory().unwrap();
        let detector = GapDetector::new(store.clone(), MarketCalendar::new());
        (store, detector)
    }

    fn seed_minutes(store: &Store, symbol: &str, minutes: &[i64]) {
        for ts in minutes {
            let candle = Candle {
                timestamp: *ts,
                open: 1.08,
                high: 1.081,
                low: 1.079,
                close: 1.0805,
                volume: 5.0,
                spread: None,
            };
            store.upsert_candle(symbol, Timeframe::M1, &candle).unwrap();
        }
    }

    #[test]
    fn test_start_gap() {
        let (store, detector) = detector();
        // Bougies à 10:05, 10:06, 10:07; plage demandée 10:00 → 10:10
        seed_minutes(
            &store,
            "EURUSD",
            &[WED_10_00 + 5 * MIN, WED_10_00 + 6 * MIN, WED_10_00 + 7 * MIN],
        );

        let gaps = detector
            .detect_gaps("EURUSD", Timeframe::M1, WED_10_00, WED_10_00 + 10 * MIN)
            .unwrap();

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].kind, GapKind::StartGap);
        assert_eq!(gaps[0].start, WED_10_00);
        assert_eq!(gaps[0].end, WED_10_00 + 5 * MIN);
        assert_eq!(gaps[0].missing_candles(), 5);
    }

    #[test]
    fn test_mid_gap() {
        let (store, detector) = detector();
        // Trou de 10:01 à 10:05 exclu (4 bougies manquantes: 01, 02, 03, 04)
        seed_minutes(&store, "EURUSD", &[WED_10_00, WED_10_00 + 5 * MIN, WED_10_00 + 6 * MIN]);

        let gaps = detector
            .detect_gaps("EURUSD", Timeframe::M1, WED_10_00, WED_10_00 + 7 * MIN)
            .unwrap();

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].kind, GapKind::MidGap);
        assert_eq!(gaps[0].start, WED_10_00 + MIN);
        assert_eq!(gaps[0].end, WED_10_00 + 5 * MIN);
        assert_eq!(gaps[0].missing_candles(), 4);
    }

    #[test]
    fn test_end_gap() {
        let (store, detector) = detector();
        seed_minutes(&store, "EURUSD", &[WED_10_00, WED_10_00 + MIN]);

        let gaps = detector
            .detect_gaps("EURUSD", Timeframe::M1, WED_10_00, WED_10_00 + 10 * MIN)
            .unwrap();

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].kind, GapKind::EndGap);
        assert_eq!(gaps[0].start, WED_10_00 + 2 * MIN);
        assert_eq!(gaps[0].end, WED_10_00 + 10 * MIN);
    }

    #[test]
    fn test_full_gap_when_empty() {
        let (_, detector) = detector();
        let gaps = detector
            .detect_gaps("EURUSD", Timeframe::M1, WED_10_00, WED_10_00 + 10 * MIN)
            .unwrap();

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].kind, GapKind::FullGap);
        assert_eq!(gaps[0].missing_candles(), 10);
    }

    #[test]
    fn test_single_missing_candle_tolerated() {
        let (store, detector) = detector();
        // Écart de 2×durée (une bougie manquante): jitter toléré
        seed_minutes(&store, "EURUSD", &[WED_10_00, WED_10_00 + 2 * MIN]);

        let gaps = detector
            .detect_gaps("EURUSD", Timeframe::M1, WED_10_00, WED_10_00 + 3 * MIN)
            .unwrap();
        assert!(gaps.is_empty());
    }

    #[test]
    fn test_weekend_gap_suppressed() {
        let (_, detector) = detector();
        // Samedi 2025-02-15 entier, aucune donnée
        let sat_00 = 1_739_577_600_000;
        let sat_2359 = sat_00 + (23 * 60 + 59) * MIN;

        let gaps = detector
            .detect_gaps("EURUSD", Timeframe::M1, sat_00, sat_2359)
            .unwrap();
        assert_eq!(gaps, vec![]);
    }

    #[test]
    fn test_weekend_mid_gap_suppressed() {
        let (store, detector) = detector();
        // Vendredi 21:59 puis dimanche 22:00: le trou couvre le week-end
        let fri_2159 = 1_739_570_340_000;
        let sun_2200 = 1_739_743_200_000;
        seed_minutes(&store, "EURUSD", &[fri_2159, sun_2200]);

        let gaps = detector
            .detect_gaps("EURUSD", Timeframe::M1, fri_2159, sun_2200 + MIN)
            .unwrap();
        assert_eq!(gaps, vec![]);
    }

    #[test]
    fn test_empty_range() {
        let (_, detector) = detector();
        assert!(detector
            .detect_gaps("EURUSD", Timeframe::M1, WED_10_00, WED_10_00)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_integrity_report_coverage() {
        let (store, detector) = detector();
        // 8 bougies présentes sur 10 attendues
        let minutes: Vec<i64> = (0..10)
            .filter(|i| *i != 3 && *i != 4)
            .map(|i| WED_10_00 + i * MIN)
            .collect();
        seed_minutes(&store, "EURUSD", &minutes);

        let report = detector
            .integrity_check_range("EURUSD", Timeframe::M1, WED_10_00, WED_10_00 + 10 * MIN)
            .unwrap();

        assert_eq!(report.expected_candles, 10);
        assert_eq!(report.actual_candles, 8);
        assert!((report.coverage - 0.8).abs() < 1e-9);
        assert!(!report.healthy());
        assert_eq!(report.missing_candles(), 2);

        // L'enregistrement du jour a été posé
        let record = store
            .read_integrity("EURUSD", Timeframe::M1, Utc::now().date_naive())
            .unwrap()
            .unwrap();
        assert_eq!(record.status, IntegrityStatus::Gaps);
        assert_eq!(record.actual_candles, 8);
    }

    #[test]
    fn test_integrity_empty_range_is_healthy() {
        let (_, detector) = detector();
        let report = detector
            .integrity_check_range("EURUSD", Timeframe::M1, WED_10_00, WED_10_00)
            .unwrap();
        assert_eq!(report.coverage, 1.0);
        assert!(report.healthy());
    }

    #[test]
    fn test_degenerate_counted_as_incomplete() {
        let (store, detector) = detector();
        seed_minutes(&store, "EURUSD", &[WED_10_00, WED_10_00 + MIN]);
        store
            .upsert_candle(
                "EURUSD",
                Timeframe::M1,
                &Candle {
                    timestamp: WED_10_00 + 2 * MIN,
                    open: 1.08,
                    high: 1.08,
                    low: 1.08,
                    close: 1.08,
                    volume: 0.0,
                    spread: None,
                },
            )
            .unwrap();

        let report = detector
            .integrity_check_range("EURUSD", Timeframe::M1, WED_10_00, WED_10_00 + 3 * MIN)
            .unwrap();
        assert_eq!(report.degenerate.len(), 1);
        assert!(!report.healthy());
    }
}
