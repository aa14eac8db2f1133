/// Module de calendrier de marché
///
/// Décide si un marché est ouvert à un instant donné. Le forex et les
/// métaux précieux partagent la même fenêtre hebdomadaire: fermeture du
/// vendredi 22:00 UTC au dimanche 22:00 UTC. Une table de jours fériés
/// optionnelle force la fermeture sur des dates entières.
///
/// Deux formes de décision:
/// - forme instant (`is_open`): utilisée par le constructeur de bougies et
///   le calcul des créneaux attendus
/// - forme plage (`is_range_open`): échantillonnage du point médian par
///   défaut, utilisée par le détecteur de gaps; `open_minutes` fournit le
///   mode strict qui intègre les minutes ouvertes sur la plage
use std::collections::HashSet;

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::timeframe::Timeframe;

/// Classe d'instrument, sélectionne le calendrier applicable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentClass {
    Forex,
    Metal,
}

impl InstrumentClass {
    /// Classe un symbole: XAU*/XAG* → métal, le reste → forex
    pub fn classify(symbol: &str) -> Self {
        let upper = symbol.to_uppercase();
        if upper.starts_with("XAU") || upper.starts_with("XAG") {
            InstrumentClass::Metal
        } else {
            InstrumentClass::Forex
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstrumentClass::Forex => "forex",
            InstrumentClass::Metal => "metal",
        }
    }
}

/// Heure UTC de bascule du week-end FX (vendredi et dimanche)
const FX_WEEKEND_HOUR: u32 = 22;

/// Calendrier de marché avec fériés optionnels
#[derive(Debug, Clone, Default)]
pub struct MarketCalendar {
    holidays: HashSet<NaiveDate>,
}

impl MarketCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calendrier avec une table de jours fériés (fermeture sur la date UTC entière)
    pub fn with_holidays(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        MarketCalendar {
            holidays: holidays.into_iter().collect(),
        }
    }

    /// Le marché est-il ouvert à cet instant?
    pub fn is_open(&self, class: InstrumentClass, ts_ms: i64) -> bool {
        let Some(dt) = DateTime::<Utc>::from_timestamp_millis(ts_ms) else {
            return false;
        };

        if self.holidays.contains(&dt.date_naive()) {
            return false;
        }

        match class {
            // Forex et métaux suivent la même fenêtre hebdomadaire
            InstrumentClass::Forex | InstrumentClass::Metal => !Self::in_fx_weekend(&dt),
        }
    }

    /// Fermé du vendredi 22:00 UTC au dimanche 22:00 UTC
    fn in_fx_weekend(dt: &DateTime<Utc>) -> bool {
        match dt.weekday() {
            Weekday::Sat => true,
            Weekday::Fri => dt.hour() >= FX_WEEKEND_HOUR,
            Weekday::Sun => dt.hour() < FX_WEEKEND_HOUR,
            _ => false,
        }
    }

    /// Décision sur une plage [from, to): échantillonnage du point médian
    pub fn is_range_open(&self, class: InstrumentClass, from_ms: i64, to_ms: i64) -> bool {
        if from_ms >= to_ms {
            return false;
        }
        self.is_open(class, from_ms + (to_ms - from_ms) / 2)
    }

    /// Mode strict: nombre de minutes ouvertes dans [from, to)
    pub fn open_minutes(&self, class: InstrumentClass, from_ms: i64, to_ms: i64) -> i64 {
        Timeframe::M1
            .slots(from_ms, to_ms)
            .into_iter()
            .filter(|slot| self.is_open(class, *slot))
            .count() as i64
    }

    /// Nombre de bougies attendues: créneaux de la plage ouverts au calendrier
    pub fn expected_candles(
        &self,
        class: InstrumentClass,
        tf: Timeframe,
        from_ms: i64,
        to_ms: i64,
    ) -> i64 {
        tf.slots(from_ms, to_ms)
            .into_iter()
            .filter(|slot| self.is_open(class, *slot))
            .count() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Repères UTC (vérifiés): 2025-02-14 est un vendredi
    const FRI_2159: i64 = 1_739_570_340_000; // 2025-02-14 21:59:00
    const FRI_2200: i64 = 1_739_570_400_000; // 2025-02-14 22:00:00
    const SAT_NOON: i64 = 1_739_620_800_000; // 2025-02-15 12:00:00
    const SUN_2159: i64 = 1_739_743_140_000; // 2025-02-16 21:59:00
    const SUN_2200: i64 = 1_739_743_200_000; // 2025-02-16 22:00:00
    const WED_NOON: i64 = 1_739_361_600_000; // 2025-02-12 12:00:00

    #[test]
    fn test_weekday_open() {
        let cal = MarketCalendar::new();
        assert!(cal.is_open(InstrumentClass::Forex, WED_NOON));
        assert!(cal.is_open(InstrumentClass::Metal, WED_NOON));
    }

    #[test]
    fn test_fx_weekend_boundaries() {
        let cal = MarketCalendar::new();
        assert!(cal.is_open(InstrumentClass::Forex, FRI_2159));
        assert!(!cal.is_open(InstrumentClass::Forex, FRI_2200));
        assert!(!cal.is_open(InstrumentClass::Forex, SAT_NOON));
        assert!(!cal.is_open(InstrumentClass::Forex, SUN_2159));
        assert!(cal.is_open(InstrumentClass::Forex, SUN_2200));
    }

    #[test]
    fn test_holiday_overrides_open_day() {
        let christmas = NaiveDate::from_ymd_opt(2025, 12, 25).unwrap();
        let cal = MarketCalendar::with_holidays([christmas]);
        // Jeudi 2025-12-25 12:00 UTC
        let xmas_noon = 1_766_664_000_000;
        assert!(!cal.is_open(InstrumentClass::Forex, xmas_noon));
        assert!(cal.is_open(InstrumentClass::Forex, WED_NOON));
    }

    #[test]
    fn test_range_midpoint_sampling() {
        let cal = MarketCalendar::new();
        // Tout le samedi: point médian fermé
        assert!(!cal.is_range_open(InstrumentClass::Forex, FRI_2200, SUN_2200));
        // Mercredi: ouvert
        assert!(cal.is_range_open(InstrumentClass::Forex, WED_NOON, WED_NOON + 3_600_000));
        // Plage vide
        assert!(!cal.is_range_open(InstrumentClass::Forex, WED_NOON, WED_NOON));
    }

    #[test]
    fn test_open_minutes_over_weekend() {
        let cal = MarketCalendar::new();
        // De vendredi 21:59 à vendredi 22:02: une seule minute ouverte (21:59)
        let minutes = cal.open_minutes(InstrumentClass::Forex, FRI_2159, FRI_2159 + 3 * 60_000);
        assert_eq!(minutes, 1);
    }

    #[test]
    fn test_expected_candles_weekend_is_zero() {
        let cal = MarketCalendar::new();
        let expected =
            cal.expected_candles(InstrumentClass::Forex, Timeframe::M1, FRI_2200, SUN_2200);
        assert_eq!(expected, 0);
    }

    #[test]
    fn test_expected_candles_weekday() {
        let cal = MarketCalendar::new();
        let expected = cal.expected_candles(
            InstrumentClass::Forex,
            Timeframe::M1,
            WED_NOON,
            WED_NOON + 10 * 60_000,
        );
        assert_eq!(expected, 10);
    }

    #[test]
    fn test_classify_symbols() {
        assert_eq!(InstrumentClass::classify("EURUSD"), InstrumentClass::Forex);
        assert_eq!(InstrumentClass::classify("XAUUSD"), InstrumentClass::Metal);
        assert_eq!(InstrumentClass::classify("xagusd"), InstrumentClass::Metal);
    }
}
