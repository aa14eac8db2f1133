/// Module d'arithmétique des timeframes
///
/// Fournit l'ensemble fermé des timeframes supportés, l'alignement des
/// timestamps sur la grille propre à chaque timeframe et l'énumération des
/// créneaux attendus dans une plage.
///
/// L'alignement plancher tous les timestamps sur un multiple de la durée,
/// ancré à l'epoch Unix (donc 00:00 UTC pour D1 et pas de 4 heures
/// 00/04/08/12/16/20 UTC pour H4). Les secondes et millisecondes
/// résiduelles sont remises à zéro à tous les timeframes.
use std::fmt;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Timeframe supporté par le pipeline
///
/// M1 est le timeframe de base construit depuis les ticks; les autres sont
/// dérivés par agrégation de M1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Tous les timeframes, en ordre croissant de durée
    pub const ALL: [Timeframe; 7] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    /// Timeframes dérivés (tout sauf M1), en ordre croissant
    pub const DERIVED: [Timeframe; 6] = [
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    /// Durée du timeframe en secondes
    pub fn duration_secs(self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
        }
    }

    /// Durée du timeframe en millisecondes
    pub fn duration_ms(self) -> i64 {
        self.duration_secs() * 1_000
    }

    /// Représentation canonique, utilisée en base et dans les rapports
    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        }
    }

    /// Résolution au format du fournisseur historique (minutes, ou "D")
    pub fn resolution(self) -> &'static str {
        match self {
            Timeframe::M1 => "1",
            Timeframe::M5 => "5",
            Timeframe::M15 => "15",
            Timeframe::M30 => "30",
            Timeframe::H1 => "60",
            Timeframe::H4 => "240",
            Timeframe::D1 => "D",
        }
    }

    /// Parse une représentation textuelle ("M1", "h4", ...)
    pub fn parse(input: &str) -> Result<Self> {
        match input.trim().to_uppercase().as_str() {
            "M1" => Ok(Timeframe::M1),
            "M5" => Ok(Timeframe::M5),
            "M15" => Ok(Timeframe::M15),
            "M30" => Ok(Timeframe::M30),
            "H1" => Ok(Timeframe::H1),
            "H4" => Ok(Timeframe::H4),
            "D1" => Ok(Timeframe::D1),
            other => Err(anyhow!("timeframe inconnu: {}", other)),
        }
    }

    /// Plancher le timestamp sur le début de son créneau
    pub fn align_ms(self, ts_ms: i64) -> i64 {
        ts_ms - ts_ms.rem_euclid(self.duration_ms())
    }

    /// Vrai si le timestamp tombe exactement sur la grille
    pub fn is_aligned(self, ts_ms: i64) -> bool {
        ts_ms.rem_euclid(self.duration_ms()) == 0
    }

    /// Énumère les débuts de créneaux de la plage
    ///
    /// RETOUR: {align(from), align(from)+dur, ...} strictement inférieurs à
    /// `to`; vide quand from >= to
    pub fn slots(self, from_ms: i64, to_ms: i64) -> Vec<i64> {
        if from_ms >= to_ms {
            return Vec::new();
        }

        let dur = self.duration_ms();
        let mut slot = self.align_ms(from_ms);
        let mut slots = Vec::new();

        while slot < to_ms {
            slots.push(slot);
            slot += dur;
        }

        slots
    }

    /// Timeframes strictement plus grands que celui-ci, en ordre croissant
    pub fn higher(self) -> impl Iterator<Item = Timeframe> {
        Timeframe::ALL.into_iter().filter(move |tf| *tf > self)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2025-02-12 10:07:42.358 UTC, un mercredi
    const WED_10_07: i64 = 1_739_354_862_358;

    #[test]
    fn test_align_floors_seconds_and_millis() {
        // 10:07:42.358 → 10:07:00.000
        let aligned = Timeframe::M1.align_ms(WED_10_07);
        assert_eq!(aligned % 60_000, 0);
        assert_eq!(aligned, 1_739_354_820_000);
    }

    #[test]
    fn test_align_all_timeframes_on_grid() {
        for tf in Timeframe::ALL {
            let aligned = tf.align_ms(WED_10_07);
            assert!(tf.is_aligned(aligned), "{} mal aligné", tf);
            assert!(aligned <= WED_10_07);
            assert!(WED_10_07 - aligned < tf.duration_ms());
        }
    }

    #[test]
    fn test_d1_anchors_at_midnight_utc() {
        let aligned = Timeframe::D1.align_ms(WED_10_07);
        // 2025-02-12 00:00:00 UTC
        assert_eq!(aligned, 1_739_318_400_000);
    }

    #[test]
    fn test_h4_anchors_on_four_hour_steps() {
        let aligned = Timeframe::H4.align_ms(WED_10_07);
        // 2025-02-12 08:00:00 UTC
        assert_eq!(aligned, 1_739_318_400_000 + 8 * 3_600_000);
    }

    #[test]
    fn test_align_negative_timestamp() {
        // rem_euclid: les dates antérieures à l'epoch restent planchers
        assert_eq!(Timeframe::M1.align_ms(-30_000), -60_000);
    }

    #[test]
    fn test_slots_enumeration() {
        let from = 1_739_354_820_000; // 10:07:00
        let to = from + 5 * 60_000; // 10:12:00
        let slots = Timeframe::M1.slots(from, to);
        assert_eq!(slots.len(), 5);
        assert_eq!(slots[0], from);
        assert_eq!(slots[4], from + 4 * 60_000);
    }

    #[test]
    fn test_slots_empty_range() {
        assert!(Timeframe::M1.slots(WED_10_07, WED_10_07).is_empty());
        assert!(Timeframe::M1.slots(WED_10_07, WED_10_07 - 1).is_empty());
    }

    #[test]
    fn test_slots_start_at_aligned_from() {
        // from non aligné: le premier créneau est son plancher
        let slots = Timeframe::M5.slots(WED_10_07, WED_10_07 + 300_000);
        assert_eq!(slots[0], Timeframe::M5.align_ms(WED_10_07));
    }

    #[test]
    fn test_higher_timeframes() {
        let above_h1: Vec<Timeframe> = Timeframe::H1.higher().collect();
        assert_eq!(above_h1, vec![Timeframe::H4, Timeframe::D1]);
        assert_eq!(Timeframe::M1.higher().count(), 6);
        assert_eq!(Timeframe::D1.higher().count(), 0);
    }

    #[test]
    fn test_parse_round_trip() {
        for tf in Timeframe::ALL {
            assert_eq!(Timeframe::parse(tf.as_str()).unwrap(), tf);
        }
        assert_eq!(Timeframe::parse("m15").unwrap(), Timeframe::M15);
        assert!(Timeframe::parse("M2").is_err());
    }
}
