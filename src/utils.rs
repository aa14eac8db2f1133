/// Module utilitaire pour les fonctions partagées
use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Formate un timestamp en millisecondes en format lisible
///
/// EXEMPLE:
/// 1700000000000 → "2023-11-14 22:13:20"
pub fn format_timestamp_ms(timestamp_ms: i64) -> String {
    if let Some(datetime_utc) = DateTime::<Utc>::from_timestamp_millis(timestamp_ms) {
        datetime_utc.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        "Invalid timestamp".to_string()
    }
}

/// Timestamp courant en millisecondes UTC
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Parse une date UTC en timestamp millisecondes
///
/// Formats acceptés: "YYYY-MM-DD", "YYYY-MM-DD HH:MM" et
/// "YYYY-MM-DD HH:MM:SS" (minuit implicite quand l'heure est absente)
pub fn parse_utc_datetime(input: &str) -> Result<i64> {
    let trimmed = input.trim();

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        let naive = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow!("date invalide: {}", input))?;
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc).timestamp_millis());
    }

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc).timestamp_millis());
        }
    }

    Err(anyhow!(
        "format de date non reconnu: {} (attendu YYYY-MM-DD [HH:MM[:SS]])",
        input
    ))
}
