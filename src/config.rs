/// Module de configuration du pipeline
///
/// Toute la configuration est explicite et passée aux composants à la
/// construction: pas d'état global. Les valeurs proviennent de la CLI et
/// des variables d'environnement (FX_*), avec des défauts raisonnables.
use std::time::Duration;

use crate::health::AlertThresholds;
use crate::queue::DEFAULT_MAX_ATTEMPTS;
use crate::rate_limit::{DEFAULT_BURST, DEFAULT_REQUESTS_PER_MINUTE};

/// Les onze instruments majeurs suivis par défaut (dix paires FX + l'or)
pub const DEFAULT_PRIMARY_SYMBOLS: [&str; 11] = [
    "EURUSD", "GBPUSD", "USDJPY", "USDCHF", "AUDUSD", "USDCAD", "NZDUSD", "EURGBP", "EURJPY",
    "GBPJPY", "XAUUSD",
];

/// Configuration complète du pipeline
#[derive(Debug, Clone)]
pub struct Config {
    /// Chemin du fichier SQLite
    pub database_path: String,
    /// URL de base du fournisseur historique
    pub provider_url: String,
    /// Jeton d'API du fournisseur (optionnel)
    pub provider_token: Option<String>,
    /// Nombre de workers de backfill
    pub worker_count: usize,
    /// Port du serveur de santé
    pub health_port: u16,
    /// Instruments primaires balayés périodiquement
    pub primary_symbols: Vec<String>,
    /// Rétention des ticks bruts (jours)
    pub tick_retention_days: i64,
    /// Débit vers le fournisseur
    pub requests_per_minute: u32,
    pub burst: u32,
    /// Tentatives maximales d'un job de backfill
    pub max_attempts: i64,
    /// Bail d'un job loué
    pub lease_ttl: Duration,
    /// Périodes des boucles du moteur
    pub sweep_interval: Duration,
    pub deep_check_interval: Duration,
    pub reaper_interval: Duration,
    pub health_interval: Duration,
    /// Fenêtres des balayages
    pub sweep_window: Duration,
    pub deep_check_days: i64,
    /// Délai de grâce de l'arrêt en deux phases
    pub shutdown_grace: Duration,
    /// Seuils d'alerte du moniteur de santé
    pub thresholds: AlertThresholds,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: "market_data.db".to_string(),
            provider_url: "http://127.0.0.1:9000/udf".to_string(),
            provider_token: None,
            worker_count: 2,
            health_port: 8080,
            primary_symbols: DEFAULT_PRIMARY_SYMBOLS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            tick_retention_days: 7,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            burst: DEFAULT_BURST,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lease_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(3_600),
            deep_check_interval: Duration::from_secs(86_400),
            reaper_interval: Duration::from_secs(30),
            health_interval: Duration::from_secs(60),
            sweep_window: Duration::from_secs(3_600),
            deep_check_days: 7,
            shutdown_grace: Duration::from_secs(30),
            thresholds: AlertThresholds::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.primary_symbols.len(), 11);
        assert!(config.primary_symbols.contains(&"XAUUSD".to_string()));
        assert_eq!(config.deep_check_days, 7);
    }
}
