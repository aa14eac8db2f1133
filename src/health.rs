/// Module de surveillance de santé du pipeline
///
/// À chaque tick (60 s par défaut), produit un instantané: fraîcheur M1 et
/// débit de ticks par instrument, gaps et bougies dégénérées sur 24 h,
/// latence du magasin et compteurs de la file. Les dépassements de seuils
/// sont journalisés en warning; l'instantané est ajouté à la série
/// health_metrics, et un échec d'écriture n'est pas fatal.
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use tracing::warn;

use crate::gap_detector::GapDetector;
use crate::queue::{BackfillQueue, QueueCounts};
use crate::store::Store;
use crate::timeframe::Timeframe;
use crate::utils::now_ms;

/// Seuils d'alerte configurables
#[derive(Debug, Clone)]
pub struct AlertThresholds {
    /// Âge maximal de la dernière bougie M1 (secondes)
    pub max_data_age_secs: i64,
    /// Débit de ticks minimal (ticks/minute)
    pub min_tick_rate_per_min: f64,
    /// Nombre maximal de gaps sur 24 h
    pub max_gaps_per_day: usize,
    /// Part maximale de bougies dégénérées sur 24 h (pour cent)
    pub max_incomplete_percent: f64,
    /// Seuils d'alerte sur la file de backfill
    pub queue_pending_warn: i64,
    pub queue_failed_warn: i64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        AlertThresholds {
            max_data_age_secs: 300,
            min_tick_rate_per_min: 10.0,
            max_gaps_per_day: 10,
            max_incomplete_percent: 5.0,
            queue_pending_warn: 50,
            queue_failed_warn: 10,
        }
    }
}

/// Santé d'un instrument
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentHealth {
    pub symbol: String,
    /// Âge de la dernière M1 en secondes, None si aucune donnée
    pub data_age_secs: Option<i64>,
    /// Ticks des 5 dernières minutes ÷ 5
    pub tick_rate_per_min: f64,
    pub gaps_24h: usize,
    pub degenerate_percent_24h: f64,
    /// Alertes déclenchées par les seuils
    pub alerts: Vec<String>,
}

/// Instantané global de santé
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub generated_at: i64,
    pub instruments: Vec<InstrumentHealth>,
    pub queue: QueueCounts,
    pub store_latency_ms: f64,
    pub alerts: Vec<String>,
}

/// Moniteur de santé
#[derive(Clone)]
pub struct HealthMonitor {
    store: Store,
    queue: BackfillQueue,
    detector: GapDetector,
    thresholds: AlertThresholds,
    symbols: Vec<String>,
}

impl HealthMonitor {
    pub fn new(
        store: Store,
        queue: BackfillQueue,
        detector: GapDetector,
        thresholds: AlertThresholds,
        symbols: Vec<String>,
    ) -> Self {
        HealthMonitor {
            store,
            queue,
            detector,
            thresholds,
            symbols,
        }
    }

    /// Exécute une opération bloquante depuis un contexte asynchrone
    pub async fn with<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&HealthMonitor) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let monitor = self.clone();
        Ok(tokio::task::spawn_blocking(move || f(&monitor)).await??)
    }

    /// Produit l'instantané de santé courant
    pub fn snapshot(&self) -> Result<HealthSnapshot> {
        let now = now_ms();

        // Latence magasin: une requête témoin chronométrée
        let probe_started = Instant::now();
        let _ = self.store.candle_count(
            self.symbols.first().map(String::as_str).unwrap_or("EURUSD"),
            Timeframe::M1,
            now - 60_000,
            now,
        )?;
        let store_latency_ms = probe_started.elapsed().as_secs_f64() * 1_000.0;

        let mut instruments = Vec::with_capacity(self.symbols.len());
        let mut alerts = Vec::new();

        for symbol in &self.symbols {
            let health = self.instrument_health(symbol, now)?;
            for alert in &health.alerts {
                alerts.push(format!("{}: {}", symbol, alert));
            }
            instruments.push(health);
        }

        let queue = self.queue.status_counts()?;
        if queue.pending > self.thresholds.queue_pending_warn {
            alerts.push(format!("file: {} jobs pending", queue.pending));
        }
        if queue.failed > self.thresholds.queue_failed_warn {
            alerts.push(format!("file: {} jobs failed", queue.failed));
        }

        for alert in &alerts {
            warn!(alert = %alert, "seuil de santé dépassé");
        }

        Ok(HealthSnapshot {
            generated_at: now,
            instruments,
            queue,
            store_latency_ms,
            alerts,
        })
    }

    /// Santé d'un seul instrument
    fn instrument_health(&self, symbol: &str, now: i64) -> Result<InstrumentHealth> {
        let day_ago = now - 86_400_000;

        let data_age_secs = self
            .store
            .latest_timestamp(symbol, Timeframe::M1)?
            .map(|latest| (now - latest) / 1_000);

        let ticks_5min = self.store.tick_count_since(symbol, now - 5 * 60_000)?;
        let tick_rate_per_min = ticks_5min as f64 / 5.0;

        let gaps_24h = self
            .detector
            .detect_gaps(symbol, Timeframe::M1, day_ago, now)?
            .len();

        let candles_24h = self.store.candle_count(symbol, Timeframe::M1, day_ago, now)?;
        let degenerate_24h = self
            .store
            .find_degenerate(symbol, Timeframe::M1, day_ago, now)?
            .len() as i64;
        let degenerate_percent_24h = if candles_24h == 0 {
            0.0
        } else {
            degenerate_24h as f64 * 100.0 / candles_24h as f64
        };

        let mut alerts = Vec::new();
        match data_age_secs {
            Some(age) if age > self.thresholds.max_data_age_secs => {
                alerts.push(format!("données M1 vieilles de {} s", age));
            }
            None => alerts.push("aucune bougie M1".to_string()),
            _ => {}
        }
        if tick_rate_per_min < self.thresholds.min_tick_rate_per_min {
            alerts.push(format!("débit de ticks faible: {:.1}/min", tick_rate_per_min));
        }
        if gaps_24h > self.thresholds.max_gaps_per_day {
            alerts.push(format!("{} gaps sur 24 h", gaps_24h));
        }
        if degenerate_percent_24h > self.thresholds.max_incomplete_percent {
            alerts.push(format!(
                "{:.1}% de bougies dégénérées sur 24 h",
                degenerate_percent_24h
            ));
        }

        Ok(InstrumentHealth {
            symbol: symbol.to_string(),
            data_age_secs,
            tick_rate_per_min,
            gaps_24h,
            degenerate_percent_24h,
            alerts,
        })
    }

    /// Ajoute l'instantané à la série health_metrics
    ///
    /// L'échec d'écriture est remonté à l'appelant, qui le journalise sans
    /// interrompre la boucle de surveillance.
    pub fn record(&self, snapshot: &HealthSnapshot) -> Result<()> {
        let at = snapshot.generated_at;

        self.store
            .record_metric("store_latency_ms", snapshot.store_latency_ms, None, None, at)?;
        self.store
            .record_metric("queue_pending", snapshot.queue.pending as f64, None, None, at)?;
        self.store
            .record_metric("queue_processing", snapshot.queue.processing as f64, None, None, at)?;
        self.store
            .record_metric("queue_failed", snapshot.queue.failed as f64, None, None, at)?;

        for instrument in &snapshot.instruments {
            let symbol = Some(instrument.symbol.as_str());
            if let Some(age) = instrument.data_age_secs {
                self.store
                    .record_metric("data_age_secs", age as f64, symbol, Some(Timeframe::M1), at)?;
            }
            self.store.record_metric(
                "tick_rate_per_min",
                instrument.tick_rate_per_min,
                symbol,
                None,
                at,
            )?;
            self.store.record_metric(
                "gaps_24h",
                instrument.gaps_24h as f64,
                symbol,
                Some(Timeframe::M1),
                at,
            )?;
            self.store.record_metric(
                "degenerate_percent_24h",
                instrument.degenerate_percent_24h,
                symbol,
                Some(Timeframe::M1),
                at,
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::MarketCalendar;
    use crate::models::{Candle, Tick};

    fn monitor_with(symbols: &[&str]) -> (Store, HealthMonitor) {
        let store = Store::open_in_memory().unwrap();
        let queue = BackfillQueue::new(&store);
        let detector = GapDetector::new(store.clone(), MarketCalendar::new());
        let monitor = HealthMonitor::new(
            store.clone(),
            queue,
            detector,
            AlertThresholds::default(),
            symbols.iter().map(|s| s.to_string()).collect(),
        );
        (store, monitor)
    }

    #[test]
    fn test_snapshot_without_data_raises_alerts() {
        let (_, monitor) = monitor_with(&["EURUSD"]);
        let snapshot = monitor.snapshot().unwrap();

        assert_eq!(snapshot.instruments.len(), 1);
        let health = &snapshot.instruments[0];
        assert!(health.data_age_secs.is_none());
        // Aucune M1 + débit de ticks nul
        assert!(health.alerts.iter().any(|a| a.contains("aucune bougie")));
        assert!(health.alerts.iter().any(|a| a.contains("débit de ticks")));
    }

    #[test]
    fn test_snapshot_fresh_data_no_age_alert() {
        let (store, monitor) = monitor_with(&["EURUSD"]);
        let now = now_ms();
        let minute = Timeframe::M1.align_ms(now);

        store
            .upsert_candle(
                "EURUSD",
                Timeframe::M1,
                &Candle {
                    timestamp: minute,
                    open: 1.08,
                    high: 1.081,
                    low: 1.079,
                    close: 1.0805,
                    volume: 5.0,
                    spread: None,
                },
            )
            .unwrap();
        // 60 ticks sur les 5 dernières minutes → 12/min
        let ticks: Vec<Tick> = (0..60)
            .map(|i| Tick {
                symbol: "EURUSD".to_string(),
                timestamp: now - 5 * 60_000 + i * 5_000 + 1,
                price: 1.08,
                volume: 1.0,
            })
            .collect();
        store.insert_ticks(&ticks).unwrap();

        let snapshot = monitor.snapshot().unwrap();
        let health = &snapshot.instruments[0];
        assert!(health.data_age_secs.unwrap() < 300);
        assert!((health.tick_rate_per_min - 12.0).abs() < 1e-9);
        assert!(health.alerts.is_empty() || !health.alerts.iter().any(|a| a.contains("vieilles")));
    }

    #[test]
    fn test_record_appends_metrics() {
        let (_, monitor) = monitor_with(&["EURUSD", "XAUUSD"]);
        let snapshot = monitor.snapshot().unwrap();
        monitor.record(&snapshot).unwrap();
    }
}
