/// Module du bus de ticks et de l'ingestion temps réel
///
/// ARCHITECTURE:
/// Le producteur de ticks (connecteur broker, relecture, simulateur) est un
/// collaborateur externe: il publie sur le bus, le pipeline consomme. Le
/// bus est un canal broadcast typé à tampon borné: un abonné lent perd des
/// messages (signalés par Lagged) mais ne ralentit jamais l'ingestion.
///
/// L'ingestion temps réel accumule les ticks reçus, les écrit par lots dans
/// le magasin, puis reconstruit la bougie M1 de chaque minute close. Les
/// minutes sans tick ne produisent rien: le trou reste visible pour le
/// détecteur de gaps.
use std::collections::BTreeSet;

use anyhow::Result;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::builder::CandleBuilder;
use crate::models::Tick;
use crate::store::Store;
use crate::timeframe::Timeframe;
use crate::utils::now_ms;

/// Capacité du tampon par abonné du bus de ticks
pub const TICK_BUS_CAPACITY: usize = 4_096;

/// Taille de lot au-delà de laquelle l'ingestion force une écriture
const FLUSH_BATCH_SIZE: usize = 256;

/// Période de flush de l'ingestion
const FLUSH_INTERVAL_MS: u64 = 2_000;

/// Bus de diffusion des ticks
#[derive(Clone)]
pub struct TickBus {
    tx: broadcast::Sender<Tick>,
}

impl TickBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(TICK_BUS_CAPACITY);
        TickBus { tx }
    }

    /// Publie un tick; un bus sans abonné l'ignore silencieusement
    pub fn publish(&self, tick: Tick) {
        let _ = self.tx.send(tick);
    }

    /// Ouvre un abonnement au flux de ticks
    pub fn subscribe(&self) -> broadcast::Receiver<Tick> {
        self.tx.subscribe()
    }
}

impl Default for TickBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Ingestion temps réel: bus de ticks → magasin → bougies M1
pub struct LiveIngest {
    store: Store,
    builder: CandleBuilder,
    receiver: broadcast::Receiver<Tick>,
    shutdown: watch::Receiver<bool>,
}

impl LiveIngest {
    pub fn new(
        store: Store,
        builder: CandleBuilder,
        bus: &TickBus,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        LiveIngest {
            store,
            builder,
            receiver: bus.subscribe(),
            shutdown,
        }
    }

    /// Boucle d'ingestion, tourne jusqu'au signal d'arrêt
    pub async fn run(mut self) {
        let mut buffer: Vec<Tick> = Vec::new();
        // Minutes (symbol, début) touchées, à reconstruire quand elles sont closes
        let mut open_minutes: BTreeSet<(String, i64)> = BTreeSet::new();
        let mut flush_timer =
            tokio::time::interval(std::time::Duration::from_millis(FLUSH_INTERVAL_MS));
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("ingestion temps réel démarrée");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    // Arrêt: dernière écriture puis sortie propre
                    if let Err(e) = self.flush(&mut buffer, &mut open_minutes).await {
                        warn!(error = %e, "flush final de l'ingestion");
                    }
                    break;
                }
                received = self.receiver.recv() => match received {
                    Ok(tick) => {
                        open_minutes.insert((
                            tick.symbol.clone(),
                            Timeframe::M1.align_ms(tick.timestamp),
                        ));
                        buffer.push(tick);
                        if buffer.len() >= FLUSH_BATCH_SIZE {
                            if let Err(e) = self.flush(&mut buffer, &mut open_minutes).await {
                                warn!(error = %e, "flush de l'ingestion");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        // Abonné trop lent: les ticks perdus referont surface
                        // au prochain balayage d'intégrité
                        warn!(dropped, "ticks perdus par l'ingestion");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("bus de ticks fermé");
                        break;
                    }
                },
                _ = flush_timer.tick() => {
                    if let Err(e) = self.flush(&mut buffer, &mut open_minutes).await {
                        warn!(error = %e, "flush périodique de l'ingestion");
                    }
                }
            }
        }

        info!("ingestion temps réel arrêtée");
    }

    /// Écrit le tampon puis reconstruit les bougies M1 des minutes closes
    async fn flush(
        &self,
        buffer: &mut Vec<Tick>,
        open_minutes: &mut BTreeSet<(String, i64)>,
    ) -> Result<()> {
        if !buffer.is_empty() {
            let batch = std::mem::take(buffer);
            self.store
                .with(move |store| store.insert_ticks(&batch))
                .await?;
        }

        // Une minute est close quand son créneau est entièrement écoulé
        let now = now_ms();
        let closed: Vec<(String, i64)> = open_minutes
            .iter()
            .filter(|(_, minute)| minute + Timeframe::M1.duration_ms() <= now)
            .cloned()
            .collect();

        for (symbol, minute) in closed {
            open_minutes.remove(&(symbol.clone(), minute));
            let built = self
                .builder
                .with(move |builder| {
                    builder.build_m1_from_ticks(
                        &symbol,
                        minute,
                        minute + Timeframe::M1.duration_ms(),
                    )
                })
                .await?;
            if built > 0 {
                debug!(minute, "bougie M1 construite depuis les ticks");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, ts: i64, price: f64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            timestamp: ts,
            price,
            volume: 1.0,
        }
    }

    #[tokio::test]
    async fn test_bus_fan_out() {
        let bus = TickBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(tick("EURUSD", 1_739_354_820_000, 1.08));

        assert_eq!(a.recv().await.unwrap().price, 1.08);
        assert_eq!(b.recv().await.unwrap().price, 1.08);
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_is_noop() {
        let bus = TickBus::new();
        bus.publish(tick("EURUSD", 1_739_354_820_000, 1.08));
    }

    #[tokio::test]
    async fn test_ingest_builds_closed_minutes() {
        let store = Store::open_in_memory().unwrap();
        let builder = CandleBuilder::new(store.clone());
        let bus = TickBus::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ingest = LiveIngest::new(store.clone(), builder, &bus, shutdown_rx);
        let handle = tokio::spawn(ingest.run());

        // Minute passée (déjà close), trois ticks
        let minute = Timeframe::M1.align_ms(now_ms() - 5 * 60_000);
        bus.publish(tick("EURUSD", minute + 10_000, 1.0800));
        bus.publish(tick("EURUSD", minute + 30_000, 1.0810));
        bus.publish(tick("EURUSD", minute + 50_000, 1.0790));

        // Laisser un cycle de flush passer
        tokio::time::sleep(std::time::Duration::from_millis(FLUSH_INTERVAL_MS + 500)).await;

        let _ = shutdown_tx.send(true);
        handle.await.unwrap();

        let candles = store
            .read_range("EURUSD", Timeframe::M1, minute, minute + 60_000)
            .unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].open, 1.0800);
        assert_eq!(candles[0].close, 1.0790);

        let stored_ticks = store.read_ticks("EURUSD", minute, minute + 60_000).unwrap();
        assert_eq!(stored_ticks.len(), 3);
    }
}
