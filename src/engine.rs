/// Module du moteur d'orchestration
///
/// ARCHITECTURE:
/// Le moteur possède toutes les boucles périodiques et leur arrêt:
/// - ingestion temps réel (bus de ticks → M1 → magasin)
/// - balayage d'intégrité horaire sur les instruments primaires
/// - contrôle d'intégrité profond quotidien (7 jours, tous timeframes)
/// - pool de workers de backfill consommant la file
/// - reaper des baux expirés
/// - tick du moniteur de santé
/// - élagage quotidien des ticks (rétention)
///
/// Tous les collaborateurs sont injectés à la construction; l'état partagé
/// processus-entier (magasin, limiteur de débit) est construit une fois
/// dans `Pipeline::build` puis passé aux composants.
///
/// L'arrêt est en deux phases: le canal watch signale la fin des prises de
/// travail, les boucles drainent, puis les tâches encore vivantes au-delà
/// du délai de grâce sont annulées.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::builder::CandleBuilder;
use crate::calendar::MarketCalendar;
use crate::config::Config;
use crate::feed::{LiveIngest, TickBus};
use crate::gap_detector::GapDetector;
use crate::health::HealthMonitor;
use crate::models::BackfillJob;
use crate::provider::ProviderClient;
use crate::queue::{BackfillQueue, priority};
use crate::rate_limit::TokenBucket;
use crate::store::Store;
use crate::timeframe::Timeframe;
use crate::utils::now_ms;

/// Graphe des composants du pipeline, construit une fois au démarrage
#[derive(Clone)]
pub struct Pipeline {
    pub config: Config,
    pub store: Store,
    pub queue: BackfillQueue,
    pub provider: Arc<ProviderClient>,
    pub builder: CandleBuilder,
    pub detector: GapDetector,
    pub monitor: HealthMonitor,
    pub bus: TickBus,
}

impl Pipeline {
    /// Construit le graphe complet depuis la configuration
    pub fn build(config: Config) -> Result<Self> {
        let store = Store::open(&config.database_path)?;
        Self::build_with_store(config, store)
    }

    /// Variante avec un magasin déjà ouvert (tests, base en mémoire)
    pub fn build_with_store(config: Config, store: Store) -> Result<Self> {
        let queue = BackfillQueue::new(&store).with_max_attempts(config.max_attempts);
        let limiter = Arc::new(TokenBucket::new(config.requests_per_minute, config.burst));
        let provider = Arc::new(ProviderClient::new(
            config.provider_url.clone(),
            config.provider_token.clone(),
            limiter,
        )?);
        let builder = CandleBuilder::new(store.clone());
        let detector = GapDetector::new(store.clone(), MarketCalendar::new());
        let monitor = HealthMonitor::new(
            store.clone(),
            queue.clone(),
            detector.clone(),
            config.thresholds.clone(),
            config.primary_symbols.clone(),
        );

        Ok(Pipeline {
            config,
            store,
            queue,
            provider,
            builder,
            detector,
            monitor,
            bus: TickBus::new(),
        })
    }
}

/// Moteur: démarre les boucles et rend un handle d'arrêt
pub struct Engine {
    pipeline: Pipeline,
}

impl Engine {
    pub fn new(pipeline: Pipeline) -> Self {
        Engine { pipeline }
    }

    /// Démarre toutes les boucles périodiques
    pub fn start(&self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let p = &self.pipeline;
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Ingestion temps réel
        let ingest = LiveIngest::new(
            p.store.clone(),
            p.builder.clone(),
            &p.bus,
            shutdown_rx.clone(),
        );
        tasks.push(tokio::spawn(ingest.run()));

        // Balayage d'intégrité horaire (fenêtre glissante M1)
        tasks.push(tokio::spawn(sweep_loop(
            p.detector.clone(),
            p.queue.clone(),
            p.config.primary_symbols.clone(),
            p.config.sweep_interval,
            p.config.sweep_window,
            shutdown_rx.clone(),
        )));

        // Contrôle profond quotidien, tous timeframes
        tasks.push(tokio::spawn(deep_check_loop(
            p.detector.clone(),
            p.queue.clone(),
            p.config.primary_symbols.clone(),
            p.config.deep_check_interval,
            p.config.deep_check_days,
            shutdown_rx.clone(),
        )));

        // Pool de workers de backfill
        for index in 0..p.config.worker_count {
            tasks.push(tokio::spawn(worker_loop(
                format!("worker-{index}"),
                p.queue.clone(),
                Arc::clone(&p.provider),
                p.store.clone(),
                p.builder.clone(),
                p.config.lease_ttl,
                shutdown_rx.clone(),
            )));
        }

        // Reaper des baux expirés
        tasks.push(tokio::spawn(reaper_loop(
            p.queue.clone(),
            p.config.reaper_interval,
            shutdown_rx.clone(),
        )));

        // Moniteur de santé
        tasks.push(tokio::spawn(health_loop(
            p.monitor.clone(),
            p.config.health_interval,
            shutdown_rx.clone(),
        )));

        // Élagage quotidien des ticks
        tasks.push(tokio::spawn(prune_loop(
            p.store.clone(),
            p.config.tick_retention_days,
            shutdown_rx,
        )));

        info!(
            workers = p.config.worker_count,
            instruments = p.config.primary_symbols.len(),
            "moteur démarré"
        );

        EngineHandle { shutdown_tx, tasks }
    }
}

/// Handle d'arrêt du moteur
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Arrêt en deux phases: signal, drainage jusqu'au délai de grâce,
    /// puis annulation des tâches restantes
    pub async fn shutdown(self, grace: Duration) {
        info!("arrêt demandé, drainage des boucles");
        let _ = self.shutdown_tx.send(true);

        let abort_handles: Vec<_> = self.tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(grace, join_all(self.tasks)).await.is_err() {
            warn!("délai de grâce dépassé, annulation des tâches restantes");
            for handle in abort_handles {
                handle.abort();
            }
        }

        info!("moteur arrêté");
    }
}

// ----------------------------------------------------------------------
// Boucles périodiques
// ----------------------------------------------------------------------

async fn sweep_loop(
    detector: GapDetector,
    queue: BackfillQueue,
    symbols: Vec<String>,
    every: Duration,
    window: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(every);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = timer.tick() => {
                for symbol in &symbols {
                    if let Err(e) = sweep_symbol(&detector, &queue, symbol, window).await {
                        warn!(symbol, error = %e, "balayage d'intégrité");
                    }
                }
            }
        }
    }
}

/// Balaye la fenêtre récente d'un instrument et enfile les gaps trouvés
async fn sweep_symbol(
    detector: &GapDetector,
    queue: &BackfillQueue,
    symbol: &str,
    window: Duration,
) -> Result<()> {
    let to = now_ms();
    let from = to - window.as_millis() as i64;

    let owned = symbol.to_string();
    let gaps = detector
        .with(move |d| d.detect_gaps(&owned, Timeframe::M1, from, to))
        .await?;

    if gaps.is_empty() {
        return Ok(());
    }

    info!(symbol, gaps = gaps.len(), "gaps détectés au balayage");
    for gap in gaps {
        queue
            .with(move |q| {
                q.enqueue(
                    &gap.symbol,
                    gap.timeframe,
                    gap.start,
                    gap.end,
                    priority::SWEEP,
                )
            })
            .await?;
    }

    Ok(())
}

async fn deep_check_loop(
    detector: GapDetector,
    queue: BackfillQueue,
    symbols: Vec<String>,
    every: Duration,
    days: i64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(every);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = timer.tick() => {
                for symbol in &symbols {
                    for tf in Timeframe::ALL {
                        if let Err(e) = deep_check_symbol(&detector, &queue, symbol, tf, days).await {
                            warn!(symbol, timeframe = %tf, error = %e, "contrôle d'intégrité profond");
                        }
                    }
                }
            }
        }
    }
}

/// Contrôle profond d'un (instrument, timeframe) et mise en file des gaps
async fn deep_check_symbol(
    detector: &GapDetector,
    queue: &BackfillQueue,
    symbol: &str,
    tf: Timeframe,
    days: i64,
) -> Result<()> {
    let owned = symbol.to_string();
    let report = detector
        .with(move |d| d.full_integrity_check(&owned, tf, days))
        .await?;

    if !report.healthy() {
        info!(
            symbol,
            timeframe = %tf,
            gaps = report.gaps.len(),
            degenerate = report.degenerate.len(),
            coverage = report.coverage,
            "intégrité dégradée"
        );
    }

    for gap in report.gaps {
        queue
            .with(move |q| {
                q.enqueue(
                    &gap.symbol,
                    gap.timeframe,
                    gap.start,
                    gap.end,
                    priority::DEEP_SCAN,
                )
            })
            .await?;
    }

    Ok(())
}

async fn worker_loop(
    worker_id: String,
    queue: BackfillQueue,
    provider: Arc<ProviderClient>,
    store: Store,
    builder: CandleBuilder,
    lease_ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let idle = Duration::from_secs(1);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let id = worker_id.clone();
        let ttl = lease_ttl.as_millis() as i64;
        match queue.with(move |q| q.lease_next(&id, ttl)).await {
            Ok(Some(job)) => {
                process_job(&job, &provider, &store, &builder, &queue).await;
            }
            Ok(None) => {
                // File vide: attendre sans rater le signal d'arrêt
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(idle) => {}
                }
            }
            Err(e) => {
                warn!(worker = %worker_id, error = %e, "leasing impossible");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        }
    }

    debug!(worker = %worker_id, "worker arrêté");
}

/// Traite un job loué: fetch, écriture, reconstruction des timeframes
/// supérieurs, puis transition du job
pub async fn process_job(
    job: &BackfillJob,
    provider: &ProviderClient,
    store: &Store,
    builder: &CandleBuilder,
    queue: &BackfillQueue,
) {
    debug!(
        job = job.id,
        symbol = %job.symbol,
        timeframe = %job.timeframe,
        attempts = job.attempts,
        "backfill en cours"
    );

    let fetched = provider
        .fetch(&job.symbol, job.timeframe, job.gap_start, job.gap_end)
        .await;

    let candles = match fetched {
        Ok(candles) => candles,
        Err(e) if e.is_transient() => {
            warn!(job = job.id, error = %e, "échec transitoire, job re-filé");
            let (id, message) = (job.id, e.to_string());
            if let Err(e) = queue.with(move |q| q.fail(id, &message)).await {
                warn!(job = id, error = %e, "transition du job impossible");
            }
            return;
        }
        Err(e) => {
            warn!(job = job.id, error = %e, "échec permanent, job abandonné");
            let (id, message) = (job.id, e.to_string());
            if let Err(e) = queue.with(move |q| q.fail_permanent(id, &message)).await {
                warn!(job = id, error = %e, "transition du job impossible");
            }
            return;
        }
    };

    let written: Result<usize> = async {
        let (symbol, tf) = (job.symbol.clone(), job.timeframe);
        let count = store
            .with(move |s| s.upsert_candles(&symbol, tf, &candles))
            .await?;

        // Reconstruire tous les timeframes strictement supérieurs au
        // timeframe récupéré, sur la plage affectée
        let (symbol, from, to) = (job.symbol.clone(), job.gap_start, job.gap_end);
        builder
            .with(move |b| b.rebuild_above(&symbol, tf, from, to))
            .await?;

        Ok(count)
    }
    .await;

    match written {
        Ok(count) => {
            info!(job = job.id, symbol = %job.symbol, candles = count, "backfill terminé");
            let id = job.id;
            if let Err(e) = queue.with(move |q| q.complete(id)).await {
                warn!(job = id, error = %e, "transition du job impossible");
            }
        }
        Err(e) => {
            // Échec magasin: récupérable, on repasse par la file
            warn!(job = job.id, error = %e, "écriture du backfill échouée");
            let (id, message) = (job.id, e.to_string());
            if let Err(e) = queue.with(move |q| q.fail(id, &message)).await {
                warn!(job = id, error = %e, "transition du job impossible");
            }
        }
    }
}

/// Draine la file jusqu'à épuisement des jobs prêts (commandes opérateur)
///
/// RETOUR: nombre de jobs traités
pub async fn drain_pending(pipeline: &Pipeline, worker_id: &str) -> Result<usize> {
    let mut processed = 0usize;

    loop {
        let id = worker_id.to_string();
        let ttl = pipeline.config.lease_ttl.as_millis() as i64;
        let Some(job) = pipeline.queue.with(move |q| q.lease_next(&id, ttl)).await? else {
            break;
        };

        process_job(
            &job,
            &pipeline.provider,
            &pipeline.store,
            &pipeline.builder,
            &pipeline.queue,
        )
        .await;
        processed += 1;
    }

    Ok(processed)
}

async fn reaper_loop(queue: BackfillQueue, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut timer = tokio::time::interval(every);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = timer.tick() => {
                match queue.with(|q| q.reap()).await {
                    Ok(0) => {}
                    Ok(reclaimed) => info!(reclaimed, "baux expirés récupérés"),
                    Err(e) => warn!(error = %e, "reaper"),
                }
            }
        }
    }
}

async fn health_loop(monitor: HealthMonitor, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut timer = tokio::time::interval(every);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = timer.tick() => {
                match monitor.with(|m| m.snapshot()).await {
                    Ok(snapshot) => {
                        debug!(
                            instruments = snapshot.instruments.len(),
                            pending = snapshot.queue.pending,
                            alerts = snapshot.alerts.len(),
                            "instantané de santé"
                        );
                        // L'échec d'écriture des métriques n'est pas fatal
                        if let Err(e) = monitor.with(move |m| m.record(&snapshot)).await {
                            warn!(error = %e, "écriture des métriques de santé");
                        }
                    }
                    Err(e) => warn!(error = %e, "instantané de santé"),
                }
            }
        }
    }
}

async fn prune_loop(store: Store, retention_days: i64, mut shutdown: watch::Receiver<bool>) {
    let mut timer = tokio::time::interval(Duration::from_secs(86_400));
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = timer.tick() => {
                let cutoff = now_ms() - retention_days * 86_400_000;
                match store.with(move |s| s.prune_ticks(cutoff)).await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "ticks élagués (rétention)"),
                    Err(e) => warn!(error = %e, "élagage des ticks"),
                }
            }
        }
    }
}
