/// Outil opérateur du pipeline de données de marché FX/métaux
///
/// Sous-commandes:
/// - run: démarre le moteur complet (ingestion, balayages, workers, santé)
/// - rebuild: reconstruit les bougies d'une plage
/// - backfill: enfile puis exécute un backfill
/// - verify: contrôle d'intégrité complet
/// - gaps: scan des gaps, avec mise en file optionnelle (--fix)
/// - health: instantané de santé courant
/// - fix-incomplete: réparation des bougies dégénérées
///
/// Codes de sortie: 0 succès, 1 erreur irrécupérable, 2 problèmes
/// d'intégrité détectés sans --fix
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fx_candles_pipeline::config::{Config, DEFAULT_PRIMARY_SYMBOLS};
use fx_candles_pipeline::engine::{Engine, Pipeline, drain_pending};
use fx_candles_pipeline::gap_detector::IntegrityReport;
use fx_candles_pipeline::models::{Gap, Instrument};
use fx_candles_pipeline::queue::priority;
use fx_candles_pipeline::timeframe::Timeframe;
use fx_candles_pipeline::utils::{format_timestamp_ms, now_ms, parse_utc_datetime};

#[derive(Parser, Debug)]
#[command(author, version, about = "Pipeline auto-réparateur de bougies FX/métaux")]
struct Cli {
    /// Fichier de base SQLite
    #[arg(long, env = "FX_DATABASE_PATH", default_value = "market_data.db", global = true)]
    database: String,

    /// URL de base du fournisseur historique
    #[arg(
        long,
        env = "FX_PROVIDER_URL",
        default_value = "http://127.0.0.1:9000/udf",
        global = true
    )]
    provider_url: String,

    /// Jeton d'API du fournisseur
    #[arg(long, env = "FX_PROVIDER_TOKEN", global = true)]
    provider_token: Option<String>,

    /// Nombre de workers de backfill
    #[arg(long, env = "FX_WORKER_COUNT", default_value_t = 2, global = true)]
    workers: usize,

    /// Port du serveur de santé
    #[arg(long, env = "FX_HEALTH_PORT", default_value_t = 8080, global = true)]
    health_port: u16,

    /// Instruments primaires (séparés par des virgules)
    #[arg(long, env = "FX_PRIMARY_SYMBOLS", value_delimiter = ',', global = true)]
    symbols: Option<Vec<String>>,

    /// Rétention des ticks bruts, en jours
    #[arg(long, env = "FX_TICK_RETENTION_DAYS", default_value_t = 7, global = true)]
    tick_retention_days: i64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Démarre le moteur complet
    Run,

    /// Reconstruit les bougies d'une plage
    Rebuild {
        symbol: String,
        /// Timeframe à reconstruire (tous par défaut)
        #[arg(long)]
        timeframe: Option<String>,
        /// Début de plage (YYYY-MM-DD [HH:MM[:SS]])
        #[arg(long)]
        from: String,
        /// Fin de plage (YYYY-MM-DD [HH:MM[:SS]])
        #[arg(long)]
        to: String,
    },

    /// Enfile puis exécute un backfill sur les N derniers jours
    Backfill {
        symbol: String,
        #[arg(long)]
        days: i64,
        /// Timeframe à remplir (M1 par défaut)
        #[arg(long)]
        timeframe: Option<String>,
        /// Reconstruit d'abord M1 depuis les ticks archivés
        #[arg(long)]
        ticks: bool,
    },

    /// Contrôle d'intégrité complet sur les N derniers jours
    Verify {
        symbol: String,
        #[arg(long)]
        timeframe: Option<String>,
        #[arg(long, default_value_t = 7)]
        days: i64,
    },

    /// Scan des gaps M1 sur les N derniers jours
    Gaps {
        /// Limiter aux instruments primaires
        #[arg(long)]
        primary: bool,
        #[arg(long, default_value_t = 1)]
        days: i64,
        /// Enfiler et exécuter les backfills correctifs
        #[arg(long)]
        fix: bool,
    },

    /// Affiche l'instantané de santé courant
    Health,

    /// Répare les bougies dégénérées (OHLC identiques) d'un instrument
    FixIncomplete {
        symbol: String,
        #[arg(long, default_value_t = 1)]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ Erreur fatale: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn config_from(cli: &Cli) -> Config {
    let mut config = Config::default();
    config.database_path = cli.database.clone();
    config.provider_url = cli.provider_url.clone();
    config.provider_token = cli.provider_token.clone();
    config.worker_count = cli.workers;
    config.health_port = cli.health_port;
    config.tick_retention_days = cli.tick_retention_days;
    if let Some(symbols) = &cli.symbols {
        config.primary_symbols = symbols.iter().map(|s| s.to_uppercase()).collect();
    }
    config
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = config_from(&cli);
    let pipeline = Pipeline::build(config)?;

    match cli.command {
        Command::Run => run_engine(pipeline).await,
        Command::Rebuild {
            symbol,
            timeframe,
            from,
            to,
        } => rebuild(pipeline, &symbol, timeframe.as_deref(), &from, &to),
        Command::Backfill {
            symbol,
            days,
            timeframe,
            ticks,
        } => backfill(pipeline, &symbol, days, timeframe.as_deref(), ticks).await,
        Command::Verify {
            symbol,
            timeframe,
            days,
        } => verify(pipeline, &symbol, timeframe.as_deref(), days),
        Command::Gaps { primary, days, fix } => gaps(pipeline, primary, days, fix).await,
        Command::Health => health(pipeline),
        Command::FixIncomplete { symbol, days } => fix_incomplete(pipeline, &symbol, days).await,
    }
}

/// Démarre le moteur et attend le signal d'arrêt
async fn run_engine(pipeline: Pipeline) -> Result<ExitCode> {
    let grace = pipeline.config.shutdown_grace;
    println!(
        "🚀 Moteur démarré ({} instruments, {} workers)",
        pipeline.config.primary_symbols.len(),
        pipeline.config.worker_count
    );

    let engine = Engine::new(pipeline);
    let handle = engine.start();

    tokio::signal::ctrl_c().await?;
    println!("\n🛑 Arrêt demandé...");
    handle.shutdown(grace).await;
    println!("✅ Arrêt propre");

    Ok(ExitCode::SUCCESS)
}

/// Reconstruit les bougies d'une plage depuis leurs sources
fn rebuild(
    pipeline: Pipeline,
    symbol: &str,
    timeframe: Option<&str>,
    from: &str,
    to: &str,
) -> Result<ExitCode> {
    let symbol = symbol.to_uppercase();
    let from_ms = parse_utc_datetime(from)?;
    let to_ms = parse_utc_datetime(to)?;

    println!(
        "🔄 Reconstruction {} de {} à {}",
        symbol,
        format_timestamp_ms(from_ms),
        format_timestamp_ms(to_ms)
    );

    let timeframes: Vec<Timeframe> = match timeframe {
        Some(tf) => vec![Timeframe::parse(tf)?],
        None => Timeframe::ALL.to_vec(),
    };

    for tf in timeframes {
        let written = pipeline.builder.rebuild_range(&symbol, tf, from_ms, to_ms)?;
        println!("  ✓ {} : {} bougies reconstruites", tf, written);
    }

    Ok(ExitCode::SUCCESS)
}

/// Enfile un backfill sur les N derniers jours puis draine la file
async fn backfill(
    pipeline: Pipeline,
    symbol: &str,
    days: i64,
    timeframe: Option<&str>,
    ticks: bool,
) -> Result<ExitCode> {
    let symbol = symbol.to_uppercase();
    let tf = match timeframe {
        Some(tf) => Timeframe::parse(tf)?,
        None => Timeframe::M1,
    };
    let to = now_ms();
    let from = tf.align_ms(to - days * 86_400_000);

    println!("🔄 Backfill {} {} sur {} jours", symbol, tf, days);

    if ticks {
        let written = pipeline.builder.build_m1_from_ticks(&symbol, from, to)?;
        println!("  ✓ {} bougies M1 reconstruites depuis les ticks archivés", written);
    }

    pipeline
        .queue
        .enqueue(&symbol, tf, from, to, priority::MANUAL)?;
    let processed = drain_pending(&pipeline, "cli-backfill").await?;

    let counts = pipeline.queue.status_counts()?;
    println!(
        "✅ {} jobs traités ({} pending, {} failed)",
        processed, counts.pending, counts.failed
    );

    Ok(ExitCode::SUCCESS)
}

/// Affiche un rapport d'intégrité, à la manière d'un audit d'espacement
fn print_report(report: &IntegrityReport) {
    println!(
        "\n=== Intégrité {}/{} du {} au {} ===",
        report.symbol,
        report.timeframe,
        format_timestamp_ms(report.from),
        format_timestamp_ms(report.to)
    );
    println!(
        "Bougies: {} présentes / {} attendues (couverture {:.1}%)",
        report.actual_candles,
        report.expected_candles,
        report.coverage * 100.0
    );

    if report.gaps.is_empty() {
        println!("✓ Aucun gap détecté");
    } else {
        println!("--- GAPS DÉTECTÉS ({}) ---", report.gaps.len());
        for (i, gap) in report.gaps.iter().enumerate() {
            if i >= 10 {
                println!("  ... et {} autres gaps", report.gaps.len() - 10);
                break;
            }
            println!(
                "  {} de {} à {} ({} bougies manquantes)",
                gap.kind.as_str(),
                format_timestamp_ms(gap.start),
                format_timestamp_ms(gap.end),
                gap.missing_candles()
            );
        }
    }

    if report.degenerate.is_empty() {
        println!("✓ Aucune bougie dégénérée");
    } else {
        println!("⚠ {} bougies dégénérées (OHLC identiques)", report.degenerate.len());
    }
}

/// Contrôle d'intégrité complet, code 2 si l'instrument n'est pas sain
fn verify(
    pipeline: Pipeline,
    symbol: &str,
    timeframe: Option<&str>,
    days: i64,
) -> Result<ExitCode> {
    let instrument = Instrument::new(symbol);
    let symbol = instrument.symbol.clone();
    println!("🔍 Vérification de {} ({})", symbol, instrument.class.as_str());

    let timeframes: Vec<Timeframe> = match timeframe {
        Some(tf) => vec![Timeframe::parse(tf)?],
        None => Timeframe::ALL.to_vec(),
    };

    let mut healthy = true;
    for tf in timeframes {
        let report = pipeline.detector.full_integrity_check(&symbol, tf, days)?;
        print_report(&report);
        healthy &= report.healthy();
    }

    if healthy {
        println!("\n✅ {} sain", symbol);
        Ok(ExitCode::SUCCESS)
    } else {
        println!("\n⚠ {} présente des problèmes d'intégrité", symbol);
        Ok(ExitCode::from(2))
    }
}

/// Scan des gaps M1, mise en file optionnelle des correctifs
async fn gaps(pipeline: Pipeline, primary: bool, days: i64, fix: bool) -> Result<ExitCode> {
    let symbols: Vec<String> = if primary {
        pipeline.config.primary_symbols.clone()
    } else {
        let stored = pipeline.store.distinct_symbols()?;
        if stored.is_empty() {
            DEFAULT_PRIMARY_SYMBOLS.iter().map(|s| s.to_string()).collect()
        } else {
            stored
        }
    };

    let to = now_ms();
    let from = to - days * 86_400_000;
    let mut found: Vec<Gap> = Vec::new();

    for symbol in &symbols {
        let gaps = pipeline
            .detector
            .detect_gaps(symbol, Timeframe::M1, from, to)?;
        if !gaps.is_empty() {
            println!("⚠ {} : {} gaps", symbol, gaps.len());
            for gap in &gaps {
                println!(
                    "    {} de {} à {} ({} bougies)",
                    gap.kind.as_str(),
                    format_timestamp_ms(gap.start),
                    format_timestamp_ms(gap.end),
                    gap.missing_candles()
                );
            }
            found.extend(gaps);
        }
    }

    if found.is_empty() {
        println!("✅ Aucun gap sur les {} derniers jours", days);
        return Ok(ExitCode::SUCCESS);
    }

    if !fix {
        println!("\n⚠ {} gaps détectés (relancer avec --fix pour corriger)", found.len());
        return Ok(ExitCode::from(2));
    }

    for gap in &found {
        pipeline.queue.enqueue(
            &gap.symbol,
            gap.timeframe,
            gap.start,
            gap.end,
            priority::MANUAL,
        )?;
    }
    let processed = drain_pending(&pipeline, "cli-gaps").await?;
    println!("✅ {} jobs de correction traités", processed);

    Ok(ExitCode::SUCCESS)
}

/// Affiche l'instantané de santé courant
fn health(pipeline: Pipeline) -> Result<ExitCode> {
    let snapshot = pipeline.monitor.snapshot()?;

    println!("=== Santé du pipeline ({}) ===", format_timestamp_ms(snapshot.generated_at));
    println!("Latence magasin: {:.1} ms", snapshot.store_latency_ms);
    println!(
        "File: {} pending, {} processing, {} completed, {} failed",
        snapshot.queue.pending,
        snapshot.queue.processing,
        snapshot.queue.completed,
        snapshot.queue.failed
    );

    for instrument in &snapshot.instruments {
        let age = instrument
            .data_age_secs
            .map(|a| format!("{} s", a))
            .unwrap_or_else(|| "aucune donnée".to_string());
        println!(
            "  {} | M1 vieille de {} | {:.1} ticks/min | {} gaps 24h | {:.1}% dégénérées",
            instrument.symbol,
            age,
            instrument.tick_rate_per_min,
            instrument.gaps_24h,
            instrument.degenerate_percent_24h
        );
    }

    if snapshot.alerts.is_empty() {
        println!("✅ Aucune alerte");
    } else {
        println!("⚠ Alertes:");
        for alert in &snapshot.alerts {
            println!("  - {}", alert);
        }
    }

    let failures = pipeline.queue.recent_failures(5)?;
    if !failures.is_empty() {
        println!("Derniers jobs en échec:");
        for job in failures {
            println!(
                "  #{} {} {} de {} à {} ({})",
                job.id,
                job.symbol,
                job.timeframe,
                format_timestamp_ms(job.gap_start),
                format_timestamp_ms(job.gap_end),
                job.error_message.unwrap_or_default()
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Répare les bougies dégénérées en les re-téléchargeant
async fn fix_incomplete(pipeline: Pipeline, symbol: &str, days: i64) -> Result<ExitCode> {
    let symbol = symbol.to_uppercase();
    let to = now_ms();
    let from = to - days * 86_400_000;

    println!("🔧 Réparation des bougies dégénérées de {}", symbol);

    let mut enqueued = 0usize;
    for tf in Timeframe::ALL {
        let degenerate = pipeline.store.find_degenerate(&symbol, tf, from, to)?;
        let Some(first) = degenerate.first() else {
            continue;
        };
        let last = degenerate.last().unwrap_or(first);

        // Une seule fenêtre couvrant toutes les bougies suspectes du timeframe
        let window_start = first.timestamp;
        let window_end = last.timestamp + tf.duration_ms();
        println!(
            "  ⚠ {} : {} bougies dégénérées de {} à {}",
            tf,
            degenerate.len(),
            format_timestamp_ms(window_start),
            format_timestamp_ms(window_end)
        );

        pipeline
            .queue
            .enqueue(&symbol, tf, window_start, window_end, priority::MANUAL)?;
        enqueued += 1;
    }

    if enqueued == 0 {
        println!("✅ Aucune bougie dégénérée sur {} jours", days);
        return Ok(ExitCode::SUCCESS);
    }

    let processed = drain_pending(&pipeline, "cli-fix").await?;

    // Contrôle après réparation
    let remaining: usize = Timeframe::ALL
        .into_iter()
        .map(|tf| {
            pipeline
                .store
                .find_degenerate(&symbol, tf, from, to)
                .map(|v| v.len())
                .unwrap_or(0)
        })
        .sum();

    println!(
        "✅ {} jobs traités, {} bougies dégénérées restantes",
        processed, remaining
    );

    Ok(ExitCode::SUCCESS)
}
