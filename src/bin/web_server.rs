/// Serveur HTTP opérateur: santé du pipeline et lecture des bougies
///
/// ARCHITECTURE:
/// - API REST avec actix-web, CORS permissif
/// - Endpoints:
///   - GET /health → instantané de santé (JSON)
///   - GET /api/symbols → symboles présents dans le magasin
///   - GET /api/candles?symbol=X&timeframe=M5&from=...&to=...&limit=1000
/// - Cache moka sur les requêtes de bougies
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, Responder, get, web};
use clap::Parser;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use fx_candles_pipeline::calendar::MarketCalendar;
use fx_candles_pipeline::config::DEFAULT_PRIMARY_SYMBOLS;
use fx_candles_pipeline::gap_detector::GapDetector;
use fx_candles_pipeline::health::{AlertThresholds, HealthMonitor};
use fx_candles_pipeline::queue::BackfillQueue;
use fx_candles_pipeline::store::Store;
use fx_candles_pipeline::timeframe::Timeframe;

#[derive(Parser, Debug)]
#[command(author, version, about = "Serveur de santé du pipeline de bougies")]
struct Args {
    /// Fichier de base SQLite
    #[arg(long, env = "FX_DATABASE_PATH", default_value = "market_data.db")]
    database: String,

    /// Port d'écoute
    #[arg(long, env = "FX_HEALTH_PORT", default_value_t = 8080)]
    port: u16,

    /// Instruments suivis par le moniteur de santé
    #[arg(long, env = "FX_PRIMARY_SYMBOLS", value_delimiter = ',')]
    symbols: Option<Vec<String>>,
}

/// Clé de cache pour les requêtes de bougies
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct CacheKey {
    symbol: String,
    timeframe: Timeframe,
    from: Option<i64>,
    to: Option<i64>,
    limit: usize,
}

/// Bougie au format API (timestamps en secondes)
#[derive(Debug, Clone, Serialize)]
struct ApiCandle {
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// État partagé de l'application
struct AppState {
    store: Store,
    monitor: HealthMonitor,
    candles_cache: Cache<CacheKey, Arc<Vec<ApiCandle>>>,
}

/// Paramètres de requête pour les bougies
#[derive(Debug, Deserialize)]
struct CandlesQuery {
    symbol: String,
    timeframe: String,
    /// Bornes en secondes epoch
    from: Option<i64>,
    to: Option<i64>,
    limit: Option<usize>,
}

/// GET /health - instantané de santé courant
#[get("/health")]
async fn get_health(data: web::Data<AppState>) -> impl Responder {
    let monitor = data.monitor.clone();

    let result = web::block(move || monitor.snapshot()).await;
    match result {
        Ok(Ok(snapshot)) => HttpResponse::Ok().json(snapshot),
        Ok(Err(e)) => HttpResponse::InternalServerError()
            .json(serde_json::json!({ "error": e.to_string() })),
        Err(e) => HttpResponse::InternalServerError()
            .json(serde_json::json!({ "error": format!("Blocking error: {e}") })),
    }
}

/// GET /api/symbols - symboles présents dans le magasin
#[get("/api/symbols")]
async fn get_symbols(data: web::Data<AppState>) -> impl Responder {
    let store = data.store.clone();

    let result = web::block(move || store.distinct_symbols()).await;
    match result {
        Ok(Ok(symbols)) => HttpResponse::Ok().json(symbols),
        Ok(Err(e)) => HttpResponse::InternalServerError()
            .json(serde_json::json!({ "error": e.to_string() })),
        Err(e) => HttpResponse::InternalServerError()
            .json(serde_json::json!({ "error": format!("Blocking error: {e}") })),
    }
}

/// GET /api/candles - bougies d'une paire/timeframe
#[get("/api/candles")]
async fn get_candles(
    data: web::Data<AppState>,
    query: web::Query<CandlesQuery>,
) -> impl Responder {
    let timeframe = match Timeframe::parse(&query.timeframe) {
        Ok(tf) => tf,
        Err(e) => {
            return HttpResponse::BadRequest().json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    let key = CacheKey {
        symbol: query.symbol.to_uppercase(),
        timeframe,
        from: query.from,
        to: query.to,
        limit: query.limit.unwrap_or(2_000),
    };

    // Vérifier le cache d'abord
    if let Some(cached) = data.candles_cache.get(&key).await {
        return HttpResponse::Ok()
            .insert_header(("X-Cache", "HIT"))
            .json(cached.as_ref());
    }

    let store = data.store.clone();
    let lookup = key.clone();
    let result = web::block(move || {
        let from_ms = lookup.from.map(|s| s * 1_000).unwrap_or(0);
        let to_ms = lookup.to.map(|s| s * 1_000).unwrap_or(i64::MAX);

        let candles = store.read_range(&lookup.symbol, lookup.timeframe, from_ms, to_ms)?;
        let api_candles: Vec<ApiCandle> = candles
            .into_iter()
            .take(lookup.limit)
            .map(|c| ApiCandle {
                time: c.timestamp / 1_000,
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
                volume: c.volume,
            })
            .collect();
        Ok::<Vec<ApiCandle>, anyhow::Error>(api_candles)
    })
    .await;

    match result {
        Ok(Ok(candles)) => {
            let shared = Arc::new(candles);
            data.candles_cache.insert(key, Arc::clone(&shared)).await;
            HttpResponse::Ok()
                .insert_header(("X-Cache", "MISS"))
                .json(shared.as_ref())
        }
        Ok(Err(e)) => HttpResponse::InternalServerError()
            .json(serde_json::json!({ "error": e.to_string() })),
        Err(e) => HttpResponse::InternalServerError()
            .json(serde_json::json!({ "error": format!("Blocking error: {e}") })),
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let symbols = args.symbols.unwrap_or_else(|| {
        DEFAULT_PRIMARY_SYMBOLS.iter().map(|s| s.to_string()).collect()
    });

    let store = Store::open(&args.database).map_err(std::io::Error::other)?;
    let queue = BackfillQueue::new(&store);
    let detector = GapDetector::new(store.clone(), MarketCalendar::new());
    let monitor = HealthMonitor::new(
        store.clone(),
        queue,
        detector,
        AlertThresholds::default(),
        symbols,
    );

    let state = web::Data::new(AppState {
        store,
        monitor,
        candles_cache: Cache::builder()
            .max_capacity(1_000)
            .time_to_live(std::time::Duration::from_secs(30))
            .build(),
    });

    println!("🌐 Serveur de santé sur http://0.0.0.0:{}", args.port);

    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(state.clone())
            .service(get_health)
            .service(get_symbols)
            .service(get_candles)
    })
    .bind(("0.0.0.0", args.port))?
    .run()
    .await
}
