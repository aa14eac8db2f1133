//! Scénarios de bout en bout: détection d'un gap, backfill auprès d'un
//! fournisseur simulé (avec pannes), reconstruction des timeframes dérivés
//! et réparation des bougies dégénérées.
//!
//! Le fournisseur simulé est un petit serveur TCP local qui rejoue un
//! script de réponses HTTP puis sert la réponse OHLCV nominale.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use fx_candles_pipeline::config::Config;
use fx_candles_pipeline::engine::{Pipeline, drain_pending, process_job};
use fx_candles_pipeline::models::{Candle, JobStatus};
use fx_candles_pipeline::queue::priority;
use fx_candles_pipeline::store::Store;
use fx_candles_pipeline::timeframe::Timeframe;

// 2025-02-12 10:00:00 UTC, un mercredi (marché ouvert)
const WED_10_00_MS: i64 = 1_739_354_400_000;
const MIN_MS: i64 = 60_000;

/// Réponse scriptée du fournisseur simulé
#[derive(Clone)]
struct ScriptedResponse {
    status: u16,
    body: String,
}

fn ok(body: String) -> ScriptedResponse {
    ScriptedResponse { status: 200, body }
}

fn http_error(status: u16) -> ScriptedResponse {
    ScriptedResponse {
        status,
        body: r#"{"error":"simulated"}"#.to_string(),
    }
}

/// Corps UDF (tableaux parallèles) pour `count` bougies M1 depuis `start_ms`
fn udf_body(start_ms: i64, count: usize) -> String {
    let mut t = Vec::new();
    let mut o = Vec::new();
    let mut h = Vec::new();
    let mut l = Vec::new();
    let mut c = Vec::new();
    let mut v = Vec::new();

    for i in 0..count {
        let close = 1.0800 + 0.0001 * i as f64;
        t.push((start_ms / 1_000 + i as i64 * 60).to_string());
        o.push(format!("{:.5}", close - 0.00005));
        h.push(format!("{:.5}", close + 0.00010));
        l.push(format!("{:.5}", close - 0.00010));
        c.push(format!("{:.5}", close));
        v.push("10.0".to_string());
    }

    format!(
        r#"{{"status":"ok","t":[{}],"o":[{}],"h":[{}],"l":[{}],"c":[{}],"v":[{}]}}"#,
        t.join(","),
        o.join(","),
        h.join(","),
        l.join(","),
        c.join(","),
        v.join(",")
    )
}

/// Démarre le fournisseur simulé
///
/// Les réponses du script sont servies dans l'ordre; une fois le script
/// épuisé, chaque requête reçoit `fallback`.
async fn spawn_provider(
    script: Vec<ScriptedResponse>,
    fallback: ScriptedResponse,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let script = Arc::new(Mutex::new(VecDeque::from(script)));

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let next = script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| fallback.clone());

            tokio::spawn(async move {
                // Lire la requête (un GET tient dans un buffer)
                let mut buffer = [0u8; 4_096];
                let _ = socket.read(&mut buffer).await;

                let reason = match next.status {
                    200 => "OK",
                    429 => "Too Many Requests",
                    404 => "Not Found",
                    _ => "Error",
                };
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    next.status,
                    reason,
                    next.body.len(),
                    next.body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    base_url
}

fn pipeline_with(provider_url: String) -> Pipeline {
    let config = Config {
        provider_url,
        primary_symbols: vec!["EURUSD".to_string()],
        // Recharge rapide pour que les tests n'attendent pas le seau
        requests_per_minute: 6_000,
        burst: 10,
        ..Config::default()
    };
    Pipeline::build_with_store(config, Store::open_in_memory().unwrap()).unwrap()
}

/// Gap détecté → job enfilé → backfill → timeframes dérivés reconstruits
#[tokio::test]
async fn gap_is_detected_backfilled_and_aggregated() {
    let gap_start = WED_10_00_MS;
    let gap_end = WED_10_00_MS + 10 * MIN_MS;
    let base_url = spawn_provider(Vec::new(), ok(udf_body(gap_start, 10))).await;
    let pipeline = pipeline_with(base_url);

    // Plage vide: le détecteur doit voir un gap total
    let gaps = pipeline
        .detector
        .detect_gaps("EURUSD", Timeframe::M1, gap_start, gap_end)
        .unwrap();
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].missing_candles(), 10);

    for gap in &gaps {
        pipeline
            .queue
            .enqueue(&gap.symbol, gap.timeframe, gap.start, gap.end, priority::SWEEP)
            .unwrap();
    }
    let processed = drain_pending(&pipeline, "test-worker").await.unwrap();
    assert_eq!(processed, 1);

    // Le gap est comblé
    let gaps_after = pipeline
        .detector
        .detect_gaps("EURUSD", Timeframe::M1, gap_start, gap_end)
        .unwrap();
    assert!(gaps_after.is_empty());
    assert_eq!(
        pipeline
            .store
            .candle_count("EURUSD", Timeframe::M1, gap_start, gap_end)
            .unwrap(),
        10
    );

    // Les timeframes supérieurs couvrant la plage ont été reconstruits
    let m5 = pipeline
        .store
        .read_range("EURUSD", Timeframe::M5, gap_start, gap_end)
        .unwrap();
    assert_eq!(m5.len(), 2);
    assert_eq!(m5[0].volume, 50.0);

    let h1 = pipeline
        .store
        .read_range("EURUSD", Timeframe::H1, WED_10_00_MS, WED_10_00_MS + 3_600_000)
        .unwrap();
    assert_eq!(h1.len(), 1);
    assert_eq!(h1[0].volume, 100.0);
}

/// Trois 429 puis succès: le job finit completed avec attempts = 4
#[tokio::test]
async fn transient_failures_retry_through_the_queue() {
    let gap_start = WED_10_00_MS;
    let gap_end = WED_10_00_MS + 5 * MIN_MS;
    let base_url = spawn_provider(
        vec![http_error(429), http_error(429), http_error(429)],
        ok(udf_body(gap_start, 5)),
    )
    .await;
    let pipeline = pipeline_with(base_url);

    let job_id = pipeline
        .queue
        .enqueue("EURUSD", Timeframe::M1, gap_start, gap_end, priority::MANUAL)
        .unwrap();

    // Traiter jusqu'à l'état terminal, en respectant les not_before du backoff
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let job = pipeline.queue.get(job_id).unwrap().unwrap();
        if job.status.is_terminal() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "le job n'a pas atteint un état terminal à temps"
        );

        if let Some(leased) = pipeline
            .queue
            .lease_next("test-worker", 60_000)
            .unwrap()
        {
            process_job(
                &leased,
                &pipeline.provider,
                &pipeline.store,
                &pipeline.builder,
                &pipeline.queue,
            )
            .await;
        } else {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    let job = pipeline.queue.get(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 4);
    assert_eq!(
        pipeline
            .store
            .candle_count("EURUSD", Timeframe::M1, gap_start, gap_end)
            .unwrap(),
        5
    );
}

/// Un 404 marque le job failed sans re-tentative
#[tokio::test]
async fn permanent_failure_marks_job_failed() {
    let base_url = spawn_provider(vec![http_error(404)], http_error(404)).await;
    let pipeline = pipeline_with(base_url);

    let job_id = pipeline
        .queue
        .enqueue(
            "EURUSD",
            Timeframe::M1,
            WED_10_00_MS,
            WED_10_00_MS + 5 * MIN_MS,
            priority::MANUAL,
        )
        .unwrap();

    let processed = drain_pending(&pipeline, "test-worker").await.unwrap();
    assert_eq!(processed, 1);

    let job = pipeline.queue.get(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.error_message.unwrap().contains("404"));
}

/// Bougies dégénérées: le backfill les remplace par des bougies réelles
#[tokio::test]
async fn degenerate_candles_are_repaired_by_backfill() {
    let window_start = WED_10_00_MS;
    let count = 10usize;
    let window_end = window_start + count as i64 * MIN_MS;
    let base_url = spawn_provider(Vec::new(), ok(udf_body(window_start, count))).await;
    let pipeline = pipeline_with(base_url);

    // Dix bougies à OHLC identiques, données suspectes
    for i in 0..count {
        pipeline
            .store
            .upsert_candle(
                "EURUSD",
                Timeframe::M1,
                &Candle {
                    timestamp: window_start + i as i64 * MIN_MS,
                    open: 1.08,
                    high: 1.08,
                    low: 1.08,
                    close: 1.08,
                    volume: 0.0,
                    spread: None,
                },
            )
            .unwrap();
    }
    assert_eq!(
        pipeline
            .store
            .find_degenerate("EURUSD", Timeframe::M1, window_start, window_end)
            .unwrap()
            .len(),
        count
    );

    // Un seul job couvrant l'union des bougies suspectes
    pipeline
        .queue
        .enqueue("EURUSD", Timeframe::M1, window_start, window_end, priority::MANUAL)
        .unwrap();
    let processed = drain_pending(&pipeline, "test-worker").await.unwrap();
    assert_eq!(processed, 1);

    // Les bougies pleinement formées ont remplacé les dégénérées
    let degenerate = pipeline
        .store
        .find_degenerate("EURUSD", Timeframe::M1, window_start, window_end)
        .unwrap();
    assert!(degenerate.is_empty());

    let repaired = pipeline
        .store
        .read_range("EURUSD", Timeframe::M1, window_start, window_end)
        .unwrap();
    assert_eq!(repaired.len(), count);
    assert!(repaired.iter().all(|c| c.volume > 0.0));
}
