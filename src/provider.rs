/// Module du client du fournisseur historique
///
/// Le fournisseur expose un endpoint OHLCV au format tableaux parallèles:
/// `{"status": "ok", "t": [...], "o": [...], "h": [...], "l": [...],
/// "c": [...], "v": [...]}` avec les timestamps en secondes epoch. Les
/// réponses `no_data` (ou vides) sont normales et donnent un lot vide.
///
/// Classement des échecs:
/// - 429, 5xx, timeout, connexion coupée → Transient (re-filé avec backoff)
/// - autres 4xx, corps incohérent → Permanent (job marqué failed)
///
/// Les bougies retournées sont validées une à une: une bougie invalide est
/// écartée et journalisée, le lot continue.
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::PipelineError;
use crate::models::Candle;
use crate::rate_limit::TokenBucket;
use crate::timeframe::Timeframe;

/// Timeout d'une requête fournisseur
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(15);

/// Réponse OHLCV en tableaux parallèles
///
/// `v` (volumes) et `s` (spreads) peuvent manquer selon le fournisseur.
#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(alias = "s")]
    status: String,
    #[serde(default)]
    t: Vec<i64>,
    #[serde(default)]
    o: Vec<f64>,
    #[serde(default)]
    h: Vec<f64>,
    #[serde(default)]
    l: Vec<f64>,
    #[serde(default)]
    c: Vec<f64>,
    #[serde(default)]
    v: Vec<f64>,
}

/// Client HTTP du fournisseur historique
///
/// Le limiteur de débit est partagé processus-entier: chaque `fetch`
/// consomme un jeton avant de toucher le réseau.
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    limiter: Arc<TokenBucket>,
}

impl ProviderClient {
    pub fn new(
        base_url: impl Into<String>,
        api_token: Option<String>,
        limiter: Arc<TokenBucket>,
    ) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::Permanent(format!("construction du client HTTP: {e}")))?;

        Ok(ProviderClient {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
            limiter,
        })
    }

    /// Récupère les bougies de [from, to) pour un (symbol, timeframe)
    ///
    /// RETOUR: bougies alignées sur le timeframe, potentiellement moins que
    /// le nombre attendu quand le fournisseur a lui-même des trous
    pub async fn fetch(
        &self,
        symbol: &str,
        tf: Timeframe,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Candle>, PipelineError> {
        self.limiter.acquire().await;

        let url = format!("{}/history", self.base_url);
        let from_epoch = (from_ms / 1_000).to_string();
        let to_epoch = (to_ms / 1_000).to_string();

        let mut request = self.http.get(&url).query(&[
            ("symbol", symbol),
            ("resolution", tf.resolution()),
            ("from", from_epoch.as_str()),
            ("to", to_epoch.as_str()),
        ]);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify_transport_error)?;
        let status = response.status();

        if !status.is_success() {
            let message = format!("fournisseur HTTP {} pour {}/{}", status.as_u16(), symbol, tf);
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(PipelineError::Transient(message))
            } else {
                Err(PipelineError::Permanent(message))
            };
        }

        let body: HistoryResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Permanent(format!("corps de réponse illisible: {e}")))?;

        self.candles_from_response(symbol, tf, body)
    }

    /// Convertit les tableaux parallèles en bougies validées
    fn candles_from_response(
        &self,
        symbol: &str,
        tf: Timeframe,
        body: HistoryResponse,
    ) -> Result<Vec<Candle>, PipelineError> {
        if body.status == "no_data" || body.t.is_empty() {
            return Ok(Vec::new());
        }
        if body.status != "ok" {
            return Err(PipelineError::Permanent(format!(
                "statut fournisseur inattendu: {}",
                body.status
            )));
        }

        let n = body.t.len();
        if body.o.len() != n || body.h.len() != n || body.l.len() != n || body.c.len() != n {
            return Err(PipelineError::Permanent(format!(
                "tableaux parallèles incohérents ({} timestamps, {}/{}/{}/{} prix)",
                n,
                body.o.len(),
                body.h.len(),
                body.l.len(),
                body.c.len()
            )));
        }

        let mut candles = Vec::with_capacity(n);
        for i in 0..n {
            let candle = Candle {
                timestamp: body.t[i] * 1_000,
                open: body.o[i],
                high: body.h[i],
                low: body.l[i],
                close: body.c[i],
                volume: body.v.get(i).copied().unwrap_or(0.0),
                spread: None,
            };

            // Une bougie invalide est écartée, le lot continue
            match candle.validate(tf) {
                Ok(()) => candles.push(candle),
                Err(violation) => {
                    warn!(symbol, %tf, %violation, "bougie fournisseur écartée");
                }
            }
        }

        Ok(candles)
    }
}

/// Classe une erreur de transport reqwest
fn classify_transport_error(error: reqwest::Error) -> PipelineError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        PipelineError::Transient(format!("transport fournisseur: {error}"))
    } else {
        PipelineError::Permanent(format!("transport fournisseur: {error}"))
    }
}
