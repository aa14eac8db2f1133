/// Module du limiteur de débit vers le fournisseur historique
///
/// Un seul seau de jetons pour tout le processus: tous les workers le
/// partagent, le fournisseur ne voit jamais plus que le débit configuré.
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Débit par défaut vers le fournisseur: 40 requêtes/minute, rafale de 5
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 40;
pub const DEFAULT_BURST: u32 = 5;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Seau de jetons partagé (Send + Sync, à envelopper dans un Arc)
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_per_sec: f64,
}

impl TokenBucket {
    pub fn new(requests_per_minute: u32, burst: u32) -> Self {
        TokenBucket {
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
            capacity: burst as f64,
            refill_per_sec: requests_per_minute as f64 / 60.0,
        }
    }

    /// Recharge le seau au prorata du temps écoulé
    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    /// Tente de prendre un jeton sans attendre
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Prend un jeton, en dormant le temps qu'il manque
    ///
    /// Point de suspension annulable: l'attente se fait dans tokio::sleep,
    /// l'abandon de la tâche n'entame pas le seau.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                // Temps nécessaire pour régénérer le jeton manquant
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}
