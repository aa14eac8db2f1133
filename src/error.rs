/// Module de taxonomie des erreurs du pipeline
///
/// Quatre familles seulement:
/// - Transient: l'amont a échoué de façon récupérable (429, 5xx, timeout),
///   le job repart en file avec backoff
/// - Permanent: l'amont a refusé ou répondu n'importe quoi, le job est
///   marqué failed avec le message conservé
/// - InvariantViolation: une bougie invalide est écartée, le lot continue
/// - Cancelled: arrêt propre, jamais traité comme une erreur
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Échec transitoire amont (réessayé via la file avec backoff)
    #[error("erreur transitoire: {0}")]
    Transient(String),

    /// Échec permanent amont (le job est marqué failed)
    #[error("erreur permanente: {0}")]
    Permanent(String),

    /// Enregistrement invalide (écarté, le traitement du lot continue)
    #[error("violation d'invariant: {0}")]
    InvariantViolation(String),

    /// Annulation: arrêt propre, pas une erreur
    #[error("opération annulée")]
    Cancelled,
}

impl PipelineError {
    /// Vrai si l'erreur doit repartir en file plutôt que terminer le job
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Transient(_))
    }
}
