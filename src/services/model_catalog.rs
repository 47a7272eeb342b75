//! Model catalog: merged foundation-model and inference-profile listings.
//!
//! Listings are cached per caller (SHA-256 of access key and region) in an
//! immutable map snapshot. A refresh builds a new map and swaps it in, so a
//! concurrent reader sees either the old or the new snapshot, never a mix.

use crate::api::auth::CredentialSet;
use crate::api::models::ModelDescriptor;
use crate::core::error::Result;
use crate::core::metrics::get_metrics;
use crate::core::AppError;
use crate::services::backend::{Backend, FoundationModelSummary, InferenceProfileSummary};
use crate::transformer::provider_namespace;
use arc_swap::ArcSwap;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CatalogEntry {
    models: Arc<Vec<ModelDescriptor>>,
    fetched_at: Instant,
}

pub struct ModelCatalog {
    backend: Arc<dyn Backend>,
    ttl: Duration,
    default_region: String,
    snapshot: ArcSwap<HashMap<String, Arc<CatalogEntry>>>,
}

impl ModelCatalog {
    pub fn new(backend: Arc<dyn Backend>, ttl: Duration, default_region: impl Into<String>) -> Self {
        Self {
            backend,
            ttl,
            default_region: default_region.into(),
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    fn cache_key(&self, credentials: &CredentialSet) -> String {
        let region = credentials.region.as_deref().unwrap_or(&self.default_region);
        let mut hasher = Sha256::new();
        hasher.update(credentials.access_key.as_bytes());
        hasher.update([0u8]);
        hasher.update(region.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn cached(&self, key: &str) -> Option<Arc<Vec<ModelDescriptor>>> {
        if self.ttl.is_zero() {
            return None;
        }
        let snapshot = self.snapshot.load();
        snapshot
            .get(key)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.models.clone())
    }

    fn store(&self, key: String, models: Arc<Vec<ModelDescriptor>>) {
        if self.ttl.is_zero() {
            return;
        }
        let entry = Arc::new(CatalogEntry {
            models,
            fetched_at: Instant::now(),
        });
        let ttl = self.ttl;
        self.snapshot.rcu(|current| {
            let mut next: HashMap<String, Arc<CatalogEntry>> = current
                .iter()
                .filter(|(_, e)| e.fetched_at.elapsed() < ttl)
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect();
            next.insert(key.clone(), entry.clone());
            next
        });
    }

    /// Fetch both listings for one credential set.
    ///
    /// One failing source yields the other's models; both failing is an error.
    /// Only complete listings are cached.
    pub async fn fetch(&self, credentials: &CredentialSet) -> Result<Arc<Vec<ModelDescriptor>>> {
        let key = self.cache_key(credentials);
        if let Some(models) = self.cached(&key) {
            tracing::debug!(count = models.len(), "Model catalog cache hit");
            return Ok(models);
        }

        let (foundation, profiles) = tokio::join!(
            self.backend.list_foundation_models(credentials),
            self.backend.list_inference_profiles(credentials)
        );

        let complete = foundation.is_ok() && profiles.is_ok();
        let refreshed_at = chrono::Utc::now().timestamp();

        let (foundation, profiles) = match (foundation, profiles) {
            (Err(f), Err(p)) => {
                record_failure("foundation_models", &f);
                record_failure("inference_profiles", &p);
                return Err(p);
            }
            (f, p) => (
                f.unwrap_or_else(|e| {
                    record_failure("foundation_models", &e);
                    Vec::new()
                }),
                p.unwrap_or_else(|e| {
                    record_failure("inference_profiles", &e);
                    Vec::new()
                }),
            ),
        };

        let models = Arc::new(merge_listings(foundation, profiles, refreshed_at));
        if complete {
            self.store(key, models.clone());
        }
        Ok(models)
    }

    /// List models, trying each credential set in turn.
    ///
    /// Never fails: when no listing can be obtained the result is empty and a
    /// `BackendUnavailable` warning is logged.
    pub async fn list_models(&self, credentials: &[CredentialSet]) -> Vec<ModelDescriptor> {
        let mut last_error: Option<AppError> = None;

        for creds in credentials {
            match self.fetch(creds).await {
                Ok(models) => return models.as_ref().clone(),
                Err(e) => {
                    tracing::warn!(
                        access_key = %creds.masked_access_key(),
                        error = %e,
                        "Model listing failed, trying next credentials"
                    );
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            let warning = AppError::BackendUnavailable(format!("Model catalog unavailable: {}", e));
            tracing::warn!(error_type = %warning.kind(), "{}", warning);
        }
        Vec::new()
    }
}

fn record_failure(source: &str, error: &AppError) {
    tracing::warn!(source = source, error = %error, "Model listing source failed");
    get_metrics()
        .catalog_failures
        .with_label_values(&[source])
        .inc();
}

/// Merge both listings, deduplicated by id and sorted.
///
/// A profile replaces a base model with the same id. `created` is the profile
/// creation time when known, otherwise `refreshed_at`.
pub fn merge_listings(
    foundation: Vec<FoundationModelSummary>,
    profiles: Vec<InferenceProfileSummary>,
    refreshed_at: i64,
) -> Vec<ModelDescriptor> {
    let mut merged: BTreeMap<String, ModelDescriptor> = BTreeMap::new();

    for model in foundation.into_iter().filter(|m| m.is_invokable_chat_model()) {
        let owned_by = provider_namespace(&model.model_id).to_string();
        merged.insert(
            model.model_id.clone(),
            ModelDescriptor::new(model.model_id, refreshed_at, owned_by),
        );
    }

    for profile in profiles.into_iter().filter(|p| p.is_active()) {
        let created = profile
            .created_at
            .map(|t| t.timestamp())
            .unwrap_or(refreshed_at);
        let owned_by = provider_namespace(&profile.inference_profile_id).to_string();
        merged.insert(
            profile.inference_profile_id.clone(),
            ModelDescriptor::new(profile.inference_profile_id, created, owned_by),
        );
    }

    merged.into_values().collect()
}
