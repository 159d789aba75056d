//! Artifact fetcher
//!
//! Downloads the training plan and the model of an accepted cycle
//! concurrently and decodes the model with the job's codec.

use std::sync::Arc;

use fedlink_core::identity::{ArtifactId, RequestKey, WorkerId};
use fedlink_core::Result;
use fedlink_models::executor::{sha256_hex, PlanArtifact};
use fedlink_models::{ModelCodec, ModelState};
use fedlink_net::protocol::{ArtifactKind, ArtifactRequest};
use fedlink_net::traits::ArtifactSource;

/// Plan and decoded model of one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactBundle {
    /// Training plan handed to the executor
    pub plan: PlanArtifact,
    /// Model parameters before training
    pub model: ModelState,
    /// Lowercase hex sha256 of the model container as downloaded
    pub model_sha256: String,
}

/// Downloads cycle artifacts
#[derive(Clone)]
pub struct ArtifactFetcher {
    source: Arc<dyn ArtifactSource>,
    codec: Arc<dyn ModelCodec>,
}

impl core::fmt::Debug for ArtifactFetcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArtifactFetcher").finish_non_exhaustive()
    }
}

impl ArtifactFetcher {
    /// Create a fetcher reading from `source`
    pub fn new(source: Arc<dyn ArtifactSource>, codec: Arc<dyn ModelCodec>) -> Self {
        Self { source, codec }
    }

    /// Fetch plan and model together; either failure fails the whole bundle
    pub async fn fetch(
        &self,
        worker_id: &WorkerId,
        request_key: &RequestKey,
        plan_id: &ArtifactId,
        model_id: &ArtifactId,
    ) -> Result<ArtifactBundle> {
        let request = |kind, artifact_id: &ArtifactId| ArtifactRequest {
            kind,
            worker_id: worker_id.clone(),
            request_key: request_key.clone(),
            artifact_id: artifact_id.clone(),
        };
        let plan_request = request(ArtifactKind::Plan, plan_id);
        let model_request = request(ArtifactKind::Model, model_id);

        let (plan_bytes, model_bytes) =
            futures::try_join!(self.source.fetch(&plan_request), self.source.fetch(&model_request))?;
        tracing::debug!(
            worker_id = %worker_id,
            plan_bytes = plan_bytes.len(),
            model_bytes = model_bytes.len(),
            "cycle artifacts downloaded"
        );

        let model = self.codec.decode(&model_bytes)?;
        Ok(ArtifactBundle {
            plan: PlanArtifact::new(plan_id.clone(), plan_bytes.to_vec()),
            model,
            model_sha256: sha256_hex(&model_bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedlink_core::config::ClientConfig;
    use fedlink_core::ErrorKind;
    use fedlink_models::{PostcardCodec, Tensor};
    use fedlink_net::MockCoordinator;

    fn client_config() -> ClientConfig {
        serde_json::from_str(r#"{"name":"mnist","version":"1.0.0","batch_size":8,"lr":0.1}"#).unwrap()
    }

    fn model() -> ModelState {
        ModelState::new(vec![Tensor::f32("w", vec![2], &[0.5, -0.5])])
    }

    #[tokio::test]
    async fn fetches_both_artifacts() {
        let coordinator = MockCoordinator::accepting("w", "k", client_config())
            .with_artifact(ArtifactKind::Plan, "1", b"plan-bytes".to_vec())
            .with_artifact(ArtifactKind::Model, "2", PostcardCodec.encode(&model()).unwrap());
        let coordinator = Arc::new(coordinator);
        let fetcher = ArtifactFetcher::new(coordinator.clone(), Arc::new(PostcardCodec));

        let bundle = fetcher
            .fetch(
                &WorkerId::new("w"),
                &RequestKey::new("k"),
                &ArtifactId::new("1"),
                &ArtifactId::new("2"),
            )
            .await
            .unwrap();
        assert_eq!(bundle.plan.bytes, b"plan-bytes");
        assert_eq!(bundle.plan.sha256, sha256_hex(b"plan-bytes"));
        assert_eq!(bundle.model, model());

        let mut calls = coordinator.calls();
        calls.sort_unstable();
        assert_eq!(calls, vec!["fetch_model", "fetch_plan"]);
    }

    #[tokio::test]
    async fn missing_model_fails_the_bundle() {
        let coordinator = MockCoordinator::accepting("w", "k", client_config())
            .with_artifact(ArtifactKind::Plan, "1", b"plan".to_vec());
        let fetcher = ArtifactFetcher::new(Arc::new(coordinator), Arc::new(PostcardCodec));
        let err = fetcher
            .fetch(
                &WorkerId::new("w"),
                &RequestKey::new("k"),
                &ArtifactId::new("1"),
                &ArtifactId::new("2"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, fedlink_core::Error::Network { status: Some(404), .. }));
    }

    #[tokio::test]
    async fn undecodable_model_is_a_decoding_error() {
        let coordinator = MockCoordinator::accepting("w", "k", client_config())
            .with_artifact(ArtifactKind::Plan, "1", b"plan".to_vec())
            .with_artifact(ArtifactKind::Model, "2", vec![0xff; 3]);
        let fetcher = ArtifactFetcher::new(Arc::new(coordinator), Arc::new(PostcardCodec));
        let err = fetcher
            .fetch(
                &WorkerId::new("w"),
                &RequestKey::new("k"),
                &ArtifactId::new("1"),
                &ArtifactId::new("2"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decoding);
    }
}
