//! Training-executor seam
//!
//! The plan interpreter is an external component. The client hands it the
//! downloaded plan, one batch at a time, and collects the updated parameters.
//! [`TrainingLoop`] drives those calls and checks an advisory [`Deadline`]
//! between batches so a host can reclaim the device early.

use fedlink_core::config::ClientConfig;
use fedlink_core::identity::ArtifactId;
use fedlink_core::{Error, Result};
use fedlink_runtime::Deadline;
use sha2::{Digest, Sha256};

use crate::{ModelState, Tensor};

/// A downloaded training plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanArtifact {
    /// Coordinator-assigned plan id
    pub id: ArtifactId,
    /// Opaque plan container
    pub bytes: Vec<u8>,
    /// Lowercase hex sha256 of `bytes`
    pub sha256: String,
}

impl PlanArtifact {
    /// Wrap plan bytes, recording their digest
    pub fn new(id: ArtifactId, bytes: Vec<u8>) -> Self {
        let sha256 = sha256_hex(&bytes);
        Self { id, bytes, sha256 }
    }
}

/// Lowercase hex sha256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Result of executing the plan on one batch
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Training loss for the batch
    pub loss: f32,
    /// Parameters after the update
    pub params: ModelState,
}

/// Executes a training plan
pub trait PlanExecutor: Send {
    /// Run one training step on `batch`, starting from `params`
    fn execute(
        &mut self,
        plan: &PlanArtifact,
        batch: &[Tensor],
        config: &ClientConfig,
        params: &ModelState,
    ) -> Result<StepOutput>;
}

/// Outcome of a [`TrainingLoop`] run
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// Parameters after the last completed batch
    pub params: ModelState,
    /// Loss per completed batch
    pub losses: Vec<f32>,
    /// Whether the deadline stopped the loop early
    pub cancelled: bool,
}

impl TrainingSummary {
    /// Number of batches that ran to completion
    pub fn batches_run(&self) -> usize {
        self.losses.len()
    }
}

/// Drives a [`PlanExecutor`] over a sequence of batches
#[derive(Debug)]
pub struct TrainingLoop<'a> {
    plan: &'a PlanArtifact,
    config: &'a ClientConfig,
    deadline: Deadline,
}

impl<'a> TrainingLoop<'a> {
    /// Create a loop for one cycle
    pub fn new(plan: &'a PlanArtifact, config: &'a ClientConfig) -> Self {
        Self {
            plan,
            config,
            deadline: Deadline::new(),
        }
    }

    /// Stop between batches once `deadline` expires
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// Run batches until exhausted, `max_updates` is reached, or the deadline expires
    pub fn run<E, I>(&self, executor: &mut E, initial: ModelState, batches: I) -> Result<TrainingSummary>
    where
        E: PlanExecutor + ?Sized,
        I: IntoIterator<Item = Vec<Tensor>>,
    {
        let limit = self.config.max_updates.map(|n| n as usize).unwrap_or(usize::MAX);
        let mut params = initial;
        let mut losses = Vec::new();
        let mut cancelled = false;

        for batch in batches.into_iter().take(limit) {
            if self.deadline.is_expired() {
                tracing::info!(completed = losses.len(), "deadline reached, stopping training");
                cancelled = true;
                break;
            }
            let step = executor.execute(self.plan, &batch, self.config, &params)?;
            if !step.loss.is_finite() {
                return Err(Error::Executor(format!(
                    "non-finite loss after {} batches",
                    losses.len()
                )));
            }
            tracing::debug!(batch = losses.len(), loss = step.loss, "batch complete");
            losses.push(step.loss);
            params = step.params;
        }

        Ok(TrainingSummary {
            params,
            losses,
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TensorBuffer;
    use std::collections::BTreeMap;

    /// Subtracts `lr * mean(batch)` from every f32 parameter.
    struct MeanShift {
        calls: usize,
        cancel_after: Option<(usize, Deadline)>,
    }

    impl PlanExecutor for MeanShift {
        fn execute(
            &mut self,
            _plan: &PlanArtifact,
            batch: &[Tensor],
            config: &ClientConfig,
            params: &ModelState,
        ) -> Result<StepOutput> {
            self.calls += 1;
            if let Some((n, deadline)) = &self.cancel_after {
                if self.calls == *n {
                    deadline.cancel();
                }
            }
            let values: Vec<f32> = batch.iter().flat_map(|t| t.data.to_f32()).collect();
            let mean = values.iter().sum::<f32>() / values.len().max(1) as f32;
            let shift = config.learning_rate as f32 * mean;
            let tensors = params
                .tensors
                .iter()
                .map(|t| {
                    let shifted: Vec<f32> = t.data.to_f32().iter().map(|v| v - shift).collect();
                    Tensor::new(t.name.clone(), t.shape.clone(), t.dtype, TensorBuffer::from_f32(&shifted))
                })
                .collect();
            Ok(StepOutput {
                loss: mean,
                params: ModelState::new(tensors),
            })
        }
    }

    fn config(max_updates: Option<u32>) -> ClientConfig {
        ClientConfig {
            name: "mnist".into(),
            version: "1.0.0".into(),
            batch_size: 1,
            learning_rate: 0.5,
            max_updates,
            extra: BTreeMap::new(),
        }
    }

    fn batches(n: usize) -> Vec<Vec<Tensor>> {
        (0..n).map(|_| vec![Tensor::f32("x", vec![2], &[1.0, 1.0])]).collect()
    }

    #[test]
    fn plan_digest_is_recorded() {
        let plan = PlanArtifact::new(ArtifactId::new("7"), b"abc".to_vec());
        assert_eq!(
            plan.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn loop_respects_max_updates() {
        let plan = PlanArtifact::new(ArtifactId::new("1"), Vec::new());
        let config = config(Some(3));
        let mut executor = MeanShift { calls: 0, cancel_after: None };
        let initial = ModelState::default().with_tensor(Tensor::f32("w", vec![1], &[2.0]));
        let summary = TrainingLoop::new(&plan, &config)
            .run(&mut executor, initial, batches(10))
            .unwrap();
        assert_eq!(summary.batches_run(), 3);
        assert!(!summary.cancelled);
        assert_eq!(summary.params.tensors[0].data.to_f32(), vec![0.5]);
    }

    #[test]
    fn loop_stops_between_batches_when_deadline_expires() {
        let plan = PlanArtifact::new(ArtifactId::new("1"), Vec::new());
        let config = config(None);
        let deadline = Deadline::new();
        let mut executor = MeanShift {
            calls: 0,
            cancel_after: Some((2, deadline.clone())),
        };
        let initial = ModelState::default().with_tensor(Tensor::f32("w", vec![1], &[0.0]));
        let summary = TrainingLoop::new(&plan, &config)
            .with_deadline(deadline)
            .run(&mut executor, initial, batches(10))
            .unwrap();
        assert_eq!(summary.batches_run(), 2);
        assert!(summary.cancelled);
        assert_eq!(executor.calls, 2);
    }
}
