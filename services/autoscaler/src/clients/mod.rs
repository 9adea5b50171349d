//! Typed clients for the loop's collaborators.
//!
//! Each collaborator is reached through a trait so the orchestrator can be
//! exercised against in-memory fakes; the HTTP implementations live beside
//! their traits. All outbound calls run under an injected [`RetryPolicy`].
//!
//! [`RetryPolicy`]: crate::retry::RetryPolicy

pub mod blob;
pub mod compute;
pub mod kube;
pub mod metrics;

pub use blob::{BlobStore, HttpBlobStore};
pub use compute::{ComputeProvider, HttpComputeProvider, WorkerNode};
pub use kube::{HttpOrchestrationApi, OrchestrationApi, PodRef};
pub use metrics::{LoadSample, MetricsSource, PrometheusMetrics};
