//! Validation orchestration: target resolution, the evaluation cache, job
//! dispatch with delivery confirmation, and the npm registry client.

mod dispatch;
mod evaluations;
mod npm;
mod orchestrator;
mod package_info;

pub use dispatch::{
    DispatchRequest, JobDispatch, QueueDispatcher, ValidationJob, DEFAULT_CONFIRM_TIMEOUT,
    DEFAULT_QUEUE,
};
pub use evaluations::{EvaluationsApi, EVALUATE_FAILURE_MESSAGE};
pub use npm::{parse_registry_document, NpmRegistry, DEFAULT_REGISTRY_TIMEOUT, DEFAULT_REGISTRY_URL};
pub use orchestrator::{StartRequest, ValidationOrchestrator};
pub use package_info::{
    split_package_spec, PackageInfoApi, ResolvedTarget, ValidationRequest, MANIFEST_FALLBACK_NAME,
};
