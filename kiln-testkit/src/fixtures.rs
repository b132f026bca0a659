use std::collections::HashMap;

use kiln::config::JobSpec;
use kiln::gateway::GatewayRetryConfig;
use kiln::job::Target;
use kiln::model::{ModelFunction, ModelSource, Precision, RandomDistribution};
use kiln::orchestrator::OrchestratorConfig;

/// A complete model source passing the full capability typecheck.
pub fn sphere_model_source() -> ModelSource {
    let functions: HashMap<ModelFunction, String> = ModelFunction::ALL
        .iter()
        .map(|f| (*f, format!("def {}(): pass", f.as_str())))
        .collect();

    ModelSource {
        name: "sphere".to_string(),
        dimensions: 3,
        precision: Precision::Float32,
        distribution: RandomDistribution::Uniform,
        globals: "bounds = (-5.0, 5.0)".to_string(),
        functions,
    }
}

/// A model source missing capabilities; loads only with typecheck
/// skipped.
pub fn incomplete_model_source() -> ModelSource {
    let mut source = sphere_model_source();
    source.name = "sphere-partial".to_string();
    source.functions.remove(&ModelFunction::Cool);
    source.functions.remove(&ModelFunction::AcceptanceFunc);
    source
}

/// A local-docker job spec with a single worker.
pub fn local_spec() -> JobSpec {
    JobSpec::default()
}

/// Orchestrator configuration tuned for fast test turnaround: short
/// result polls and near-immediate retry backoff.
pub fn fast_orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry: GatewayRetryConfig {
            max_attempts: 3,
            base_delay_ms: 5,
            max_backoff_ms: 20,
        },
        result_poll_interval_ms: 10,
        event_capacity: 64,
        shutdown_grace_ms: 5000,
    }
}

/// Three scored candidates, as a backend would report them.
pub fn three_targets() -> Vec<Target> {
    vec![
        Target::new(vec![0.8, -0.1, 0.4], 0.81, 0),
        Target::new(vec![0.3, 0.0, 0.2], 0.13, 0),
        Target::new(vec![0.1, 0.0, 0.05], 0.0125, 0),
    ]
}
