//! Ready-made parameters and telemetry for tests.

use polyglot::*;

/// Params for a Chinese to English request from `client_id`, default
/// priority and policy limits.
pub fn task_params(client_id: &str) -> TaskParams {
    TaskParams::new(client_id, "zho_Hans", "eng_Latn")
}

/// One accelerator telemetry reading.
pub fn telemetry(resource_id: &str, memory_total: u64, memory_used: u64) -> ResourceTelemetry {
    ResourceTelemetry {
        resource_id: resource_id.to_string(),
        device_name: format!("mock device {resource_id}"),
        memory_total,
        memory_used,
        utilization: 0.25,
        temperature: Some(41.0),
    }
}
