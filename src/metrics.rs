//! Lifecycle and generation metrics
//!
//! Recorded through the `metrics` facade; they are no-ops until the embedding
//! application installs a recorder.

use crate::backend::ActivePath;
use crate::lifecycle::ModelState;

/// Record a finished download
pub fn record_download_completed(model: &str, bytes: u64) {
    metrics::counter!("local_llm_downloads_total",
        "model" => model.to_string(),
        "outcome" => "success"
    )
    .increment(1);
    metrics::counter!("local_llm_download_bytes_total").increment(bytes);
}

/// Record a failed or cancelled download
pub fn record_download_failed(model: &str) {
    metrics::counter!("local_llm_downloads_total",
        "model" => model.to_string(),
        "outcome" => "failure"
    )
    .increment(1);
}

/// Record a model load, tagged with whether the native engine really loaded it
pub fn record_model_loaded(degraded: bool) {
    metrics::counter!("local_llm_model_loads_total",
        "degraded" => degraded.to_string()
    )
    .increment(1);
}

/// Record a generation by the path that served it
pub fn record_generation(path: ActivePath) {
    metrics::counter!("local_llm_generations_total",
        "path" => path.to_string()
    )
    .increment(1);
}

/// Record a generation rejected by the reentrancy guard
pub fn record_generation_rejected() {
    metrics::counter!("local_llm_generations_rejected_total").increment(1);
}

/// Update the model state gauge
pub fn update_model_state(state: ModelState) {
    metrics::gauge!("local_llm_model_state").set(state as u8 as f64);
}
