//! Prometheus recorder installation and rendering.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::ServerError;

/// Install the global Prometheus recorder.
///
/// Call once per process, before anything is recorded. The handle renders
/// the `/metrics` body.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Prometheus text exposition of everything recorded so far.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::{Key, Recorder};

    #[test]
    fn render_contains_recorded_counter() {
        // Local recorder; a global install would leak across tests.
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let metadata = metrics::Metadata::new(module_path!(), metrics::Level::INFO, None);
        recorder
            .register_counter(&Key::from_name(trirpc_core::metrics::RPC_REQUESTS_TOTAL), &metadata)
            .increment(3);

        let out = render(&handle);
        assert!(out.contains("rpc_requests_total 3"));
    }
}
