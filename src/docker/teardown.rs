//! Stop every running container started from one of this tool's images.

use anyhow::Result;

use super::ContainerEngine;

/// Containers stopped and those that refused to stop.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub stopped: Vec<String>,
    pub failed: Vec<String>,
}

/// Stop running containers whose image tag starts with `prefix`.
///
/// Individual stop failures are logged and collected, never retried.
pub fn teardown_matching(engine: &dyn ContainerEngine, prefix: &str) -> Result<TeardownReport> {
    let mut report = TeardownReport::default();
    for container in engine.list_running()? {
        if !container.image.starts_with(prefix) {
            continue;
        }
        tracing::info!("stopping {} ({})", container.id, container.image);
        match engine.stop(&container.id) {
            Ok(()) => report.stopped.push(container.id),
            Err(e) => {
                tracing::warn!("failed to stop {}: {:#}", container.id, e);
                report.failed.push(container.id);
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::TAG_PREFIX;
    use crate::testing::FakeEngine;

    #[test]
    fn only_prefixed_containers_are_stopped() {
        let engine = FakeEngine::default().with_running(&[
            ("a1", "like_debuggee"),
            ("b2", "postgres:15"),
            ("c3", "like_kbuilder_x86_64"),
        ]);
        let report = teardown_matching(&engine, TAG_PREFIX).unwrap();
        assert_eq!(report.stopped, vec!["a1".to_string(), "c3".to_string()]);
        assert!(report.failed.is_empty());
        assert_eq!(engine.stopped(), vec!["a1".to_string(), "c3".to_string()]);
    }

    #[test]
    fn stop_failures_are_collected() {
        let engine = FakeEngine::default()
            .with_running(&[("a1", "like_debugger"), ("a2", "like_debuggee")])
            .failing_stop("a1");
        let report = teardown_matching(&engine, TAG_PREFIX).unwrap();
        assert_eq!(report.stopped, vec!["a2".to_string()]);
        assert_eq!(report.failed, vec!["a1".to_string()]);
    }

    #[test]
    fn nothing_running_is_fine() {
        let engine = FakeEngine::default();
        assert_eq!(
            teardown_matching(&engine, TAG_PREFIX).unwrap(),
            TeardownReport::default()
        );
    }
}
