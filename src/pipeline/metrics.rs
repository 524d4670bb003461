use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageMetrics {
    pub total_executions: u64,
    pub average_execution_ms: f64,
}

impl StageMetrics {
    fn record(&mut self, elapsed: Duration) {
        self.total_executions += 1;
        let n = self.total_executions as f64;
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.average_execution_ms = (self.average_execution_ms * (n - 1.0) + ms) / n;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineMetrics {
    pub total_executions: u64,
    pub average_execution_ms: f64,
    pub stage_metrics: BTreeMap<String, StageMetrics>,
}

/// Running averages for a pipeline. A disabled recorder ignores everything.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    enabled: bool,
    inner: Mutex<PipelineMetrics>,
}

impl MetricsRecorder {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            inner: Mutex::new(PipelineMetrics::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_stage(&self, stage: &str, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        let mut metrics = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        metrics
            .stage_metrics
            .entry(stage.to_string())
            .or_default()
            .record(elapsed);
    }

    pub fn record_execution(&self, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        let mut metrics = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        metrics.total_executions += 1;
        let n = metrics.total_executions as f64;
        let ms = elapsed.as_secs_f64() * 1000.0;
        metrics.average_execution_ms = (metrics.average_execution_ms * (n - 1.0) + ms) / n;
    }

    pub fn snapshot(&self) -> PipelineMetrics {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset(&self) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = PipelineMetrics::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_average() {
        let recorder = MetricsRecorder::new(true);
        recorder.record_stage("llm_completion", Duration::from_millis(10));
        recorder.record_stage("llm_completion", Duration::from_millis(30));
        recorder.record_execution(Duration::from_millis(40));

        let metrics = recorder.snapshot();
        let stage = &metrics.stage_metrics["llm_completion"];
        assert_eq!(stage.total_executions, 2);
        assert!((stage.average_execution_ms - 20.0).abs() < 0.001);
        assert_eq!(metrics.total_executions, 1);
        assert!((metrics.average_execution_ms - 40.0).abs() < 0.001);
    }

    #[test]
    fn test_disabled_recorder_ignores_samples() {
        let recorder = MetricsRecorder::new(false);
        recorder.record_stage("model_selection", Duration::from_millis(5));
        recorder.record_execution(Duration::from_millis(5));
        assert_eq!(recorder.snapshot(), PipelineMetrics::default());
    }

    #[test]
    fn test_reset() {
        let recorder = MetricsRecorder::new(true);
        recorder.record_stage("tool_calling", Duration::from_millis(1));
        recorder.reset();
        assert!(recorder.snapshot().stage_metrics.is_empty());
    }
}
