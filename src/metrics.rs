use std::collections::HashMap;

/// フレーム毎・エンジン毎のメトリクス（文字列キー → 数値）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metrics {
    values: HashMap<String, f64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, key: &str, value: f64) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn merge(&mut self, other: Metrics) {
        self.values.extend(other.values);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub const fn as_map(&self) -> &HashMap<String, f64> {
        &self.values
    }

    pub fn into_map(self) -> HashMap<String, f64> {
        self.values
    }
}

/// メトリクスキー定数
pub mod keys {
    pub const TOTAL_MS: &str = "total_ms";
    pub const INFERENCE_MS: &str = "inference_ms";
    pub const STABILIZE_MS: &str = "stabilize_ms";
    pub const RESOLVED_MODE: &str = "resolved_mode";
    pub const BACKEND: &str = "backend";
    pub const DEGRADED: &str = "degraded";
    pub const DIFFUSION_STEPS_RUN: &str = "diffusion_steps_run";
    pub const IDENTITY_DISTANCE: &str = "identity_distance";
    pub const STABILIZER_RESETS: &str = "stabilizer_resets";
    pub const FRAMES_PROCESSED: &str = "frames_processed";
    pub const FRAMES_FAILED: &str = "frames_failed";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_get() {
        let mut metrics = Metrics::new();
        assert!(metrics.is_empty());

        metrics.record(keys::TOTAL_MS, 12.5);
        metrics.record(keys::DEGRADED, 0.0);

        assert_eq!(metrics.get(keys::TOTAL_MS), Some(12.5));
        assert_eq!(metrics.get(keys::DEGRADED), Some(0.0));
        assert_eq!(metrics.get("missing"), None);
        assert_eq!(metrics.len(), 2);
    }

    #[test]
    fn test_merge_overwrites() {
        let mut base = Metrics::new();
        base.record(keys::TOTAL_MS, 1.0);

        let mut update = Metrics::new();
        update.record(keys::TOTAL_MS, 2.0);
        update.record(keys::INFERENCE_MS, 0.5);

        base.merge(update);
        assert_eq!(base.get(keys::TOTAL_MS), Some(2.0));
        assert_eq!(base.get(keys::INFERENCE_MS), Some(0.5));
    }
}
