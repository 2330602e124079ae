//! Fixed-window arithmetic and counter key layout.

use tollgate_core::types::{Metric, PlanKey};

/// A fixed window of `secs` seconds aligned to the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow {
    secs: u64,
}

impl FixedWindow {
    /// Create a window. A zero length is treated as one second.
    #[must_use]
    pub const fn new(secs: u64) -> Self {
        Self {
            secs: if secs == 0 { 1 } else { secs },
        }
    }

    /// Window length in seconds.
    #[must_use]
    pub const fn secs(&self) -> u64 {
        self.secs
    }

    /// Index of the window containing `now`.
    #[must_use]
    pub const fn bucket(&self, now: u64) -> u64 {
        now / self.secs
    }

    /// First second of the window containing `now`.
    #[must_use]
    pub const fn start(&self, now: u64) -> u64 {
        self.bucket(now) * self.secs
    }

    /// Seconds until the next window begins, in `1..=secs`.
    #[must_use]
    pub const fn retry_after(&self, now: u64) -> u64 {
        self.secs - now % self.secs
    }
}

impl Default for FixedWindow {
    fn default() -> Self {
        Self::new(60)
    }
}

/// Build the counter key for one metric of one plan/model in one bucket.
///
/// Layout: `{prefix}{{entity_id}:{ENTITY_TYPE}:{model_id}:{bucket}}:{metric}`.
/// The braces form a Redis Cluster hash tag, so the three metric keys of a
/// window live in one slot and a multi-key script or `MGET` over them is legal.
/// Should `model_id` itself contain `}` the tag ends early, but the three keys
/// still agree up to that point.
#[must_use]
pub fn counter_key(
    prefix: &str,
    plan: &PlanKey,
    model_id: &str,
    metric: Metric,
    bucket: u64,
) -> String {
    format!("{prefix}{{{plan}:{model_id}:{bucket}}}:{metric}")
}

/// Keys for all three metrics, in evaluation order.
#[must_use]
pub fn window_keys(prefix: &str, plan: &PlanKey, model_id: &str, bucket: u64) -> [String; 3] {
    Metric::ALL.map(|metric| counter_key(prefix, plan, model_id, metric, bucket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::types::EntityType;

    #[test]
    fn test_bucket_boundaries() {
        let window = FixedWindow::new(60);
        assert_eq!(window.bucket(0), 0);
        assert_eq!(window.bucket(59), 0);
        assert_eq!(window.bucket(60), 1);
        assert_eq!(window.start(125), 120);
    }

    #[test]
    fn test_retry_after_range() {
        let window = FixedWindow::new(60);
        assert_eq!(window.retry_after(120), 60);
        assert_eq!(window.retry_after(121), 59);
        assert_eq!(window.retry_after(179), 1);

        for now in 0..240 {
            let retry = window.retry_after(now);
            assert!((1..=60).contains(&retry));
        }
    }

    #[test]
    fn test_zero_window_is_clamped() {
        assert_eq!(FixedWindow::new(0).secs(), 1);
    }

    #[test]
    fn test_counter_key_layout() {
        let plan = PlanKey::new("alice", EntityType::User);
        let key = counter_key("tollgate:", &plan, "vendor.model:2", Metric::InputTpm, 28_333_333);
        assert_eq!(key, "tollgate:{alice:USER:vendor.model:2:28333333}:input_tpm");
    }

    #[test]
    fn test_window_keys_order() {
        let plan = PlanKey::new("svc", EntityType::Service);
        let [rpm, input, output] = window_keys("", &plan, "m", 7);
        assert_eq!(rpm, "{svc:SERVICE:m:7}:rpm");
        assert_eq!(input, "{svc:SERVICE:m:7}:input_tpm");
        assert_eq!(output, "{svc:SERVICE:m:7}:output_tpm");
    }

    /// Redis Cluster hashes only the first `{...}` section of a key.
    fn hash_tag(key: &str) -> &str {
        key.find('{')
            .and_then(|open| {
                let rest = &key[open + 1..];
                rest.find('}')
                    .filter(|close| *close > 0)
                    .map(|close| &rest[..close])
            })
            .unwrap_or(key)
    }

    #[test]
    fn test_window_keys_share_hash_slot() {
        let plan = PlanKey::new("alice", EntityType::ApiKey);
        for model in ["model-a", "vendor.model:2", "odd}model", "{braced}"] {
            let keys = window_keys("tollgate:", &plan, model, 28_333_333);
            let tag = hash_tag(&keys[0]);
            assert!(tag.starts_with("alice:API_KEY:"), "{model}: {tag}");
            assert!(keys.iter().all(|k| hash_tag(k) == tag), "{keys:?}");
        }

        // Different plans and buckets spread across slots.
        let other = window_keys("tollgate:", &PlanKey::new("bob", EntityType::User), "m", 1);
        let next = window_keys("tollgate:", &plan, "m", 2);
        assert_ne!(hash_tag(&other[0]), hash_tag(&next[0]));
    }
}
