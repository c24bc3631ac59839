use rand::{rngs::StdRng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

/// Process-wide determinism switch read from the environment.
#[derive(Clone, Debug)]
pub struct DeterminismConfig {
    /// Whether deterministic execution is enabled globally.
    pub enabled: bool,
    /// Base seed used to derive per-component seeds.
    pub base_seed: u64,
}

fn flag_enabled(raw: &str) -> bool {
    !matches!(raw, "0" | "false" | "False" | "off" | "OFF")
}

impl DeterminismConfig {
    fn from_env() -> Self {
        let enabled = std::env::var("SPIRAL_DETERMINISTIC")
            .ok()
            .map(|v| flag_enabled(&v))
            .unwrap_or(false);
        let base_seed = std::env::var("SPIRAL_DETERMINISTIC_SEED")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(42);
        Self { enabled, base_seed }
    }

    /// Derives a deterministic seed for a given component label.
    pub fn seed_for<L: Hash>(&self, label: L) -> u64 {
        mix(self.base_seed, label)
    }
}

fn mix<L: Hash>(base: u64, label: L) -> u64 {
    let mut hasher = DefaultHasher::new();
    base.hash(&mut hasher);
    label.hash(&mut hasher);
    hasher.finish()
}

static CONFIG: OnceLock<DeterminismConfig> = OnceLock::new();

/// Returns the lazily initialised deterministic configuration.
pub fn config() -> &'static DeterminismConfig {
    CONFIG.get_or_init(DeterminismConfig::from_env)
}

/// Overrides the deterministic configuration. Only the first call wins.
pub fn configure(cfg: DeterminismConfig) -> &'static DeterminismConfig {
    CONFIG.get_or_init(|| cfg)
}

/// Returns a RNG derived from the provided label. When determinism is disabled
/// this falls back to a random seed from the operating system.
pub fn rng_from_label(label: &str) -> StdRng {
    let cfg = config();
    if cfg.enabled {
        StdRng::seed_from_u64(cfg.seed_for(label))
    } else {
        StdRng::from_entropy()
    }
}

/// Returns a RNG seeded from an optional explicit seed, respecting deterministic
/// overrides when the seed is not provided.
pub fn rng_from_optional(seed: Option<u64>, label: &str) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(value),
        None => rng_from_label(label),
    }
}

/// Hands out independent generators for named components from one root seed.
///
/// Two streams built from the same seed produce identical generators for the
/// same label, regardless of the order in which labels are requested.
#[derive(Clone, Debug)]
pub struct SeedStream {
    root: Option<u64>,
}

impl SeedStream {
    pub fn new(root: Option<u64>) -> Self {
        Self { root }
    }

    pub fn root(&self) -> Option<u64> {
        self.root
    }

    /// Generator for `label`.
    pub fn rng(&self, label: &str) -> StdRng {
        let seed = self.root.map(|root| mix(root, label));
        rng_from_optional(seed, label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
    use std::sync::{Mutex, OnceLock};

    fn with_env(vars: &[(&str, Option<&str>)], test: impl FnOnce()) {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        let _lock = GUARD.get_or_init(|| Mutex::new(())).lock().unwrap();

        let snapshot: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, value)| {
                let previous = std::env::var(key).ok();
                match value {
                    Some(val) => std::env::set_var(key, val),
                    None => std::env::remove_var(key),
                }
                ((*key).to_string(), previous)
            })
            .collect();

        let result = catch_unwind(AssertUnwindSafe(test));

        for (key, value) in snapshot {
            match value {
                Some(val) => std::env::set_var(&key, val),
                None => std::env::remove_var(&key),
            }
        }

        if let Err(err) = result {
            resume_unwind(err);
        }
    }

    #[test]
    fn defaults_disable_determinism() {
        with_env(
            &[
                ("SPIRAL_DETERMINISTIC", None),
                ("SPIRAL_DETERMINISTIC_SEED", None),
            ],
            || {
                let cfg = DeterminismConfig::from_env();
                assert!(!cfg.enabled);
                assert_eq!(cfg.base_seed, 42);
            },
        );
    }

    #[test]
    fn textual_false_values_disable_flags() {
        with_env(&[("SPIRAL_DETERMINISTIC", Some("off"))], || {
            assert!(!DeterminismConfig::from_env().enabled);
        });
    }

    #[test]
    fn seed_stream_is_order_independent() {
        let stream = SeedStream::new(Some(11));
        let mut first_masker = stream.rng("masker");
        let _ = stream.rng("init").gen::<u64>();
        let mut second_masker = SeedStream::new(Some(11)).rng("masker");
        assert_eq!(first_masker.gen::<u64>(), second_masker.gen::<u64>());
        let mut other = stream.rng("queue");
        assert_ne!(stream.rng("masker").gen::<u64>(), other.gen::<u64>());
    }
}
