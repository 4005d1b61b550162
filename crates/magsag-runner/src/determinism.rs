//! Process-wide deterministic-execution state: mode toggle, seed cache,
//! global PRNG control, environment snapshot/replay, and run fingerprints.
//!
//! One PRNG per process: every accessor goes through a single mutex so
//! toggles and reseeds are atomic.

use std::collections::BTreeMap;

use chrono::Utc;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Map, Value};
use std::sync::Mutex;

use magsag_types::{canonical_json, sha256_hex};

struct DeterminismState {
    mode: bool,
    seed: Option<i64>,
    rng: StdRng,
}

static STATE: Lazy<Mutex<DeterminismState>> = Lazy::new(|| {
    Mutex::new(DeterminismState {
        mode: false,
        seed: None,
        rng: StdRng::from_entropy(),
    })
});

/// Environment variables captured into snapshots.
const SNAPSHOT_ENV_KEYS: [&str; 4] = [
    "MAGSAG_DETERMINISTIC_SEED",
    "MAGSAG_ENABLE_MCP",
    "MAGSAG_LOG_LEVEL",
    "MAGSAG_BASE_DIR",
];

fn lock() -> std::sync::MutexGuard<'static, DeterminismState> {
    STATE.lock().expect("determinism state lock poisoned")
}

/// Enable or disable deterministic mode. Enabling with a cached seed
/// re-applies it to the global PRNG immediately; disabling reseeds from
/// system entropy so determinism never leaks into later runs.
pub fn set_deterministic_mode(enabled: bool) {
    let mut state = lock();
    state.mode = enabled;
    if enabled {
        if let Some(seed) = state.seed {
            state.rng = StdRng::seed_from_u64(seed as u64);
        }
    } else {
        state.rng = StdRng::from_entropy();
    }
}

pub fn get_deterministic_mode() -> bool {
    lock().mode
}

/// Resolve the deterministic seed: explicitly set value, then the
/// `MAGSAG_DETERMINISTIC_SEED` environment variable, then a stable value
/// derived from the wall clock rounded to the minute. The result is cached
/// for the process lifetime; later env-var changes are ignored.
pub fn get_deterministic_seed() -> i64 {
    let mut state = lock();
    if let Some(seed) = state.seed {
        return seed;
    }

    let seed = std::env::var("MAGSAG_DETERMINISTIC_SEED")
        .ok()
        .and_then(|raw| raw.parse::<i64>().ok())
        .unwrap_or_else(|| (Utc::now().timestamp() / 60) * 60);

    state.seed = Some(seed);
    if state.mode {
        state.rng = StdRng::seed_from_u64(seed as u64);
    }
    seed
}

/// Explicitly set (or with `None` clear) the cached seed. Setting applies
/// the seed to the global PRNG; clearing reseeds from system entropy.
pub fn set_deterministic_seed(seed: Option<i64>) {
    let mut state = lock();
    state.seed = seed;
    match seed {
        Some(seed) => state.rng = StdRng::seed_from_u64(seed as u64),
        None => state.rng = StdRng::from_entropy(),
    }
}

/// Run a closure against the global PRNG.
pub fn with_rng<T>(f: impl FnOnce(&mut StdRng) -> T) -> T {
    f(&mut lock().rng)
}

/// Deep-copy a provider config, and when determinism is on force
/// `temperature=0.0`, inject the seed, coerce `top_p` to `1.0` when present,
/// and stamp the determinism metadata (coercing a non-mapping `metadata` to
/// a fresh mapping).
pub fn apply_deterministic_settings(provider_config: &Value) -> Value {
    let mut config = provider_config.clone();
    if !get_deterministic_mode() {
        return config;
    }

    let seed = get_deterministic_seed();
    let Value::Object(map) = &mut config else {
        return config;
    };
    map.insert("temperature".to_string(), json!(0.0));
    map.insert("seed".to_string(), json!(seed));
    if map.contains_key("top_p") {
        map.insert("top_p".to_string(), json!(1.0));
    }

    let metadata = match map.get_mut("metadata") {
        Some(Value::Object(existing)) => existing,
        _ => {
            map.insert("metadata".to_string(), Value::Object(Map::new()));
            match map.get_mut("metadata") {
                Some(Value::Object(fresh)) => fresh,
                _ => unreachable!("metadata was just inserted as an object"),
            }
        }
    };
    metadata.insert("deterministic_mode".to_string(), json!(true));
    metadata.insert("deterministic_seed".to_string(), json!(seed));

    config
}

/// Capture the current execution environment for later replay.
pub fn snapshot_environment() -> Value {
    let mut env_vars = Map::new();
    for key in SNAPSHOT_ENV_KEYS {
        if let Ok(value) = std::env::var(key) {
            env_vars.insert(key.to_string(), Value::String(value));
        }
    }
    json!({
        "timestamp": Utc::now().timestamp_millis() as f64 / 1000.0,
        "seed": get_deterministic_seed(),
        "deterministic_mode": get_deterministic_mode(),
        "env_vars": env_vars,
    })
}

/// Restore deterministic state from a snapshot and build a replay context.
/// Accepts either a raw snapshot or a `summary.json` object carrying a
/// nested `environment_snapshot`. A non-deterministic snapshot disables the
/// mode and clears the cached seed.
pub fn create_replay_context(
    replay_snapshot: &Value,
    additional_context: Option<BTreeMap<String, Value>>,
) -> Value {
    let snapshot = replay_snapshot
        .get("environment_snapshot")
        .filter(|nested| nested.is_object())
        .unwrap_or(replay_snapshot);

    let mut context = Map::new();
    context.insert("replay_mode".to_string(), json!(true));
    context.insert(
        "replay_timestamp".to_string(),
        snapshot.get("timestamp").cloned().unwrap_or(Value::Null),
    );
    context.insert(
        "replay_seed".to_string(),
        snapshot.get("seed").cloned().unwrap_or(Value::Null),
    );

    let deterministic = snapshot
        .get("deterministic_mode")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    set_deterministic_mode(deterministic);

    if deterministic {
        if let Some(seed) = snapshot.get("seed").and_then(Value::as_i64) {
            set_deterministic_seed(Some(seed));
            context.insert("deterministic".to_string(), json!(true));
        }
    } else {
        set_deterministic_seed(None);
    }

    if let Some(extra) = additional_context {
        for (key, value) in extra {
            context.insert(key, value);
        }
    }

    Value::Object(context)
}

/// Stable 16-hex-character fingerprint over `{agent, payload, config}` in
/// canonical JSON.
pub fn compute_run_fingerprint(agent_slug: &str, payload: &Value, provider_config: &Value) -> String {
    let components = json!({
        "agent": agent_slug,
        "payload": payload,
        "config": provider_config,
    });
    let mut fingerprint = sha256_hex(&canonical_json(&components));
    fingerprint.truncate(16);
    fingerprint
}

#[cfg(test)]
mod tests {
    use super::*;

    // Determinism state is process-global; tests serialize on this lock.
    static TEST_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    fn reset() {
        set_deterministic_mode(false);
        set_deterministic_seed(None);
        std::env::remove_var("MAGSAG_DETERMINISTIC_SEED");
    }

    #[test]
    fn settings_are_untouched_when_mode_off() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        let config = json!({"temperature": 0.9, "top_p": 0.5});
        let out = apply_deterministic_settings(&config);
        assert_eq!(out, config);
    }

    #[test]
    fn settings_are_forced_when_mode_on() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        set_deterministic_seed(Some(42));
        set_deterministic_mode(true);

        let out = apply_deterministic_settings(&json!({
            "temperature": 0.9,
            "top_p": 0.5,
            "metadata": "not-a-mapping",
        }));
        assert_eq!(out["temperature"], json!(0.0));
        assert_eq!(out["seed"], json!(42));
        assert_eq!(out["top_p"], json!(1.0));
        assert_eq!(out["metadata"]["deterministic_mode"], json!(true));
        assert_eq!(out["metadata"]["deterministic_seed"], json!(42));
        reset();
    }

    #[test]
    fn top_p_is_only_coerced_when_present() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        set_deterministic_seed(Some(7));
        set_deterministic_mode(true);
        let out = apply_deterministic_settings(&json!({"temperature": 0.9}));
        assert!(out.get("top_p").is_none());
        reset();
    }

    #[test]
    fn seed_resolution_prefers_explicit_then_env() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        std::env::set_var("MAGSAG_DETERMINISTIC_SEED", "1234");
        assert_eq!(get_deterministic_seed(), 1234);
        // Cached: later env changes are ignored.
        std::env::set_var("MAGSAG_DETERMINISTIC_SEED", "9999");
        assert_eq!(get_deterministic_seed(), 1234);

        set_deterministic_seed(Some(77));
        assert_eq!(get_deterministic_seed(), 77);
        reset();
    }

    #[test]
    fn snapshot_roundtrip_restores_deterministic_state() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        set_deterministic_seed(Some(555));
        set_deterministic_mode(true);
        let snapshot = snapshot_environment();
        assert_eq!(snapshot["seed"], json!(555));
        assert_eq!(snapshot["deterministic_mode"], json!(true));

        reset();
        let context = create_replay_context(&snapshot, None);
        assert_eq!(context["replay_mode"], json!(true));
        assert_eq!(context["deterministic"], json!(true));
        assert!(get_deterministic_mode());
        assert_eq!(get_deterministic_seed(), 555);
        reset();
    }

    #[test]
    fn non_deterministic_snapshot_clears_cached_seed() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        // Snapshot taken while determinism was off.
        let snapshot = snapshot_environment();

        // Determinism enabled later with a cached seed.
        set_deterministic_seed(Some(777));
        set_deterministic_mode(true);

        create_replay_context(&snapshot, None);
        assert!(!get_deterministic_mode());
        // The cached 777 must be gone; a fresh resolution derives a new
        // value (wall-clock based, a multiple of sixty).
        let fresh = get_deterministic_seed();
        assert_ne!(fresh, 777);
        reset();
    }

    #[test]
    fn replay_context_unwraps_nested_environment_snapshot() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        let summary = json!({
            "run_id": "r1",
            "environment_snapshot": {
                "timestamp": 1.0,
                "seed": 321,
                "deterministic_mode": true,
            },
        });
        let context = create_replay_context(&summary, None);
        assert_eq!(context["replay_seed"], json!(321));
        assert!(get_deterministic_mode());
        assert_eq!(get_deterministic_seed(), 321);
        reset();
    }

    #[test]
    fn fingerprint_is_stable_under_key_order() {
        let a = compute_run_fingerprint(
            "agent",
            &json!({"b": 2, "a": 1}),
            &json!({"model": "m", "temperature": 0.0}),
        );
        let b = compute_run_fingerprint(
            "agent",
            &json!({"a": 1, "b": 2}),
            &json!({"temperature": 0.0, "model": "m"}),
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let c = compute_run_fingerprint("other", &json!({"a": 1, "b": 2}), &json!({}));
        assert_ne!(a, c);
    }

    #[test]
    fn rng_is_reproducible_under_a_seed() {
        use rand::Rng;

        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        set_deterministic_seed(Some(99));
        set_deterministic_mode(true);
        let first = with_rng(|rng| rng.gen::<u64>());

        set_deterministic_mode(true); // re-applies cached seed
        let second = with_rng(|rng| rng.gen::<u64>());
        assert_eq!(first, second);
        reset();
    }
}
