//! Masking of sensitive fields before anything touches disk.
//!
//! A record's metadata tree is walked depth-first; every object key that
//! case-insensitively matches the baseline key set or the tenant's override
//! keys has its value replaced. Replacement is `****` unless the key has a
//! partial rule (keep a prefix, or keep the shape of an email address).
//! Masking runs before the WAL write and is idempotent, so re-masking an
//! already masked record is a no-op.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::config::{MaskingSettings, PartialRule, SharedSettings};

const MASK: &str = "****";
const EMAIL_STARS: &str = "*****";

fn email_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([^@])([^@]*)([^@])(@.*)$").expect("email pattern compiles"))
}

/// How a matched key's value is rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MaskMode {
    Full,
    KeepPrefix(usize),
    Email,
}

/// The resolved key set and per-key modes for one record.
struct MaskPlan {
    keys: HashSet<String>,
    modes: HashMap<String, MaskMode>,
}

/// Outcome of masking one record.
#[derive(Debug, Default, Clone, Copy)]
pub struct MaskReport {
    pub masked_fields: u64,
    /// True when per-token overrides could not be applied and masking fell
    /// back to the baseline keys.
    pub overrides_failed: bool,
}

pub struct MaskingEngine {
    settings: Arc<SharedSettings>,
}

impl MaskingEngine {
    pub fn new(settings: Arc<SharedSettings>) -> Self {
        Self { settings }
    }

    /// Mask `metadata` in place using baseline keys plus the token's
    /// overrides. Override trouble downgrades to baseline-only masking; the
    /// record is never dropped.
    pub fn mask(&self, token: &str, metadata: &mut Value) -> MaskReport {
        let snapshot = self.settings.snapshot();
        let masking = &snapshot.masking;

        let mut report = MaskReport::default();
        let plan = match build_plan(masking, masking.per_token_overrides.get(token)) {
            Ok(plan) => plan,
            Err(reason) => {
                warn!("per-token masking overrides rejected ({reason}), using baseline only");
                report.overrides_failed = true;
                build_plan(masking, None).unwrap_or_else(|_| MaskPlan {
                    keys: HashSet::new(),
                    modes: HashMap::new(),
                })
            }
        };

        mask_value(metadata, &plan, &mut report.masked_fields);
        report
    }
}

fn build_plan(
    masking: &MaskingSettings,
    overrides: Option<&Vec<String>>,
) -> Result<MaskPlan, String> {
    let mut keys: HashSet<String> = masking
        .baseline_keys
        .iter()
        .map(|k| k.to_lowercase())
        .collect();

    if let Some(extra) = overrides {
        for key in extra {
            let key = key.trim();
            if key.is_empty() {
                return Err("empty override key".to_string());
            }
            keys.insert(key.to_lowercase());
        }
    }

    let mut modes = HashMap::new();
    for (key, rule) in &masking.partial_rules {
        modes.insert(key.to_lowercase(), mode_for_rule(rule));
    }

    Ok(MaskPlan { keys, modes })
}

/// A nonsensical rule degrades to a full mask; erring toward more masking.
fn mode_for_rule(rule: &PartialRule) -> MaskMode {
    match (rule.keep_prefix, rule.mask_email) {
        (Some(n), _) if n > 0 => MaskMode::KeepPrefix(n),
        (Some(_), _) => MaskMode::Full,
        (None, Some(true)) => MaskMode::Email,
        _ => MaskMode::Full,
    }
}

fn mask_value(value: &mut Value, plan: &MaskPlan, masked: &mut u64) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if plan.keys.contains(&key.to_lowercase()) {
                    let mode = plan
                        .modes
                        .get(&key.to_lowercase())
                        .copied()
                        .unwrap_or(MaskMode::Full);
                    *child = replace(child, mode);
                    *masked += 1;
                } else {
                    mask_value(child, plan, masked);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                mask_value(item, plan, masked);
            }
        }
        _ => {}
    }
}

fn replace(value: &Value, mode: MaskMode) -> Value {
    match mode {
        MaskMode::Full => Value::String(MASK.to_string()),
        MaskMode::KeepPrefix(n) => match value {
            Value::String(s) => {
                if s.chars().count() <= n {
                    Value::String(MASK.to_string())
                } else {
                    let prefix: String = s.chars().take(n).collect();
                    Value::String(format!("{prefix}{MASK}"))
                }
            }
            _ => Value::String(MASK.to_string()),
        },
        MaskMode::Email => match value {
            Value::String(s) => match email_pattern().captures(s) {
                Some(caps) => Value::String(format!(
                    "{}{EMAIL_STARS}{}{}",
                    &caps[1], &caps[3], &caps[4]
                )),
                None => Value::String(MASK.to_string()),
            },
            _ => Value::String(MASK.to_string()),
        },
    }
}
