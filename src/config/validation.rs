//! Unknown-key detection with Levenshtein suggestions.
//!
//! Two-pass parse: first the raw TOML is walked as `toml::Value` and each
//! dotted key path is compared against the known set, then serde
//! deserializes as usual. Unknown keys only ever warn.

use std::collections::HashSet;

/// A non-fatal config warning.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

/// Every valid dotted key path of `BrokerpollConfig`.
///
/// Maintained by hand alongside `settings.rs`.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        "source",
        "source.data_dir",
        "source.topics",
        "source.consumer_group",
        "source.schema_path",
        "poll",
        "poll.batch_size",
        "poll.poll_timeout_ms",
        "poll.stop_after_secs",
        "poll.max_messages",
        "poll.max_empty_polls",
        "store",
        "store.partitions",
        "store.write_attempts",
        "views",
        "views.refresh_after_ingest",
        "views.snapshot_retries",
        "views.forced_source_lag_days",
    ];
    keys.iter().copied().collect()
}

/// Collect dotted key paths of every table and leaf in a TOML value.
///
/// Arrays are leaves; their elements are not descended into.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let toml::Value::Table(table) = value {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            if v.is_table() {
                keys.extend(walk_toml_keys(v, &path));
            }
            keys.push(path);
        }
    }
    keys
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a.chars().count();
    }

    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_chars.len()]
}

/// Closest known key within edit distance 3.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|k| (*k, levenshtein(unknown, k)))
        .filter(|(_, dist)| *dist <= 3)
        .min_by(|(ka, da), (kb, db)| da.cmp(db).then_with(|| ka.cmp(kb)))
        .map(|(k, _)| k.to_string())
}

/// Warnings for every key in `raw_toml` that the config does not know.
///
/// Parse errors are left to serde and produce no warnings here.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new();
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| ValidationWarning {
            suggestion: suggest_correction(&key, &known),
            message: format!("Unknown config key '{key}'"),
            field: key,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typo_gets_suggestion() {
        let warnings = validate_unknown_keys("[poll]\nbatch_sise = 10\n");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "poll.batch_sise");
        assert_eq!(warnings[0].suggestion.as_deref(), Some("poll.batch_size"));
    }

    #[test]
    fn test_known_keys_are_silent() {
        let raw = "[source]\ntopics = [\"a\"]\n[store]\npartitions = [1, 2]\n";
        assert!(validate_unknown_keys(raw).is_empty());
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }
}
