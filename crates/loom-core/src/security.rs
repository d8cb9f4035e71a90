use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of an input violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// Security policy applied to every trigger payload before it reaches a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Serialized payload ceiling in bytes.
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: usize,

    /// Maximum nesting depth of objects/arrays.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Strings longer than this are flagged.
    #[serde(default = "default_max_string_length")]
    pub max_string_length: usize,

    /// Violations at or above this severity abort the trigger.
    #[serde(default = "default_block_at")]
    pub block_at: Severity,

    /// Content patterns checked against every string and key.
    #[serde(default = "SecurityPolicy::default_patterns")]
    pub patterns: Vec<InputPattern>,
}

fn default_max_input_bytes() -> usize {
    1024 * 1024
}

fn default_max_depth() -> usize {
    32
}

fn default_max_string_length() -> usize {
    100_000
}

fn default_block_at() -> Severity {
    Severity::Critical
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            max_input_bytes: default_max_input_bytes(),
            max_depth: default_max_depth(),
            max_string_length: default_max_string_length(),
            block_at: default_block_at(),
            patterns: Self::default_patterns(),
        }
    }
}

impl SecurityPolicy {
    /// Built-in content patterns.
    pub fn default_patterns() -> Vec<InputPattern> {
        vec![
            InputPattern {
                pattern: r"(?i)\b(__import__|eval|exec|compile)\s*\(".to_string(),
                label: "code execution".to_string(),
                severity: Severity::Critical,
            },
            InputPattern {
                pattern: r"(;|&&|\|\|)\s*(rm|curl|wget|sh|bash|nc)\b".to_string(),
                label: "shell chaining".to_string(),
                severity: Severity::Critical,
            },
            InputPattern {
                pattern: r"(?i)<script\b".to_string(),
                label: "script tag".to_string(),
                severity: Severity::High,
            },
            InputPattern {
                pattern: r"\.\./\.\./".to_string(),
                label: "path traversal".to_string(),
                severity: Severity::Medium,
            },
            InputPattern {
                pattern: r"\$\{[^}]*\}".to_string(),
                label: "template interpolation".to_string(),
                severity: Severity::Low,
            },
        ]
    }
}

/// A labelled content pattern with its severity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputPattern {
    pub pattern: String,
    pub label: String,
    pub severity: Severity,
}

/// A single problem found while sanitizing input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// JSON-pointer-like path to the offending value (`/a/0/b`).
    pub path: String,
    pub label: String,
    pub severity: Severity,
}

/// Structural input sanitizer with a compiled pattern cache.
pub struct InputSanitizer {
    policy: SecurityPolicy,
    patterns: Vec<(regex::Regex, String, Severity)>,
}

impl InputSanitizer {
    /// Compile the policy's patterns. Invalid patterns are skipped with a warning.
    pub fn new(policy: SecurityPolicy) -> Self {
        let patterns = policy
            .patterns
            .iter()
            .filter_map(|p| match regex::Regex::new(&p.pattern) {
                Ok(re) => Some((re, p.label.clone(), p.severity)),
                Err(e) => {
                    tracing::warn!(
                        pattern = %p.pattern,
                        error = %e,
                        "Invalid input pattern regex, skipping"
                    );
                    None
                }
            })
            .collect();
        Self { policy, patterns }
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Walk the payload and collect every violation, most severe first.
    pub fn inspect(&self, input: &serde_json::Value) -> Vec<Violation> {
        let mut found = Vec::new();
        self.walk(input, "", 0, &mut found);
        found.sort_by(|a, b| b.severity.cmp(&a.severity));
        found
    }

    /// Whether a violation blocks the trigger under this policy.
    pub fn is_blocking(&self, violation: &Violation) -> bool {
        violation.severity >= self.policy.block_at
    }

    /// Serialized size check against `max_input_bytes`. Returns the size on success.
    pub fn check_size(&self, input: &serde_json::Value) -> std::result::Result<usize, (usize, usize)> {
        let size = serde_json::to_vec(input).map(|v| v.len()).unwrap_or(usize::MAX);
        if size > self.policy.max_input_bytes {
            Err((size, self.policy.max_input_bytes))
        } else {
            Ok(size)
        }
    }

    fn walk(&self, value: &serde_json::Value, path: &str, depth: usize, found: &mut Vec<Violation>) {
        if depth > self.policy.max_depth {
            found.push(Violation {
                path: path.to_string(),
                label: "nesting too deep".to_string(),
                severity: Severity::Critical,
            });
            return;
        }

        match value {
            serde_json::Value::String(s) => self.check_string(s, path, found),
            serde_json::Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.walk(item, &format!("{}/{}", path, i), depth + 1, found);
                }
            }
            serde_json::Value::Object(map) => {
                for (key, item) in map {
                    let child = format!("{}/{}", path, key);
                    if key.starts_with("__") {
                        found.push(Violation {
                            path: child.clone(),
                            label: "reserved key".to_string(),
                            severity: Severity::Critical,
                        });
                    }
                    self.check_string(key, &child, found);
                    self.walk(item, &child, depth + 1, found);
                }
            }
            _ => {}
        }
    }

    fn check_string(&self, s: &str, path: &str, found: &mut Vec<Violation>) {
        if s.contains('\0') {
            found.push(Violation {
                path: path.to_string(),
                label: "null byte".to_string(),
                severity: Severity::High,
            });
        } else if s
            .chars()
            .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        {
            found.push(Violation {
                path: path.to_string(),
                label: "control character".to_string(),
                severity: Severity::Low,
            });
        }

        if s.len() > self.policy.max_string_length {
            found.push(Violation {
                path: path.to_string(),
                label: "string too long".to_string(),
                severity: Severity::Medium,
            });
        }

        for (re, label, severity) in &self.patterns {
            if re.is_match(s) {
                found.push(Violation {
                    path: path.to_string(),
                    label: label.clone(),
                    severity: *severity,
                });
            }
        }
    }
}

impl Default for InputSanitizer {
    fn default() -> Self {
        Self::new(SecurityPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn severity_parse() {
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
        assert_eq!("low".parse::<Severity>().unwrap(), Severity::Low);
        assert!("fatal".parse::<Severity>().is_err());
    }

    #[test]
    fn clean_input_has_no_violations() {
        let sanitizer = InputSanitizer::default();
        let input = json!({"query": "quarterly report", "limit": 10, "tags": ["a", "b"]});
        assert!(sanitizer.inspect(&input).is_empty());
    }

    #[test]
    fn reserved_key_is_critical() {
        let sanitizer = InputSanitizer::default();
        let input = json!({"user": {"__proto__": {"admin": true}}});
        let violations = sanitizer.inspect(&input);
        assert_eq!(violations[0].severity, Severity::Critical);
        assert_eq!(violations[0].path, "/user/__proto__");
        assert!(sanitizer.is_blocking(&violations[0]));
    }

    #[test]
    fn code_execution_pattern_is_critical() {
        let sanitizer = InputSanitizer::default();
        let input = json!({"note": "__import__('os').system('id')"});
        let violations = sanitizer.inspect(&input);
        assert!(violations
            .iter()
            .any(|v| v.label == "code execution" && v.severity == Severity::Critical));
    }

    #[test]
    fn lesser_violations_do_not_block() {
        let sanitizer = InputSanitizer::default();
        let input = json!({"template": "hello ${name}"});
        let violations = sanitizer.inspect(&input);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, Severity::Low);
        assert!(!sanitizer.is_blocking(&violations[0]));
    }

    #[test]
    fn excessive_nesting_is_critical() {
        let sanitizer = InputSanitizer::new(SecurityPolicy {
            max_depth: 2,
            ..Default::default()
        });
        let input = json!({"a": {"b": {"c": {"d": 1}}}});
        let violations = sanitizer.inspect(&input);
        assert!(violations.iter().any(|v| v.label == "nesting too deep"));
    }

    #[test]
    fn long_string_is_medium() {
        let sanitizer = InputSanitizer::new(SecurityPolicy {
            max_string_length: 8,
            ..Default::default()
        });
        let violations = sanitizer.inspect(&json!({"text": "x".repeat(9)}));
        assert_eq!(violations[0].label, "string too long");
        assert_eq!(violations[0].severity, Severity::Medium);
    }

    #[test]
    fn size_ceiling() {
        let sanitizer = InputSanitizer::new(SecurityPolicy {
            max_input_bytes: 16,
            ..Default::default()
        });
        assert!(sanitizer.check_size(&json!({"a": 1})).is_ok());
        let (size, max) = sanitizer
            .check_size(&json!({"a": "0123456789abcdef"}))
            .unwrap_err();
        assert!(size > max);
        assert_eq!(max, 16);
    }

    #[test]
    fn block_threshold_is_configurable() {
        let sanitizer = InputSanitizer::new(SecurityPolicy {
            block_at: Severity::High,
            ..Default::default()
        });
        let violations = sanitizer.inspect(&json!({"html": "<script>alert(1)</script>"}));
        assert!(sanitizer.is_blocking(&violations[0]));
    }
}
