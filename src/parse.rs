//! Env DSL Parser (C2). Translates a container's environment variables into a
//! set of named log-source options. Grounded in `pilot/discovery/parse.go`'s
//! `parseLogsEnv` / `logOptionsSet.insert`.

use crate::model::LogFormat;
use std::collections::BTreeMap;

/// Suffixes that flow through as input-options rather than setting `source`.
/// `format` is matched too but is a switch, not an input-option (section 4.2).
const VALID_OPTIONS: [&str; 3] = ["multiline_pattern", "include_lines", "exclude_lines"];

/// Options accumulated for one named log source.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub name: String,
    pub source: String,
    pub format: LogFormat,
    pub input_options: BTreeMap<String, String>,
}

impl LogOptions {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source: String::new(),
            format: LogFormat::Plain,
            input_options: BTreeMap::new(),
        }
    }
}

/// Splits `key` into `(name, opt)` given the effective list of prefixes.
/// Returns `("", "")` if no prefix matches. Preserves the documented
/// ambiguity: a source legitimately named e.g. `foo_include_lines` is
/// unreachable, because the suffix match is tried before anything else.
pub fn parse_logs_env(prefixes: &[String], key: &str) -> (String, String) {
    let prefix = match prefixes.iter().find(|p| key.starts_with(p.as_str())) {
        Some(p) => p,
        None => return (String::new(), String::new()),
    };
    let rest = &key[prefix.len()..];
    for opt in VALID_OPTIONS.iter() {
        let suffix = format!("_{}", opt);
        if let Some(name) = rest.strip_suffix(suffix.as_str()) {
            return (name.to_string(), opt.to_string());
        }
    }
    (rest.to_string(), String::new())
}

/// Aggregates `(name, opt, value)` triples into a `name -> LogOptions` map
/// (section 4.2 "Semantics of aggregation").
#[derive(Debug, Default)]
struct LogOptionsSet(BTreeMap<String, LogOptions>);

impl LogOptionsSet {
    fn insert(&mut self, name: &str, opt: &str, value: &str) {
        let entry = self
            .0
            .entry(name.to_string())
            .or_insert_with(|| LogOptions::new(name));

        if opt.is_empty() {
            entry.source = value.to_string();
            return;
        }

        if opt == "format" {
            entry.format = if value == "json" {
                LogFormat::Json
            } else {
                LogFormat::Plain
            };
            return;
        }

        entry.input_options.insert(opt.to_string(), value.to_string());
    }
}

/// Builds the `name -> LogOptions` map for one container given its env vars
/// (as `KEY=VALUE` strings, the shape the container runtime hands back),
/// the effective log prefixes, and its legacy log sources (used only when no
/// env-derived entry exists at all).
///
/// Deterministic regardless of iteration order over `env` (P4): aggregation
/// is keyed by name in a `BTreeMap`, and env vars are applied independently
/// of each other (last-wins is not possible: each `(name, opt)` pair maps to
/// exactly one field).
pub fn build_log_options(
    prefixes: &[String],
    env: &[String],
    legacy_log_sources: &[String],
) -> BTreeMap<String, LogOptions> {
    let mut set = LogOptionsSet::default();
    let mut any_log_env_set = false;

    for kv in env {
        let (key, value) = match kv.split_once('=') {
            Some(pair) => pair,
            None => continue,
        };
        let (name, opt) = parse_logs_env(prefixes, key);
        if name.is_empty() && opt.is_empty() {
            continue;
        }
        any_log_env_set = true;
        set.insert(&name, &opt, value);
    }

    if !set.0.contains_key("stdout") {
        let mut stdout = LogOptions::new("stdout");
        stdout.source = "true".to_string();
        stdout.format = LogFormat::Json;
        set.0.insert("stdout".to_string(), stdout);
    }

    if !any_log_env_set && !legacy_log_sources.is_empty() {
        for (i, source) in legacy_log_sources.iter().enumerate() {
            let name = format!("legacy_{}", i);
            let mut opts = LogOptions::new(&name);
            opts.source = source.clone();
            set.0.insert(name, opts);
        }
    }

    set.0.retain(|name, opts| {
        if name.is_empty() {
            return false;
        }
        if name == "stdout" && opts.source != "true" {
            return false;
        }
        true
    });

    set.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixes(p: &str) -> Vec<String> {
        vec![p.to_string()]
    }

    #[test]
    fn parse_logs_env_matches_original_test_cases() {
        let p = prefixes("sn_log_");
        assert_eq!(
            parse_logs_env(&p, "sn_log_foo_bar"),
            ("foo_bar".to_string(), "".to_string())
        );
        assert_eq!(
            parse_logs_env(&p, "sn_log_foo_bar_filter"),
            // "filter" is not a recognized opt suffix, so it's part of the name.
            ("foo_bar_filter".to_string(), "".to_string())
        );
        assert_eq!(
            parse_logs_env(&p, "aaaa"),
            ("".to_string(), "".to_string())
        );
    }

    #[test]
    fn parse_logs_env_recognizes_valid_option_suffixes() {
        let p = prefixes("log_");
        assert_eq!(
            parse_logs_env(&p, "log_access_include_lines"),
            ("access".to_string(), "include_lines".to_string())
        );
    }

    #[test]
    fn default_stdout_entry_is_injected() {
        let opts = build_log_options(&prefixes("log_"), &[], &[]);
        let stdout = &opts["stdout"];
        assert_eq!(stdout.source, "true");
        assert_eq!(stdout.format, LogFormat::Json);
    }

    #[test]
    fn stdout_suppressed_when_explicitly_false() {
        let env = vec!["log_stdout=false".to_string()];
        let opts = build_log_options(&prefixes("log_"), &env, &[]);
        assert!(!opts.contains_key("stdout"));
    }

    #[test]
    fn env_file_source_with_include_lines() {
        let env = vec![
            "caicloud_log_access=/opt/tomcat/access.log".to_string(),
            "caicloud_log_access_include_lines=ERROR".to_string(),
        ];
        let opts = build_log_options(&prefixes("caicloud_log_"), &env, &[]);
        let access = &opts["access"];
        assert_eq!(access.source, "/opt/tomcat/access.log");
        assert_eq!(access.input_options["include_lines"], "ERROR");
        assert_eq!(access.format, LogFormat::Plain);
        assert!(opts.contains_key("stdout"));
    }

    #[test]
    fn format_switch_does_not_set_source() {
        let env = vec![
            "log_foo=/a/b.log".to_string(),
            "log_foo_format=json".to_string(),
        ];
        let opts = build_log_options(&prefixes("log_"), &env, &[]);
        let foo = &opts["foo"];
        assert_eq!(foo.source, "/a/b.log");
        assert_eq!(foo.format, LogFormat::Json);
    }

    #[test]
    fn legacy_sources_only_used_when_no_env_derived_entries() {
        let legacy = vec!["/var/log/a.log".to_string(), "/var/log/b.log".to_string()];
        let opts = build_log_options(&prefixes("log_"), &[], &legacy);
        assert_eq!(opts["legacy_0"].source, "/var/log/a.log");
        assert_eq!(opts["legacy_1"].source, "/var/log/b.log");

        let env = vec!["log_foo=/a.log".to_string()];
        let opts = build_log_options(&prefixes("log_"), &env, &legacy);
        assert!(!opts.contains_key("legacy_0"));
    }

    #[test]
    fn deterministic_regardless_of_env_order() {
        let env_a = vec![
            "log_foo=/a.log".to_string(),
            "log_foo_include_lines=X".to_string(),
        ];
        let env_b = vec![
            "log_foo_include_lines=X".to_string(),
            "log_foo=/a.log".to_string(),
        ];
        let a = build_log_options(&prefixes("log_"), &env_a, &[]);
        let b = build_log_options(&prefixes("log_"), &env_b, &[]);
        assert_eq!(a["foo"].source, b["foo"].source);
        assert_eq!(a["foo"].input_options, b["foo"].input_options);
    }
}
