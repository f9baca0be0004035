//! Placeholder and template-variable substitution.
//!
//! Macro placeholders (`"$from"`, `"$to"`, `"$__from_oid"`, `"$__to_oid"`,
//! `"$dateBucketCount"`) are rewritten first, and only then are the remaining
//! `$name` / `${name}` / `[[name]]` references handed to the template service.
//! A caller variable therefore never shadows a macro.

use crate::{
    models::QueryTarget,
    time::{bucket_count, date_to_extended_json, epoch_ms_to_object_id_hex, OidPadding},
};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::HashMap;

pub type Variables = HashMap<String, Value>;

const FROM_VAR: &str = "__from";
const TO_VAR: &str = "__to";
const INTERVAL_MS_VAR: &str = "__interval_ms";

/// Names owned by the macro passes; caller variables with these names are
/// never substituted.
const MACRO_NAMES: [&str; 5] = ["from", "to", "dateBucketCount", "__from_oid", "__to_oid"];

static VARIABLE_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(\w+)|\[\[(\w+?)(?::(\w+))?\]\]|\$\{(\w+)(?::([^}]+))?\}")
        .expect("variable reference pattern must compile")
});

/// Host templating service: literal substitution of variable references.
/// Must be total; unknown names are left untouched.
pub trait TemplateSrv: Send + Sync {
    fn replace(&self, text: &str, variables: &Variables) -> String;
}

/// Default template service understanding `$name`, `${name}`,
/// `${name:format}` and `[[name]]`. Bare `$name` is skipped where it is an
/// object key.
#[derive(Debug, Clone, Copy, Default)]
pub struct VariableInterpolator;

impl TemplateSrv for VariableInterpolator {
    fn replace(&self, text: &str, variables: &Variables) -> String {
        if variables.is_empty() || !(text.contains('$') || text.contains('[')) {
            return text.to_string();
        }

        VARIABLE_REF
            .replace_all(text, |caps: &Captures<'_>| {
                let (name, format) = if let Some(name) = caps.get(1) {
                    if is_object_key(&text[name.end()..]) {
                        return caps[0].to_string();
                    }
                    (name.as_str(), None)
                } else if let Some(name) = caps.get(2) {
                    (name.as_str(), caps.get(3).map(|m| m.as_str()))
                } else if let Some(name) = caps.get(4) {
                    (name.as_str(), caps.get(5).map(|m| m.as_str()))
                } else {
                    return caps[0].to_string();
                };

                match variables.get(name) {
                    Some(value) => format_value(value, format),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

/// Bare `$name` in key position is an operator (`"$limit":`, `$match:`),
/// never a variable reference.
fn is_object_key(rest: &str) -> bool {
    let rest = rest
        .strip_prefix('"')
        .or_else(|| rest.strip_prefix('\''))
        .unwrap_or(rest);
    rest.trim_start().starts_with(':')
}

fn format_value(value: &Value, format: Option<&str>) -> String {
    match format {
        Some("json") => value.to_string(),
        Some("csv") => join_values(value, ","),
        Some("pipe") => join_values(value, "|"),
        Some("doublequote") => map_join(value, |item| format!("\"{item}\"")),
        Some("singlequote") => map_join(value, |item| format!("'{item}'")),
        _ => join_values(value, ","),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(_) | Value::Number(_) | Value::Object(_) | Value::Array(_) => {
            value.to_string()
        }
    }
}

fn join_values(value: &Value, separator: &str) -> String {
    match value {
        Value::Array(items) => items
            .iter()
            .map(scalar_text)
            .collect::<Vec<_>>()
            .join(separator),
        other => scalar_text(other),
    }
}

fn map_join(value: &Value, wrap: impl Fn(&str) -> String) -> String {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| wrap(&scalar_text(item)))
            .collect::<Vec<_>>()
            .join(","),
        other => wrap(&scalar_text(other)),
    }
}

/// Time bounds and interval a target's placeholders resolve against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacroContext {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub interval_ms: Option<i64>,
}

impl MacroContext {
    /// Resolves `$__from` / `$__to` for a target. An explicit `__from` /
    /// `__to` variable wins over the time range; a bound that resolves to
    /// nothing numeric stays unset and its macros become no-ops.
    pub fn for_target(target: &QueryTarget) -> Self {
        let from = target
            .variables
            .get(FROM_VAR)
            .map(as_epoch_ms)
            .unwrap_or_else(|| target.range.map(|range| range.from));
        let to = target
            .variables
            .get(TO_VAR)
            .map(as_epoch_ms)
            .unwrap_or_else(|| target.range.map(|range| range.to));
        let interval_ms = target
            .interval_ms
            .or_else(|| target.variables.get(INTERVAL_MS_VAR).and_then(as_epoch_ms))
            .filter(|interval| *interval > 0);

        Self {
            from,
            to,
            interval_ms,
        }
    }
}

fn as_epoch_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|ms| ms.trunc() as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Rewrites the quoted macro placeholders.
pub fn apply_macros(text: &str, ctx: &MacroContext) -> String {
    let mut text = text.to_string();

    if let Some(from) = ctx.from {
        text = text.replace("\"$from\"", &date_to_extended_json(from));
        text = text.replace(
            "\"$__from_oid\"",
            &format!("\"{}\"", epoch_ms_to_object_id_hex(from, OidPadding::Lower)),
        );
    }

    if let Some(to) = ctx.to {
        text = text.replace("\"$to\"", &date_to_extended_json(to));
        text = text.replace(
            "\"$__to_oid\"",
            &format!("\"{}\"", epoch_ms_to_object_id_hex(to, OidPadding::Upper)),
        );
    }

    if let (Some(from), Some(to), Some(interval)) = (ctx.from, ctx.to, ctx.interval_ms) {
        text = text.replace(
            "\"$dateBucketCount\"",
            &bucket_count(from, to, interval).to_string(),
        );
    }

    text
}

/// Caller variables plus the built-in `__from`, `__to` and `__interval_ms`.
pub fn scoped_variables(target: &QueryTarget, ctx: &MacroContext) -> Variables {
    let mut scoped = target.variables.clone();
    if let Some(from) = ctx.from {
        scoped.insert(FROM_VAR.to_string(), Value::from(from));
    }
    if let Some(to) = ctx.to {
        scoped.insert(TO_VAR.to_string(), Value::from(to));
    }
    if let Some(interval) = ctx.interval_ms {
        scoped.insert(INTERVAL_MS_VAR.to_string(), Value::from(interval));
    }
    scoped
}

fn without_macro_names(mut variables: Variables) -> Variables {
    for name in MACRO_NAMES {
        variables.remove(name);
    }
    variables
}

/// Full substitution of a canonical pipeline: macros, then template variables.
/// Macro names are never handed to the template service, even when their
/// bound is unresolved.
pub fn substitute(text: &str, target: &QueryTarget, templates: &dyn TemplateSrv) -> String {
    let ctx = MacroContext::for_target(target);
    let expanded = apply_macros(text, &ctx);
    templates.replace(&expanded, &without_macro_names(scoped_variables(target, &ctx)))
}

/// Textual pass over a script before it is evaluated. Only template variables
/// are touched; macro placeholders are left for the post-evaluation pass.
pub fn interpolate_script(script: &str, target: &QueryTarget, templates: &dyn TemplateSrv) -> String {
    let ctx = MacroContext::for_target(target);
    templates.replace(script, &without_macro_names(scoped_variables(target, &ctx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueryLanguage;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn target(text: &str) -> QueryTarget {
        QueryTarget::new("A", QueryLanguage::Json, text)
    }

    #[test]
    fn legacy_date_placeholders_become_extended_json() {
        let t = target("").with_range(1_000, 2_000);
        let out = substitute(
            r#"[{"$match":{"ts":{"$gte":"$from","$lt":"$to"}}}]"#,
            &t,
            &VariableInterpolator,
        );
        assert_eq!(
            out,
            r#"[{"$match":{"ts":{"$gte":{"$date":{"$numberLong":"1000"}},"$lt":{"$date":{"$numberLong":"2000"}}}}}]"#
        );
    }

    #[test]
    fn object_id_placeholders_use_lower_and_upper_padding() {
        let t = target("").with_range(1_700_000_000_500, 1_700_000_060_000);
        let out = substitute(
            r#"[{"$match":{"_id":{"$gte":{"$oid":"$__from_oid"},"$lt":{"$oid":"$__to_oid"}}}}]"#,
            &t,
            &VariableInterpolator,
        );
        let from_hex = format!("{:x}0000000000000000", 1_700_000_000u64);
        let to_hex = format!("{:x}ffffffffffffffff", 1_700_000_060u64);
        assert!(out.contains(&format!("\"$gte\":{{\"$oid\":\"{from_hex}\"}}")), "{out}");
        assert!(out.contains(&format!("\"$lt\":{{\"$oid\":\"{to_hex}\"}}")), "{out}");
    }

    #[test]
    fn bucket_count_needs_interval_and_both_bounds() {
        let text = r#"[{"$bucketAuto":{"groupBy":"$ts","buckets":"$dateBucketCount"}}]"#;

        let with_interval = target("").with_range(0, 10_000).with_interval(3_000);
        assert_eq!(
            substitute(text, &with_interval, &VariableInterpolator),
            r#"[{"$bucketAuto":{"groupBy":"$ts","buckets":4}}]"#
        );

        let without_interval = target("").with_range(0, 10_000);
        assert_eq!(substitute(text, &without_interval, &VariableInterpolator), text);

        let from_variable = target("")
            .with_range(0, 10_000)
            .with_variable("__interval_ms", "1000");
        assert_eq!(
            substitute(text, &from_variable, &VariableInterpolator),
            r#"[{"$bucketAuto":{"groupBy":"$ts","buckets":10}}]"#
        );
    }

    #[test]
    fn missing_bounds_leave_macros_in_place() {
        let text = r#"[{"$match":{"ts":{"$gte":"$from"},"_id":{"$lt":"$__to_oid"}}}]"#;
        assert_eq!(substitute(text, &target(""), &VariableInterpolator), text);

        let shadowing = target("").with_variable("from", "shadow");
        assert_eq!(substitute(text, &shadowing, &VariableInterpolator), text);
    }

    #[test]
    fn explicit_bound_variables_override_range() {
        let t = target("")
            .with_range(1_000, 2_000)
            .with_variable("__from", "5000");
        let ctx = MacroContext::for_target(&t);
        assert_eq!(ctx.from, Some(5_000));
        assert_eq!(ctx.to, Some(2_000));

        let unresolved = target("").with_variable("__to", "$__to");
        assert_eq!(MacroContext::for_target(&unresolved).to, None);
    }

    #[test]
    fn macros_are_not_shadowed_by_caller_variables() {
        let t = target("")
            .with_range(1_000, 2_000)
            .with_variable("from", "shadow")
            .with_variable("dateBucketCount", 99);
        let out = substitute(r#"[{"$match":{"ts":{"$gte":"$from"}}}]"#, &t, &VariableInterpolator);
        assert_eq!(
            out,
            r#"[{"$match":{"ts":{"$gte":{"$date":{"$numberLong":"1000"}}}}}]"#
        );
    }

    #[test]
    fn template_variables_support_common_syntaxes() {
        let t = target("")
            .with_variable("region", "eu-west")
            .with_variable("limit", 25)
            .with_variable("hosts", json!(["a", "b"]));
        let out = substitute(
            r#"[{"$match":{"region":"$region","hosts":{"$in":[${hosts:doublequote}]},"alt":"[[region]]"}},{"$limit":${limit}}]"#,
            &t,
            &VariableInterpolator,
        );
        assert_eq!(
            out,
            r#"[{"$match":{"region":"eu-west","hosts":{"$in":["a","b"]},"alt":"eu-west"}},{"$limit":25}]"#
        );
    }

    #[test]
    fn json_format_serializes_values() {
        let vars: Variables = [("hosts".to_string(), json!(["a", "b"]))].into_iter().collect();
        assert_eq!(
            VariableInterpolator.replace("${hosts:json}", &vars),
            r#"["a","b"]"#
        );
        assert_eq!(VariableInterpolator.replace("${hosts:pipe}", &vars), "a|b");
    }

    #[test]
    fn builtin_time_variables_are_substituted() {
        let t = target("").with_range(1_000, 2_000).with_interval(50);
        let out = substitute(
            r#"[{"$match":{"ts":{"$gte":"$__from","$lt":"${__to}"},"step":"[[__interval_ms]]"}}]"#,
            &t,
            &VariableInterpolator,
        );
        assert_eq!(
            out,
            r#"[{"$match":{"ts":{"$gte":"1000","$lt":"2000"},"step":"50"}}]"#
        );
    }

    #[test]
    fn unresolved_variables_are_left_verbatim() {
        let t = target("").with_variable("known", "x");
        let text = r#"[{"$match":{"a":"$unknown","b":"${missing}","c":"[[absent]]"}}]"#;
        assert_eq!(substitute(text, &t, &VariableInterpolator), text);
    }

    #[test]
    fn script_pass_skips_macro_names() {
        let t = target("")
            .with_range(1_000, 2_000)
            .with_variable("from", "shadow")
            .with_variable("service", "api");
        let script = r#"() => [{ $match: { svc: "$service", ts: { $gte: "$from" }, since: $__from } }]"#;
        assert_eq!(
            interpolate_script(script, &t, &VariableInterpolator),
            r#"() => [{ $match: { svc: "api", ts: { $gte: "$from" }, since: 1000 } }]"#
        );
    }

    #[test]
    fn operator_keys_survive_same_named_variables() {
        let t = target("")
            .with_variable("match", "x")
            .with_variable("limit", 10)
            .with_variable("sum", "total");
        let text = r#"[{"$match":{"a":"$sum"}},{"$group":{"_id":null,"n":{"$sum":1}}},{"$limit" : ${limit}}]"#;
        assert_eq!(
            substitute(text, &t, &VariableInterpolator),
            r#"[{"$match":{"a":"total"}},{"$group":{"_id":null,"n":{"$sum":1}}},{"$limit" : 10}]"#
        );

        let script = r#"() => [{ $match: { n: $limit } }, { '$limit': $limit }]"#;
        assert_eq!(
            interpolate_script(script, &t, &VariableInterpolator),
            r#"() => [{ $match: { n: 10 } }, { '$limit': 10 }]"#
        );
    }

    proptest! {
        #[test]
        fn substitution_without_placeholders_is_identity(text in r#"[\[\]{}a-z0-9":, ]{0,64}"#) {
            let t = target("")
                .with_range(1_000, 2_000)
                .with_interval(10)
                .with_variable("Host_1", "y");
            prop_assert_eq!(substitute(&text, &t, &VariableInterpolator), text);
        }

        #[test]
        fn substitution_is_idempotent(from in 0i64..4_000_000_000_000, span in 0i64..86_400_000) {
            let t = target("").with_range(from, from + span).with_interval(60_000);
            let text = r#"[{"$match":{"_id":{"$gte":{"$oid":"$__from_oid"}},"ts":{"$lt":"$to"}}},{"$limit":"$dateBucketCount"}]"#;
            let once = substitute(text, &t, &VariableInterpolator);
            let twice = substitute(&once, &t, &VariableInterpolator);
            prop_assert_eq!(once, twice);
        }
    }
}
