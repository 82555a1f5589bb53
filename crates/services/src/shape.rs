//! Declarative result shaping, the one place responses are reshaped.
//!
//! Some wrapped endpoints return raw arrays from their list operations
//! while task code expects the object shape `{key: [...]}`. Which methods
//! get wrapped, and under which key, is a config table; everything else
//! propagates byte-transparent.

use config::{settings, ShapeRule};
use serde_json::Value;

/// Apply the configured rules for this service/method to a success value.
pub fn apply(service: &str, method: &str, value: Value) -> Value {
    apply_rules(&settings().shaping, service, method, value)
}

pub fn apply_rules(rules: &[ShapeRule], service: &str, method: &str, value: Value) -> Value {
    if !value.is_array() {
        return value;
    }

    for rule in rules {
        if rule.service == service && method.ends_with(&rule.method_suffix) {
            let mut wrapped = serde_json::Map::new();
            wrapped.insert(rule.wrap_key.clone(), value);
            return Value::Object(wrapped);
        }
    }

    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rules() -> Vec<ShapeRule> {
        vec![
            ShapeRule {
                service: "registry".into(),
                method_suffix: "domains/list".into(),
                wrap_key: "domains".into(),
            },
            ShapeRule {
                service: "search".into(),
                method_suffix: "/list".into(),
                wrap_key: "items".into(),
            },
        ]
    }

    #[test]
    fn listed_methods_wrap_raw_arrays() {
        let out = apply_rules(
            &rules(),
            "registry",
            "v1/domains/list",
            json!(["a.test", "b.test"]),
        );
        assert_eq!(out, json!({"domains": ["a.test", "b.test"]}));
    }

    #[test]
    fn non_array_responses_are_untouched_even_on_listed_methods() {
        let body = json!({"domains": ["a.test"]});
        let out = apply_rules(&rules(), "registry", "v1/domains/list", body.clone());
        assert_eq!(out, body, "already-shaped responses must not be re-wrapped");
    }

    #[test]
    fn unlisted_methods_and_services_pass_arrays_through() {
        let arr = json!([1, 2, 3]);
        assert_eq!(
            apply_rules(&rules(), "registry", "v1/domains/create", arr.clone()),
            arr
        );
        assert_eq!(apply_rules(&rules(), "mail", "v1/list", arr.clone()), arr);
    }
}
