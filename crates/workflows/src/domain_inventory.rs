//! Count and classify the domains a registry endpoint knows about.
//! A deliberate failure-handling example: a missing registry is reported
//! as the task's own result rather than re-thrown.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stacker::prelude::*;

stacker::mark_task!(DomainInventory);
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DomainInventory {
    #[serde(default)]
    pub suffix_filter: Option<String>,
}

impl TaskCode for DomainInventory {
    fn run(&mut self, context: &Context) -> Result<Value, TaskError> {
        let listed = context.call_host_tool("registry", "v1/domains/list", json!([]));

        let domains = match listed {
            Ok(v) => v
                .get("domains")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            // a failed host call replays as an error this task chooses to
            // absorb; everything else (including the suspension sentinel)
            // must keep unwinding
            Err(TaskError::HostCall(e)) => {
                context.log(format!("registry unavailable: {e}"));
                return Ok(json!({ "available": false, "reason": e.to_string() }));
            }
            Err(other) => return Err(other),
        };

        let matching: Vec<&Value> = match &self.suffix_filter {
            None => domains.iter().collect(),
            Some(suffix) => domains
                .iter()
                .filter(|d| d.as_str().map(|s| s.ends_with(suffix)).unwrap_or(false))
                .collect(),
        };

        Ok(json!({
            "available": true,
            "total": domains.len(),
            "matching": matching.len(),
        }))
    }

    fn identifier() -> TaskIdentifier {
        TaskIdentifier::named("domain_inventory").versioned(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn suffix_filter_is_optional_on_the_wire() {
        let t: DomainInventory = serde_json::from_value(json!({})).unwrap();
        assert_eq!(t.suffix_filter, None);

        let t: DomainInventory =
            serde_json::from_value(json!({"suffix_filter": ".test"})).unwrap();
        assert_eq!(t.suffix_filter.as_deref(), Some(".test"));
    }
}
