//! Search for a topic, then have the model service condense the hits into
//! a short brief. Two serial external calls; the second depends on the
//! first's output.

use common::prelude::tracing;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stacker::prelude::*;

stacker::mark_task!(ResearchBrief);
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResearchBrief {
    pub topic: String,
    /// How many search hits to hand the model. Defaults small; search
    /// endpoints charge per result.
    #[serde(default = "default_hit_count")]
    pub hit_count: usize,
}

fn default_hit_count() -> usize {
    5
}

impl TaskCode for ResearchBrief {
    fn run(&mut self, context: &Context) -> Result<Value, TaskError> {
        context.log(format!("researching {:?}", self.topic));

        let hits = context.call_host_tool(
            "search",
            "v1/web/list",
            json!([{ "query": self.topic, "count": self.hit_count }]),
        )?;

        // list operations arrive pre-shaped as {"items": [...]}
        let items = hits
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if items.is_empty() {
            tracing::debug!("no hits for topic {:?}", self.topic);
            return Ok(json!({ "topic": self.topic, "summary": Value::Null, "sources": [] }));
        }

        let summary = context.call_host_tool(
            "model",
            "v1/completions/create",
            json!([{
                "instruction": "Summarize these search results into a three-sentence brief.",
                "documents": items,
            }]),
        )?;

        let sources: Vec<Value> = items
            .iter()
            .filter_map(|i| i.get("url").cloned())
            .collect();

        Ok(json!({
            "topic": self.topic,
            "summary": summary,
            "sources": sources,
        }))
    }

    fn identifier() -> TaskIdentifier {
        TaskIdentifier::named("research_brief").versioned(1)
    }
}
