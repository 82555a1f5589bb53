//! Produce a research brief through a nested task, then mail it.
//!
//! The sub-task goes through the code service like any other external
//! call, so its whole chain runs out-of-band and this task only resumes
//! once the brief is final.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stacker::prelude::*;

stacker::mark_task!(SendReport);
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendReport {
    pub recipient: String,
    pub topic: String,
}

impl TaskCode for SendReport {
    fn run(&mut self, context: &Context) -> Result<Value, TaskError> {
        let brief = context.call_host_tool(
            "code",
            "execute",
            json!(["research_brief", { "topic": self.topic }]),
        )?;

        let subject = format!("Research brief: {}", self.topic);

        let delivery = context.call_host_tool(
            "mail",
            "v1/messages/send",
            json!([{
                "to": self.recipient,
                "subject": subject,
                "body": brief.get("summary").cloned().unwrap_or(Value::Null),
            }]),
        )?;

        Ok(json!({ "delivered": true, "receipt": delivery }))
    }

    fn identifier() -> TaskIdentifier {
        TaskIdentifier::named("send_report").versioned(1)
    }
}
