//! Extraction adapter.
//!
//! Builds a field-extraction instruction from a flow schema, calls the language model with the
//! conversation history and turns its reply into `{done, message, collected}`. Replies that are
//! not JSON, or JSON without the required shape, are reported as `ExtractionError` so the turn
//! can re-prompt instead of failing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use concierge_core::domain::session::ChatMessage;
use concierge_core::domain::slots::{GroupKey, SlotRecord};
use concierge_core::slots::FlowSchema;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::llm::{LlmClient, LlmError};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtractionResult {
    pub done: bool,
    /// Shown to the user on every turn, complete or not.
    pub message: String,
    pub collected: BTreeMap<GroupKey, SlotRecord>,
}

impl ExtractionResult {
    pub fn group(&self, group: GroupKey) -> Option<&SlotRecord> {
        self.collected.get(&group)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("model output is not a JSON object: {0}")]
    Malformed(String),
    #[error("model output does not match the extraction format: {0}")]
    Schema(String),
}

/// Renders the system instruction for one extraction call. Only groups listed as targets are
/// requested; values already known are listed so the model does not ask for them again.
pub struct InstructionBuilder<'a> {
    schema: &'a FlowSchema,
    targets: Vec<GroupKey>,
    known: BTreeMap<GroupKey, SlotRecord>,
    context: Option<String>,
}

impl<'a> InstructionBuilder<'a> {
    pub fn new(schema: &'a FlowSchema, targets: Vec<GroupKey>) -> Self {
        Self { schema, targets, known: BTreeMap::new(), context: None }
    }

    pub fn known(mut self, group: GroupKey, record: &SlotRecord) -> Self {
        if !record.is_empty() {
            self.known.insert(group, record.clone());
        }
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn build(&self) -> String {
        let mut out = String::new();
        out.push_str("You are a helpful assistant booking airport lounge access.\n\n");
        out.push_str(self.schema.goal);
        out.push_str("\n\n");

        if let Some(context) = &self.context {
            out.push_str(context);
            out.push_str("\n\n");
        }

        out.push_str("Extract these fields from the conversation when the customer provided them:\n");
        for group in &self.targets {
            let Some(fields) = self.schema.fields(*group) else {
                continue;
            };
            out.push_str(&format!("- group \"{}\":\n", group.as_str()));
            for field in fields {
                out.push_str(&format!("  - {}: {}\n", field.name, field.hint));
            }
        }

        if !self.known.is_empty() {
            out.push_str("\nAlready known, do not ask for these again:\n");
            for (group, record) in &self.known {
                let values: Vec<String> =
                    record.iter().map(|(name, value)| format!("{name}={}", display_value(value))).collect();
                out.push_str(&format!("- {}: {}\n", group.as_str(), values.join(", ")));
            }
        }

        out.push_str("\nRespond with a single JSON object in exactly this format:\n");
        out.push_str(&self.format_example());
        out.push_str(
            "\n\nRules:\n\
             - Output raw JSON only. No markdown, no code fences, no text around the object.\n\
             - Set \"done\" to true only when every listed field has a value from the customer.\n\
             - \"message\" is shown to the customer: confirm what you understood and ask only for \
             what is still missing.\n\
             - Leave out any field the customer has not given. Never guess values.\n\
             - You may fix obvious spelling and formatting mistakes in values.",
        );
        out
    }

    fn format_example(&self) -> String {
        let mut collected = Map::new();
        for group in &self.targets {
            let Some(fields) = self.schema.fields(*group) else {
                continue;
            };
            let record: Map<String, Value> = fields
                .iter()
                .map(|field| (field.name.to_owned(), Value::String(field.hint.to_owned())))
                .collect();
            collected.insert(group.as_str().to_owned(), Value::Object(record));
        }
        let example = serde_json::json!({
            "done": "boolean",
            "message": "string",
            "collected": collected,
        });
        serde_json::to_string_pretty(&example).unwrap_or_default()
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub struct ExtractionAdapter {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl ExtractionAdapter {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Calls the model with the instruction as system message followed by the history.
    pub async fn extract(
        &self,
        history: &[ChatMessage],
        instruction: &str,
        schema: &FlowSchema,
    ) -> Result<ExtractionResult, ExtractionError> {
        let raw = self.complete(history, instruction).await?;
        parse_extraction(&raw, schema)
    }

    /// Free-text completion without the extraction contract.
    pub async fn complete(
        &self,
        history: &[ChatMessage],
        instruction: &str,
    ) -> Result<String, ExtractionError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(instruction));
        messages.extend(history.iter().cloned());

        match tokio::time::timeout(self.timeout, self.llm.invoke(&messages)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ExtractionError::Llm(LlmError::Timeout(self.timeout.as_secs()))),
        }
    }
}

/// Parses a model reply. Tolerates code fences and chatter around the JSON object. Fields the
/// schema does not declare are dropped, as are `null` values.
pub fn parse_extraction(raw: &str, schema: &FlowSchema) -> Result<ExtractionResult, ExtractionError> {
    let object = locate_object(raw)?;

    let done = match object.get("done") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) if text.eq_ignore_ascii_case("true") => true,
        Some(Value::String(text)) if text.eq_ignore_ascii_case("false") => false,
        Some(other) => return Err(ExtractionError::Schema(format!("`done` must be a boolean, got {other}"))),
        None => return Err(ExtractionError::Schema("missing `done`".to_owned())),
    };
    let message = match object.get("message") {
        Some(Value::String(text)) => text.trim().to_owned(),
        Some(other) => {
            return Err(ExtractionError::Schema(format!("`message` must be a string, got {other}")))
        }
        None => return Err(ExtractionError::Schema("missing `message`".to_owned())),
    };

    let mut collected = BTreeMap::new();
    match object.get("collected") {
        Some(Value::Object(fields)) => route_fields(fields, None, schema, &mut collected),
        Some(Value::Null) | None => {}
        Some(other) => {
            return Err(ExtractionError::Schema(format!(
                "`collected` must be an object, got {other}"
            )))
        }
    }
    let top_level: Map<String, Value> = object
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "done" | "message" | "collected"))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    route_fields(&top_level, None, schema, &mut collected);

    collected.retain(|_, record: &mut SlotRecord| !record.is_empty());
    Ok(ExtractionResult { done, message, collected })
}

fn locate_object(raw: &str) -> Result<Map<String, Value>, ExtractionError> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(ExtractionError::Malformed(preview(raw)));
    };
    if end < start {
        return Err(ExtractionError::Malformed(preview(raw)));
    }
    match serde_json::from_str::<Value>(&raw[start..=end]) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) | Err(_) => Err(ExtractionError::Malformed(preview(raw))),
    }
}

fn preview(raw: &str) -> String {
    raw.chars().take(120).collect()
}

/// Places each value in the group that declares it. Nested objects named after a group are
/// routed into that group, so `{"A": {"tickets": {...}}}` fills both `A` and `tickets`.
fn route_fields(
    fields: &Map<String, Value>,
    owner: Option<GroupKey>,
    schema: &FlowSchema,
    collected: &mut BTreeMap<GroupKey, SlotRecord>,
) {
    for (name, value) in fields {
        if value.is_null() {
            continue;
        }
        if let Value::Object(nested) = value {
            match GroupKey::parse(name).filter(|group| schema.declares(*group)) {
                Some(group) => route_fields(nested, Some(group), schema, collected),
                None => debug!(field = %name, "dropping undeclared nested object from extraction"),
            }
            continue;
        }
        let declared_by_owner = owner
            .and_then(|group| schema.fields(group))
            .is_some_and(|specs| specs.iter().any(|spec| spec.name == name));
        let group = if declared_by_owner { owner } else { schema.group_of_field(name) };
        match group {
            Some(group) => collected.entry(group).or_insert_with(SlotRecord::new).insert(name.clone(), value.clone()),
            None => debug!(field = %name, "dropping undeclared field from extraction"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use concierge_core::domain::session::ChatMessage;
    use concierge_core::domain::slots::{GroupKey, SlotRecord};
    use concierge_core::slots::{FlowKind, SlotSchemaRegistry};

    use super::{parse_extraction, ExtractionAdapter, ExtractionError, InstructionBuilder};
    use crate::llm::LlmError;
    use crate::sandbox::ScriptedLlm;

    #[test]
    fn nested_ticket_object_is_routed_to_its_own_group() {
        let registry = SlotSchemaRegistry::standard();
        let schema = registry.describe(FlowKind::BundleItinerary).expect("schema");
        let raw = r#"{"done": false, "message": "Thanks! What about departure?",
            "collected": {"productid": "ARRIVALBUNDLE",
              "A": {"direction": "A", "airportid": "NMIA", "traveldate": "20301201",
                    "flightId": "AC920", "tickets": {"adulttickets": 2, "childtickets": null}}}}"#;

        let result = parse_extraction(raw, schema).expect("parse");

        assert!(!result.done);
        assert_eq!(result.message, "Thanks! What about departure?");
        let arrival = result.group(GroupKey::Arrival).expect("arrival group");
        assert_eq!(arrival.get_str("flightId"), Some("AC920"));
        assert!(!arrival.contains("direction"));
        let tickets = result.group(GroupKey::Tickets).expect("tickets group");
        assert_eq!(tickets.get_u32("adulttickets"), Some(2));
        assert!(!tickets.contains("childtickets"));
        assert!(result.group(GroupKey::Product).is_none());
    }

    #[test]
    fn top_level_group_and_code_fences_are_tolerated() {
        let registry = SlotSchemaRegistry::standard();
        let schema = registry.describe(FlowKind::Contact).expect("schema");
        let raw = "```json\n{\"done\": true, \"message\": \"Got it.\", \"contact\": {\"title\": \"MR\", \
                   \"firstname\": \"Ada\", \"lastname\": \"Lovelace\", \"email\": \"ada@example.com\", \
                   \"phone\": \"8765551234\"}}\n```";

        let result = parse_extraction(raw, schema).expect("parse");

        assert!(result.done);
        assert_eq!(result.group(GroupKey::Contact).map(SlotRecord::len), Some(5));
    }

    #[test]
    fn flat_fields_are_mapped_through_the_schema() {
        let registry = SlotSchemaRegistry::standard();
        let schema = registry.describe(FlowKind::Product).expect("schema");

        let result = parse_extraction(
            r#"{"done": true, "message": "Arrival it is.", "collected": {"productid": "ARRIVALONLY"}}"#,
            schema,
        )
        .expect("parse");

        assert_eq!(
            result.group(GroupKey::Product).and_then(|record| record.get_str("productid")),
            Some("ARRIVALONLY")
        );
    }

    #[test]
    fn prose_reply_is_malformed_and_missing_done_is_a_schema_error() {
        let registry = SlotSchemaRegistry::standard();
        let schema = registry.describe(FlowKind::Intent).expect("schema");

        assert!(matches!(
            parse_extraction("booking", schema),
            Err(ExtractionError::Malformed(_))
        ));
        assert!(matches!(
            parse_extraction(r#"{"message": "hi"}"#, schema),
            Err(ExtractionError::Schema(_))
        ));
        assert!(matches!(
            parse_extraction(r#"{"done": "maybe", "message": "hi"}"#, schema),
            Err(ExtractionError::Schema(_))
        ));
    }

    #[test]
    fn instruction_lists_targets_known_values_and_format() {
        let registry = SlotSchemaRegistry::standard();
        let schema = registry.describe(FlowKind::BundleItinerary).expect("schema");
        let known = SlotRecord::new().with("adulttickets", 2).with("childtickets", 0);

        let instruction = InstructionBuilder::new(schema, vec![GroupKey::Departure])
            .known(GroupKey::Tickets, &known)
            .build();

        assert!(instruction.contains("group \"D\""));
        assert!(instruction.contains("flightId"));
        assert!(!instruction.contains("group \"A\""));
        assert!(instruction.contains("tickets: adulttickets=2, childtickets=0"));
        assert!(instruction.contains("raw JSON only"));
    }

    #[tokio::test]
    async fn adapter_sends_instruction_before_history() {
        let llm = Arc::new(ScriptedLlm::new([r#"{"done": true, "message": "ok", "flow": "booking"}"#]));
        let adapter = ExtractionAdapter::new(llm.clone(), Duration::from_secs(5));
        let registry = SlotSchemaRegistry::standard();
        let schema = registry.describe(FlowKind::Intent).expect("schema");

        let result = adapter
            .extract(&[ChatMessage::user("I want to book a lounge")], "classify", schema)
            .await
            .expect("extract");

        assert_eq!(
            result.group(GroupKey::Flow).and_then(|record| record.get_str("flow")),
            Some("booking")
        );
        let calls = llm.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], ChatMessage::system("classify"));
        assert_eq!(calls[0][1], ChatMessage::user("I want to book a lounge"));
    }

    #[tokio::test]
    async fn model_failures_surface_as_extraction_errors() {
        let llm = Arc::new(ScriptedLlm::default());
        llm.push_error(LlmError::Status { status: 500, body: "boom".to_string() });
        let adapter = ExtractionAdapter::new(llm, Duration::from_secs(5));
        let registry = SlotSchemaRegistry::standard();
        let schema = registry.describe(FlowKind::Intent).expect("schema");

        let error = adapter.extract(&[], "classify", schema).await.expect_err("must fail");
        assert!(matches!(error, ExtractionError::Llm(LlmError::Status { status: 500, .. })));
    }
}
