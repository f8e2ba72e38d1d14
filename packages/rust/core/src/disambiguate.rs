//! LLM-assisted disambiguation pass.
//!
//! Asked only for fields that pattern extraction left empty, or whose top
//! candidates are tied. The model must answer with one JSON object keyed by
//! field name, `null` for anything it cannot find on the page. Answers are
//! parsed permissively but fail closed, and every value still goes through
//! the [`Validator`] before it becomes a candidate.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use recordfill_extract::{RankedCandidates, Validator};
use recordfill_shared::text::truncate_chars;
use recordfill_shared::{Candidate, FieldKind, PartialRecord, Provenance, RecordfillError, Result};
use recordfill_sources::{Llm, retry_once};

const ORIGIN: &str = "llm";

/// How many ranked options to offer per tied field.
const MAX_OPTIONS: usize = 4;

/// Wraps an [`Llm`] with prompt construction and answer parsing.
pub struct Disambiguator {
    llm: Arc<dyn Llm>,
    validator: Validator,
    page_budget: usize,
}

impl Disambiguator {
    pub fn new(llm: Arc<dyn Llm>, validator: Validator, page_budget: usize) -> Self {
        Self {
            llm,
            validator,
            page_budget,
        }
    }

    /// Ask for `fields` about `record`, given page text and any ranked
    /// options already collected.
    ///
    /// Returns validated candidates only. Unavailable endpoints and
    /// malformed answers yield nothing.
    pub async fn resolve(
        &self,
        record: &PartialRecord,
        page_text: &str,
        fields: &[FieldKind],
        ranked: &RankedCandidates,
    ) -> Vec<Candidate> {
        if fields.is_empty() || page_text.trim().is_empty() {
            return Vec::new();
        }

        let prompt = build_prompt(record, page_text, fields, ranked, self.page_budget);
        let raw = match retry_once(ORIGIN, || self.llm.infer(&prompt)).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "LLM unavailable, skipping disambiguation");
                return Vec::new();
            }
        };

        let answers = match parse_answer(&raw, fields) {
            Ok(answers) => answers,
            Err(e) => {
                warn!(error = %e, "discarding LLM answer");
                return Vec::new();
            }
        };
        if answers.is_empty() {
            debug!("LLM returned no data");
        }

        answers
            .into_iter()
            .map(|(field, value)| Candidate::new(field, value, Provenance::Llm, ORIGIN))
            .filter(|c| self.validator.accept(c))
            .collect()
    }
}

/// Prompt for one record. Page text is cut to `budget` characters.
pub fn build_prompt(
    record: &PartialRecord,
    page_text: &str,
    fields: &[FieldKind],
    ranked: &RankedCandidates,
    budget: usize,
) -> String {
    let mut entity = vec![format!("name: {}", record.name)];
    if let Some(org) = &record.organization {
        entity.push(format!("organization: {org}"));
    }
    if let Some(id) = &record.identifier {
        entity.push(format!("registration: {id}"));
    }
    if let Some(region) = &record.region {
        entity.push(format!("state: {region}"));
    }

    let keys: Vec<&str> = fields.iter().map(|f| f.as_str()).collect();
    let template: Vec<String> = keys.iter().map(|k| format!("\"{k}\": null")).collect();

    let mut options = String::new();
    for field in fields {
        let ranked_values = ranked.get(*field);
        if ranked_values.len() < 2 {
            continue;
        }
        let listed: Vec<&str> = ranked_values
            .iter()
            .take(MAX_OPTIONS)
            .map(|r| r.value.as_str())
            .collect();
        options.push_str(&format!("- {}: {}\n", field.as_str(), listed.join(" | ")));
    }

    let mut prompt = String::new();
    prompt.push_str(
        "You extract contact data for one specific person or organization from a web page.\n",
    );
    prompt.push_str("Entity:\n");
    for line in &entity {
        prompt.push_str(&format!("  {line}\n"));
    }
    prompt.push_str(&format!("Fields: {}\n", keys.join(", ")));
    if !options.is_empty() {
        prompt.push_str("Several values were found for these fields; pick the one that belongs to the entity:\n");
        prompt.push_str(&options);
    }
    prompt.push_str(
        "Rules: copy values exactly as they appear in the page. Use null when the page does not \
         state the value for this entity. Prefer null over guessing.\n",
    );
    prompt.push_str(&format!(
        "Answer with only this JSON object, filled in: {{{}}}\n",
        template.join(", ")
    ));
    prompt.push_str("Page:\n");
    prompt.push_str(truncate_chars(page_text, budget));
    prompt
}

/// Pull requested fields out of a model answer.
///
/// Tolerates code fences and prose around the object. Anything that is not
/// a JSON object is [`RecordfillError::MalformedLlmResponse`]; null, empty,
/// and placeholder values are dropped, so an all-null answer is `Ok(vec![])`.
pub fn parse_answer(raw: &str, fields: &[FieldKind]) -> Result<Vec<(FieldKind, String)>> {
    let object = extract_object(raw)?;
    let mut out = Vec::new();
    for field in fields {
        let Some(value) = object.get(field.as_str()) else {
            continue;
        };
        let text = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Null => continue,
            other => {
                return Err(RecordfillError::MalformedLlmResponse(format!(
                    "{} has unexpected value {other}",
                    field.as_str()
                )));
            }
        };
        if is_placeholder(&text) {
            continue;
        }
        out.push((*field, text));
    }
    Ok(out)
}

fn extract_object(raw: &str) -> Result<Map<String, Value>> {
    let unfenced = raw.replace("```json", "").replace("```", "");
    let (Some(start), Some(end)) = (unfenced.find('{'), unfenced.rfind('}')) else {
        return Err(RecordfillError::MalformedLlmResponse(format!(
            "no JSON object in {:?}",
            truncate_chars(raw.trim(), 80)
        )));
    };
    if end < start {
        return Err(RecordfillError::MalformedLlmResponse("unbalanced braces".into()));
    }
    match serde_json::from_str::<Value>(&unfenced[start..=end]) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(RecordfillError::MalformedLlmResponse("not an object".into())),
        Err(e) => Err(RecordfillError::MalformedLlmResponse(e.to_string())),
    }
}

fn is_placeholder(text: &str) -> bool {
    let lower = text.to_lowercase();
    text.is_empty() || matches!(lower.as_str(), "null" | "none" | "n/a" | "na" | "-" | "unknown")
}
