//! Contracts: the single source of truth for every LM response shape.
//!
//! Arbitrary model output is first *normalized* into the canonical shape
//! (alias keys, container aliases, wrapper peeling, START/END chain rewrite,
//! synthesized root DECOMPOSE edges, non-object filtering), then *strictly
//! validated*. Normalization may fix shapes; it must never change semantic
//! content — scores, enum decisions, and suggestion text pass through
//! untouched. Downstream code is written against the normalized shape only.
//!
//! Four contracts exist:
//! - `plan_json_v1`    (executor, scope PLAN_GEN)
//! - `xiaobo_action_v1` (executor, scope TASK_ACTION)
//! - `xiaojing_review_v1` (reviewer, scope PLAN_REVIEW, review_target PLAN)
//! - `xiaojing_review_v1` (reviewer, scope TASK_CHECK, review_target NODE)

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::{json, Map, Value};

use crate::model::{
    AndOr, EdgeType, NodeType, RequirementKind, RequirementSource, ReviewAction,
    SuggestionPriority, ALLOWED_AGENTS, ALLOWED_ARTIFACT_FORMATS, AGENT_EXECUTOR,
};
use crate::util::{is_iso8601, is_uuid, new_uuid, utc_now_iso};

pub const SCHEMA_PLAN: &str = "plan_json_v1";
pub const SCHEMA_ACTION: &str = "xiaobo_action_v1";
pub const SCHEMA_REVIEW: &str = "xiaojing_review_v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    PlanGen,
    PlanReview,
    TaskAction,
    TaskCheck,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::PlanGen => "PLAN_GEN",
            Scope::PlanReview => "PLAN_REVIEW",
            Scope::TaskAction => "TASK_ACTION",
            Scope::TaskCheck => "TASK_CHECK",
        }
    }

    pub fn schema_version(&self) -> &'static str {
        match self {
            Scope::PlanGen => SCHEMA_PLAN,
            Scope::TaskAction => SCHEMA_ACTION,
            Scope::PlanReview | Scope::TaskCheck => SCHEMA_REVIEW,
        }
    }

    fn review_target(&self) -> &'static str {
        match self {
            Scope::PlanReview => "PLAN",
            _ => "NODE",
        }
    }
}

/// Context threaded into normalization: ids to backfill and the top task used
/// to seed synthesized root nodes.
#[derive(Debug, Clone, Default)]
pub struct ContractContext {
    pub task_id: String,
    pub plan_id: String,
    pub top_task: String,
}

/// Structured validation failure naming the JSON path, the expected value
/// set, and a minimal example fix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractError {
    pub error_code: String,
    pub schema: String,
    pub schema_version: String,
    pub json_path: String,
    pub expected: String,
    pub actual: String,
    pub example_fix: String,
}

impl ContractError {
    pub fn short(&self) -> String {
        format!(
            "{} {}@{} path={} expected={} actual={}",
            self.error_code,
            self.schema,
            self.schema_version,
            self.json_path,
            self.expected,
            self.actual
        )
    }

    pub fn to_json(&self) -> Value {
        json!({
            "error_code": self.error_code,
            "schema": self.schema,
            "schema_version": self.schema_version,
            "json_path": self.json_path,
            "expected": self.expected,
            "actual": self.actual,
            "example_fix": self.example_fix,
        })
    }
}

/// Normalize then strictly validate one LM response against a contract.
/// Returns the normalized value either way; the error is `None` on success.
pub fn normalize_and_validate(
    scope: Scope,
    raw: &Value,
    ctx: &ContractContext,
) -> (Value, Option<ContractError>) {
    let normalized = match scope {
        Scope::PlanGen => normalize_plan_json(raw.clone(), &ctx.top_task),
        Scope::TaskAction => normalize_action(raw.clone(), &ctx.task_id),
        Scope::PlanReview => normalize_review(
            raw.clone(),
            if ctx.plan_id.is_empty() { &ctx.task_id } else { &ctx.plan_id },
            "PLAN",
        ),
        Scope::TaskCheck => normalize_review(raw.clone(), &ctx.task_id, "NODE"),
    };

    let reason = match scope {
        Scope::PlanGen => validate_plan_json(&normalized).err(),
        Scope::TaskAction => validate_action(&normalized).err(),
        Scope::PlanReview | Scope::TaskCheck => {
            validate_review(&normalized, scope.review_target()).err()
        }
    };

    match reason {
        None => (normalized, None),
        Some(reason) => {
            let err = infer_error(scope, &reason, &normalized);
            (normalized, Some(err))
        }
    }
}

// =============================================================================
// Shape helpers (table-driven)
// =============================================================================

fn as_str(value: &Value) -> Option<&str> {
    value.as_str()
}

fn nonempty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn coerce_int(value: Option<&Value>, default: i64) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse::<i64>().unwrap_or(default),
        _ => default,
    }
}

fn coerce_bool(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().map(|i| i != 0).unwrap_or(default),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "y" => true,
            "0" | "false" | "no" | "n" => false,
            _ => default,
        },
        _ => default,
    }
}

/// Copy the first present alternative into the canonical key (unless it is
/// already set and `overwrite` is false).
fn apply_aliases(map: &mut Map<String, Value>, aliases: &[(&str, &[&str])], overwrite: bool) {
    for (canonical, alts) in aliases {
        if !overwrite {
            if let Some(existing) = map.get(*canonical) {
                if !existing.is_null() {
                    continue;
                }
            }
        }
        let found = alts
            .iter()
            .find_map(|alt| map.get(*alt).filter(|v| !v.is_null()).cloned());
        if let Some(value) = found {
            map.insert(canonical.to_string(), value);
        }
    }
}

/// Ensure `map[dst]` is an array of objects, taking the first array found
/// among `srcs` when missing, and filtering non-object items.
fn ensure_list_container(map: &mut Map<String, Value>, dst: &str, srcs: &[&str]) {
    let raw = match map.get(dst) {
        Some(Value::Array(items)) => Some(items.clone()),
        _ => srcs
            .iter()
            .find_map(|src| map.get(*src).and_then(Value::as_array).cloned()),
    };
    let filtered: Vec<Value> = raw
        .unwrap_or_default()
        .into_iter()
        .filter(|item| item.is_object())
        .collect();
    map.insert(dst.to_string(), Value::Array(filtered));
}

/// Keep only the first non-empty line of the top task so retry feedback never
/// pollutes a synthesized goal statement or title.
fn clean_top_task(top_task: &str) -> String {
    for line in top_task.lines() {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return trimmed.chars().take(200).collect();
        }
    }
    "Untitled Task".to_string()
}

// =============================================================================
// xiaobo_action_v1
// =============================================================================

pub fn normalize_action(raw: Value, task_id: &str) -> Value {
    let mut obj = match raw {
        Value::Object(obj) => obj,
        other => return other,
    };

    // Some models wrap the action under a generic envelope key.
    if !obj.contains_key("result_type") {
        for wrapper in ["action", "result", "output", "data", "payload", "response"] {
            if let Some(Value::Object(inner)) = obj.get(wrapper) {
                if inner.contains_key("result_type")
                    || inner.contains_key("artifact")
                    || inner.contains_key("needs_input")
                    || inner.contains_key("error")
                {
                    obj = inner.clone();
                    break;
                }
            }
        }
    }

    apply_aliases(
        &mut obj,
        &[
            ("schema_version", &["schema", "version"]),
            ("task_id", &["id", "taskId"]),
        ],
        false,
    );

    // schema_version aliases collapse to the canonical string.
    let sv = nonempty_str(obj.get("schema_version"));
    let sv = match sv {
        Some(s) if s.to_lowercase().starts_with("xiaobo_action") => SCHEMA_ACTION.to_string(),
        Some(s) if matches!(s.to_lowercase().as_str(), "action_v1" | "v1") => {
            SCHEMA_ACTION.to_string()
        }
        Some(s) => s,
        None => SCHEMA_ACTION.to_string(),
    };
    obj.insert("schema_version".to_string(), Value::String(sv));

    if nonempty_str(obj.get("task_id")).is_none() {
        obj.insert("task_id".to_string(), Value::String(task_id.to_string()));
    }

    if let Some(rt) = nonempty_str(obj.get("result_type")) {
        obj.insert(
            "result_type".to_string(),
            Value::String(rt.trim().to_uppercase()),
        );
    }

    if obj.get("result_type").and_then(as_str) == Some("NEEDS_INPUT") {
        normalize_needs_input(&mut obj);
    }

    if obj.get("result_type").and_then(as_str) == Some("ARTIFACT") {
        if let Some(Value::Object(artifact)) = obj.get_mut("artifact") {
            if let Some(fmt) = nonempty_str(artifact.get("format")) {
                artifact.insert(
                    "format".to_string(),
                    Value::String(fmt.to_lowercase().trim_start_matches('.').to_string()),
                );
            }
        }
    }

    Value::Object(obj)
}

/// Repair the common NEEDS_INPUT shape variants into
/// `needs_input.required_docs: [{name, description, accepted_types}]`.
fn normalize_needs_input(obj: &mut Map<String, Value>) {
    let mut needs = match obj.get("needs_input") {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };

    let docs_present = matches!(needs.get("required_docs"), Some(Value::Array(items)) if !items.is_empty());
    if !docs_present {
        let mut docs: Vec<Value> = Vec::new();

        if let Some(Value::Array(items)) = obj.get("missing_inputs") {
            for item in items {
                let Some(map) = item.as_object() else { continue };
                let name = nonempty_str(map.get("name")).unwrap_or_default();
                if name.is_empty() {
                    continue;
                }
                let description = nonempty_str(map.get("description"))
                    .or_else(|| nonempty_str(map.get("reason")))
                    .unwrap_or_else(|| name.clone());
                let accepted = match map.get("accepted_types").or_else(|| map.get("type")) {
                    Some(Value::Array(types)) => types
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                    Some(Value::String(t)) if !t.trim().is_empty() => vec![t.trim().to_string()],
                    _ => Vec::new(),
                };
                docs.push(json!({"name": name, "description": description, "accepted_types": accepted}));
            }
        }

        let required_context = needs
            .get("required_context")
            .cloned()
            .or_else(|| obj.get("required_context").cloned());
        if let Some(Value::Array(items)) = required_context {
            for item in items {
                if let Some(s) = item.as_str() {
                    let s = s.trim();
                    if !s.is_empty() {
                        docs.push(json!({"name": s, "description": s, "accepted_types": []}));
                    }
                }
            }
        }

        if docs.is_empty() {
            let reason = nonempty_str(needs.get("reason"))
                .or_else(|| nonempty_str(obj.get("justification")))
                .unwrap_or_else(|| "Please provide missing inputs.".to_string());
            docs.push(json!({"name": "clarification", "description": reason, "accepted_types": []}));
        }

        needs.insert("required_docs".to_string(), Value::Array(docs));
    }

    obj.insert("needs_input".to_string(), Value::Object(needs));
}

pub fn validate_action(obj: &Value) -> Result<(), String> {
    let map = obj.as_object().ok_or("expected object")?;
    for key in ["schema_version", "task_id", "result_type"] {
        if !map.contains_key(key) {
            return Err(format!("missing key: {}", key));
        }
    }
    if map.get("schema_version").and_then(as_str) != Some(SCHEMA_ACTION) {
        return Err(format!(
            "schema_version mismatch (got {:?})",
            map.get("schema_version").and_then(as_str).unwrap_or("")
        ));
    }
    if !map.get("task_id").map(Value::is_string).unwrap_or(false) {
        return Err("task_id must be string".to_string());
    }

    let result_type = map.get("result_type").and_then(as_str).unwrap_or("");
    if !matches!(result_type, "NEEDS_INPUT" | "ARTIFACT" | "NOOP" | "ERROR") {
        return Err("invalid result_type".to_string());
    }

    if result_type == "NEEDS_INPUT" {
        let needs = map
            .get("needs_input")
            .and_then(Value::as_object)
            .ok_or("needs_input must be object")?;
        let docs = needs
            .get("required_docs")
            .and_then(Value::as_array)
            .filter(|a| !a.is_empty())
            .ok_or("needs_input.required_docs must be non-empty array")?;
        for doc in docs {
            let doc = doc.as_object().ok_or("required_docs item must be object")?;
            if !doc.get("name").map(Value::is_string).unwrap_or(false)
                || !doc.get("description").map(Value::is_string).unwrap_or(false)
            {
                return Err("required_docs.name/description must be string".to_string());
            }
            if let Some(accepted) = doc.get("accepted_types") {
                let ok = accepted
                    .as_array()
                    .map(|items| items.iter().all(Value::is_string))
                    .unwrap_or(false);
                if !ok {
                    return Err("required_docs.accepted_types must be string array".to_string());
                }
            }
        }
    }

    if result_type == "ARTIFACT" {
        let artifact = map
            .get("artifact")
            .and_then(Value::as_object)
            .ok_or("artifact must be object")?;
        for key in ["name", "format", "content"] {
            let ok = artifact
                .get(key)
                .and_then(as_str)
                .map(|s| !s.is_empty())
                .unwrap_or(false);
            if !ok {
                return Err(format!("artifact.{} is required", key));
            }
        }
        let fmt = artifact.get("format").and_then(as_str).unwrap_or("");
        if !ALLOWED_ARTIFACT_FORMATS.contains(&fmt) {
            return Err("artifact.format must be md|txt|json|html|css|js".to_string());
        }
    }

    if result_type == "ERROR" {
        let error = map
            .get("error")
            .and_then(Value::as_object)
            .ok_or("error must be object")?;
        if !error.get("code").map(Value::is_string).unwrap_or(false)
            || !error.get("message").map(Value::is_string).unwrap_or(false)
        {
            return Err("error.code/error.message must be string".to_string());
        }
    }

    Ok(())
}

// =============================================================================
// xiaojing_review_v1
// =============================================================================

pub fn normalize_review(raw: Value, task_id: &str, review_target: &str) -> Value {
    let mut obj = match raw {
        Value::Object(obj) => obj,
        other => return other,
    };

    apply_aliases(
        &mut obj,
        &[
            ("schema_version", &["schema", "version"]),
            ("task_id", &["id", "taskId"]),
        ],
        false,
    );

    // Peel a `review_result` wrapper: copy score/action when missing and lift
    // dimension scores into a breakdown.
    if let Some(Value::Object(wrapped)) = obj.get("review_result").cloned() {
        peel_review_result(&mut obj, &wrapped);
    }

    // schema_version aliases
    let sv = nonempty_str(obj.get("schema_version"));
    let sv = match sv {
        Some(s) if s.to_lowercase().starts_with("xiaojing_review") => SCHEMA_REVIEW.to_string(),
        Some(s) if matches!(s.to_lowercase().as_str(), "review_v1" | "review_v01" | "review1" | "v1" | "v01" | "1") => {
            SCHEMA_REVIEW.to_string()
        }
        Some(s) => s,
        None => SCHEMA_REVIEW.to_string(),
    };
    obj.insert("schema_version".to_string(), Value::String(sv));

    if nonempty_str(obj.get("task_id")).is_none() {
        obj.insert("task_id".to_string(), Value::String(task_id.to_string()));
    }

    // review_target aliases
    let rt = nonempty_str(obj.get("review_target")).map(|s| s.to_uppercase());
    let rt = match rt.as_deref() {
        Some("PLAN_REVIEW") | Some("PLAN_JSON") | Some("TOP_TASK") => "PLAN".to_string(),
        Some(other) => other.to_string(),
        None => review_target.to_string(),
    };
    obj.insert("review_target".to_string(), Value::String(rt));

    // total_score: string digits and whole floats are shape problems;
    // absence is not ours to fix.
    match obj.get("total_score").cloned() {
        Some(Value::String(s)) => {
            if let Ok(n) = s.trim().parse::<i64>() {
                obj.insert("total_score".to_string(), json!(n));
            }
        }
        Some(Value::Number(n)) if n.as_i64().is_none() => {
            if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && (0.0..=100.0).contains(&f) {
                    obj.insert("total_score".to_string(), json!(f as i64));
                }
            }
        }
        _ => {}
    }

    // action_required: trim/case only. Never derived from the score —
    // rewriting the decision would alter semantic content.
    if let Some(action) = nonempty_str(obj.get("action_required")) {
        obj.insert(
            "action_required".to_string(),
            Value::String(action.to_uppercase()),
        );
    }

    if nonempty_str(obj.get("summary")).is_none() {
        let fallback = nonempty_str(obj.get("feedback"))
            .unwrap_or_else(|| "No summary provided.".to_string());
        obj.insert("summary".to_string(), Value::String(fallback));
    }

    // breakdown: default a single overall dimension when absent.
    let has_breakdown =
        matches!(obj.get("breakdown"), Some(Value::Array(items)) if !items.is_empty());
    if !has_breakdown {
        let score = coerce_int(obj.get("total_score"), 0);
        obj.insert(
            "breakdown".to_string(),
            json!([{"dimension": "overall", "score": score, "max_score": 100, "issues": []}]),
        );
    }

    // suggestions: priority aliases + steps cleanup; text passes through.
    let suggestions = match obj.get("suggestions") {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    let normalized: Vec<Value> = suggestions
        .into_iter()
        .filter_map(|item| item.as_object().cloned())
        .map(|mut suggestion| {
            let priority = nonempty_str(suggestion.get("priority"))
                .map(|p| normalize_priority(&p))
                .unwrap_or_else(|| "MED".to_string());
            suggestion.insert("priority".to_string(), Value::String(priority));

            if nonempty_str(suggestion.get("change")).is_none() {
                suggestion.insert(
                    "change".to_string(),
                    Value::String("Clarify and adjust output as requested.".to_string()),
                );
            }
            let steps: Vec<Value> = suggestion
                .get("steps")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(|s| Value::String(s.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            suggestion.insert("steps".to_string(), Value::Array(steps));
            if nonempty_str(suggestion.get("acceptance_criteria")).is_none() {
                suggestion.insert(
                    "acceptance_criteria".to_string(),
                    Value::String("Meets rubric requirements.".to_string()),
                );
            }
            Value::Object(suggestion)
        })
        .collect();
    obj.insert("suggestions".to_string(), Value::Array(normalized));

    Value::Object(obj)
}

fn normalize_priority(priority: &str) -> String {
    match priority.trim().to_uppercase().as_str() {
        "H" | "HI" | "HIGH" | "URGENT" | "CRITICAL" => "HIGH".to_string(),
        "M" | "MID" | "MED" | "MEDIUM" | "NORMAL" => "MED".to_string(),
        "L" | "LOW" | "MINOR" | "TRIVIAL" => "LOW".to_string(),
        other => other.to_string(),
    }
}

fn peel_review_result(obj: &mut Map<String, Value>, wrapped: &Map<String, Value>) {
    // Score: copy when the outer one is missing or clearly defaulted.
    let outer_score = obj.get("total_score").and_then(Value::as_i64).unwrap_or(0);
    if outer_score == 0 {
        let inner = coerce_int(wrapped.get("total_score"), i64::MIN);
        if inner != i64::MIN {
            obj.insert("total_score".to_string(), json!(inner));
        }
    }
    if nonempty_str(obj.get("action_required")).is_none() {
        if let Some(action) = nonempty_str(wrapped.get("action_required")) {
            obj.insert("action_required".to_string(), Value::String(action));
        }
    }

    // dimension_scores -> breakdown when the outer breakdown is missing/empty.
    let has_breakdown =
        matches!(obj.get("breakdown"), Some(Value::Array(items)) if !items.is_empty());
    if !has_breakdown {
        let dims = wrapped
            .get("dimension_scores")
            .or_else(|| wrapped.get("scores"))
            .and_then(Value::as_array);
        if let Some(dims) = dims {
            let breakdown: Vec<Value> = dims
                .iter()
                .filter_map(Value::as_object)
                .map(|dim| {
                    let dimension = nonempty_str(dim.get("dimension"))
                        .unwrap_or_else(|| "overall".to_string());
                    let score = coerce_int(dim.get("score"), 0);
                    let comment = nonempty_str(dim.get("comment"));
                    let issues = match comment {
                        Some(comment) => json!([{
                            "problem": comment,
                            "evidence": comment,
                            "impact": "May block execution or reduce quality.",
                            "suggestion": "Follow the reviewer guidance to fix this issue.",
                            "acceptance_criteria": "Meets rubric requirements.",
                        }]),
                        None => json!([]),
                    };
                    json!({"dimension": dimension, "score": score, "max_score": 100, "issues": issues})
                })
                .collect();
            if !breakdown.is_empty() {
                obj.insert("breakdown".to_string(), Value::Array(breakdown));
            }
        }
    }

    // Wrapped suggestions -> suggestions when missing/empty.
    let has_suggestions =
        matches!(obj.get("suggestions"), Some(Value::Array(items)) if !items.is_empty());
    if !has_suggestions {
        let sugs = wrapped
            .get("suggestions")
            .or_else(|| wrapped.get("recommendations"))
            .and_then(Value::as_array);
        if let Some(sugs) = sugs {
            let lifted: Vec<Value> = sugs
                .iter()
                .filter_map(Value::as_object)
                .map(|s| {
                    let change = nonempty_str(s.get("change")).unwrap_or_else(|| {
                        let problem = nonempty_str(s.get("problem")).unwrap_or_default();
                        let dimension = nonempty_str(s.get("dimension"));
                        match (problem.is_empty(), dimension) {
                            (false, Some(dim)) => format!("{} ({})", problem, dim),
                            (false, None) => problem,
                            (true, _) => "Clarify and adjust output as requested.".to_string(),
                        }
                    });
                    let steps = s.get("steps").cloned().unwrap_or_else(|| json!([]));
                    let acceptance = nonempty_str(s.get("acceptance_criteria"))
                        .unwrap_or_else(|| "Meets rubric requirements.".to_string());
                    json!({"priority": s.get("priority").cloned().unwrap_or(json!("MED")),
                           "change": change, "steps": steps, "acceptance_criteria": acceptance})
                })
                .collect();
            if !lifted.is_empty() {
                obj.insert("suggestions".to_string(), Value::Array(lifted));
            }
        }
    }
}

pub fn validate_review(obj: &Value, review_target: &str) -> Result<(), String> {
    let map = obj.as_object().ok_or("expected object")?;
    for key in [
        "schema_version",
        "task_id",
        "review_target",
        "total_score",
        "breakdown",
        "summary",
        "action_required",
        "suggestions",
    ] {
        if !map.contains_key(key) {
            return Err(format!("missing key: {}", key));
        }
    }
    if map.get("schema_version").and_then(as_str) != Some(SCHEMA_REVIEW) {
        return Err(format!(
            "schema_version mismatch (got {:?})",
            map.get("schema_version").and_then(as_str).unwrap_or("")
        ));
    }
    if map.get("review_target").and_then(as_str) != Some(review_target) {
        return Err(format!(
            "review_target mismatch (got {:?}, expected {})",
            map.get("review_target").and_then(as_str).unwrap_or(""),
            review_target
        ));
    }
    if !map.get("task_id").map(Value::is_string).unwrap_or(false) {
        return Err("task_id must be string".to_string());
    }
    let total = map
        .get("total_score")
        .and_then(Value::as_i64)
        .ok_or("total_score must be int")?;
    if !(0..=100).contains(&total) {
        return Err("total_score out of range".to_string());
    }
    let action = map.get("action_required").and_then(as_str).unwrap_or("");
    if ReviewAction::from_str(action).is_none() {
        return Err("invalid action_required".to_string());
    }

    let breakdown = map
        .get("breakdown")
        .and_then(Value::as_array)
        .ok_or("breakdown must be array")?;
    for dim in breakdown {
        let dim = dim.as_object().ok_or("breakdown item must be object")?;
        for key in ["dimension", "score", "max_score", "issues"] {
            if !dim.contains_key(key) {
                return Err(format!("breakdown missing {}", key));
            }
        }
        if !dim.get("dimension").map(Value::is_string).unwrap_or(false) {
            return Err("breakdown.dimension must be string".to_string());
        }
        if dim.get("score").and_then(Value::as_i64).is_none()
            || dim.get("max_score").and_then(Value::as_i64).is_none()
        {
            return Err("breakdown.score/max_score must be int".to_string());
        }
        let issues = dim
            .get("issues")
            .and_then(Value::as_array)
            .ok_or("breakdown.issues must be array")?;
        for issue in issues {
            let issue = issue.as_object().ok_or("issue must be object")?;
            for key in ["problem", "evidence", "impact", "suggestion", "acceptance_criteria"] {
                if !issue.get(key).map(Value::is_string).unwrap_or(false) {
                    return Err(format!("issue.{} must be string", key));
                }
            }
        }
    }

    let suggestions = map
        .get("suggestions")
        .and_then(Value::as_array)
        .ok_or("suggestions must be array")?;
    for suggestion in suggestions {
        let suggestion = suggestion.as_object().ok_or("suggestion must be object")?;
        let priority = suggestion.get("priority").and_then(as_str).unwrap_or("");
        if SuggestionPriority::from_str(priority).is_none() {
            return Err("suggestion.priority must be HIGH|MED|LOW".to_string());
        }
        if !suggestion.get("change").map(Value::is_string).unwrap_or(false) {
            return Err("suggestion.change must be string".to_string());
        }
        let steps_ok = suggestion
            .get("steps")
            .and_then(Value::as_array)
            .map(|items| items.iter().all(Value::is_string))
            .unwrap_or(false);
        if !steps_ok {
            return Err("suggestion.steps must be string array".to_string());
        }
        if !suggestion
            .get("acceptance_criteria")
            .map(Value::is_string)
            .unwrap_or(false)
        {
            return Err("suggestion.acceptance_criteria must be string".to_string());
        }
    }

    Ok(())
}

// =============================================================================
// plan_json_v1
// =============================================================================

pub fn normalize_plan_json(raw: Value, top_task: &str) -> Value {
    let Value::Object(mut outer) = raw else {
        return json!({"schema_version": SCHEMA_PLAN, "plan": {}, "nodes": [], "edges": [], "requirements": []});
    };

    // Peel generator envelopes: {"plan_json": {...}} and generic wrappers.
    if let Some(Value::Object(inner)) = outer.get("plan_json") {
        outer = inner.clone();
    } else if !outer.contains_key("plan") && !outer.contains_key("nodes") {
        for wrapper in ["result", "data", "output", "payload", "response"] {
            if let Some(Value::Object(inner)) = outer.get(wrapper) {
                if inner.contains_key("plan") || inner.contains_key("nodes") {
                    outer = inner.clone();
                    break;
                }
            }
        }
    }
    let mut plan_json = outer;

    // schema_version aliases
    let sv = nonempty_str(plan_json.get("schema_version"));
    let sv = match sv {
        Some(s) if s.to_lowercase().starts_with("plan_json") => SCHEMA_PLAN.to_string(),
        Some(s) if matches!(s.to_lowercase().as_str(), "xiaobo_plan_v1" | "plan_v1" | "v1") => {
            SCHEMA_PLAN.to_string()
        }
        Some(s) => s,
        None => SCHEMA_PLAN.to_string(),
    };
    plan_json.insert("schema_version".to_string(), Value::String(sv));

    // Plan header: accept flat fields at the top level.
    let mut plan = match plan_json.get("plan") {
        Some(Value::Object(map)) => map.clone(),
        _ => {
            let mut plan = Map::new();
            for (canonical, alts) in [
                ("plan_id", vec!["plan_id", "planId", "id"]),
                ("title", vec!["title", "name"]),
                ("owner_agent_id", vec!["owner_agent_id", "owner", "agent"]),
                ("root_task_id", vec!["root_task_id", "root", "root_id"]),
                ("created_at", vec!["created_at", "createdAt", "ts", "created"]),
                ("constraints", vec!["constraints", "constraints_json", "constraint"]),
            ] {
                if let Some(value) = alts.iter().find_map(|k| plan_json.get(*k).filter(|v| !v.is_null())) {
                    plan.insert(canonical.to_string(), value.clone());
                }
            }
            plan
        }
    };

    let title = nonempty_str(plan.get("title"))
        .unwrap_or_else(|| clean_top_task(top_task))
        .chars()
        .take(120)
        .collect::<String>();
    let title = if title.is_empty() { "Untitled Plan".to_string() } else { title };
    plan.insert("title".to_string(), Value::String(title));

    if !nonempty_str(plan.get("plan_id")).map(|s| is_uuid(&s)).unwrap_or(false) {
        plan.insert("plan_id".to_string(), Value::String(new_uuid()));
    }
    if !nonempty_str(plan.get("root_task_id")).map(|s| is_uuid(&s)).unwrap_or(false) {
        plan.insert("root_task_id".to_string(), Value::String(new_uuid()));
    }
    if !nonempty_str(plan.get("created_at")).map(|s| is_iso8601(&s)).unwrap_or(false) {
        plan.insert("created_at".to_string(), Value::String(utc_now_iso()));
    }
    let owner = nonempty_str(plan.get("owner_agent_id")).unwrap_or_default();
    if !ALLOWED_AGENTS.contains(&owner.as_str()) {
        plan.insert(
            "owner_agent_id".to_string(),
            Value::String(AGENT_EXECUTOR.to_string()),
        );
    }
    if !plan.get("constraints").map(Value::is_object).unwrap_or(false) {
        plan.insert(
            "constraints".to_string(),
            json!({"deadline": null, "priority": "HIGH"}),
        );
    }

    let plan_id = plan.get("plan_id").and_then(as_str).unwrap_or_default().to_string();
    let root_task_id = plan
        .get("root_task_id")
        .and_then(as_str)
        .unwrap_or_default()
        .to_string();
    plan_json.insert("plan".to_string(), Value::Object(plan));

    // Containers: accept common alternate names, drop non-object items.
    ensure_list_container(&mut plan_json, "nodes", &["tasks", "task_nodes", "items"]);
    ensure_list_container(
        &mut plan_json,
        "edges",
        &["links", "deps", "dependencies", "task_edges"],
    );
    ensure_list_container(
        &mut plan_json,
        "requirements",
        &["inputs", "input_requirements", "requirements_list"],
    );

    let mut nodes = take_array(&mut plan_json, "nodes");
    let mut edges = take_array(&mut plan_json, "edges");
    let mut requirements = take_array(&mut plan_json, "requirements");

    // Non-UUID ids map stably onto fresh UUIDs.
    let mut id_map: HashMap<String, String> = HashMap::new();
    let mut map_id = |value: Option<&Value>, id_map: &mut HashMap<String, String>| -> String {
        match value.and_then(Value::as_str).filter(|s| !s.is_empty()) {
            Some(s) if is_uuid(s) => s.to_string(),
            Some(s) => id_map
                .entry(s.to_string())
                .or_insert_with(new_uuid)
                .clone(),
            None => new_uuid(),
        }
    };

    for node in nodes.iter_mut() {
        let Some(map) = node.as_object_mut() else { continue };
        apply_aliases(
            map,
            &[
                ("task_id", &["id", "taskId", "node_id", "nodeId"]),
                ("title", &["name", "label"]),
                ("node_type", &["type", "kind"]),
                ("owner_agent_id", &["owner", "agent"]),
                ("priority", &["prio"]),
                ("goal_statement", &["goal", "objective"]),
                ("tags", &["labels"]),
            ],
            false,
        );
        let mapped = map_id(map.get("task_id"), &mut id_map);
        map.insert("task_id".to_string(), Value::String(mapped));
        map.insert("plan_id".to_string(), Value::String(plan_id.clone()));
        // v2 CHECK nodes reference their ACTION by id; keep the reference
        // consistent with the remapped ids.
        if map
            .get("review_target_task_id")
            .and_then(Value::as_str)
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false)
        {
            let mapped = map_id(map.get("review_target_task_id"), &mut id_map);
            map.insert("review_target_task_id".to_string(), Value::String(mapped));
        }
    }

    for edge in edges.iter_mut() {
        let Some(map) = edge.as_object_mut() else { continue };
        apply_aliases(
            map,
            &[
                ("edge_id", &["id"]),
                ("from_task_id", &["from", "from_id", "source", "src", "parent_id"]),
                ("to_task_id", &["to", "to_id", "target", "tgt", "child_id"]),
                ("edge_type", &["type", "relation", "relation_type", "kind"]),
                ("metadata", &["meta"]),
            ],
            false,
        );
        let edge_id = map_id(map.get("edge_id"), &mut id_map);
        let from_id = map_id(map.get("from_task_id"), &mut id_map);
        let to_id = map_id(map.get("to_task_id"), &mut id_map);
        map.insert("edge_id".to_string(), Value::String(edge_id));
        map.insert("from_task_id".to_string(), Value::String(from_id));
        map.insert("to_task_id".to_string(), Value::String(to_id));
        map.insert("plan_id".to_string(), Value::String(plan_id.clone()));
    }

    for req in requirements.iter_mut() {
        let Some(map) = req.as_object_mut() else { continue };
        apply_aliases(map, &[("requirement_id", &["id"])], false);
        let req_id = map_id(map.get("requirement_id"), &mut id_map);
        let task_id = map_id(map.get("task_id"), &mut id_map);
        map.insert("requirement_id".to_string(), Value::String(req_id));
        map.insert("task_id".to_string(), Value::String(task_id));
    }

    // Linear START -> ... -> END chains: rewrite START->X into DECOMPOSE
    // fan-out from the root, drop edges into END.
    let start_ids: HashSet<String> = id_map
        .iter()
        .filter(|(k, _)| matches!(k.trim().to_uppercase().as_str(), "START" | "BEGIN"))
        .map(|(_, v)| v.clone())
        .collect();
    let end_ids: HashSet<String> = id_map
        .iter()
        .filter(|(k, _)| matches!(k.trim().to_uppercase().as_str(), "END" | "FINISH" | "STOP"))
        .map(|(_, v)| v.clone())
        .collect();
    if !start_ids.is_empty() || !end_ids.is_empty() {
        edges.retain(|edge| {
            edge.get("to_task_id")
                .and_then(as_str)
                .map(|to| !end_ids.contains(to))
                .unwrap_or(true)
        });
        for edge in edges.iter_mut() {
            let Some(map) = edge.as_object_mut() else { continue };
            let from_is_start = map
                .get("from_task_id")
                .and_then(as_str)
                .map(|from| start_ids.contains(from))
                .unwrap_or(false);
            if from_is_start {
                map.insert("from_task_id".to_string(), Value::String(root_task_id.clone()));
                map.insert("edge_type".to_string(), Value::String("DECOMPOSE".to_string()));
                let mut meta = map
                    .get("metadata")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                meta.insert("and_or".to_string(), Value::String("AND".to_string()));
                map.insert("metadata".to_string(), Value::Object(meta));
            }
        }
    }

    // Referential integrity: every referenced id gets a node.
    let mut known: HashSet<String> = nodes
        .iter()
        .filter_map(|n| n.get("task_id").and_then(as_str))
        .map(str::to_string)
        .collect();
    let mut ensure_node = |task_id: &str, is_root: bool, nodes: &mut Vec<Value>, known: &mut HashSet<String>| {
        if task_id.is_empty() || known.contains(task_id) {
            return;
        }
        nodes.push(json!({
            "task_id": task_id,
            "plan_id": plan_id,
            "node_type": if is_root { "GOAL" } else { "ACTION" },
            "title": if is_root { "Root Task".to_string() } else { format!("AUTO: missing node {}", &task_id[..8.min(task_id.len())]) },
            "goal_statement": if is_root { Value::String(clean_top_task(top_task)) } else { Value::Null },
            "owner_agent_id": AGENT_EXECUTOR,
            "priority": 0,
            "tags": ["autofix", "placeholder"],
        }));
        known.insert(task_id.to_string());
    };

    ensure_node(&root_task_id, true, &mut nodes, &mut known);
    let endpoint_ids: Vec<String> = edges
        .iter()
        .flat_map(|e| {
            ["from_task_id", "to_task_id"]
                .iter()
                .filter_map(|k| e.get(*k).and_then(as_str).map(str::to_string))
                .collect::<Vec<_>>()
        })
        .chain(
            requirements
                .iter()
                .filter_map(|r| r.get("task_id").and_then(as_str).map(str::to_string)),
        )
        .collect();
    for id in endpoint_ids {
        ensure_node(&id, false, &mut nodes, &mut known);
    }

    // Drop the START/END placeholders created above (their edges are rewritten).
    if !start_ids.is_empty() || !end_ids.is_empty() {
        nodes.retain(|n| {
            n.get("task_id")
                .and_then(as_str)
                .map(|id| !start_ids.contains(id) && !end_ids.contains(id))
                .unwrap_or(true)
        });
    }

    // Coerce required node fields.
    for (idx, node) in nodes.iter_mut().enumerate() {
        let Some(map) = node.as_object_mut() else { continue };
        let is_root = map.get("task_id").and_then(as_str) == Some(root_task_id.as_str());

        let node_type = nonempty_str(map.get("node_type"))
            .map(|s| s.to_uppercase())
            .filter(|s| NodeType::from_str(s).is_some())
            .unwrap_or_else(|| {
                let fallback = if is_root { NodeType::Goal } else { NodeType::Action };
                fallback.as_str().to_string()
            });
        map.insert("node_type".to_string(), Value::String(node_type.clone()));

        if nonempty_str(map.get("title")).is_none() {
            map.insert("title".to_string(), Value::String(format!("Task {}", idx + 1)));
        }
        if is_root && node_type == "GOAL" && nonempty_str(map.get("goal_statement")).is_none() {
            map.insert(
                "goal_statement".to_string(),
                Value::String(clean_top_task(top_task)),
            );
        }
        let owner = nonempty_str(map.get("owner_agent_id")).unwrap_or_default();
        if !ALLOWED_AGENTS.contains(&owner.as_str()) {
            map.insert(
                "owner_agent_id".to_string(),
                Value::String(AGENT_EXECUTOR.to_string()),
            );
        }
        let priority = coerce_int(map.get("priority"), 0);
        map.insert("priority".to_string(), json!(priority));
        let tags_ok = map
            .get("tags")
            .and_then(Value::as_array)
            .map(|items| items.iter().all(Value::is_string))
            .unwrap_or(false);
        if !tags_ok {
            map.insert("tags".to_string(), json!([]));
        }
    }

    // Coerce edge types + metadata.
    for edge in edges.iter_mut() {
        let Some(map) = edge.as_object_mut() else { continue };
        let edge_type = nonempty_str(map.get("edge_type"))
            .map(|s| normalize_edge_type(&s))
            .unwrap_or_else(|| "DEPENDS_ON".to_string());
        map.insert("edge_type".to_string(), Value::String(edge_type.clone()));

        let mut meta = map
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        if edge_type == "DECOMPOSE" {
            let and_or = nonempty_str(meta.get("and_or"))
                .map(|s| s.to_uppercase())
                .and_then(|s| AndOr::from_str(&s))
                .unwrap_or_default();
            meta.insert("and_or".to_string(), Value::String(and_or.as_str().to_string()));
        }
        if edge_type == "ALTERNATIVE" && nonempty_str(meta.get("group_id")).is_none() {
            meta.insert("group_id".to_string(), Value::String("AUTO_GROUP_1".to_string()));
        }
        map.insert("metadata".to_string(), Value::Object(meta));
    }

    // Coerce requirement fields + enums.
    for (idx, req) in requirements.iter_mut().enumerate() {
        let Some(map) = req.as_object_mut() else { continue };
        if nonempty_str(map.get("name")).is_none() {
            map.insert("name".to_string(), Value::String(format!("requirement_{}", idx + 1)));
        }
        let kind = nonempty_str(map.get("kind"))
            .map(|s| normalize_requirement_kind(&s))
            .unwrap_or_else(|| "FILE".to_string());
        map.insert("kind".to_string(), Value::String(kind));
        let source = nonempty_str(map.get("source"))
            .map(|s| s.to_uppercase())
            .and_then(|s| RequirementSource::from_str(&s))
            .unwrap_or(RequirementSource::User);
        map.insert("source".to_string(), Value::String(source.as_str().to_string()));
        let required = coerce_bool(map.get("required"), true);
        map.insert("required".to_string(), json!(if required { 1 } else { 0 }));
        let min_count = coerce_int(map.get("min_count"), 1).max(1);
        map.insert("min_count".to_string(), json!(min_count));
        let allowed = match map.get("allowed_types") {
            Some(Value::String(s)) => json!([s]),
            Some(Value::Array(items)) if items.iter().all(Value::is_string) => {
                Value::Array(items.clone())
            }
            _ => json!([]),
        };
        map.insert("allowed_types".to_string(), allowed);
    }

    // Synthesize root DECOMPOSE edges so every node is reachable from the
    // root and the GOAL can aggregate to DONE. Many external planners emit
    // only DEPENDS_ON chains, which would leave the root forever PENDING.
    let mut decompose_children: HashMap<String, Vec<String>> = HashMap::new();
    for edge in &edges {
        if edge.get("edge_type").and_then(as_str) == Some("DECOMPOSE") {
            if let (Some(from), Some(to)) = (
                edge.get("from_task_id").and_then(as_str),
                edge.get("to_task_id").and_then(as_str),
            ) {
                decompose_children
                    .entry(from.to_string())
                    .or_default()
                    .push(to.to_string());
            }
        }
    }
    let mut reachable: HashSet<String> = HashSet::new();
    let mut mark_reachable = |from: &str, reachable: &mut HashSet<String>| {
        let mut queue: VecDeque<String> = VecDeque::new();
        if reachable.insert(from.to_string()) {
            queue.push_back(from.to_string());
        }
        while let Some(current) = queue.pop_front() {
            for child in decompose_children.get(&current).cloned().unwrap_or_default() {
                if reachable.insert(child.clone()) {
                    queue.push_back(child);
                }
            }
        }
    };
    mark_reachable(&root_task_id, &mut reachable);
    let node_ids: Vec<String> = nodes
        .iter()
        .filter_map(|n| n.get("task_id").and_then(as_str).map(str::to_string))
        .collect();
    for task_id in node_ids {
        if reachable.contains(&task_id) {
            continue;
        }
        edges.push(json!({
            "edge_id": new_uuid(),
            "plan_id": plan_id,
            "from_task_id": root_task_id,
            "to_task_id": task_id,
            "edge_type": "DECOMPOSE",
            "metadata": {"and_or": "AND"},
        }));
        // A new root child makes its own DECOMPOSE subtree reachable too.
        mark_reachable(&task_id, &mut reachable);
    }

    plan_json.insert("nodes".to_string(), Value::Array(nodes));
    plan_json.insert("edges".to_string(), Value::Array(edges));
    plan_json.insert("requirements".to_string(), Value::Array(requirements));
    Value::Object(plan_json)
}

fn take_array(map: &mut Map<String, Value>, key: &str) -> Vec<Value> {
    match map.remove(key) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

fn normalize_edge_type(edge_type: &str) -> String {
    let t = edge_type.trim().to_uppercase();
    let mapped = match t.as_str() {
        "DEPEND" | "DEPENDS" | "DEPEND_ON" | "DEPENDS-ON" | "DEPENDS ON" | "REQUIRES"
        | "PREREQ" | "PREREQUISITE" => "DEPENDS_ON",
        "DECOMPOSITION" | "BREAKDOWN" | "CHILD_OF" | "PARENT_OF" => "DECOMPOSE",
        "ALT" | "ALTERNATE" => "ALTERNATIVE",
        other => other,
    };
    EdgeType::from_str(mapped)
        .unwrap_or(EdgeType::DependsOn)
        .as_str()
        .to_string()
}

fn normalize_requirement_kind(kind: &str) -> String {
    let t = kind.trim().to_uppercase();
    let mapped = match t.as_str() {
        "FILES" | "DOC" | "DOCS" | "DOCUMENT" | "DOCUMENTS" => "FILE",
        "CONFIRM" => "CONFIRMATION",
        "SKILL" | "SKILL_RESULT" | "SKILL_ARTIFACT" => "SKILL_OUTPUT",
        other => other,
    };
    RequirementKind::from_str(mapped)
        .unwrap_or(RequirementKind::File)
        .as_str()
        .to_string()
}

pub fn validate_plan_json(plan_json: &Value) -> Result<(), String> {
    let root = plan_json.as_object().ok_or("plan.json root must be an object")?;
    for key in ["plan", "nodes", "edges", "requirements"] {
        if !root.contains_key(key) {
            return Err(format!("plan.json missing top-level field: {}", key));
        }
    }
    if root.get("schema_version").and_then(as_str) != Some(SCHEMA_PLAN) {
        return Err(format!(
            "schema_version mismatch (got {:?})",
            root.get("schema_version").and_then(as_str).unwrap_or("")
        ));
    }

    let plan = root.get("plan").and_then(Value::as_object).ok_or("plan must be an object")?;
    let plan_id = plan
        .get("plan_id")
        .and_then(as_str)
        .ok_or("missing required key: plan_id")?;
    if !is_uuid(plan_id) {
        return Err("plan.plan_id must be a UUID string".to_string());
    }
    if plan.get("title").and_then(as_str).is_none() {
        return Err("missing required key: title".to_string());
    }
    if plan.get("owner_agent_id").and_then(as_str).is_none() {
        return Err("missing required key: owner_agent_id".to_string());
    }
    let root_task_id = plan
        .get("root_task_id")
        .and_then(as_str)
        .ok_or("missing required key: root_task_id")?;
    if !is_uuid(root_task_id) {
        return Err("plan.root_task_id must be a UUID string".to_string());
    }
    let created_at = plan
        .get("created_at")
        .and_then(as_str)
        .ok_or("missing required key: created_at")?;
    if !is_iso8601(created_at) {
        return Err("plan.created_at must be ISO8601".to_string());
    }
    if let Some(constraints) = plan.get("constraints") {
        if !constraints.is_object() && !constraints.is_null() {
            return Err("plan.constraints must be an object".to_string());
        }
    }

    let nodes = root.get("nodes").and_then(Value::as_array).ok_or("nodes must be array")?;
    if nodes.is_empty() {
        return Err("nodes must not be empty".to_string());
    }
    let mut seen: HashSet<&str> = HashSet::new();
    let mut root_node_type: Option<&str> = None;
    for node in nodes {
        let node = node.as_object().ok_or("each node must be an object")?;
        for key in ["task_id", "plan_id", "node_type", "title", "owner_agent_id", "priority", "tags"] {
            if !node.contains_key(key) {
                return Err(format!("node missing key: {}", key));
            }
        }
        if node.get("plan_id").and_then(as_str) != Some(plan_id) {
            return Err("node.plan_id must equal plan.plan_id".to_string());
        }
        let task_id = node.get("task_id").and_then(as_str).unwrap_or("");
        if !is_uuid(task_id) {
            return Err("node.task_id must be a UUID string".to_string());
        }
        let node_type = node.get("node_type").and_then(as_str).unwrap_or("");
        if NodeType::from_str(node_type).is_none() {
            return Err("node.node_type must be GOAL|ACTION|CHECK".to_string());
        }
        let owner = node.get("owner_agent_id").and_then(as_str).unwrap_or("");
        if !ALLOWED_AGENTS.contains(&owner) {
            return Err("node.owner_agent_id must be a known agent".to_string());
        }
        if !node.get("tags").map(Value::is_array).unwrap_or(false) {
            return Err("node.tags must be an array".to_string());
        }
        if !seen.insert(task_id) {
            return Err("duplicate node.task_id".to_string());
        }
        if task_id == root_task_id {
            root_node_type = node.get("node_type").and_then(as_str);
        }
    }
    match root_node_type {
        None => return Err("plan.root_task_id must reference an existing node".to_string()),
        Some("GOAL") => {}
        Some(_) => return Err("root node_type must be GOAL".to_string()),
    }

    let edges = root.get("edges").and_then(Value::as_array).ok_or("edges must be array")?;
    let mut depends_adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut decompose_adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut decompose_mode: HashMap<&str, &str> = HashMap::new();
    for edge in edges {
        let edge = edge.as_object().ok_or("each edge must be an object")?;
        for key in ["edge_id", "plan_id", "from_task_id", "to_task_id", "edge_type"] {
            if !edge.contains_key(key) {
                return Err(format!("edge missing key: {}", key));
            }
        }
        if edge.get("plan_id").and_then(as_str) != Some(plan_id) {
            return Err("edge.plan_id must equal plan.plan_id".to_string());
        }
        let edge_id = edge.get("edge_id").and_then(as_str).unwrap_or("");
        if !is_uuid(edge_id) {
            return Err("edge.edge_id must be a UUID string".to_string());
        }
        let from = edge.get("from_task_id").and_then(as_str).unwrap_or("");
        let to = edge.get("to_task_id").and_then(as_str).unwrap_or("");
        if !is_uuid(from) || !is_uuid(to) {
            return Err("edge.from_task_id/to_task_id must be UUID strings".to_string());
        }
        let edge_type = edge.get("edge_type").and_then(as_str).unwrap_or("");
        if EdgeType::from_str(edge_type).is_none() {
            return Err("edge.edge_type must be DECOMPOSE|DEPENDS_ON|ALTERNATIVE".to_string());
        }
        if !seen.contains(from) || !seen.contains(to) {
            return Err("edge endpoints must reference existing nodes.task_id".to_string());
        }
        let metadata = edge.get("metadata");
        if let Some(metadata) = metadata {
            if !metadata.is_object() && !metadata.is_null() {
                return Err("edge.metadata must be an object".to_string());
            }
        }
        let meta = metadata.and_then(Value::as_object);
        match edge_type {
            "DECOMPOSE" => {
                let and_or = meta
                    .and_then(|m| m.get("and_or"))
                    .and_then(as_str)
                    .unwrap_or("AND");
                if AndOr::from_str(and_or).is_none() {
                    return Err("DECOMPOSE.metadata.and_or must be AND|OR".to_string());
                }
                match decompose_mode.get(from) {
                    None => {
                        decompose_mode.insert(from, and_or);
                    }
                    Some(prev) if *prev != and_or => {
                        return Err(
                            "DECOMPOSE.metadata.and_or must be consistent for the same parent"
                                .to_string(),
                        );
                    }
                    _ => {}
                }
                decompose_adjacency.entry(from).or_default().push(to);
            }
            "ALTERNATIVE" => {
                let group_ok = meta
                    .and_then(|m| m.get("group_id"))
                    .and_then(as_str)
                    .map(|g| !g.is_empty())
                    .unwrap_or(false);
                if !group_ok {
                    return Err("ALTERNATIVE.metadata.group_id is required".to_string());
                }
            }
            _ => {
                depends_adjacency.entry(from).or_default().push(to);
            }
        }
    }

    let requirements = root
        .get("requirements")
        .and_then(Value::as_array)
        .ok_or("requirements must be array")?;
    for req in requirements {
        let req = req.as_object().ok_or("each requirement must be an object")?;
        for key in ["requirement_id", "task_id", "name", "kind", "required", "min_count", "allowed_types", "source"] {
            if !req.contains_key(key) {
                return Err(format!("requirement missing key: {}", key));
            }
        }
        let req_id = req.get("requirement_id").and_then(as_str).unwrap_or("");
        if !is_uuid(req_id) {
            return Err("requirement.requirement_id must be a UUID string".to_string());
        }
        let task_id = req.get("task_id").and_then(as_str).unwrap_or("");
        if !seen.contains(task_id) {
            return Err("requirement.task_id must reference an existing node.task_id".to_string());
        }
        let kind = req.get("kind").and_then(as_str).unwrap_or("");
        if RequirementKind::from_str(kind).is_none() {
            return Err("requirement.kind must be FILE|CONFIRMATION|SKILL_OUTPUT".to_string());
        }
        let source = req.get("source").and_then(as_str).unwrap_or("");
        if RequirementSource::from_str(source).is_none() {
            return Err("requirement.source must be USER|AGENT|ANY".to_string());
        }
        let allowed_ok = req
            .get("allowed_types")
            .and_then(Value::as_array)
            .map(|items| items.iter().all(Value::is_string))
            .unwrap_or(false);
        if !allowed_ok {
            return Err("requirement.allowed_types must be a string array".to_string());
        }
    }

    // DEPENDS_ON must be acyclic.
    detect_cycle(&depends_adjacency, &seen).map_err(|_| "cycle detected in DEPENDS_ON edges".to_string())?;
    // A DECOMPOSE cycle would make GOAL aggregation meaningless.
    detect_cycle(&decompose_adjacency, &seen).map_err(|_| "cycle detected in DECOMPOSE edges".to_string())?;

    // Every non-root node must be reachable from the root along DECOMPOSE.
    let mut reachable: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    reachable.insert(root_task_id);
    queue.push_back(root_task_id);
    while let Some(current) = queue.pop_front() {
        for child in decompose_adjacency.get(current).cloned().unwrap_or_default() {
            if reachable.insert(child) {
                queue.push_back(child);
            }
        }
    }
    for task_id in &seen {
        if !reachable.contains(task_id) {
            return Err("node not reachable from root via DECOMPOSE edges".to_string());
        }
    }

    Ok(())
}

fn detect_cycle<'a>(
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
    nodes: &HashSet<&'a str>,
) -> Result<(), ()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Visited,
    }
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    // Iterative DFS; an explicit stack avoids recursion limits on deep plans.
    for start in nodes.iter().copied() {
        if marks.contains_key(start) {
            continue;
        }
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        marks.insert(start, Mark::Visiting);
        while let Some((node, idx)) = stack.pop() {
            let children = adjacency.get(node).cloned().unwrap_or_default();
            if idx < children.len() {
                stack.push((node, idx + 1));
                let child = children[idx];
                match marks.get(child) {
                    Some(Mark::Visiting) => return Err(()),
                    Some(Mark::Visited) => {}
                    None => {
                        marks.insert(child, Mark::Visiting);
                        stack.push((child, 0));
                    }
                }
            } else {
                marks.insert(node, Mark::Visited);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Structured error inference
// =============================================================================

fn infer_error(scope: Scope, reason: &str, obj: &Value) -> ContractError {
    let schema_version = scope.schema_version().to_string();
    let mut json_path = "$".to_string();
    let mut expected = "valid contract".to_string();
    let mut actual = if reason.is_empty() { "invalid contract".to_string() } else { reason.to_string() };
    let mut example_fix = json!({"schema_version": schema_version}).to_string();

    if reason.contains("schema_version mismatch") {
        json_path = "$.schema_version".to_string();
        expected = schema_version.clone();
        actual = obj
            .get("schema_version")
            .and_then(Value::as_str)
            .unwrap_or(reason)
            .to_string();
    } else if let Some(rest) = reason.strip_prefix("missing key: ") {
        let key = rest.trim();
        json_path = format!("$.{}", key);
        expected = format!("object with key '{}'", key);
        actual = "missing".to_string();
        example_fix = json!({key: "<REQUIRED>"}).to_string();
    } else if let Some(rest) = reason.strip_prefix("node missing key: ") {
        let key = rest.trim();
        json_path = format!("$.nodes[*].{}", key);
        expected = format!("each node has '{}'", key);
        actual = "missing".to_string();
        example_fix = json!({"nodes": [{key: "<REQUIRED>"}]}).to_string();
    } else if reason.contains("artifact.format must be") {
        json_path = "$.artifact.format".to_string();
        expected = "one of: md|txt|json|html|css|js".to_string();
        actual = obj
            .get("artifact")
            .and_then(|a| a.get("format"))
            .and_then(Value::as_str)
            .unwrap_or(reason)
            .to_string();
        example_fix = json!({"artifact": {"format": "md"}}).to_string();
    } else if reason.contains("suggestion.priority must be") {
        json_path = "$.suggestions[*].priority".to_string();
        expected = "one of: HIGH|MED|LOW".to_string();
        example_fix = json!({"suggestions": [{"priority": "MED"}]}).to_string();
    } else if reason.contains("edge.edge_type must be") {
        json_path = "$.edges[*].edge_type".to_string();
        expected = "one of: DECOMPOSE|DEPENDS_ON|ALTERNATIVE".to_string();
        example_fix = json!({"edges": [{"edge_type": "DEPENDS_ON"}]}).to_string();
    } else if reason.contains("invalid result_type") {
        json_path = "$.result_type".to_string();
        expected = "one of: ARTIFACT|NEEDS_INPUT|NOOP|ERROR".to_string();
        actual = obj
            .get("result_type")
            .and_then(Value::as_str)
            .unwrap_or(reason)
            .to_string();
        example_fix = json!({"result_type": "ARTIFACT"}).to_string();
    } else if reason.contains("invalid action_required") {
        json_path = "$.action_required".to_string();
        expected = "one of: APPROVE|MODIFY|REQUEST_EXTERNAL_INPUT".to_string();
        actual = obj
            .get("action_required")
            .and_then(Value::as_str)
            .unwrap_or(reason)
            .to_string();
        example_fix = json!({"action_required": "MODIFY"}).to_string();
    } else if reason.contains("review_target mismatch") {
        json_path = "$.review_target".to_string();
        expected = scope.review_target().to_string();
        actual = obj
            .get("review_target")
            .and_then(Value::as_str)
            .unwrap_or(reason)
            .to_string();
        example_fix = json!({"review_target": scope.review_target()}).to_string();
    } else if reason.contains("total_score") {
        json_path = "$.total_score".to_string();
        expected = "integer 0..=100".to_string();
        example_fix = json!({"total_score": 80}).to_string();
    }

    ContractError {
        error_code: "SCHEMA_MISMATCH".to_string(),
        schema: scope.as_str().to_string(),
        schema_version,
        json_path,
        expected,
        actual,
        example_fix,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ContractContext {
        ContractContext {
            task_id: "11111111-1111-4111-8111-111111111111".to_string(),
            plan_id: String::new(),
            top_task: "create a 2048 game (single file index.html)".to_string(),
        }
    }

    // ---------------------------------------------------------------------
    // Actions
    // ---------------------------------------------------------------------

    #[test]
    fn test_action_artifact_passes() {
        let raw = json!({
            "schema_version": "xiaobo_action_v1",
            "task_id": "t",
            "result_type": "artifact",
            "artifact": {"name": "index", "format": ".HTML", "content": "<html></html>"},
        });
        let (normalized, err) = normalize_and_validate(Scope::TaskAction, &raw, &ctx());
        assert!(err.is_none(), "unexpected error: {:?}", err);
        assert_eq!(normalized["result_type"], "ARTIFACT");
        assert_eq!(normalized["artifact"]["format"], "html");
    }

    #[test]
    fn test_action_unwraps_envelope_and_backfills_task_id() {
        let raw = json!({"result": {"result_type": "NOOP"}});
        let (normalized, err) = normalize_and_validate(Scope::TaskAction, &raw, &ctx());
        assert!(err.is_none());
        assert_eq!(normalized["task_id"], ctx().task_id);
        assert_eq!(normalized["schema_version"], SCHEMA_ACTION);
    }

    #[test]
    fn test_action_needs_input_repairs_missing_docs() {
        let raw = json!({
            "result_type": "NEEDS_INPUT",
            "missing_inputs": [{"name": "product_spec", "reason": "need the PRD", "type": "md"}],
        });
        let (normalized, err) = normalize_and_validate(Scope::TaskAction, &raw, &ctx());
        assert!(err.is_none(), "unexpected error: {:?}", err);
        let docs = normalized["needs_input"]["required_docs"].as_array().unwrap();
        assert_eq!(docs[0]["name"], "product_spec");
        assert_eq!(docs[0]["accepted_types"][0], "md");
    }

    #[test]
    fn test_action_bad_format_yields_pathed_error() {
        let raw = json!({
            "result_type": "ARTIFACT",
            "artifact": {"name": "a", "format": "exe", "content": "x"},
        });
        let (_, err) = normalize_and_validate(Scope::TaskAction, &raw, &ctx());
        let err = err.unwrap();
        assert_eq!(err.json_path, "$.artifact.format");
        assert!(err.expected.contains("md|txt|json|html|css|js"));
    }

    #[test]
    fn test_action_unknown_result_type_rejected() {
        let raw = json!({"result_type": "SHRUG"});
        let (_, err) = normalize_and_validate(Scope::TaskAction, &raw, &ctx());
        assert_eq!(err.unwrap().json_path, "$.result_type");
    }

    // ---------------------------------------------------------------------
    // Reviews
    // ---------------------------------------------------------------------

    fn valid_review(score: i64, action: &str) -> Value {
        json!({
            "schema_version": "xiaojing_review_v1",
            "task_id": "t",
            "review_target": "NODE",
            "total_score": score,
            "action_required": action,
            "summary": "ok",
            "breakdown": [{"dimension": "overall", "score": score, "max_score": 100, "issues": []}],
            "suggestions": [],
        })
    }

    #[test]
    fn test_review_valid_passes() {
        let (_, err) = normalize_and_validate(Scope::TaskCheck, &valid_review(95, "APPROVE"), &ctx());
        assert!(err.is_none(), "unexpected error: {:?}", err);
    }

    #[test]
    fn test_review_normalization_preserves_decisions() {
        // A low score with APPROVE is semantically inconsistent, but it is the
        // reviewer's content; normalization must not rewrite either field.
        let raw = valid_review(70, "approve");
        let (normalized, err) = normalize_and_validate(Scope::TaskCheck, &raw, &ctx());
        assert!(err.is_none());
        assert_eq!(normalized["action_required"], "APPROVE");
        assert_eq!(normalized["total_score"], 70);
    }

    #[test]
    fn test_review_score_string_coerced() {
        let mut raw = valid_review(88, "MODIFY");
        raw["total_score"] = json!("88");
        let (normalized, err) = normalize_and_validate(Scope::TaskCheck, &raw, &ctx());
        assert!(err.is_none());
        assert_eq!(normalized["total_score"], 88);
    }

    #[test]
    fn test_review_priority_aliases() {
        let mut raw = valid_review(60, "MODIFY");
        raw["suggestions"] = json!([{"priority": "critical", "change": "add game-over screen"}]);
        let (normalized, err) = normalize_and_validate(Scope::TaskCheck, &raw, &ctx());
        assert!(err.is_none(), "unexpected error: {:?}", err);
        assert_eq!(normalized["suggestions"][0]["priority"], "HIGH");
        assert_eq!(normalized["suggestions"][0]["change"], "add game-over screen");
    }

    #[test]
    fn test_review_result_wrapper_peeled() {
        let raw = json!({
            "review_result": {
                "total_score": 82,
                "action_required": "MODIFY",
                "dimension_scores": [{"dimension": "completeness", "score": 82, "comment": "missing tests"}],
            },
            "summary": "needs work",
        });
        let (normalized, err) = normalize_and_validate(Scope::TaskCheck, &raw, &ctx());
        assert!(err.is_none(), "unexpected error: {:?}", err);
        assert_eq!(normalized["total_score"], 82);
        assert_eq!(normalized["breakdown"][0]["dimension"], "completeness");
    }

    #[test]
    fn test_review_missing_score_is_an_error_not_a_default() {
        let raw = json!({
            "task_id": "t",
            "action_required": "MODIFY",
            "summary": "partial",
        });
        let (_, err) = normalize_and_validate(Scope::TaskCheck, &raw, &ctx());
        let err = err.unwrap();
        assert_eq!(err.json_path, "$.total_score");
    }

    #[test]
    fn test_plan_review_target_alias() {
        let mut raw = valid_review(95, "APPROVE");
        raw["review_target"] = json!("PLAN_REVIEW");
        let (_, err) = normalize_and_validate(Scope::PlanReview, &raw, &ctx());
        assert!(err.is_none(), "unexpected error: {:?}", err);
    }

    // ---------------------------------------------------------------------
    // Plans
    // ---------------------------------------------------------------------

    #[test]
    fn test_plan_minimal_is_normalized_to_valid() {
        let raw = json!({
            "plan": {"title": "Build it"},
            "nodes": [
                {"id": "root", "type": "GOAL", "title": "Build it"},
                {"id": "a", "type": "ACTION", "title": "Write code"},
            ],
            "edges": [{"from": "root", "to": "a", "type": "DECOMPOSE"}],
            "requirements": [],
        });
        // "root" is not the declared root_task_id, so both nodes hang off the
        // synthesized root via generated DECOMPOSE edges.
        let (normalized, err) = normalize_and_validate(Scope::PlanGen, &raw, &ctx());
        assert!(err.is_none(), "unexpected error: {:?}", err);
        assert_eq!(normalized["schema_version"], SCHEMA_PLAN);
        assert!(normalized["nodes"].as_array().unwrap().len() >= 2);
    }

    #[test]
    fn test_plan_start_end_chain_rewritten() {
        let raw = json!({
            "plan": {"title": "Chained"},
            "nodes": [
                {"id": "step1", "type": "ACTION", "title": "One"},
                {"id": "step2", "type": "ACTION", "title": "Two"},
            ],
            "edges": [
                {"from": "START", "to": "step1", "type": "DEPENDS_ON"},
                {"from": "step1", "to": "step2", "type": "DEPENDS_ON"},
                {"from": "step2", "to": "END", "type": "DEPENDS_ON"},
            ],
        });
        let (normalized, err) = normalize_and_validate(Scope::PlanGen, &raw, &ctx());
        assert!(err.is_none(), "unexpected error: {:?}", err);
        let edges = normalized["edges"].as_array().unwrap();
        // No edge may reference a START/END placeholder node.
        let titles: Vec<&str> = normalized["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["title"].as_str().unwrap())
            .collect();
        assert!(!titles.iter().any(|t| t.contains("START") || t.contains("END")));
        assert!(edges
            .iter()
            .any(|e| e["edge_type"] == "DECOMPOSE"));
    }

    #[test]
    fn test_plan_missing_edges_synthesized_from_root() {
        let raw = json!({
            "plan": {"title": "Flat"},
            "nodes": [
                {"id": "a", "type": "ACTION", "title": "One"},
                {"id": "b", "type": "ACTION", "title": "Two"},
            ],
        });
        let (normalized, err) = normalize_and_validate(Scope::PlanGen, &raw, &ctx());
        assert!(err.is_none(), "unexpected error: {:?}", err);
        let root_id = normalized["plan"]["root_task_id"].as_str().unwrap();
        let decompose_from_root = normalized["edges"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|e| e["edge_type"] == "DECOMPOSE" && e["from_task_id"] == root_id)
            .count();
        assert_eq!(decompose_from_root, 2);
    }

    #[test]
    fn test_plan_depends_on_cycle_rejected() {
        let a = new_uuid();
        let b = new_uuid();
        let root = new_uuid();
        let plan_id = new_uuid();
        let raw = json!({
            "schema_version": "plan_json_v1",
            "plan": {"plan_id": plan_id, "title": "Cycle", "owner_agent_id": "xiaobo",
                     "root_task_id": root, "created_at": "2025-01-01T00:00:00Z"},
            "nodes": [
                {"task_id": root, "plan_id": plan_id, "node_type": "GOAL", "title": "Root", "owner_agent_id": "xiaobo", "priority": 0, "tags": []},
                {"task_id": a, "plan_id": plan_id, "node_type": "ACTION", "title": "A", "owner_agent_id": "xiaobo", "priority": 0, "tags": []},
                {"task_id": b, "plan_id": plan_id, "node_type": "ACTION", "title": "B", "owner_agent_id": "xiaobo", "priority": 0, "tags": []},
            ],
            "edges": [
                {"edge_id": new_uuid(), "plan_id": plan_id, "from_task_id": root, "to_task_id": a, "edge_type": "DECOMPOSE", "metadata": {"and_or": "AND"}},
                {"edge_id": new_uuid(), "plan_id": plan_id, "from_task_id": root, "to_task_id": b, "edge_type": "DECOMPOSE", "metadata": {"and_or": "AND"}},
                {"edge_id": new_uuid(), "plan_id": plan_id, "from_task_id": a, "to_task_id": b, "edge_type": "DEPENDS_ON"},
                {"edge_id": new_uuid(), "plan_id": plan_id, "from_task_id": b, "to_task_id": a, "edge_type": "DEPENDS_ON"},
            ],
            "requirements": [],
        });
        let err = validate_plan_json(&raw).unwrap_err();
        assert!(err.contains("cycle"), "got: {}", err);
    }

    #[test]
    fn test_plan_non_goal_root_rejected() {
        let root = new_uuid();
        let plan_id = new_uuid();
        let raw = json!({
            "schema_version": "plan_json_v1",
            "plan": {"plan_id": plan_id, "title": "Bad root", "owner_agent_id": "xiaobo",
                     "root_task_id": root, "created_at": "2025-01-01T00:00:00Z"},
            "nodes": [
                {"task_id": root, "plan_id": plan_id, "node_type": "ACTION", "title": "Root", "owner_agent_id": "xiaobo", "priority": 0, "tags": []},
            ],
            "edges": [],
            "requirements": [],
        });
        assert!(validate_plan_json(&raw).unwrap_err().contains("GOAL"));
    }

    #[test]
    fn test_requirement_coercion() {
        let raw = json!({
            "plan": {"title": "Reqs"},
            "nodes": [{"id": "a", "type": "ACTION", "title": "One"}],
            "requirements": [
                {"task_id": "a", "name": "product_spec", "kind": "docs", "required": "yes",
                 "min_count": 0, "allowed_types": "md", "source": "user"},
            ],
        });
        let (normalized, err) = normalize_and_validate(Scope::PlanGen, &raw, &ctx());
        assert!(err.is_none(), "unexpected error: {:?}", err);
        let req = &normalized["requirements"][0];
        assert_eq!(req["kind"], "FILE");
        assert_eq!(req["required"], 1);
        assert_eq!(req["min_count"], 1);
        assert_eq!(req["allowed_types"][0], "md");
        assert_eq!(req["source"], "USER");
    }

    // ---------------------------------------------------------------------
    // Round-trip property: normalization is idempotent
    // ---------------------------------------------------------------------

    #[test]
    fn test_normalize_review_is_idempotent() {
        let raw = json!({
            "review_result": {"total_score": "77", "action_required": "modify",
                              "suggestions": [{"problem": "thin", "dimension": "depth"}]},
            "summary": "needs depth",
        });
        let once = normalize_review(raw, "t1", "NODE");
        let twice = normalize_review(once.clone(), "t1", "NODE");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_normalize_action_is_idempotent() {
        let raw = json!({
            "result_type": "needs_input",
            "missing_inputs": [{"name": "spec", "reason": "need it"}],
        });
        let once = normalize_action(raw, "t1");
        let twice = normalize_action(once.clone(), "t1");
        assert_eq!(once, twice);
    }

    mod proptest_contracts {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Normalizing an already-normalized review is the identity.
            #[test]
            fn review_normalization_idempotent(score in 0i64..=100, action_idx in 0usize..3) {
                let action = ["APPROVE", "MODIFY", "REQUEST_EXTERNAL_INPUT"][action_idx];
                let raw = valid_review(score, action);
                let once = normalize_review(raw, "t", "NODE");
                let twice = normalize_review(once.clone(), "t", "NODE");
                prop_assert_eq!(once, twice);
            }

            // Validation never panics on arbitrary JSON-ish input.
            #[test]
            fn validators_total_on_fuzzed_objects(key in "[a-z_]{1,12}", value in "\\PC{0,40}") {
                let raw = json!({key: value});
                let _ = validate_action(&raw);
                let _ = validate_review(&raw, "NODE");
                let _ = validate_plan_json(&raw);
            }
        }
    }
}
