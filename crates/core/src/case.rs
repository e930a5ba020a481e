//! Test cases, turn records and per-case results.

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// One scripted turn supplied by the case loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Optional caller-assigned case id
    #[serde(default)]
    pub id: Option<String>,

    /// Conversation group key chosen by the case author
    #[serde(alias = "conversation_id", alias = "conversation_group_id")]
    pub group: String,

    /// Turn number within the group, starting at 1
    #[serde(alias = "round", alias = "turn_number")]
    pub turn: u32,

    /// Question sent as the query
    #[serde(alias = "user_question")]
    pub question: String,

    /// Expected reply, informational only
    #[serde(default, alias = "expected_response")]
    pub expected_reply: Option<String>,

    /// Extra structured inputs forwarded as `inputs`
    #[serde(default, deserialize_with = "deserialize_inputs")]
    pub inputs: Map<String, Value>,
}

impl TestCase {
    pub fn new(group: impl Into<String>, turn: u32, question: impl Into<String>) -> Self {
        Self {
            id: None,
            group: group.into(),
            turn,
            question: question.into(),
            expected_reply: None,
            inputs: Map::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Case id, falling back to the position in the submitted sequence.
    pub fn case_id(&self, index: usize) -> String {
        match &self.id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => format!("test_case_{}", index + 1),
        }
    }
}

/// Inputs may arrive as an object or as a JSON-encoded string.
fn deserialize_inputs<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(Value::String(raw)) => {
            if raw.trim().is_empty() {
                return Ok(Map::new());
            }
            match serde_json::from_str::<Value>(&raw).map_err(de::Error::custom)? {
                Value::Object(map) => Ok(map),
                other => Err(de::Error::custom(format!(
                    "inputs must be a JSON object, got {other}"
                ))),
            }
        }
        Some(other) => Err(de::Error::custom(format!(
            "inputs must be a JSON object, got {other}"
        ))),
    }
}

/// Outcome of one API call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Success,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Failed => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CallStatus::Success)
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 对话轮次记录（追加后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    /// 轮次号
    pub turn: u32,

    /// 用户问题
    pub question: String,

    /// Chatflow 回复
    pub reply: String,

    /// 调用状态
    pub status: CallStatus,

    /// 错误详情
    pub error: Option<String>,

    /// 响应时间（秒）
    pub latency_secs: f64,

    /// 时间戳
    pub timestamp: DateTime<Utc>,
}

impl TurnRecord {
    pub fn success(turn: u32, question: &str, reply: &str, latency: Duration) -> Self {
        Self {
            turn,
            question: question.to_string(),
            reply: reply.to_string(),
            status: CallStatus::Success,
            error: None,
            latency_secs: latency.as_secs_f64(),
            timestamp: Utc::now(),
        }
    }

    pub fn failed(turn: u32, question: &str, error: &str, latency: Duration) -> Self {
        Self {
            turn,
            question: question.to_string(),
            reply: String::new(),
            status: CallStatus::Failed,
            error: Some(error.to_string()),
            latency_secs: latency.as_secs_f64(),
            timestamp: Utc::now(),
        }
    }
}

/// Result of one processed case, as handed to the result sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub run_id: String,
    pub case_id: String,
    pub group: String,
    pub turn: u32,
    pub question: String,
    pub expected_reply: Option<String>,
    pub reply: String,
    pub latency_secs: f64,
    pub status: CallStatus,
    pub error: Option<String>,
    pub external_conversation_id: Option<String>,
    pub message_id: Option<String>,
    pub called_at: DateTime<Utc>,
}

impl CaseResult {
    /// A failed result for `case`, to be filled in by the caller.
    pub fn pending(run_id: &str, case_id: String, case: &TestCase) -> Self {
        Self {
            run_id: run_id.to_string(),
            case_id,
            group: case.group.clone(),
            turn: case.turn,
            question: case.question.clone(),
            expected_reply: case.expected_reply.clone(),
            reply: String::new(),
            latency_secs: 0.0,
            status: CallStatus::Failed,
            error: None,
            external_conversation_id: None,
            message_id: None,
            called_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The matching conversation history entry.
    pub fn to_turn_record(&self) -> TurnRecord {
        TurnRecord {
            turn: self.turn,
            question: self.question.clone(),
            reply: self.reply.clone(),
            status: self.status,
            error: self.error.clone(),
            latency_secs: self.latency_secs,
            timestamp: self.called_at,
        }
    }
}

/// Checks that every group numbers its turns `1..N` in submission order.
///
/// Returns one message per offending case.
pub fn validate_case_sequence(cases: &[TestCase]) -> Result<(), Vec<String>> {
    let mut seen: std::collections::HashMap<&str, u32> = std::collections::HashMap::new();
    let mut errors = Vec::new();

    for (index, case) in cases.iter().enumerate() {
        if case.group.trim().is_empty() {
            errors.push(format!("case {}: conversation group is empty", index + 1));
            continue;
        }
        if case.question.trim().is_empty() {
            errors.push(format!("case {}: question is empty", index + 1));
        }
        let last = seen.entry(case.group.as_str()).or_insert(0);
        let expected = *last + 1;
        if case.turn != expected {
            errors.push(format!(
                "case {}: group '{}' expected turn {}, got {}",
                index + 1,
                case.group,
                expected,
                case.turn
            ));
        } else {
            *last = case.turn;
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_case_accepts_loader_aliases() {
        let raw = json!({
            "conversation_id": "g1",
            "round": 2,
            "user_question": "How about tomorrow?",
            "expected_response": "Sunny",
            "inputs": "{\"city\": \"Berlin\"}"
        });
        let case: TestCase = serde_json::from_value(raw).unwrap();
        assert_eq!(case.group, "g1");
        assert_eq!(case.turn, 2);
        assert_eq!(case.expected_reply.as_deref(), Some("Sunny"));
        assert_eq!(case.inputs.get("city"), Some(&json!("Berlin")));
    }

    #[test]
    fn test_case_inputs_default_to_empty_object() {
        let raw = json!({"group": "g1", "turn": 1, "question": "hi", "inputs": ""});
        let case: TestCase = serde_json::from_value(raw).unwrap();
        assert!(case.inputs.is_empty());

        let raw = json!({"group": "g1", "turn": 1, "question": "hi"});
        let case: TestCase = serde_json::from_value(raw).unwrap();
        assert!(case.inputs.is_empty());
    }

    #[test]
    fn test_case_rejects_non_object_inputs() {
        let raw = json!({"group": "g1", "turn": 1, "question": "hi", "inputs": "[1, 2]"});
        assert!(serde_json::from_value::<TestCase>(raw).is_err());
    }

    #[test]
    fn test_case_id_falls_back_to_position() {
        let mut case = TestCase::new("g1", 1, "hi");
        assert_eq!(case.case_id(4), "test_case_5");
        case.id = Some("c-42".to_string());
        assert_eq!(case.case_id(4), "c-42");
    }

    #[test]
    fn test_validate_case_sequence_accepts_interleaved_groups() {
        let cases = vec![
            TestCase::new("a", 1, "q"),
            TestCase::new("b", 1, "q"),
            TestCase::new("a", 2, "q"),
            TestCase::new("b", 2, "q"),
            TestCase::new("a", 3, "q"),
        ];
        assert!(validate_case_sequence(&cases).is_ok());
    }

    #[test]
    fn test_validate_case_sequence_reports_gaps_and_repeats() {
        let cases = vec![
            TestCase::new("a", 1, "q"),
            TestCase::new("a", 3, "q"),
            TestCase::new("b", 2, "q"),
            TestCase::new("a", 2, "q"),
            TestCase::new("a", 2, "q"),
        ];
        let errors = validate_case_sequence(&cases).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors[0].contains("expected turn 2, got 3"));
        assert!(errors[1].contains("group 'b' expected turn 1"));
        assert!(errors[2].contains("expected turn 3, got 2"));
    }

    #[test]
    fn test_call_status_serde() {
        assert_eq!(serde_json::to_string(&CallStatus::Success).unwrap(), "\"success\"");
        let parsed: CallStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(parsed, CallStatus::Failed);
    }

    #[test]
    fn test_case_result_to_turn_record() {
        let case = TestCase::new("g1", 1, "hello");
        let mut result = CaseResult::pending("run-1", case.case_id(0), &case);
        result.status = CallStatus::Success;
        result.reply = "hi there".to_string();
        result.latency_secs = 0.5;

        let record = result.to_turn_record();
        assert_eq!(record.turn, 1);
        assert_eq!(record.reply, "hi there");
        assert!(record.status.is_success());
        assert_eq!(record.timestamp, result.called_at);
    }
}
