//! Test sources resolve a problem identifier to its public stdio cases.
//!
//! Resolution never fails with `Err`: an unknown identifier is `Missing`
//! and a record whose cases cannot be parsed is `Malformed`. Both end the
//! repair loop before any grading.

use async_trait::async_trait;
use reforge_common::types::{SuiteResolution, TestCase, TestSuite};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Fields of a dataset record that may identify the problem, in priority order
const ID_FIELDS: [&str; 3] = ["question_id", "task_id", "entry_point"];

/// Fields of a dataset record that may hold its cases, in priority order
const CASE_FIELDS: [&str; 3] = ["public_test_cases", "test", "tests"];

#[async_trait]
pub trait TestSource: Send + Sync {
    async fn resolve(&self, question_id: &str) -> SuiteResolution;
}

/// Parse cases from either a JSON array of `{input, output}` objects or a
/// JSON string encoding such an array (the usual dataset layout)
pub fn parse_cases(value: &Value) -> Result<Vec<TestCase>, String> {
    match value {
        Value::String(encoded) => {
            let decoded: Value = serde_json::from_str(encoded)
                .map_err(|e| format!("test cases are not valid JSON: {}", e))?;
            match decoded {
                Value::Array(_) => parse_cases(&decoded),
                other => Err(format!("expected an array of test cases, found {}", kind(&other))),
            }
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(idx, item)| {
                serde_json::from_value::<TestCase>(item.clone())
                    .map_err(|e| format!("test case {} is malformed: {}", idx + 1, e))
            })
            .collect(),
        other => Err(format!("expected an array of test cases, found {}", kind(&other))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn resolution_from_record(question_id: &str, record: &Value) -> SuiteResolution {
    let Some(cases) = CASE_FIELDS.iter().find_map(|field| record.get(*field)) else {
        return SuiteResolution::Malformed {
            reason: format!("Record for {} has no test case field", question_id),
        };
    };

    match parse_cases(cases) {
        Ok(cases) => SuiteResolution::Resolved(TestSuite::new(question_id, cases)),
        Err(reason) => SuiteResolution::Malformed {
            reason: format!("Test cases for {} could not be parsed: {}", question_id, reason),
        },
    }
}

/// Dataset file with one JSON record per line
#[derive(Debug, Clone)]
pub struct JsonlTestSource {
    path: PathBuf,
}

impl JsonlTestSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TestSource for JsonlTestSource {
    async fn resolve(&self, question_id: &str) -> SuiteResolution {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read test dataset");
                return SuiteResolution::Missing {
                    reason: format!("Test dataset {} unreadable: {}", self.path.display(), e),
                };
            }
        };

        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: Value = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) => {
                    debug!(line = line_no + 1, error = %e, "Skipping unparseable dataset line");
                    continue;
                }
            };

            let matches = ID_FIELDS
                .iter()
                .any(|field| record.get(*field).and_then(Value::as_str) == Some(question_id));
            if matches {
                debug!(question_id = %question_id, line = line_no + 1, "Found dataset record");
                return resolution_from_record(question_id, &record);
            }
        }

        SuiteResolution::Missing {
            reason: format!("No test cases found for {}", question_id),
        }
    }
}

/// Reads the JSON array stored under `reforge:tests:{question_id}`
#[derive(Clone)]
pub struct RedisTestSource {
    conn: redis::aio::ConnectionManager,
}

impl RedisTestSource {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl TestSource for RedisTestSource {
    async fn resolve(&self, question_id: &str) -> SuiteResolution {
        let mut conn = self.conn.clone();
        match reforge_common::redis::fetch_test_payload(&mut conn, question_id).await {
            Ok(Some(payload)) => resolution_from_record(
                question_id,
                &serde_json::json!({ "tests": Value::String(payload) }),
            ),
            Ok(None) => SuiteResolution::Missing {
                reason: format!("No test cases found for {}", question_id),
            },
            Err(e) => {
                warn!(question_id = %question_id, error = %e, "Redis lookup failed");
                SuiteResolution::Missing {
                    reason: format!("Test lookup for {} failed: {}", question_id, e),
                }
            }
        }
    }
}

/// Map-backed source for library callers that already hold their cases
#[derive(Debug, Clone, Default)]
pub struct InMemoryTestSource {
    entries: HashMap<String, SuiteResolution>,
}

impl InMemoryTestSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cases(mut self, question_id: &str, cases: Vec<TestCase>) -> Self {
        self.entries.insert(
            question_id.to_string(),
            SuiteResolution::Resolved(TestSuite::new(question_id, cases)),
        );
        self
    }

    pub fn with_malformed(mut self, question_id: &str, reason: &str) -> Self {
        self.entries.insert(
            question_id.to_string(),
            SuiteResolution::Malformed {
                reason: reason.to_string(),
            },
        );
        self
    }
}

#[async_trait]
impl TestSource for InMemoryTestSource {
    async fn resolve(&self, question_id: &str) -> SuiteResolution {
        self.entries
            .get(question_id)
            .cloned()
            .unwrap_or_else(|| SuiteResolution::Missing {
                reason: format!("No test cases found for {}", question_id),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_dataset(lines: &[&str]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("reforge-dataset-{}.jsonl", uuid::Uuid::new_v4()));
        fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    #[test]
    fn test_parse_cases_from_encoded_string() {
        let value = Value::String(
            r#"[{"input": "1 2\n", "output": "3\n", "testtype": "stdin"}]"#.to_string(),
        );
        let cases = parse_cases(&value).unwrap();
        assert_eq!(cases, vec![TestCase::new("1 2\n", "3\n")]);
    }

    #[test]
    fn test_parse_cases_rejects_non_array() {
        let err = parse_cases(&Value::String(r#"{"input": "1"}"#.to_string())).unwrap_err();
        assert!(err.contains("an object"));

        let err = parse_cases(&serde_json::json!([{"input": "1"}])).unwrap_err();
        assert!(err.contains("test case 1 is malformed"));
    }

    #[tokio::test]
    async fn test_jsonl_resolves_by_question_id() {
        let path = write_dataset(&[
            r#"{"question_id": "abc100_a", "public_test_cases": "[{\"input\": \"2\\n\", \"output\": \"4\\n\"}]"}"#,
            "not json at all",
            r#"{"question_id": "abc100_b", "public_test_cases": []}"#,
        ]);
        let source = JsonlTestSource::new(&path);

        match source.resolve("abc100_a").await {
            SuiteResolution::Resolved(suite) => {
                assert_eq!(suite.question_id, "abc100_a");
                assert_eq!(suite.cases, vec![TestCase::new("2\n", "4\n")]);
            }
            other => panic!("expected resolved suite, got {:?}", other),
        }

        match source.resolve("abc100_b").await {
            SuiteResolution::Resolved(suite) => assert!(suite.is_empty()),
            other => panic!("expected empty suite, got {:?}", other),
        }

        fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_jsonl_falls_back_to_entry_point() {
        let path = write_dataset(&[
            r#"{"entry_point": "solve", "test": [{"input": "", "output": "ok"}]}"#,
        ]);
        let source = JsonlTestSource::new(&path);

        assert!(matches!(source.resolve("solve").await, SuiteResolution::Resolved(_)));
        fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_jsonl_missing_and_malformed() {
        let path = write_dataset(&[
            r#"{"question_id": "broken", "public_test_cases": "[{\"input\": "}"#,
            r#"{"question_id": "no_cases"}"#,
        ]);
        let source = JsonlTestSource::new(&path);

        assert!(matches!(source.resolve("unknown").await, SuiteResolution::Missing { .. }));
        assert!(matches!(source.resolve("broken").await, SuiteResolution::Malformed { .. }));
        assert!(matches!(source.resolve("no_cases").await, SuiteResolution::Malformed { .. }));
        fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_jsonl_unreadable_file_is_missing() {
        let source = JsonlTestSource::new("/nonexistent/dataset.jsonl");
        match source.resolve("abc").await {
            SuiteResolution::Missing { reason } => assert!(reason.contains("unreadable")),
            other => panic!("expected missing, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_in_memory_source() {
        let source = InMemoryTestSource::new()
            .with_cases("q1", vec![TestCase::new("1", "1")])
            .with_malformed("q2", "bad payload");

        assert_eq!(source.resolve("q1").await.suite().unwrap().len(), 1);
        assert!(matches!(source.resolve("q2").await, SuiteResolution::Malformed { .. }));
        assert!(matches!(source.resolve("q3").await, SuiteResolution::Missing { .. }));
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_source_round_trip() {
        let client = redis::Client::open("redis://127.0.0.1:6379").expect("Failed to create Redis client");
        let mut conn = client.get_connection_manager().await.expect("Failed to connect to Redis");
        let question_id = format!("test-{}", uuid::Uuid::new_v4());
        reforge_common::redis::store_test_cases(&mut conn, &question_id, &[TestCase::new("5\n", "10\n")])
            .await
            .expect("Failed to store cases");

        let source = RedisTestSource::new(conn);
        assert_eq!(source.resolve(&question_id).await.suite().unwrap().len(), 1);
        assert!(matches!(source.resolve("never-stored").await, SuiteResolution::Missing { .. }));
    }
}
