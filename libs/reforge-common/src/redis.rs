use crate::types::TestCase;
use redis::{AsyncCommands, RedisResult};

/// Redis key layout for public test cases.
/// Keys are deterministic so the loader and the repair worker never drift.

pub const TESTS_PREFIX: &str = "reforge:tests";

/// Key holding the JSON array of cases for a question
pub fn tests_key(question_id: &str) -> String {
    format!("{}:{}", TESTS_PREFIX, question_id)
}

/// Store the cases for a question as a JSON array
pub async fn store_test_cases(
    conn: &mut redis::aio::ConnectionManager,
    question_id: &str,
    cases: &[TestCase],
) -> RedisResult<()> {
    let payload = serde_json::to_string(cases)
        .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string())))?;

    conn.set(tests_key(question_id), payload).await
}

/// Fetch the raw JSON payload for a question.
///
/// Parsing is left to the caller so an unparseable payload can be told apart
/// from a missing key.
pub async fn fetch_test_payload(
    conn: &mut redis::aio::ConnectionManager,
    question_id: &str,
) -> RedisResult<Option<String>> {
    conn.get(tests_key(question_id)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tests_key_deterministic() {
        assert_eq!(tests_key("abc301_a"), "reforge:tests:abc301_a");
        assert_eq!(tests_key("abc301_a"), tests_key("abc301_a"));
    }

    #[test]
    fn test_tests_key_keeps_identifier_verbatim() {
        let key = tests_key("LeetCode/two-sum");
        assert!(key.starts_with("reforge:tests:"));
        assert!(key.ends_with("LeetCode/two-sum"));
    }
}
