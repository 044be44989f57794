//! Assertion helpers returning [`ScenarioError::Assertion`] instead of
//! panicking.

use std::collections::BTreeSet;
use std::fmt::Debug;

use serde_json::Value;

use super::ScenarioError;
use crate::compute::ApiResponse;

/// Fails with `message` unless `condition` holds.
///
/// # Errors
///
/// Returns [`ScenarioError::Assertion`] when `condition` is false.
pub fn ensure(condition: bool, message: impl Into<String>) -> Result<(), ScenarioError> {
    if condition {
        Ok(())
    } else {
        Err(ScenarioError::Assertion(message.into()))
    }
}

/// Fails unless `actual == expected`.
///
/// # Errors
///
/// Returns [`ScenarioError::Assertion`] showing both values.
pub fn ensure_eq<T>(what: &str, expected: &T, actual: &T) -> Result<(), ScenarioError>
where
    T: PartialEq + Debug + ?Sized,
{
    ensure(
        actual == expected,
        format!("{what}: expected {expected:?}, got {actual:?}"),
    )
}

/// Fails unless the response status equals `expected`.
///
/// # Errors
///
/// Returns [`ScenarioError::Assertion`] carrying the response body.
pub fn expect_status(
    what: &str,
    response: &ApiResponse,
    expected: u16,
) -> Result<(), ScenarioError> {
    ensure(
        response.status == expected,
        format!(
            "{what}: expected HTTP {expected}, got {} ({})",
            response.status, response.body
        ),
    )
}

/// Fails unless `value` is an object whose keys are exactly `expected`.
///
/// # Errors
///
/// Returns [`ScenarioError::Assertion`] listing both key sets.
pub fn expect_keys(what: &str, value: &Value, expected: &[&str]) -> Result<(), ScenarioError> {
    let object = value
        .as_object()
        .ok_or_else(|| ScenarioError::Assertion(format!("{what}: expected an object, got {value}")))?;
    let actual: BTreeSet<&str> = object.keys().map(String::as_str).collect();
    let wanted: BTreeSet<&str> = expected.iter().copied().collect();
    ensure_eq(what, &wanted, &actual)
}

/// Returns `value[key]`.
///
/// # Errors
///
/// Returns [`ScenarioError::Assertion`] when the member is absent.
pub fn member<'v>(what: &str, value: &'v Value, key: &str) -> Result<&'v Value, ScenarioError> {
    value
        .get(key)
        .ok_or_else(|| ScenarioError::Assertion(format!("{what}: missing `{key}` in {value}")))
}

/// Returns `value[key]` as an array.
///
/// # Errors
///
/// Returns [`ScenarioError::Assertion`] when absent or not an array.
pub fn array<'v>(what: &str, value: &'v Value, key: &str) -> Result<&'v Vec<Value>, ScenarioError> {
    member(what, value, key)?
        .as_array()
        .ok_or_else(|| ScenarioError::Assertion(format!("{what}: `{key}` is not an array")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case::exact(json!({"id": 1, "name": "a", "links": []}), true)]
    #[case::extra(json!({"id": 1, "name": "a", "links": [], "status": "ACTIVE"}), false)]
    #[case::missing(json!({"id": 1, "name": "a"}), false)]
    #[case::not_object(json!([1, 2]), false)]
    fn compares_key_sets_exactly(#[case] value: Value, #[case] ok: bool) {
        let result = expect_keys("image", &value, &["id", "name", "links"]);

        assert_eq!(result.is_ok(), ok, "{result:?}");
    }

    #[test]
    fn status_mismatch_reports_body() {
        let response = ApiResponse {
            status: 500,
            location: None,
            body: json!({"computeFault": {"message": "boom"}}),
        };

        let err = expect_status("reboot", &response, 202).expect_err("500 is not 202");

        let message = err.to_string();
        assert!(message.contains("expected HTTP 202, got 500"), "{message}");
        assert!(message.contains("boom"), "{message}");
    }

    #[test]
    fn missing_member_is_an_assertion() {
        let err = member("snapshot", &json!({}), "image").expect_err("absent");

        assert!(err.is_failure());
    }
}
