//! Classification of review-stage output into a verdict.
//!
//! Review output is structured JSON. Either a `verdict` string or an
//! `accepted` boolean is recognised; anything else is ambiguous.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewVerdict {
    Accept,
    Reject,
    Ambiguous,
}

const ACCEPT_WORDS: [&str; 4] = ["accept", "accepted", "approve", "approved"];
const REJECT_WORDS: [&str; 4] = ["reject", "rejected", "revise", "needs_revision"];

/// Classify the output of a review stage.
///
/// When both fields are present they must agree, otherwise the verdict is
/// [`ReviewVerdict::Ambiguous`].
pub fn classify(output: &Value) -> ReviewVerdict {
    let Some(obj) = output.as_object() else {
        return ReviewVerdict::Ambiguous;
    };

    let from_verdict = obj.get("verdict").and_then(Value::as_str).map(|v| {
        let v = v.trim().to_ascii_lowercase();
        if ACCEPT_WORDS.contains(&v.as_str()) {
            ReviewVerdict::Accept
        } else if REJECT_WORDS.contains(&v.as_str()) {
            ReviewVerdict::Reject
        } else {
            ReviewVerdict::Ambiguous
        }
    });

    let from_flag = obj.get("accepted").and_then(Value::as_bool).map(|accepted| {
        if accepted {
            ReviewVerdict::Accept
        } else {
            ReviewVerdict::Reject
        }
    });

    match (from_verdict, from_flag) {
        (Some(a), Some(b)) if a == b => a,
        (Some(_), Some(_)) => ReviewVerdict::Ambiguous,
        (Some(v), None) | (None, Some(v)) => v,
        (None, None) => ReviewVerdict::Ambiguous,
    }
}
