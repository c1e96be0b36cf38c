//! Session code utilities
//!
//! Human-readable session identifiers of the form `P###S###`: zero-padded
//! patient ordinal plus per-patient session ordinal. The patient half is
//! extracted from the object path convention `P###/<file>.c3d`.

use once_cell::sync::Lazy;
use regex::Regex;

static PATIENT_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(P\d{3})/").unwrap());
static SESSION_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(P\d{3})(S\d{3})$").unwrap());

/// Extract the patient code from an object path (`P042/x.c3d` -> `P042`).
/// Returns `None` when the path does not follow the convention.
pub fn extract_patient_code(object_path: &str) -> Option<&str> {
    PATIENT_CODE_RE
        .captures(object_path)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Build a session code from a patient code and a 1-based session ordinal.
pub fn generate(patient_code: &str, session_ordinal: u32) -> String {
    format!("{}S{:03}", patient_code, session_ordinal)
}

/// Parse a session code back into `(patient_code, session_ordinal)`.
pub fn parse(session_code: &str) -> Option<(String, u32)> {
    let caps = SESSION_CODE_RE.captures(session_code)?;
    let patient = caps.get(1)?.as_str().to_string();
    let ordinal: u32 = caps.get(2)?.as_str()[1..].parse().ok()?;
    Some((patient, ordinal))
}

/// True when the string is a well-formed `P###S###` code.
pub fn is_valid(session_code: &str) -> bool {
    SESSION_CODE_RE.is_match(session_code)
}
