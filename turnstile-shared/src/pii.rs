use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Wraps a requester identifier so it never shows up verbatim in log output.
///
/// `Debug` and `Display` print a short fingerprint (first two characters and the
/// length) which is enough to correlate log lines without exposing the value.
/// Serialization passes the real value through, since API responses need it.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Redacted<T>(pub T);

impl<T: AsRef<str>> Redacted<T> {
    fn fingerprint(&self) -> String {
        let value = self.0.as_ref();
        let head: String = value.chars().take(2).collect();
        format!("{}***({})", head, value.chars().count())
    }
}

impl<T: AsRef<str>> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

impl<T: AsRef<str>> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

impl<T: Serialize> Serialize for Redacted<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

/// Renders an optional requester for log fields.
pub fn redact_opt(value: Option<&str>) -> String {
    match value {
        Some(v) => Redacted(v).to_string(),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_masks_value() {
        let id = Redacted("user-12345".to_string());
        assert_eq!(format!("{}", id), "us***(10)");
        assert_eq!(format!("{:?}", id), "us***(10)");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"user-12345\"");
        assert_eq!(redact_opt(None), "-");
    }
}
