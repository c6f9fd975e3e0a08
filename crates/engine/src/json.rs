use serde::de::DeserializeOwned;
use thiserror::Error;

/// JSON decode failure carrying the field path where decoding stopped.
#[derive(Debug, Error)]
#[error("parse {what}{location}: {message}")]
pub struct JsonError {
    pub what: String,
    pub path: Option<String>,
    location: String,
    message: String,
}

impl JsonError {
    pub fn message(&self) -> &str {
        &self.message
    }
}

pub fn parse_json<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T, JsonError> {
    let mut deserializer = serde_json::Deserializer::from_str(raw);
    serde_path_to_error::deserialize::<_, T>(&mut deserializer).map_err(|error| {
        let path = error.path().to_string();
        let message = error.into_inner().to_string();
        if path.is_empty() || path == "." {
            JsonError {
                what: what.to_string(),
                path: None,
                location: String::new(),
                message,
            }
        } else {
            JsonError {
                what: what.to_string(),
                location: format!(" at {path}"),
                path: Some(path),
                message,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Outer {
        #[allow(dead_code)]
        inner: Vec<Inner>,
    }

    #[derive(Debug, Deserialize)]
    struct Inner {
        #[allow(dead_code)]
        level: u8,
    }

    #[test]
    fn error_reports_field_path() {
        let err = parse_json::<Outer>(r#"{"inner":[{"level":1},{"level":"x"}]}"#, "sample")
            .expect_err("should fail");
        assert_eq!(err.path.as_deref(), Some("inner[1].level"));
        assert!(err.to_string().starts_with("parse sample at inner[1].level: "));
    }

    #[test]
    fn root_level_error_has_no_path() {
        let err = parse_json::<Outer>("not json", "sample").expect_err("should fail");
        assert!(err.path.is_none());
        assert!(err.to_string().starts_with("parse sample: "));
    }
}
