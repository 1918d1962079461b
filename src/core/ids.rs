use super::{BatchError, Result};
use uuid::Uuid;

/// Parses an object id supplied by the caller.
///
/// Accepts the hyphenated, simple (hex), braced and urn forms, as well as
/// beacons and hrefs whose last path segment is the id
/// (`weaviate://localhost/Article/<uuid>`, `/v1/objects/<uuid>`).
pub fn parse_object_id(raw: &str) -> Result<Uuid> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(BatchError::Validation("object id must not be empty".into()));
    }

    let candidate = if trimmed.contains('/') {
        trimmed
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(trimmed)
    } else {
        trimmed
    };

    Uuid::parse_str(candidate)
        .map_err(|err| BatchError::Validation(format!("invalid UUID '{}': {}", raw, err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "806827e0-2b31-43ca-9269-24fa95a221f9";

    #[test]
    fn accepts_hyphenated_and_hex_forms() {
        let expected = Uuid::parse_str(ID).unwrap();
        assert_eq!(parse_object_id(ID).unwrap(), expected);
        assert_eq!(parse_object_id(&expected.simple().to_string()).unwrap(), expected);
        assert_eq!(parse_object_id(&format!("  {}  ", ID)).unwrap(), expected);
    }

    #[test]
    fn accepts_beacons_and_hrefs() {
        let expected = Uuid::parse_str(ID).unwrap();
        let beacon = format!("weaviate://localhost/Article/{}", ID);
        let href = format!("/v1/objects/{}/", ID);
        assert_eq!(parse_object_id(&beacon).unwrap(), expected);
        assert_eq!(parse_object_id(&href).unwrap(), expected);
    }

    #[test]
    fn rejects_garbage() {
        let err = parse_object_id("not-a-uuid").unwrap_err();
        assert!(matches!(err, BatchError::Validation(_)));
        assert!(err.to_string().contains("invalid UUID"));
        assert!(parse_object_id("   ").is_err());
    }
}
