use uuid::Uuid;

use crate::error::IngestError;

/// Generates a fresh, time-ordered event or person id.
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

/// Validates a client- or caller-supplied uuid string, returning `InvalidInput`
/// rather than panicking on malformed input.
pub fn parse_id(raw: &str) -> Result<Uuid, IngestError> {
    Uuid::parse_str(raw).map_err(|e| IngestError::InvalidInput(format!("invalid uuid: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_id_is_v7() {
        let id = new_id();
        assert_eq!(id.get_version_num(), 7);
    }

    #[test]
    fn parse_id_rejects_garbage() {
        assert!(parse_id("not-a-uuid").is_err());
    }

    #[test]
    fn parse_id_accepts_valid_uuid() {
        let id = new_id();
        assert_eq!(parse_id(&id.to_string()).unwrap(), id);
    }
}
