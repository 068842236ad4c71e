//! Serde helpers that store a `std::time::Duration` as whole milliseconds.
//!
//! Use with `#[serde(with = "crate::utils::duration_ms")]`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    serializer.serialize_u64(millis)
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "super")]
        ttl: Duration,
    }

    #[test]
    fn test_duration_serialized_as_millis() {
        let json = serde_json::to_string(&Holder { ttl: Duration::from_secs(300) }).unwrap();
        assert_eq!(json, r#"{"ttl":300000}"#);

        let parsed: Holder = serde_json::from_str(r#"{"ttl":1500}"#).unwrap();
        assert_eq!(parsed.ttl, Duration::from_millis(1500));
    }
}
