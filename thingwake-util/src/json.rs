//! Serde helpers for stored documents

/// A [`Duration`](std::time::Duration) stored as whole milliseconds.
///
/// Use with `#[serde(with = "millis")]`.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Timer {
        #[serde(with = "millis")]
        after: Duration,
    }

    #[test]
    fn it_stores_durations_as_milliseconds() {
        let timer = Timer {
            after: Duration::from_millis(1500),
        };
        assert_eq!(serde_json::to_string(&timer).unwrap(), r#"{"after":1500}"#);

        let timer: Timer = serde_json::from_str(r#"{"after":250}"#).unwrap();
        assert_eq!(timer.after, Duration::from_millis(250));
    }

    #[test]
    fn it_rejects_negative_durations() {
        assert!(serde_json::from_str::<Timer>(r#"{"after":-1}"#).is_err());
    }
}
