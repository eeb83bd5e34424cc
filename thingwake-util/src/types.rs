use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid thing name '{0}': expected 1-128 characters from [a-zA-Z0-9:_-]")]
pub struct InvalidThingNameError(String);

/// The name of the thing whose shadow this device reconciles
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct ThingName(String);

impl Deref for ThingName {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ThingName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ThingName {
    type Err = InvalidThingNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.len() <= 128
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-'));
        if valid {
            Ok(Self(s.to_owned()))
        } else {
            Err(InvalidThingNameError(s.to_owned()))
        }
    }
}

impl TryFrom<String> for ThingName {
    type Error = InvalidThingNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ThingName> for String {
    fn from(value: ThingName) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thing_name_parse() {
        let name = "ESP-a1b2c3".parse::<ThingName>().unwrap();
        assert_eq!(name.as_str(), "ESP-a1b2c3");
    }

    #[test]
    fn test_thing_name_rejects_empty() {
        assert!("".parse::<ThingName>().is_err());
    }

    #[test]
    fn test_thing_name_rejects_path_characters() {
        assert!("lamp/../other".parse::<ThingName>().is_err());
        assert!("lamp shade".parse::<ThingName>().is_err());
    }

    #[test]
    fn test_thing_name_deserialize_validates() {
        let res = serde_json::from_str::<ThingName>(r#""bad name""#);
        assert!(res.is_err());
    }
}
