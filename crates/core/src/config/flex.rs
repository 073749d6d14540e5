//! Lenient scalar deserialization.
//!
//! KV and label providers deliver every leaf as a string; the same struct
//! fields must also accept native JSON scalars. These helpers parse either
//! form into the field's declared type.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, de};

/// Accept either the native representation of `T` or its string form.
pub fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw<T> {
        Typed(T),
        Text(String),
    }

    match Raw::<T>::deserialize(deserializer)? {
        Raw::Typed(v) => Ok(v),
        Raw::Text(s) => s.trim().parse().map_err(de::Error::custom),
    }
}

/// [`lenient`] for optional fields; pair with `#[serde(default)]`.
pub fn lenient_opt<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: Display,
{
    lenient(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Probe {
        #[serde(deserialize_with = "super::lenient")]
        n: u64,
        #[serde(deserialize_with = "super::lenient")]
        flag: bool,
        #[serde(default, deserialize_with = "super::lenient_opt")]
        maybe: Option<i32>,
    }

    #[test]
    fn native_scalars() {
        let p: Probe = serde_json::from_str(r#"{"n": 5, "flag": true, "maybe": -1}"#).unwrap();
        assert_eq!(
            p,
            Probe {
                n: 5,
                flag: true,
                maybe: Some(-1)
            }
        );
    }

    #[test]
    fn string_scalars() {
        let p: Probe = serde_json::from_str(r#"{"n": "5", "flag": "true", "maybe": "-1"}"#).unwrap();
        assert_eq!(p.n, 5);
        assert!(p.flag);
        assert_eq!(p.maybe, Some(-1));
    }

    #[test]
    fn missing_optional() {
        let p: Probe = serde_json::from_str(r#"{"n": "0", "flag": false}"#).unwrap();
        assert_eq!(p.maybe, None);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(serde_json::from_str::<Probe>(r#"{"n": "five", "flag": false}"#).is_err());
    }
}
