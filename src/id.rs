//! Type-strong wrappers for Discord snowflake IDs.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_u64 {
    ($($(#[$attr:meta])* $name:ident;)*) => {
        $(
            $(#[$attr])*
            #[derive(
                Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
                Serialize,
            )]
            pub struct $name(#[serde(with = "snowflake")] pub u64);

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    fmt::Display::fmt(&self.0, f)
                }
            }

            impl From<u64> for $name {
                fn from(id: u64) -> Self {
                    Self(id)
                }
            }
        )*
    };
}

id_u64! {
    /// ID of a guild (Discord server).
    GuildId;
    /// ID of a (voice) channel within a guild.
    ChannelId;
    /// ID of a user account, bot or human.
    UserId;
}

/// Snowflake codec: always written as a decimal string, read from either a
/// string or a bare integer.
///
/// Discord serialises 64-bit IDs as strings so that JavaScript clients do
/// not round them through an `f64`, but some gateway payloads still carry
/// plain numbers. Accept both.
pub(crate) mod snowflake {
    use serde::de::{Deserializer, Error, Unexpected};
    use serde::ser::Serializer;
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::Number(id) => Ok(id),
            Repr::Text(text) => text.parse().map_err(|_| {
                D::Error::invalid_value(Unexpected::Str(&text), &"a decimal u64 string")
            }),
        }
    }

    pub fn serialize<S>(id: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(id)
    }
}

#[cfg(test)]
mod tests {
    use super::GuildId;

    #[test]
    fn snowflakes_parse_from_either_representation() {
        let from_text: GuildId = serde_json::from_str(r#""41771983423143937""#).unwrap();
        let from_number: GuildId = serde_json::from_str("41771983423143937").unwrap();

        assert_eq!(from_text, GuildId(41771983423143937));
        assert_eq!(from_text, from_number);
    }

    #[test]
    fn snowflakes_serialise_as_strings() {
        let text = serde_json::to_string(&GuildId(7)).unwrap();

        assert_eq!(text, r#""7""#);
    }

    #[test]
    fn garbage_strings_are_rejected() {
        assert!(serde_json::from_str::<GuildId>(r#""not-a-number""#).is_err());
    }
}
