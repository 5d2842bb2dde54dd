use serde::de::Error as DeError;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::model::opcode::Opcode;
use crate::model::payload::*;

/// A representation of data received for voice gateway events.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Event {
    /// Used to begin a voice websocket connection.
    Identify(Identify),
    /// Used to select the voice protocol and encryption mechanism.
    SelectProtocol(SelectProtocol),
    /// Server's response to the client's Identify operation. Contains
    /// session-specific information, e.g. SSRC, and supported encryption
    /// modes.
    Ready(Ready),
    /// Periodic messages used to keep the websocket connection alive.
    Heartbeat(Heartbeat),
    /// Server's confirmation of a negotiated encryption scheme.
    SessionDescription(SessionDescription),
    /// A voice event denoting that someone is speaking.
    Speaking(Speaking),
    /// Acknowledgement of a heartbeat, echoing its nonce.
    HeartbeatAck(HeartbeatAck),
    /// Sent by the client after a disconnect to attempt to resume a session.
    Resume(Resume),
    /// Used to determine how often the client must send a heartbeat.
    Hello(Hello),
    /// Message received if a Resume request was successful.
    Resumed,
}

impl Event {
    pub fn kind(&self) -> Opcode {
        use Event::*;
        match self {
            Identify(_) => Opcode::Identify,
            SelectProtocol(_) => Opcode::SelectProtocol,
            Ready(_) => Opcode::Ready,
            Heartbeat(_) => Opcode::Heartbeat,
            SessionDescription(_) => Opcode::SessionDescription,
            Speaking(_) => Opcode::Speaking,
            HeartbeatAck(_) => Opcode::HeartbeatAck,
            Resume(_) => Opcode::Resume,
            Hello(_) => Opcode::Hello,
            Resumed => Opcode::Resumed,
        }
    }
}

impl Serialize for Event {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use Event::*;

        let mut envelope = serializer.serialize_struct("Event", 2)?;
        envelope.serialize_field("op", &self.kind())?;

        match self {
            Identify(d) => envelope.serialize_field("d", d),
            SelectProtocol(d) => envelope.serialize_field("d", d),
            Ready(d) => envelope.serialize_field("d", d),
            Heartbeat(d) => envelope.serialize_field("d", d),
            SessionDescription(d) => envelope.serialize_field("d", d),
            Speaking(d) => envelope.serialize_field("d", d),
            HeartbeatAck(d) => envelope.serialize_field("d", d),
            Resume(d) => envelope.serialize_field("d", d),
            Hello(d) => envelope.serialize_field("d", d),
            // Resumed carries no body; the envelope still wants a "d": null.
            Resumed => envelope.serialize_field("d", &None::<()>),
        }?;

        envelope.end()
    }
}

/// The `{op, d}` envelope every gateway message travels in.
#[derive(Deserialize)]
struct Envelope {
    op: Opcode,
    #[serde(default)]
    d: Value,
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Envelope { op, d } = Envelope::deserialize(deserializer)?;

        (match op {
            Opcode::Identify => serde_json::from_value::<Identify>(d).map(Into::into),
            Opcode::SelectProtocol => serde_json::from_value::<SelectProtocol>(d).map(Into::into),
            Opcode::Ready => serde_json::from_value::<Ready>(d).map(Into::into),
            Opcode::Heartbeat => serde_json::from_value::<Heartbeat>(d).map(Into::into),
            Opcode::SessionDescription =>
                serde_json::from_value::<SessionDescription>(d).map(Into::into),
            Opcode::Speaking => serde_json::from_value::<Speaking>(d).map(Into::into),
            Opcode::HeartbeatAck => serde_json::from_value::<HeartbeatAck>(d).map(Into::into),
            Opcode::Resume => serde_json::from_value::<Resume>(d).map(Into::into),
            Opcode::Hello => serde_json::from_value::<Hello>(d).map(Into::into),
            Opcode::Resumed => Ok(Event::Resumed),
        })
        .map_err(DeError::custom)
    }
}

impl From<Identify> for Event {
    fn from(evt: Identify) -> Self {
        Event::Identify(evt)
    }
}

impl From<SelectProtocol> for Event {
    fn from(evt: SelectProtocol) -> Self {
        Event::SelectProtocol(evt)
    }
}

impl From<Ready> for Event {
    fn from(evt: Ready) -> Self {
        Event::Ready(evt)
    }
}

impl From<Heartbeat> for Event {
    fn from(evt: Heartbeat) -> Self {
        Event::Heartbeat(evt)
    }
}

impl From<SessionDescription> for Event {
    fn from(evt: SessionDescription) -> Self {
        Event::SessionDescription(evt)
    }
}

impl From<Speaking> for Event {
    fn from(evt: Speaking) -> Self {
        Event::Speaking(evt)
    }
}

impl From<HeartbeatAck> for Event {
    fn from(evt: HeartbeatAck) -> Self {
        Event::HeartbeatAck(evt)
    }
}

impl From<Resume> for Event {
    fn from(evt: Resume) -> Self {
        Event::Resume(evt)
    }
}

impl From<Hello> for Event {
    fn from(evt: Hello) -> Self {
        Event::Hello(evt)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use serde_test::Token;

    use super::Event;
    use crate::id::*;
    use crate::model::opcode::Opcode;
    use crate::model::payload::*;

    #[test]
    fn deserialize_identify_json() {
        let json_data = r#"{
          "d": {
            "server_id": "41771983423143937",
            "user_id": "104694319306248192",
            "session_id": "my_session_id",
            "token": "my_token"
          },
          "op": 0
        }"#;

        let event = serde_json::from_str(json_data);

        let ident = Identify {
            session_id: "my_session_id".into(),
            token: "my_token".into(),
            server_id: GuildId(41771983423143937),
            user_id: UserId(104694319306248192),
        };

        assert!(matches!(event, Ok(Event::Identify(i)) if i == ident));
    }

    #[test]
    fn deserialize_ready_json() {
        let json_data = r#"{
            "op": 2,
            "d": {
                "ssrc": 12345,
                "ip": "127.0.0.1",
                "port": 1234,
                "modes": ["xsalsa20_poly1305", "xsalsa20_poly1305_suffix"],
                "heartbeat_interval": 1
            }
        }"#;

        // NOTE: the interval in Ready is an API footgun and must be dropped.

        let event = serde_json::from_str(json_data);

        let ready = Ready {
            ssrc: 12345,
            ip: Ipv4Addr::new(127, 0, 0, 1).into(),
            port: 1234,
            modes: vec![
                "xsalsa20_poly1305".into(),
                "xsalsa20_poly1305_suffix".into(),
            ],
        };

        assert!(matches!(event, Ok(Event::Ready(i)) if i == ready));
    }

    #[test]
    fn deserialize_heartbeat_json() {
        let json_data = r#"{
          "op": 3,
          "d": 1501184119561
        }"#;

        let event = serde_json::from_str(json_data);

        let hb = Heartbeat {
            nonce: 1501184119561,
        };

        assert!(matches!(event, Ok(Event::Heartbeat(i)) if i == hb));
    }

    #[test]
    fn deserialize_session_description_json() {
        let json_data = r#"{
            "op": 4,
            "d": {
                "mode": "xsalsa20_poly1305",
                "secret_key": [251, 100, 11]
            }
        }"#;
        let event = serde_json::from_str(json_data);

        let sd = SessionDescription {
            mode: "xsalsa20_poly1305".into(),
            secret_key: vec![251, 100, 11],
        };

        assert!(matches!(event, Ok(Event::SessionDescription(i)) if i == sd));
    }

    #[test]
    fn deserialize_speaking_json() {
        let json_data = r#"{
            "op": 5,
            "d": {
                "speaking": 5,
                "delay": 0,
                "ssrc": 1
            }
        }"#;
        let event = serde_json::from_str(json_data);

        let speak = Speaking {
            speaking: SpeakingState::PRIORITY | SpeakingState::MICROPHONE,
            ssrc: 1,
            delay: Some(0),
            user_id: None,
        };

        assert!(matches!(event, Ok(Event::Speaking(i)) if i == speak));
    }

    #[test]
    fn deserialize_hello_json() {
        let json_data = r#"{
          "op": 8,
          "d": {
            "heartbeat_interval": 41250
          }
        }"#;

        let event = serde_json::from_str(json_data);

        let hello = Hello {
            heartbeat_interval: 41250.0,
        };

        assert!(match event {
            Ok(Event::Hello(i)) =>
                (i.heartbeat_interval - hello.heartbeat_interval).abs() < f64::EPSILON,
            _ => false,
        });
    }

    #[test]
    fn deserialize_resumed_json() {
        let json_data = r#"{
          "op": 9,
          "d": null
        }"#;

        let event = serde_json::from_str(json_data);

        assert!(matches!(event, Ok(Event::Resumed)));
    }

    #[test]
    fn deserialize_unknown_opcode_fails() {
        let json_data = r#"{
          "op": 12,
          "d": {
            "audio_ssrc": 5678,
            "user_id": "1234",
            "video_ssrc": 9012
          }
        }"#;

        assert!(serde_json::from_str::<Event>(json_data).is_err());
    }

    #[test]
    fn serialize_identify() {
        let value: Event = Identify {
            server_id: GuildId(1),
            session_id: "56f88a86dce65c65b9".into(),
            token: "56f88a86dce65c65b8".into(),
            user_id: UserId(2),
        }
        .into();

        serde_test::assert_ser_tokens(&value, &[
            Token::Struct {
                name: "Event",
                len: 2,
            },
            Token::Str("op"),
            Token::U8(Opcode::Identify as u8),
            Token::Str("d"),
            Token::Struct {
                name: "Identify",
                len: 4,
            },
            Token::Str("server_id"),
            Token::NewtypeStruct {
                name: "GuildId",
            },
            Token::Str("1"),
            Token::Str("user_id"),
            Token::NewtypeStruct {
                name: "UserId",
            },
            Token::Str("2"),
            Token::Str("session_id"),
            Token::Str("56f88a86dce65c65b9"),
            Token::Str("token"),
            Token::Str("56f88a86dce65c65b8"),
            Token::StructEnd,
            Token::StructEnd,
        ]);
    }

    #[test]
    fn serialize_heartbeat() {
        let value: Event = Heartbeat {
            nonce: 1234567890,
        }
        .into();

        serde_test::assert_ser_tokens(&value, &[
            Token::Struct {
                name: "Event",
                len: 2,
            },
            Token::Str("op"),
            Token::U8(Opcode::Heartbeat as u8),
            Token::Str("d"),
            Token::Str("1234567890"),
            Token::StructEnd,
        ]);
    }

    #[test]
    fn serialize_speaking() {
        let value: Event = Speaking {
            delay: Some(0),
            speaking: SpeakingState::MICROPHONE,
            ssrc: 12345678,
            user_id: None,
        }
        .into();

        serde_test::assert_ser_tokens(&value, &[
            Token::Struct {
                name: "Event",
                len: 2,
            },
            Token::Str("op"),
            Token::U8(Opcode::Speaking as u8),
            Token::Str("d"),
            Token::Struct {
                name: "Speaking",
                len: 4,
            },
            Token::Str("speaking"),
            Token::U8(1),
            Token::Str("delay"),
            Token::Some,
            Token::U32(0),
            Token::Str("ssrc"),
            Token::U32(12345678),
            Token::Str("user_id"),
            Token::None,
            Token::StructEnd,
            Token::StructEnd,
        ]);
    }

    #[test]
    fn serialize_resumed() {
        let value = Event::Resumed;

        serde_test::assert_ser_tokens(&value, &[
            Token::Struct {
                name: "Event",
                len: 2,
            },
            Token::Str("op"),
            Token::U8(Opcode::Resumed as u8),
            Token::Str("d"),
            Token::None,
            Token::StructEnd,
        ]);
    }

    #[test]
    fn round_trip_select_protocol() {
        let value: Event = SelectProtocol {
            protocol: "udp".into(),
            data: ProtocolData {
                address: Ipv4Addr::new(192, 168, 0, 141).into(),
                port: 40404,
                mode: "xsalsa20_poly1305".into(),
            },
        }
        .into();

        let text = serde_json::to_string(&value).unwrap();
        let back: Event = serde_json::from_str(&text).unwrap();

        assert!(
            matches!(back, Event::SelectProtocol(p) if p.protocol == "udp"
                && p.data.port == 40404
                && p.data.mode == "xsalsa20_poly1305")
        );
    }
}
