//! Message contract of the signaling channel.
//!
//! The channel only carries membership and negotiation metadata, never media. Outbound
//! messages are [`SignalCommand`]s, inbound ones are [`SignalEvent`]s. Both serialize as
//! JSON objects tagged with the remote method name so a server can dispatch on it
//! directly.

use async_trait::async_trait;
use derive_more::Display;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{error::Error, room::ConnectionId};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub connection_id: ConnectionId,
    pub user_name: String,
    #[serde(default)]
    pub is_self: bool,
}

impl MemberInfo {
    pub fn new(connection_id: impl Into<ConnectionId>, user_name: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_name: user_name.into(),
            is_self: false,
        }
    }
}

#[derive(Debug, Display, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    #[display(fmt = "offer")]
    Offer,
    #[display(fmt = "answer")]
    Answer,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

/// Requests sent to the signaling service
#[derive(Debug, Display, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "method", content = "params")]
pub enum SignalCommand {
    #[display(fmt = "JoinRoom")]
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String, user_name: String },
    #[display(fmt = "LeaveRoom")]
    LeaveRoom,
    #[display(fmt = "SendOffer")]
    SendOffer {
        target: ConnectionId,
        offer: SessionDescription,
    },
    #[display(fmt = "SendAnswer")]
    SendAnswer {
        target: ConnectionId,
        answer: SessionDescription,
    },
    #[display(fmt = "SendIceCandidate")]
    SendIceCandidate {
        target: ConnectionId,
        candidate: IceCandidate,
    },
    #[display(fmt = "ToggleMute")]
    #[serde(rename_all = "camelCase")]
    ToggleMute { is_muted: bool },
    #[display(fmt = "ShareScreen")]
    #[serde(rename_all = "camelCase")]
    ShareScreen { is_sharing: bool },
    /// only sent when video state broadcasting is enabled
    #[display(fmt = "ToggleVideo")]
    #[serde(rename_all = "camelCase")]
    ToggleVideo { is_enabled: bool },
}

impl SignalCommand {
    pub fn target(&self) -> Option<&ConnectionId> {
        match self {
            SignalCommand::SendOffer { target, .. }
            | SignalCommand::SendAnswer { target, .. }
            | SignalCommand::SendIceCandidate { target, .. } => Some(target),
            _ => None,
        }
    }
}

/// Notifications pushed by the signaling service
#[derive(Debug, Display, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum SignalEvent {
    /// full membership snapshot delivered to a newcomer
    #[display(fmt = "RoomInfo")]
    #[serde(rename_all = "camelCase")]
    RoomInfo { all_users: Vec<MemberInfo> },
    /// one member that was already present
    #[display(fmt = "ExistingUser")]
    ExistingUser(MemberInfo),
    /// a member that just arrived, announced to everyone already present
    #[display(fmt = "NewUserJoined")]
    NewUserJoined(MemberInfo),
    #[display(fmt = "UserLeft")]
    #[serde(rename_all = "camelCase")]
    UserLeft {
        connection_id: ConnectionId,
        user_name: String,
    },
    #[display(fmt = "ReceiveOffer")]
    #[serde(rename_all = "camelCase")]
    ReceiveOffer {
        from_connection_id: ConnectionId,
        offer: SessionDescription,
    },
    #[display(fmt = "ReceiveAnswer")]
    #[serde(rename_all = "camelCase")]
    ReceiveAnswer {
        from_connection_id: ConnectionId,
        answer: SessionDescription,
    },
    #[display(fmt = "ReceiveIceCandidate")]
    #[serde(rename_all = "camelCase")]
    ReceiveIceCandidate {
        from_connection_id: ConnectionId,
        candidate: IceCandidate,
    },
    #[display(fmt = "UserMuteChanged")]
    #[serde(rename_all = "camelCase")]
    UserMuteChanged { user_name: String, is_muted: bool },
    #[display(fmt = "UserScreenSharing")]
    #[serde(rename_all = "camelCase")]
    UserScreenSharing {
        connection_id: ConnectionId,
        is_sharing: bool,
    },
    #[display(fmt = "UserVideoChanged")]
    #[serde(rename_all = "camelCase")]
    UserVideoChanged {
        connection_id: ConnectionId,
        is_enabled: bool,
    },
    #[display(fmt = "Error")]
    Error { message: String },
}

/// How the router treats an inbound event
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum SignalClass {
    /// needs local media before it can be processed; queued in arrival order
    #[display(fmt = "membership")]
    Membership,
    /// dispatched immediately, never queued
    #[display(fmt = "departure")]
    Departure,
    /// offer/answer/candidate; waits on local media readiness
    #[display(fmt = "negotiation")]
    Negotiation,
    /// participant flags and channel errors
    #[display(fmt = "status")]
    Status,
}

impl SignalEvent {
    pub fn class(&self) -> SignalClass {
        match self {
            SignalEvent::RoomInfo { .. }
            | SignalEvent::ExistingUser(_)
            | SignalEvent::NewUserJoined(_) => SignalClass::Membership,
            SignalEvent::UserLeft { .. } => SignalClass::Departure,
            SignalEvent::ReceiveOffer { .. }
            | SignalEvent::ReceiveAnswer { .. }
            | SignalEvent::ReceiveIceCandidate { .. } => SignalClass::Negotiation,
            SignalEvent::UserMuteChanged { .. }
            | SignalEvent::UserScreenSharing { .. }
            | SignalEvent::UserVideoChanged { .. }
            | SignalEvent::Error { .. } => SignalClass::Status,
        }
    }

    /// remote peer a negotiation message came from
    pub fn sender(&self) -> Option<&ConnectionId> {
        match self {
            SignalEvent::ReceiveOffer {
                from_connection_id, ..
            }
            | SignalEvent::ReceiveAnswer {
                from_connection_id, ..
            }
            | SignalEvent::ReceiveIceCandidate {
                from_connection_id, ..
            } => Some(from_connection_id),
            _ => None,
        }
    }
}

pub struct SignalEventStream(pub BoxStream<'static, SignalEvent>);

impl core::ops::Deref for SignalEventStream {
    type Target = BoxStream<'static, SignalEvent>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for SignalEventStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Client side of the room signaling service.
///
/// The channel is an explicit service: `connect` before use and `disconnect` when done.
/// Transport and reconnection are up to the implementation.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn connect(&self) -> Result<(), Error>;

    fn is_connected(&self) -> bool;

    /// Identifier the service assigned to this client, once connected
    fn connection_id(&self) -> Option<ConnectionId>;

    /// Stream of inbound events. Events received before subscribing are not replayed.
    fn subscribe(&self) -> Result<SignalEventStream, Error>;

    async fn invoke(&self, command: SignalCommand) -> Result<(), Error>;

    async fn disconnect(&self) -> Result<(), Error>;
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_are_tagged_by_method() -> anyhow::Result<()> {
        let cmd = SignalCommand::JoinRoom {
            room_id: "R1".into(),
            user_name: "ana".into(),
        };
        assert_eq!(
            serde_json::to_value(&cmd)?,
            json!({"method": "JoinRoom", "params": {"roomId": "R1", "userName": "ana"}})
        );

        let cmd = SignalCommand::ToggleMute { is_muted: true };
        assert_eq!(
            serde_json::to_value(&cmd)?,
            json!({"method": "ToggleMute", "params": {"isMuted": true}})
        );
        Ok(())
    }

    #[test]
    fn events_parse_from_wire_names() -> anyhow::Result<()> {
        let raw = json!({
            "event": "RoomInfo",
            "data": {"allUsers": [
                {"connectionId": "a", "userName": "ana", "isSelf": true},
                {"connectionId": "b", "userName": "bob"}
            ]}
        });
        let event: SignalEvent = serde_json::from_value(raw)?;
        match event {
            SignalEvent::RoomInfo { all_users } => {
                assert_eq!(all_users.len(), 2);
                assert!(all_users[0].is_self);
                assert!(!all_users[1].is_self);
            }
            other => anyhow::bail!("unexpected event {other}"),
        }

        let raw = json!({
            "event": "ReceiveIceCandidate",
            "data": {
                "fromConnectionId": "b",
                "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
            }
        });
        let event: SignalEvent = serde_json::from_value(raw)?;
        assert_eq!(event.class(), SignalClass::Negotiation);
        assert_eq!(event.sender(), Some(&ConnectionId::from("b")));
        Ok(())
    }

    #[test]
    fn event_classes() {
        let member = MemberInfo::new("c", "cat");
        assert_eq!(
            SignalEvent::NewUserJoined(member.clone()).class(),
            SignalClass::Membership
        );
        assert_eq!(
            SignalEvent::ExistingUser(member).class(),
            SignalClass::Membership
        );
        assert_eq!(
            SignalEvent::UserLeft {
                connection_id: "c".into(),
                user_name: "cat".into()
            }
            .class(),
            SignalClass::Departure
        );
        assert_eq!(
            SignalEvent::Error {
                message: "boom".into()
            }
            .class(),
            SignalClass::Status
        );
    }
}
