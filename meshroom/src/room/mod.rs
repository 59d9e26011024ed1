//! Participant and room state shared between the orchestrator and whoever renders it.

use derive_more::Display;
use futures::stream::BoxStream;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{error::Error, media::MediaKind, signaling::MemberInfo};

mod session;

pub use session::*;

pub const DISPLAY_NAME_MIN_LEN: usize = 2;
pub const DISPLAY_NAME_MAX_LEN: usize = 20;

/// Identifier the signaling service assigns to each connected client.
/// Unique for the lifetime of that client's channel session.
#[derive(Debug, Display, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Trims `name` and checks its length. Returns the trimmed name.
pub fn validate_display_name(name: &str) -> Result<String, Error> {
    let trimmed = name.trim();
    let len = trimmed.chars().count();
    if !(DISPLAY_NAME_MIN_LEN..=DISPLAY_NAME_MAX_LEN).contains(&len) {
        return Err(Error::InvalidDisplayName(trimmed.to_string()));
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub is_screen_sharing: bool,
    pub is_self: bool,
}

impl Participant {
    pub fn new(connection_id: ConnectionId, display_name: impl Into<String>) -> Self {
        Self {
            connection_id,
            display_name: display_name.into(),
            is_muted: false,
            is_video_enabled: true,
            is_screen_sharing: false,
            is_self: false,
        }
    }

    fn local(connection_id: ConnectionId, display_name: impl Into<String>) -> Self {
        Self {
            is_self: true,
            ..Self::new(connection_id, display_name)
        }
    }
}

/// Lifecycle of a room session, from construction to teardown
#[derive(Debug, Display, Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    #[display(fmt = "Idle")]
    Idle,
    #[display(fmt = "AcquiringMedia")]
    AcquiringMedia,
    #[display(fmt = "ConnectingChannel")]
    ConnectingChannel,
    #[display(fmt = "JoiningRoom")]
    JoiningRoom,
    #[display(fmt = "Active")]
    Active,
    #[display(fmt = "Leaving")]
    Leaving,
    #[display(fmt = "Closed")]
    Closed,
}

impl SessionPhase {
    pub fn is_starting(&self) -> bool {
        matches!(
            self,
            SessionPhase::AcquiringMedia | SessionPhase::ConnectingChannel | SessionPhase::JoiningRoom
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, SessionPhase::Leaving | SessionPhase::Closed)
    }
}

#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Default)]
pub struct SessionFlags {
    pub joining: bool,
    pub joined: bool,
    pub leaving: bool,
}

/// Everything known about the room while a session is alive. Created when the room is
/// entered and discarded on leave.
#[derive(Debug, Clone)]
pub struct RoomSessionState {
    pub room_id: String,
    pub local_display_name: String,
    pub flags: SessionFlags,
    self_id: ConnectionId,
    participants: IndexMap<ConnectionId, Participant>,
}

impl RoomSessionState {
    pub fn new(room_id: impl Into<String>, local_display_name: impl Into<String>, self_id: ConnectionId) -> Self {
        let local_display_name = local_display_name.into();
        let mut participants = IndexMap::new();
        participants.insert(
            self_id.clone(),
            Participant::local(self_id.clone(), local_display_name.clone()),
        );
        Self {
            room_id: room_id.into(),
            local_display_name,
            flags: SessionFlags::default(),
            self_id,
            participants,
        }
    }

    pub fn self_id(&self) -> &ConnectionId {
        &self.self_id
    }

    pub fn local(&self) -> Option<&Participant> {
        self.participants.get(&self.self_id)
    }

    pub fn local_mut(&mut self) -> Option<&mut Participant> {
        self.participants.get_mut(&self.self_id)
    }

    pub fn apply_phase(&mut self, phase: SessionPhase) {
        self.flags = SessionFlags {
            joining: phase.is_starting(),
            joined: phase == SessionPhase::Active,
            leaving: phase.is_finished(),
        };
    }

    /// Records a remote member. Returns the participant when it was not yet known.
    pub fn upsert(&mut self, member: &MemberInfo) -> Option<Participant> {
        if member.is_self || member.connection_id == self.self_id {
            return None;
        }
        match self.participants.get_mut(&member.connection_id) {
            Some(existing) => {
                if !member.user_name.is_empty() {
                    existing.display_name = member.user_name.clone();
                }
                None
            }
            None => {
                let participant = Participant::new(member.connection_id.clone(), member.user_name.clone());
                self.participants
                    .insert(member.connection_id.clone(), participant.clone());
                Some(participant)
            }
        }
    }

    pub fn remove(&mut self, id: &ConnectionId) -> Option<Participant> {
        if id == &self.self_id {
            return None;
        }
        self.participants.shift_remove(id)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut Participant> {
        self.participants.get_mut(id)
    }

    pub fn display_name_of(&self, id: &ConnectionId) -> String {
        self.participants
            .get(id)
            .map(|p| p.display_name.clone())
            .unwrap_or_default()
    }

    /// Mute notifications only carry the display name, so every remote participant
    /// with that name is updated. Returns the participants that changed.
    pub fn set_muted_by_name(&mut self, display_name: &str, is_muted: bool) -> Vec<Participant> {
        self.participants
            .values_mut()
            .filter(|p| !p.is_self && p.display_name == display_name && p.is_muted != is_muted)
            .map(|p| {
                p.is_muted = is_muted;
                p.clone()
            })
            .collect()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }

    pub fn remote_count(&self) -> usize {
        self.participants.values().filter(|p| !p.is_self).count()
    }
}

/// Notifications for whoever renders the room
#[derive(Debug, Clone, Display)]
pub enum RoomEvent {
    #[display(fmt = "PhaseChanged: {phase}")]
    PhaseChanged { phase: SessionPhase },
    #[display(fmt = "ParticipantJoined: {}", "participant.connection_id")]
    ParticipantJoined { participant: Participant },
    #[display(fmt = "ParticipantLeft: {connection_id}")]
    ParticipantLeft {
        connection_id: ConnectionId,
        display_name: String,
    },
    #[display(fmt = "ParticipantUpdated: {}", "participant.connection_id")]
    ParticipantUpdated { participant: Participant },
    #[display(fmt = "SessionCreated: {connection_id} as {role}")]
    SessionCreated {
        connection_id: ConnectionId,
        role: Role,
    },
    #[display(fmt = "SessionStateChanged: {connection_id} -> {state}")]
    SessionStateChanged {
        connection_id: ConnectionId,
        state: NegotiationState,
    },
    #[display(fmt = "SessionClosed: {connection_id}")]
    SessionClosed { connection_id: ConnectionId },
    #[display(fmt = "RemoteTrack: {connection_id} {kind}")]
    RemoteTrack {
        connection_id: ConnectionId,
        kind: MediaKind,
    },
    #[display(fmt = "IceStateChanged: {connection_id} -> {state}")]
    IceStateChanged {
        connection_id: ConnectionId,
        state: IceState,
    },
    #[display(fmt = "ScreenShareEnded")]
    ScreenShareEnded,
    #[display(fmt = "ChannelError: {message}")]
    ChannelError { message: String },
    #[display(fmt = "Error: {message}")]
    Error { message: String },
    #[display(fmt = "Closed")]
    Closed,
}

pub struct RoomEventStream(pub BoxStream<'static, RoomEvent>);

impl core::ops::Deref for RoomEventStream {
    type Target = BoxStream<'static, RoomEvent>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for RoomEventStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn member(id: &str, name: &str) -> MemberInfo {
        MemberInfo {
            connection_id: ConnectionId::from(id),
            user_name: name.into(),
            is_self: false,
        }
    }

    #[test]
    fn display_name_bounds() {
        assert!(validate_display_name(" a ").is_err());
        assert!(validate_display_name("").is_err());
        assert_eq!(validate_display_name("  ana  ").unwrap(), "ana");
        assert!(validate_display_name(&"x".repeat(20)).is_ok());
        assert!(validate_display_name(&"x".repeat(21)).is_err());
    }

    #[test]
    fn self_is_synthesized_and_never_removed() {
        let mut state = RoomSessionState::new("R1", "ana", ConnectionId::from("me"));
        let local = state.local().cloned().unwrap();
        assert!(local.is_self);
        assert_eq!(local.display_name, "ana");

        assert!(state.remove(&ConnectionId::from("me")).is_none());
        assert_eq!(state.participants().len(), 1);
    }

    #[test]
    fn upsert_is_keyed_by_connection_id() {
        let mut state = RoomSessionState::new("R1", "ana", ConnectionId::from("me"));
        assert!(state.upsert(&member("b", "bob")).is_some());
        assert!(state.upsert(&member("b", "bobby")).is_none());
        assert_eq!(state.remote_count(), 1);
        assert_eq!(state.display_name_of(&ConnectionId::from("b")), "bobby");

        let flagged = MemberInfo {
            is_self: true,
            ..member("me-again", "ana")
        };
        assert!(state.upsert(&flagged).is_none());
        assert_eq!(state.remote_count(), 1);
    }

    #[test]
    fn new_participants_start_unmuted_with_video() {
        let mut state = RoomSessionState::new("R1", "ana", ConnectionId::from("me"));
        let p = state.upsert(&member("b", "bob")).unwrap();
        assert!(!p.is_muted);
        assert!(p.is_video_enabled);
        assert!(!p.is_screen_sharing);
        assert!(!p.is_self);
    }

    #[test]
    fn mute_by_name_updates_every_match() {
        let mut state = RoomSessionState::new("R1", "ana", ConnectionId::from("me"));
        state.upsert(&member("b", "bob"));
        state.upsert(&member("c", "bob"));
        state.upsert(&member("d", "dee"));

        let changed = state.set_muted_by_name("bob", true);
        assert_eq!(changed.len(), 2);
        assert!(state.get(&ConnectionId::from("b")).unwrap().is_muted);
        assert!(!state.get(&ConnectionId::from("d")).unwrap().is_muted);

        // already muted, nothing changes
        assert!(state.set_muted_by_name("bob", true).is_empty());
        // the local participant is never touched by remote notifications
        assert!(state.set_muted_by_name("ana", true).is_empty());
    }

    #[test]
    fn phase_drives_flags() {
        let mut state = RoomSessionState::new("R1", "ana", ConnectionId::from("me"));
        state.apply_phase(SessionPhase::JoiningRoom);
        assert!(state.flags.joining && !state.flags.joined);
        state.apply_phase(SessionPhase::Active);
        assert!(state.flags.joined && !state.flags.joining);
        state.apply_phase(SessionPhase::Leaving);
        assert!(state.flags.leaving && !state.flags.joined);
    }
}
