//! Room lookup consulted before a session starts. Only the success flag and the room
//! metadata are used.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RoomCheck {
    pub success: bool,
    #[serde(default)]
    pub room: Option<RoomInfo>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RoomCheck {
    pub fn into_result(self, room_id: &str) -> Result<Option<RoomInfo>, Error> {
        if self.success {
            return Ok(self.room);
        }
        if let Some(reason) = self.error {
            log::warn!("room {room_id} rejected: {reason}");
        }
        Err(Error::RoomNotFound(room_id.to_string()))
    }
}

#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn join_room(&self, room_id: &str, display_name: &str) -> Result<RoomCheck, Error>;
}
