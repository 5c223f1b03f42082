//! Typed data model and event set for the sixin realtime protocol.
//!
//! Inbound events are decoded once, at the transport boundary, into
//! [`ClientEvent`]. Handlers only ever see the typed variants. Outbound
//! events are [`ServerEvent`]s; each transport codec decides how to frame them.

use crate::error::{SixinError, SixinResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub type UserId = u64;
pub type RoomId = u64;

/// Which transport a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Named-event socket (Engine.IO / Socket.IO framing over WebSocket).
    EventSocket,
    /// Plain WebSocket carrying `{type, data}` JSON envelopes.
    PlainSocket,
}

// ── Chat data ─────────────────────────────────────────────────────────

/// A chat message in flight or in history.
///
/// Exactly one of `listener_id` (direct) or `room_id` (group) is non-zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub msg_id: String,
    #[serde(default)]
    pub talker_id: UserId,
    #[serde(default)]
    pub listener_id: UserId,
    #[serde(default)]
    pub room_id: RoomId,
    #[serde(default)]
    pub text: Value,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, rename = "type")]
    pub kind: i32,
    #[serde(default)]
    pub mention_id_list: Vec<UserId>,
}

/// Where a chat message is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    Direct(UserId),
    Room(RoomId),
}

impl ChatMessage {
    /// Resolve the delivery target, rejecting messages that name both or neither.
    pub fn target(&self) -> SixinResult<MessageTarget> {
        match (self.listener_id, self.room_id) {
            (0, 0) => Err(SixinError::Protocol(
                "message needs a listenerId or a roomId".into(),
            )),
            (l, 0) => Ok(MessageTarget::Direct(l)),
            (0, r) => Ok(MessageTarget::Room(r)),
            _ => Err(SixinError::Protocol(
                "listenerId and roomId are mutually exclusive".into(),
            )),
        }
    }

    /// Structural validation performed before a message is persisted.
    pub fn validate(&self) -> SixinResult<()> {
        self.target()?;
        if self.text.is_null() {
            return Err(SixinError::Protocol("message text is required".into()));
        }
        if self.msg_id.len() > 128 {
            return Err(SixinError::Protocol("msgId too long".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub email: String,
}

/// Fields a user may change on their own profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner_id: UserId,
    #[serde(default)]
    pub avatar: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewRoom {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomUpdate {
    pub id: RoomId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

/// A user's membership record in a room, with their private alias.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomMember {
    pub user_id: UserId,
    pub room_id: RoomId,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub is_private: bool,
}

// ── WebRTC signaling data ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as exchanged by browsers: `{"type": "...", "sdp": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default, rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, rename = "usernameFragment", skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

// ── Inbound events ────────────────────────────────────────────────────

/// Every event a client can send, decoded and typed.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Message(ChatMessage),
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidateInit),
    SelfProfile,
    ToggleReceive,
    ToggleEmail,
    GetChats,
    GetRooms,
    GetUsers,
    GetRoomByUsers { room_id: RoomId },
    CreateRoom(NewRoom),
    UpdateRoom(RoomUpdate),
    DeleteRoom { room_id: RoomId },
    UpdateUser(ProfileUpdate),
    DeleteUser,
    AddFriend { friend_id: UserId, alias: String, is_private: bool },
    RemoveFriend { friend_id: UserId },
    UpdateFriendAlias { friend_id: UserId, alias: String },
    SetFriendPrivacy { friend_id: UserId, is_private: bool },
    AddUserToRoom { room_id: RoomId, alias: String, is_private: bool },
    RemoveUserFromRoom { room_id: RoomId },
    UpdateRoomAlias { room_id: RoomId, alias: String },
    SetRoomPrivacy { room_id: RoomId, is_private: bool },
}

impl ClientEvent {
    /// Decode a named event with positional arguments (event socket).
    pub fn from_socket_event(name: &str, args: &[Value]) -> SixinResult<Self> {
        let event = match name {
            "message" => ClientEvent::Message(arg_json(args, 0, "message body")?),
            "offer" => {
                let desc: SessionDescription = arg_json(args, 0, "SDP offer")?;
                if desc.sdp_type != SdpType::Offer {
                    return Err(SixinError::Protocol("offer event carries a non-offer SDP".into()));
                }
                ClientEvent::Offer(desc)
            }
            "answer" => {
                let desc: SessionDescription = arg_json(args, 0, "SDP answer")?;
                if !matches!(desc.sdp_type, SdpType::Answer | SdpType::Pranswer) {
                    return Err(SixinError::Protocol("answer event carries a non-answer SDP".into()));
                }
                ClientEvent::Answer(desc)
            }
            "ice-candidate" => ClientEvent::IceCandidate(arg_json(args, 0, "ICE candidate")?),
            "self" => ClientEvent::SelfProfile,
            "receive" => ClientEvent::ToggleReceive,
            "email" => ClientEvent::ToggleEmail,
            "getChats" => ClientEvent::GetChats,
            "getRooms" => ClientEvent::GetRooms,
            "getUsers" => ClientEvent::GetUsers,
            "getRoomByUsers" => ClientEvent::GetRoomByUsers {
                room_id: arg_id(args, 0, "room id")?,
            },
            "createRoom" => ClientEvent::CreateRoom(arg_json(args, 0, "room data")?),
            "updateRoom" => {
                let update: RoomUpdate = arg_json(args, 0, "room update")?;
                if update.id == 0 {
                    return Err(SixinError::Protocol("invalid room id".into()));
                }
                ClientEvent::UpdateRoom(update)
            }
            "deleteRoom" => ClientEvent::DeleteRoom {
                room_id: arg_id(args, 0, "room id")?,
            },
            "updateUser" => ClientEvent::UpdateUser(arg_json(args, 0, "profile update")?),
            "deleteUser" => ClientEvent::DeleteUser,
            "addFriend" => ClientEvent::AddFriend {
                friend_id: arg_id(args, 0, "friend id")?,
                alias: opt_str(args, 1, "alias")?.unwrap_or_default(),
                is_private: opt_bool(args, 2, "privacy flag")?.unwrap_or(false),
            },
            "removeFriend" => ClientEvent::RemoveFriend {
                friend_id: arg_id(args, 0, "friend id")?,
            },
            "updateFriendAlias" => ClientEvent::UpdateFriendAlias {
                friend_id: arg_id(args, 0, "friend id")?,
                alias: arg_str(args, 1, "alias")?,
            },
            "setFriendPrivacy" => ClientEvent::SetFriendPrivacy {
                friend_id: arg_id(args, 0, "friend id")?,
                is_private: arg_bool(args, 1, "privacy flag")?,
            },
            "addUserToRoom" => ClientEvent::AddUserToRoom {
                room_id: arg_id(args, 0, "room id")?,
                alias: opt_str(args, 1, "alias")?.unwrap_or_default(),
                is_private: opt_bool(args, 2, "privacy flag")?.unwrap_or(false),
            },
            "removeUserFromRoom" => ClientEvent::RemoveUserFromRoom {
                room_id: arg_id(args, 0, "room id")?,
            },
            "updateRoomAlias" => ClientEvent::UpdateRoomAlias {
                room_id: arg_id(args, 0, "room id")?,
                alias: arg_str(args, 1, "alias")?,
            },
            "setRoomPrivacy" => ClientEvent::SetRoomPrivacy {
                room_id: arg_id(args, 0, "room id")?,
                is_private: arg_bool(args, 1, "privacy flag")?,
            },
            other => return Err(SixinError::Protocol(format!("unknown event: {other}"))),
        };
        Ok(event)
    }

    /// Decode a `{type, data}` envelope (plain WebSocket).
    ///
    /// The plain socket carries chat messages and friend/room mutations only.
    pub fn from_envelope(kind: &str, data: Value) -> SixinResult<Self> {
        let event = match kind {
            "message" => ClientEvent::Message(from_data(data, "message")?),
            "addFriend" => {
                let req: FriendRequest = from_data(data, "addFriend")?;
                ClientEvent::AddFriend {
                    friend_id: req.friend_id,
                    alias: req.alias,
                    is_private: req.is_private,
                }
            }
            "removeFriend" => {
                let req: FriendRequest = from_data(data, "removeFriend")?;
                ClientEvent::RemoveFriend { friend_id: req.friend_id }
            }
            "updateFriendAlias" => {
                let req: FriendRequest = from_data(data, "updateFriendAlias")?;
                ClientEvent::UpdateFriendAlias {
                    friend_id: req.friend_id,
                    alias: req.alias,
                }
            }
            "setFriendPrivacy" => {
                let req: FriendRequest = from_data(data, "setFriendPrivacy")?;
                ClientEvent::SetFriendPrivacy {
                    friend_id: req.friend_id,
                    is_private: req.is_private,
                }
            }
            "addUserToRoom" => {
                let req: RoomRequest = from_data(data, "addUserToRoom")?;
                ClientEvent::AddUserToRoom {
                    room_id: req.room_id,
                    alias: req.alias,
                    is_private: req.is_private,
                }
            }
            "removeUserFromRoom" => {
                let req: RoomRequest = from_data(data, "removeUserFromRoom")?;
                ClientEvent::RemoveUserFromRoom { room_id: req.room_id }
            }
            "updateRoomAlias" => {
                let req: RoomRequest = from_data(data, "updateRoomAlias")?;
                ClientEvent::UpdateRoomAlias {
                    room_id: req.room_id,
                    alias: req.alias,
                }
            }
            "setRoomPrivacy" => {
                let req: RoomRequest = from_data(data, "setRoomPrivacy")?;
                ClientEvent::SetRoomPrivacy {
                    room_id: req.room_id,
                    is_private: req.is_private,
                }
            }
            "getRoomAliasByUsers" | "getRoomByUsers" => ClientEvent::GetRoomByUsers {
                room_id: value_id(&data, "room id")?,
            },
            other => {
                return Err(SixinError::Protocol(format!(
                    "unsupported envelope type: {other}"
                )))
            }
        };
        Ok(event)
    }

    /// Wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Message(_) => "message",
            ClientEvent::Offer(_) => "offer",
            ClientEvent::Answer(_) => "answer",
            ClientEvent::IceCandidate(_) => "ice-candidate",
            ClientEvent::SelfProfile => "self",
            ClientEvent::ToggleReceive => "receive",
            ClientEvent::ToggleEmail => "email",
            ClientEvent::GetChats => "getChats",
            ClientEvent::GetRooms => "getRooms",
            ClientEvent::GetUsers => "getUsers",
            ClientEvent::GetRoomByUsers { .. } => "getRoomByUsers",
            ClientEvent::CreateRoom(_) => "createRoom",
            ClientEvent::UpdateRoom(_) => "updateRoom",
            ClientEvent::DeleteRoom { .. } => "deleteRoom",
            ClientEvent::UpdateUser(_) => "updateUser",
            ClientEvent::DeleteUser => "deleteUser",
            ClientEvent::AddFriend { .. } => "addFriend",
            ClientEvent::RemoveFriend { .. } => "removeFriend",
            ClientEvent::UpdateFriendAlias { .. } => "updateFriendAlias",
            ClientEvent::SetFriendPrivacy { .. } => "setFriendPrivacy",
            ClientEvent::AddUserToRoom { .. } => "addUserToRoom",
            ClientEvent::RemoveUserFromRoom { .. } => "removeUserFromRoom",
            ClientEvent::UpdateRoomAlias { .. } => "updateRoomAlias",
            ClientEvent::SetRoomPrivacy { .. } => "setRoomPrivacy",
        }
    }
}

#[derive(Debug, Deserialize)]
struct FriendRequest {
    friend_id: UserId,
    #[serde(default)]
    alias: String,
    #[serde(default)]
    is_private: bool,
}

#[derive(Debug, Deserialize)]
struct RoomRequest {
    room_id: RoomId,
    #[serde(default)]
    alias: String,
    #[serde(default)]
    is_private: bool,
}

// ── Typed argument decoding ───────────────────────────────────────────

fn arg<'a>(args: &'a [Value], index: usize, what: &str) -> SixinResult<&'a Value> {
    args.get(index)
        .filter(|v| !v.is_null())
        .ok_or_else(|| SixinError::Protocol(format!("missing {what}")))
}

/// A structured argument: either a JSON object or a string holding JSON.
fn arg_json<T: DeserializeOwned>(args: &[Value], index: usize, what: &str) -> SixinResult<T> {
    match arg(args, index, what)? {
        Value::String(s) => serde_json::from_str(s)
            .map_err(|e| SixinError::Protocol(format!("invalid {what}: {e}"))),
        other => serde_json::from_value(other.clone())
            .map_err(|e| SixinError::Protocol(format!("invalid {what}: {e}"))),
    }
}

fn arg_id(args: &[Value], index: usize, what: &str) -> SixinResult<u64> {
    value_id(arg(args, index, what)?, what)
}

fn value_id(value: &Value, what: &str) -> SixinResult<u64> {
    let id = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match id {
        Some(id) if id != 0 => Ok(id),
        _ => Err(SixinError::Protocol(format!("invalid {what}"))),
    }
}

fn arg_str(args: &[Value], index: usize, what: &str) -> SixinResult<String> {
    match arg(args, index, what)? {
        Value::String(s) => Ok(s.clone()),
        _ => Err(SixinError::Protocol(format!("{what} must be a string"))),
    }
}

fn arg_bool(args: &[Value], index: usize, what: &str) -> SixinResult<bool> {
    match arg(args, index, what)? {
        Value::Bool(b) => Ok(*b),
        _ => Err(SixinError::Protocol(format!("{what} must be a boolean"))),
    }
}

fn opt_str(args: &[Value], index: usize, what: &str) -> SixinResult<Option<String>> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => arg_str(args, index, what).map(Some),
    }
}

fn opt_bool(args: &[Value], index: usize, what: &str) -> SixinResult<Option<bool>> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => arg_bool(args, index, what).map(Some),
    }
}

fn from_data<T: DeserializeOwned>(data: Value, kind: &str) -> SixinResult<T> {
    serde_json::from_value(data)
        .map_err(|e| SixinError::Protocol(format!("invalid {kind} data: {e}")))
}

// ── Outbound events ───────────────────────────────────────────────────

/// Every event the server pushes to a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Message(ChatMessage),
    Answer(SessionDescription),
    SelfProfile(Option<UserProfile>),
    Receive(bool),
    Email(bool),
    Qrcode(String),
    Error(String),
    Chats(Vec<ChatMessage>),
    Rooms(Vec<Room>),
    Users(Vec<UserProfile>),
    RoomByUsers(Vec<RoomMember>),
    RoomCreated(Room),
    RoomUpdated(Room),
    RoomDeleted(RoomId),
    UserUpdated(UserProfile),
    UserDeleted(UserId),
    FriendAdded { user_id: UserId, friend_id: UserId },
    FriendRemoved { user_id: UserId, friend_id: UserId },
    FriendAliasUpdated { user_id: UserId, friend_id: UserId, alias: String },
    FriendPrivacySet { user_id: UserId, friend_id: UserId, privacy: bool },
    UserAddedToRoom { user_id: UserId, room_id: RoomId },
    UserRemovedFromRoom { user_id: UserId, room_id: RoomId },
    RoomAliasUpdated { user_id: UserId, room_id: RoomId, alias: String },
    RoomPrivacySet { user_id: UserId, room_id: RoomId, privacy: bool },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Message(_) => "message",
            ServerEvent::Answer(_) => "answer",
            ServerEvent::SelfProfile(_) => "self",
            ServerEvent::Receive(_) => "receive",
            ServerEvent::Email(_) => "email",
            ServerEvent::Qrcode(_) => "qrcode",
            ServerEvent::Error(_) => "error",
            ServerEvent::Chats(_) => "getChats",
            ServerEvent::Rooms(_) => "getRooms",
            ServerEvent::Users(_) => "getUsers",
            ServerEvent::RoomByUsers(_) => "getRoomByUsers",
            ServerEvent::RoomCreated(_) => "roomCreated",
            ServerEvent::RoomUpdated(_) => "roomUpdated",
            ServerEvent::RoomDeleted(_) => "roomDeleted",
            ServerEvent::UserUpdated(_) => "userUpdated",
            ServerEvent::UserDeleted(_) => "userDeleted",
            ServerEvent::FriendAdded { .. } => "friendAdded",
            ServerEvent::FriendRemoved { .. } => "friendRemoved",
            ServerEvent::FriendAliasUpdated { .. } => "friendAliasUpdated",
            ServerEvent::FriendPrivacySet { .. } => "friendPrivacySet",
            ServerEvent::UserAddedToRoom { .. } => "userAddedToRoom",
            ServerEvent::UserRemovedFromRoom { .. } => "userRemovedFromRoom",
            ServerEvent::RoomAliasUpdated { .. } => "roomAliasUpdated",
            ServerEvent::RoomPrivacySet { .. } => "roomPrivacySet",
        }
    }

    /// JSON payload of the event, independent of framing.
    pub fn payload(&self) -> Value {
        match self {
            ServerEvent::Message(m) => to_value(m),
            // Browsers expect the answer as a JSON string they can `JSON.parse`.
            ServerEvent::Answer(desc) => {
                Value::String(serde_json::to_string(desc).unwrap_or_default())
            }
            ServerEvent::SelfProfile(profile) => to_value(profile),
            ServerEvent::Receive(b) | ServerEvent::Email(b) => Value::Bool(*b),
            ServerEvent::Qrcode(s) | ServerEvent::Error(s) => Value::String(s.clone()),
            ServerEvent::Chats(list) => to_value(list),
            ServerEvent::Rooms(list) => to_value(list),
            ServerEvent::Users(list) => to_value(list),
            ServerEvent::RoomByUsers(list) => to_value(list),
            ServerEvent::RoomCreated(room) | ServerEvent::RoomUpdated(room) => to_value(room),
            ServerEvent::RoomDeleted(id) | ServerEvent::UserDeleted(id) => json!(id),
            ServerEvent::UserUpdated(profile) => to_value(profile),
            ServerEvent::FriendAdded { user_id, friend_id }
            | ServerEvent::FriendRemoved { user_id, friend_id } => {
                json!({ "userID": user_id, "friendID": friend_id })
            }
            ServerEvent::FriendAliasUpdated { user_id, friend_id, alias } => {
                json!({ "userID": user_id, "friendID": friend_id, "alias": alias })
            }
            ServerEvent::FriendPrivacySet { user_id, friend_id, privacy } => {
                json!({ "userID": user_id, "friendID": friend_id, "privacy": privacy })
            }
            ServerEvent::UserAddedToRoom { user_id, room_id }
            | ServerEvent::UserRemovedFromRoom { user_id, room_id } => {
                json!({ "userID": user_id, "roomID": room_id })
            }
            ServerEvent::RoomAliasUpdated { user_id, room_id, alias } => {
                json!({ "userID": user_id, "roomID": room_id, "alias": alias })
            }
            ServerEvent::RoomPrivacySet { user_id, room_id, privacy } => {
                json!({ "userID": user_id, "roomID": room_id, "privacy": privacy })
            }
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_arg_accepts_json_string_or_object() {
        let body = r#"{"listenerId": 9, "text": {"content": "hi"}, "talkerId": 1}"#;
        let from_string =
            ClientEvent::from_socket_event("message", &[Value::String(body.into())]).unwrap();
        let from_object =
            ClientEvent::from_socket_event("message", &[serde_json::from_str(body).unwrap()])
                .unwrap();
        assert_eq!(from_string, from_object);

        match from_string {
            ClientEvent::Message(m) => {
                assert_eq!(m.listener_id, 9);
                assert_eq!(m.target().unwrap(), MessageTarget::Direct(9));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn missing_and_mistyped_args_are_protocol_errors() {
        assert!(matches!(
            ClientEvent::from_socket_event("offer", &[]),
            Err(SixinError::Protocol(_))
        ));
        assert!(matches!(
            ClientEvent::from_socket_event("updateFriendAlias", &[json!(3), json!(true)]),
            Err(SixinError::Protocol(_))
        ));
        assert!(matches!(
            ClientEvent::from_socket_event("setRoomPrivacy", &[json!(3)]),
            Err(SixinError::Protocol(_))
        ));
        assert!(matches!(
            ClientEvent::from_socket_event("nope", &[]),
            Err(SixinError::Protocol(_))
        ));
    }

    #[test]
    fn offer_must_be_an_offer() {
        let answer = json!({"type": "answer", "sdp": "v=0"});
        assert!(ClientEvent::from_socket_event("offer", &[answer.clone()]).is_err());
        assert!(ClientEvent::from_socket_event("answer", &[answer]).is_ok());
    }

    #[test]
    fn ids_accept_numeric_strings() {
        let ev = ClientEvent::from_socket_event("deleteRoom", &[json!("17")]).unwrap();
        assert_eq!(ev, ClientEvent::DeleteRoom { room_id: 17 });
        assert!(ClientEvent::from_socket_event("deleteRoom", &[json!("0")]).is_err());
        assert!(ClientEvent::from_socket_event("deleteRoom", &[json!(-4)]).is_err());
    }

    #[test]
    fn envelope_decoding() {
        let ev = ClientEvent::from_envelope(
            "addFriend",
            json!({"friend_id": 5, "alias": "bob", "is_private": true}),
        )
        .unwrap();
        assert_eq!(
            ev,
            ClientEvent::AddFriend {
                friend_id: 5,
                alias: "bob".into(),
                is_private: true
            }
        );

        let ev = ClientEvent::from_envelope("getRoomAliasByUsers", json!(12)).unwrap();
        assert_eq!(ev, ClientEvent::GetRoomByUsers { room_id: 12 });

        assert!(ClientEvent::from_envelope("offer", json!({})).is_err());
        assert!(ClientEvent::from_envelope("removeFriend", json!({"alias": "x"})).is_err());
    }

    #[test]
    fn message_target_validation() {
        let mut m = ChatMessage {
            text: json!({"content": "x"}),
            ..Default::default()
        };
        assert!(m.validate().is_err());
        m.room_id = 4;
        assert_eq!(m.target().unwrap(), MessageTarget::Room(4));
        m.listener_id = 2;
        assert!(m.validate().is_err());
    }

    #[test]
    fn chat_message_uses_camel_case_keys() {
        let m = ChatMessage {
            msg_id: "abc".into(),
            talker_id: 1,
            room_id: 2,
            kind: 7,
            ..Default::default()
        };
        let v = ServerEvent::Message(m).payload();
        assert_eq!(v["msgId"], "abc");
        assert_eq!(v["talkerId"], 1);
        assert_eq!(v["roomId"], 2);
        assert_eq!(v["type"], 7);
    }

    #[test]
    fn answer_payload_is_json_string() {
        let v = ServerEvent::Answer(SessionDescription::answer("v=0")).payload();
        let s = v.as_str().unwrap();
        let back: SessionDescription = serde_json::from_str(s).unwrap();
        assert_eq!(back.sdp_type, SdpType::Answer);
    }
}
