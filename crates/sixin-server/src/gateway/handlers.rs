//! Per-event handlers for active connections.
//!
//! Handlers do their store and negotiation work and describe what should be
//! sent as an [`Outcome`]. The gateway emits it after the handler returns,
//! outside the handler deadline, so a persisted change is never left
//! half announced.

use super::{Connection, Gateway};
use rand::RngCore;
use sixin_core::messages::{NewRoom, ProfileUpdate, RoomUpdate};
use sixin_core::{
    ChatMessage, ClientEvent, MessageTarget, RoomId, ServerEvent, SixinError, SixinResult, UserId,
};
use tracing::{debug, info};

/// What a handler wants sent once its work is done.
#[derive(Debug)]
pub(super) enum Outcome {
    Done,
    /// Sent to the acting connection only.
    Reply(ServerEvent),
    /// Sent to every live connection of `recipients`.
    Fanout {
        event: ServerEvent,
        recipients: Vec<UserId>,
    },
}

impl Gateway {
    pub(super) async fn handle_event(&self, conn: &Connection, event: ClientEvent) -> SixinResult<Outcome> {
        let user = self.acting_user(conn).await?;

        match event {
            ClientEvent::Message(message) => self.on_message(conn, user, message).await,

            ClientEvent::Offer(offer) => {
                let answer = self.peers.handle_offer(conn.id, offer).await?;
                Ok(Outcome::Reply(ServerEvent::Answer(answer)))
            }
            ClientEvent::Answer(answer) => {
                self.peers.handle_answer(conn.id, answer).await?;
                Ok(Outcome::Done)
            }
            ClientEvent::IceCandidate(candidate) => {
                self.peers.handle_ice_candidate(conn.id, candidate).await?;
                Ok(Outcome::Done)
            }

            ClientEvent::SelfProfile => {
                let profile = self.store.user(user).await?;
                Ok(Outcome::Reply(ServerEvent::SelfProfile(profile)))
            }
            ClientEvent::ToggleReceive => {
                let value = {
                    let mut device = self.device.write().await;
                    device.receive = !device.receive;
                    device.receive
                };
                info!(user_id = user, receive = value, "receive toggled");
                Ok(Outcome::Reply(ServerEvent::Receive(value)))
            }
            ClientEvent::ToggleEmail => {
                let value = {
                    let mut device = self.device.write().await;
                    device.email = !device.email;
                    device.email
                };
                info!(user_id = user, email = value, "email notifications toggled");
                Ok(Outcome::Reply(ServerEvent::Email(value)))
            }

            ClientEvent::GetChats => {
                let mut chats = self.store.chats_for(user).await?;
                if let Some(sealer) = &self.sealer {
                    for message in &mut chats {
                        sealer.open(message).await?;
                    }
                }
                Ok(Outcome::Reply(ServerEvent::Chats(chats)))
            }
            ClientEvent::GetRooms => {
                let rooms = self.store.rooms_for(user).await?;
                Ok(Outcome::Reply(ServerEvent::Rooms(rooms)))
            }
            ClientEvent::GetUsers => {
                let users = self.store.all_users().await?;
                Ok(Outcome::Reply(ServerEvent::Users(users)))
            }
            ClientEvent::GetRoomByUsers { room_id } => {
                self.require_member(user, room_id).await?;
                let members = self.store.room_members(room_id).await?;
                Ok(Outcome::Reply(ServerEvent::RoomByUsers(members)))
            }

            ClientEvent::CreateRoom(room) => self.on_create_room(user, room).await,
            ClientEvent::UpdateRoom(update) => self.on_update_room(user, update).await,
            ClientEvent::DeleteRoom { room_id } => self.on_delete_room(user, room_id).await,

            ClientEvent::UpdateUser(update) => self.on_update_user(user, update).await,
            ClientEvent::DeleteUser => {
                self.store.delete_user(user).await?;
                info!(user_id = user, "user deleted");
                Ok(Outcome::Reply(ServerEvent::UserDeleted(user)))
            }

            ClientEvent::AddFriend {
                friend_id,
                alias,
                is_private,
            } => {
                self.store
                    .add_friend(user, friend_id, alias, is_private)
                    .await?;
                let event = ServerEvent::FriendAdded {
                    user_id: user,
                    friend_id,
                };
                Ok(Outcome::Fanout {
                    event,
                    recipients: vec![user, friend_id],
                })
            }
            ClientEvent::RemoveFriend { friend_id } => {
                self.store.remove_friend(user, friend_id).await?;
                let event = ServerEvent::FriendRemoved {
                    user_id: user,
                    friend_id,
                };
                Ok(Outcome::Fanout {
                    event,
                    recipients: vec![user, friend_id],
                })
            }
            ClientEvent::UpdateFriendAlias { friend_id, alias } => {
                self.store
                    .update_friend_alias(user, friend_id, alias.clone())
                    .await?;
                let event = ServerEvent::FriendAliasUpdated {
                    user_id: user,
                    friend_id,
                    alias,
                };
                Ok(Outcome::Reply(event))
            }
            ClientEvent::SetFriendPrivacy {
                friend_id,
                is_private,
            } => {
                self.store
                    .set_friend_privacy(user, friend_id, is_private)
                    .await?;
                let event = ServerEvent::FriendPrivacySet {
                    user_id: user,
                    friend_id,
                    privacy: is_private,
                };
                Ok(Outcome::Reply(event))
            }

            ClientEvent::AddUserToRoom {
                room_id,
                alias,
                is_private,
            } => {
                self.store
                    .add_user_to_room(user, room_id, alias, is_private)
                    .await?;
                let members = self.member_ids(room_id).await?;
                let event = ServerEvent::UserAddedToRoom {
                    user_id: user,
                    room_id,
                };
                Ok(Outcome::Fanout {
                    event,
                    recipients: members,
                })
            }
            ClientEvent::RemoveUserFromRoom { room_id } => {
                let mut members = self.member_ids(room_id).await?;
                self.store.remove_user_from_room(user, room_id).await?;
                members.push(user);
                let event = ServerEvent::UserRemovedFromRoom {
                    user_id: user,
                    room_id,
                };
                Ok(Outcome::Fanout {
                    event,
                    recipients: members,
                })
            }
            ClientEvent::UpdateRoomAlias { room_id, alias } => {
                self.store
                    .update_room_alias(user, room_id, alias.clone())
                    .await?;
                let event = ServerEvent::RoomAliasUpdated {
                    user_id: user,
                    room_id,
                    alias,
                };
                Ok(Outcome::Reply(event))
            }
            ClientEvent::SetRoomPrivacy {
                room_id,
                is_private,
            } => {
                self.store
                    .set_room_privacy(user, room_id, is_private)
                    .await?;
                let event = ServerEvent::RoomPrivacySet {
                    user_id: user,
                    room_id,
                    privacy: is_private,
                };
                Ok(Outcome::Reply(event))
            }
        }
    }

    /// Validate, stamp and persist a chat message, then hand it out for
    /// fan-out.
    ///
    /// Nothing is delivered when the store rejects the message.
    async fn on_message(&self, conn: &Connection, user: UserId, mut message: ChatMessage) -> SixinResult<Outcome> {
        message.validate()?;
        message.talker_id = user;
        if message.msg_id.is_empty() {
            message.msg_id = new_message_id();
        }
        if message.timestamp == 0 {
            message.timestamp = now_millis();
        }

        let recipients = match message.target()? {
            MessageTarget::Direct(listener) => vec![user, listener],
            MessageTarget::Room(room_id) => {
                self.require_member(user, room_id).await?;
                self.member_ids(room_id).await?
            }
        };

        let stored = match &self.sealer {
            Some(sealer) => sealer.seal(&message).await?,
            None => message.clone(),
        };
        let stored = self.store.create_message(stored).await?;
        message.id = stored.id;

        debug!(
            conn_id = conn.id,
            user_id = user,
            msg_id = %message.msg_id,
            recipients = recipients.len(),
            "message persisted"
        );
        Ok(Outcome::Fanout {
            event: ServerEvent::Message(message),
            recipients,
        })
    }

    async fn on_create_room(&self, user: UserId, room: NewRoom) -> SixinResult<Outcome> {
        let room = self.store.create_room(user, room).await?;
        info!(user_id = user, room_id = room.id, "room created");
        Ok(Outcome::Reply(ServerEvent::RoomCreated(room)))
    }

    async fn on_update_room(&self, user: UserId, update: RoomUpdate) -> SixinResult<Outcome> {
        self.require_owner(user, update.id).await?;
        let room = self.store.update_room(update).await?;
        Ok(Outcome::Reply(ServerEvent::RoomUpdated(room)))
    }

    async fn on_delete_room(&self, user: UserId, room_id: RoomId) -> SixinResult<Outcome> {
        self.require_owner(user, room_id).await?;
        let mut members = self.member_ids(room_id).await?;
        self.store.delete_room(room_id).await?;
        members.push(user);
        info!(user_id = user, room_id, "room deleted");
        Ok(Outcome::Fanout {
            event: ServerEvent::RoomDeleted(room_id),
            recipients: members,
        })
    }

    async fn on_update_user(&self, user: UserId, update: ProfileUpdate) -> SixinResult<Outcome> {
        let profile = self.store.update_user(user, update).await?;
        Ok(Outcome::Reply(ServerEvent::UserUpdated(profile)))
    }

    async fn member_ids(&self, room_id: RoomId) -> SixinResult<Vec<UserId>> {
        Ok(self
            .store
            .room_members(room_id)
            .await?
            .into_iter()
            .map(|m| m.user_id)
            .collect())
    }

    async fn require_member(&self, user: UserId, room_id: RoomId) -> SixinResult<()> {
        if self.store.is_member(user, room_id).await? {
            Ok(())
        } else {
            Err(SixinError::Protocol(format!("not a member of room {room_id}")))
        }
    }

    async fn require_owner(&self, user: UserId, room_id: RoomId) -> SixinResult<()> {
        let room = self
            .store
            .room(room_id)
            .await?
            .ok_or_else(|| SixinError::Store(format!("room {room_id} not found")))?;
        if room.owner_id != user {
            return Err(SixinError::Protocol(format!(
                "only the owner may modify room {room_id}"
            )));
        }
        Ok(())
    }
}

fn new_message_id() -> String {
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    hex::encode(id)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
