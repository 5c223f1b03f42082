//! Persistence collaborator.
//!
//! The gateway only talks to [`Store`]. [`MemoryStore`] backs the binary and
//! the tests; a relational backend would implement the same trait.

use async_trait::async_trait;
use sixin_core::messages::{NewRoom, ProfileUpdate, Room, RoomMember, RoomUpdate, UserProfile};
use sixin_core::{ChatMessage, RoomId, SixinError, SixinResult, UserId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a message and return it with its assigned id.
    async fn create_message(&self, message: ChatMessage) -> SixinResult<ChatMessage>;

    /// Direct messages to or from `user`, plus messages in rooms `user` belongs to.
    async fn chats_for(&self, user: UserId) -> SixinResult<Vec<ChatMessage>>;

    /// Fetch a profile, creating an empty one on first sight.
    async fn ensure_user(&self, user: UserId) -> SixinResult<UserProfile>;
    async fn user(&self, user: UserId) -> SixinResult<Option<UserProfile>>;
    async fn all_users(&self) -> SixinResult<Vec<UserProfile>>;
    async fn update_user(&self, user: UserId, update: ProfileUpdate) -> SixinResult<UserProfile>;
    async fn delete_user(&self, user: UserId) -> SixinResult<()>;

    async fn room(&self, room: RoomId) -> SixinResult<Option<Room>>;
    async fn rooms_for(&self, user: UserId) -> SixinResult<Vec<Room>>;
    /// Create a room owned by `owner`, who becomes its first member.
    async fn create_room(&self, owner: UserId, room: NewRoom) -> SixinResult<Room>;
    async fn update_room(&self, update: RoomUpdate) -> SixinResult<Room>;
    async fn delete_room(&self, room: RoomId) -> SixinResult<()>;

    async fn room_members(&self, room: RoomId) -> SixinResult<Vec<RoomMember>>;
    async fn is_member(&self, user: UserId, room: RoomId) -> SixinResult<bool>;
    async fn add_user_to_room(
        &self,
        user: UserId,
        room: RoomId,
        alias: String,
        is_private: bool,
    ) -> SixinResult<()>;
    async fn remove_user_from_room(&self, user: UserId, room: RoomId) -> SixinResult<()>;
    async fn update_room_alias(&self, user: UserId, room: RoomId, alias: String) -> SixinResult<()>;
    async fn set_room_privacy(&self, user: UserId, room: RoomId, is_private: bool) -> SixinResult<()>;

    async fn add_friend(
        &self,
        user: UserId,
        friend: UserId,
        alias: String,
        is_private: bool,
    ) -> SixinResult<()>;
    async fn remove_friend(&self, user: UserId, friend: UserId) -> SixinResult<()>;
    async fn update_friend_alias(&self, user: UserId, friend: UserId, alias: String) -> SixinResult<()>;
    async fn set_friend_privacy(&self, user: UserId, friend: UserId, is_private: bool) -> SixinResult<()>;
}

#[derive(Debug, Clone, Default)]
struct Friendship {
    alias: String,
    is_private: bool,
}

#[derive(Default)]
struct MemoryStoreInner {
    next_message_id: u64,
    next_room_id: RoomId,
    messages: Vec<ChatMessage>,
    users: BTreeMap<UserId, UserProfile>,
    rooms: BTreeMap<RoomId, Room>,
    // (room, user) -> membership
    members: BTreeMap<(RoomId, UserId), RoomMember>,
    friends: HashMap<(UserId, UserId), Friendship>,
}

/// In-memory store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryStoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> SixinResult<std::sync::RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|_| SixinError::Store("store lock poisoned".into()))
    }

    fn write(&self) -> SixinResult<std::sync::RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|_| SixinError::Store("store lock poisoned".into()))
    }
}

fn not_found(what: &str, id: u64) -> SixinError {
    SixinError::Store(format!("{what} {id} not found"))
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_message(&self, mut message: ChatMessage) -> SixinResult<ChatMessage> {
        let mut inner = self.write()?;
        inner.next_message_id += 1;
        message.id = inner.next_message_id;
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn chats_for(&self, user: UserId) -> SixinResult<Vec<ChatMessage>> {
        let inner = self.read()?;
        Ok(inner
            .messages
            .iter()
            .filter(|m| {
                if m.room_id != 0 {
                    inner.members.contains_key(&(m.room_id, user))
                } else {
                    m.talker_id == user || m.listener_id == user
                }
            })
            .cloned()
            .collect())
    }

    async fn ensure_user(&self, user: UserId) -> SixinResult<UserProfile> {
        let mut inner = self.write()?;
        let profile = inner.users.entry(user).or_insert_with(|| UserProfile {
            id: user,
            username: format!("user{user}"),
            ..Default::default()
        });
        Ok(profile.clone())
    }

    async fn user(&self, user: UserId) -> SixinResult<Option<UserProfile>> {
        Ok(self.read()?.users.get(&user).cloned())
    }

    async fn all_users(&self) -> SixinResult<Vec<UserProfile>> {
        Ok(self.read()?.users.values().cloned().collect())
    }

    async fn update_user(&self, user: UserId, update: ProfileUpdate) -> SixinResult<UserProfile> {
        let mut inner = self.write()?;
        let profile = inner
            .users
            .get_mut(&user)
            .ok_or_else(|| not_found("user", user))?;
        if let Some(name) = update.name {
            profile.name = name;
        }
        if let Some(avatar) = update.avatar {
            profile.avatar = avatar;
        }
        if let Some(signature) = update.signature {
            profile.signature = signature;
        }
        if let Some(email) = update.email {
            profile.email = email;
        }
        Ok(profile.clone())
    }

    async fn delete_user(&self, user: UserId) -> SixinResult<()> {
        let mut inner = self.write()?;
        inner
            .users
            .remove(&user)
            .ok_or_else(|| not_found("user", user))?;
        inner.members.retain(|(_, u), _| *u != user);
        inner.friends.retain(|(a, b), _| *a != user && *b != user);
        Ok(())
    }

    async fn room(&self, room: RoomId) -> SixinResult<Option<Room>> {
        Ok(self.read()?.rooms.get(&room).cloned())
    }

    async fn rooms_for(&self, user: UserId) -> SixinResult<Vec<Room>> {
        let inner = self.read()?;
        Ok(inner
            .members
            .keys()
            .filter(|(_, u)| *u == user)
            .filter_map(|(r, _)| inner.rooms.get(r).cloned())
            .collect())
    }

    async fn create_room(&self, owner: UserId, room: NewRoom) -> SixinResult<Room> {
        let mut inner = self.write()?;
        inner.next_room_id += 1;
        let created = Room {
            id: inner.next_room_id,
            name: room.name,
            owner_id: owner,
            avatar: room.avatar,
        };
        inner.rooms.insert(created.id, created.clone());
        inner.members.insert(
            (created.id, owner),
            RoomMember {
                user_id: owner,
                room_id: created.id,
                ..Default::default()
            },
        );
        Ok(created)
    }

    async fn update_room(&self, update: RoomUpdate) -> SixinResult<Room> {
        let mut inner = self.write()?;
        let room = inner
            .rooms
            .get_mut(&update.id)
            .ok_or_else(|| not_found("room", update.id))?;
        if let Some(name) = update.name {
            room.name = name;
        }
        if let Some(avatar) = update.avatar {
            room.avatar = avatar;
        }
        Ok(room.clone())
    }

    async fn delete_room(&self, room: RoomId) -> SixinResult<()> {
        let mut inner = self.write()?;
        inner
            .rooms
            .remove(&room)
            .ok_or_else(|| not_found("room", room))?;
        inner.members.retain(|(r, _), _| *r != room);
        Ok(())
    }

    async fn room_members(&self, room: RoomId) -> SixinResult<Vec<RoomMember>> {
        let inner = self.read()?;
        if !inner.rooms.contains_key(&room) {
            return Err(not_found("room", room));
        }
        Ok(inner
            .members
            .range((room, UserId::MIN)..=(room, UserId::MAX))
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn is_member(&self, user: UserId, room: RoomId) -> SixinResult<bool> {
        Ok(self.read()?.members.contains_key(&(room, user)))
    }

    async fn add_user_to_room(
        &self,
        user: UserId,
        room: RoomId,
        alias: String,
        is_private: bool,
    ) -> SixinResult<()> {
        let mut inner = self.write()?;
        if !inner.rooms.contains_key(&room) {
            return Err(not_found("room", room));
        }
        inner.members.insert(
            (room, user),
            RoomMember {
                user_id: user,
                room_id: room,
                alias,
                is_private,
            },
        );
        Ok(())
    }

    async fn remove_user_from_room(&self, user: UserId, room: RoomId) -> SixinResult<()> {
        self.write()?
            .members
            .remove(&(room, user))
            .map(|_| ())
            .ok_or_else(|| SixinError::Store(format!("user {user} is not in room {room}")))
    }

    async fn update_room_alias(&self, user: UserId, room: RoomId, alias: String) -> SixinResult<()> {
        let mut inner = self.write()?;
        let member = inner
            .members
            .get_mut(&(room, user))
            .ok_or_else(|| SixinError::Store(format!("user {user} is not in room {room}")))?;
        member.alias = alias;
        Ok(())
    }

    async fn set_room_privacy(&self, user: UserId, room: RoomId, is_private: bool) -> SixinResult<()> {
        let mut inner = self.write()?;
        let member = inner
            .members
            .get_mut(&(room, user))
            .ok_or_else(|| SixinError::Store(format!("user {user} is not in room {room}")))?;
        member.is_private = is_private;
        Ok(())
    }

    async fn add_friend(
        &self,
        user: UserId,
        friend: UserId,
        alias: String,
        is_private: bool,
    ) -> SixinResult<()> {
        if user == friend {
            return Err(SixinError::Store("cannot befriend yourself".into()));
        }
        let mut inner = self.write()?;
        if inner.friends.contains_key(&(user, friend)) {
            return Err(SixinError::Store(format!("user {friend} is already a friend")));
        }
        inner
            .friends
            .insert((user, friend), Friendship { alias, is_private });
        Ok(())
    }

    async fn remove_friend(&self, user: UserId, friend: UserId) -> SixinResult<()> {
        self.write()?
            .friends
            .remove(&(user, friend))
            .map(|_| ())
            .ok_or_else(|| not_found("friend", friend))
    }

    async fn update_friend_alias(&self, user: UserId, friend: UserId, alias: String) -> SixinResult<()> {
        let mut inner = self.write()?;
        let entry = inner
            .friends
            .get_mut(&(user, friend))
            .ok_or_else(|| not_found("friend", friend))?;
        entry.alias = alias;
        Ok(())
    }

    async fn set_friend_privacy(&self, user: UserId, friend: UserId, is_private: bool) -> SixinResult<()> {
        let mut inner = self.write()?;
        let entry = inner
            .friends
            .get_mut(&(user, friend))
            .ok_or_else(|| not_found("friend", friend))?;
        entry.is_private = is_private;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn direct(from: UserId, to: UserId) -> ChatMessage {
        ChatMessage {
            talker_id: from,
            listener_id: to,
            text: json!({"content": "hi"}),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn messages_get_ids_and_show_in_history() {
        let store = MemoryStore::new();
        let a = store.create_message(direct(1, 2)).await.unwrap();
        let b = store.create_message(direct(3, 4)).await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);

        let chats = store.chats_for(2).await.unwrap();
        assert_eq!(chats, vec![a]);
        assert!(store.chats_for(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn room_history_follows_membership() {
        let store = MemoryStore::new();
        let room = store.create_room(1, NewRoom::default()).await.unwrap();
        let msg = ChatMessage {
            talker_id: 1,
            room_id: room.id,
            text: json!("x"),
            ..Default::default()
        };
        store.create_message(msg).await.unwrap();

        assert_eq!(store.chats_for(1).await.unwrap().len(), 1);
        assert!(store.chats_for(2).await.unwrap().is_empty());

        store
            .add_user_to_room(2, room.id, "team".into(), false)
            .await
            .unwrap();
        assert_eq!(store.chats_for(2).await.unwrap().len(), 1);
        assert_eq!(store.room_members(room.id).await.unwrap().len(), 2);

        store.delete_room(room.id).await.unwrap();
        assert!(!store.is_member(2, room.id).await.unwrap());
        assert!(store.rooms_for(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn profiles() {
        let store = MemoryStore::new();
        assert!(store.user(9).await.unwrap().is_none());
        store.ensure_user(9).await.unwrap();
        let updated = store
            .update_user(
                9,
                ProfileUpdate {
                    name: Some("Nine".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Nine");
        assert_eq!(store.all_users().await.unwrap().len(), 1);
        store.delete_user(9).await.unwrap();
        assert!(store.delete_user(9).await.is_err());
    }

    #[tokio::test]
    async fn friendships() {
        let store = MemoryStore::new();
        assert!(store.add_friend(1, 1, String::new(), false).await.is_err());
        store.add_friend(1, 2, "bob".into(), false).await.unwrap();
        assert!(store.add_friend(1, 2, String::new(), false).await.is_err());
        store.update_friend_alias(1, 2, "rob".into()).await.unwrap();
        store.set_friend_privacy(1, 2, true).await.unwrap();
        store.remove_friend(1, 2).await.unwrap();
        assert!(store.remove_friend(1, 2).await.is_err());
        assert!(store.update_friend_alias(1, 2, "x".into()).await.is_err());
    }
}
