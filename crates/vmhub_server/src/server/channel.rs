#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::warn;
use vmhub_protocol::encode_shared_frame;
use vmhub_protocol::messages::{
	AdminUserEntry, AdminUserList, AdminUserListAdd, IpAddress, ServerMessage, UserEntry, UserList, UserListAdd,
	UserListRemove, UserType, UsernameChange, server_message,
};

use crate::server::chat_room::ChatRoom;
use crate::server::client::Client;

/// Per-member bookkeeping for reset votes.
#[derive(Default, Clone)]
pub struct UserVoteData {
	pub voted: bool,
	pub last_vote: Option<Instant>,
}

#[derive(Clone)]
pub struct UserData {
	pub username: String,
	pub user_type: UserType,
	pub ip_address: [u8; 16],
	pub vote: UserVoteData,
}

impl UserData {
	pub fn is_admin(&self) -> bool {
		self.user_type == UserType::Admin
	}
}

struct Member {
	client: Arc<Client>,
	data: UserData,
}

/// Membership of one channel (a VM room or the global lobby): who is here,
/// their per-channel user data, and the shared chat history.
pub struct UserChannel {
	chat_room: ChatRoom,
	members: HashMap<u64, Member>,
	admins_count: u32,
}

impl UserChannel {
	pub fn new(id: u32) -> Self {
		Self {
			chat_room: ChatRoom::new(id),
			members: HashMap::new(),
			admins_count: 0,
		}
	}

	pub fn id(&self) -> u32 {
		self.chat_room.id()
	}

	pub fn chat_room(&self) -> &ChatRoom {
		&self.chat_room
	}

	pub fn chat_room_mut(&mut self) -> &mut ChatRoom {
		&mut self.chat_room
	}

	pub fn len(&self) -> usize {
		self.members.len()
	}

	pub fn is_empty(&self) -> bool {
		self.members.is_empty()
	}

	pub fn contains(&self, conn_id: u64) -> bool {
		self.members.contains_key(&conn_id)
	}

	pub fn get_user_data(&mut self, conn_id: u64) -> Option<&mut UserData> {
		self.members.get_mut(&conn_id).map(|m| &mut m.data)
	}

	pub fn users(&self) -> impl Iterator<Item = (&Arc<Client>, &UserData)> {
		self.members.values().map(|m| (&m.client, &m.data))
	}

	pub fn find_by_username(&self, username: &str) -> Option<(&Arc<Client>, &UserData)> {
		self.members
			.values()
			.find(|m| m.data.username.eq_ignore_ascii_case(username))
			.map(|m| (&m.client, &m.data))
	}

	/// Insert a member: the joiner receives the full user list (the admin
	/// variant carries IPs), everyone else an incremental add.
	pub fn add_user(&mut self, data: UserData, client: Arc<Client>) {
		self.admins_count += u32::from(data.is_admin());

		let entry = UserEntry {
			username: data.username.clone(),
			user_type: data.user_type as i32,
		};
		let admin_entry = AdminUserEntry {
			username: data.username.clone(),
			user_type: data.user_type as i32,
			ip_address: Some(ip_address_message(&data.ip_address)),
		};
		let is_admin = data.is_admin();

		self.members.insert(client.conn_id, Member { client: Arc::clone(&client), data });

		let list_message = if is_admin {
			self.admin_user_list_message()
		} else {
			self.user_list_message()
		};
		client.queue_message(&list_message);

		if self.members.len() <= 1 {
			return;
		}

		let add = ServerMessage::new(server_message::Payload::UserListAdd(UserListAdd {
			channel: self.id(),
			user: Some(entry),
		}));
		let admin_add = ServerMessage::new(server_message::Payload::AdminUserListAdd(AdminUserListAdd {
			channel: self.id(),
			user: Some(admin_entry),
		}));
		self.broadcast_split(&add, &admin_add, Some(client.conn_id));
	}

	/// Remove a member and tell the room. The caller purges turn state.
	pub fn remove_user(&mut self, conn_id: u64) -> Option<UserData> {
		let member = self.members.remove(&conn_id)?;
		self.admins_count -= u32::from(member.data.is_admin());

		let message = ServerMessage::new(server_message::Payload::UserListRemove(UserListRemove {
			channel: self.id(),
			username: member.data.username.clone(),
		}));
		self.broadcast_message(&message);
		Some(member.data)
	}

	pub fn clear(&mut self) {
		self.members.clear();
		self.admins_count = 0;
	}

	/// Queue a pre-framed message on every member. Frames are shared, not
	/// re-encoded per recipient.
	pub fn broadcast(&self, frame: Bytes) {
		for member in self.members.values() {
			member.client.queue_frame(frame.clone());
		}
	}

	pub fn broadcast_message(&self, message: &ServerMessage) {
		match encode_shared_frame(message) {
			Ok(frame) => self.broadcast(frame),
			Err(e) => warn!(channel = self.id(), error = %e, "failed to frame broadcast"),
		}
	}

	/// Broadcast with an admin-only variant (user lists carry IPs for
	/// admins) and an optional excluded member.
	pub fn broadcast_split(&self, message: &ServerMessage, admin_message: &ServerMessage, exclude: Option<u64>) {
		let (Ok(frame), Ok(admin_frame)) = (encode_shared_frame(message), encode_shared_frame(admin_message)) else {
			warn!(channel = self.id(), "failed to frame split broadcast");
			return;
		};
		for member in self.members.values() {
			if Some(member.client.conn_id) == exclude {
				continue;
			}
			let frame = if member.data.is_admin() {
				admin_frame.clone()
			} else {
				frame.clone()
			};
			member.client.queue_frame(frame);
		}
	}

	/// Rewrite a member's username (guest rename or login) and tell the
	/// room. A rename to the current name is a no-op.
	pub fn rename_user(&mut self, conn_id: u64, new_username: &str, user_type: UserType) {
		let Some(member) = self.members.get_mut(&conn_id) else {
			return;
		};
		if member.data.username == new_username {
			return;
		}

		let old_username = std::mem::replace(&mut member.data.username, new_username.to_string());
		self.admins_count -= u32::from(member.data.is_admin());
		member.data.user_type = user_type;
		self.admins_count += u32::from(member.data.is_admin());

		let message = ServerMessage::new(server_message::Payload::ChangeUsername(UsernameChange {
			channel: self.id(),
			old_username,
			new_username: new_username.to_string(),
		}));
		self.broadcast_message(&message);
	}

	pub fn user_list_message(&self) -> ServerMessage {
		let users = self
			.members
			.values()
			.map(|m| UserEntry {
				username: m.data.username.clone(),
				user_type: m.data.user_type as i32,
			})
			.collect();
		ServerMessage::new(server_message::Payload::UserList(UserList {
			channel: self.id(),
			users,
		}))
	}

	pub fn admin_user_list_message(&self) -> ServerMessage {
		let users = self
			.members
			.values()
			.map(|m| AdminUserEntry {
				username: m.data.username.clone(),
				user_type: m.data.user_type as i32,
				ip_address: Some(ip_address_message(&m.data.ip_address)),
			})
			.collect();
		ServerMessage::new(server_message::Payload::AdminUserList(AdminUserList {
			channel: self.id(),
			users,
		}))
	}
}

pub fn ip_address_message(bytes: &[u8; 16]) -> IpAddress {
	IpAddress {
		first: u64::from_be_bytes(bytes[0..8].try_into().unwrap_or_default()),
		second: u64::from_be_bytes(bytes[8..16].try_into().unwrap_or_default()),
	}
}

#[cfg(test)]
mod channel_tests {
	use std::net::{IpAddr, Ipv4Addr};

	use tokio::sync::mpsc;
	use vmhub_protocol::{DEFAULT_MAX_FRAME_SIZE, try_decode_frame_from_buffer};

	use super::*;

	fn decode(frame: Bytes) -> ServerMessage {
		let mut buf = bytes::BytesMut::from(frame.as_ref());
		try_decode_frame_from_buffer::<ServerMessage>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("decode")
			.expect("complete")
	}

	fn guest(conn_id: u64, name: &str) -> (Arc<Client>, mpsc::Receiver<Bytes>, UserData) {
		let (client, rx) = Client::new(conn_id, IpAddr::V4(Ipv4Addr::LOCALHOST));
		let data = UserData {
			username: name.to_string(),
			user_type: UserType::Guest,
			ip_address: client.ip_bytes,
			vote: UserVoteData::default(),
		};
		(client, rx, data)
	}

	#[tokio::test]
	async fn joiner_gets_list_and_room_gets_add() {
		let mut channel = UserChannel::new(7);

		let (a, mut rx_a, data_a) = guest(1, "alice");
		channel.add_user(data_a, Arc::clone(&a));

		let list = decode(rx_a.recv().await.expect("frame"));
		match list.payload {
			Some(server_message::Payload::UserList(list)) => {
				assert_eq!(list.channel, 7);
				assert_eq!(list.users.len(), 1);
			}
			other => panic!("expected user list, got {other:?}"),
		}

		let (b, _rx_b, data_b) = guest(2, "bob");
		channel.add_user(data_b, Arc::clone(&b));

		let add = decode(rx_a.recv().await.expect("frame"));
		match add.payload {
			Some(server_message::Payload::UserListAdd(add)) => {
				assert_eq!(add.user.expect("user").username, "bob");
			}
			other => panic!("expected user list add, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn remove_broadcasts_to_remaining_members() {
		let mut channel = UserChannel::new(7);

		let (a, mut rx_a, data_a) = guest(1, "alice");
		channel.add_user(data_a, Arc::clone(&a));
		let (b, _rx_b, data_b) = guest(2, "bob");
		channel.add_user(data_b, Arc::clone(&b));
		rx_a.recv().await.expect("list");
		rx_a.recv().await.expect("add");

		assert!(channel.remove_user(2).is_some());
		assert!(channel.remove_user(2).is_none());

		let removed = decode(rx_a.recv().await.expect("frame"));
		match removed.payload {
			Some(server_message::Payload::UserListRemove(remove)) => {
				assert_eq!(remove.username, "bob");
			}
			other => panic!("expected user list remove, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn rename_to_same_name_is_silent() {
		let mut channel = UserChannel::new(0);

		let (a, mut rx_a, data_a) = guest(1, "alice");
		channel.add_user(data_a, Arc::clone(&a));
		rx_a.recv().await.expect("list");

		channel.rename_user(1, "alice", UserType::Guest);
		assert!(rx_a.try_recv().is_err());

		channel.rename_user(1, "carol", UserType::Guest);
		let change = decode(rx_a.recv().await.expect("frame"));
		match change.payload {
			Some(server_message::Payload::ChangeUsername(change)) => {
				assert_eq!(change.old_username, "alice");
				assert_eq!(change.new_username, "carol");
			}
			other => panic!("expected change username, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn admins_receive_the_admin_variant() {
		let mut channel = UserChannel::new(3);

		let (admin, mut rx_admin) = Client::new(1, IpAddr::V4(Ipv4Addr::LOCALHOST));
		admin.set_logged_in(true);
		let data = UserData {
			username: "root".to_string(),
			user_type: UserType::Admin,
			ip_address: admin.ip_bytes,
			vote: UserVoteData::default(),
		};
		channel.add_user(data, Arc::clone(&admin));

		let list = decode(rx_admin.recv().await.expect("frame"));
		match list.payload {
			Some(server_message::Payload::AdminUserList(list)) => {
				assert!(list.users[0].ip_address.is_some());
			}
			other => panic!("expected admin user list, got {other:?}"),
		}
	}
}
