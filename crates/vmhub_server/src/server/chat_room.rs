#![forbid(unsafe_code)]

use std::collections::VecDeque;

use vmhub_protocol::messages::{ChatMessageEntry, UserType};

use crate::util::time::unix_ms_now;

/// Messages kept for late joiners.
const CHAT_HISTORY_CAPACITY: usize = 100;

/// Bounded ring of the most recent chat messages in one channel.
pub struct ChatRoom {
	id: u32,
	messages: VecDeque<ChatMessageEntry>,
}

impl ChatRoom {
	pub fn new(id: u32) -> Self {
		Self {
			id,
			messages: VecDeque::with_capacity(CHAT_HISTORY_CAPACITY),
		}
	}

	pub fn id(&self) -> u32 {
		self.id
	}

	/// Record a message and return the entry to broadcast.
	pub fn add_user_message(&mut self, sender: &str, user_type: UserType, message: &str) -> ChatMessageEntry {
		let entry = ChatMessageEntry {
			sender: sender.to_string(),
			user_type: user_type as i32,
			message: message.to_string(),
			timestamp: unix_ms_now(),
		};

		if self.messages.len() == CHAT_HISTORY_CAPACITY {
			self.messages.pop_front();
		}
		self.messages.push_back(entry.clone());
		entry
	}

	/// History copy for a connect response, oldest first.
	pub fn chat_history(&self) -> Vec<ChatMessageEntry> {
		self.messages.iter().cloned().collect()
	}
}

#[cfg(test)]
mod chat_room_tests {
	use super::*;

	#[test]
	fn history_is_ordered_and_bounded() {
		let mut room = ChatRoom::new(5);

		for i in 0..(CHAT_HISTORY_CAPACITY + 10) {
			room.add_user_message("alice", UserType::Guest, &format!("msg-{i}"));
		}

		let history = room.chat_history();
		assert_eq!(history.len(), CHAT_HISTORY_CAPACITY);
		assert_eq!(history.first().unwrap().message, "msg-10");
		assert_eq!(history.last().unwrap().message, format!("msg-{}", CHAT_HISTORY_CAPACITY + 9));
	}

	#[test]
	fn entries_carry_sender_and_kind() {
		let mut room = ChatRoom::new(0);
		let entry = room.add_user_message("admin1", UserType::Admin, "hello");
		assert_eq!(entry.sender, "admin1");
		assert_eq!(entry.user_type, UserType::Admin as i32);
		assert!(entry.timestamp > 0);
	}
}
