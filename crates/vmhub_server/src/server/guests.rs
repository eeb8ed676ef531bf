#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;

use crate::server::client::Client;

/// In-memory table of usernames held by live connections, keyed
/// case-insensitively. Guests own their name only while connected;
/// logged-in users occupy an entry too so guests cannot shadow them.
#[derive(Default)]
pub struct GuestTable {
	names: HashMap<String, Arc<Client>>,
}

impl GuestTable {
	/// Insert if free; the name comparison ignores ASCII case.
	pub fn insert(&mut self, username: &str, client: Arc<Client>) -> bool {
		let key = username.to_ascii_lowercase();
		if self.names.contains_key(&key) {
			return false;
		}
		self.names.insert(key, client);
		true
	}

	pub fn remove(&mut self, username: &str) {
		self.names.remove(&username.to_ascii_lowercase());
	}

	pub fn get(&self, username: &str) -> Option<&Arc<Client>> {
		self.names.get(&username.to_ascii_lowercase())
	}

	/// Allocate a fresh `guest<N>` name: a uniform draw from [1000, 99999],
	/// incrementing past collisions, inserted atomically with the pick.
	pub fn generate(&mut self, client: &Arc<Client>) -> String {
		let start: u64 = rand::thread_rng().gen_range(1000..=99_999);
		self.claim_numbered(start, client)
	}

	fn claim_numbered(&mut self, mut num: u64, client: &Arc<Client>) -> String {
		loop {
			let username = format!("guest{num}");
			if self.insert(&username, Arc::clone(client)) {
				return username;
			}
			num += 1;
		}
	}

	/// Atomic rename: the new name is claimed before the old one is
	/// released, so a failed claim leaves the old name held.
	pub fn rename(&mut self, old: &str, new: &str, client: Arc<Client>) -> bool {
		if !self.insert(new, client) {
			return false;
		}
		if !old.is_empty() {
			self.remove(old);
		}
		true
	}
}
