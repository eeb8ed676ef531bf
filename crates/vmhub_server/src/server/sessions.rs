#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::server::client::Client;

/// Session id -> live connection. A username has at most one live session;
/// minting a new one evicts the previous holder.
#[derive(Default)]
pub struct SessionMap {
	sessions: HashMap<Vec<u8>, Arc<Client>>,
}

impl SessionMap {
	/// Install a freshly minted session. If the DB reported a prior session
	/// id for the same account and it is still live here, that connection
	/// is closed and its entry dropped.
	pub fn install(&mut self, new_session_id: Vec<u8>, client: Arc<Client>, old_session_id: Option<Vec<u8>>) {
		if let Some(old) = old_session_id
			&& let Some(previous) = self.sessions.remove(&old)
		{
			info!(
				conn_id = previous.conn_id,
				"invalidating prior session for re-logged-in user"
			);
			previous.close();
		}
		self.sessions.insert(new_session_id, client);
	}

	pub fn remove(&mut self, session_id: &[u8]) {
		self.sessions.remove(session_id);
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}
}
