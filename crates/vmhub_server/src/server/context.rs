#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use vmhub_protocol::GLOBAL_CHANNEL_ID;

use crate::server::captcha::CaptchaVerifier;
use crate::server::channel::UserChannel;
use crate::server::client::Client;
use crate::server::db::Db;
use crate::server::exec::Owner;
use crate::server::guests::GuestTable;
use crate::server::ip_data::IpRegistry;
use crate::server::registry::VmRegistry;
use crate::server::sessions::SessionMap;
use crate::server::settings::SettingsStore;
use crate::server::vm::DesktopConnector;

/// Unit state for the executor that serializes credential work (argon2
/// verification, account writes) so a burst of logins cannot saturate the
/// worker pool.
pub struct LoginExecutor;

/// In-memory mirror of the reserved-usernames table, consulted on guest
/// renames without a DB hop. Admin create/delete keeps it in sync.
#[derive(Clone, Default)]
pub struct ReservedNames {
	names: Arc<RwLock<HashSet<String>>>,
}

impl ReservedNames {
	pub fn contains(&self, username: &str) -> bool {
		self.names.read().contains(&username.to_ascii_lowercase())
	}

	pub fn insert(&self, username: &str) {
		self.names.write().insert(username.to_ascii_lowercase());
	}

	pub fn remove(&self, username: &str) {
		self.names.write().remove(&username.to_ascii_lowercase());
	}

	pub fn replace_all(&self, usernames: impl IntoIterator<Item = String>) {
		*self.names.write() = usernames.into_iter().map(|u| u.to_ascii_lowercase()).collect();
	}
}

/// Every serialization owner and shared service of the server. One
/// instance per process, shared by all connection handlers.
pub struct ServerContext {
	pub db: Db,
	pub settings: Owner<SettingsStore>,
	pub sessions: Owner<SessionMap>,
	pub guests: Owner<GuestTable>,
	pub ip_registry: Owner<IpRegistry>,
	pub vms: Owner<VmRegistry>,
	pub global_chat: Owner<UserChannel>,
	pub login_exec: Owner<LoginExecutor>,
	pub captcha: CaptchaVerifier,
	pub reserved_names: ReservedNames,
	pub connector: Arc<dyn DesktopConnector>,
}

impl ServerContext {
	/// Locate a user by name within a channel and hand their handle to
	/// `callback` (admin moderation: kick, forced captcha).
	pub fn with_user(self: &Arc<Self>, username: String, channel: u32, callback: impl FnOnce(Arc<Client>) + Send + 'static) {
		if channel == GLOBAL_CHANNEL_ID {
			self.global_chat.dispatch(move |chat| {
				if let Some((client, _)) = chat.find_by_username(&username) {
					callback(Arc::clone(client));
				}
			});
			return;
		}

		self.vms.dispatch(move |registry| {
			let Some(vm) = registry.get(channel) else {
				return;
			};
			vm.owner.dispatch(move |state| {
				if let Some((client, _)) = state.channel.find_by_username(&username) {
					callback(Arc::clone(client));
				}
			});
		});
	}
}
