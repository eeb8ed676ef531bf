#![forbid(unsafe_code)]

use tracing::warn;
use vmhub_protocol::messages::{CaptchaSettings, ServerSetting, ServerSettingsList, server_setting};

use crate::server::db::Db;

/// Stable slot index per setting kind, used both for the DB row key and
/// for idempotent merging.
pub fn server_setting_kind(setting: &ServerSetting) -> Option<u32> {
	use server_setting::Setting;
	Some(match setting.setting.as_ref()? {
		Setting::AllowAccountRegistration(_) => 0,
		Setting::Captcha(_) => 1,
		Setting::CaptchaRequired(_) => 2,
		Setting::MaxConnectionsEnabled(_) => 3,
		Setting::MaxConnections(_) => 4,
		Setting::BanIpCommand(_) => 5,
	})
}

/// Typed view of the global configuration, one value per setting kind.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	pub allow_account_registration: bool,
	pub captcha: CaptchaSettings,
	pub captcha_required: bool,
	pub max_connections_enabled: bool,
	pub max_connections: u32,
	pub ban_ip_command: String,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			allow_account_registration: false,
			captcha: CaptchaSettings::default(),
			captcha_required: false,
			max_connections_enabled: false,
			max_connections: 0,
			ban_ip_command: String::new(),
		}
	}
}

impl ServerSettings {
	pub fn from_list(settings: &[ServerSetting]) -> Self {
		let mut out = Self::default();
		out.apply(settings);
		out
	}

	/// Merge a modification list, one slot per kind; applying the same
	/// list twice lands on the same state.
	pub fn apply(&mut self, updates: &[ServerSetting]) {
		use server_setting::Setting;
		for update in updates {
			match update.setting.as_ref() {
				Some(Setting::AllowAccountRegistration(v)) => self.allow_account_registration = *v,
				Some(Setting::Captcha(v)) => self.captcha = v.clone(),
				Some(Setting::CaptchaRequired(v)) => self.captcha_required = *v,
				Some(Setting::MaxConnectionsEnabled(v)) => self.max_connections_enabled = *v,
				Some(Setting::MaxConnections(v)) => self.max_connections = *v,
				Some(Setting::BanIpCommand(v)) => self.ban_ip_command = v.clone(),
				None => {}
			}
		}
	}

	pub fn to_list(&self) -> Vec<ServerSetting> {
		use server_setting::Setting;
		[
			Setting::AllowAccountRegistration(self.allow_account_registration),
			Setting::Captcha(self.captcha.clone()),
			Setting::CaptchaRequired(self.captcha_required),
			Setting::MaxConnectionsEnabled(self.max_connections_enabled),
			Setting::MaxConnections(self.max_connections),
			Setting::BanIpCommand(self.ban_ip_command.clone()),
		]
		.into_iter()
		.map(|setting| ServerSetting { setting: Some(setting) })
		.collect()
	}

	pub fn to_list_message(&self) -> ServerSettingsList {
		ServerSettingsList {
			settings: self.to_list(),
		}
	}
}

/// Owner-guarded settings store: loaded from the DB at startup, mutated
/// only by admin modification lists, persisted on every update.
pub struct SettingsStore {
	pub settings: ServerSettings,
	db: Db,
}

impl SettingsStore {
	pub fn new(settings: ServerSettings, db: Db) -> Self {
		Self { settings, db }
	}

	pub async fn load(db: Db) -> Self {
		let settings = match db.load_server_settings().await {
			Ok(list) => ServerSettings::from_list(&list),
			Err(e) => {
				warn!(error = %e, "failed to load server settings, using defaults");
				ServerSettings::default()
			}
		};
		Self::new(settings, db)
	}

	/// Apply a modification list. Invalid entries reject the whole list so
	/// the store never holds a half-applied state.
	pub fn update(&mut self, updates: &[ServerSetting]) -> Result<(), &'static str> {
		validate(updates)?;
		self.settings.apply(updates);

		let db = self.db.clone();
		let updates = updates.to_vec();
		tokio::spawn(async move {
			if let Err(e) = db.save_server_settings(&updates).await {
				warn!(error = %e, "failed to persist server settings");
			}
		});
		Ok(())
	}
}

fn validate(updates: &[ServerSetting]) -> Result<(), &'static str> {
	use server_setting::Setting;
	for update in updates {
		match update.setting.as_ref() {
			Some(Setting::Captcha(captcha)) => {
				if captcha.enabled && captcha.verify_url.is_empty() {
					return Err("captcha enabled without a verify url");
				}
			}
			Some(Setting::MaxConnections(0)) => {
				return Err("max connections must be positive");
			}
			_ => {}
		}
	}
	Ok(())
}

#[cfg(test)]
mod settings_tests {
	use super::*;

	fn setting(s: server_setting::Setting) -> ServerSetting {
		ServerSetting { setting: Some(s) }
	}

	#[test]
	fn apply_is_idempotent() {
		use server_setting::Setting;

		let updates = vec![
			setting(Setting::AllowAccountRegistration(true)),
			setting(Setting::MaxConnectionsEnabled(true)),
			setting(Setting::MaxConnections(4)),
		];

		let mut settings = ServerSettings::default();
		settings.apply(&updates);
		let once = settings.clone();
		settings.apply(&updates);

		assert_eq!(format!("{once:?}"), format!("{settings:?}"));
		assert!(settings.allow_account_registration);
		assert_eq!(settings.max_connections, 4);
	}

	#[test]
	fn list_roundtrip_covers_every_kind() {
		let mut settings = ServerSettings::default();
		settings.ban_ip_command = "nft add element inet filter banned { $IP_ADDRESS }".to_string();
		settings.captcha_required = true;

		let list = settings.to_list();
		assert_eq!(list.len(), 6);
		let kinds: Vec<u32> = list.iter().filter_map(server_setting_kind).collect();
		assert_eq!(kinds, vec![0, 1, 2, 3, 4, 5]);

		let reloaded = ServerSettings::from_list(&list);
		assert_eq!(format!("{reloaded:?}"), format!("{settings:?}"));
	}

	#[test]
	fn invalid_updates_are_rejected_wholesale() {
		use server_setting::Setting;
		assert!(validate(&[setting(Setting::MaxConnections(0))]).is_err());
		assert!(
			validate(&[setting(Setting::Captcha(CaptchaSettings {
				enabled: true,
				verify_url: String::new(),
				secret_key: String::new(),
			}))])
			.is_err()
		);
		assert!(validate(&[setting(Setting::MaxConnections(10))]).is_ok());
	}
}
