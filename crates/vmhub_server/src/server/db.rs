#![forbid(unsafe_code)]

use anyhow::Context as _;
use prost::Message;
use sqlx::SqlitePool;
use vmhub_protocol::messages::{Invite, RegisterResult, ServerSetting, VmSetting};
use vmhub_protocol::{limits, validate_username};

use crate::server::auth;

/// SQLite-backed store for accounts, invites, reserved usernames, VM
/// settings, and the recording-file index.
#[derive(Clone)]
pub struct Db {
	pool: SqlitePool,
}

pub enum LoginOutcome {
	Success { username: String, is_admin: bool },
	TwoFactorRequired { username: String, totp_key: Vec<u8> },
	InvalidCredentials,
}

pub struct MintedSession {
	pub username: String,
	pub is_admin: bool,
	pub old_session_id: Option<Vec<u8>>,
	pub new_session_id: Vec<u8>,
}

pub struct InviteRow {
	pub name: String,
	/// Empty when the invite does not bind a username.
	pub username: String,
	pub admin: bool,
}

impl Db {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let pool = SqlitePool::connect(database_url).await.context("connect sqlite")?;
		sqlx::migrate!("./migrations").run(&pool).await.context("run migrations")?;
		Ok(Self { pool })
	}

	// -- accounts ---------------------------------------------------------

	pub async fn login(&self, username: &str, password: &str) -> anyhow::Result<LoginOutcome> {
		let row: Option<(String, String, Option<Vec<u8>>)> =
			sqlx::query_as("SELECT username, password_hash, totp_key FROM users WHERE username = ?")
				.bind(username)
				.fetch_optional(&self.pool)
				.await
				.context("select user")?;

		let Some((correct_username, password_hash, totp_key)) = row else {
			return Ok(LoginOutcome::InvalidCredentials);
		};
		if !auth::verify_password(&password_hash, password) {
			return Ok(LoginOutcome::InvalidCredentials);
		}

		match totp_key {
			Some(totp_key) if !totp_key.is_empty() => Ok(LoginOutcome::TwoFactorRequired {
				username: correct_username,
				totp_key,
			}),
			_ => {
				let is_admin = self.is_admin(&correct_username).await?;
				Ok(LoginOutcome::Success {
					username: correct_username,
					is_admin,
				})
			}
		}
	}

	async fn is_admin(&self, username: &str) -> anyhow::Result<bool> {
		let row: Option<(i64,)> = sqlx::query_as("SELECT admin FROM users WHERE username = ?")
			.bind(username)
			.fetch_optional(&self.pool)
			.await
			.context("select admin flag")?;
		Ok(row.map(|(a,)| a != 0).unwrap_or(false))
	}

	/// Mint a session for an authenticated user, returning the prior
	/// session id (if any) so the caller can invalidate that connection.
	pub async fn create_session(&self, username: &str) -> anyhow::Result<Option<MintedSession>> {
		let row: Option<(String, i64, Option<Vec<u8>>)> =
			sqlx::query_as("SELECT username, admin, session_id FROM users WHERE username = ?")
				.bind(username)
				.fetch_optional(&self.pool)
				.await
				.context("select user for session")?;

		let Some((correct_username, admin, old_session_id)) = row else {
			return Ok(None);
		};

		let new_session_id = auth::generate_session_id();
		sqlx::query("UPDATE users SET session_id = ? WHERE username = ?")
			.bind(&new_session_id)
			.bind(&correct_username)
			.execute(&self.pool)
			.await
			.context("store session id")?;

		Ok(Some(MintedSession {
			username: correct_username,
			is_admin: admin != 0,
			old_session_id: old_session_id.filter(|id| !id.is_empty()),
			new_session_id,
		}))
	}

	pub async fn change_password(&self, username: &str, old_password: &str, new_password: &str) -> anyhow::Result<bool> {
		if new_password.is_empty() || new_password.len() > limits::MAX_PASSWORD_LEN {
			return Ok(false);
		}

		let row: Option<(String,)> = sqlx::query_as("SELECT password_hash FROM users WHERE username = ?")
			.bind(username)
			.fetch_optional(&self.pool)
			.await
			.context("select password hash")?;
		let Some((password_hash,)) = row else {
			return Ok(false);
		};
		if !auth::verify_password(&password_hash, old_password) {
			return Ok(false);
		}

		let new_hash = auth::hash_password(new_password)?;
		sqlx::query("UPDATE users SET password_hash = ? WHERE username = ?")
			.bind(new_hash)
			.bind(username)
			.execute(&self.pool)
			.await
			.context("update password hash")?;
		Ok(true)
	}

	/// Create an account. A valid invite is consumed by the creation; a
	/// reserved username is only granted when an invite binds it.
	pub async fn create_account(
		&self,
		username: &str,
		password: &str,
		totp_key: Option<&[u8]>,
		invite_id: Option<&[u8]>,
		registration_ip: &[u8],
	) -> anyhow::Result<RegisterResult> {
		if !validate_username(username) {
			return Ok(RegisterResult::UsernameInvalid);
		}

		if invite_id.is_none() && self.is_username_reserved(username).await? {
			return Ok(RegisterResult::UsernameTaken);
		}

		let admin = match invite_id {
			Some(id) => match self.validate_invite(id).await? {
				Some(invite) => invite.admin,
				None => return Ok(RegisterResult::InviteInvalid),
			},
			None => false,
		};

		let password_hash = auth::hash_password(password)?;
		let inserted = sqlx::query(
			"INSERT INTO users (username, password_hash, totp_key, admin, registration_ip) VALUES (?, ?, ?, ?, ?) \
			ON CONFLICT (username) DO NOTHING",
		)
		.bind(username)
		.bind(password_hash)
		.bind(totp_key)
		.bind(i64::from(admin))
		.bind(registration_ip)
		.execute(&self.pool)
		.await
		.context("insert user")?;

		if inserted.rows_affected() == 0 {
			return Ok(RegisterResult::UsernameTaken);
		}

		if let Some(id) = invite_id {
			sqlx::query("DELETE FROM invites WHERE id = ?")
				.bind(id)
				.execute(&self.pool)
				.await
				.context("consume invite")?;
		}

		Ok(RegisterResult::Success)
	}

	// -- invites ----------------------------------------------------------

	pub async fn validate_invite(&self, id: &[u8]) -> anyhow::Result<Option<InviteRow>> {
		let row: Option<(String, String, i64)> =
			sqlx::query_as("SELECT name, username, admin FROM invites WHERE id = ?")
				.bind(id)
				.fetch_optional(&self.pool)
				.await
				.context("select invite")?;
		Ok(row.map(|(name, username, admin)| InviteRow {
			name,
			username,
			admin: admin != 0,
		}))
	}

	pub async fn create_invite(&self, name: &str, username: &str, admin: bool) -> anyhow::Result<Vec<u8>> {
		let id = auth::generate_invite_id();
		sqlx::query("INSERT INTO invites (id, name, username, admin) VALUES (?, ?, ?, ?)")
			.bind(&id)
			.bind(name)
			.bind(username)
			.bind(i64::from(admin))
			.execute(&self.pool)
			.await
			.context("insert invite")?;
		Ok(id)
	}

	pub async fn read_invites(&self) -> anyhow::Result<Vec<Invite>> {
		let rows: Vec<(Vec<u8>, String, String, i64)> = sqlx::query_as("SELECT id, name, username, admin FROM invites")
			.fetch_all(&self.pool)
			.await
			.context("select invites")?;
		Ok(rows
			.into_iter()
			.map(|(id, name, username, admin)| Invite {
				id,
				name,
				username,
				admin: admin != 0,
			})
			.collect())
	}

	pub async fn update_invite(&self, id: &[u8], username: &str, admin: bool) -> anyhow::Result<bool> {
		let updated = sqlx::query("UPDATE invites SET username = ?, admin = ? WHERE id = ?")
			.bind(username)
			.bind(i64::from(admin))
			.bind(id)
			.execute(&self.pool)
			.await
			.context("update invite")?;
		Ok(updated.rows_affected() > 0)
	}

	pub async fn delete_invite(&self, id: &[u8]) -> anyhow::Result<()> {
		sqlx::query("DELETE FROM invites WHERE id = ?")
			.bind(id)
			.execute(&self.pool)
			.await
			.context("delete invite")?;
		Ok(())
	}

	// -- reserved usernames -----------------------------------------------

	pub async fn is_username_reserved(&self, username: &str) -> anyhow::Result<bool> {
		let row: Option<(String,)> = sqlx::query_as("SELECT username FROM reserved_usernames WHERE username = ?")
			.bind(username)
			.fetch_optional(&self.pool)
			.await
			.context("select reserved username")?;
		Ok(row.is_some())
	}

	pub async fn create_reserved_username(&self, username: &str) -> anyhow::Result<()> {
		sqlx::query("INSERT INTO reserved_usernames (username) VALUES (?) ON CONFLICT (username) DO NOTHING")
			.bind(username)
			.execute(&self.pool)
			.await
			.context("insert reserved username")?;
		Ok(())
	}

	pub async fn read_reserved_usernames(&self) -> anyhow::Result<Vec<String>> {
		let rows: Vec<(String,)> = sqlx::query_as("SELECT username FROM reserved_usernames ORDER BY username")
			.fetch_all(&self.pool)
			.await
			.context("select reserved usernames")?;
		Ok(rows.into_iter().map(|(u,)| u).collect())
	}

	pub async fn delete_reserved_username(&self, username: &str) -> anyhow::Result<()> {
		sqlx::query("DELETE FROM reserved_usernames WHERE username = ?")
			.bind(username)
			.execute(&self.pool)
			.await
			.context("delete reserved username")?;
		Ok(())
	}

	// -- server settings --------------------------------------------------

	pub async fn load_server_settings(&self) -> anyhow::Result<Vec<ServerSetting>> {
		let rows: Vec<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM server_settings ORDER BY kind")
			.fetch_all(&self.pool)
			.await
			.context("select server settings")?;
		let mut settings = Vec::with_capacity(rows.len());
		for (value,) in rows {
			settings.push(ServerSetting::decode(value.as_slice()).context("decode server setting")?);
		}
		Ok(settings)
	}

	pub async fn save_server_settings(&self, updates: &[ServerSetting]) -> anyhow::Result<()> {
		for setting in updates {
			let Some(kind) = crate::server::settings::server_setting_kind(setting) else {
				continue;
			};
			sqlx::query(
				"INSERT INTO server_settings (kind, value) VALUES (?, ?) \
				ON CONFLICT (kind) DO UPDATE SET value = excluded.value",
			)
			.bind(i64::from(kind))
			.bind(setting.encode_to_vec())
			.execute(&self.pool)
			.await
			.context("upsert server setting")?;
		}
		Ok(())
	}

	// -- virtual machines -------------------------------------------------

	pub async fn next_vm_id(&self) -> anyhow::Result<u32> {
		let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(vm_id) FROM vm_settings")
			.fetch_one(&self.pool)
			.await
			.context("select max vm id")?;
		Ok(row.0.unwrap_or(0) as u32 + 1)
	}

	pub async fn save_vm_settings(&self, vm_id: u32, settings: &[VmSetting]) -> anyhow::Result<()> {
		for setting in settings {
			let Some(kind) = crate::server::vm::vm_setting_kind(setting) else {
				continue;
			};
			sqlx::query(
				"INSERT INTO vm_settings (vm_id, kind, value) VALUES (?, ?, ?) \
				ON CONFLICT (vm_id, kind) DO UPDATE SET value = excluded.value",
			)
			.bind(i64::from(vm_id))
			.bind(i64::from(kind))
			.bind(setting.encode_to_vec())
			.execute(&self.pool)
			.await
			.context("upsert vm setting")?;
		}
		Ok(())
	}

	pub async fn delete_vm(&self, vm_id: u32) -> anyhow::Result<()> {
		sqlx::query("DELETE FROM vm_settings WHERE vm_id = ?")
			.bind(i64::from(vm_id))
			.execute(&self.pool)
			.await
			.context("delete vm settings")?;
		sqlx::query("DELETE FROM recordings WHERE vm_id = ?")
			.bind(i64::from(vm_id))
			.execute(&self.pool)
			.await
			.context("delete vm recordings")?;
		Ok(())
	}

	pub async fn read_all_vm_settings(&self) -> anyhow::Result<Vec<(u32, Vec<VmSetting>)>> {
		let rows: Vec<(i64, Vec<u8>)> = sqlx::query_as("SELECT vm_id, value FROM vm_settings ORDER BY vm_id, kind")
			.fetch_all(&self.pool)
			.await
			.context("select vm settings")?;

		let mut vms: Vec<(u32, Vec<VmSetting>)> = Vec::new();
		for (vm_id, value) in rows {
			let setting = VmSetting::decode(value.as_slice()).context("decode vm setting")?;
			match vms.last_mut() {
				Some((id, settings)) if *id == vm_id as u32 => settings.push(setting),
				_ => vms.push((vm_id as u32, vec![setting])),
			}
		}
		Ok(vms)
	}

	// -- recordings -------------------------------------------------------

	pub async fn insert_recording(&self, vm_id: u32, path: &str, start_ms: u64) -> anyhow::Result<()> {
		sqlx::query("INSERT INTO recordings (vm_id, path, start_ms, stop_ms) VALUES (?, ?, ?, 0)")
			.bind(i64::from(vm_id))
			.bind(path)
			.bind(start_ms as i64)
			.execute(&self.pool)
			.await
			.context("insert recording")?;
		Ok(())
	}

	pub async fn finalize_recording(&self, vm_id: u32, path: &str, stop_ms: u64) -> anyhow::Result<()> {
		sqlx::query("UPDATE recordings SET stop_ms = ? WHERE vm_id = ? AND path = ?")
			.bind(stop_ms as i64)
			.bind(i64::from(vm_id))
			.bind(path)
			.execute(&self.pool)
			.await
			.context("finalize recording")?;
		Ok(())
	}

	/// Earliest recording file that still covers or follows `timestamp`.
	pub async fn recording_file_for(&self, vm_id: u32, timestamp: u64) -> anyhow::Result<Option<(String, u64, u64)>> {
		let row: Option<(String, i64, i64)> = sqlx::query_as(
			"SELECT path, start_ms, stop_ms FROM recordings \
			WHERE vm_id = ? AND (stop_ms >= ? OR stop_ms = 0) \
			ORDER BY start_ms ASC LIMIT 1",
		)
		.bind(i64::from(vm_id))
		.bind(timestamp as i64)
		.fetch_optional(&self.pool)
		.await
		.context("select recording file")?;
		Ok(row.map(|(path, start, stop)| (path, start as u64, stop as u64)))
	}
}

#[cfg(test)]
mod db_tests {
	use super::*;

	async fn memory_db() -> Db {
		Db::connect("sqlite::memory:").await.expect("connect")
	}

	#[tokio::test]
	async fn account_lifecycle() {
		let db = memory_db().await;

		let result = db
			.create_account("alice", "password123", None, None, &[127, 0, 0, 1])
			.await
			.expect("create");
		assert_eq!(result, RegisterResult::Success);

		let duplicate = db
			.create_account("ALICE", "password123", None, None, &[127, 0, 0, 1])
			.await
			.expect("create duplicate");
		assert_eq!(duplicate, RegisterResult::UsernameTaken);

		match db.login("Alice", "password123").await.expect("login") {
			LoginOutcome::Success { username, is_admin } => {
				assert_eq!(username, "alice");
				assert!(!is_admin);
			}
			_ => panic!("expected success"),
		}
		assert!(matches!(
			db.login("alice", "wrong").await.expect("login"),
			LoginOutcome::InvalidCredentials
		));

		assert!(db.change_password("alice", "password123", "better-pass").await.expect("change"));
		assert!(!db.change_password("alice", "password123", "again").await.expect("change"));
	}

	#[tokio::test]
	async fn session_minting_reports_the_prior_session() {
		let db = memory_db().await;
		db.create_account("bob", "pw-pw-pw", None, None, &[]).await.expect("create");

		let first = db.create_session("bob").await.expect("mint").expect("user exists");
		assert!(first.old_session_id.is_none());

		let second = db.create_session("BOB").await.expect("mint").expect("user exists");
		assert_eq!(second.username, "bob");
		assert_eq!(second.old_session_id.as_deref(), Some(first.new_session_id.as_slice()));
		assert_ne!(second.new_session_id, first.new_session_id);
	}

	#[tokio::test]
	async fn invites_are_single_use_and_grant_admin() {
		let db = memory_db().await;
		let id = db.create_invite("staff", "carol", true).await.expect("invite");

		let row = db.validate_invite(&id).await.expect("validate").expect("present");
		assert_eq!(row.username, "carol");
		assert!(row.admin);

		let result = db
			.create_account("carol", "pw-pw-pw", None, Some(&id), &[])
			.await
			.expect("create");
		assert_eq!(result, RegisterResult::Success);
		assert!(db.validate_invite(&id).await.expect("validate").is_none());

		match db.login("carol", "pw-pw-pw").await.expect("login") {
			LoginOutcome::Success { is_admin, .. } => assert!(is_admin),
			_ => panic!("expected success"),
		}
	}

	#[tokio::test]
	async fn reserved_usernames_block_open_registration() {
		let db = memory_db().await;
		db.create_reserved_username("Moderator").await.expect("reserve");

		let result = db
			.create_account("moderator", "pw-pw-pw", None, None, &[])
			.await
			.expect("create");
		assert_eq!(result, RegisterResult::UsernameTaken);

		assert_eq!(db.read_reserved_usernames().await.expect("read"), vec!["Moderator"]);
		db.delete_reserved_username("moderator").await.expect("delete");
		assert!(db.read_reserved_usernames().await.expect("read").is_empty());
	}

	#[tokio::test]
	async fn two_factor_key_pauses_login() {
		let db = memory_db().await;
		db.create_account("dave", "pw-pw-pw", Some(&[7u8; 20]), None, &[])
			.await
			.expect("create");

		match db.login("dave", "pw-pw-pw").await.expect("login") {
			LoginOutcome::TwoFactorRequired { totp_key, .. } => assert_eq!(totp_key, vec![7u8; 20]),
			_ => panic!("expected two-factor"),
		}
	}

	#[tokio::test]
	async fn recording_index_walk() {
		let db = memory_db().await;
		db.insert_recording(3, "recordings/a.bin", 1_000).await.expect("insert");
		db.finalize_recording(3, "recordings/a.bin", 2_000).await.expect("finalize");
		db.insert_recording(3, "recordings/b.bin", 2_000).await.expect("insert");

		let (path, start, stop) = db
			.recording_file_for(3, 1_500)
			.await
			.expect("query")
			.expect("file found");
		assert_eq!((path.as_str(), start, stop), ("recordings/a.bin", 1_000, 2_000));

		// The still-open file (stop 0) covers late timestamps.
		let (path, ..) = db
			.recording_file_for(3, 5_000)
			.await
			.expect("query")
			.expect("file found");
		assert_eq!(path, "recordings/b.bin");

		assert!(db.recording_file_for(9, 1_500).await.expect("query").is_none());
	}

	#[tokio::test]
	async fn vm_settings_roundtrip() {
		use vmhub_protocol::messages::vm_setting::Setting;

		let db = memory_db().await;
		let settings = vec![
			VmSetting {
				setting: Some(Setting::Name("lab".to_string())),
			},
			VmSetting {
				setting: Some(Setting::TurnTime(20)),
			},
		];
		let vm_id = db.next_vm_id().await.expect("id");
		assert_eq!(vm_id, 1);
		db.save_vm_settings(vm_id, &settings).await.expect("save");

		let all = db.read_all_vm_settings().await.expect("read");
		assert_eq!(all.len(), 1);
		assert_eq!(all[0].0, vm_id);
		assert_eq!(all[0].1.len(), 2);

		db.delete_vm(vm_id).await.expect("delete");
		assert!(db.read_all_vm_settings().await.expect("read").is_empty());
	}
}
