#![forbid(unsafe_code)]

pub mod framing;
pub mod messages;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_shared_frame,
	frame_len_from_payload_len, try_decode_frame_from_buffer,
};

/// Channel id of the global lobby (chat only, no virtual machine behind it).
pub const GLOBAL_CHANNEL_ID: u32 = 0;

/// Validation limits shared by client and server.
pub mod limits {
	pub const MAX_USERNAME_LEN: usize = 20;
	pub const MIN_USERNAME_LEN: usize = 3;
	pub const MAX_CHAT_MESSAGE_LEN: usize = 256;
	pub const MAX_PASSWORD_LEN: usize = 160;
	/// TOTP keys are raw 160-bit secrets.
	pub const TOTP_KEY_LEN: usize = 20;
	/// Invite ids are 32 random bytes.
	pub const INVITE_ID_LEN: usize = 32;
}

/// Username charset and length validation.
///
/// Accepts `[A-Za-z0-9_]` with no leading/trailing underscore runs longer
/// than the name itself; the same rule applies to guest renames and account
/// registration.
pub fn validate_username(username: &str) -> bool {
	let len = username.chars().count();
	if !(limits::MIN_USERNAME_LEN..=limits::MAX_USERNAME_LEN).contains(&len) {
		return false;
	}
	username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
