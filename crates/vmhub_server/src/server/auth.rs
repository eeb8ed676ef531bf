#![forbid(unsafe_code)]

use anyhow::anyhow;
use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

/// TOTP step size per RFC 6238.
const TOTP_STEP_SECS: u64 = 30;
const TOTP_DIGITS: u32 = 6;

pub fn hash_password(password: &str) -> anyhow::Result<String> {
	let salt = SaltString::generate(&mut OsRng);
	Argon2::default()
		.hash_password(password.as_bytes(), &salt)
		.map(|hash| hash.to_string())
		.map_err(|e| anyhow!("password hashing failed: {e}"))
}

pub fn verify_password(hash: &str, password: &str) -> bool {
	let Ok(parsed) = PasswordHash::new(hash) else {
		return false;
	};
	Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
}

/// Validate a 6-digit TOTP code against the shared key, accepting one step
/// of clock skew either way.
pub fn verify_totp(key: &[u8], code: &str, now_unix_secs: u64) -> bool {
	let Ok(code) = code.trim().parse::<u32>() else {
		return false;
	};
	if key.is_empty() {
		return false;
	}

	let step = now_unix_secs / TOTP_STEP_SECS;
	[step.wrapping_sub(1), step, step + 1]
		.iter()
		.any(|&counter| hotp(key, counter) == Some(code))
}

fn hotp(key: &[u8], counter: u64) -> Option<u32> {
	let mut mac = Hmac::<Sha1>::new_from_slice(key).ok()?;
	mac.update(&counter.to_be_bytes());
	let digest = mac.finalize().into_bytes();

	let offset = (digest[digest.len() - 1] & 0x0f) as usize;
	let binary = (u32::from(digest[offset] & 0x7f) << 24)
		| (u32::from(digest[offset + 1]) << 16)
		| (u32::from(digest[offset + 2]) << 8)
		| u32::from(digest[offset + 3]);
	Some(binary % 10u32.pow(TOTP_DIGITS))
}

pub fn generate_session_id() -> Vec<u8> {
	let mut id = vec![0u8; 16];
	rand::rngs::OsRng.fill_bytes(&mut id);
	id
}

pub fn generate_invite_id() -> Vec<u8> {
	let mut id = vec![0u8; vmhub_protocol::limits::INVITE_ID_LEN];
	rand::rngs::OsRng.fill_bytes(&mut id);
	id
}

#[cfg(test)]
mod auth_tests {
	use super::*;

	#[test]
	fn password_hash_roundtrip() {
		let hash = hash_password("correct horse battery staple").expect("hash");
		assert!(verify_password(&hash, "correct horse battery staple"));
		assert!(!verify_password(&hash, "incorrect horse"));
		assert!(!verify_password("not-a-phc-string", "anything"));
	}

	#[test]
	fn totp_matches_rfc_6238_vector() {
		// RFC 6238 appendix B, SHA-1, T = 59s: 8-digit code 94287082.
		let key = b"12345678901234567890";
		assert!(verify_totp(key, "287082", 59));
		assert!(!verify_totp(key, "000000", 59));
	}

	#[test]
	fn totp_accepts_adjacent_steps_only() {
		let key = b"12345678901234567890";
		// The T = 59s code is valid within one step of skew.
		assert!(verify_totp(key, "287082", 59 + TOTP_STEP_SECS));
		assert!(!verify_totp(key, "287082", 59 + 3 * TOTP_STEP_SECS));
	}

	#[test]
	fn totp_rejects_garbage() {
		assert!(!verify_totp(b"12345678901234567890", "not-a-number", 59));
		assert!(!verify_totp(b"", "287082", 59));
	}

	#[test]
	fn generated_ids_have_expected_sizes() {
		assert_eq!(generate_session_id().len(), 16);
		assert_eq!(generate_invite_id().len(), vmhub_protocol::limits::INVITE_ID_LEN);
		assert_ne!(generate_session_id(), generate_session_id());
	}
}
