#![forbid(unsafe_code)]

use std::process::Stdio;

use tracing::{info, warn};

/// Run the operator-configured ban command with `IP_ADDRESS` in its
/// environment, detached. The command is a loose hook into an external
/// firewall tool; its exit status is not observed.
pub fn execute_ban_command(command: &str, ip_address: &str) {
	if command.trim().is_empty() {
		return;
	}

	info!(ip = ip_address, "spawning ban-ip command");

	let mut cmd = if cfg!(windows) {
		let mut cmd = tokio::process::Command::new("cmd");
		cmd.arg("/C").arg(command);
		cmd
	} else {
		let mut cmd = tokio::process::Command::new("sh");
		cmd.arg("-c").arg(command);
		cmd
	};

	cmd.env("IP_ADDRESS", ip_address)
		.stdin(Stdio::null())
		.stdout(Stdio::null())
		.stderr(Stdio::null())
		.kill_on_drop(false);

	match cmd.spawn() {
		Ok(_child) => {}
		Err(e) => warn!(error = %e, "failed to spawn ban-ip command"),
	}
}

#[cfg(test)]
mod ban_tests {
	use super::*;

	#[tokio::test]
	async fn command_receives_the_address_through_the_environment() {
		let dir = tempfile::tempdir().expect("tempdir");
		let marker = dir.path().join("banned");
		let command = format!("echo \"$IP_ADDRESS\" > {}", marker.display());

		execute_ban_command(&command, "2001:db8::1");

		for _ in 0..50 {
			if marker.exists() {
				break;
			}
			tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		}
		let contents = std::fs::read_to_string(&marker).expect("marker written");
		assert_eq!(contents.trim(), "2001:db8::1");
	}

	#[tokio::test]
	async fn empty_command_is_a_no_op() {
		execute_ban_command("   ", "192.0.2.1");
	}
}
