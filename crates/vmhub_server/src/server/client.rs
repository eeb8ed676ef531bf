#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};
use tracing::warn;
use vmhub_protocol::encode_shared_frame;
use vmhub_protocol::messages::ServerMessage;

use crate::server::exec::Owner;

/// Outbound frames a slow consumer may have in flight before the server
/// gives up on it and disconnects.
pub const SEND_QUEUE_CAPACITY: usize = 512;

/// Close signal shared between the reader loop, the writer task, and any
/// owner that decides to drop the connection (kick, session invalidation,
/// send-queue overflow).
#[derive(Default)]
pub struct Closer {
	closed: AtomicBool,
	notify: Notify,
}

impl Closer {
	pub fn close(&self) {
		if !self.closed.swap(true, Ordering::SeqCst) {
			self.notify.notify_waiters();
		}
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	pub async fn wait(&self) {
		loop {
			let notified = self.notify.notified();
			if self.is_closed() {
				return;
			}
			notified.await;
		}
	}
}

/// Per-session mutable state owned by the session's own executor: identity
/// plus the direct-chat table. Everything else on [`Client`] is either
/// immutable or a lock-free flag.
#[derive(Default)]
pub struct ClientState {
	pub username: String,
	pub session_id: Option<Vec<u8>>,
	/// Local direct-chat id -> (peer, peer-side id). A peer id of zero
	/// marks a half-open row still waiting for the recipient's side.
	pub chat_rooms: HashMap<u32, DirectChat>,
	pub next_chat_id: u32,
	/// Login paused mid two-factor: the account and its TOTP key.
	pub pending_totp: Option<PendingTotp>,
}

pub struct DirectChat {
	pub peer: Arc<Client>,
	pub peer_id: u32,
}

pub struct PendingTotp {
	pub username: String,
	pub totp_key: Vec<u8>,
}

#[derive(Default)]
struct ClientFlags {
	logged_in: AtomicBool,
	admin: AtomicBool,
	captcha_required: AtomicBool,
	viewing_vm_list: AtomicBool,
	viewing_server_config: AtomicBool,
	in_global_chat: AtomicBool,
	connected_vm: AtomicU32,
}

/// Handle to one live connection. Shared across owners; the only mutation
/// paths are the atomic flags, the state owner, and the bounded send queue.
pub struct Client {
	pub conn_id: u64,
	pub ip: IpAddr,
	pub ip_bytes: [u8; 16],
	pub state: Owner<ClientState>,
	pub closer: Closer,
	sender: mpsc::Sender<Bytes>,
	flags: ClientFlags,
}

impl Client {
	/// Create the handle and hand back the receiving end of the send queue
	/// for the transport writer task.
	pub fn new(conn_id: u64, ip: IpAddr) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
		let (sender, receiver) = mpsc::channel(SEND_QUEUE_CAPACITY);
		let client = Arc::new(Self {
			conn_id,
			ip,
			ip_bytes: ip_to_bytes(ip),
			state: Owner::spawn(
				"client-state",
				ClientState {
					next_chat_id: 1,
					..ClientState::default()
				},
			),
			closer: Closer::default(),
			sender,
			flags: ClientFlags::default(),
		});
		(client, receiver)
	}

	/// Queue an already-framed message. The frame is refcounted; broadcast
	/// paths clone the same `Bytes` into many queues. Overflow means the
	/// consumer cannot keep up and the connection is dropped rather than
	/// letting the queue grow without bound.
	pub fn queue_frame(&self, frame: Bytes) {
		if self.closer.is_closed() {
			return;
		}
		match self.sender.try_send(frame) {
			Ok(()) => {}
			Err(mpsc::error::TrySendError::Full(_)) => {
				warn!(conn_id = self.conn_id, "send queue overflow, disconnecting");
				metrics::counter!("vmhub_server_send_overflow_total").increment(1);
				self.closer.close();
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {}
		}
	}

	/// Frame and queue a single-recipient message.
	pub fn queue_message(&self, message: &ServerMessage) {
		match encode_shared_frame(message) {
			Ok(frame) => self.queue_frame(frame),
			Err(e) => warn!(conn_id = self.conn_id, error = %e, "failed to frame outbound message"),
		}
	}

	pub fn close(&self) {
		self.closer.close();
	}

	pub fn is_logged_in(&self) -> bool {
		self.flags.logged_in.load(Ordering::Relaxed)
	}

	pub fn set_logged_in(&self, admin: bool) {
		self.flags.logged_in.store(true, Ordering::Relaxed);
		self.flags.admin.store(admin, Ordering::Relaxed);
	}

	pub fn is_admin(&self) -> bool {
		self.flags.admin.load(Ordering::Relaxed)
	}

	pub fn is_captcha_required(&self) -> bool {
		self.flags.captcha_required.load(Ordering::Relaxed)
	}

	pub fn set_captcha_required(&self, required: bool) {
		self.flags.captcha_required.store(required, Ordering::Relaxed);
	}

	pub fn user_type(&self) -> vmhub_protocol::messages::UserType {
		use vmhub_protocol::messages::UserType;
		if self.is_admin() {
			UserType::Admin
		} else if self.is_logged_in() {
			UserType::Regular
		} else {
			UserType::Guest
		}
	}

	/// Channel the client is connected to; zero means none.
	pub fn connected_vm(&self) -> u32 {
		self.flags.connected_vm.load(Ordering::Relaxed)
	}

	pub fn set_connected_vm(&self, vm_id: u32) {
		self.flags.connected_vm.store(vm_id, Ordering::Relaxed);
	}

	pub fn is_in_global_chat(&self) -> bool {
		self.flags.in_global_chat.load(Ordering::Relaxed)
	}

	pub fn set_in_global_chat(&self, value: bool) -> bool {
		self.flags.in_global_chat.swap(value, Ordering::Relaxed)
	}

	pub fn is_viewing_vm_list(&self) -> bool {
		self.flags.viewing_vm_list.load(Ordering::Relaxed)
	}

	pub fn set_viewing_vm_list(&self, value: bool) -> bool {
		self.flags.viewing_vm_list.swap(value, Ordering::Relaxed)
	}

	pub fn is_viewing_server_config(&self) -> bool {
		self.flags.viewing_server_config.load(Ordering::Relaxed)
	}

	pub fn set_viewing_server_config(&self, value: bool) -> bool {
		self.flags.viewing_server_config.swap(value, Ordering::Relaxed)
	}
}

/// Canonical 16-byte form; IPv4 is mapped into IPv6.
pub fn ip_to_bytes(ip: IpAddr) -> [u8; 16] {
	match ip {
		IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
		IpAddr::V6(v6) => v6.octets(),
	}
}
