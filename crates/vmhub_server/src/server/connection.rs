#![forbid(unsafe_code)]

use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use vmhub_protocol::messages::{
	ChannelChatMessage, ChatMessageEntry, ChatMessageResult, ConnectResponse, ConnectSuccess, Empty, InviteList,
	InviteResult, LoginResponse, LoginResult, NewChatChannel, RegisterResponse, RegisterResult, ReservedUsernameList,
	ServerMessage, Session, UserType, chat_destination, client_message, connect_response, server_message,
};
use vmhub_protocol::{DEFAULT_MAX_FRAME_SIZE, GLOBAL_CHANNEL_ID, decode_frame, limits, validate_username};

use crate::server::ban::execute_ban_command;
use crate::server::channel::{UserData, UserVoteData};
use crate::server::client::{Client, DirectChat, PendingTotp};
use crate::server::context::ServerContext;
use crate::server::db::LoginOutcome;
use crate::server::exec::Owner;
use crate::server::ip_data::IpData;
use crate::server::playback::spawn_preview;
use crate::server::vm::VmSettings;
use crate::server::{auth, vm::Vm};
use crate::transport;
use crate::util::time::unix_ms_now;

const USERNAME_CHANGE_RATE_LIMIT: Duration = Duration::from_secs(5);
const CHAT_RATE_LIMIT: Duration = Duration::from_millis(250);
/// Direct chats one user may hold open.
const MAX_DIRECT_CHATS: usize = 10;

/// Rate-limit clocks live with the connection task; no owner hop needed.
pub(crate) struct RateLimits {
	last_chat_message: Option<Instant>,
	last_username_change: Option<Instant>,
}

impl RateLimits {
	pub(crate) fn new() -> Self {
		Self {
			last_chat_message: None,
			last_username_change: None,
		}
	}

	fn allow(last: &mut Option<Instant>, min_gap: Duration) -> bool {
		let now = Instant::now();
		if last.is_some_and(|at| now.duration_since(at) < min_gap) {
			return false;
		}
		*last = Some(now);
		true
	}
}

/// Balances the pre-connect increment when the connection ends, whichever
/// path it ends through.
struct IpGuard {
	owner: Arc<Owner<IpData>>,
}

impl Drop for IpGuard {
	fn drop(&mut self) {
		self.owner.dispatch(|ip| ip.release());
	}
}

struct ConnectionGaugeGuard;

impl Drop for ConnectionGaugeGuard {
	fn drop(&mut self) {
		metrics::gauge!("vmhub_server_active_connections").decrement(1.0);
	}
}

pub async fn handle_connection(
	ctx: Arc<ServerContext>,
	conn_id: u64,
	stream: TcpStream,
	remote_ip: IpAddr,
) -> anyhow::Result<()> {
	// Pre-connect admission: look up the cap, then count this address,
	// all before the websocket handshake is allowed to complete.
	let (max_enabled, max_connections, captcha_required) = ctx
		.settings
		.query(|store| {
			(
				store.settings.max_connections_enabled,
				store.settings.max_connections,
				store.settings.captcha_required,
			)
		})
		.await
		.ok_or_else(|| anyhow!("settings owner unavailable"))?;

	let ip_bytes = crate::server::client::ip_to_bytes(remote_ip);
	let ip_owner = ctx
		.ip_registry
		.query(move |registry| registry.entry(ip_bytes))
		.await
		.ok_or_else(|| anyhow!("ip registry unavailable"))?;

	let admitted = ip_owner
		.query(move |ip| ip.try_admit(max_enabled, max_connections))
		.await
		.unwrap_or(false);
	let _ip_guard = IpGuard { owner: ip_owner };
	if !admitted {
		debug!(conn_id, ip = %remote_ip, "connection rejected by per-ip cap");
		metrics::counter!("vmhub_server_connections_rejected_total").increment(1);
		return Ok(());
	}

	let (sink, mut source) = transport::accept(stream).await?;

	metrics::gauge!("vmhub_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (client, send_rx) = Client::new(conn_id, remote_ip);
	client.set_captcha_required(captcha_required);
	let writer = transport::spawn_writer(sink, send_rx, Arc::clone(&client));

	let mut limits = RateLimits::new();
	loop {
		tokio::select! {
			_ = client.closer.wait() => break,
			frame = source.next_frame() => {
				let Some(data) = frame else { break };
				metrics::counter!("vmhub_server_frames_in_total").increment(1);
				let message = match decode_frame::<vmhub_protocol::messages::ClientMessage>(&data, DEFAULT_MAX_FRAME_SIZE) {
					Ok((message, _)) => message,
					Err(e) => {
						debug!(conn_id, error = %e, "undecodable frame, closing");
						break;
					}
				};
				if handle_message(&ctx, &client, message, &mut limits).await.is_err() {
					break;
				}
			}
		}
	}

	client.close();
	on_disconnect(&ctx, &client).await;
	let _ = writer.await;
	Ok(())
}

/// Route one decoded message. `Err` means protocol violation: the caller
/// closes the socket. Capability and rate-limit failures drop silently.
pub(crate) async fn handle_message(
	ctx: &Arc<ServerContext>,
	client: &Arc<Client>,
	message: vmhub_protocol::messages::ClientMessage,
	limits: &mut RateLimits,
) -> anyhow::Result<()> {
	use client_message::Payload;

	let Some(payload) = message.payload else {
		return Err(anyhow!("unknown message tag"));
	};

	match payload {
		Payload::ConnectToChannel(channel_id) => {
			if client.is_captcha_required() {
				return Ok(());
			}
			connect_to_channel(ctx, client, channel_id).await;
		}
		Payload::CaptchaCompleted(token) => {
			let valid = ctx.captcha.verify(&token, &client.ip.to_string()).await;
			client.set_captcha_required(!valid);
		}
		Payload::TurnRequest(Empty {}) => {
			if let Some(vm) = connected_vm(ctx, client).await {
				vm.request_turn(client.conn_id);
			}
		}
		Payload::Vote(voted_yes) => {
			if let Some(vm) = connected_vm(ctx, client).await {
				vm.vote(client.conn_id, voted_yes);
			}
		}
		Payload::GuacInstr(instr) => {
			if let Some(vm) = connected_vm(ctx, client).await {
				vm.read_instruction(client.conn_id, instr);
			}
		}
		Payload::ChangeUsername(new_username) => {
			change_username(ctx, client, new_username, limits).await;
		}
		Payload::ChangePassword(request) => {
			if !client.is_logged_in() {
				return Ok(());
			}
			let username = current_username(client).await;
			if username.is_empty() {
				return Ok(());
			}
			let ctx = Arc::clone(ctx);
			let client = Arc::clone(client);
			ctx.login_exec.clone().dispatch_async(move |_| {
				Box::pin(async move {
					let changed = ctx
						.db
						.change_password(&username, &request.old_password, &request.new_password)
						.await
						.unwrap_or_else(|e| {
							warn!(error = %e, "password change failed");
							false
						});
					client.queue_message(&ServerMessage::new(server_message::Payload::ChangePasswordResponse(changed)));
				})
			});
		}
		Payload::ChatMessage(request) => {
			chat_message(ctx, client, request, limits).await;
		}
		Payload::VmListRequest(Empty {}) => {
			if !client.set_viewing_vm_list(true) {
				let client = Arc::clone(client);
				ctx.vms.dispatch(move |registry| registry.add_vm_list_viewer(client));
			}
		}
		Payload::Login(request) => {
			login(ctx, client, request).await;
		}
		Payload::TwoFactorResponse(code) => {
			two_factor_response(ctx, client, code).await;
		}
		Payload::Register(request) => {
			register(ctx, client, request).await;
		}
		Payload::ServerConfigRequest(Empty {}) => {
			if !client.is_admin() {
				return Ok(());
			}
			let for_settings = Arc::clone(client);
			ctx.settings.dispatch(move |store| {
				for_settings.queue_message(&ServerMessage::new(server_message::Payload::ServerSettings(
					store.settings.to_list_message(),
				)));
			});
			if !client.set_viewing_server_config(true) {
				let client = Arc::clone(client);
				ctx.vms.dispatch(move |registry| registry.add_admin_viewer(client));
			}
		}
		Payload::ServerConfigModifications(modifications) => {
			if !client.is_admin() {
				return Ok(());
			}
			let ctx_for_apply = Arc::clone(ctx);
			let modifier = Arc::clone(client);
			ctx.settings.dispatch(move |store| {
				if let Err(e) = store.update(&modifications.settings) {
					warn!(conn_id = modifier.conn_id, error = e, "rejected server settings update");
					return;
				}
				ctx_for_apply.captcha.set_settings(store.settings.captcha.clone());

				let config = ServerMessage::new(server_message::Payload::ServerSettings(store.settings.to_list_message()));
				let Ok(frame) = vmhub_protocol::encode_shared_frame(&config) else {
					return;
				};
				let exclude = modifier.conn_id;
				ctx_for_apply.vms.dispatch(move |registry| {
					registry.broadcast_to_admin_viewers(frame, Some(exclude));
				});
			});
		}
		Payload::ServerConfigHidden(Empty {}) => {
			if client.set_viewing_server_config(false) {
				let conn_id = client.conn_id;
				ctx.vms.dispatch(move |registry| registry.remove_admin_viewer(conn_id));
			}
		}
		Payload::CreateVm(initial_settings) => {
			if !client.is_admin() {
				return Ok(());
			}
			create_vm(ctx, client, initial_settings.settings).await;
		}
		Payload::ReadVms(Empty {}) => {
			if !client.is_admin() {
				return Ok(());
			}
			let client = Arc::clone(client);
			ctx.vms.dispatch(move |registry| registry.send_admin_list(&client));
		}
		Payload::ReadVmConfig(vm_id) => {
			if !client.is_admin() {
				return Ok(());
			}
			if let Some(vm) = vm_by_id(ctx, vm_id).await {
				let client = Arc::clone(client);
				vm.settings_list(move |settings| {
					client.queue_message(&ServerMessage::new(server_message::Payload::VmConfig(
						vmhub_protocol::messages::VmSettingsList { settings },
					)));
				});
			}
		}
		Payload::UpdateVmConfig(update) => {
			if !client.is_admin() {
				return Ok(());
			}
			let Some(vm) = vm_by_id(ctx, update.vm_id).await else {
				return Ok(());
			};
			let client = Arc::clone(client);
			let ctx = Arc::clone(ctx);
			let vm_id = update.vm_id;
			vm.update_settings(update.settings, move |result| match result {
				Ok(settings) => {
					client.queue_message(&ServerMessage::new(server_message::Payload::VmConfig(
						vmhub_protocol::messages::VmSettingsList { settings },
					)));
					let owner = ctx.vms.clone();
					ctx.vms.dispatch(move |registry| registry.update_single_vm(vm_id, &owner));
				}
				Err(e) => {
					warn!(vm_id, error = e, "rejected vm settings update");
				}
			});
		}
		Payload::DeleteVm(vm_id) => {
			if !client.is_admin() {
				return Ok(());
			}
			let ctx_for_db = Arc::clone(ctx);
			ctx.vms.dispatch(move |registry| {
				if !registry.remove(vm_id) {
					return;
				}
				info!(vm_id, "vm deleted");
				tokio::spawn(async move {
					if let Err(e) = ctx_for_db.db.delete_vm(vm_id).await {
						warn!(vm_id, error = %e, "failed to delete vm rows");
					}
				});
			});
		}
		Payload::StartVms(ids) => power_vms(ctx, client, ids.ids, PowerAction::Start).await,
		Payload::StopVms(ids) => power_vms(ctx, client, ids.ids, PowerAction::Stop).await,
		Payload::RestartVms(ids) => power_vms(ctx, client, ids.ids, PowerAction::Restart).await,
		Payload::CreateInvite(invite) => {
			if !client.is_admin() {
				return Ok(());
			}
			let result = ctx.db.create_invite(&invite.name, &invite.username, invite.admin).await;
			let response = match result {
				Ok(id) => InviteResult {
					success: true,
					id,
					username: invite.username,
				},
				Err(e) => {
					warn!(error = %e, "invite creation failed");
					InviteResult::default()
				}
			};
			client.queue_message(&ServerMessage::new(server_message::Payload::InviteResult(response)));
		}
		Payload::ReadInvites(Empty {}) => {
			if !client.is_admin() {
				return Ok(());
			}
			let invites = ctx.db.read_invites().await.unwrap_or_default();
			client.queue_message(&ServerMessage::new(server_message::Payload::InviteList(InviteList { invites })));
		}
		Payload::UpdateInvite(invite) => {
			if !client.is_admin() {
				return Ok(());
			}
			let success = ctx
				.db
				.update_invite(&invite.id, &invite.username, invite.admin)
				.await
				.unwrap_or(false);
			client.queue_message(&ServerMessage::new(server_message::Payload::InviteResult(InviteResult {
				success,
				id: invite.id,
				username: invite.username,
			})));
		}
		Payload::DeleteInvite(id) => {
			if !client.is_admin() {
				return Ok(());
			}
			let success = ctx.db.delete_invite(&id).await.is_ok();
			client.queue_message(&ServerMessage::new(server_message::Payload::InviteResult(InviteResult {
				success,
				id,
				username: String::new(),
			})));
		}
		Payload::ValidateInvite(id) => {
			let invite = ctx.db.validate_invite(&id).await.unwrap_or(None);
			let response = match invite {
				Some(row) => InviteResult {
					success: true,
					id,
					username: row.username,
				},
				None => InviteResult {
					success: false,
					id,
					username: String::new(),
				},
			};
			client.queue_message(&ServerMessage::new(server_message::Payload::InviteResult(response)));
		}
		Payload::CreateReservedUsername(username) => {
			if !client.is_admin() {
				return Ok(());
			}
			if ctx.db.create_reserved_username(&username).await.is_ok() {
				ctx.reserved_names.insert(&username);
			}
		}
		Payload::ReadReservedUsernames(Empty {}) => {
			if !client.is_admin() {
				return Ok(());
			}
			let usernames = ctx.db.read_reserved_usernames().await.unwrap_or_default();
			client.queue_message(&ServerMessage::new(server_message::Payload::ReservedUsernames(
				ReservedUsernameList { usernames },
			)));
		}
		Payload::DeleteReservedUsername(username) => {
			if !client.is_admin() {
				return Ok(());
			}
			if ctx.db.delete_reserved_username(&username).await.is_ok() {
				ctx.reserved_names.remove(&username);
			}
		}
		Payload::BanIp(address) => {
			if !client.is_admin() {
				return Ok(());
			}
			let bytes = {
				let mut bytes = [0u8; 16];
				bytes[..8].copy_from_slice(&address.first.to_be_bytes());
				bytes[8..].copy_from_slice(&address.second.to_be_bytes());
				bytes
			};
			let v6 = Ipv6Addr::from(bytes);
			let ip_address = match v6.to_ipv4_mapped() {
				Some(v4) => v4.to_string(),
				None => v6.to_string(),
			};
			ctx.settings.dispatch(move |store| {
				execute_ban_command(&store.settings.ban_ip_command, &ip_address);
			});
		}
		Payload::SendCaptcha(action) => {
			if !client.is_admin() {
				return Ok(());
			}
			ctx.with_user(action.username, action.channel, |target| {
				target.set_captcha_required(true);
				target.queue_message(&ServerMessage::new(server_message::Payload::CaptchaRequired(true)));
			});
		}
		Payload::KickUser(action) => {
			if !client.is_admin() {
				return Ok(());
			}
			ctx.with_user(action.username, action.channel, |target| target.close());
		}
		Payload::PauseTurnTimer(Empty {}) => {
			if !client.is_admin() {
				return Ok(());
			}
			if let Some(vm) = connected_vm(ctx, client).await {
				vm.pause_turn_timer();
			}
		}
		Payload::ResumeTurnTimer(Empty {}) => {
			if !client.is_admin() {
				return Ok(());
			}
			if let Some(vm) = connected_vm(ctx, client).await {
				vm.resume_turn_timer();
			}
		}
		Payload::EndTurn(Empty {}) => {
			if client.connected_vm() != 0
				&& let Some(vm) = vm_by_id(ctx, client.connected_vm()).await
			{
				// Admins skip whoever holds the turn; users only end their
				// own.
				if client.is_admin() {
					vm.skip_turn();
				} else {
					vm.end_turn(client.conn_id);
				}
			}
		}
		Payload::RecordingPreviewRequest(request) => {
			if !client.is_admin() {
				return Ok(());
			}
			spawn_preview(ctx.db.clone(), Arc::clone(client), request);
		}
	}

	Ok(())
}

enum PowerAction {
	Start,
	Stop,
	Restart,
}

async fn power_vms(ctx: &Arc<ServerContext>, client: &Arc<Client>, ids: Vec<u32>, action: PowerAction) {
	if !client.is_admin() {
		return;
	}
	for vm_id in ids {
		let Some(vm) = vm_by_id(ctx, vm_id).await else {
			continue;
		};
		match action {
			PowerAction::Start => vm.start(),
			PowerAction::Stop => vm.stop(),
			PowerAction::Restart => vm.restart(),
		}
		let owner = ctx.vms.clone();
		ctx.vms.dispatch(move |registry| registry.update_single_vm(vm_id, &owner));
	}
}

/// The VM the client is connected to, gated on captcha completion.
async fn connected_vm(ctx: &Arc<ServerContext>, client: &Arc<Client>) -> Option<Arc<Vm>> {
	let vm_id = client.connected_vm();
	if vm_id == 0 || client.is_captcha_required() {
		return None;
	}
	vm_by_id(ctx, vm_id).await
}

async fn vm_by_id(ctx: &Arc<ServerContext>, vm_id: u32) -> Option<Arc<Vm>> {
	ctx.vms.query(move |registry| registry.get(vm_id)).await.flatten()
}

async fn current_username(client: &Arc<Client>) -> String {
	client.state.query(|state| state.username.clone()).await.unwrap_or_default()
}

// -- channel connect ---------------------------------------------------------

async fn connect_to_channel(ctx: &Arc<ServerContext>, client: &Arc<Client>, channel_id: u32) {
	// First contact assigns a guest name; it sticks until renamed.
	let mut username = current_username(client).await;
	if username.is_empty() {
		let for_generate = Arc::clone(client);
		let Some(generated) = ctx.guests.query(move |guests| guests.generate(&for_generate)).await else {
			return;
		};
		let assigned = generated.clone();
		let done = client
			.state
			.query(move |state| {
				state.username = assigned;
			})
			.await;
		if done.is_none() {
			return;
		}
		username = generated;
	}

	// Viewing the VM list ends when a channel is joined.
	if client.set_viewing_vm_list(false) {
		let conn_id = client.conn_id;
		ctx.vms.dispatch(move |registry| registry.remove_vm_list_viewer(conn_id));
	}

	if channel_id == GLOBAL_CHANNEL_ID {
		if client.set_in_global_chat(true) {
			return;
		}
		leave_current_vm(ctx, client).await;
		client.set_connected_vm(0);

		let for_chat = Arc::clone(client);
		ctx.global_chat.dispatch(move |chat| {
			for_chat.queue_message(&ServerMessage::new(server_message::Payload::ConnectResponse(ConnectResponse {
				result: Some(connect_response::Result::Success(ConnectSuccess {
					channel: GLOBAL_CHANNEL_ID,
					username: username.clone(),
					captcha_required: for_chat.is_captcha_required(),
					chat_history: chat.chat_room().chat_history(),
				})),
			})));
			let data = UserData {
				username,
				user_type: for_chat.user_type(),
				ip_address: for_chat.ip_bytes,
				vote: UserVoteData::default(),
			};
			chat.add_user(data, Arc::clone(&for_chat));
		});
		return;
	}

	let Some(vm) = vm_by_id(ctx, channel_id).await else {
		client.queue_message(&connect_failed());
		return;
	};
	let disallow_guests = vm
		.owner
		.query(|state| state.settings.disallow_guests)
		.await
		.unwrap_or(true);
	if disallow_guests && !client.is_logged_in() {
		client.queue_message(&connect_failed());
		return;
	}

	leave_current_vm(ctx, client).await;
	vm.connect_user(Arc::clone(client), username);
}

async fn leave_current_vm(ctx: &Arc<ServerContext>, client: &Arc<Client>) {
	let previous = client.connected_vm();
	if previous == 0 {
		return;
	}
	client.set_connected_vm(0);
	if let Some(vm) = vm_by_id(ctx, previous).await {
		vm.remove_user(client.conn_id);
	}
}

fn connect_failed() -> ServerMessage {
	ServerMessage::new(server_message::Payload::ConnectResponse(ConnectResponse {
		result: Some(connect_response::Result::Fail(Empty {})),
	}))
}

// -- usernames ---------------------------------------------------------------

async fn change_username(ctx: &Arc<ServerContext>, client: &Arc<Client>, new_username: String, limits: &mut RateLimits) {
	if client.is_captcha_required() {
		return;
	}
	// Registered names are fixed.
	if client.is_logged_in() {
		return;
	}
	if !RateLimits::allow(&mut limits.last_username_change, USERNAME_CHANGE_RATE_LIMIT) {
		return;
	}
	if !validate_username(&new_username) {
		return;
	}
	if ctx.reserved_names.contains(&new_username) {
		client.queue_message(&ServerMessage::new(server_message::Payload::UsernameTaken(Empty {})));
		return;
	}

	let old_username = current_username(client).await;
	if old_username == new_username {
		return;
	}

	let claim = {
		let old = old_username.clone();
		let new = new_username.clone();
		let for_table = Arc::clone(client);
		ctx.guests
			.query(move |guests| guests.rename(&old, &new, for_table))
			.await
	};
	if claim != Some(true) {
		client.queue_message(&ServerMessage::new(server_message::Payload::UsernameTaken(Empty {})));
		return;
	}

	apply_username(ctx, client, new_username, client.user_type()).await;
}

/// Store the new name on the session and announce it through whichever
/// channels the user is in.
async fn apply_username(ctx: &Arc<ServerContext>, client: &Arc<Client>, username: String, user_type: UserType) {
	let stored = username.clone();
	// Queried rather than dispatched so the rename below never races the
	// stored name.
	let _ = client
		.state
		.query(move |state| {
			state.username = stored;
		})
		.await;

	let vm_id = client.connected_vm();
	if vm_id != 0
		&& let Some(vm) = vm_by_id(ctx, vm_id).await
	{
		vm.rename_user(client.conn_id, username.clone(), user_type);
	}
	if client.is_in_global_chat() {
		let conn_id = client.conn_id;
		ctx.global_chat.dispatch(move |chat| {
			chat.rename_user(conn_id, &username, user_type);
		});
	}
}

// -- chat --------------------------------------------------------------------

async fn chat_message(
	ctx: &Arc<ServerContext>,
	client: &Arc<Client>,
	request: vmhub_protocol::messages::ChatMessageRequest,
	limits: &mut RateLimits,
) {
	if client.is_captcha_required() {
		return;
	}
	if request.message.is_empty() || request.message.len() > limits::MAX_CHAT_MESSAGE_LEN {
		return;
	}
	if !RateLimits::allow(&mut limits.last_chat_message, CHAT_RATE_LIMIT) {
		return;
	}
	let username = current_username(client).await;
	if username.is_empty() {
		return;
	}

	let Some(destination) = request.destination.and_then(|d| d.destination) else {
		return;
	};
	match destination {
		chat_destination::Destination::Vm(channel_id) => {
			if channel_id == GLOBAL_CHANNEL_ID {
				if !client.is_in_global_chat() {
					return;
				}
				let user_type = client.user_type();
				let text = request.message;
				ctx.global_chat.dispatch(move |chat| {
					let entry = chat.chat_room_mut().add_user_message(&username, user_type, &text);
					let message = ServerMessage::new(server_message::Payload::ChatMessage(ChannelChatMessage {
						channel: GLOBAL_CHANNEL_ID,
						message: Some(entry),
					}));
					chat.broadcast_message(&message);
				});
				return;
			}
			if client.connected_vm() != channel_id {
				return;
			}
			if let Some(vm) = vm_by_id(ctx, channel_id).await {
				vm.chat(username, client.user_type(), request.message);
			}
		}
		chat_destination::Destination::Direct(chat_id) => {
			let entry = ChatMessageEntry {
				sender: username,
				user_type: client.user_type() as i32,
				message: request.message,
				timestamp: unix_ms_now(),
			};
			client.state.dispatch(move |state| {
				let Some(room) = state.chat_rooms.get(&chat_id) else {
					return;
				};
				room.peer
					.queue_message(&ServerMessage::new(server_message::Payload::ChatMessage(ChannelChatMessage {
						channel: room.peer_id,
						message: Some(entry),
					})));
			});
		}
		chat_destination::Destination::NewDirect(recipient_name) => {
			new_direct_chat(ctx, client, recipient_name, username, request.message);
		}
	}
}

fn chat_response(result: ChatMessageResult) -> ServerMessage {
	ServerMessage::new(server_message::Payload::ChatMessageResponse(result as i32))
}

fn chat_channel_id(channel: u32) -> ServerMessage {
	ServerMessage::new(server_message::Payload::ChatMessage(ChannelChatMessage {
		channel,
		message: None,
	}))
}

/// Two-phase direct-chat setup: symmetric rows on both sessions, each
/// referencing the other's local id. Every hop revalidates, and the
/// sender's pending row is rolled back when the recipient is full.
fn new_direct_chat(
	ctx: &Arc<ServerContext>,
	sender: &Arc<Client>,
	recipient_name: String,
	sender_username: String,
	text: String,
) {
	let sender = Arc::clone(sender);
	ctx.guests.dispatch(move |guests| {
		let Some(recipient) = guests.get(&recipient_name).cloned() else {
			sender.queue_message(&chat_response(ChatMessageResult::UserNotFound));
			return;
		};

		let sender_for_state = Arc::clone(&sender);
		sender.state.dispatch(move |state| {
			let sender = sender_for_state;
			if let Some((&id, _)) = state
				.chat_rooms
				.iter()
				.find(|(_, room)| Arc::ptr_eq(&room.peer, &recipient))
			{
				sender.queue_message(&chat_channel_id(id));
				return;
			}
			if state.chat_rooms.len() >= MAX_DIRECT_CHATS {
				sender.queue_message(&chat_response(ChatMessageResult::UserChatLimit));
				return;
			}

			let sender_id = state.next_chat_id;
			state.next_chat_id += 1;
			state.chat_rooms.insert(
				sender_id,
				DirectChat {
					peer: Arc::clone(&recipient),
					peer_id: 0,
				},
			);

			let recipient_for_state = Arc::clone(&recipient);
			recipient.state.dispatch(move |peer_state| {
				let recipient = recipient_for_state;
				if let Some((_, room)) = peer_state
					.chat_rooms
					.iter_mut()
					.find(|(_, room)| Arc::ptr_eq(&room.peer, &sender))
				{
					if room.peer_id == 0 {
						// The symmetric setup raced us; fill our side in.
						room.peer_id = sender_id;
						return;
					}
					sender.queue_message(&chat_channel_id(sender_id));
					return;
				}

				if peer_state.chat_rooms.len() >= MAX_DIRECT_CHATS {
					let sender_for_rollback = Arc::clone(&sender);
					sender.state.dispatch(move |state| {
						state.chat_rooms.remove(&sender_id);
						sender_for_rollback.queue_message(&chat_response(ChatMessageResult::RecipientChatLimit));
					});
					return;
				}

				let recipient_id = peer_state.next_chat_id;
				peer_state.next_chat_id += 1;
				peer_state.chat_rooms.insert(
					recipient_id,
					DirectChat {
						peer: Arc::clone(&sender),
						peer_id: sender_id,
					},
				);

				let sender_for_finish = Arc::clone(&sender);
				sender.state.dispatch(move |state| {
					let sender = sender_for_finish;
					let Some(room) = state.chat_rooms.get_mut(&sender_id) else {
						return;
					};
					if room.peer_id != 0 {
						// Completed concurrently from the other side.
						return;
					}
					room.peer_id = recipient_id;

					let entry = ChatMessageEntry {
						sender: sender_username,
						user_type: sender.user_type() as i32,
						message: text,
						timestamp: unix_ms_now(),
					};
					recipient.queue_message(&ServerMessage::new(server_message::Payload::NewChatChannel(NewChatChannel {
						channel: recipient_id,
						message: Some(entry.clone()),
					})));
					sender.queue_message(&ServerMessage::new(server_message::Payload::NewChatChannel(NewChatChannel {
						channel: sender_id,
						message: Some(entry),
					})));
				});
			});
		});
	});
}

// -- login, two-factor, registration ----------------------------------------

async fn login(ctx: &Arc<ServerContext>, client: &Arc<Client>, request: vmhub_protocol::messages::LoginRequest) {
	let captcha_ok = ctx.captcha.verify(&request.captcha_token, &client.ip.to_string()).await;
	if !captcha_ok {
		client.queue_message(&login_response(LoginResult::InvalidCaptchaToken, None));
		return;
	}

	let ctx = Arc::clone(ctx);
	let client = Arc::clone(client);
	ctx.login_exec.clone().dispatch_async(move |_| {
		Box::pin(async move {
			let outcome = match ctx.db.login(&request.username, &request.password).await {
				Ok(outcome) => outcome,
				Err(e) => {
					warn!(error = %e, "login query failed");
					client.queue_message(&login_response(LoginResult::InvalidCredentials, None));
					return;
				}
			};

			match outcome {
				LoginOutcome::Success { username, .. } => {
					let session = mint_session(&ctx, &client, &username).await;
					match session {
						Some(session) => client.queue_message(&login_response(LoginResult::Success, Some(session))),
						None => client.queue_message(&login_response(LoginResult::InvalidCredentials, None)),
					}
				}
				LoginOutcome::TwoFactorRequired { username, totp_key } => {
					client.state.dispatch(move |state| {
						state.pending_totp = Some(PendingTotp { username, totp_key });
					});
					client.queue_message(&login_response(LoginResult::TwoFactorRequired, None));
				}
				LoginOutcome::InvalidCredentials => {
					client.queue_message(&login_response(LoginResult::InvalidCredentials, None));
				}
			}
		})
	});
}

async fn two_factor_response(ctx: &Arc<ServerContext>, client: &Arc<Client>, code: String) {
	let pending = client
		.state
		.query(|state| {
			state
				.pending_totp
				.as_ref()
				.map(|p| (p.username.clone(), p.totp_key.clone()))
		})
		.await
		.flatten();
	let Some((username, totp_key)) = pending else {
		return;
	};

	if !auth::verify_totp(&totp_key, &code, unix_ms_now() / 1000) {
		client.queue_message(&login_response(LoginResult::TwoFactorFailed, None));
		return;
	}

	client.state.dispatch(|state| state.pending_totp = None);
	match mint_session(ctx, client, &username).await {
		Some(session) => client.queue_message(&login_response(LoginResult::Success, Some(session))),
		None => client.queue_message(&login_response(LoginResult::InvalidCredentials, None)),
	}
}

async fn register(ctx: &Arc<ServerContext>, client: &Arc<Client>, request: vmhub_protocol::messages::RegisterRequest) {
	// Invite redemption skips the captcha.
	if request.invite_id.is_empty() {
		let captcha_ok = ctx.captcha.verify(&request.captcha_token, &client.ip.to_string()).await;
		if !captcha_ok {
			client.queue_message(&register_response(RegisterResult::InvalidCaptchaToken, None));
			return;
		}
		let allow = ctx
			.settings
			.query(|store| store.settings.allow_account_registration)
			.await
			.unwrap_or(false);
		if !allow {
			client.queue_message(&register_response(RegisterResult::RegistrationDisabled, None));
			return;
		}
	}

	let username = match resolve_registration_username(ctx, &request).await {
		Ok(username) => username,
		Err(result) => {
			client.queue_message(&register_response(result, None));
			return;
		}
	};

	if request.password.is_empty() || request.password.len() > limits::MAX_PASSWORD_LEN {
		client.queue_message(&register_response(RegisterResult::PasswordInvalid, None));
		return;
	}
	if !request.totp_key.is_empty() && request.totp_key.len() != limits::TOTP_KEY_LEN {
		client.queue_message(&register_response(RegisterResult::TotpError, None));
		return;
	}

	let ctx = Arc::clone(ctx);
	let client = Arc::clone(client);
	ctx.login_exec.clone().dispatch_async(move |_| {
		Box::pin(async move {
			let totp_key = (!request.totp_key.is_empty()).then_some(request.totp_key.as_slice());
			let invite_id = (!request.invite_id.is_empty()).then_some(request.invite_id.as_slice());
			let result = ctx
				.db
				.create_account(&username, &request.password, totp_key, invite_id, &client.ip_bytes)
				.await
				.unwrap_or_else(|e| {
					warn!(error = %e, "account creation failed");
					RegisterResult::UsernameTaken
				});

			if result != RegisterResult::Success {
				client.queue_message(&register_response(result, None));
				return;
			}

			let session = mint_session(&ctx, &client, &username).await;
			client.queue_message(&register_response(RegisterResult::Success, session));
		})
	});
}

async fn resolve_registration_username(
	ctx: &Arc<ServerContext>,
	request: &vmhub_protocol::messages::RegisterRequest,
) -> Result<String, RegisterResult> {
	if request.invite_id.is_empty() {
		if !validate_username(&request.username) {
			return Err(RegisterResult::UsernameInvalid);
		}
		return Ok(request.username.clone());
	}

	let invite = ctx
		.db
		.validate_invite(&request.invite_id)
		.await
		.ok()
		.flatten()
		.ok_or(RegisterResult::InviteInvalid)?;

	// A bound invite fixes the name; an unbound one requires the client
	// to pick, never both.
	if invite.username.is_empty() == request.username.is_empty() {
		return Err(RegisterResult::InviteInvalid);
	}
	let username = if invite.username.is_empty() {
		request.username.clone()
	} else {
		invite.username
	};
	if !validate_username(&username) {
		return Err(RegisterResult::UsernameInvalid);
	}
	Ok(username)
}

/// Mint a session in the DB, install it (evicting any prior session of
/// the account), flip the session to logged-in, and take over the
/// account's username in the live tables and channels.
async fn mint_session(ctx: &Arc<ServerContext>, client: &Arc<Client>, username: &str) -> Option<Session> {
	let minted = match ctx.db.create_session(username).await {
		Ok(Some(minted)) => minted,
		Ok(None) => return None,
		Err(e) => {
			warn!(error = %e, "session minting failed");
			return None;
		}
	};

	let session_id = minted.new_session_id.clone();
	{
		let session_id = session_id.clone();
		let client = Arc::clone(client);
		let old_session_id = minted.old_session_id.clone();
		ctx.sessions
			.dispatch(move |sessions| sessions.install(session_id, client, old_session_id));
	}

	client.set_logged_in(minted.is_admin);

	let old_username = current_username(client).await;
	if !old_username.eq_ignore_ascii_case(&minted.username) {
		let old = old_username.clone();
		let new = minted.username.clone();
		let for_table = Arc::clone(client);
		let claimed = ctx
			.guests
			.query(move |guests| guests.rename(&old, &new, for_table))
			.await;
		if claimed != Some(true) {
			// A live guest squats the account name; the DB name still
			// wins for this session, the table entry stays with them
			// until they disconnect.
			debug!(username = minted.username, "account name held by a live guest");
		}
	}

	{
		let session_id = session_id.clone();
		let _ = client
			.state
			.query(move |state| {
				state.session_id = Some(session_id);
			})
			.await;
	}
	apply_username(ctx, client, minted.username.clone(), client.user_type()).await;

	Some(Session {
		session_id,
		username: minted.username,
		is_admin: minted.is_admin,
	})
}

fn login_response(result: LoginResult, session: Option<Session>) -> ServerMessage {
	ServerMessage::new(server_message::Payload::LoginResponse(LoginResponse {
		result: result as i32,
		session,
	}))
}

fn register_response(result: RegisterResult, session: Option<Session>) -> ServerMessage {
	ServerMessage::new(server_message::Payload::RegisterResponse(RegisterResponse {
		result: result as i32,
		session,
	}))
}

// -- vm creation -------------------------------------------------------------

async fn create_vm(ctx: &Arc<ServerContext>, client: &Arc<Client>, initial_settings: Vec<vmhub_protocol::messages::VmSetting>) {
	let settings = match VmSettings::from_list(&initial_settings) {
		Ok(settings) => settings,
		Err(e) => {
			warn!(error = e, "rejected initial vm settings");
			return;
		}
	};

	let vm_id = match ctx.db.next_vm_id().await {
		Ok(id) => id,
		Err(e) => {
			warn!(error = %e, "cannot allocate vm id");
			return;
		}
	};
	// Persist the full normalized list so every kind has a row.
	if let Err(e) = ctx.db.save_vm_settings(vm_id, &settings.to_list()).await {
		warn!(vm_id, error = %e, "cannot persist vm settings");
		return;
	}

	let name = settings.name.clone();
	let vm = Vm::spawn(vm_id, settings, ctx.db.clone(), Arc::clone(&ctx.connector));
	let client = Arc::clone(client);
	ctx.vms.dispatch(move |registry| {
		registry.insert(vm, name);
		client.queue_message(&ServerMessage::new(server_message::Payload::CreateVmResponse(vm_id)));
		registry.send_admin_list(&client);
	});
}

// -- disconnect --------------------------------------------------------------

/// The disconnect purge chain: username table, session table, channels,
/// viewer sets, direct-chat rows. The per-IP count is released by the
/// guard in `handle_connection`.
pub async fn on_disconnect(ctx: &Arc<ServerContext>, client: &Arc<Client>) {
	let identity = client
		.state
		.query(|state| (state.username.clone(), state.session_id.clone()))
		.await;
	let (username, session_id) = identity.unwrap_or_default();

	if !username.is_empty() {
		ctx.guests.dispatch(move |guests| guests.remove(&username));
	}
	if let Some(session_id) = session_id {
		ctx.sessions.dispatch(move |sessions| sessions.remove(&session_id));
	}

	leave_current_vm(ctx, client).await;

	if client.is_in_global_chat() {
		let conn_id = client.conn_id;
		ctx.global_chat.dispatch(move |chat| {
			chat.remove_user(conn_id);
		});
	}
	if client.set_viewing_vm_list(false) {
		let conn_id = client.conn_id;
		ctx.vms.dispatch(move |registry| registry.remove_vm_list_viewer(conn_id));
	}
	if client.set_viewing_server_config(false) {
		let conn_id = client.conn_id;
		ctx.vms.dispatch(move |registry| registry.remove_admin_viewer(conn_id));
	}

	// Drop direct-chat rows so mutually referencing sessions can free.
	client.state.dispatch(|state| state.chat_rooms.clear());
}
