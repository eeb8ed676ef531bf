#![forbid(unsafe_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;
use vmhub_protocol::messages::{
	CaptchaSettings, ChatDestination, ChatMessageRequest, ChatMessageResult, ClientMessage, Empty, GuacClientInstr,
	MouseEvent, ServerMessage, chat_destination, client_message, guac_client_instr, server_message,
};
use vmhub_protocol::{DEFAULT_MAX_FRAME_SIZE, try_decode_frame_from_buffer};

use crate::server::captcha::CaptchaVerifier;
use crate::server::channel::UserChannel;
use crate::server::client::{Client, DirectChat};
use crate::server::connection::{RateLimits, handle_message};
use crate::server::context::{LoginExecutor, ReservedNames, ServerContext};
use crate::server::db::Db;
use crate::server::exec::Owner;
use crate::server::guests::GuestTable;
use crate::server::ip_data::IpRegistry;
use crate::server::registry::VmRegistry;
use crate::server::sessions::SessionMap;
use crate::server::settings::{ServerSettings, SettingsStore};
use crate::server::vm::{DesktopConnector, DesktopEvent, DesktopHandle, NullConnector, Vm, VmSettings};

/// Connector whose input sink is observable from the test.
struct FakeConnector {
	input: mpsc::UnboundedSender<GuacClientInstr>,
}

impl DesktopConnector for FakeConnector {
	fn connect(
		&self,
		_vm_id: u32,
		_host: &str,
		_port: u16,
		events: mpsc::UnboundedSender<DesktopEvent>,
	) -> anyhow::Result<DesktopHandle> {
		Ok(DesktopHandle::with_keepalive(self.input.clone(), events))
	}
}

async fn test_ctx(connector: Arc<dyn DesktopConnector>) -> Arc<ServerContext> {
	test_ctx_with(connector, ServerSettings::default()).await
}

async fn test_ctx_with(connector: Arc<dyn DesktopConnector>, settings: ServerSettings) -> Arc<ServerContext> {
	let db = Db::connect("sqlite::memory:").await.expect("db");
	let settings_store = SettingsStore::new(settings, db.clone());
	Arc::new(ServerContext {
		db,
		settings: Owner::spawn("server-settings", settings_store),
		sessions: Owner::spawn("sessions", SessionMap::default()),
		guests: Owner::spawn("guests", GuestTable::default()),
		ip_registry: Owner::spawn("ip-registry", IpRegistry::default()),
		vms: Owner::spawn("vm-registry", VmRegistry::default()),
		global_chat: Owner::spawn("global-chat", UserChannel::new(vmhub_protocol::GLOBAL_CHANNEL_ID)),
		login_exec: Owner::spawn("login", LoginExecutor),
		captcha: CaptchaVerifier::new(CaptchaSettings::default()),
		reserved_names: ReservedNames::default(),
		connector,
	})
}

fn client(conn_id: u64) -> (Arc<Client>, mpsc::Receiver<Bytes>) {
	Client::new(conn_id, IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn decode(frame: Bytes) -> ServerMessage {
	let mut buf = bytes::BytesMut::from(frame.as_ref());
	try_decode_frame_from_buffer::<ServerMessage>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("decode")
		.expect("complete")
}

async fn recv_message(rx: &mut mpsc::Receiver<Bytes>) -> ServerMessage {
	let frame = timeout(Duration::from_secs(2), rx.recv()).await.expect("recv").expect("frame");
	decode(frame)
}

fn msg(payload: client_message::Payload) -> ClientMessage {
	ClientMessage { payload: Some(payload) }
}

fn change_username(name: &str) -> ClientMessage {
	msg(client_message::Payload::ChangeUsername(name.to_string()))
}

async fn install_vm(ctx: &Arc<ServerContext>, vm_id: u32, turn_time_secs: u64) -> Arc<Vm> {
	let settings = VmSettings {
		name: format!("vm-{vm_id}"),
		turn_time: Duration::from_secs(turn_time_secs),
		..VmSettings::default()
	};
	let vm = Vm::spawn(vm_id, settings, ctx.db.clone(), Arc::clone(&ctx.connector));
	let vm_for_insert = Arc::clone(&vm);
	ctx.vms
		.query(move |registry| registry.insert(vm_for_insert, format!("vm-{vm_id}")))
		.await
		.expect("registry alive");
	vm
}

/// Two clients race for the same name: exactly one wins, the loser is
/// told the name is taken.
#[tokio::test]
async fn concurrent_username_claims_resolve_to_one_winner() {
	let ctx = test_ctx(Arc::new(NullConnector)).await;
	let (first, mut rx_first) = client(1);
	let (second, mut rx_second) = client(2);
	let mut limits_first = RateLimits::new();
	let mut limits_second = RateLimits::new();

	handle_message(&ctx, &first, change_username("Alice"), &mut limits_first)
		.await
		.expect("handled");
	handle_message(&ctx, &second, change_username("Alice"), &mut limits_second)
		.await
		.expect("handled");

	// The winner gets no response; the loser gets username-taken.
	let loser_response = recv_message(&mut rx_second).await;
	assert!(matches!(
		loser_response.payload,
		Some(server_message::Payload::UsernameTaken(Empty {}))
	));
	assert!(rx_first.try_recv().is_err());

	let first_name = first.state.query(|s| s.username.clone()).await.expect("state");
	let second_name = second.state.query(|s| s.username.clone()).await.expect("state");
	assert_eq!(first_name, "Alice");
	assert_eq!(second_name, "");
}

/// Captcha-gated sessions cannot reach a VM; completing the captcha
/// reopens the path all the way to the desktop backend.
#[tokio::test]
async fn captcha_gate_blocks_input_until_completed() {
	let (input_tx, mut input_rx) = mpsc::unbounded_channel();
	let ctx = test_ctx(Arc::new(FakeConnector { input: input_tx })).await;
	let vm = install_vm(&ctx, 7, 20).await;
	vm.start();

	let (user, mut rx) = client(1);
	user.set_captcha_required(true);
	let mut limits = RateLimits::new();

	// Connect attempt and input are silently dropped while gated.
	handle_message(&ctx, &user, msg(client_message::Payload::ConnectToChannel(7)), &mut limits)
		.await
		.expect("handled");
	let mouse = GuacClientInstr {
		instr: Some(guac_client_instr::Instr::Mouse(MouseEvent {
			x: 10,
			y: 20,
			button_mask: 1,
		})),
	};
	handle_message(
		&ctx,
		&user,
		msg(client_message::Payload::GuacInstr(mouse.clone())),
		&mut limits,
	)
	.await
	.expect("handled");
	assert!(rx.try_recv().is_err());
	assert!(input_rx.try_recv().is_err());

	// Captcha provider is disabled in this config, so any token passes.
	handle_message(
		&ctx,
		&user,
		msg(client_message::Payload::CaptchaCompleted("token".to_string())),
		&mut limits,
	)
	.await
	.expect("handled");
	assert!(!user.is_captcha_required());

	handle_message(&ctx, &user, msg(client_message::Payload::ConnectToChannel(7)), &mut limits)
		.await
		.expect("handled");
	let connected = recv_message(&mut rx).await;
	assert!(matches!(
		connected.payload,
		Some(server_message::Payload::ConnectResponse(_))
	));

	handle_message(&ctx, &user, msg(client_message::Payload::TurnRequest(Empty {})), &mut limits)
		.await
		.expect("handled");
	handle_message(&ctx, &user, msg(client_message::Payload::GuacInstr(mouse)), &mut limits)
		.await
		.expect("handled");

	let forwarded = timeout(Duration::from_secs(2), input_rx.recv())
		.await
		.expect("input forwarded")
		.expect("channel open");
	assert!(matches!(forwarded.instr, Some(guac_client_instr::Instr::Mouse(_))));
}

/// A full recipient rolls the pending sender row back.
#[tokio::test]
async fn direct_chat_recipient_limit_rolls_back_the_pending_row() {
	let ctx = test_ctx(Arc::new(NullConnector)).await;
	let (alice, mut rx_alice) = client(1);
	let (bob, _rx_bob) = client(2);
	let mut limits = RateLimits::new();

	handle_message(&ctx, &alice, change_username("alice"), &mut limits)
		.await
		.expect("handled");
	let mut bob_limits = RateLimits::new();
	handle_message(&ctx, &bob, change_username("bob"), &mut bob_limits)
		.await
		.expect("handled");

	// Fill bob's table with ten established chats.
	let fillers: Vec<Arc<Client>> = (0..10).map(|i| client(100 + i).0).collect();
	let fillers_for_state = fillers.clone();
	bob.state
		.query(move |state| {
			for (i, peer) in fillers_for_state.into_iter().enumerate() {
				state.chat_rooms.insert(
					state.next_chat_id,
					DirectChat {
						peer,
						peer_id: i as u32 + 1,
					},
				);
				state.next_chat_id += 1;
			}
		})
		.await
		.expect("state");

	handle_message(
		&ctx,
		&alice,
		msg(client_message::Payload::ChatMessage(ChatMessageRequest {
			destination: Some(ChatDestination {
				destination: Some(chat_destination::Destination::NewDirect("bob".to_string())),
			}),
			message: "hi bob".to_string(),
		})),
		&mut limits,
	)
	.await
	.expect("handled");

	let response = recv_message(&mut rx_alice).await;
	match response.payload {
		Some(server_message::Payload::ChatMessageResponse(result)) => {
			assert_eq!(result, ChatMessageResult::RecipientChatLimit as i32);
		}
		other => panic!("expected chat message response, got {other:?}"),
	}

	let alice_rooms = alice.state.query(|s| s.chat_rooms.len()).await.expect("state");
	assert_eq!(alice_rooms, 0, "pending row must be rolled back");
}

/// The happy path builds symmetric rows with matching cross-ids and
/// delivers the opening message to both sides.
#[tokio::test]
async fn direct_chat_setup_creates_symmetric_rows() {
	let ctx = test_ctx(Arc::new(NullConnector)).await;
	let (alice, mut rx_alice) = client(1);
	let (bob, mut rx_bob) = client(2);
	let mut alice_limits = RateLimits::new();
	let mut bob_limits = RateLimits::new();

	handle_message(&ctx, &alice, change_username("alice"), &mut alice_limits)
		.await
		.expect("handled");
	handle_message(&ctx, &bob, change_username("bob"), &mut bob_limits)
		.await
		.expect("handled");

	handle_message(
		&ctx,
		&alice,
		msg(client_message::Payload::ChatMessage(ChatMessageRequest {
			destination: Some(ChatDestination {
				destination: Some(chat_destination::Destination::NewDirect("bob".to_string())),
			}),
			message: "hello".to_string(),
		})),
		&mut alice_limits,
	)
	.await
	.expect("handled");

	let to_alice = recv_message(&mut rx_alice).await;
	let alice_channel = match to_alice.payload {
		Some(server_message::Payload::NewChatChannel(new_chat)) => {
			assert_eq!(new_chat.message.expect("message").message, "hello");
			new_chat.channel
		}
		other => panic!("expected new chat channel, got {other:?}"),
	};
	let to_bob = recv_message(&mut rx_bob).await;
	let bob_channel = match to_bob.payload {
		Some(server_message::Payload::NewChatChannel(new_chat)) => new_chat.channel,
		other => panic!("expected new chat channel, got {other:?}"),
	};

	// Symmetric rows referencing each other's ids.
	let (alice_peer_id,) = alice
		.state
		.query(move |s| (s.chat_rooms.get(&alice_channel).expect("row").peer_id,))
		.await
		.expect("state");
	let (bob_peer_id,) = bob
		.state
		.query(move |s| (s.chat_rooms.get(&bob_channel).expect("row").peer_id,))
		.await
		.expect("state");
	assert_eq!(alice_peer_id, bob_channel);
	assert_eq!(bob_peer_id, alice_channel);

	// Follow-up direct messages route by the recipient's local id.
	handle_message(
		&ctx,
		&bob,
		msg(client_message::Payload::ChatMessage(ChatMessageRequest {
			destination: Some(ChatDestination {
				destination: Some(chat_destination::Destination::Direct(bob_channel)),
			}),
			message: "hey alice".to_string(),
		})),
		&mut bob_limits,
	)
	.await
	.expect("handled");

	let reply = recv_message(&mut rx_alice).await;
	match reply.payload {
		Some(server_message::Payload::ChatMessage(chat)) => {
			assert_eq!(chat.channel, alice_channel);
			assert_eq!(chat.message.expect("message").message, "hey alice");
		}
		other => panic!("expected chat message, got {other:?}"),
	}
}

/// Admin-only operations are silently dropped for everyone else.
#[tokio::test]
async fn admin_operations_require_the_admin_capability() {
	let ctx = test_ctx(Arc::new(NullConnector)).await;
	let (user, mut rx) = client(1);
	let mut limits = RateLimits::new();

	for payload in [
		client_message::Payload::ServerConfigRequest(Empty {}),
		client_message::Payload::ReadVms(Empty {}),
		client_message::Payload::ReadInvites(Empty {}),
		client_message::Payload::ReadReservedUsernames(Empty {}),
	] {
		handle_message(&ctx, &user, msg(payload), &mut limits).await.expect("handled");
	}

	assert!(rx.try_recv().is_err());
}

/// Registered users cannot change usernames; guests are rate limited.
#[tokio::test]
async fn username_changes_are_gated_and_rate_limited() {
	let ctx = test_ctx(Arc::new(NullConnector)).await;
	let (user, mut rx) = client(1);
	let mut limits = RateLimits::new();

	handle_message(&ctx, &user, change_username("speedy"), &mut limits)
		.await
		.expect("handled");
	// Immediate second change falls under the rate limit.
	handle_message(&ctx, &user, change_username("speedy2"), &mut limits)
		.await
		.expect("handled");

	let name = user.state.query(|s| s.username.clone()).await.expect("state");
	assert_eq!(name, "speedy");
	assert!(rx.try_recv().is_err());

	// Logged-in users keep their registered name.
	user.set_logged_in(false);
	let mut fresh_limits = RateLimits::new();
	handle_message(&ctx, &user, change_username("renamed"), &mut fresh_limits)
		.await
		.expect("handled");
	let name = user.state.query(|s| s.username.clone()).await.expect("state");
	assert_eq!(name, "speedy");
}

/// Open registration mints a session; a second login from another
/// connection invalidates the first.
#[tokio::test]
async fn registration_login_and_session_eviction() {
	use vmhub_protocol::messages::{LoginRequest, LoginResult, RegisterRequest, RegisterResult};

	let ctx = test_ctx_with(
		Arc::new(NullConnector),
		ServerSettings {
			allow_account_registration: true,
			..ServerSettings::default()
		},
	)
	.await;

	let (first, mut rx_first) = client(1);
	let mut limits = RateLimits::new();
	handle_message(
		&ctx,
		&first,
		msg(client_message::Payload::Register(RegisterRequest {
			username: "carol".to_string(),
			password: "pw-pw-pw".to_string(),
			totp_key: Vec::new(),
			invite_id: Vec::new(),
			captcha_token: String::new(),
		})),
		&mut limits,
	)
	.await
	.expect("handled");

	let response = recv_message(&mut rx_first).await;
	let session = match response.payload {
		Some(server_message::Payload::RegisterResponse(response)) => {
			assert_eq!(response.result, RegisterResult::Success as i32);
			response.session.expect("session")
		}
		other => panic!("expected register response, got {other:?}"),
	};
	assert_eq!(session.username, "carol");
	assert!(first.is_logged_in());

	// Same account logs in from a second connection; the first session
	// is invalidated.
	let (second, mut rx_second) = client(2);
	let mut second_limits = RateLimits::new();
	handle_message(
		&ctx,
		&second,
		msg(client_message::Payload::Login(LoginRequest {
			username: "Carol".to_string(),
			password: "pw-pw-pw".to_string(),
			captcha_token: String::new(),
		})),
		&mut second_limits,
	)
	.await
	.expect("handled");

	let response = recv_message(&mut rx_second).await;
	match response.payload {
		Some(server_message::Payload::LoginResponse(response)) => {
			assert_eq!(response.result, LoginResult::Success as i32);
			assert_eq!(response.session.expect("session").username, "carol");
		}
		other => panic!("expected login response, got {other:?}"),
	}

	timeout(Duration::from_secs(2), first.closer.wait())
		.await
		.expect("first session invalidated");

	// Wrong credentials fail without a session.
	let (third, mut rx_third) = client(3);
	let mut third_limits = RateLimits::new();
	handle_message(
		&ctx,
		&third,
		msg(client_message::Payload::Login(LoginRequest {
			username: "carol".to_string(),
			password: "wrong".to_string(),
			captcha_token: String::new(),
		})),
		&mut third_limits,
	)
	.await
	.expect("handled");
	let response = recv_message(&mut rx_third).await;
	match response.payload {
		Some(server_message::Payload::LoginResponse(response)) => {
			assert_eq!(response.result, LoginResult::InvalidCredentials as i32);
			assert!(response.session.is_none());
		}
		other => panic!("expected login response, got {other:?}"),
	}
}

/// Reserved names read as taken for guest renames.
#[tokio::test]
async fn reserved_usernames_are_taken_for_guests() {
	let ctx = test_ctx(Arc::new(NullConnector)).await;
	ctx.reserved_names.insert("Moderator");

	let (user, mut rx) = client(1);
	let mut limits = RateLimits::new();
	handle_message(&ctx, &user, change_username("moderator"), &mut limits)
		.await
		.expect("handled");

	let response = recv_message(&mut rx).await;
	assert!(matches!(
		response.payload,
		Some(server_message::Payload::UsernameTaken(Empty {}))
	));
}
