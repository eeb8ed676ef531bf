use bytes::BytesMut;
use vmhub_protocol::messages::{
	ChatDestination, ChatMessageRequest, ClientMessage, GuacServerInstr, LoginRequest, RecordingPreviewRequest,
	ServerMessage, TurnInfo, chat_destination, client_message, guac_server_instr, server_message,
};
use vmhub_protocol::{DEFAULT_MAX_FRAME_SIZE, encode_frame_default, encode_shared_frame, try_decode_frame_from_buffer};

fn roundtrip_client(msg: ClientMessage) -> ClientMessage {
	let frame = encode_frame_default(&msg).expect("encode");
	let mut buf = BytesMut::from(frame.as_slice());
	try_decode_frame_from_buffer::<ClientMessage>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("decode")
		.expect("complete frame")
}

fn roundtrip_server(msg: ServerMessage) -> ServerMessage {
	let frame = encode_shared_frame(&msg).expect("encode");
	let mut buf = BytesMut::from(frame.as_ref());
	try_decode_frame_from_buffer::<ServerMessage>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("decode")
		.expect("complete frame")
}

#[test]
fn client_login_roundtrip() {
	let msg = ClientMessage {
		payload: Some(client_message::Payload::Login(LoginRequest {
			username: "alice".to_string(),
			password: "hunter2hunter2".to_string(),
			captcha_token: "tok".to_string(),
		})),
	};

	assert_eq!(roundtrip_client(msg.clone()), msg);
}

#[test]
fn client_chat_destination_variants_roundtrip() {
	for destination in [
		chat_destination::Destination::Vm(0),
		chat_destination::Destination::Direct(3),
		chat_destination::Destination::NewDirect("bob".to_string()),
	] {
		let msg = ClientMessage {
			payload: Some(client_message::Payload::ChatMessage(ChatMessageRequest {
				destination: Some(ChatDestination {
					destination: Some(destination),
				}),
				message: "hi".to_string(),
			})),
		};
		assert_eq!(roundtrip_client(msg.clone()), msg);
	}
}

#[test]
fn client_recording_preview_roundtrip() {
	let msg = ClientMessage {
		payload: Some(client_message::Payload::RecordingPreviewRequest(RecordingPreviewRequest {
			vm_id: 3,
			start_time: 1000,
			stop_time: 2000,
			width: 64,
			height: 48,
			time_interval: 250,
		})),
	};

	assert_eq!(roundtrip_client(msg.clone()), msg);
}

#[test]
fn server_turn_info_roundtrip() {
	let msg = ServerMessage::new(server_message::Payload::TurnInfo(TurnInfo {
		channel: 7,
		paused: false,
		time_remaining_ms: 12_000,
		users: vec!["c1".to_string(), "c2".to_string(), "c3".to_string()],
	}));

	assert_eq!(roundtrip_server(msg.clone()), msg);
}

#[test]
fn server_guac_sync_roundtrip() {
	let msg = ServerMessage::new(server_message::Payload::GuacInstr(GuacServerInstr {
		instr: Some(guac_server_instr::Instr::Sync(123_456)),
	}));

	assert_eq!(roundtrip_server(msg.clone()), msg);
}

#[test]
fn unknown_payload_decodes_to_none() {
	// A frame whose payload uses an unassigned tag should decode to a
	// message with no recognized payload rather than an error.
	let mut payload = Vec::new();
	prost::encoding::encode_varint((200u64 << 3) | 2, &mut payload);
	prost::encoding::encode_varint(0u64, &mut payload);

	let mut frame = Vec::with_capacity(4 + payload.len());
	frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
	frame.extend_from_slice(&payload);

	let mut buf = BytesMut::from(frame.as_slice());
	let decoded = try_decode_frame_from_buffer::<ClientMessage>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("decode")
		.expect("complete frame");
	assert!(decoded.payload.is_none());
}
