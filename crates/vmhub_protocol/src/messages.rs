#![forbid(unsafe_code)]

//! Wire schema for the client/server protocol and the recording file
//! format. Messages are declared directly as prost derives; the schema is
//! versioned by this crate, not by an external IDL.

/// Empty payload for tags that carry no data.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum UserType {
	Guest = 0,
	Regular = 1,
	Admin = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum VmStatus {
	Stopped = 0,
	Starting = 1,
	Running = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LoginResult {
	Success = 0,
	InvalidCaptchaToken = 1,
	InvalidCredentials = 2,
	TwoFactorRequired = 3,
	TwoFactorFailed = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RegisterResult {
	Success = 0,
	UsernameInvalid = 1,
	UsernameTaken = 2,
	PasswordInvalid = 3,
	TotpError = 4,
	InviteInvalid = 5,
	InvalidCaptchaToken = 6,
	RegistrationDisabled = 7,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ChatMessageResult {
	Sent = 0,
	UserNotFound = 1,
	UserChatLimit = 2,
	RecipientChatLimit = 3,
}

// ---------------------------------------------------------------------------
// Shared sub-messages
// ---------------------------------------------------------------------------

/// IPv6 address as two big-endian 64-bit halves; IPv4 is carried mapped.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IpAddress {
	#[prost(fixed64, tag = "1")]
	pub first: u64,
	#[prost(fixed64, tag = "2")]
	pub second: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatMessageEntry {
	#[prost(string, tag = "1")]
	pub sender: String,
	#[prost(enumeration = "UserType", tag = "2")]
	pub user_type: i32,
	#[prost(string, tag = "3")]
	pub message: String,
	#[prost(uint64, tag = "4")]
	pub timestamp: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserEntry {
	#[prost(string, tag = "1")]
	pub username: String,
	#[prost(enumeration = "UserType", tag = "2")]
	pub user_type: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdminUserEntry {
	#[prost(string, tag = "1")]
	pub username: String,
	#[prost(enumeration = "UserType", tag = "2")]
	pub user_type: i32,
	#[prost(message, optional, tag = "3")]
	pub ip_address: Option<IpAddress>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VmInfo {
	#[prost(uint32, tag = "1")]
	pub id: u32,
	#[prost(string, tag = "2")]
	pub name: String,
	#[prost(string, tag = "3")]
	pub description: String,
	#[prost(uint32, tag = "4")]
	pub online_users: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdminVmInfo {
	#[prost(uint32, tag = "1")]
	pub id: u32,
	#[prost(string, tag = "2")]
	pub name: String,
	#[prost(enumeration = "VmStatus", tag = "3")]
	pub status: i32,
	#[prost(uint32, tag = "4")]
	pub online_users: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VmThumbnail {
	#[prost(uint32, tag = "1")]
	pub id: u32,
	#[prost(bytes = "vec", tag = "2")]
	pub png_bytes: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Session {
	#[prost(bytes = "vec", tag = "1")]
	pub session_id: Vec<u8>,
	#[prost(string, tag = "2")]
	pub username: String,
	#[prost(bool, tag = "3")]
	pub is_admin: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Invite {
	#[prost(bytes = "vec", tag = "1")]
	pub id: Vec<u8>,
	#[prost(string, tag = "2")]
	pub name: String,
	/// Username the invite binds; empty means the registrant picks one.
	#[prost(string, tag = "3")]
	pub username: String,
	#[prost(bool, tag = "4")]
	pub admin: bool,
}

// ---------------------------------------------------------------------------
// Server settings
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CaptchaSettings {
	#[prost(bool, tag = "1")]
	pub enabled: bool,
	#[prost(string, tag = "2")]
	pub verify_url: String,
	#[prost(string, tag = "3")]
	pub secret_key: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerSetting {
	#[prost(oneof = "server_setting::Setting", tags = "1, 2, 3, 4, 5, 6")]
	pub setting: Option<server_setting::Setting>,
}

pub mod server_setting {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Setting {
		#[prost(bool, tag = "1")]
		AllowAccountRegistration(bool),
		#[prost(message, tag = "2")]
		Captcha(super::CaptchaSettings),
		#[prost(bool, tag = "3")]
		CaptchaRequired(bool),
		#[prost(bool, tag = "4")]
		MaxConnectionsEnabled(bool),
		#[prost(uint32, tag = "5")]
		MaxConnections(u32),
		#[prost(string, tag = "6")]
		BanIpCommand(String),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerSettingsList {
	#[prost(message, repeated, tag = "1")]
	pub settings: Vec<ServerSetting>,
}

// ---------------------------------------------------------------------------
// VM settings
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RecordingSettings {
	#[prost(uint32, tag = "1")]
	pub file_duration_minutes: u32,
	#[prost(uint32, tag = "2")]
	pub keyframe_interval_seconds: u32,
	#[prost(bool, tag = "3")]
	pub capture_display: bool,
	#[prost(bool, tag = "4")]
	pub capture_input: bool,
	#[prost(bool, tag = "5")]
	pub capture_audio: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VmSetting {
	#[prost(oneof = "vm_setting::Setting", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9")]
	pub setting: Option<vm_setting::Setting>,
}

pub mod vm_setting {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Setting {
		#[prost(string, tag = "1")]
		Name(String),
		#[prost(string, tag = "2")]
		Description(String),
		#[prost(string, tag = "3")]
		Host(String),
		#[prost(uint32, tag = "4")]
		Port(u32),
		/// Turn duration in seconds; must be positive.
		#[prost(uint32, tag = "5")]
		TurnTime(u32),
		/// Reset-vote duration in seconds; zero disables voting.
		#[prost(uint32, tag = "6")]
		VoteTime(u32),
		#[prost(bool, tag = "7")]
		AutoStart(bool),
		#[prost(bool, tag = "8")]
		DisallowGuests(bool),
		#[prost(message, tag = "9")]
		Recordings(super::RecordingSettings),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VmSettingsList {
	#[prost(message, repeated, tag = "1")]
	pub settings: Vec<VmSetting>,
}

// ---------------------------------------------------------------------------
// Remote-desktop instructions
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MouseEvent {
	#[prost(int32, tag = "1")]
	pub x: i32,
	#[prost(int32, tag = "2")]
	pub y: i32,
	#[prost(uint32, tag = "3")]
	pub button_mask: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyEvent {
	#[prost(uint32, tag = "1")]
	pub keysym: u32,
	#[prost(bool, tag = "2")]
	pub pressed: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisplaySize {
	#[prost(int32, tag = "1")]
	pub layer: i32,
	#[prost(uint32, tag = "2")]
	pub width: u32,
	#[prost(uint32, tag = "3")]
	pub height: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisplayPng {
	#[prost(int32, tag = "1")]
	pub layer: i32,
	#[prost(uint32, tag = "2")]
	pub x: u32,
	#[prost(uint32, tag = "3")]
	pub y: u32,
	#[prost(bytes = "vec", tag = "4")]
	pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AudioPacket {
	#[prost(string, tag = "1")]
	pub mimetype: String,
	#[prost(bytes = "vec", tag = "2")]
	pub data: Vec<u8>,
}

/// One instruction from a client holding the input turn.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GuacClientInstr {
	#[prost(oneof = "guac_client_instr::Instr", tags = "1, 2, 3, 4")]
	pub instr: Option<guac_client_instr::Instr>,
}

pub mod guac_client_instr {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Instr {
		#[prost(uint64, tag = "1")]
		Sync(u64),
		#[prost(message, tag = "2")]
		Mouse(super::MouseEvent),
		#[prost(message, tag = "3")]
		Key(super::KeyEvent),
		#[prost(string, tag = "4")]
		Clipboard(String),
	}
}

/// One instruction of the display/audio stream fanned out to viewers.
///
/// `Sync` carries the authoritative recording clock in milliseconds.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GuacServerInstr {
	#[prost(oneof = "guac_server_instr::Instr", tags = "1, 2, 3, 4, 5, 6")]
	pub instr: Option<guac_server_instr::Instr>,
}

pub mod guac_server_instr {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Instr {
		#[prost(uint64, tag = "1")]
		Sync(u64),
		#[prost(message, tag = "2")]
		Size(super::DisplaySize),
		#[prost(message, tag = "3")]
		Png(super::DisplayPng),
		#[prost(message, tag = "4")]
		Audio(super::AudioPacket),
		#[prost(message, tag = "5")]
		Mouse(super::MouseEvent),
		#[prost(message, tag = "6")]
		Key(super::KeyEvent),
	}
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChangePasswordRequest {
	#[prost(string, tag = "1")]
	pub old_password: String,
	#[prost(string, tag = "2")]
	pub new_password: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatDestination {
	#[prost(oneof = "chat_destination::Destination", tags = "1, 2, 3")]
	pub destination: Option<chat_destination::Destination>,
}

pub mod chat_destination {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Destination {
		/// VM channel id, or 0 for the global lobby.
		#[prost(uint32, tag = "1")]
		Vm(u32),
		/// Existing direct chat, sender-side id.
		#[prost(uint32, tag = "2")]
		Direct(u32),
		/// Open a new direct chat with this username.
		#[prost(string, tag = "3")]
		NewDirect(String),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatMessageRequest {
	#[prost(message, optional, tag = "1")]
	pub destination: Option<ChatDestination>,
	#[prost(string, tag = "2")]
	pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginRequest {
	#[prost(string, tag = "1")]
	pub username: String,
	#[prost(string, tag = "2")]
	pub password: String,
	#[prost(string, tag = "3")]
	pub captcha_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterRequest {
	#[prost(string, tag = "1")]
	pub username: String,
	#[prost(string, tag = "2")]
	pub password: String,
	/// Raw TOTP secret; empty means two-factor is not enabled.
	#[prost(bytes = "vec", tag = "3")]
	pub totp_key: Vec<u8>,
	/// Invite id; empty means open registration.
	#[prost(bytes = "vec", tag = "4")]
	pub invite_id: Vec<u8>,
	#[prost(string, tag = "5")]
	pub captcha_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateVmConfig {
	#[prost(uint32, tag = "1")]
	pub vm_id: u32,
	#[prost(message, repeated, tag = "2")]
	pub settings: Vec<VmSetting>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VmIdList {
	#[prost(uint32, repeated, tag = "1")]
	pub ids: Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserAdminAction {
	#[prost(string, tag = "1")]
	pub username: String,
	#[prost(uint32, tag = "2")]
	pub channel: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RecordingPreviewRequest {
	#[prost(uint32, tag = "1")]
	pub vm_id: u32,
	#[prost(uint64, tag = "2")]
	pub start_time: u64,
	#[prost(uint64, tag = "3")]
	pub stop_time: u64,
	#[prost(uint32, tag = "4")]
	pub width: u32,
	#[prost(uint32, tag = "5")]
	pub height: u32,
	/// Sample spacing in milliseconds; zero means one preview per keyframe.
	#[prost(uint64, tag = "6")]
	pub time_interval: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientMessage {
	#[prost(
		oneof = "client_message::Payload",
		tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38"
	)]
	pub payload: Option<client_message::Payload>,
}

pub mod client_message {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Payload {
		#[prost(uint32, tag = "1")]
		ConnectToChannel(u32),
		#[prost(string, tag = "2")]
		CaptchaCompleted(String),
		#[prost(message, tag = "3")]
		TurnRequest(super::Empty),
		#[prost(bool, tag = "4")]
		Vote(bool),
		#[prost(message, tag = "5")]
		GuacInstr(super::GuacClientInstr),
		#[prost(string, tag = "6")]
		ChangeUsername(String),
		#[prost(message, tag = "7")]
		ChangePassword(super::ChangePasswordRequest),
		#[prost(message, tag = "8")]
		ChatMessage(super::ChatMessageRequest),
		#[prost(message, tag = "9")]
		VmListRequest(super::Empty),
		#[prost(message, tag = "10")]
		Login(super::LoginRequest),
		#[prost(string, tag = "11")]
		TwoFactorResponse(String),
		#[prost(message, tag = "12")]
		Register(super::RegisterRequest),
		#[prost(message, tag = "13")]
		ServerConfigRequest(super::Empty),
		#[prost(message, tag = "14")]
		ServerConfigModifications(super::ServerSettingsList),
		#[prost(message, tag = "15")]
		ServerConfigHidden(super::Empty),
		#[prost(message, tag = "16")]
		CreateVm(super::VmSettingsList),
		#[prost(message, tag = "17")]
		ReadVms(super::Empty),
		#[prost(uint32, tag = "18")]
		ReadVmConfig(u32),
		#[prost(message, tag = "19")]
		UpdateVmConfig(super::UpdateVmConfig),
		#[prost(uint32, tag = "20")]
		DeleteVm(u32),
		#[prost(message, tag = "21")]
		StartVms(super::VmIdList),
		#[prost(message, tag = "22")]
		StopVms(super::VmIdList),
		#[prost(message, tag = "23")]
		RestartVms(super::VmIdList),
		#[prost(message, tag = "24")]
		CreateInvite(super::Invite),
		#[prost(message, tag = "25")]
		ReadInvites(super::Empty),
		#[prost(message, tag = "26")]
		UpdateInvite(super::Invite),
		#[prost(bytes, tag = "27")]
		DeleteInvite(Vec<u8>),
		#[prost(bytes, tag = "28")]
		ValidateInvite(Vec<u8>),
		#[prost(string, tag = "29")]
		CreateReservedUsername(String),
		#[prost(message, tag = "30")]
		ReadReservedUsernames(super::Empty),
		#[prost(string, tag = "31")]
		DeleteReservedUsername(String),
		#[prost(message, tag = "32")]
		BanIp(super::IpAddress),
		#[prost(message, tag = "33")]
		SendCaptcha(super::UserAdminAction),
		#[prost(message, tag = "34")]
		KickUser(super::UserAdminAction),
		#[prost(message, tag = "35")]
		PauseTurnTimer(super::Empty),
		#[prost(message, tag = "36")]
		ResumeTurnTimer(super::Empty),
		#[prost(message, tag = "37")]
		EndTurn(super::Empty),
		#[prost(message, tag = "38")]
		RecordingPreviewRequest(super::RecordingPreviewRequest),
	}
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectSuccess {
	#[prost(uint32, tag = "1")]
	pub channel: u32,
	#[prost(string, tag = "2")]
	pub username: String,
	#[prost(bool, tag = "3")]
	pub captcha_required: bool,
	#[prost(message, repeated, tag = "4")]
	pub chat_history: Vec<ChatMessageEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectResponse {
	#[prost(oneof = "connect_response::Result", tags = "1, 2")]
	pub result: Option<connect_response::Result>,
}

pub mod connect_response {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Result {
		#[prost(message, tag = "1")]
		Success(super::ConnectSuccess),
		#[prost(message, tag = "2")]
		Fail(super::Empty),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelChatMessage {
	#[prost(uint32, tag = "1")]
	pub channel: u32,
	#[prost(message, optional, tag = "2")]
	pub message: Option<ChatMessageEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NewChatChannel {
	#[prost(uint32, tag = "1")]
	pub channel: u32,
	#[prost(message, optional, tag = "2")]
	pub message: Option<ChatMessageEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UsernameChange {
	#[prost(uint32, tag = "1")]
	pub channel: u32,
	#[prost(string, tag = "2")]
	pub old_username: String,
	#[prost(string, tag = "3")]
	pub new_username: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserList {
	#[prost(uint32, tag = "1")]
	pub channel: u32,
	#[prost(message, repeated, tag = "2")]
	pub users: Vec<UserEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdminUserList {
	#[prost(uint32, tag = "1")]
	pub channel: u32,
	#[prost(message, repeated, tag = "2")]
	pub users: Vec<AdminUserEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserListAdd {
	#[prost(uint32, tag = "1")]
	pub channel: u32,
	#[prost(message, optional, tag = "2")]
	pub user: Option<UserEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdminUserListAdd {
	#[prost(uint32, tag = "1")]
	pub channel: u32,
	#[prost(message, optional, tag = "2")]
	pub user: Option<AdminUserEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserListRemove {
	#[prost(uint32, tag = "1")]
	pub channel: u32,
	#[prost(string, tag = "2")]
	pub username: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VmList {
	#[prost(message, repeated, tag = "1")]
	pub vms: Vec<VmInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdminVmList {
	#[prost(message, repeated, tag = "1")]
	pub vms: Vec<AdminVmInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginResponse {
	#[prost(enumeration = "LoginResult", tag = "1")]
	pub result: i32,
	#[prost(message, optional, tag = "2")]
	pub session: Option<Session>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterResponse {
	#[prost(enumeration = "RegisterResult", tag = "1")]
	pub result: i32,
	#[prost(message, optional, tag = "2")]
	pub session: Option<Session>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InviteList {
	#[prost(message, repeated, tag = "1")]
	pub invites: Vec<Invite>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InviteResult {
	#[prost(bool, tag = "1")]
	pub success: bool,
	#[prost(bytes = "vec", tag = "2")]
	pub id: Vec<u8>,
	/// Username the invite binds, echoed for `validate-invite`.
	#[prost(string, tag = "3")]
	pub username: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReservedUsernameList {
	#[prost(string, repeated, tag = "1")]
	pub usernames: Vec<String>,
}

/// Turn queue broadcast. The first entry of `users` is the holder.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TurnInfo {
	#[prost(uint32, tag = "1")]
	pub channel: u32,
	#[prost(bool, tag = "2")]
	pub paused: bool,
	#[prost(uint64, tag = "3")]
	pub time_remaining_ms: u64,
	#[prost(string, repeated, tag = "4")]
	pub users: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VoteStatus {
	#[prost(uint32, tag = "1")]
	pub channel: u32,
	#[prost(bool, tag = "2")]
	pub active: bool,
	#[prost(uint32, tag = "3")]
	pub votes_yes: u32,
	#[prost(uint32, tag = "4")]
	pub votes_no: u32,
	#[prost(uint64, tag = "5")]
	pub time_remaining_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RecordingPlaybackPreview {
	#[prost(uint64, tag = "1")]
	pub timestamp: u64,
	#[prost(message, optional, tag = "2")]
	pub thumbnail: Option<VmThumbnail>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerMessage {
	#[prost(
		oneof = "server_message::Payload",
		tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29"
	)]
	pub payload: Option<server_message::Payload>,
}

pub mod server_message {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Payload {
		#[prost(message, tag = "1")]
		ConnectResponse(super::ConnectResponse),
		#[prost(message, tag = "2")]
		ChatMessage(super::ChannelChatMessage),
		#[prost(enumeration = "super::ChatMessageResult", tag = "3")]
		ChatMessageResponse(i32),
		#[prost(message, tag = "4")]
		NewChatChannel(super::NewChatChannel),
		#[prost(message, tag = "5")]
		ChangeUsername(super::UsernameChange),
		#[prost(message, tag = "6")]
		UserList(super::UserList),
		#[prost(message, tag = "7")]
		AdminUserList(super::AdminUserList),
		#[prost(message, tag = "8")]
		UserListAdd(super::UserListAdd),
		#[prost(message, tag = "9")]
		AdminUserListAdd(super::AdminUserListAdd),
		#[prost(message, tag = "10")]
		UserListRemove(super::UserListRemove),
		#[prost(message, tag = "11")]
		UsernameTaken(super::Empty),
		#[prost(bool, tag = "12")]
		CaptchaRequired(bool),
		#[prost(message, tag = "13")]
		VmListResponse(super::VmList),
		#[prost(message, tag = "14")]
		AdminVmListResponse(super::AdminVmList),
		#[prost(message, tag = "15")]
		VmThumbnail(super::VmThumbnail),
		#[prost(message, tag = "16")]
		LoginResponse(super::LoginResponse),
		#[prost(message, tag = "17")]
		RegisterResponse(super::RegisterResponse),
		#[prost(bool, tag = "18")]
		ChangePasswordResponse(bool),
		#[prost(message, tag = "19")]
		ServerSettings(super::ServerSettingsList),
		#[prost(uint32, tag = "20")]
		CreateVmResponse(u32),
		#[prost(message, tag = "21")]
		VmConfig(super::VmSettingsList),
		#[prost(message, tag = "22")]
		InviteList(super::InviteList),
		#[prost(message, tag = "23")]
		InviteResult(super::InviteResult),
		#[prost(message, tag = "24")]
		ReservedUsernames(super::ReservedUsernameList),
		#[prost(message, tag = "25")]
		TurnInfo(super::TurnInfo),
		#[prost(message, tag = "26")]
		VoteStatus(super::VoteStatus),
		#[prost(message, tag = "27")]
		GuacInstr(super::GuacServerInstr),
		#[prost(message, tag = "28")]
		RecordingPlaybackPreview(super::RecordingPlaybackPreview),
		#[prost(bool, tag = "29")]
		RecordingPlaybackResult(bool),
	}
}

impl ServerMessage {
	pub fn new(payload: server_message::Payload) -> Self {
		Self { payload: Some(payload) }
	}
}

// ---------------------------------------------------------------------------
// Recording file format
// ---------------------------------------------------------------------------

/// Keyframe index entry of a recording file header.
///
/// Both fields use `optional fixed64` and are always `Some`, so a slot
/// encodes to the same number of bytes whether it still holds the
/// preallocated zeros or a real offset/timestamp. That size invariance is
/// what allows the header to be rewritten in place at the start of the
/// file while the message stream behind it grows.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Keyframe {
	#[prost(fixed64, optional, tag = "1")]
	pub file_offset: Option<u64>,
	#[prost(fixed64, optional, tag = "2")]
	pub timestamp: Option<u64>,
}

/// Recording file header. The fields mutated after creation
/// (`stop_time`, `keyframes_count`, keyframe slots) use `optional`
/// fixed-width encodings for the same in-place rewrite reason as
/// [`Keyframe`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RecordingFileHeader {
	#[prost(fixed32, tag = "1")]
	pub vm_id: u32,
	#[prost(fixed64, tag = "2")]
	pub start_time: u64,
	#[prost(fixed64, optional, tag = "3")]
	pub stop_time: Option<u64>,
	#[prost(message, repeated, tag = "4")]
	pub keyframes: Vec<Keyframe>,
	#[prost(fixed32, optional, tag = "5")]
	pub keyframes_count: Option<u32>,
}

impl RecordingFileHeader {
	/// Create a header with `slots` zeroed keyframe entries.
	pub fn with_preallocated_keyframes(vm_id: u32, start_time: u64, slots: usize) -> Self {
		Self {
			vm_id,
			start_time,
			stop_time: Some(0),
			keyframes: vec![
				Keyframe {
					file_offset: Some(0),
					timestamp: Some(0),
				};
				slots
			],
			keyframes_count: Some(0),
		}
	}

	pub fn stop_time_ms(&self) -> u64 {
		self.stop_time.unwrap_or(0)
	}

	pub fn keyframe_count(&self) -> usize {
		self.keyframes_count.unwrap_or(0) as usize
	}

	/// Iterate the written keyframes as `(file_offset, timestamp)` pairs.
	pub fn written_keyframes(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
		self.keyframes
			.iter()
			.take(self.keyframe_count())
			.map(|k| (k.file_offset.unwrap_or(0), k.timestamp.unwrap_or(0)))
	}

	/// Record the next keyframe; returns false when all slots are used.
	pub fn push_keyframe(&mut self, file_offset: u64, timestamp: u64) -> bool {
		let next = self.keyframe_count();
		let Some(slot) = self.keyframes.get_mut(next) else {
			return false;
		};
		slot.file_offset = Some(file_offset);
		slot.timestamp = Some(timestamp);
		self.keyframes_count = Some(next as u32 + 1);
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use prost::Message;

	#[test]
	fn header_encoded_len_is_invariant_under_rewrites() {
		let mut header = RecordingFileHeader::with_preallocated_keyframes(7, 1_000, 12);
		let initial = header.encoded_len();

		assert!(header.push_keyframe(4096, 1_500));
		assert!(header.push_keyframe(8192, 2_000));
		header.stop_time = Some(9_999);

		assert_eq!(header.encoded_len(), initial);
	}

	#[test]
	fn header_slots_are_exhaustible() {
		let mut header = RecordingFileHeader::with_preallocated_keyframes(1, 0, 2);
		assert!(header.push_keyframe(1, 1));
		assert!(header.push_keyframe(2, 2));
		assert!(!header.push_keyframe(3, 3));
		assert_eq!(header.keyframe_count(), 2);
	}

	#[test]
	fn header_roundtrip() {
		let mut header = RecordingFileHeader::with_preallocated_keyframes(3, 123, 4);
		header.push_keyframe(100, 456);

		let bytes = header.encode_to_vec();
		let decoded = RecordingFileHeader::decode(bytes.as_slice()).expect("decode");
		assert_eq!(decoded, header);
		assert_eq!(decoded.written_keyframes().collect::<Vec<_>>(), vec![(100, 456)]);
	}
}
