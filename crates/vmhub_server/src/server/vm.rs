#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};
use vmhub_protocol::messages::{
	AdminVmInfo, ConnectResponse, ConnectSuccess, GuacClientInstr, GuacServerInstr, RecordingSettings, ServerMessage,
	TurnInfo, UserType, VmInfo, VmSetting, VmStatus, VoteStatus, connect_response, guac_server_instr, server_message,
	vm_setting,
};

use crate::server::channel::{UserChannel, UserData, UserVoteData};
use crate::server::client::Client;
use crate::server::db::Db;
use crate::server::exec::Owner;
use crate::server::recording::{KeyframeOutcome, RecordingController, SettingsOutcome, StartOutcome};
use crate::server::screenshot::DisplayCanvas;
use crate::server::turns::{TurnState, TurnTransition};
use crate::util::time::unix_ms_now;

/// Thumbnail bounds for the VM list.
const THUMBNAIL_WIDTH: u32 = 400;
const THUMBNAIL_HEIGHT: u32 = 300;

/// Gap a user must leave after participating in a reset vote before they
/// can open a new one.
const VOTE_COOLDOWN: Duration = Duration::from_secs(30);

/// Stable slot index per VM setting kind (DB row key + merge slot).
pub fn vm_setting_kind(setting: &VmSetting) -> Option<u32> {
	use vm_setting::Setting;
	Some(match setting.setting.as_ref()? {
		Setting::Name(_) => 0,
		Setting::Description(_) => 1,
		Setting::Host(_) => 2,
		Setting::Port(_) => 3,
		Setting::TurnTime(_) => 4,
		Setting::VoteTime(_) => 5,
		Setting::AutoStart(_) => 6,
		Setting::DisallowGuests(_) => 7,
		Setting::Recordings(_) => 8,
	})
}

/// Typed view of a VM's settings list.
#[derive(Debug, Clone)]
pub struct VmSettings {
	pub name: String,
	pub description: String,
	pub host: String,
	pub port: u16,
	pub turn_time: Duration,
	pub vote_time: Duration,
	pub auto_start: bool,
	pub disallow_guests: bool,
	pub recordings: RecordingSettings,
}

impl Default for VmSettings {
	fn default() -> Self {
		Self {
			name: String::new(),
			description: String::new(),
			host: String::new(),
			port: 0,
			turn_time: Duration::from_secs(20),
			vote_time: Duration::ZERO,
			auto_start: false,
			disallow_guests: false,
			recordings: RecordingSettings::default(),
		}
	}
}

impl VmSettings {
	pub fn from_list(settings: &[VmSetting]) -> Result<Self, &'static str> {
		let mut out = Self::default();
		out.apply(settings)?;
		Ok(out)
	}

	pub fn apply(&mut self, updates: &[VmSetting]) -> Result<(), &'static str> {
		use vm_setting::Setting;
		for update in updates {
			match update.setting.as_ref() {
				Some(Setting::Name(v)) => self.name = v.clone(),
				Some(Setting::Description(v)) => {
					if v.len() > 200 {
						return Err("description too long");
					}
					self.description = v.clone();
				}
				Some(Setting::Host(v)) => self.host = v.clone(),
				Some(Setting::Port(v)) => {
					self.port = u16::try_from(*v).map_err(|_| "port out of range")?;
				}
				Some(Setting::TurnTime(v)) => {
					if *v == 0 {
						return Err("turn time must be positive");
					}
					self.turn_time = Duration::from_secs(u64::from(*v));
				}
				Some(Setting::VoteTime(v)) => self.vote_time = Duration::from_secs(u64::from(*v)),
				Some(Setting::AutoStart(v)) => self.auto_start = *v,
				Some(Setting::DisallowGuests(v)) => self.disallow_guests = *v,
				Some(Setting::Recordings(v)) => self.recordings = v.clone(),
				None => {}
			}
		}
		Ok(())
	}

	pub fn to_list(&self) -> Vec<VmSetting> {
		use vm_setting::Setting;
		[
			Setting::Name(self.name.clone()),
			Setting::Description(self.description.clone()),
			Setting::Host(self.host.clone()),
			Setting::Port(u32::from(self.port)),
			Setting::TurnTime(self.turn_time.as_secs() as u32),
			Setting::VoteTime(self.vote_time.as_secs() as u32),
			Setting::AutoStart(self.auto_start),
			Setting::DisallowGuests(self.disallow_guests),
			Setting::Recordings(self.recordings.clone()),
		]
		.into_iter()
		.map(|setting| VmSetting { setting: Some(setting) })
		.collect()
	}
}

/// Events from the remote-desktop protocol client behind a VM.
pub enum DesktopEvent {
	Instruction(GuacServerInstr),
	Closed,
}

/// Handle into a connected remote-desktop client: an input sink plus
/// whatever the connector needs kept alive for the session's duration.
pub struct DesktopHandle {
	pub input: mpsc::UnboundedSender<GuacClientInstr>,
	_keepalive: Option<mpsc::UnboundedSender<DesktopEvent>>,
}

impl DesktopHandle {
	pub fn new(input: mpsc::UnboundedSender<GuacClientInstr>) -> Self {
		Self {
			input,
			_keepalive: None,
		}
	}

	pub fn with_keepalive(input: mpsc::UnboundedSender<GuacClientInstr>, events: mpsc::UnboundedSender<DesktopEvent>) -> Self {
		Self {
			input,
			_keepalive: Some(events),
		}
	}
}

/// Factory for remote-desktop connections; the protocol client itself is
/// an external collaborator.
pub trait DesktopConnector: Send + Sync + 'static {
	fn connect(
		&self,
		vm_id: u32,
		host: &str,
		port: u16,
		events: mpsc::UnboundedSender<DesktopEvent>,
	) -> anyhow::Result<DesktopHandle>;
}

/// Connector that accepts input and produces no display stream. Stands in
/// wherever no protocol client is wired up.
pub struct NullConnector;

impl DesktopConnector for NullConnector {
	fn connect(
		&self,
		_vm_id: u32,
		_host: &str,
		_port: u16,
		events: mpsc::UnboundedSender<DesktopEvent>,
	) -> anyhow::Result<DesktopHandle> {
		let (input, mut input_rx) = mpsc::unbounded_channel();
		tokio::spawn(async move { while input_rx.recv().await.is_some() {} });
		Ok(DesktopHandle::with_keepalive(input, events))
	}
}

#[derive(Default)]
struct VoteState {
	active: bool,
	deadline: Option<Instant>,
	epoch: u64,
	yes: u32,
	no: u32,
}

/// All mutable state of one VM, bound to a single owner.
pub struct VmState {
	pub id: u32,
	pub settings: VmSettings,
	pub status: VmStatus,
	pub channel: UserChannel,
	pub turns: TurnState,
	vote: VoteState,
	pub recording: RecordingController,
	pub canvas: DisplayCanvas,
	backend: Option<DesktopHandle>,
	backend_epoch: u64,
}

/// Handle to a VM: its id plus the owner executing against its state.
pub struct Vm {
	pub id: u32,
	pub owner: Owner<VmState>,
	db: Db,
	connector: Arc<dyn DesktopConnector>,
}

impl Vm {
	pub fn spawn(id: u32, settings: VmSettings, db: Db, connector: Arc<dyn DesktopConnector>) -> Arc<Self> {
		let recordings = settings.recordings.clone();
		let state = VmState {
			id,
			settings,
			status: VmStatus::Stopped,
			channel: UserChannel::new(id),
			turns: TurnState::default(),
			vote: VoteState::default(),
			recording: RecordingController::new(id, recordings),
			canvas: DisplayCanvas::new(),
			backend: None,
			backend_epoch: 0,
		};
		Arc::new(Self {
			id,
			owner: Owner::spawn("vm", state),
			db,
			connector,
		})
	}

	// -- membership -------------------------------------------------------

	/// Admit a user: guests may be disallowed by settings; on success the
	/// joiner receives the connect response (chat history included) plus
	/// the current turn and vote snapshots.
	pub fn connect_user(self: &Arc<Self>, client: Arc<Client>, username: String) {
		self.owner.dispatch(move |state| {
			if state.settings.disallow_guests && !client.is_logged_in() {
				client.queue_message(&connect_failed());
				return;
			}

			client.set_connected_vm(state.id);
			client.queue_message(&ServerMessage::new(server_message::Payload::ConnectResponse(ConnectResponse {
				result: Some(connect_response::Result::Success(ConnectSuccess {
					channel: state.id,
					username: username.clone(),
					captcha_required: client.is_captcha_required(),
					chat_history: state.channel.chat_room().chat_history(),
				})),
			})));

			let data = UserData {
				username,
				user_type: client.user_type(),
				ip_address: client.ip_bytes,
				vote: UserVoteData::default(),
			};
			state.channel.add_user(data, Arc::clone(&client));
			client.queue_message(&state.turn_info_message(Instant::now()));
			if state.vote.active {
				client.queue_message(&state.vote_status_message(Instant::now()));
			}
		});
	}

	pub fn remove_user(self: &Arc<Self>, conn_id: u64) {
		let vm = Arc::clone(self);
		self.owner.dispatch(move |state| {
			if state.channel.remove_user(conn_id).is_none() {
				return;
			}
			let transition = state.turns.remove(conn_id, Instant::now(), state.settings.turn_time);
			state.apply_turn_transition(transition, &vm);
		});
	}

	pub fn rename_user(self: &Arc<Self>, conn_id: u64, new_username: String, user_type: UserType) {
		self.owner.dispatch(move |state| {
			state.channel.rename_user(conn_id, &new_username, user_type);
		});
	}

	pub fn chat(self: &Arc<Self>, username: String, user_type: UserType, text: String) {
		let vm = Arc::clone(self);
		self.owner.dispatch(move |state| {
			let entry = state.channel.chat_room_mut().add_user_message(&username, user_type, &text);
			let message = ServerMessage::new(server_message::Payload::ChatMessage(
				vmhub_protocol::messages::ChannelChatMessage {
					channel: state.id,
					message: Some(entry),
				},
			));
			state.broadcast_and_record(&message, &vm);
		});
	}

	// -- turns ------------------------------------------------------------

	pub fn request_turn(self: &Arc<Self>, conn_id: u64) {
		let vm = Arc::clone(self);
		self.owner.dispatch(move |state| {
			if !state.channel.contains(conn_id) {
				return;
			}
			let transition = state.turns.request(conn_id, Instant::now(), state.settings.turn_time);
			state.apply_turn_transition(transition, &vm);
		});
	}

	pub fn end_turn(self: &Arc<Self>, conn_id: u64) {
		let vm = Arc::clone(self);
		self.owner.dispatch(move |state| {
			let transition = state.turns.end_turn(conn_id, Instant::now(), state.settings.turn_time);
			state.apply_turn_transition(transition, &vm);
		});
	}

	/// Admin action: end the current turn whoever holds it.
	pub fn skip_turn(self: &Arc<Self>) {
		let vm = Arc::clone(self);
		self.owner.dispatch(move |state| {
			let transition = state.turns.skip(Instant::now(), state.settings.turn_time);
			state.apply_turn_transition(transition, &vm);
		});
	}

	pub fn pause_turn_timer(self: &Arc<Self>) {
		let vm = Arc::clone(self);
		self.owner.dispatch(move |state| {
			let transition = state.turns.pause(Instant::now());
			state.apply_turn_transition(transition, &vm);
		});
	}

	pub fn resume_turn_timer(self: &Arc<Self>) {
		let vm = Arc::clone(self);
		self.owner.dispatch(move |state| {
			let transition = state.turns.resume(Instant::now());
			state.apply_turn_transition(transition, &vm);
		});
	}

	fn arm_turn_timer(self: &Arc<Self>, epoch: u64, deadline: Instant) {
		let vm = Arc::clone(self);
		tokio::spawn(async move {
			tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
			let vm_for_state = Arc::clone(&vm);
			vm.owner.dispatch(move |state| {
				let transition = state.turns.expire(epoch, Instant::now(), state.settings.turn_time);
				state.apply_turn_transition(transition, &vm_for_state);
			});
		});
	}

	// -- input ------------------------------------------------------------

	/// Forward one input instruction if the sender holds the turn.
	pub fn read_instruction(self: &Arc<Self>, conn_id: u64, instr: GuacClientInstr) {
		self.owner.dispatch(move |state| {
			if state.turns.holder() != Some(conn_id) {
				return;
			}
			if let Some(backend) = state.backend.as_ref()
				&& backend.input.send(instr).is_err()
			{
				warn!(vm_id = state.id, "desktop backend rejected input");
			}
		});
	}

	// -- votes ------------------------------------------------------------

	pub fn vote(self: &Arc<Self>, conn_id: u64, voted_yes: bool) {
		let vm = Arc::clone(self);
		self.owner.dispatch(move |state| state.handle_vote(conn_id, voted_yes, &vm));
	}

	fn arm_vote_timer(self: &Arc<Self>, epoch: u64, deadline: Instant) {
		let vm = Arc::clone(self);
		tokio::spawn(async move {
			tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
			let vm_for_state = Arc::clone(&vm);
			vm.owner.dispatch(move |state| state.finish_vote(epoch, &vm_for_state));
		});
	}

	// -- power ------------------------------------------------------------

	pub fn start(self: &Arc<Self>) {
		let vm = Arc::clone(self);
		self.owner.dispatch(move |state| state.start_backend(&vm));
	}

	pub fn stop(self: &Arc<Self>) {
		let vm = Arc::clone(self);
		self.owner.dispatch(move |state| state.stop_backend(&vm));
	}

	pub fn restart(self: &Arc<Self>) {
		let vm = Arc::clone(self);
		self.owner.dispatch(move |state| {
			state.stop_backend(&vm);
			state.start_backend(&vm);
		});
	}

	/// Tear down for deletion: backend gone, recording finalized, channel
	/// emptied.
	pub fn shutdown(self: &Arc<Self>) {
		let vm = Arc::clone(self);
		self.owner.dispatch(move |state| {
			state.stop_backend(&vm);
			state.channel.clear();
		});
	}

	// -- settings and info ------------------------------------------------

	/// Validate, apply, and persist a settings update; replies with the
	/// full settings list on success.
	pub fn update_settings(
		self: &Arc<Self>,
		updates: Vec<VmSetting>,
		reply: impl FnOnce(Result<Vec<VmSetting>, &'static str>) + Send + 'static,
	) {
		let vm = Arc::clone(self);
		self.owner.dispatch(move |state| {
			let mut candidate = state.settings.clone();
			if let Err(e) = candidate.apply(&updates) {
				reply(Err(e));
				return;
			}
			state.settings = candidate;

			let db = vm.db.clone();
			let vm_id = state.id;
			let persisted = updates.clone();
			tokio::spawn(async move {
				if let Err(e) = db.save_vm_settings(vm_id, &persisted).await {
					warn!(vm_id, error = %e, "failed to persist vm settings");
				}
			});

			if updates.iter().any(|u| matches!(u.setting, Some(vm_setting::Setting::Recordings(_)))) {
				let outcome = state
					.recording
					.set_settings(state.settings.recordings.clone(), Instant::now());
				match outcome {
					SettingsOutcome::Restart => {
						let outcome = state.recording.start(Instant::now());
						state.process_recording_outcome(outcome, &vm);
					}
					SettingsOutcome::RearmKeyframe { epoch, interval } => {
						if let Some(interval) = interval {
							vm.arm_keyframe_timer(epoch, interval);
						}
					}
					SettingsOutcome::None => {}
				}
			}

			reply(Ok(state.settings.to_list()));
		});
	}

	pub fn settings_list(self: &Arc<Self>, reply: impl FnOnce(Vec<VmSetting>) + Send + 'static) {
		self.owner.dispatch(move |state| reply(state.settings.to_list()));
	}

	/// Produce the registry's info snapshot: admin info always, public
	/// info and a thumbnail only while running.
	pub fn produce_info(self: &Arc<Self>, reply: impl FnOnce(VmInfoUpdate) + Send + 'static) {
		self.owner.dispatch(move |state| {
			let running = state.status == VmStatus::Running;
			reply(VmInfoUpdate {
				vm_id: state.id,
				admin_info: AdminVmInfo {
					id: state.id,
					name: state.settings.name.clone(),
					status: state.status as i32,
					online_users: state.channel.len() as u32,
				},
				public_info: running.then(|| VmInfo {
					id: state.id,
					name: state.settings.name.clone(),
					description: state.settings.description.clone(),
					online_users: state.channel.len() as u32,
				}),
				thumbnail: if running {
					state.canvas.render_png(THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT)
				} else {
					None
				},
			});
		});
	}

	// -- recording timers -------------------------------------------------

	fn arm_recording_stop_timer(self: &Arc<Self>, epoch: u64, after: Duration) {
		let vm = Arc::clone(self);
		tokio::spawn(async move {
			tokio::time::sleep(after).await;
			let vm_for_state = Arc::clone(&vm);
			vm.owner.dispatch(move |state| {
				if let Some(outcome) = state.recording.rollover(epoch, Instant::now()) {
					state.process_recording_outcome(outcome, &vm_for_state);
				}
			});
		});
	}

	fn arm_keyframe_timer(self: &Arc<Self>, epoch: u64, after: Duration) {
		let vm = Arc::clone(self);
		tokio::spawn(async move {
			tokio::time::sleep(after).await;
			let vm_for_state = Arc::clone(&vm);
			vm.owner.dispatch(move |state| match state.recording.keyframe(epoch) {
				KeyframeOutcome::Recorded { interval } => {
					state.write_canvas_snapshot(&vm_for_state);
					vm_for_state.arm_keyframe_timer(epoch, interval);
				}
				KeyframeOutcome::SlotsExhausted => {
					let outcome = state.recording.start(Instant::now());
					state.process_recording_outcome(outcome, &vm_for_state);
				}
				KeyframeOutcome::Stale => {}
			});
		});
	}
}

/// One VM's contribution to a registry info update.
pub struct VmInfoUpdate {
	pub vm_id: u32,
	pub admin_info: AdminVmInfo,
	pub public_info: Option<VmInfo>,
	pub thumbnail: Option<Vec<u8>>,
}

impl VmState {
	fn turn_info_message(&self, now: Instant) -> ServerMessage {
		let users = self
			.turns
			.line_up()
			.into_iter()
			.filter_map(|conn_id| {
				self.channel
					.users()
					.find(|(client, _)| client.conn_id == conn_id)
					.map(|(_, data)| data.username.clone())
			})
			.collect();
		ServerMessage::new(server_message::Payload::TurnInfo(TurnInfo {
			channel: self.id,
			paused: self.turns.is_paused(),
			time_remaining_ms: self.turns.remaining(now).as_millis() as u64,
			users,
		}))
	}

	fn vote_status_message(&self, now: Instant) -> ServerMessage {
		let remaining = self
			.vote
			.deadline
			.map(|d| d.saturating_duration_since(now))
			.unwrap_or_default();
		ServerMessage::new(server_message::Payload::VoteStatus(VoteStatus {
			channel: self.id,
			active: self.vote.active,
			votes_yes: self.vote.yes,
			votes_no: self.vote.no,
			time_remaining_ms: remaining.as_millis() as u64,
		}))
	}

	fn apply_turn_transition(&mut self, transition: TurnTransition, vm: &Arc<Vm>) {
		match transition {
			TurnTransition::None => return,
			TurnTransition::Rearm { epoch, deadline } => vm.arm_turn_timer(epoch, deadline),
			TurnTransition::QueueChanged | TurnTransition::Idle | TurnTransition::PauseChanged => {}
		}
		let message = self.turn_info_message(Instant::now());
		self.broadcast_and_record(&message, vm);
	}

	fn handle_vote(&mut self, conn_id: u64, voted_yes: bool, vm: &Arc<Vm>) {
		if self.settings.vote_time.is_zero() {
			return;
		}
		let now = Instant::now();
		let Some(data) = self.channel.get_user_data(conn_id) else {
			return;
		};

		if !self.vote.active {
			// Only a yes opens a vote, and not while the voter is cooling
			// down from the previous one.
			if !voted_yes {
				return;
			}
			if let Some(last) = data.vote.last_vote
				&& now.saturating_duration_since(last) < VOTE_COOLDOWN
			{
				return;
			}
			data.vote.voted = true;
			data.vote.last_vote = Some(now);
			self.vote.active = true;
			self.vote.epoch += 1;
			self.vote.yes = 1;
			self.vote.no = 0;
			let deadline = now + self.settings.vote_time;
			self.vote.deadline = Some(deadline);
			vm.arm_vote_timer(self.vote.epoch, deadline);
		} else {
			if data.vote.voted {
				return;
			}
			data.vote.voted = true;
			data.vote.last_vote = Some(now);
			if voted_yes {
				self.vote.yes += 1;
			} else {
				self.vote.no += 1;
			}
		}

		let message = self.vote_status_message(now);
		self.broadcast_and_record(&message, vm);
	}

	fn finish_vote(&mut self, epoch: u64, vm: &Arc<Vm>) {
		if !self.vote.active || epoch != self.vote.epoch {
			return;
		}
		let passed = self.vote.yes > self.vote.no;
		info!(vm_id = self.id, yes = self.vote.yes, no = self.vote.no, passed, "reset vote finished");

		self.vote.active = false;
		self.vote.deadline = None;
		let conn_ids: Vec<u64> = self.channel.users().map(|(client, _)| client.conn_id).collect();
		for conn_id in conn_ids {
			if let Some(data) = self.channel.get_user_data(conn_id) {
				data.vote.voted = false;
			}
		}

		let message = self.vote_status_message(Instant::now());
		self.broadcast_and_record(&message, vm);

		if passed {
			self.stop_backend(vm);
			self.start_backend(vm);
		}
	}

	fn start_backend(&mut self, vm: &Arc<Vm>) {
		if self.status != VmStatus::Stopped {
			return;
		}
		self.status = VmStatus::Starting;

		let (events_tx, mut events_rx) = mpsc::unbounded_channel();
		match vm.connector.connect(self.id, &self.settings.host, self.settings.port, events_tx) {
			Ok(handle) => {
				self.backend = Some(handle);
				self.backend_epoch += 1;
				self.status = VmStatus::Running;
				info!(vm_id = self.id, "vm started");

				let epoch = self.backend_epoch;
				let pump_vm = Arc::clone(vm);
				tokio::spawn(async move {
					while let Some(event) = events_rx.recv().await {
						let vm = Arc::clone(&pump_vm);
						pump_vm.owner.dispatch(move |state| state.on_desktop_event(event, epoch, &vm));
					}
					let vm = Arc::clone(&pump_vm);
					pump_vm
						.owner
						.dispatch(move |state| state.on_desktop_event(DesktopEvent::Closed, epoch, &vm));
				});

				let outcome = self.recording.start(Instant::now());
				self.process_recording_outcome(outcome, vm);
			}
			Err(e) => {
				warn!(vm_id = self.id, error = %e, "failed to connect vm backend");
				self.status = VmStatus::Stopped;
			}
		}
	}

	fn stop_backend(&mut self, vm: &Arc<Vm>) {
		if self.backend.take().is_some() {
			info!(vm_id = self.id, "vm stopped");
		}
		self.backend_epoch += 1;
		self.status = VmStatus::Stopped;
		if let Some(stopped) = self.recording.stop() {
			finalize_recording(vm, stopped);
		}
	}

	fn on_desktop_event(&mut self, event: DesktopEvent, epoch: u64, vm: &Arc<Vm>) {
		if epoch != self.backend_epoch {
			return;
		}
		match event {
			DesktopEvent::Instruction(instr) => {
				self.canvas.handle_instruction(&instr);
				let message = ServerMessage::new(server_message::Payload::GuacInstr(instr));
				self.broadcast_and_record(&message, vm);
			}
			DesktopEvent::Closed => {
				warn!(vm_id = self.id, "vm backend closed");
				self.stop_backend(vm);
			}
		}
	}

	/// Queue a message on every member and append it to the recording.
	fn broadcast_and_record(&mut self, message: &ServerMessage, vm: &Arc<Vm>) {
		self.channel.broadcast_message(message);
		if let Some(stopped) = self.recording.write_message(message) {
			finalize_recording(vm, stopped);
		}
	}

	fn process_recording_outcome(&mut self, outcome: StartOutcome, vm: &Arc<Vm>) {
		if let Some(stopped) = outcome.stopped {
			finalize_recording(vm, stopped);
		}
		let Some(started) = outcome.started else {
			return;
		};

		let db = vm.db.clone();
		let vm_id = self.id;
		let path = started.path.clone();
		let start_ms = started.start_ms;
		tokio::spawn(async move {
			if let Err(e) = db.insert_recording(vm_id, &path, start_ms).await {
				warn!(vm_id, error = %e, "failed to index recording file");
			}
		});

		vm.arm_recording_stop_timer(started.epoch, started.file_duration);
		if let Some(interval) = started.keyframe_interval {
			vm.arm_keyframe_timer(started.epoch, interval);
		}

		// Seed the stream so playback from the file head has a display.
		self.write_canvas_snapshot(vm);
	}

	/// Write the current display as a snapshot into the recording; each
	/// keyframe points at one of these.
	fn write_canvas_snapshot(&mut self, vm: &Arc<Vm>) {
		let mut messages: Vec<ServerMessage> = self
			.canvas
			.keyframe_instructions()
			.into_iter()
			.map(|instr| ServerMessage::new(server_message::Payload::GuacInstr(instr)))
			.collect();
		messages.push(ServerMessage::new(server_message::Payload::GuacInstr(GuacServerInstr {
			instr: Some(guac_server_instr::Instr::Sync(unix_ms_now())),
		})));

		for message in messages {
			if let Some(stopped) = self.recording.write_message(&message) {
				finalize_recording(vm, stopped);
				return;
			}
		}
	}
}

fn finalize_recording(vm: &Arc<Vm>, stopped: crate::server::recording::StoppedFile) {
	let db = vm.db.clone();
	let vm_id = vm.id;
	tokio::spawn(async move {
		if let Err(e) = db.finalize_recording(vm_id, &stopped.path, stopped.stop_ms).await {
			warn!(vm_id, error = %e, "failed to finalize recording index");
		}
	});
}

fn connect_failed() -> ServerMessage {
	ServerMessage::new(server_message::Payload::ConnectResponse(ConnectResponse {
		result: Some(connect_response::Result::Fail(vmhub_protocol::messages::Empty {})),
	}))
}
