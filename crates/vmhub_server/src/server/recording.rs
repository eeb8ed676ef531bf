#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use vmhub_protocol::messages::{RecordingFileHeader, RecordingSettings, ServerMessage, guac_server_instr, server_message};

use crate::util::time::unix_ms_now;

const RECORDINGS_DIRECTORY: &str = "./recordings";

/// A file that began recording: the caller indexes it in the DB and arms
/// the rollover/keyframe timers for the returned epoch.
pub struct StartedFile {
	pub epoch: u64,
	pub path: String,
	pub start_ms: u64,
	pub file_duration: Duration,
	pub keyframe_interval: Option<Duration>,
}

/// A file that stopped recording: the caller finalizes its index row.
pub struct StoppedFile {
	pub path: String,
	pub stop_ms: u64,
}

pub struct StartOutcome {
	pub stopped: Option<StoppedFile>,
	pub started: Option<StartedFile>,
}

pub enum KeyframeOutcome {
	/// Keyframe recorded; the caller emits a canvas snapshot into the
	/// stream and re-arms the timer for the same epoch.
	Recorded { interval: Duration },
	/// All preallocated slots are used; the caller rolls the file over.
	SlotsExhausted,
	Stale,
}

pub enum SettingsOutcome {
	/// The remaining file time exceeds the new duration: roll over now.
	Restart,
	/// Keep the file, re-arm the keyframe timer for the armed epoch.
	RearmKeyframe {
		epoch: u64,
		interval: Option<Duration>,
	},
	None,
}

struct ActiveFile {
	file: File,
	path: String,
	header: RecordingFileHeader,
	/// Absolute offset where the message stream continues; keyframe
	/// entries point at positions in this stream.
	end_pos: u64,
	stop_deadline: Instant,
	last_written_ms: u64,
}

/// Per-VM append-only recording writer with a periodic keyframe index and
/// timed file rollover. Timers live with the VM; this controller hands out
/// epochs so a timer armed for a closed file fires into nothing.
pub struct RecordingController {
	vm_id: u32,
	settings: RecordingSettings,
	directory: std::path::PathBuf,
	active: Option<ActiveFile>,
	epoch: u64,
}

impl RecordingController {
	pub fn new(vm_id: u32, settings: RecordingSettings) -> Self {
		Self {
			vm_id,
			settings,
			directory: RECORDINGS_DIRECTORY.into(),
			active: None,
			epoch: 0,
		}
	}

	#[cfg(test)]
	pub fn with_directory(vm_id: u32, settings: RecordingSettings, directory: impl Into<std::path::PathBuf>) -> Self {
		let mut controller = Self::new(vm_id, settings);
		controller.directory = directory.into();
		controller
	}

	pub fn is_recording(&self) -> bool {
		self.active.is_some()
	}

	pub fn file_duration(&self) -> Duration {
		Duration::from_secs(u64::from(self.settings.file_duration_minutes) * 60)
	}

	pub fn keyframe_interval(&self) -> Option<Duration> {
		match self.settings.keyframe_interval_seconds {
			0 => None,
			secs => Some(Duration::from_secs(u64::from(secs))),
		}
	}

	pub fn set_settings(&mut self, settings: RecordingSettings, now: Instant) -> SettingsOutcome {
		self.settings = settings;
		let Some(active) = self.active.as_ref() else {
			return SettingsOutcome::None;
		};

		let remaining = active.stop_deadline.saturating_duration_since(now);
		if remaining >= self.file_duration() {
			return SettingsOutcome::Restart;
		}

		// Invalidate the old keyframe timer, keep the file.
		self.epoch += 1;
		SettingsOutcome::RearmKeyframe {
			epoch: self.epoch,
			interval: self.keyframe_interval(),
		}
	}

	/// Open a new recording file, closing the current one first. A zero
	/// file duration leaves recording off.
	pub fn start(&mut self, now: Instant) -> StartOutcome {
		let stopped = self.stop();
		let file_duration = self.file_duration();
		if file_duration.is_zero() {
			return StartOutcome { stopped, started: None };
		}

		// Rollover keeps the timeline gapless: the new file starts where
		// the previous one stopped.
		let start_ms = stopped.as_ref().map(|s| s.stop_ms).unwrap_or_else(unix_ms_now);

		if let Err(e) = fs::create_dir_all(&self.directory) {
			warn!(vm_id = self.vm_id, error = %e, "cannot create recordings directory");
			return StartOutcome { stopped, started: None };
		}

		let date_time = chrono::Local::now().format("%Y-%m-%d_%I-%M-%S_%p");
		let path = format!("{}/vm{}_{date_time}.bin", self.directory.display(), self.vm_id);

		let slots = match self.keyframe_interval() {
			Some(interval) => (file_duration.as_secs() / interval.as_secs().max(1)) as usize,
			None => 0,
		};
		let header = RecordingFileHeader::with_preallocated_keyframes(self.vm_id, start_ms, slots);

		let mut file = match File::create(&path) {
			Ok(f) => f,
			Err(e) => {
				warn!(vm_id = self.vm_id, path, error = %e, "cannot create recording file");
				return StartOutcome { stopped, started: None };
			}
		};

		let header_frame = match vmhub_protocol::encode_frame_default(&header) {
			Ok(frame) => frame,
			Err(e) => {
				warn!(vm_id = self.vm_id, error = %e, "cannot encode recording header");
				return StartOutcome { stopped, started: None };
			}
		};
		if let Err(e) = file.write_all(&header_frame) {
			warn!(vm_id = self.vm_id, path, error = %e, "cannot write recording header");
			return StartOutcome { stopped, started: None };
		}

		info!(vm_id = self.vm_id, path, "recording started");
		self.epoch += 1;
		self.active = Some(ActiveFile {
			file,
			path: path.clone(),
			header,
			end_pos: header_frame.len() as u64,
			stop_deadline: now + file_duration,
			last_written_ms: start_ms,
		});

		StartOutcome {
			stopped,
			started: Some(StartedFile {
				epoch: self.epoch,
				path,
				start_ms,
				file_duration,
				keyframe_interval: self.keyframe_interval(),
			}),
		}
	}

	/// Close the current file, stamping its stop time into the header.
	pub fn stop(&mut self) -> Option<StoppedFile> {
		let mut active = self.active.take()?;
		self.epoch += 1;

		let stop_ms = unix_ms_now().max(active.last_written_ms + 1);
		active.header.stop_time = Some(stop_ms);
		rewrite_header(&mut active);

		info!(vm_id = self.vm_id, path = active.path, "recording stopped");
		Some(StoppedFile {
			path: active.path,
			stop_ms,
		})
	}

	/// Stop-timer fired: roll over to a fresh file.
	pub fn rollover(&mut self, epoch: u64, now: Instant) -> Option<StartOutcome> {
		if epoch != self.epoch || self.active.is_none() {
			return None;
		}
		Some(self.start(now))
	}

	/// Keyframe-timer fired: record the current stream position.
	pub fn keyframe(&mut self, epoch: u64) -> KeyframeOutcome {
		if epoch != self.epoch {
			return KeyframeOutcome::Stale;
		}
		let Some(interval) = self.keyframe_interval() else {
			return KeyframeOutcome::Stale;
		};
		let Some(active) = self.active.as_mut() else {
			return KeyframeOutcome::Stale;
		};

		let timestamp = unix_ms_now().max(active.last_written_ms + 1);
		if !active.header.push_keyframe(active.end_pos, timestamp) {
			return KeyframeOutcome::SlotsExhausted;
		}
		active.last_written_ms = timestamp;
		rewrite_header(active);
		KeyframeOutcome::Recorded { interval }
	}

	/// Append a server message to the stream if the capture flags admit
	/// it. A write failure degrades by stopping the recording; the session
	/// itself is unaffected.
	pub fn write_message(&mut self, message: &ServerMessage) -> Option<StoppedFile> {
		if self.active.is_none() || !is_message_recorded(&self.settings, message) {
			return None;
		}

		let frame = match vmhub_protocol::encode_frame_default(message) {
			Ok(frame) => frame,
			Err(e) => {
				warn!(vm_id = self.vm_id, error = %e, "cannot frame recorded message");
				return None;
			}
		};

		let active = self.active.as_mut()?;
		if let Err(e) = active.file.write_all(&frame) {
			warn!(vm_id = self.vm_id, path = active.path, error = %e, "recording write failed, stopping");
			return self.stop();
		}
		active.end_pos += frame.len() as u64;
		if let Some(server_message::Payload::GuacInstr(instr)) = message.payload.as_ref()
			&& let Some(guac_server_instr::Instr::Sync(ts)) = instr.instr.as_ref()
		{
			active.last_written_ms = active.last_written_ms.max(*ts);
		}
		None
	}

	pub fn current_path(&self) -> Option<&str> {
		self.active.as_ref().map(|a| a.path.as_str())
	}
}

fn rewrite_header(active: &mut ActiveFile) {
	// The header re-encodes to the same byte length by construction, so
	// seeking to zero and writing never clobbers the stream behind it.
	let frame = match vmhub_protocol::encode_frame_default(&active.header) {
		Ok(frame) => frame,
		Err(e) => {
			warn!(path = active.path, error = %e, "cannot encode recording header");
			return;
		}
	};
	let result = active
		.file
		.seek(SeekFrom::Start(0))
		.and_then(|_| active.file.write_all(&frame))
		.and_then(|_| active.file.seek(SeekFrom::Start(active.end_pos)))
		.and_then(|_| active.file.flush());
	if let Err(e) = result {
		warn!(path = active.path, error = %e, "recording header rewrite failed");
	}
}

/// Capture-flag filter: SYNC goes in if anything is captured, audio and
/// input by their flags, every other guac kind is display. Non-guac server
/// messages are always recorded.
fn is_message_recorded(settings: &RecordingSettings, message: &ServerMessage) -> bool {
	use guac_server_instr::Instr;

	let Some(server_message::Payload::GuacInstr(instr)) = message.payload.as_ref() else {
		return true;
	};
	match instr.instr.as_ref() {
		Some(Instr::Sync(_)) => settings.capture_display || settings.capture_input || settings.capture_audio,
		Some(Instr::Audio(_)) => settings.capture_audio,
		Some(Instr::Mouse(_)) | Some(Instr::Key(_)) => settings.capture_input,
		Some(Instr::Size(_)) | Some(Instr::Png(_)) | None => settings.capture_display,
	}
}

/// Read a recording file's header and the offset where its stream begins.
pub fn read_header(path: &Path) -> anyhow::Result<(RecordingFileHeader, u64)> {
	use anyhow::Context as _;

	let data = fs::read(path).with_context(|| format!("read recording {}", path.display()))?;
	let (header, consumed) = vmhub_protocol::decode_frame::<RecordingFileHeader>(&data, vmhub_protocol::DEFAULT_MAX_FRAME_SIZE)
		.context("decode recording header")?;
	Ok((header, consumed as u64))
}

#[cfg(test)]
mod recording_tests {
	use vmhub_protocol::messages::{ChannelChatMessage, DisplaySize, GuacServerInstr};

	use super::*;

	fn settings(duration_minutes: u32, keyframe_secs: u32) -> RecordingSettings {
		RecordingSettings {
			file_duration_minutes: duration_minutes,
			keyframe_interval_seconds: keyframe_secs,
			capture_display: true,
			capture_input: false,
			capture_audio: false,
		}
	}

	fn guac(instr: guac_server_instr::Instr) -> ServerMessage {
		ServerMessage::new(server_message::Payload::GuacInstr(GuacServerInstr { instr: Some(instr) }))
	}

	fn controller(vm_id: u32, s: RecordingSettings, dir: &tempfile::TempDir) -> RecordingController {
		RecordingController::with_directory(vm_id, s, dir.path())
	}

	#[test]
	fn zero_file_duration_keeps_recording_off() {
		let dir = tempfile::tempdir().expect("tempdir");
		let mut recording = controller(1, settings(0, 0), &dir);
		let outcome = recording.start(Instant::now());
		assert!(outcome.started.is_none());
		assert!(!recording.is_recording());
	}

	#[test]
	fn keyframes_land_in_the_header_and_respect_slots() {
		let dir = tempfile::tempdir().expect("tempdir");
		let mut recording = controller(7, settings(1, 20), &dir);
		let started = recording.start(Instant::now()).started.expect("started");
		assert_eq!(started.keyframe_interval, Some(Duration::from_secs(20)));

		// 60s / 20s = 3 slots.
		for _ in 0..3 {
			assert!(matches!(
				recording.keyframe(started.epoch),
				KeyframeOutcome::Recorded { .. }
			));
		}
		assert!(matches!(recording.keyframe(started.epoch), KeyframeOutcome::SlotsExhausted));
		assert!(matches!(recording.keyframe(started.epoch + 1), KeyframeOutcome::Stale));

		let path = recording.current_path().expect("path").to_string();
		recording.stop().expect("stopped");

		let (header, _) = read_header(Path::new(&path)).expect("header");
		assert_eq!(header.vm_id, 7);
		assert_eq!(header.keyframe_count(), 3);
		assert_eq!(header.keyframes.len(), 3);
		let stop = header.stop_time_ms();
		assert!(stop > 0);
		for (_, ts) in header.written_keyframes() {
			assert!(header.start_time <= ts && ts <= stop);
		}
	}

	#[test]
	fn messages_roundtrip_through_the_file() {
		let dir = tempfile::tempdir().expect("tempdir");
		let mut recording = controller(2, settings(5, 0), &dir);
		recording.start(Instant::now()).started.expect("started");

		let size = guac(guac_server_instr::Instr::Size(DisplaySize {
			layer: 0,
			width: 640,
			height: 480,
		}));
		let sync = guac(guac_server_instr::Instr::Sync(12_345));
		let chat = ServerMessage::new(server_message::Payload::ChatMessage(ChannelChatMessage {
			channel: 2,
			message: None,
		}));
		// Input is not captured by these settings.
		let key = guac(guac_server_instr::Instr::Key(vmhub_protocol::messages::KeyEvent {
			keysym: 0x41,
			pressed: true,
		}));

		for msg in [&size, &sync, &chat, &key] {
			assert!(recording.write_message(msg).is_none());
		}

		let path = recording.current_path().expect("path").to_string();
		recording.stop().expect("stopped");

		let data = fs::read(&path).expect("read file");
		let (_, header_len) = read_header(Path::new(&path)).expect("header");
		let mut offset = header_len as usize;
		let mut replayed = Vec::new();
		while offset < data.len() {
			let (msg, used) =
				vmhub_protocol::decode_frame::<ServerMessage>(&data[offset..], vmhub_protocol::DEFAULT_MAX_FRAME_SIZE)
					.expect("decode frame");
			offset += used;
			replayed.push(msg);
		}
		assert_eq!(replayed, vec![size, sync, chat]);
	}

	#[test]
	fn shrinking_the_duration_requests_a_restart() {
		let dir = tempfile::tempdir().expect("tempdir");
		let now = Instant::now();
		let mut recording = controller(3, settings(10, 0), &dir);
		recording.start(now).started.expect("started");

		assert!(matches!(
			recording.set_settings(settings(1, 0), now),
			SettingsOutcome::Restart
		));
	}

	#[test]
	fn growing_the_duration_just_rearms_the_keyframe_timer() {
		let dir = tempfile::tempdir().expect("tempdir");
		let now = Instant::now();
		let mut recording = controller(3, settings(1, 10), &dir);
		recording.start(now).started.expect("started");

		match recording.set_settings(settings(60, 10), now) {
			SettingsOutcome::RearmKeyframe { interval, .. } => {
				assert_eq!(interval, Some(Duration::from_secs(10)));
			}
			_ => panic!("expected keyframe rearm"),
		}
	}

	#[test]
	fn rollover_chains_start_times() {
		let dir = tempfile::tempdir().expect("tempdir");
		let now = Instant::now();
		let mut recording = controller(4, settings(1, 0), &dir);
		let first = recording.start(now).started.expect("started");

		let outcome = recording.rollover(first.epoch, now).expect("rollover");
		let stopped = outcome.stopped.expect("previous file closed");
		let second = outcome.started.expect("next file open");
		assert_eq!(second.start_ms, stopped.stop_ms);
	}
}
