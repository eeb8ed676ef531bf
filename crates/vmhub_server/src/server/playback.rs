#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};
use vmhub_protocol::messages::{
	GuacServerInstr, RecordingFileHeader, RecordingPlaybackPreview, RecordingPreviewRequest, ServerMessage, VmThumbnail,
	guac_server_instr, server_message,
};

use crate::server::client::Client;
use crate::server::db::Db;
use crate::server::screenshot::DisplayCanvas;

/// Serve a recording-preview request: walk the recording files covering
/// [start, stop), render thumbnails at the sample points, and finish with
/// a terminal result message. Runs to completion as its own task.
pub fn spawn_preview(db: Db, client: Arc<Client>, request: RecordingPreviewRequest) {
	tokio::spawn(async move {
		let ok = run_preview(db, &client, request).await;
		client.queue_message(&ServerMessage::new(server_message::Payload::RecordingPlaybackResult(ok)));
	});
}

async fn run_preview(db: Db, client: &Arc<Client>, request: RecordingPreviewRequest) -> bool {
	if request.start_time == 0 || request.stop_time == 0 || request.stop_time <= request.start_time {
		return false;
	}

	let mut current = request.start_time;
	while current < request.stop_time {
		let file = match db.recording_file_for(request.vm_id, current).await {
			Ok(Some(file)) => file,
			Ok(None) => return false,
			Err(e) => {
				warn!(vm_id = request.vm_id, error = %e, "recording index lookup failed");
				return false;
			}
		};
		let (path, file_start, file_stop) = file;

		let client = Arc::clone(client);
		let request_for_file = request.clone();
		let result = tokio::task::spawn_blocking(move || {
			render_file(&path, file_start, file_stop, current, &request_for_file, &client)
		})
		.await;

		let next = match result {
			Ok(next) => next,
			Err(e) => {
				warn!(vm_id = request.vm_id, error = %e, "preview render task failed");
				return false;
			}
		};

		match next {
			FileOutcome::Advance(next_ts) if next_ts > current => current = next_ts,
			// Caught up with a live file that has no more data to give;
			// the walk is complete.
			FileOutcome::Advance(_) => break,
			// A still-recording file that cannot be read and whose start
			// gives the cursor nowhere to skip to fails the walk.
			FileOutcome::Stuck => return false,
		}
	}

	true
}

enum FileOutcome {
	Advance(u64),
	Stuck,
}

/// Render previews from one recording file; returns where the cursor
/// should continue.
fn render_file(
	path: &str,
	file_start: u64,
	file_stop: u64,
	mut current: u64,
	request: &RecordingPreviewRequest,
	client: &Arc<Client>,
) -> FileOutcome {
	let skip_to = || {
		if file_stop > 0 {
			FileOutcome::Advance(file_stop)
		} else if file_start + 1 > current {
			FileOutcome::Advance(file_start + 1)
		} else {
			FileOutcome::Stuck
		}
	};

	let mut reader = match RecordingReader::open(Path::new(path)) {
		Ok(reader) => reader,
		Err(e) => {
			debug!(path, error = %e, "skipping unreadable recording file");
			return skip_to();
		}
	};

	reader.seek_to_timestamp(current);
	let mut canvas = DisplayCanvas::new();
	let mut keyframe_changed = false;

	while current < request.stop_time {
		if keyframe_changed {
			canvas = DisplayCanvas::new();
			keyframe_changed = false;
		}

		// Accumulate display state up to the sample point; SYNC
		// instructions move the recording clock.
		let initial_ts = reader.current_ts;
		let mut one_frame = false;
		loop {
			let Some(instr) = reader.read_instruction() else {
				break;
			};
			canvas.handle_instruction(&instr);
			one_frame = true;
			let keep_reading =
				(request.time_interval > 0 && reader.current_ts < current) || initial_ts == reader.current_ts;
			if !keep_reading {
				break;
			}
		}
		if !one_frame {
			return FileOutcome::Advance(reader.next_file_timestamp());
		}

		if let Some(png) = canvas.render_png(request.width, request.height) {
			client.queue_message(&ServerMessage::new(server_message::Payload::RecordingPlaybackPreview(
				RecordingPlaybackPreview {
					timestamp: reader.current_ts,
					thumbnail: Some(VmThumbnail {
						id: request.vm_id,
						png_bytes: png,
					}),
				},
			)));
		}

		if request.time_interval > 0 {
			current = reader.current_ts + request.time_interval;
			if !reader.seek_to_timestamp(current) {
				break;
			}
		} else {
			let more = reader.next_keyframe();
			current = reader.current_ts;
			if !more {
				current = reader.next_file_timestamp();
				break;
			}
			keyframe_changed = true;
		}
	}

	FileOutcome::Advance(current.max(file_start + 1))
}

/// One open recording file: header snapshot, keyframe index, and a cursor
/// through the message stream.
struct RecordingReader {
	file: File,
	header: RecordingFileHeader,
	keyframes: Vec<(u64, u64)>,
	keyframe_idx: usize,
	current_ts: u64,
}

impl RecordingReader {
	fn open(path: &Path) -> anyhow::Result<Self> {
		let (header, stream_start) = crate::server::recording::read_header(path)?;
		let mut file = File::open(path)?;
		file.seek(SeekFrom::Start(stream_start))?;
		let keyframes = header.written_keyframes().collect();
		let current_ts = header.start_time;
		Ok(Self {
			file,
			header,
			keyframes,
			keyframe_idx: 0,
			current_ts,
		})
	}

	/// Next guac instruction in the stream; SYNC updates the cursor clock.
	fn read_instruction(&mut self) -> Option<GuacServerInstr> {
		loop {
			let mut prefix = [0u8; 4];
			self.file.read_exact(&mut prefix).ok()?;
			let len = u32::from_be_bytes(prefix) as usize;
			if len > vmhub_protocol::DEFAULT_MAX_FRAME_SIZE {
				return None;
			}
			let mut payload = vec![0u8; len];
			self.file.read_exact(&mut payload).ok()?;

			let message = match <ServerMessage as prost::Message>::decode(payload.as_slice()) {
				Ok(message) => message,
				Err(_) => return None,
			};
			let Some(server_message::Payload::GuacInstr(instr)) = message.payload else {
				continue;
			};
			if let Some(guac_server_instr::Instr::Sync(ts)) = instr.instr.as_ref() {
				self.current_ts = *ts;
			}
			return Some(instr);
		}
	}

	/// Position at the closest keyframe at or before `timestamp`. False
	/// when the timestamp falls outside this file.
	fn seek_to_timestamp(&mut self, timestamp: u64) -> bool {
		let stop = self.header.stop_time_ms();
		if timestamp < self.header.start_time || (stop > 0 && timestamp > stop) {
			return false;
		}

		let target = self
			.keyframes
			.iter()
			.rposition(|&(_, keyframe_ts)| keyframe_ts <= timestamp);
		if let Some(idx) = target {
			let (_, keyframe_ts) = self.keyframes[idx];
			// Seek only when it moves the cursor: forward past unread
			// instructions, or backward for a rewind.
			if self.current_ts < keyframe_ts || timestamp < self.current_ts {
				self.seek_to_keyframe(idx);
			}
		}
		true
	}

	fn next_keyframe(&mut self) -> bool {
		if self.keyframe_idx + 1 < self.keyframes.len() {
			self.seek_to_keyframe(self.keyframe_idx + 1);
			true
		} else {
			false
		}
	}

	fn seek_to_keyframe(&mut self, idx: usize) {
		let (offset, timestamp) = self.keyframes[idx];
		if self.file.seek(SeekFrom::Start(offset)).is_ok() {
			self.keyframe_idx = idx;
			self.current_ts = timestamp;
		}
	}

	/// Where the walk continues once this file is exhausted.
	fn next_file_timestamp(&self) -> u64 {
		(self.header.start_time + 1).max(self.header.stop_time_ms())
	}
}
