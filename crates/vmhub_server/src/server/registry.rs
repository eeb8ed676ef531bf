#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::warn;
use vmhub_protocol::encode_shared_frame;
use vmhub_protocol::messages::{AdminVmInfo, AdminVmList, ServerMessage, VmInfo, VmList, VmThumbnail, server_message};

use crate::server::client::Client;
use crate::server::exec::Owner;
use crate::server::vm::{Vm, VmInfoUpdate};

/// How often every VM is asked for fresh info and a thumbnail.
pub const VM_INFO_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

struct VmEntry {
	vm: Arc<Vm>,
	admin_info: AdminVmInfo,
	public_info: Option<VmInfo>,
	/// Response parked during a bulk update until the last VM reports in.
	pending: Option<VmInfoUpdate>,
}

/// Registry of live VMs plus the viewer sets receiving list updates: the
/// public VM list (with thumbnails) and the admin list.
#[derive(Default)]
pub struct VmRegistry {
	vms: HashMap<u32, VmEntry>,
	vm_list_viewers: HashMap<u64, Arc<Client>>,
	admin_viewers: HashMap<u64, Arc<Client>>,
	/// Framed `VmThumbnail` broadcast per VM.
	thumbnails: HashMap<u32, Bytes>,
	pending_requests: usize,
}

impl VmRegistry {
	pub fn insert(&mut self, vm: Arc<Vm>, name: String) {
		let id = vm.id;
		self.vms.insert(
			id,
			VmEntry {
				vm,
				admin_info: AdminVmInfo {
					id,
					name,
					status: vmhub_protocol::messages::VmStatus::Stopped as i32,
					online_users: 0,
				},
				public_info: None,
				pending: None,
			},
		);
	}

	pub fn get(&self, id: u32) -> Option<Arc<Vm>> {
		self.vms.get(&id).map(|entry| Arc::clone(&entry.vm))
	}

	/// Delete a VM: tear it down, drop it from both lists, tell viewers.
	pub fn remove(&mut self, id: u32) -> bool {
		let Some(entry) = self.vms.remove(&id) else {
			return false;
		};
		entry.vm.shutdown();
		self.thumbnails.remove(&id);

		self.broadcast_admin_list();
		self.broadcast_vm_list();
		true
	}

	// -- viewers ----------------------------------------------------------

	/// Public list viewer joins: current list plus all cached thumbnails,
	/// queued as one batch.
	pub fn add_vm_list_viewer(&mut self, client: Arc<Client>) {
		if let Ok(frame) = encode_shared_frame(&self.vm_list_message()) {
			client.queue_frame(frame);
		}
		for thumbnail in self.thumbnails.values() {
			client.queue_frame(thumbnail.clone());
		}
		self.vm_list_viewers.insert(client.conn_id, client);
	}

	pub fn remove_vm_list_viewer(&mut self, conn_id: u64) {
		self.vm_list_viewers.remove(&conn_id);
	}

	pub fn add_admin_viewer(&mut self, client: Arc<Client>) {
		client.queue_message(&self.admin_list_message());
		self.admin_viewers.insert(client.conn_id, client);
	}

	pub fn remove_admin_viewer(&mut self, conn_id: u64) {
		self.admin_viewers.remove(&conn_id);
	}

	pub fn send_admin_list(&self, client: &Client) {
		client.queue_message(&self.admin_list_message());
	}

	/// Broadcast a frame to admin viewers, optionally excluding the admin
	/// who triggered the change.
	pub fn broadcast_to_admin_viewers(&self, frame: Bytes, exclude: Option<u64>) {
		for (conn_id, viewer) in &self.admin_viewers {
			if Some(*conn_id) == exclude {
				continue;
			}
			viewer.queue_frame(frame.clone());
		}
	}

	// -- info updates -----------------------------------------------------

	/// Periodic tick: ask every VM for fresh info. Responses hop back to
	/// the registry owner; the lists rebuild atomically once the last VM
	/// answers. A tick that lands while an update is in flight is skipped.
	pub fn update_vm_info_list(&mut self, owner: &Owner<VmRegistry>) {
		if self.pending_requests > 0 || self.vms.is_empty() {
			return;
		}
		self.pending_requests = self.vms.len();

		for entry in self.vms.values() {
			let callback = owner.wrap(|registry: &mut VmRegistry, update: VmInfoUpdate| {
				registry.finish_bulk_entry(update);
			});
			entry.vm.produce_info(callback);
		}
	}

	fn finish_bulk_entry(&mut self, update: VmInfoUpdate) {
		let vm_id = update.vm_id;
		self.cache_thumbnail(vm_id, update.thumbnail.as_deref());

		if let Some(entry) = self.vms.get_mut(&vm_id) {
			entry.pending = Some(update);
		}
		// A VM deleted mid-update still counts toward completion.
		self.pending_requests = self.pending_requests.saturating_sub(1);
		if self.pending_requests > 0 {
			return;
		}

		for entry in self.vms.values_mut() {
			if let Some(update) = entry.pending.take() {
				entry.admin_info = update.admin_info;
				entry.public_info = update.public_info;
			}
		}

		self.broadcast_admin_list();
		let Ok(list_frame) = encode_shared_frame(&self.vm_list_message()) else {
			return;
		};
		for viewer in self.vm_list_viewers.values() {
			viewer.queue_frame(list_frame.clone());
			for thumbnail in self.thumbnails.values() {
				viewer.queue_frame(thumbnail.clone());
			}
		}
	}

	/// Out-of-band update for one VM (config change, power change). If a
	/// bulk update is in flight the response is parked for it; otherwise
	/// both lists are patched element-wise.
	pub fn update_single_vm(&mut self, vm_id: u32, owner: &Owner<VmRegistry>) {
		let Some(entry) = self.vms.get(&vm_id) else {
			return;
		};
		let callback = owner.wrap(move |registry: &mut VmRegistry, update: VmInfoUpdate| {
			registry.finish_single_entry(update);
		});
		entry.vm.produce_info(callback);
	}

	fn finish_single_entry(&mut self, update: VmInfoUpdate) {
		let vm_id = update.vm_id;

		// A bulk update already holds a parked response for this VM:
		// replace it and let the bulk completion publish everything.
		if let Some(entry) = self.vms.get_mut(&vm_id)
			&& entry.pending.is_some()
		{
			entry.pending = Some(update);
			return;
		}

		self.cache_thumbnail(vm_id, update.thumbnail.as_deref());
		let Some(entry) = self.vms.get_mut(&vm_id) else {
			return;
		};
		entry.admin_info = update.admin_info;
		entry.public_info = update.public_info;

		self.broadcast_admin_list();
		self.broadcast_vm_list();
	}

	fn cache_thumbnail(&mut self, vm_id: u32, png: Option<&[u8]>) {
		let Some(png) = png else {
			return;
		};
		let message = ServerMessage::new(server_message::Payload::VmThumbnail(VmThumbnail {
			id: vm_id,
			png_bytes: png.to_vec(),
		}));
		match encode_shared_frame(&message) {
			Ok(frame) => {
				self.thumbnails.insert(vm_id, frame);
			}
			Err(e) => warn!(vm_id, error = %e, "failed to frame thumbnail"),
		}
	}

	fn vm_list_message(&self) -> ServerMessage {
		let mut vms: Vec<VmInfo> = self.vms.values().filter_map(|e| e.public_info.clone()).collect();
		vms.sort_by_key(|info| info.id);
		ServerMessage::new(server_message::Payload::VmListResponse(VmList { vms }))
	}

	fn admin_list_message(&self) -> ServerMessage {
		let mut vms: Vec<AdminVmInfo> = self.vms.values().map(|e| e.admin_info.clone()).collect();
		vms.sort_by_key(|info| info.id);
		ServerMessage::new(server_message::Payload::AdminVmListResponse(AdminVmList { vms }))
	}

	fn broadcast_admin_list(&self) {
		match encode_shared_frame(&self.admin_list_message()) {
			Ok(frame) => self.broadcast_to_admin_viewers(frame, None),
			Err(e) => warn!(error = %e, "failed to frame admin vm list"),
		}
	}

	fn broadcast_vm_list(&self) {
		let Ok(frame) = encode_shared_frame(&self.vm_list_message()) else {
			return;
		};
		for viewer in self.vm_list_viewers.values() {
			viewer.queue_frame(frame.clone());
		}
	}
}

#[cfg(test)]
mod registry_tests {
	use std::net::{IpAddr, Ipv4Addr};
	use std::time::Duration;

	use tokio::time::timeout;
	use vmhub_protocol::{DEFAULT_MAX_FRAME_SIZE, try_decode_frame_from_buffer};

	use super::*;
	use crate::server::db::Db;
	use crate::server::vm::{NullConnector, VmSettings};

	async fn registry_with_vm(name: &str) -> (Owner<VmRegistry>, Arc<Vm>) {
		let db = Db::connect("sqlite::memory:").await.expect("db");
		let settings = VmSettings {
			name: name.to_string(),
			..VmSettings::default()
		};
		let vm = Vm::spawn(1, settings, db, Arc::new(NullConnector));

		let owner = Owner::spawn("vm-registry", VmRegistry::default());
		let vm_for_insert = Arc::clone(&vm);
		let vm_name = name.to_string();
		owner.dispatch(move |registry| registry.insert(vm_for_insert, vm_name));
		(owner, vm)
	}

	fn decode(frame: Bytes) -> ServerMessage {
		let mut buf = bytes::BytesMut::from(frame.as_ref());
		try_decode_frame_from_buffer::<ServerMessage>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("decode")
			.expect("complete")
	}

	#[tokio::test]
	async fn bulk_update_rebuilds_and_broadcasts_the_admin_list() {
		let (owner, _vm) = registry_with_vm("lab").await;

		let (admin, mut rx) = Client::new(9, IpAddr::V4(Ipv4Addr::LOCALHOST));
		let admin_for_add = Arc::clone(&admin);
		owner.dispatch(move |registry| registry.add_admin_viewer(admin_for_add));

		// Initial admin list on join.
		let first = decode(timeout(Duration::from_secs(1), rx.recv()).await.expect("recv").expect("frame"));
		match first.payload {
			Some(server_message::Payload::AdminVmListResponse(list)) => {
				assert_eq!(list.vms.len(), 1);
				assert_eq!(list.vms[0].name, "lab");
			}
			other => panic!("expected admin vm list, got {other:?}"),
		}

		let owner_for_tick = owner.clone();
		owner.dispatch(move |registry| registry.update_vm_info_list(&owner_for_tick));

		let updated = decode(timeout(Duration::from_secs(1), rx.recv()).await.expect("recv").expect("frame"));
		match updated.payload {
			Some(server_message::Payload::AdminVmListResponse(list)) => {
				assert_eq!(list.vms[0].id, 1);
			}
			other => panic!("expected refreshed admin vm list, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn stopped_vms_stay_off_the_public_list() {
		let (owner, _vm) = registry_with_vm("lab").await;

		let (viewer, mut rx) = Client::new(5, IpAddr::V4(Ipv4Addr::LOCALHOST));
		let viewer_for_add = Arc::clone(&viewer);
		owner.dispatch(move |registry| registry.add_vm_list_viewer(viewer_for_add));

		let list = decode(timeout(Duration::from_secs(1), rx.recv()).await.expect("recv").expect("frame"));
		match list.payload {
			Some(server_message::Payload::VmListResponse(list)) => assert!(list.vms.is_empty()),
			other => panic!("expected vm list, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn removing_a_vm_updates_both_lists() {
		let (owner, _vm) = registry_with_vm("lab").await;

		let (admin, mut rx) = Client::new(9, IpAddr::V4(Ipv4Addr::LOCALHOST));
		let admin_for_add = Arc::clone(&admin);
		owner.dispatch(move |registry| registry.add_admin_viewer(admin_for_add));
		rx.recv().await.expect("initial list");

		let removed = timeout(Duration::from_secs(1), owner.query(|registry| registry.remove(1)))
			.await
			.expect("query")
			.expect("owner alive");
		assert!(removed);

		let list = decode(timeout(Duration::from_secs(1), rx.recv()).await.expect("recv").expect("frame"));
		match list.payload {
			Some(server_message::Payload::AdminVmListResponse(list)) => assert!(list.vms.is_empty()),
			other => panic!("expected admin vm list, got {other:?}"),
		}
	}
}
