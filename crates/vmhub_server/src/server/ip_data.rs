#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use crate::server::exec::Owner;

/// Connection accounting for one remote address.
#[derive(Default)]
pub struct IpData {
	pub connections: u32,
}

impl IpData {
	/// Count a new connection; returns false when the cap is exceeded.
	/// The count is incremented either way, the caller's disconnect path
	/// balances it.
	pub fn try_admit(&mut self, max_enabled: bool, max_connections: u32) -> bool {
		self.connections += 1;
		!(max_enabled && self.connections > max_connections)
	}

	pub fn release(&mut self) {
		if self.connections > 0 {
			self.connections -= 1;
		}
	}
}

/// Registry of per-IP owners. Each address gets its own serialization
/// owner so admissions from the same address never race.
#[derive(Default)]
pub struct IpRegistry {
	entries: HashMap<[u8; 16], Arc<Owner<IpData>>>,
}

impl IpRegistry {
	pub fn entry(&mut self, ip_bytes: [u8; 16]) -> Arc<Owner<IpData>> {
		Arc::clone(
			self.entries
				.entry(ip_bytes)
				.or_insert_with(|| Arc::new(Owner::spawn("ip-data", IpData::default()))),
		)
	}
}

#[cfg(test)]
mod ip_data_tests {
	use super::*;

	#[test]
	fn admission_respects_the_cap() {
		let mut data = IpData::default();
		assert!(data.try_admit(true, 2));
		assert!(data.try_admit(true, 2));
		assert!(!data.try_admit(true, 2));

		// Disabled cap admits regardless of count.
		assert!(data.try_admit(false, 2));
	}

	#[test]
	fn release_never_underflows() {
		let mut data = IpData::default();
		data.release();
		assert_eq!(data.connections, 0);

		assert!(data.try_admit(true, 8));
		data.release();
		data.release();
		assert_eq!(data.connections, 0);
	}

	#[tokio::test]
	async fn registry_reuses_per_ip_owners() {
		let mut registry = IpRegistry::default();
		let a = registry.entry([1; 16]);
		let b = registry.entry([1; 16]);
		assert!(Arc::ptr_eq(&a, &b));
	}
}
