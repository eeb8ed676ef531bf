#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// What a state transition asks the surrounding VM to do. `Rearm` carries
/// the epoch the new deadline belongs to; a timer that fires with a stale
/// epoch is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnTransition {
	/// Nothing changed.
	None,
	/// The queue changed but the deadline did not; broadcast only.
	QueueChanged,
	/// A new holder took the turn; arm a timer for `deadline`.
	Rearm { epoch: u64, deadline: Instant },
	/// The turn state went idle; broadcast and cancel timers.
	Idle,
	/// The timer froze or thawed.
	PauseChanged,
}

#[derive(Debug)]
enum Phase {
	Idle,
	Active { holder: u64, deadline: Instant },
	Paused { holder: u64, remaining: Duration },
}

/// FIFO turn queue for one VM. Pure state machine: the caller supplies the
/// clock and arms timers from the returned transitions, so expiry is
/// testable without waiting.
pub struct TurnState {
	phase: Phase,
	queue: VecDeque<u64>,
	epoch: u64,
}

impl Default for TurnState {
	fn default() -> Self {
		Self {
			phase: Phase::Idle,
			queue: VecDeque::new(),
			epoch: 0,
		}
	}
}

impl TurnState {
	pub fn holder(&self) -> Option<u64> {
		match self.phase {
			Phase::Idle => None,
			Phase::Active { holder, .. } | Phase::Paused { holder, .. } => Some(holder),
		}
	}

	pub fn is_paused(&self) -> bool {
		matches!(self.phase, Phase::Paused { .. })
	}

	/// Holder first, then the queue in order.
	pub fn line_up(&self) -> Vec<u64> {
		let mut users = Vec::with_capacity(self.queue.len() + 1);
		users.extend(self.holder());
		users.extend(self.queue.iter().copied());
		users
	}

	pub fn remaining(&self, now: Instant) -> Duration {
		match self.phase {
			Phase::Idle => Duration::ZERO,
			Phase::Active { deadline, .. } => deadline.saturating_duration_since(now),
			Phase::Paused { remaining, .. } => remaining,
		}
	}

	pub fn request(&mut self, user: u64, now: Instant, turn_time: Duration) -> TurnTransition {
		match self.phase {
			Phase::Idle => self.grant(user, now, turn_time),
			Phase::Active { holder, .. } | Phase::Paused { holder, .. } => {
				if holder == user || self.queue.contains(&user) {
					return TurnTransition::None;
				}
				self.queue.push_back(user);
				TurnTransition::QueueChanged
			}
		}
	}

	/// Deadline elapsed. Stale epochs (a timer armed for an already
	/// replaced deadline) are ignored.
	pub fn expire(&mut self, epoch: u64, now: Instant, turn_time: Duration) -> TurnTransition {
		if epoch != self.epoch || !matches!(self.phase, Phase::Active { .. }) {
			return TurnTransition::None;
		}
		self.advance(now, turn_time)
	}

	/// Voluntary end; only the current holder may end the turn.
	pub fn end_turn(&mut self, user: u64, now: Instant, turn_time: Duration) -> TurnTransition {
		if self.holder() != Some(user) {
			return TurnTransition::None;
		}
		self.advance(now, turn_time)
	}

	/// Admin skip: end whoever holds the turn.
	pub fn skip(&mut self, now: Instant, turn_time: Duration) -> TurnTransition {
		if self.holder().is_none() {
			return TurnTransition::None;
		}
		self.advance(now, turn_time)
	}

	/// Channel removal: purge the user from both holder and queue.
	pub fn remove(&mut self, user: u64, now: Instant, turn_time: Duration) -> TurnTransition {
		if self.holder() == Some(user) {
			return self.advance(now, turn_time);
		}
		let before = self.queue.len();
		self.queue.retain(|&queued| queued != user);
		if self.queue.len() != before {
			TurnTransition::QueueChanged
		} else {
			TurnTransition::None
		}
	}

	pub fn pause(&mut self, now: Instant) -> TurnTransition {
		if let Phase::Active { holder, deadline } = self.phase {
			self.phase = Phase::Paused {
				holder,
				remaining: deadline.saturating_duration_since(now),
			};
			// Invalidate the armed timer.
			self.epoch += 1;
			return TurnTransition::PauseChanged;
		}
		TurnTransition::None
	}

	pub fn resume(&mut self, now: Instant) -> TurnTransition {
		if let Phase::Paused { holder, remaining } = self.phase {
			self.epoch += 1;
			let deadline = now + remaining;
			self.phase = Phase::Active { holder, deadline };
			return TurnTransition::Rearm {
				epoch: self.epoch,
				deadline,
			};
		}
		TurnTransition::None
	}

	fn advance(&mut self, now: Instant, turn_time: Duration) -> TurnTransition {
		match self.queue.pop_front() {
			Some(next) => self.grant(next, now, turn_time),
			None => {
				self.phase = Phase::Idle;
				self.epoch += 1;
				TurnTransition::Idle
			}
		}
	}

	fn grant(&mut self, user: u64, now: Instant, turn_time: Duration) -> TurnTransition {
		self.epoch += 1;
		let deadline = now + turn_time;
		self.phase = Phase::Active { holder: user, deadline };
		TurnTransition::Rearm {
			epoch: self.epoch,
			deadline,
		}
	}
}

#[cfg(test)]
mod turns_tests {
	use super::*;

	const TT: Duration = Duration::from_secs(20);

	#[test]
	fn request_grants_when_idle_and_queues_otherwise() {
		let mut turns = TurnState::default();
		let now = Instant::now();

		assert!(matches!(turns.request(1, now, TT), TurnTransition::Rearm { .. }));
		assert_eq!(turns.holder(), Some(1));

		assert_eq!(turns.request(2, now, TT), TurnTransition::QueueChanged);
		assert_eq!(turns.request(3, now, TT), TurnTransition::QueueChanged);
		// Re-requests from the holder or queued users are no-ops.
		assert_eq!(turns.request(1, now, TT), TurnTransition::None);
		assert_eq!(turns.request(2, now, TT), TurnTransition::None);
		assert_eq!(turns.line_up(), vec![1, 2, 3]);
	}

	#[test]
	fn holder_disconnect_then_expiry_walks_the_queue() {
		let mut turns = TurnState::default();
		let now = Instant::now();

		turns.request(1, now, TT);
		turns.request(2, now, TT);
		turns.request(3, now, TT);

		// Holder disconnects: next in line takes over.
		let granted = turns.remove(1, now, TT);
		let TurnTransition::Rearm { epoch, .. } = granted else {
			panic!("expected grant, got {granted:?}");
		};
		assert_eq!(turns.holder(), Some(2));

		// Deadline elapses: last queued user takes over, queue drains.
		assert!(matches!(
			turns.expire(epoch, now + TT, TT),
			TurnTransition::Rearm { .. }
		));
		assert_eq!(turns.holder(), Some(3));
		assert_eq!(turns.line_up(), vec![3]);

		assert!(matches!(
			turns.end_turn(3, now + TT, TT),
			TurnTransition::Idle
		));
		assert_eq!(turns.holder(), None);
		assert!(turns.line_up().is_empty());
	}

	#[test]
	fn stale_timer_epochs_are_ignored() {
		let mut turns = TurnState::default();
		let now = Instant::now();

		let TurnTransition::Rearm { epoch: first, .. } = turns.request(1, now, TT) else {
			panic!("expected grant");
		};
		turns.request(2, now, TT);
		turns.end_turn(1, now, TT);

		assert_eq!(turns.expire(first, now + TT, TT), TurnTransition::None);
		assert_eq!(turns.holder(), Some(2));
	}

	#[test]
	fn pause_freezes_the_remaining_time() {
		let mut turns = TurnState::default();
		let now = Instant::now();

		turns.request(1, now, TT);
		assert_eq!(turns.pause(now + Duration::from_secs(5)), TurnTransition::PauseChanged);
		assert!(turns.is_paused());
		assert_eq!(turns.remaining(now + Duration::from_secs(60)), Duration::from_secs(15));

		let resumed_at = now + Duration::from_secs(100);
		let TurnTransition::Rearm { deadline, .. } = turns.resume(resumed_at) else {
			panic!("expected rearm");
		};
		assert_eq!(deadline, resumed_at + Duration::from_secs(15));
		assert!(!turns.is_paused());
	}

	#[test]
	fn only_the_holder_may_end_the_turn() {
		let mut turns = TurnState::default();
		let now = Instant::now();

		turns.request(1, now, TT);
		turns.request(2, now, TT);

		assert_eq!(turns.end_turn(2, now, TT), TurnTransition::None);
		assert_eq!(turns.holder(), Some(1));
	}
}
