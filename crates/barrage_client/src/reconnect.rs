#![forbid(unsafe_code)]

//! Bounded-backoff reconnection state machine.
//!
//! The controller is pure state; the client supervisor drives it. One
//! retry sequence exists at a time (the supervisor loop is the sequence),
//! and exhaustion is terminal and reported exactly once.

use std::time::Duration;

/// Reconnection configuration (externally supplied).
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
	pub enabled: bool,
	pub max_attempts: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
	pub exponential: bool,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			enabled: true,
			max_attempts: 5,
			base_delay: Duration::from_secs(1),
			max_delay: Duration::from_secs(60),
			exponential: true,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
	Idle,
	BackingOff,
	Attempting,
	/// Terminal: the retry budget is spent.
	Exhausted,
}

/// What the supervisor should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
	Retry {
		attempt: u32,
		delay: Duration,
	},
	GiveUp {
		attempts: u32,
	},
	Disabled,
}

#[derive(Debug)]
pub struct ReconnectController {
	policy: ReconnectPolicy,
	attempt: u32,
	phase: ReconnectPhase,
}

impl ReconnectController {
	pub fn new(policy: ReconnectPolicy) -> Self {
		Self {
			policy,
			attempt: 0,
			phase: ReconnectPhase::Idle,
		}
	}

	pub fn phase(&self) -> ReconnectPhase {
		self.phase
	}

	pub fn attempt(&self) -> u32 {
		self.attempt
	}

	/// A connect is in flight.
	pub fn on_attempt(&mut self) {
		if self.phase != ReconnectPhase::Exhausted {
			self.phase = ReconnectPhase::Attempting;
		}
	}

	/// The session reached Connected: the budget resets in full.
	pub fn on_success(&mut self) {
		self.attempt = 0;
		self.phase = ReconnectPhase::Idle;
	}

	/// The session was lost or a connect attempt failed; decide whether to
	/// back off and retry or to give up.
	pub fn next_retry(&mut self) -> ReconnectDecision {
		if !self.policy.enabled {
			self.phase = ReconnectPhase::Idle;
			return ReconnectDecision::Disabled;
		}
		if self.phase == ReconnectPhase::Exhausted || self.attempt >= self.policy.max_attempts {
			self.phase = ReconnectPhase::Exhausted;
			return ReconnectDecision::GiveUp { attempts: self.attempt };
		}

		self.attempt = self.attempt.saturating_add(1);
		self.phase = ReconnectPhase::BackingOff;
		ReconnectDecision::Retry {
			attempt: self.attempt,
			delay: self.delay_for(self.attempt),
		}
	}

	fn delay_for(&self, attempt: u32) -> Duration {
		if !self.policy.exponential {
			return self.policy.base_delay.min(self.policy.max_delay);
		}
		let pow = attempt.min(16);
		let ms = self.policy.base_delay.as_millis().saturating_mul(1u128 << pow);
		let delay = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
		delay.min(self.policy.max_delay).max(self.policy.base_delay)
	}
}
