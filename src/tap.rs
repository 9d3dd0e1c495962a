// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! The JTAG TAP state graph, and the driver's model of where the target's
//! TAP currently sits in it.

use crate::error::UlinkError;

/// The sixteen states of the standard JTAG TAP state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapState
{
	Reset,
	Idle,
	DrSelect,
	DrCapture,
	DrShift,
	DrExit1,
	DrPause,
	DrExit2,
	DrUpdate,
	IrSelect,
	IrCapture,
	IrShift,
	IrExit1,
	IrPause,
	IrExit2,
	IrUpdate,
}

/// A TMS bit sequence that walks the TAP from one settled state to another.
///
/// Bits are clocked out LSB first, so the first TMS value driven is bit 0 of
/// `sequence`. No pair of settled states is further than 7 clocks apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmsSequence
{
	pub sequence: u8,
	pub length: u8,
}

const fn steps(sequence: u8, length: u8) -> TmsSequence
{
	TmsSequence { sequence, length }
}

/// TMS walks between the six states a scan can settle in, indexed as
/// Reset, Idle, DrShift, DrPause, IrShift, IrPause in both dimensions.
///
/// Entering Reset always drives five ones regardless of the starting point,
/// so that column is uniform. The identity entries (other than Reset) are
/// empty walks.
const TMS_WALKS: [[TmsSequence; 6]; 6] = [
	// from Reset
	[
		steps(0b11111, 5),
		steps(0b0, 1),
		steps(0b0010, 4),
		steps(0b01010, 5),
		steps(0b00110, 5),
		steps(0b010110, 6),
	],
	// from Idle
	[
		steps(0b11111, 5),
		steps(0b0, 0),
		steps(0b001, 3),
		steps(0b0101, 4),
		steps(0b0011, 4),
		steps(0b01011, 5),
	],
	// from DrShift
	[
		steps(0b11111, 5),
		steps(0b011, 3),
		steps(0b0, 0),
		steps(0b01, 2),
		steps(0b001111, 6),
		steps(0b0101111, 7),
	],
	// from DrPause
	[
		steps(0b11111, 5),
		steps(0b011, 3),
		steps(0b01, 2),
		steps(0b0, 0),
		steps(0b001111, 6),
		steps(0b0101111, 7),
	],
	// from IrShift
	[
		steps(0b11111, 5),
		steps(0b011, 3),
		steps(0b00111, 5),
		steps(0b010111, 6),
		steps(0b0, 0),
		steps(0b01, 2),
	],
	// from IrPause
	[
		steps(0b11111, 5),
		steps(0b011, 3),
		steps(0b00111, 5),
		steps(0b010111, 6),
		steps(0b01, 2),
		steps(0b0, 0),
	],
];

impl TapState
{
	/// Whether the TAP can rest in this state indefinitely with TMS held low.
	/// These are the only states a request may name as its end state.
	pub fn is_stable(self) -> bool
	{
		matches!(self, Self::Reset | Self::Idle | Self::DrPause | Self::IrPause)
	}

	/// Index into the TMS walk table, for the states a walk may start or
	/// finish in. The shift states are walkable but not stable - a scan
	/// passes through them but may not end there.
	fn walk_index(self) -> Option<usize>
	{
		match self {
			Self::Reset => Some(0),
			Self::Idle => Some(1),
			Self::DrShift => Some(2),
			Self::DrPause => Some(3),
			Self::IrShift => Some(4),
			Self::IrPause => Some(5),
			_ => None,
		}
	}
}

/// The TMS bit sequence that drives the TAP from `from` to `to`.
///
/// Both states must be ones a walk can settle in; asking for a path from or
/// to a transient state is a programmer error surfaced as `InvalidRequest`.
pub fn tms_walk(from: TapState, to: TapState) -> Result<TmsSequence, UlinkError>
{
	let from_index = from
		.walk_index()
		.ok_or_else(|| UlinkError::InvalidRequest(format!("no TMS walk starts in transient state {from:?}")))?;
	let to_index = to
		.walk_index()
		.ok_or_else(|| UlinkError::InvalidRequest(format!("no TMS walk ends in transient state {to:?}")))?;
	Ok(TMS_WALKS[from_index][to_index])
}

/// Length in clocks of the TMS walk from `from` to `to`.
pub fn tms_walk_len(from: TapState, to: TapState) -> Result<u8, UlinkError>
{
	Ok(tms_walk(from, to)?.length)
}

/// Tracks where the target's TAP is, and where the request currently being
/// translated wants it to finish. One follower exists per driver instance;
/// the translators are its only writers.
#[derive(Debug, Clone, Copy)]
pub struct TapFollower
{
	current: TapState,
	end: TapState,
}

impl Default for TapFollower
{
	fn default() -> Self
	{
		// Nothing is known about the target until the first TLR, so model it
		// as freshly reset
		Self {
			current: TapState::Reset,
			end: TapState::Reset,
		}
	}
}

impl TapFollower
{
	pub fn new() -> Self
	{
		Self::default()
	}

	/// The state the TAP is in after all commands emitted so far.
	pub fn state(&self) -> TapState
	{
		self.current
	}

	/// The state the request being translated wants to finish in.
	pub fn end_state(&self) -> TapState
	{
		self.end
	}

	/// Record the end state requested by the caller. Only stable states can
	/// be held across commands.
	pub fn set_end_state(&mut self, state: TapState) -> Result<(), UlinkError>
	{
		if !state.is_stable() {
			return Err(UlinkError::InvalidRequest(format!(
				"{state:?} is not a stable TAP state and cannot end a request"
			)));
		}
		self.end = state;
		Ok(())
	}

	/// Record that emitted commands have moved the TAP to `state`.
	pub fn move_to(&mut self, state: TapState)
	{
		self.current = state;
	}

	/// Record that the TAP has arrived in the requested end state.
	pub fn settle(&mut self)
	{
		self.current = self.end;
	}

	/// Record a test-logic-reset: wherever the TAP was, it is in Reset now.
	pub fn force_reset(&mut self)
	{
		self.current = TapState::Reset;
		self.end = TapState::Reset;
	}
}
