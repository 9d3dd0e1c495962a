// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! The command pipeline: translating abstract JTAG requests into wire
//! commands, batching them against the 64 byte packet budget, running the
//! bulk exchange, and handing captured TDO bits back to their requests.

use std::path::Path;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::error::UlinkError;
use crate::firmware::FirmwareImage;
use crate::jtag::{JtagRequest, ScanDirection, ScanRequest};
use crate::probe::{ProbeLink, UlinkProbe};
use crate::protocol::{
	Command, CommandBatch, CommandId, LedControl, MAX_PACKET, MAX_SCAN_CHUNK, Signal, SignalState, capture_buffer,
};
use crate::tap::{TapFollower, TapState, tms_walk};

/// Timeout applied to every bulk transfer outside of init.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Init probes with a short timeout so a wedged adapter is caught quickly
/// instead of stalling for five seconds.
const INIT_TIMEOUT: Duration = Duration::from_millis(200);

/// Payload of the `test` command; the firmware accepts nothing else.
const TEST_PATTERN: u8 = 0xaa;

/// One TCK speed the firmware can be configured for: the delay byte for each
/// of the three delay loops, and the resulting clock rate.
struct TckSpeed
{
	khz: u32,
	delay_scan: u8,
	delay_tck: u8,
	delay_tms: u8,
}

/// The two rates the delay loops are calibrated for. Index 0 runs the fast
/// command handlers with no delays; everything else needs the slow handlers.
const SPEED_TABLE: [TckSpeed; 2] = [
	TckSpeed {
		khz: 150,
		delay_scan: 0,
		delay_tck: 0,
		delay_tms: 0,
	},
	TckSpeed {
		khz: 100,
		delay_scan: 5,
		delay_tck: 5,
		delay_tms: 5,
	},
];

/// Host-side driver for a ULINK adapter running the OpenULINK firmware.
///
/// One instance owns one adapter, one pending command batch and one TAP
/// follower; everything runs synchronously on the caller's thread.
pub struct UlinkDriver
{
	link: Box<dyn ProbeLink>,
	batch: CommandBatch,
	tap: TapFollower,
	timeout: Duration,
	/// Route scans and TMS walks through the firmware's delayed handlers
	/// when a reduced TCK rate is configured.
	slow_commands: bool,
	/// Last state reported by a `get-signals` command.
	signals: Option<SignalState>,
}

impl UlinkDriver
{
	/// Open the adapter, downloading `firmware` first if it is not yet
	/// running OpenULINK, and run the init handshake.
	pub fn open(firmware: Option<&Path>) -> Result<Self, UlinkError>
	{
		let mut probe = UlinkProbe::open()?;
		if !probe.has_firmware() {
			let path = firmware.ok_or_else(|| {
				UlinkError::Firmware("adapter needs an OpenULINK firmware image and none was given".into())
			})?;
			let image = FirmwareImage::from_path(path)?;
			probe = probe.bootstrap_firmware(&image)?;
		}

		let mut driver = Self::with_link(Box::new(probe));
		driver.init()?;
		Ok(driver)
	}

	/// Build a driver over an already-open link. The TAP is modelled as
	/// freshly reset; callers wanting certainty should queue a
	/// [`JtagRequest::ResetTap`] first.
	pub fn with_link(link: Box<dyn ProbeLink>) -> Self
	{
		Self {
			link,
			batch: CommandBatch::new(),
			tap: TapFollower::new(),
			timeout: DEFAULT_TIMEOUT,
			slow_commands: false,
			signals: None,
		}
	}

	/// Check the adapter is alive and report its signal state.
	///
	/// A host that crashed mid-batch leaves the adapter with a reply packet
	/// nobody collected, which blocks its interpreter. If the liveness probe
	/// fails, draining that one stale packet usually recovers the adapter;
	/// only a failure of the drain too is fatal.
	pub fn init(&mut self) -> Result<(), UlinkError>
	{
		let probe = [CommandId::Test as u8, TEST_PATTERN];
		match self.link.write_packet(&probe, INIT_TIMEOUT) {
			Ok(written) if written == probe.len() => {},
			Ok(written) => {
				return Err(UlinkError::Protocol(format!(
					"liveness probe truncated to {written} of {} bytes",
					probe.len()
				)));
			},
			Err(error) => {
				warn!("Adapter did not accept the liveness probe, draining a stranded reply");
				let mut stale = [0u8; MAX_PACKET];
				self.link.read_packet(&mut stale, INIT_TIMEOUT).map_err(|_| error)?;
				debug!("Drained a stale reply packet from a previous session");
			},
		}

		let signals = self.read_signal_state()?;
		info!("ULINK signals: {signals}");
		Ok(())
	}

	/// The firmware identity of the underlying link, where it has one.
	pub fn identity(&self) -> Option<String>
	{
		self.link.identity()
	}

	pub fn tap(&self) -> &TapFollower
	{
		&self.tap
	}

	pub fn tap_mut(&mut self) -> &mut TapFollower
	{
		&mut self.tap
	}

	/// Run a queue of abstract requests against the adapter.
	///
	/// Requests are translated and executed strictly in order; the first
	/// failure aborts everything after it and drops the pending batch.
	/// Capturing scans have their `captured` buffers filled on return.
	pub fn execute_queue(&mut self, requests: &mut [JtagRequest]) -> Result<(), UlinkError>
	{
		let result = self.run_queue(requests);
		if result.is_err() {
			// Whatever was pending is unsendable now; the next queue must
			// start from a clean batch
			self.batch = CommandBatch::new();
		}
		result
	}

	fn run_queue(&mut self, requests: &mut [JtagRequest]) -> Result<(), UlinkError>
	{
		for index in 0..requests.len() {
			let commands = self.translate(&requests[index], index)?;
			for command in commands {
				self.append(requests, command)?;
			}
		}
		self.flush(requests)
	}

	/// Append one command, flushing the pending batch first if the command
	/// would overflow either direction's packet budget.
	fn append(&mut self, requests: &mut [JtagRequest], command: Command) -> Result<(), UlinkError>
	{
		if !self.batch.fits(&command) {
			self.flush(requests)?;
		}
		self.batch.push(command)
	}

	/// Execute the pending batch: one bulk OUT, one bulk IN iff any command
	/// expects reply bytes, then distribute what came back.
	fn flush(&mut self, requests: &mut [JtagRequest]) -> Result<(), UlinkError>
	{
		if self.batch.is_empty() {
			return Ok(());
		}
		let mut batch = std::mem::take(&mut self.batch);

		let mut packet = [0u8; MAX_PACKET];
		let length = batch.serialize(&mut packet);
		trace!(
			"Executing batch of {} commands: {} bytes out, {} bytes expected back",
			batch.len(),
			length,
			batch.reply_len()
		);

		let written = self.link.write_packet(&packet[..length], self.timeout)?;
		if written != length {
			return Err(UlinkError::Protocol(format!(
				"bulk write truncated to {written} of {length} bytes"
			)));
		}

		let expected = batch.reply_len();
		if expected > 0 {
			let mut reply = [0u8; MAX_PACKET];
			let received = self.link.read_packet(&mut reply[..expected], self.timeout)?;
			if received != expected {
				return Err(UlinkError::Protocol(format!(
					"bulk read returned {received} of {expected} expected bytes"
				)));
			}
			batch.scatter(&reply[..expected])?;
		}

		self.distribute(batch, requests)
	}

	/// Walk the executed batch and deliver captured data to wherever it
	/// belongs.
	fn distribute(&mut self, batch: CommandBatch, requests: &mut [JtagRequest]) -> Result<(), UlinkError>
	{
		for command in batch.into_commands() {
			if !command.needs_postprocessing() {
				continue;
			}
			match command.id() {
				CommandId::ScanIn | CommandId::SlowScanIn | CommandId::ScanIo | CommandId::SlowScanIo => {
					let index = command
						.origin()
						.ok_or_else(|| UlinkError::Protocol("scan command with no originating request".into()))?;
					let Some(JtagRequest::Scan(scan)) = requests.get_mut(index) else {
						return Err(UlinkError::Protocol(format!(
							"scan result cannot be delivered: request {index} is not a scan"
						)));
					};
					let captured = command
						.take_capture()
						.ok_or_else(|| UlinkError::Protocol("finished scan chunk owns no capture buffer".into()))?;
					scan.captured = Some(captured);
				},
				CommandId::GetSignals => {
					let bytes = command
						.take_capture()
						.ok_or_else(|| UlinkError::Protocol("get-signals reply went missing".into()))?;
					self.signals = Some(SignalState {
						input: Signal::from(bytes[0]),
						output: Signal::from(bytes[1]),
					});
				},
				_ => {},
			}
		}
		Ok(())
	}

	/// Translate one abstract request into its wire commands. TAP follower
	/// bookkeeping happens here, in emission order.
	fn translate(&mut self, request: &JtagRequest, index: usize) -> Result<Vec<Command>, UlinkError>
	{
		match request {
			JtagRequest::Scan(scan) => self.translate_scan(scan, index),
			JtagRequest::ResetTap => self.translate_tap_reset(),
			&JtagRequest::RunTest { cycles, end_state } => self.translate_run_test(cycles, end_state),
			&JtagRequest::SetReset { trst, srst } => self.translate_set_reset(trst, srst),
			&JtagRequest::Sleep { microseconds } => self.translate_sleep(microseconds),
			JtagRequest::MovePath { states } => {
				// Would need arbitrary neighbour-state TMS walks; the
				// command set has no encoding for that
				if !states.is_empty() {
					warn!("Discarding pathmove through {} states: not supported by OpenULINK", states.len());
				}
				Ok(Vec::new())
			},
		}
	}

	/// Split a scan into chunks of at most [`MAX_SCAN_CHUNK`] TDI/TDO bytes.
	///
	/// The first chunk carries the TMS walk from the current state into the
	/// shift state, the last the walk out to the requested end state. In
	/// between, chunks park the TAP in the register's pause state and resume
	/// from it, so the shift is seamless across packet boundaries.
	fn translate_scan(&mut self, scan: &ScanRequest, index: usize) -> Result<Vec<Command>, UlinkError>
	{
		if scan.bit_count == 0 {
			return Err(UlinkError::InvalidRequest("scan of zero bits".into()));
		}
		let byte_count = scan.bit_count.div_ceil(8);
		let bits_last_byte = ((scan.bit_count - 1) % 8 + 1) as u8;

		let tdi = if scan.direction.emits() {
			let data = scan
				.tdi
				.as_deref()
				.ok_or_else(|| UlinkError::InvalidRequest("scan emits TDI but carries no data".into()))?;
			if data.len() < byte_count {
				return Err(UlinkError::InvalidRequest(format!(
					"scan of {} bits needs {byte_count} TDI bytes, got {}",
					scan.bit_count,
					data.len()
				)));
			}
			Some(data)
		} else {
			None
		};

		let shift_state = scan.register.shift_state();
		let pause_state = scan.register.pause_state();
		self.tap.set_end_state(scan.end_state)?;

		// The four TMS walks a split scan can need: in, out, and the
		// pause/resume pair used at chunk boundaries
		let enter = tms_walk(self.tap.state(), shift_state)?;
		let leave = tms_walk(shift_state, scan.end_state)?;
		let pause = tms_walk(shift_state, pause_state)?;
		let resume = tms_walk(pause_state, shift_state)?;

		let capture = if scan.direction.captures() {
			Some(capture_buffer(byte_count))
		} else {
			None
		};
		let id = scan_command_id(scan.direction, self.slow_commands);

		trace!(
			"Scan of {} bits through {:?} as {} chunk(s) of {:?}",
			scan.bit_count,
			scan.register,
			byte_count.div_ceil(MAX_SCAN_CHUNK),
			id
		);

		let mut commands = Vec::with_capacity(byte_count.div_ceil(MAX_SCAN_CHUNK));
		let mut offset = 0usize;
		while offset < byte_count {
			let remaining = byte_count - offset;
			let chunk = remaining.min(MAX_SCAN_CHUNK);
			let last = remaining <= MAX_SCAN_CHUNK;
			let begin_walk = if offset == 0 { enter } else { resume };
			let end_walk = if last { leave } else { pause };

			let mut payload = Vec::with_capacity(crate::protocol::SCAN_HEADER_LEN + chunk);
			payload.push(chunk as u8);
			payload.push(if last { bits_last_byte } else { 8 });
			payload.push((begin_walk.length << 4) | end_walk.length);
			payload.push(begin_walk.sequence);
			payload.push(end_walk.sequence);
			if let Some(data) = tdi {
				payload.extend_from_slice(&data[offset..offset + chunk]);
			}

			let mut command = Command::new(id).with_payload(&payload)?;
			if let Some(buffer) = &capture {
				command = command.with_capture(buffer.clone(), offset..offset + chunk, last)?;
				if last {
					command = command.postprocessed().with_origin(index);
				}
			}
			commands.push(command);
			offset += chunk;
		}

		self.tap.settle();
		Ok(commands)
	}

	/// Five clocks with TMS high put the TAP in Test-Logic-Reset from
	/// anywhere.
	fn translate_tap_reset(&mut self) -> Result<Vec<Command>, UlinkError>
	{
		debug!("Queueing test-logic-reset");
		let command = self.clock_tms_command(5, 0xff)?;
		self.tap.force_reset();
		Ok(vec![command])
	}

	fn translate_run_test(&mut self, cycles: u16, end_state: TapState) -> Result<Vec<Command>, UlinkError>
	{
		self.tap.set_end_state(end_state)?;
		let mut commands = Vec::new();

		if self.tap.state() != TapState::Idle {
			let walk = tms_walk(self.tap.state(), TapState::Idle)?;
			commands.push(self.clock_tms_command(walk.length, walk.sequence)?);
			self.tap.move_to(TapState::Idle);
		}

		commands.push(Command::new(CommandId::ClockTck).with_payload(&cycles.to_le_bytes())?);

		if end_state != TapState::Idle {
			let walk = tms_walk(TapState::Idle, end_state)?;
			commands.push(self.clock_tms_command(walk.length, walk.sequence)?);
		}
		self.tap.settle();
		Ok(commands)
	}

	/// Drive TRST/SRST. The masks carry the signals in their logical sense;
	/// the inverting drivers sit between the MCU and the connector.
	fn translate_set_reset(&mut self, trst: bool, srst: bool) -> Result<Vec<Command>, UlinkError>
	{
		let mut clear = Signal::none();
		let mut assert = Signal::none();
		if trst {
			assert |= Signal::Trst;
		} else {
			clear |= Signal::Trst;
		}
		if srst {
			assert |= Signal::Reset;
		} else {
			clear |= Signal::Reset;
		}
		debug!("Queueing reset line change: TRST {trst}, SRST {srst}");

		let command = Command::new(CommandId::SetSignals).with_payload(&[clear.bits(), assert.bits()])?;
		if trst {
			// Holding TRST leaves the TAP in Test-Logic-Reset
			self.tap.force_reset();
		}
		Ok(vec![command])
	}

	/// Sleeps run on the adapter, in order with the rest of the stream. A
	/// host-side sleep would elapse while queued commands are still waiting
	/// to execute.
	fn translate_sleep(&mut self, microseconds: u32) -> Result<Vec<Command>, UlinkError>
	{
		if microseconds <= u16::MAX as u32 {
			let command = Command::new(CommandId::SleepUs).with_payload(&(microseconds as u16).to_le_bytes())?;
			return Ok(vec![command]);
		}

		let milliseconds = microseconds / 1000;
		if milliseconds > u16::MAX as u32 {
			return Err(UlinkError::InvalidRequest(format!(
				"sleep of {microseconds} us is longer than the adapter can time"
			)));
		}
		let remainder = (microseconds % 1000) as u16;

		let mut commands =
			vec![Command::new(CommandId::SleepMs).with_payload(&(milliseconds as u16).to_le_bytes())?];
		if remainder > 0 {
			commands.push(Command::new(CommandId::SleepUs).with_payload(&remainder.to_le_bytes())?);
		}
		Ok(commands)
	}

	fn clock_tms_command(&self, count: u8, sequence: u8) -> Result<Command, UlinkError>
	{
		let id = if self.slow_commands {
			CommandId::SlowClockTms
		} else {
			CommandId::ClockTms
		};
		Command::new(id).with_payload(&[count, sequence])
	}

	/// Ask the adapter for its current signal state.
	pub fn read_signal_state(&mut self) -> Result<SignalState, UlinkError>
	{
		let command = Command::new(CommandId::GetSignals)
			.with_capture(capture_buffer(2), 0..2, true)?
			.postprocessed();
		self.run_immediate(command)?;
		self.signals
			.ok_or_else(|| UlinkError::Protocol("get-signals produced no signal state".into()))
	}

	/// Switch the COM and RUN LEDs. `None` leaves a LED as it is.
	pub fn set_leds(&mut self, com: Option<bool>, run: Option<bool>) -> Result<(), UlinkError>
	{
		let mut control = LedControl::none();
		match com {
			Some(true) => control |= LedControl::ComOn,
			Some(false) => control |= LedControl::ComOff,
			None => {},
		}
		match run {
			Some(true) => control |= LedControl::RunOn,
			Some(false) => control |= LedControl::RunOff,
			None => {},
		}
		let command = Command::new(CommandId::SetLeds).with_payload(&[control.bits()])?;
		self.run_immediate(command)
	}

	/// Map a requested TCK rate to a speed table index.
	pub fn speed_from_khz(&self, khz: u32) -> Result<u16, UlinkError>
	{
		if khz == 0 {
			return Err(UlinkError::InvalidRequest(
				"adaptive clocking (RCLK) is not available on this adapter".into(),
			));
		}
		if khz > SPEED_TABLE[0].khz {
			return Err(UlinkError::InvalidRequest(format!(
				"TCK of {khz} kHz is beyond the adapter's {} kHz maximum",
				SPEED_TABLE[0].khz
			)));
		}
		// Everything below the full rate runs at the one calibrated slow rate
		if khz >= SPEED_TABLE[0].khz { Ok(0) } else { Ok(1) }
	}

	/// Configure the adapter's delay loops for a speed table entry.
	pub fn set_speed(&mut self, index: u16) -> Result<(), UlinkError>
	{
		let entry = SPEED_TABLE
			.get(index as usize)
			.ok_or_else(|| UlinkError::InvalidRequest(format!("speed index {index} is not in the delay table")))?;
		let command = Command::new(CommandId::ConfigureTckFreq)
			.with_payload(&[entry.delay_scan, entry.delay_tck, entry.delay_tms])?;
		self.run_immediate(command)?;

		// Non-zero delay loops only run in the slow command handlers
		self.slow_commands = index != 0;
		info!("TCK configured for {} kHz", entry.khz);
		Ok(())
	}

	/// The TCK rate a speed table index stands for.
	pub fn khz_from_speed(index: u16) -> Result<u32, UlinkError>
	{
		SPEED_TABLE
			.get(index as usize)
			.map(|entry| entry.khz)
			.ok_or_else(|| UlinkError::InvalidRequest(format!("speed index {index} is not in the delay table")))
	}

	/// Append a stand-alone command and execute it right away.
	fn run_immediate(&mut self, command: Command) -> Result<(), UlinkError>
	{
		let mut no_requests: [JtagRequest; 0] = [];
		let mut result = self.append(&mut no_requests, command);
		if result.is_ok() {
			result = self.flush(&mut no_requests);
		}
		if result.is_err() {
			self.batch = CommandBatch::new();
		}
		result
	}
}

fn scan_command_id(direction: ScanDirection, slow: bool) -> CommandId
{
	match (direction, slow) {
		(ScanDirection::In, false) => CommandId::ScanIn,
		(ScanDirection::In, true) => CommandId::SlowScanIn,
		(ScanDirection::Out, false) => CommandId::ScanOut,
		(ScanDirection::Out, true) => CommandId::SlowScanOut,
		(ScanDirection::InOut, false) => CommandId::ScanIo,
		(ScanDirection::InOut, true) => CommandId::SlowScanIo,
	}
}
