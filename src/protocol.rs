// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! The OpenULINK wire command language, and the batch builder that packs
//! commands into single bulk packets.
//!
//! The firmware parses exactly one 64 byte bulk packet at a time in each
//! direction, so a batch must keep both its outbound bytes (one id byte plus
//! payload per command) and its expected reply bytes within that budget.
//! Overflowing either side would not fail cleanly - the adapter would parse
//! garbage - so the budget is enforced here, before anything reaches the bus.

use std::cell::RefCell;
use std::fmt::{self, Display, Formatter};
use std::ops::Range;
use std::rc::Rc;

use bitmask_enum::bitmask;

use crate::error::UlinkError;

/// Hard ceiling of a single bulk packet on endpoint 2, in either direction.
pub const MAX_PACKET: usize = 64;

/// Most TDI/TDO payload bytes one scan command can carry: a full packet less
/// the id byte and the five byte scan header.
pub const MAX_SCAN_CHUNK: usize = MAX_PACKET - 1 - SCAN_HEADER_LEN;

/// Length of the scan command header:
/// `[bytes, bits_last_byte, tms_counts, tms_seq_start, tms_seq_end]`.
pub const SCAN_HEADER_LEN: usize = 5;

/// Command ids understood by the OpenULINK command interpreter.
///
/// The `Slow` variants are functionally identical but run through firmware
/// handlers with calibrated delay loops; they are selected whenever a TCK
/// speed below the maximum is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId
{
	ScanIn = 0x00,
	SlowScanIn = 0x01,
	ScanOut = 0x02,
	SlowScanOut = 0x03,
	ScanIo = 0x04,
	SlowScanIo = 0x05,
	ClockTms = 0x06,
	SlowClockTms = 0x07,
	ClockTck = 0x08,
	SleepUs = 0x09,
	SleepMs = 0x0a,
	GetSignals = 0x0b,
	SetSignals = 0x0c,
	ConfigureTckFreq = 0x0d,
	SetLeds = 0x0e,
	Test = 0x0f,
}

/// The adapter-side pin states reported by `get-signals` and driven by
/// `set-signals`. TRST and RESET pass through inverting drivers on their way
/// to the connector, so a set bit here means the pin reads high at the MCU,
/// not that the line is asserted at the target.
#[bitmask(u8)]
#[bitmask_config(vec_debug)]
pub enum Signal
{
	Tdi,
	Tdo,
	Tms,
	Tck,
	Trst,
	Reset,
	BrkIn,
	Ocdse,
}

/// Both signal bytes returned by a `get-signals` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalState
{
	pub input: Signal,
	pub output: Signal,
}

impl SignalState
{
	fn level(&self, signal: Signal) -> u8
	{
		// TDO and BRKIN come back from the target; everything else reports
		// what the adapter is driving
		let signals = if signal == Signal::Tdo || signal == Signal::BrkIn {
			self.input
		} else {
			self.output
		};
		// Undo the inverting drivers on the two reset lines so the report
		// reads in terms of assertion at the target
		let asserted_low = signal == Signal::Trst || signal == Signal::Reset;
		(signals.contains(signal) != asserted_low) as u8
	}
}

impl Display for SignalState
{
	fn fmt(&self, f: &mut Formatter) -> fmt::Result
	{
		write!(
			f,
			"TDI={} TDO={} TMS={} TCK={} TRST={} SRST={} BRKIN={} OCDSE={}",
			self.level(Signal::Tdi),
			self.level(Signal::Tdo),
			self.level(Signal::Tms),
			self.level(Signal::Tck),
			self.level(Signal::Trst),
			self.level(Signal::Reset),
			self.level(Signal::BrkIn),
			self.level(Signal::Ocdse),
		)
	}
}

/// The `set-leds` bitfield. The firmware gives the off bits priority when
/// both are set for the same LED.
#[bitmask(u8)]
pub enum LedControl
{
	ComOn,
	RunOn,
	ComOff,
	RunOff,
}

/// TDO capture buffers are shared between all the commands a split scan
/// produces, with each command filling its own slice of the whole.
pub type CaptureBuffer = Rc<RefCell<Box<[u8]>>>;

/// Allocate a zeroed capture buffer for `length` bytes of TDO data.
pub fn capture_buffer(length: usize) -> CaptureBuffer
{
	Rc::new(RefCell::new(vec![0u8; length].into_boxed_slice()))
}

/// One command's view into a shared capture buffer.
#[derive(Debug, Clone)]
struct CaptureSlot
{
	buffer: CaptureBuffer,
	range: Range<usize>,
	/// Set on the command whose bytes complete the buffer - a stand-alone
	/// command, or the final chunk of a split scan. Only that command may
	/// hand the finished buffer onward.
	completes_capture: bool,
}

/// A single wire command: its id, the bytes that follow it in the outbound
/// packet, and the slice of reply it expects back.
#[derive(Debug, Clone)]
pub struct Command
{
	id: CommandId,
	payload: Option<Box<[u8]>>,
	capture: Option<CaptureSlot>,
	postprocess: bool,
	origin: Option<usize>,
}

impl Command
{
	pub fn new(id: CommandId) -> Self
	{
		Self {
			id,
			payload: None,
			capture: None,
			postprocess: false,
			origin: None,
		}
	}

	/// Attach the outbound payload. Each command has exactly one fixed-shape
	/// payload, so attaching twice means two code paths both think they own
	/// this command - refuse rather than silently concatenate.
	pub fn with_payload(mut self, payload: &[u8]) -> Result<Self, UlinkError>
	{
		if self.payload.is_some() {
			return Err(UlinkError::Protocol(format!(
				"outbound payload built twice for {:?} command",
				self.id
			)));
		}
		if payload.len() > MAX_PACKET - 1 {
			return Err(UlinkError::InvalidRequest(format!(
				"{} byte payload for {:?} command cannot fit a bulk packet",
				payload.len(),
				self.id
			)));
		}
		self.payload = Some(payload.into());
		Ok(self)
	}

	/// Attach the reply view: `range` of `buffer` receives this command's
	/// captured bytes. The same double-build guard as for payloads applies.
	pub fn with_capture(
		mut self,
		buffer: CaptureBuffer,
		range: Range<usize>,
		completes_capture: bool,
	) -> Result<Self, UlinkError>
	{
		if self.capture.is_some() {
			return Err(UlinkError::Protocol(format!(
				"reply buffer built twice for {:?} command",
				self.id
			)));
		}
		if range.len() > MAX_PACKET {
			return Err(UlinkError::InvalidRequest(format!(
				"{} byte reply for {:?} command cannot fit a bulk packet",
				range.len(),
				self.id
			)));
		}
		if range.end > buffer.borrow().len() {
			return Err(UlinkError::Protocol(format!(
				"reply range {range:?} overruns a {} byte capture buffer",
				buffer.borrow().len()
			)));
		}
		self.capture = Some(CaptureSlot {
			buffer,
			range,
			completes_capture,
		});
		Ok(self)
	}

	/// Mark this command for the post-execution walk that distributes
	/// captured data.
	pub fn postprocessed(mut self) -> Self
	{
		self.postprocess = true;
		self
	}

	/// Record which abstract request this command answers to, by queue index.
	pub fn with_origin(mut self, index: usize) -> Self
	{
		self.origin = Some(index);
		self
	}

	pub fn id(&self) -> CommandId
	{
		self.id
	}

	pub fn origin(&self) -> Option<usize>
	{
		self.origin
	}

	pub fn needs_postprocessing(&self) -> bool
	{
		self.postprocess
	}

	/// Bytes this command occupies in the outbound packet, id included.
	pub fn wire_len(&self) -> usize
	{
		1 + self.payload.as_ref().map_or(0, |payload| payload.len())
	}

	/// Bytes this command expects back in the reply packet.
	pub fn reply_len(&self) -> usize
	{
		self.capture.as_ref().map_or(0, |slot| slot.range.len())
	}

	/// Copy this command's slice of the reply into its capture view.
	fn fill_capture(&self, bytes: &[u8]) -> Result<(), UlinkError>
	{
		let slot = self
			.capture
			.as_ref()
			.ok_or_else(|| UlinkError::Protocol(format!("reply bytes for {:?} command with no reply view", self.id)))?;
		slot.buffer.borrow_mut()[slot.range.clone()].copy_from_slice(bytes);
		Ok(())
	}

	/// Take the completed capture buffer out of the command, if this is the
	/// command responsible for handing it on. Intermediate chunks of a split
	/// scan only ever reference the buffer and return None here.
	pub fn take_capture(self) -> Option<Box<[u8]>>
	{
		self.capture
			.filter(|slot| slot.completes_capture)
			.map(|slot| std::mem::take(&mut *slot.buffer.borrow_mut()))
	}
}

/// An ordered run of commands forming one USB round trip.
///
/// Commands are appended in emission order and the running byte counts for
/// both directions are tracked so a caller can flush before either would
/// overflow `MAX_PACKET`.
#[derive(Debug, Default)]
pub struct CommandBatch
{
	commands: Vec<Command>,
	wire_bytes: usize,
	reply_bytes: usize,
}

impl CommandBatch
{
	pub fn new() -> Self
	{
		Self::default()
	}

	pub fn is_empty(&self) -> bool
	{
		self.commands.is_empty()
	}

	pub fn len(&self) -> usize
	{
		self.commands.len()
	}

	pub fn reply_len(&self) -> usize
	{
		self.reply_bytes
	}

	/// Whether `command` fits the remaining budget in both directions.
	pub fn fits(&self, command: &Command) -> bool
	{
		self.wire_bytes + command.wire_len() <= MAX_PACKET && self.reply_bytes + command.reply_len() <= MAX_PACKET
	}

	/// Append a command. The caller is expected to have flushed if the
	/// command did not fit; a command too large for even an empty batch can
	/// never be sent at all.
	pub fn push(&mut self, command: Command) -> Result<(), UlinkError>
	{
		if !self.fits(&command) {
			return Err(UlinkError::InvalidRequest(format!(
				"{:?} command with {} payload bytes and {} reply bytes overflows the 64 byte packet budget",
				command.id(),
				command.wire_len() - 1,
				command.reply_len()
			)));
		}
		self.wire_bytes += command.wire_len();
		self.reply_bytes += command.reply_len();
		self.commands.push(command);
		Ok(())
	}

	/// Pack the batch back to back into `packet`, returning the byte count
	/// to put on the wire.
	pub fn serialize(&self, packet: &mut [u8; MAX_PACKET]) -> usize
	{
		let mut offset = 0;
		for command in &self.commands {
			packet[offset] = command.id as u8;
			offset += 1;
			if let Some(payload) = &command.payload {
				packet[offset..offset + payload.len()].copy_from_slice(payload);
				offset += payload.len();
			}
		}
		offset
	}

	/// Distribute a reply packet across the commands, in emission order.
	pub fn scatter(&mut self, reply: &[u8]) -> Result<(), UlinkError>
	{
		if reply.len() != self.reply_bytes {
			return Err(UlinkError::Protocol(format!(
				"adapter replied with {} bytes where the batch expects {}",
				reply.len(),
				self.reply_bytes
			)));
		}
		let mut offset = 0;
		for command in &self.commands {
			let length = command.reply_len();
			if length == 0 {
				continue;
			}
			command.fill_capture(&reply[offset..offset + length])?;
			offset += length;
		}
		Ok(())
	}

	/// Consume the batch for the post-execution walk.
	pub fn into_commands(self) -> Vec<Command>
	{
		self.commands
	}
}
