// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! Drives the whole command pipeline against a scripted link and checks the
//! exact bytes that would have gone to the adapter.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use color_eyre::eyre::Result;
use openulink::driver::UlinkDriver;
use openulink::error::UlinkError;
use openulink::jtag::{JtagRequest, ScanRegister, ScanRequest};
use openulink::probe::ProbeLink;
use openulink::protocol::Signal;
use openulink::tap::TapState;

#[derive(Default)]
struct LinkScript
{
	written: Vec<Vec<u8>>,
	replies: VecDeque<Vec<u8>>,
	refuse_next_write: bool,
}

/// Stands in for the USB link: records outbound packets, plays back scripted
/// replies, and can refuse a write to simulate a wedged adapter.
struct ScriptedLink(Rc<RefCell<LinkScript>>);

impl ProbeLink for ScriptedLink
{
	fn write_packet(&mut self, data: &[u8], _timeout: Duration) -> Result<usize, UlinkError>
	{
		let mut script = self.0.borrow_mut();
		if script.refuse_next_write {
			script.refuse_next_write = false;
			return Err(UlinkError::Transport(io::ErrorKind::TimedOut.into()));
		}
		script.written.push(data.to_vec());
		Ok(data.len())
	}

	fn read_packet(&mut self, buffer: &mut [u8], _timeout: Duration) -> Result<usize, UlinkError>
	{
		let mut script = self.0.borrow_mut();
		let reply = script
			.replies
			.pop_front()
			.ok_or_else(|| UlinkError::Transport(io::ErrorKind::TimedOut.into()))?;
		let length = reply.len().min(buffer.len());
		buffer[..length].copy_from_slice(&reply[..length]);
		Ok(length)
	}
}

fn scripted_driver() -> (UlinkDriver, Rc<RefCell<LinkScript>>)
{
	let script = Rc::new(RefCell::new(LinkScript::default()));
	let driver = UlinkDriver::with_link(Box::new(ScriptedLink(script.clone())));
	(driver, script)
}

#[test]
fn dr_exchange_of_16_bits_is_one_command() -> Result<()>
{
	let (mut driver, script) = scripted_driver();
	driver.tap_mut().move_to(TapState::Idle);
	script.borrow_mut().replies.push_back(vec![0x5a, 0xa5]);

	let mut queue = [JtagRequest::Scan(ScanRequest::exchange(
		ScanRegister::Data,
		Box::new([0xab, 0xcd]),
		16,
		TapState::Idle,
	))];
	driver.execute_queue(&mut queue)?;

	// One scan-io command: 2 bytes, 8 bits in the last byte, 3 TMS clocks
	// into DRSHIFT (001) and 3 back out to Idle (011), then the TDI bytes
	let recorded = script.borrow();
	let written = &recorded.written;
	assert_eq!(written.len(), 1);
	assert_eq!(written[0], vec![0x04, 2, 8, 0x33, 0b001, 0b011, 0xab, 0xcd]);

	let JtagRequest::Scan(scan) = &queue[0] else {
		panic!("queue shape changed underneath us");
	};
	assert_eq!(scan.captured.as_deref(), Some(&[0x5a, 0xa5][..]));
	assert_eq!(driver.tap().state(), TapState::Idle);
	Ok(())
}

#[test]
fn dr_write_of_512_bits_splits_into_two_packets() -> Result<()>
{
	let (mut driver, script) = scripted_driver();
	driver.tap_mut().move_to(TapState::Idle);

	let tdi: Box<[u8]> = (0u8..64).collect();
	let mut queue = [JtagRequest::Scan(ScanRequest::write(
		ScanRegister::Data,
		tdi.clone(),
		512,
		TapState::Idle,
	))];
	driver.execute_queue(&mut queue)?;

	let recorded = script.borrow();
	let written = &recorded.written;
	assert_eq!(written.len(), 2);

	// First chunk fills its packet completely: 58 TDI bytes, entering the
	// shift from Idle and parking in DRPAUSE
	assert_eq!(written[0].len(), 64);
	assert_eq!(&written[0][..6], &[0x02, 58, 8, 0x32, 0b001, 0b01]);
	assert_eq!(&written[0][6..], &tdi[..58]);

	// Second chunk resumes from DRPAUSE and leaves for Idle
	assert_eq!(&written[1][..6], &[0x02, 6, 8, 0x23, 0b01, 0b011]);
	assert_eq!(&written[1][6..], &tdi[58..]);
	Ok(())
}

#[test]
fn dr_read_of_512_bits_batches_both_chunks_in_one_packet() -> Result<()>
{
	let (mut driver, script) = scripted_driver();
	driver.tap_mut().move_to(TapState::Idle);

	let reply: Vec<u8> = (0u8..64).map(|byte| byte.wrapping_mul(3)).collect();
	script.borrow_mut().replies.push_back(reply.clone());

	let mut queue = [JtagRequest::Scan(ScanRequest::read(ScanRegister::Data, 512, TapState::Idle))];
	driver.execute_queue(&mut queue)?;

	// Capture-only chunks carry no TDI, so both fit one outbound packet and
	// their replies fill the 64 byte inbound budget exactly
	let recorded = script.borrow();
	let written = &recorded.written;
	assert_eq!(written.len(), 1);
	assert_eq!(
		written[0],
		vec![0x00, 58, 8, 0x32, 0b001, 0b01, 0x00, 6, 8, 0x23, 0b01, 0b011]
	);

	let JtagRequest::Scan(scan) = &queue[0] else {
		panic!("queue shape changed underneath us");
	};
	assert_eq!(scan.captured.as_deref(), Some(&reply[..]));
	Ok(())
}

#[test]
fn chunk_count_follows_the_58_byte_ceiling() -> Result<()>
{
	// 464 bits is exactly 58 bytes - one command; one bit more takes two
	for (bits, packets, last_chunk_header) in [(464usize, 1usize, None), (465, 2, Some([0x02u8, 1, 1, 0x23, 0b01, 0b011]))] {
		let (mut driver, script) = scripted_driver();
		driver.tap_mut().move_to(TapState::Idle);

		let tdi: Box<[u8]> = vec![0x55; bits.div_ceil(8)].into();
		let mut queue = [JtagRequest::Scan(ScanRequest::write(
			ScanRegister::Data,
			tdi,
			bits,
			TapState::Idle,
		))];
		driver.execute_queue(&mut queue)?;

		let recorded = script.borrow();
		let written = &recorded.written;
		assert_eq!(written.len(), packets, "{bits} bit scan");
		if let Some(header) = last_chunk_header {
			assert_eq!(&written[1][..6], &header);
		}
	}
	Ok(())
}

#[test]
fn scans_settle_in_the_requested_end_state() -> Result<()>
{
	let (mut driver, script) = scripted_driver();
	driver.tap_mut().move_to(TapState::Idle);
	script.borrow_mut().replies.push_back(vec![0x0f]);

	let mut queue = [JtagRequest::Scan(ScanRequest::read(
		ScanRegister::Instruction,
		8,
		TapState::IrPause,
	))];
	driver.execute_queue(&mut queue)?;

	// Idle to IRSHIFT is 0011 over 4 clocks; IRSHIFT to IRPAUSE is 01 over 2
	assert_eq!(script.borrow().written[0], vec![0x00, 1, 8, 0x42, 0b0011, 0b01]);
	assert_eq!(driver.tap().state(), TapState::IrPause);
	Ok(())
}

#[test]
fn tap_reset_is_five_tms_high_clocks() -> Result<()>
{
	let (mut driver, script) = scripted_driver();
	driver.tap_mut().move_to(TapState::Idle);

	driver.execute_queue(&mut [JtagRequest::ResetTap])?;

	assert_eq!(script.borrow().written, vec![vec![0x06, 5, 0xff]]);
	assert_eq!(driver.tap().state(), TapState::Reset);
	Ok(())
}

#[test]
fn run_test_moves_to_idle_and_clocks() -> Result<()>
{
	let (mut driver, script) = scripted_driver();
	driver.tap_mut().move_to(TapState::DrShift);

	driver.execute_queue(&mut [JtagRequest::RunTest {
		cycles: 100,
		end_state: TapState::Idle,
	}])?;

	// The walk out of DRSHIFT, then 100 cycles little-endian, and no final
	// move because the end state is already Idle
	assert_eq!(script.borrow().written, vec![vec![0x06, 3, 0b011, 0x08, 0x64, 0x00]]);
	assert_eq!(driver.tap().state(), TapState::Idle);
	Ok(())
}

#[test]
fn reset_lines_map_to_one_set_signals_command() -> Result<()>
{
	let (mut driver, script) = scripted_driver();
	driver.tap_mut().move_to(TapState::Idle);

	driver.execute_queue(&mut [JtagRequest::SetReset {
		trst: true,
		srst: false,
	}])?;

	// SRST deasserted lands in the low mask, TRST asserted in the high mask,
	// both in their logical sense
	assert_eq!(
		script.borrow().written,
		vec![vec![0x0c, Signal::Reset.bits(), Signal::Trst.bits()]]
	);
	assert_eq!(driver.tap().state(), TapState::Reset);
	Ok(())
}

#[test]
fn short_sleeps_are_a_single_adapter_side_command() -> Result<()>
{
	let (mut driver, script) = scripted_driver();

	driver.execute_queue(&mut [JtagRequest::Sleep { microseconds: 1234 }])?;

	assert_eq!(script.borrow().written, vec![vec![0x09, 0xd2, 0x04]]);
	Ok(())
}

#[test]
fn long_sleeps_split_into_milliseconds_and_remainder() -> Result<()>
{
	let (mut driver, script) = scripted_driver();

	driver.execute_queue(&mut [JtagRequest::Sleep { microseconds: 70_500 }])?;

	assert_eq!(
		script.borrow().written,
		vec![vec![0x0a, 70, 0x00, 0x09, 0xf4, 0x01]]
	);
	Ok(())
}

#[test]
fn batches_never_overflow_a_bulk_packet() -> Result<()>
{
	let (mut driver, script) = scripted_driver();

	// 30 sleeps of 3 wire bytes each cannot share one packet
	let mut queue: Vec<JtagRequest> = (0..30)
		.map(|index| JtagRequest::Sleep {
			microseconds: 100 + index,
		})
		.collect();
	driver.execute_queue(&mut queue)?;

	let recorded = script.borrow();
	let written = &recorded.written;
	assert_eq!(written.len(), 2);
	// 21 commands fill the first packet to 63 bytes, the rest follow
	assert_eq!(written[0].len(), 63);
	assert_eq!(written[1].len(), 27);
	assert!(written.iter().all(|packet| packet.len() <= 64));
	Ok(())
}

#[test]
fn configured_slow_speed_selects_the_slow_command_set() -> Result<()>
{
	let (mut driver, script) = scripted_driver();
	driver.tap_mut().move_to(TapState::Idle);

	driver.set_speed(1)?;
	assert_eq!(script.borrow().written[0], vec![0x0d, 5, 5, 5]);

	script.borrow_mut().replies.push_back(vec![0x00]);
	let mut queue = [
		JtagRequest::Scan(ScanRequest::read(ScanRegister::Data, 8, TapState::Idle)),
		JtagRequest::ResetTap,
	];
	driver.execute_queue(&mut queue)?;

	// slow-scan-in and slow-clock-tms ids respectively
	let recorded = script.borrow();
	let written = &recorded.written;
	assert_eq!(written[1][0], 0x01);
	assert_eq!(&written[1][6..], &[0x07, 5, 0xff]);
	Ok(())
}

#[test]
fn speed_surface_rejects_what_the_adapter_cannot_do()
{
	let (driver, _script) = scripted_driver();

	assert!(matches!(driver.speed_from_khz(0), Err(UlinkError::InvalidRequest(_))));
	assert!(matches!(driver.speed_from_khz(151), Err(UlinkError::InvalidRequest(_))));
	assert_eq!(driver.speed_from_khz(150).unwrap(), 0);
	assert_eq!(driver.speed_from_khz(149).unwrap(), 1);
	assert_eq!(driver.speed_from_khz(1).unwrap(), 1);

	assert_eq!(UlinkDriver::khz_from_speed(0).unwrap(), 150);
	assert_eq!(UlinkDriver::khz_from_speed(1).unwrap(), 100);
	assert!(matches!(
		UlinkDriver::khz_from_speed(2),
		Err(UlinkError::InvalidRequest(_))
	));
}

#[test]
fn invalid_requests_abort_the_queue_before_the_wire()
{
	let (mut driver, script) = scripted_driver();
	driver.tap_mut().move_to(TapState::Idle);

	// A zero bit scan is refused outright
	let mut queue = [
		JtagRequest::Scan(ScanRequest::read(ScanRegister::Data, 0, TapState::Idle)),
		JtagRequest::Sleep { microseconds: 10 },
	];
	assert!(matches!(
		driver.execute_queue(&mut queue),
		Err(UlinkError::InvalidRequest(_))
	));
	assert!(script.borrow().written.is_empty());

	// As is a request ending in a transient state
	let mut queue = [JtagRequest::Scan(ScanRequest::read(ScanRegister::Data, 8, TapState::DrShift))];
	assert!(matches!(
		driver.execute_queue(&mut queue),
		Err(UlinkError::InvalidRequest(_))
	));
	assert!(script.borrow().written.is_empty());
}

#[test]
fn short_replies_are_a_protocol_error()
{
	let (mut driver, script) = scripted_driver();
	driver.tap_mut().move_to(TapState::Idle);
	script.borrow_mut().replies.push_back(vec![0xff]);

	let mut queue = [JtagRequest::Scan(ScanRequest::read(ScanRegister::Data, 16, TapState::Idle))];
	assert!(matches!(
		driver.execute_queue(&mut queue),
		Err(UlinkError::Protocol(_))
	));
}

#[test]
fn init_drains_a_stranded_reply_and_reports_signals() -> Result<()>
{
	let (mut driver, script) = scripted_driver();
	{
		let mut script = script.borrow_mut();
		script.refuse_next_write = true;
		// The stale packet from a crashed predecessor, then get-signals
		script.replies.push_back(vec![0xaa; 64]);
		script.replies.push_back(vec![0x02, 0x1d]);
	}

	driver.init()?;

	// The refused liveness probe never hit the recorder, so the only write
	// is the get-signals command
	assert_eq!(script.borrow().written, vec![vec![0x0b]]);
	Ok(())
}

#[test]
fn init_fails_when_the_drain_fails_too()
{
	let (mut driver, script) = scripted_driver();
	script.borrow_mut().refuse_next_write = true;

	assert!(matches!(driver.init(), Err(UlinkError::Transport(_))));
}

#[test]
fn signal_reports_invert_the_reset_lines() -> Result<()>
{
	let (mut driver, script) = scripted_driver();
	// TDO high on the inputs; TRST driven high at the MCU, which the
	// inverting driver turns into a deasserted line at the target
	script
		.borrow_mut()
		.replies
		.push_back(vec![Signal::Tdo.bits(), Signal::Trst.bits()]);

	let state = driver.read_signal_state()?;
	let report = state.to_string();
	assert!(report.contains("TDO=1"));
	assert!(report.contains("TRST=0"));
	assert!(report.contains("SRST=1"));
	assert!(report.contains("TDI=0"));
	Ok(())
}
