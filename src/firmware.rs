// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! Reading OpenULINK firmware images from Intel HEX files.
//!
//! The EZ-USB bootloader accepts code over the vendor control endpoint one
//! address range at a time, so the image is kept as its original segments
//! rather than flattened - the downloader in [`crate::probe`] walks them in
//! address order and chunks each one to the control transfer size.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::from_utf8;

use log::debug;

use crate::error::UlinkError;

/// The EZ-USB's code space is the 8051's 16 bit address space; anything
/// beyond it cannot be downloaded.
const ADDRESS_SPACE: u32 = 0x1_0000;

/// A firmware image as a set of contiguous code segments keyed by their base
/// address.
pub struct FirmwareImage
{
	segments: BTreeMap<u16, Box<[u8]>>,
}

struct HexRecord
{
	byte_count: u8,
	address: u16,
	record_type: HexRecordType,
	data: [u8; 255],
}

#[repr(u8)]
enum HexRecordType
{
	Data = 0x00,
	EndOfFile = 0x01,
	ExtendedSegmentAddress = 0x02,
	StartSegmentAddress = 0x03,
	ExtendedLinearAddress = 0x04,
	StartLinearAddress = 0x05,
}

impl FirmwareImage
{
	pub fn from_path(path: &Path) -> Result<Self, UlinkError>
	{
		let file = File::open(path)
			.map_err(|error| UlinkError::Firmware(format!("cannot open image {}: {error}", path.display())))?;
		Self::from_file(file)
	}

	pub fn from_file(mut file: File) -> Result<Self, UlinkError>
	{
		debug!("Loading firmware image as Intel HEX");

		let mut records = Vec::new();
		while let Some(record) = HexRecord::read(&mut file)? {
			let done = matches!(record.record_type, HexRecordType::EndOfFile);
			records.push(record);
			if done {
				break;
			}
		}
		debug!("Read {} records", records.len());
		if !matches!(records.last().map(|record| &record.record_type), Some(HexRecordType::EndOfFile)) {
			return Err(UlinkError::Firmware("image has no EOF record".into()));
		}

		let segments = collect_segments(&records)?;
		debug!("Recovered {} code segments", segments.len());
		Ok(Self { segments })
	}

	/// The segments in ascending address order.
	pub fn segments(&self) -> impl Iterator<Item = (u16, &[u8])>
	{
		self.segments.iter().map(|(&address, data)| (address, data.as_ref()))
	}

	/// Total code bytes across all segments.
	pub fn total_len(&self) -> usize
	{
		self.segments.values().map(|segment| segment.len()).sum()
	}
}

/// Merge the data records into contiguous segments, applying the extended
/// address records as they come past.
fn collect_segments(records: &[HexRecord]) -> Result<BTreeMap<u16, Box<[u8]>>, UlinkError>
{
	let mut segments = BTreeMap::new();
	let mut base_address = 0u32;
	let mut begin_address = 0u32;
	let mut end_address = 0u32;
	let mut segment_data = Vec::new();

	fn finish_segment(
		begin: u32,
		end: u32,
		data: &mut Vec<u8>,
		segments: &mut BTreeMap<u16, Box<[u8]>>,
	) -> Result<(), UlinkError>
	{
		if begin == end {
			return Ok(());
		}
		if end > ADDRESS_SPACE {
			return Err(UlinkError::Firmware(format!(
				"segment {begin:#07x}..{end:#07x} lies outside the EZ-USB address space"
			)));
		}
		segments.insert(begin as u16, std::mem::take(data).into_boxed_slice());
		Ok(())
	}

	for record in records {
		match record.record_type {
			HexRecordType::Data => {
				let address = base_address + record.address as u32;
				// A discontinuity closes the running segment and opens a new one
				if address != end_address {
					finish_segment(begin_address, end_address, &mut segment_data, &mut segments)?;
					begin_address = address;
					end_address = address;
				}
				segment_data.extend_from_slice(&record.data[..record.byte_count as usize]);
				end_address += record.byte_count as u32;
			},
			HexRecordType::EndOfFile => {
				finish_segment(begin_address, end_address, &mut segment_data, &mut segments)?;
			},
			HexRecordType::ExtendedSegmentAddress => {
				let paragraph = u16::from_be_bytes([record.data[0], record.data[1]]);
				base_address = (paragraph as u32) << 4;
			},
			HexRecordType::ExtendedLinearAddress => {
				let upper = u16::from_be_bytes([record.data[0], record.data[1]]);
				base_address = (upper as u32) << 16;
				if base_address >= ADDRESS_SPACE {
					return Err(UlinkError::Firmware(format!(
						"extended linear address {base_address:#010x} lies outside the EZ-USB address space"
					)));
				}
			},
			// Entry points are meaningless here - the 8051 always starts
			// from its reset vector once CPUCS releases it
			HexRecordType::StartSegmentAddress | HexRecordType::StartLinearAddress => {
				debug!("Ignoring start address record");
			},
		}
	}

	Ok(segments)
}

impl HexRecord
{
	/// Read the next record, or None on a clean end of file before one
	/// starts. Anything malformed mid-record is an error.
	fn read(file: &mut File) -> Result<Option<Self>, UlinkError>
	{
		// Scan forward to the next ':', swallowing line terminators and
		// anything else between records
		let mut byte = [0u8];
		loop {
			match file.read(&mut byte) {
				Ok(0) => return Ok(None),
				Ok(_) if byte[0] == b':' => break,
				Ok(_) => {},
				Err(ref error) if error.kind() == std::io::ErrorKind::Interrupted => {},
				Err(error) => return Err(UlinkError::Firmware(format!("image read failed: {error}"))),
			}
		}

		let mut checksum = 0u8;

		let byte_count = read_hex_byte(file)?;
		checksum = checksum.wrapping_add(byte_count);

		let address_high = read_hex_byte(file)?;
		let address_low = read_hex_byte(file)?;
		let address = u16::from_be_bytes([address_high, address_low]);
		checksum = checksum.wrapping_add(address_high).wrapping_add(address_low);

		let record_type = read_hex_byte(file)?;
		checksum = checksum.wrapping_add(record_type);

		let mut data = [0xffu8; 255];
		for entry in data.iter_mut().take(byte_count as usize) {
			*entry = read_hex_byte(file)?;
			checksum = checksum.wrapping_add(*entry);
		}

		// The final byte is the two's complement of the running sum
		let expected = read_hex_byte(file)?;
		if expected != (!checksum).wrapping_add(1) {
			return Err(UlinkError::Firmware("record checksum mismatch".into()));
		}

		let record_type = HexRecordType::try_from(record_type)?;
		record_type.validate_byte_count(byte_count)?;

		Ok(Some(Self {
			byte_count,
			address,
			record_type,
			data,
		}))
	}
}

/// Read one byte encoded as a pair of ASCII hex digits.
fn read_hex_byte(file: &mut File) -> Result<u8, UlinkError>
{
	let mut digits = [0u8; 2];
	file.read_exact(&mut digits)
		.map_err(|error| UlinkError::Firmware(format!("truncated record: {error}")))?;
	let text = from_utf8(&digits).map_err(|_| UlinkError::Firmware("record contains non-hex bytes".into()))?;
	u8::from_str_radix(text, 16).map_err(|_| UlinkError::Firmware(format!("invalid hex digits {text:?} in record")))
}

impl TryFrom<u8> for HexRecordType
{
	type Error = UlinkError;

	fn try_from(value: u8) -> Result<Self, UlinkError>
	{
		match value {
			0 => Ok(Self::Data),
			1 => Ok(Self::EndOfFile),
			2 => Ok(Self::ExtendedSegmentAddress),
			3 => Ok(Self::StartSegmentAddress),
			4 => Ok(Self::ExtendedLinearAddress),
			5 => Ok(Self::StartLinearAddress),
			_ => Err(UlinkError::Firmware(format!("unknown record type {value}"))),
		}
	}
}

impl HexRecordType
{
	fn validate_byte_count(&self, byte_count: u8) -> Result<(), UlinkError>
	{
		let expected = match self {
			Self::EndOfFile => Some(0),
			Self::ExtendedSegmentAddress | Self::ExtendedLinearAddress => Some(2),
			Self::StartSegmentAddress | Self::StartLinearAddress => Some(4),
			Self::Data => None,
		};
		match expected {
			Some(expected) if byte_count != expected => Err(UlinkError::Firmware(format!(
				"record should carry {expected} bytes, carries {byte_count}"
			))),
			_ => Ok(()),
		}
	}
}
