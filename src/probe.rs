// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! Finding, opening and bootstrapping the ULINK adapter on the USB bus.
//!
//! A factory-fresh adapter enumerates as a bare EZ-USB with no code in it;
//! only after the OpenULINK image is pushed over the vendor control endpoint
//! and the device has renumerated does endpoint 2 speak the command language.

use std::thread;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use nusb::transfer::{Control, ControlType, Recipient};
use nusb::{Device, DeviceInfo, Interface};

use crate::error::UlinkError;
use crate::firmware::FirmwareImage;
use crate::usb::{InterfaceExt, Pid, Vid};

pub const ULINK_VID: Vid = Vid(0xc251);
pub const ULINK_PID: Pid = Pid(0x2710);

/// Product string the OpenULINK firmware reports in string descriptor 1.
/// The Keil stock firmware (and the blank bootloader) report something else
/// entirely, which is how we know a download is needed.
const FIRMWARE_PRODUCT_PREFIX: &str = "OpenULINK";
const IDENTITY_DESCRIPTOR_INDEX: u8 = 1;
const LANGUAGE_US_ENGLISH: u16 = 0x0409;
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(2);

/// Bulk endpoint pair the command interpreter listens on.
const BULK_EP_OUT: u8 = 0x02;
const BULK_EP_IN: u8 = 0x82;

/// Anchor vendor request of the EZ-USB bootloader.
const REQUEST_FIRMWARE_LOAD: u8 = 0xa0;
/// The CPUCS register; bit 0 holds the 8051 core in reset.
const CPUCS_ADDRESS: u16 = 0x7f92;
const CPU_RESET_HOLD: u8 = 0x01;
const CPU_RESET_RELEASE: u8 = 0x00;
/// The bootloader takes at most one control packet's worth of code at a time.
const FIRMWARE_CHUNK: usize = 64;
const FIRMWARE_LOAD_TIMEOUT: Duration = Duration::from_secs(1);

/// How long the EZ-USB takes to drop off the bus and come back once the new
/// firmware boots.
const RENUMERATION_DELAY: Duration = Duration::from_millis(1500);

/// The bulk packet link the driver talks through. Split out as a trait so
/// the command pipeline can be exercised against a scripted link in tests.
pub trait ProbeLink
{
	fn write_packet(&mut self, data: &[u8], timeout: Duration) -> Result<usize, UlinkError>;
	fn read_packet(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize, UlinkError>;

	/// The identity the firmware reports, where the link has one.
	fn identity(&self) -> Option<String>
	{
		None
	}
}

/// An open ULINK adapter with interface 0 claimed.
pub struct UlinkProbe
{
	device: Device,
	interface: Interface,
}

impl UlinkProbe
{
	/// Open the first ULINK on the bus and claim its interface.
	pub fn open() -> Result<Self, UlinkError>
	{
		let info = Self::find_adapter()?;
		debug!(
			"Opening ULINK adapter on bus {} address {}",
			info.bus_number(),
			info.device_address()
		);
		Self::from_device_info(&info)
	}

	fn find_adapter() -> Result<DeviceInfo, UlinkError>
	{
		nusb::list_devices()
			.map_err(UlinkError::Transport)?
			.find(|device| device.vendor_id() == ULINK_VID.0 && device.product_id() == ULINK_PID.0)
			.ok_or(UlinkError::DeviceNotFound)
	}

	fn from_device_info(info: &DeviceInfo) -> Result<Self, UlinkError>
	{
		let device = info.open().map_err(UlinkError::Transport)?;
		let interface = device.claim_interface(0).map_err(UlinkError::Transport)?;
		Ok(Self { device, interface })
	}

	/// The product identity from string descriptor 1, if the device has one.
	/// A blank EZ-USB has no string descriptors at all.
	pub fn firmware_identity(&self) -> Option<String>
	{
		self.device
			.get_string_descriptor(IDENTITY_DESCRIPTOR_INDEX, LANGUAGE_US_ENGLISH, DESCRIPTOR_TIMEOUT)
			.ok()
	}

	/// Whether the adapter is already running OpenULINK.
	pub fn has_firmware(&self) -> bool
	{
		self.firmware_identity()
			.is_some_and(|identity| identity.starts_with(FIRMWARE_PRODUCT_PREFIX))
	}

	/// Download `image` and reopen the adapter once it has renumerated under
	/// its firmware identity. Consumes the probe: the old device handle is
	/// dead the moment the CPU comes out of reset.
	pub fn bootstrap_firmware(mut self, image: &FirmwareImage) -> Result<Self, UlinkError>
	{
		info!("Adapter is not running OpenULINK, downloading firmware");
		self.download_firmware(image)?;
		drop(self);

		// The device falls off the bus while the new firmware boots and
		// re-enumerates
		thread::sleep(RENUMERATION_DELAY);

		let probe = Self::open()?;
		if !probe.has_firmware() {
			return Err(UlinkError::Firmware(
				"adapter renumerated but does not identify as OpenULINK".into(),
			));
		}
		info!(
			"Adapter is now running {}",
			probe.firmware_identity().unwrap_or_else(|| FIRMWARE_PRODUCT_PREFIX.into())
		);
		Ok(probe)
	}

	/// Push a firmware image into the EZ-USB over the vendor control
	/// endpoint, holding the CPU in reset for the duration.
	pub fn download_firmware(&mut self, image: &FirmwareImage) -> Result<(), UlinkError>
	{
		let progress = ProgressBar::new(image.total_len() as u64).with_style(
			ProgressStyle::default_bar()
				.template(" {percent:>3}% |{bar:50}| {bytes}/{total_bytes}")
				.unwrap(),
		);

		self.write_firmware_bytes(CPUCS_ADDRESS, &[CPU_RESET_HOLD])?;

		for (address, data) in image.segments() {
			debug!("Writing {} firmware bytes at {address:#06x}", data.len());
			for (index, chunk) in data.chunks(FIRMWARE_CHUNK).enumerate() {
				let target = address + (index * FIRMWARE_CHUNK) as u16;
				self.write_firmware_bytes(target, chunk)?;
				progress.inc(chunk.len() as u64);
			}
		}

		self.write_firmware_bytes(CPUCS_ADDRESS, &[CPU_RESET_RELEASE])?;
		progress.finish();
		Ok(())
	}

	fn write_firmware_bytes(&self, address: u16, bytes: &[u8]) -> Result<(), UlinkError>
	{
		let written = self
			.interface
			.control_out_blocking(
				Control {
					control_type: ControlType::Vendor,
					recipient: Recipient::Device,
					request: REQUEST_FIRMWARE_LOAD,
					value: address,
					index: 0,
				},
				bytes,
				FIRMWARE_LOAD_TIMEOUT,
			)
			.map_err(|error| {
				UlinkError::Firmware(format!(
					"vendor write of {} bytes at {address:#06x} failed: {error}",
					bytes.len()
				))
			})?;
		if written != bytes.len() {
			return Err(UlinkError::Firmware(format!(
				"vendor write at {address:#06x} truncated to {written} of {} bytes",
				bytes.len()
			)));
		}
		Ok(())
	}
}

impl ProbeLink for UlinkProbe
{
	fn write_packet(&mut self, data: &[u8], timeout: Duration) -> Result<usize, UlinkError>
	{
		Ok(self.interface.write_bulk(BULK_EP_OUT, data, timeout)?)
	}

	fn read_packet(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize, UlinkError>
	{
		Ok(self.interface.read_bulk(BULK_EP_IN, buffer, timeout)?)
	}

	fn identity(&self) -> Option<String>
	{
		self.firmware_identity()
	}
}
