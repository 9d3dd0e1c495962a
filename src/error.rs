// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! Error type shared by all layers of the driver.

use thiserror::Error;

/// Things that can go wrong between accepting a JTAG request and getting its
/// answer back off the adapter.
#[derive(Debug, Error)]
pub enum UlinkError
{
	/// A bulk or control transfer failed outright at the USB layer.
	#[error("USB transfer failed")]
	Transport(#[from] std::io::Error),

	/// The adapter and the driver disagree about the wire contract - short
	/// transfers, replies of the wrong length, or a command built twice over.
	#[error("adapter protocol violation: {0}")]
	Protocol(String),

	/// The request can never be expressed in the adapter's command language.
	#[error("invalid request: {0}")]
	InvalidRequest(String),

	/// No adapter was found on the bus.
	#[error("no ULINK adapter found (expected VID:PID c251:2710)")]
	DeviceNotFound,

	/// The firmware image could not be read, or could not be loaded into the
	/// adapter over the vendor control endpoint.
	#[error("firmware load failed: {0}")]
	Firmware(String),
}
