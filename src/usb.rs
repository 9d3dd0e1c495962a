// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>

use std::io;
use std::time::Duration;

use async_io::{Timer, block_on};
use futures_lite::FutureExt;
use nusb::Interface;
use nusb::transfer::RequestBuffer;

/// Simple newtype struct for some clarity in function arguments and whatnot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Vid(pub u16);

/// Simple newtype struct for some clarity in function arguments and whatnot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub u16);

/// Synchronous bulk transfers with a deadline, on top of nusb's async ones.
///
/// The adapter protocol is strictly lock-step - one packet out, at most one
/// packet back - so blocking the calling thread is the honest model here.
pub trait InterfaceExt
{
	fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> io::Result<usize>;
	fn read_bulk(&self, endpoint: u8, buffer: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

impl InterfaceExt for Interface
{
	fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> io::Result<usize>
	{
		let transfer = async {
			let completion = self.bulk_out(endpoint, data.to_vec()).await;
			completion.status.map_err(io::Error::other)?;
			Ok(completion.data.actual_length())
		};

		block_on(transfer.or(async {
			Timer::after(timeout).await;
			Err(io::ErrorKind::TimedOut.into())
		}))
	}

	fn read_bulk(&self, endpoint: u8, buffer: &mut [u8], timeout: Duration) -> io::Result<usize>
	{
		let transfer = async {
			let completion = self.bulk_in(endpoint, RequestBuffer::new(buffer.len())).await;
			completion.status.map_err(io::Error::other)?;
			let length = completion.data.len();
			buffer[..length].copy_from_slice(&completion.data);
			Ok(length)
		};

		block_on(transfer.or(async {
			Timer::after(timeout).await;
			Err(io::ErrorKind::TimedOut.into())
		}))
	}
}
