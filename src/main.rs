// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{OptionExt, Result};
use log::LevelFilter;
use owo_colors::OwoColorize;

use openulink::driver::UlinkDriver;
use openulink::jtag::{JtagRequest, ScanRegister, ScanRequest};
use openulink::tap::TapState;

#[derive(Parser)]
#[command(version, about, arg_required_else_help(true))]
struct CliArguments
{
	/// OpenULINK firmware image to download when the adapter is not yet
	/// running it
	#[arg(global = true, short = 'f', long = "firmware")]
	firmware: Option<PathBuf>,

	#[command(subcommand)]
	subcommand: ToplevelCommands,
}

#[derive(Subcommand)]
enum ToplevelCommands
{
	/// Show the adapter's identity and current signal states
	Info,
	/// Read the IDCODE of the first TAP on the scan chain
	Idcode,
	/// Switch the COM and RUN LEDs on or off
	Leds
	{
		#[arg(long)]
		com: Option<bool>,
		#[arg(long)]
		run: Option<bool>,
	},
	/// Configure the TCK rate
	Speed
	{
		/// Requested rate in kHz; the adapter tops out at 150
		khz: u32,
	},
}

fn open_driver(args: &CliArguments) -> Result<UlinkDriver>
{
	Ok(UlinkDriver::open(args.firmware.as_deref())?)
}

fn info_command(args: &CliArguments) -> Result<()>
{
	let mut driver = open_driver(args)?;
	let identity = driver.identity().ok_or_eyre("adapter reports no identity string")?;
	let signals = driver.read_signal_state()?;
	println!("{}", identity.bold());
	println!("  Signals: {signals}");
	Ok(())
}

fn idcode_command(args: &CliArguments) -> Result<()>
{
	let mut driver = open_driver(args)?;

	// Test-logic-reset loads every IDCODE register on the chain, after which
	// a 32 bit DR read returns the IDCODE of the device nearest TDO
	let mut queue = [
		JtagRequest::ResetTap,
		JtagRequest::Scan(ScanRequest::read(ScanRegister::Data, 32, TapState::Idle)),
	];
	driver.execute_queue(&mut queue)?;

	let JtagRequest::Scan(scan) = &queue[1] else {
		unreachable!("queue shape is fixed above");
	};
	let captured = scan.captured.as_deref().ok_or_eyre("scan returned no data")?;
	let idcode = u32::from_le_bytes([captured[0], captured[1], captured[2], captured[3]]);
	println!("IDCODE: {idcode:#010x}");
	Ok(())
}

fn leds_command(args: &CliArguments, com: Option<bool>, run: Option<bool>) -> Result<()>
{
	let mut driver = open_driver(args)?;
	driver.set_leds(com, run)?;
	Ok(())
}

fn speed_command(args: &CliArguments, khz: u32) -> Result<()>
{
	let mut driver = open_driver(args)?;
	let index = driver.speed_from_khz(khz)?;
	driver.set_speed(index)?;
	println!("TCK running at {} kHz", UlinkDriver::khz_from_speed(index)?);
	Ok(())
}

fn main() -> Result<()>
{
	color_eyre::install()?;
	env_logger::Builder::new()
		.filter_level(LevelFilter::Info)
		.parse_default_env()
		.init();

	let args = CliArguments::parse();
	match &args.subcommand {
		ToplevelCommands::Info => info_command(&args),
		ToplevelCommands::Idcode => idcode_command(&args),
		&ToplevelCommands::Leds { com, run } => leds_command(&args, com, run),
		&ToplevelCommands::Speed { khz } => speed_command(&args, khz),
	}
}
