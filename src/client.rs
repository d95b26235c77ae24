// SPDX-License-Identifier: MIT OR Apache-2.0
//! Mutable state for a single restore run.

use std::path::{Path, PathBuf};

use bitmask_enum::bitmask;
use plist::Dictionary;

use crate::device::DeviceDescriptor;
use crate::error::{Error, Result};
use crate::mode::Mode;

/// Default signing endpoint.
pub const TSS_OFFICIAL_URL: &str = "http://gs.apple.com/TSS/controller?action=2";
/// Community mirror consulted first when replaying previously issued tickets.
pub const TSS_MIRROR_URL: &str = "http://cydia.saurik.com/TSS/controller?action=2";

/// Behaviour switches for a restore run. `Latest` and `Custom` are mutually
/// exclusive; `Rerestore` on its own implies `Erase`.
#[bitmask(u16)]
pub enum RestoreFlags
{
	Erase,
	Update,
	Rerestore,
	Latest,
	Custom,
	Debug,
	NoAction,
	ShshOnly,
}

/// All state owned by one restore run. Created once, mutated only by the
/// orchestrator, dropped on termination.
pub struct Client
{
	pub flags: RestoreFlags,
	/// Local firmware archive. Resolved by the orchestrator when `Latest`
	/// is set, required up front otherwise.
	pub ipsw: Option<PathBuf>,
	pub cache_dir: Option<PathBuf>,
	pub mode: Mode,
	pub device: Option<&'static DeviceDescriptor>,
	pub ecid: u64,
	/// Current ApNonce as owned bytes.
	pub nonce: Option<Vec<u8>>,
	pub version: Option<String>,
	pub build: Option<String>,
	/// Decimal prefix of `build`.
	pub build_major: u32,
	pub image4_supported: bool,
	/// The issued ticket, replaced (never shared) when refreshed.
	pub tss: Option<Dictionary>,
	pub tss_url: String,
	/// Device serial, required before entering restore mode.
	pub srnm: Option<String>,
	/// Baseband preflight record captured while the device was in normal mode.
	pub preflight_info: Option<Dictionary>,
	pub baseband_path: Option<PathBuf>,
	pub ota_manifest_path: Option<PathBuf>,
	/// When set, every personalized component is also written to disk.
	pub keep_personalized: bool,
}

impl Client
{
	pub fn new(flags: RestoreFlags, ipsw: Option<PathBuf>, cache_dir: Option<PathBuf>) -> Result<Self>
	{
		if flags.contains(RestoreFlags::Latest) && flags.contains(RestoreFlags::Custom) {
			return Err(Error::Configuration(
				"latest firmware and custom firmware cannot be combined".into(),
			));
		}
		if ipsw.is_none() && !flags.contains(RestoreFlags::Latest) {
			return Err(Error::Configuration("no firmware archive given".into()));
		}

		// A re-restore that names neither behaviour gets the full-wipe one.
		let mut flags = flags;
		if flags.contains(RestoreFlags::Rerestore)
			&& !flags.intersects(RestoreFlags::Erase | RestoreFlags::Update)
		{
			flags |= RestoreFlags::Erase;
		}

		Ok(Self {
			flags,
			ipsw,
			cache_dir,
			mode: Mode::Unknown,
			device: None,
			ecid: 0,
			nonce: None,
			version: None,
			build: None,
			build_major: 0,
			image4_supported: false,
			tss: None,
			tss_url: TSS_OFFICIAL_URL.into(),
			srnm: None,
			preflight_info: None,
			baseband_path: None,
			ota_manifest_path: None,
			keep_personalized: false,
		})
	}

	/// The directory cached artifacts live under. Falls back to the working
	/// directory when none was configured.
	pub fn cache_path(&self) -> PathBuf
	{
		self.cache_dir.clone().unwrap_or_else(|| PathBuf::from("."))
	}

	pub fn ipsw_path(&self) -> Result<&Path>
	{
		self.ipsw
			.as_deref()
			.ok_or_else(|| Error::Configuration("no firmware archive given".into()))
	}

	pub fn device(&self) -> Result<&'static DeviceDescriptor>
	{
		self.device
			.ok_or_else(|| Error::DeviceState("device has not been identified yet".into()))
	}

	/// Record the target firmware version, deriving the numeric build major.
	pub fn set_version_info(&mut self, version: String, build: String)
	{
		self.build_major = decimal_prefix(&build);
		self.version = Some(version);
		self.build = Some(build);
	}

	/// Where a ticket for this exact (device, firmware) pair is cached.
	pub fn shsh_file_path(&self) -> Result<PathBuf>
	{
		let device = self.device()?;
		let version = self
			.version
			.as_deref()
			.ok_or_else(|| Error::Ticket("target firmware version unknown".into()))?;
		let build = self
			.build
			.as_deref()
			.ok_or_else(|| Error::Ticket("target firmware build unknown".into()))?;
		Ok(self.cache_path().join("shsh").join(format!(
			"{}-{}-{}-{}.shsh",
			self.ecid, device.product_type, version, build
		)))
	}
}

/// Leading decimal digits of a build string: `"10B329"` yields 10.
pub fn decimal_prefix(build: &str) -> u32
{
	let digits: String = build.chars().take_while(|c| c.is_ascii_digit()).collect();
	digits.parse().unwrap_or(0)
}
