// SPDX-License-Identifier: MIT OR Apache-2.0
//! The restore orchestrator: detects the device, walks it through the boot
//! modes, gathers the ticket and firmware artifacts, and finally hands the
//! prepared restore over to the streamer.

use std::fmt::{self, Display, Formatter};
use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::baseband;
use crate::client::{Client, RestoreFlags};
use crate::device;
use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::ipsw::{self, IpswArchive};
use crate::manifest::{BuildIdentity, BuildManifest, RestoreBehavior};
use crate::mode::Mode;
use crate::personalize;
use crate::plists;
use crate::ramdisk;
use crate::restored::RestoreStreamer;
use crate::transport::{Backend, DeviceQuery};
use crate::tss;
use crate::versions::{VersionData, WTF_FALLBACK_URL};

/// Milestones reported through the progress callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Step
{
	Detect,
	Prepare,
	Restore,
}

impl Display for Step
{
	fn fmt(&self, f: &mut Formatter) -> fmt::Result
	{
		match self {
			Step::Detect => write!(f, "Detect"),
			Step::Prepare => write!(f, "Prepare"),
			Step::Restore => write!(f, "Restore"),
		}
	}
}

/// Settle time after pushing a WTF image before the device re-enumerates.
const WTF_SETTLE: Duration = Duration::from_secs(1);
/// Settle time after pushing an iBEC before polling for the recovery shell.
const IBEC_SETTLE: Duration = Duration::from_secs(2);
/// Poll cadence and ceiling while waiting for a mode change.
const MODE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MODE_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Drives one restore from detection to stream hand-off. Owns the client
/// state for the duration of the run.
pub struct Restorer<'a>
{
	client: Client,
	backend: &'a mut dyn Backend,
	http: &'a dyn HttpClient,
	progress: Box<dyn FnMut(Step, f64) + 'a>,
}

impl<'a> Restorer<'a>
{
	pub fn new(client: Client, backend: &'a mut dyn Backend, http: &'a dyn HttpClient) -> Self
	{
		Self {
			client,
			backend,
			http,
			progress: Box::new(|_, _| {}),
		}
	}

	/// Install a progress callback, invoked on the control thread at the
	/// named milestones. Implementations must not block.
	pub fn with_progress(mut self, progress: impl FnMut(Step, f64) + 'a) -> Self
	{
		self.progress = Box::new(progress);
		self
	}

	pub fn client(&self) -> &Client
	{
		&self.client
	}

	/// Whether this firmware generation needs a signing ticket at all.
	fn tss_enabled(&self) -> bool
	{
		self.client.build_major > 8
	}

	fn report(&mut self, step: Step, fraction: f64)
	{
		(self.progress)(step, fraction);
	}

	/// Run a device query against whatever mode the device is currently
	/// in. Modes without a query channel answer with a device-state error.
	fn with_query<T>(&mut self, operation: impl Fn(&mut dyn DeviceQuery) -> Result<T>) -> Result<T>
	{
		match self.client.mode {
			Mode::Dfu | Mode::Wtf => {
				let mut transport = self.backend.open_dfu()?;
				operation(transport.as_mut())
			},
			Mode::Recovery => {
				let mut transport = self.backend.open_recovery()?;
				operation(transport.as_mut())
			},
			Mode::Normal => {
				let mut transport = self.backend.open_normal()?;
				operation(transport.as_mut())
			},
			Mode::Restore => {
				let mut transport = self.backend.open_restore()?;
				operation(transport.as_mut())
			},
			Mode::Unknown => Err(Error::DeviceState("no device mode detected".into())),
		}
	}

	fn wait_for_mode(&mut self, wanted: Mode) -> Result<()>
	{
		let deadline = Instant::now() + MODE_POLL_TIMEOUT;
		loop {
			let mode = self.backend.probe()?;
			if mode == wanted {
				self.client.mode = wanted;
				return Ok(());
			}
			if Instant::now() >= deadline {
				return Err(Error::Transport(format!("device did not reach {wanted} mode in time")));
			}
			thread::sleep(MODE_POLL_INTERVAL);
		}
	}

	/// A device stuck in the WTF stage first needs the matching WTF image
	/// before it behaves like a DFU device.
	fn bootstrap_wtf(&mut self, version_data: &VersionData) -> Result<()>
	{
		let mut dfu = self.backend.open_dfu()?;
		let chip_id = dfu.read_device_info()?.chip_id;
		let image_name = format!("Firmware/dfu/WTF.s5l{chip_id:04x}xall.RELEASE.dfu");
		info!("Device is in WTF mode, sending {image_name}");

		let local = self
			.client
			.ipsw
			.as_deref()
			.and_then(|path| IpswArchive::open(path).ok())
			.filter(|archive| archive.contains(&image_name).unwrap_or(false));

		let image = match local {
			Some(archive) => archive.read(&image_name)?,
			None => {
				// The local archive does not carry the image; pull the one
				// recovery archive known to have it.
				let url = version_data
					.wtf_firmware_url()
					.unwrap_or_else(|| WTF_FALLBACK_URL.to_string());
				info!("Local archive has no WTF image, downloading {url}");
				let cache = self.client.cache_path();
				let path = ipsw::fetch_archive(self.http, &url, &cache, &mut |_, _| {})?;
				IpswArchive::open(&path)?.read(&image_name)?
			},
		};

		dfu.send_image(&image)?;
		drop(dfu);
		thread::sleep(WTF_SETTLE);
		self.client.mode = Mode::Dfu;
		Ok(())
	}

	/// Resolve the device descriptor from whatever mode answered the probe.
	fn resolve_device(&mut self) -> Result<()>
	{
		let model = self.with_query(|query| query.read_hardware_model())?;
		let descriptor = device::for_hardware_model(&model)
			.ok_or_else(|| Error::DeviceState(format!("unrecognised hardware model {model}")))?;
		info!("Found {} ({})", descriptor.product_type, descriptor.hardware_model);
		self.client.device = Some(descriptor);

		self.client.image4_supported = self.with_query(|query| query.is_image4_supported())?;
		Ok(())
	}

	fn fetch_and_fix_ticket(&mut self, identity: &BuildIdentity) -> Result<()>
	{
		let sep_nonce = self.with_query(|query| query.read_sep_nonce()).ok();
		let mut ticket = tss::fetch_ticket(&mut self.client, identity, self.http, sep_nonce.as_deref())?;
		tss::fixup_ticket(&mut ticket);
		self.client.tss = Some(ticket);
		Ok(())
	}

	/// Send the device from its current mode into a recovery shell ready
	/// for the restore kick-off.
	fn transition_to_recovery(&mut self, archive: &IpswArchive, identity: &BuildIdentity) -> Result<()>
	{
		match self.client.mode {
			Mode::Normal => {
				info!("Asking the device to reboot into recovery");
				let mut normal = self.backend.open_normal()?;
				normal.enter_recovery()?;
				drop(normal);
				self.wait_for_mode(Mode::Recovery)?;
			},
			Mode::Dfu => {
				let path = identity.component_path("iBEC")?;
				let raw = archive.read(&path)?;
				let image = match &self.client.tss {
					Some(ticket) => {
						personalize::personalize_component("iBEC", &raw, ticket, self.client.keep_personalized)?
					},
					None => raw,
				};

				info!("Sending iBEC to bring up a recovery shell");
				let mut dfu = self.backend.open_dfu()?;
				dfu.send_image(&image)?;
				drop(dfu);

				thread::sleep(IBEC_SETTLE);
				self.wait_for_mode(Mode::Recovery)?;
			},
			Mode::Recovery => {
				// Already in recovery; a ticketed firmware wants its ticket
				// pushed so iBoot trusts what comes next.
				if self.tss_enabled() {
					if let Some(raw) = self
						.client
						.tss
						.as_ref()
						.and_then(|ticket| plists::data_value(ticket, "APTicket"))
						.map(<[u8]>::to_vec)
					{
						let mut recovery = self.backend.open_recovery()?;
						if let Err(error) = recovery.send_ticket(&raw) {
							warn!("Could not push the ticket to the recovery shell: {error}");
						}
					}
				}
			},
			mode => {
				return Err(Error::DeviceState(format!(
					"cannot start a restore from {mode} mode"
				)));
			},
		}
		Ok(())
	}

	/// Inspect the boot-flags field after the recovery shell came up and
	/// record the device serial for the restore kick-off.
	fn check_boot_stage(&mut self) -> Result<()>
	{
		let info = self.with_query(|query| query.read_device_info())?;
		if let Some(serial) = &info.serial_number {
			self.client.srnm = Some(serial.clone());
		}

		match info.boot_flags {
			0x03 | 0x1b => {
				if self.client.flags.contains(RestoreFlags::Custom)
					&& matches!(self.client.build_major, 9 | 13)
				{
					error!(
						"The device dropped back to iBoot instead of entering the iBEC. Custom \
						 firmware of this generation needs its boot images repatched before the \
						 device will accept them."
					);
				} else {
					error!(
						"The device dropped back to iBoot instead of entering the iBEC. Unplug \
						 the device, put it back into DFU mode and try again."
					);
				}
				Err(Error::Ibec(info.boot_flags))
			},
			0x02 | 0x1a => {
				debug!("Device entered the iBEC (boot flags {:#04x})", info.boot_flags);
				Ok(())
			},
			other => {
				debug!("Boot flags {other:#04x}, continuing");
				Ok(())
			},
		}
	}

	/// Refresh the ApNonce and re-request the ticket when it moved, so no
	/// later command relies on a ticket bound to a stale nonce.
	fn refresh_nonce(&mut self, identity: &BuildIdentity) -> Result<()>
	{
		let nonce = match self.with_query(|query| query.read_ap_nonce()) {
			Ok(nonce) => nonce,
			Err(error) => {
				warn!("Could not re-read the ApNonce: {error}");
				return Ok(());
			},
		};
		if self.client.nonce.as_deref() == Some(nonce.as_slice()) {
			return Ok(());
		}

		info!("ApNonce changed across the mode switch, requesting a fresh ticket");
		self.client.nonce = Some(nonce);
		self.fetch_and_fix_ticket(identity)
	}

	/// Post-restore housekeeping that never fails the run.
	fn cleanup(&mut self)
	{
		if let Some(device) = self.client.device {
			if device.is_apple_tv() {
				// These reboot into recovery after a restore and stay there
				// unless auto-boot is put back.
				match self.backend.open_recovery() {
					Ok(mut recovery) => {
						if let Err(error) = recovery
							.set_auto_boot(true)
							.and_then(|()| recovery.send_command("reset"))
						{
							warn!("Could not reset the device out of recovery: {error}");
						}
					},
					Err(error) => warn!("Could not reopen recovery for cleanup: {error}"),
				}
			}
		}
	}

	/// The whole restore, from probe to stream hand-off.
	pub fn run(&mut self, streamer: &mut dyn RestoreStreamer) -> Result<()>
	{
		// Detection: version data and the device itself.
		self.report(Step::Detect, 0.0);
		let cache = self.client.cache_path();
		fs::create_dir_all(&cache)?;
		let version_data = VersionData::load(&cache, self.http)?;

		self.client.mode = self.backend.probe()?;
		info!("Device found in {} mode", self.client.mode);
		if self.client.mode == Mode::Unknown {
			return Err(Error::DeviceState("no device detected in any mode".into()));
		}

		if self.client.mode == Mode::Wtf {
			self.bootstrap_wtf(&version_data)?;
		}

		self.resolve_device()?;
		self.report(Step::Detect, 0.5);

		if self.client.flags.contains(RestoreFlags::Latest) {
			let product = self.client.device()?.product_type;
			let (url, version, build) = version_data.latest_firmware(product)?;
			info!("Latest firmware for {product} is {version} ({build})");
			let progress = &mut self.progress;
			let path = ipsw::fetch_archive(self.http, &url, &cache, &mut |received, total| {
				if let Some(total) = total {
					progress(Step::Detect, 0.5 + 0.5 * received as f64 / total as f64);
				}
			})?;
			self.client.ipsw = Some(path);
		}
		if self.client.flags.contains(RestoreFlags::NoAction) {
			info!("No action requested, stopping after firmware resolution");
			return Ok(());
		}

		// A device sitting in a half-finished restore needs a reboot before
		// it can be driven anywhere.
		if self.client.mode == Mode::Restore {
			info!("Device is mid-restore, rebooting it first");
			let mut restore = self.backend.open_restore()?;
			restore.reboot()?;
			drop(restore);
			self.client.mode = self.backend.probe()?;
		}

		// The firmware archive and its manifest.
		let archive = IpswArchive::open(self.client.ipsw_path()?)?;
		let manifest = BuildManifest::parse(&archive.read("BuildManifest.plist")?)?;
		let product = self.client.device()?.product_type;
		manifest.check_compatibility(product)?;
		let (version, build) = manifest.version_info()?;
		info!("Restoring {product} to firmware {version} ({build})");
		self.client.set_version_info(version, build);

		if self.client.image4_supported {
			return Err(Error::DeviceState(
				"device expects Image4-format firmware, which this tool does not produce".into(),
			));
		}

		let behavior = if self.client.flags.contains(RestoreFlags::Update) {
			RestoreBehavior::Update
		} else {
			RestoreBehavior::Erase
		};
		let model = self.client.device()?.hardware_model;
		let mut identity = manifest
			.identity_for(model, Some(behavior))
			.ok_or_else(|| Error::Manifest(format!("no {behavior} identity for {model}")))?;
		debug!("Selected the {behavior} build identity");

		// Preparation: ticket material and the filesystem.
		self.report(Step::Prepare, 0.0);
		if self.client.ecid == 0 {
			self.client.ecid = self.with_query(|query| query.read_ecid())?;
			debug!("ECID {}", self.client.ecid);
		}
		if self.tss_enabled() {
			match self.with_query(|query| query.read_ap_nonce()) {
				Ok(nonce) => {
					if self.client.nonce.as_deref() != Some(nonce.as_slice()) {
						self.client.nonce = Some(nonce);
					}
				},
				Err(error) => warn!("Could not read the ApNonce: {error}"),
			}
		}
		if self.client.mode == Mode::Normal {
			let mut normal = self.backend.open_normal()?;
			match normal.read_preflight_info() {
				Ok(preflight) => self.client.preflight_info = preflight,
				Err(error) => warn!("Could not read baseband preflight info: {error}"),
			}
		}

		if self.tss_enabled() {
			self.fetch_and_fix_ticket(&identity)?;
			if self.client.flags.contains(RestoreFlags::ShshOnly) {
				tss::save_ticket(&self.client)?;
				return Ok(());
			}
		}

		if self.tss_enabled() && self.client.flags.contains(RestoreFlags::Rerestore) {
			identity = ramdisk::reconcile(&mut self.client, &manifest, identity, &mut |path| {
				archive.read(path)
			})?;
		}

		if self.tss_enabled() {
			if self.client.tss.is_none() {
				return Err(Error::Ticket("firmware needs a signing ticket and none was issued".into()));
			}
			if let Some(ticket) = self.client.tss.as_mut() {
				tss::fixup_ticket(ticket);
			}
		}

		let fs_entry = identity.component_path("OS")?;
		let progress = &mut self.progress;
		let filesystem = ipsw::extract_filesystem(&archive, &fs_entry, &cache, &mut |written, total| {
			progress(Step::Prepare, written as f64 / total as f64);
		})?;

		// Everything below must unwind the temporary filesystem on failure.
		let result = self.drive_to_restore(&archive, &identity, &version_data, &filesystem.path, streamer);

		if filesystem.temporary {
			debug!("Removing temporary filesystem {}", filesystem.path.display());
			let _ = fs::remove_file(&filesystem.path);
		}
		if result.is_ok() {
			self.cleanup();
			self.report(Step::Restore, 1.0);
		}
		result
	}

	fn drive_to_restore(
		&mut self,
		archive: &IpswArchive,
		identity: &BuildIdentity,
		version_data: &VersionData,
		filesystem: &std::path::Path,
		streamer: &mut dyn RestoreStreamer,
	) -> Result<()>
	{
		self.transition_to_recovery(archive, identity)?;
		self.check_boot_stage()?;

		if self.client.flags.contains(RestoreFlags::Rerestore) {
			baseband::reconcile(&mut self.client, archive, identity, version_data, self.http)?;
		}

		if !self.client.image4_supported && self.tss_enabled() {
			self.refresh_nonce(identity)?;
		}

		// Into restore mode. The device serial must be known by now: the
		// restore daemon refuses sessions that cannot name the device.
		if self.client.srnm.is_none() {
			return Err(Error::DeviceState("device serial number is not known".into()));
		}
		let mut recovery = self.backend.open_recovery()?;
		recovery.enter_restore()?;
		drop(recovery);
		self.wait_for_mode(Mode::Restore)?;

		self.report(Step::Restore, 0.0);
		let mut transport = self.backend.open_restore()?;
		streamer
			.restore(transport.as_mut(), &self.client, identity, filesystem)
			.map_err(|error| match error {
				restore_error @ Error::Restore(_) => restore_error,
				other => Error::Restore(other.to_string()),
			})
	}
}
