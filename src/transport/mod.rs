// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-mode device channels. Each boot mode exposes a different slice
//! of functionality; the orchestrator talks to all of them through these
//! traits so the state machine can be exercised against scripted devices.

pub mod usb;

use plist::{Dictionary, Value};

use crate::error::Result;
use crate::mode::Mode;

/// The device info record boot-chain modes report.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo
{
	pub chip_id: u32,
	pub board_id: u32,
	pub ecid: u64,
	/// Boot-stage flags; consulted after an iBEC hand-off.
	pub boot_flags: u64,
	pub serial_number: Option<String>,
}

/// What every mode can be asked about the attached device. Modes that lack
/// a capability answer with a device-state error.
pub trait DeviceQuery
{
	fn read_hardware_model(&mut self) -> Result<String>;
	fn read_ecid(&mut self) -> Result<u64>;
	fn read_ap_nonce(&mut self) -> Result<Vec<u8>>;
	fn read_sep_nonce(&mut self) -> Result<Vec<u8>>;
	fn is_image4_supported(&mut self) -> Result<bool>;
	fn read_device_info(&mut self) -> Result<DeviceInfo>;
}

/// The DFU (and WTF) channel: raw image upload into the boot ROM.
pub trait DfuTransport: DeviceQuery
{
	fn send_image(&mut self, image: &[u8]) -> Result<()>;
}

/// The recovery (iBoot) channel.
pub trait RecoveryTransport: DeviceQuery
{
	fn send_image(&mut self, image: &[u8]) -> Result<()>;
	fn send_command(&mut self, command: &str) -> Result<()>;
	fn send_ticket(&mut self, ticket: &[u8]) -> Result<()>;
	fn set_auto_boot(&mut self, enabled: bool) -> Result<()>;
	/// Kick the device over into restore mode.
	fn enter_restore(&mut self) -> Result<()>;
	fn reboot(&mut self) -> Result<()>;
}

/// The normal-mode (booted OS) channel.
pub trait NormalTransport: DeviceQuery
{
	fn enter_recovery(&mut self) -> Result<()>;
	/// Baseband preflight record, for devices that have a baseband at all.
	fn read_preflight_info(&mut self) -> Result<Option<Dictionary>>;
}

/// The restore-mode channel: a property-list message stream.
pub trait RestoreTransport: DeviceQuery
{
	fn send_message(&mut self, message: &Value) -> Result<()>;
	fn receive_message(&mut self) -> Result<Value>;
	fn reboot(&mut self) -> Result<()>;
}

/// Factory for the per-mode channels, plus the mode probe. Opening a
/// channel for a mode the device is not in fails with a transport error.
pub trait Backend
{
	/// Detect the device's current mode. Probes are tried in a fixed
	/// order: recovery, DFU (which distinguishes WTF), normal, restore;
	/// the first to answer wins and `Unknown` means none did.
	fn probe(&mut self) -> Result<Mode>;

	fn open_dfu(&mut self) -> Result<Box<dyn DfuTransport>>;
	fn open_recovery(&mut self) -> Result<Box<dyn RecoveryTransport>>;
	fn open_normal(&mut self) -> Result<Box<dyn NormalTransport>>;
	fn open_restore(&mut self) -> Result<Box<dyn RestoreTransport>>;
}
