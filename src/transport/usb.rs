// SPDX-License-Identifier: MIT OR Apache-2.0
//! USB backend for the boot-chain modes (DFU, WTF and recovery), built on
//! nusb. The boot chain reports its device record through the USB serial
//! string; commands and images go over control and bulk transfers.
//!
//! Normal and restore mode speak through the OS-side multiplexing daemon
//! rather than raw USB, so this backend cannot open those channels; the
//! orchestrator surfaces that as a device-state error.

use std::fmt::{self, Display};
use std::time::Duration;

use futures_lite::future::block_on;
use log::{debug, trace, warn};
use nusb::transfer::{Control, ControlType, Recipient};
use nusb::{Device, Interface};

use super::{Backend, DeviceInfo, DeviceQuery, DfuTransport, NormalTransport, RecoveryTransport, RestoreTransport};
use crate::device;
use crate::error::{Error, Result};
use crate::mode::Mode;

/// Simple newtype struct for some clarity in function arguments and whatnot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Vid(pub u16);

/// Simple newtype struct for some clarity in function arguments and whatnot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub u16);

pub const APPLE_VID: Vid = Vid(0x05ac);

/// Boot ROM firmware-update mode.
pub const PID_DFU: Pid = Pid(0x1227);
/// The pre-bootrom "WTF" stage of the oldest devices.
pub const PID_WTF: Pid = Pid(0x1222);
/// iBoot recovery shells.
pub const PID_RECOVERY: &[Pid] = &[Pid(0x1280), Pid(0x1281), Pid(0x1282), Pid(0x1283)];
/// Booted OS (normal and restore environments share this range; the
/// product string tells them apart).
pub const PID_OS_FIRST: Pid = Pid(0x1290);
pub const PID_OS_LAST: Pid = Pid(0x12af);

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

/// Upload block size used by the boot ROM's update protocol.
const DFU_BLOCK_SIZE: usize = 0x800;

/// Request numbers of the boot ROM's firmware-update protocol.
#[derive(Debug, Copy, Clone)]
enum DfuRequest
{
	Dnload = 1,
	GetStatus = 3,
}

/// Vendor request that exposes the boot nonces.
const REQUEST_GET_NONCE: u8 = 0x0c;
const NONCE_INDEX_AP: u16 = 0;
const NONCE_INDEX_SEP: u16 = 1;

/// First chip generation using the Image4 container format.
const FIRST_IMG4_CHIP_ID: u32 = 0x8960;

pub struct UsbBackend;

impl UsbBackend
{
	pub fn new() -> Self
	{
		Self
	}

	fn find_device(wanted: fn(Pid) -> bool) -> Result<Option<nusb::DeviceInfo>>
	{
		let devices = nusb::list_devices()
			.map_err(|error| Error::Transport(format!("cannot enumerate USB devices: {error}")))?;
		Ok(devices
			.filter(|info| Vid(info.vendor_id()) == APPLE_VID)
			.find(|info| wanted(Pid(info.product_id()))))
	}
}

impl Default for UsbBackend
{
	fn default() -> Self
	{
		Self::new()
	}
}

impl Backend for UsbBackend
{
	fn probe(&mut self) -> Result<Mode>
	{
		if Self::find_device(|pid| PID_RECOVERY.contains(&pid))?.is_some() {
			return Ok(Mode::Recovery);
		}
		// The update-mode probe tells DFU proper and the older WTF stage
		// apart by the product id it answers with.
		if let Some(info) = Self::find_device(|pid| pid == PID_DFU || pid == PID_WTF)? {
			return Ok(if Pid(info.product_id()) == PID_WTF { Mode::Wtf } else { Mode::Dfu });
		}
		if let Some(info) = Self::find_device(|pid| pid >= PID_OS_FIRST && pid <= PID_OS_LAST)? {
			let restoring = info
				.product_string()
				.map(|product| product.contains("Restore"))
				.unwrap_or(false);
			return Ok(if restoring { Mode::Restore } else { Mode::Normal });
		}
		Ok(Mode::Unknown)
	}

	fn open_dfu(&mut self) -> Result<Box<dyn DfuTransport>>
	{
		let info = Self::find_device(|pid| pid == PID_DFU || pid == PID_WTF)?
			.ok_or_else(|| Error::Transport("no device in DFU mode found".into()))?;
		Ok(Box::new(BootRomChannel::open(info)?))
	}

	fn open_recovery(&mut self) -> Result<Box<dyn RecoveryTransport>>
	{
		let info = Self::find_device(|pid| PID_RECOVERY.contains(&pid))?
			.ok_or_else(|| Error::Transport("no device in recovery mode found".into()))?;
		Ok(Box::new(RecoveryChannel::open(info)?))
	}

	fn open_normal(&mut self) -> Result<Box<dyn NormalTransport>>
	{
		Err(Error::DeviceState(
			"normal mode is serviced by the usbmux daemon, which this backend does not drive".into(),
		))
	}

	fn open_restore(&mut self) -> Result<Box<dyn RestoreTransport>>
	{
		Err(Error::DeviceState(
			"restore mode is serviced by the usbmux daemon, which this backend does not drive".into(),
		))
	}
}

/// Fields of the boot chain's USB serial string, e.g.
/// `CPID:8950 CPRV:20 CPFM:03 SCEP:01 BDID:02 ECID:0000A1B2C3D4E5F6 IBFL:1A SRNM:[C39JQZZZDTD2]`.
#[derive(Debug, Clone, Default)]
struct SerialFields
{
	chip_id: u32,
	board_id: u32,
	ecid: u64,
	boot_flags: u64,
	serial_number: Option<String>,
}

impl SerialFields
{
	fn parse(serial: &str) -> Self
	{
		let mut fields = Self::default();
		for token in serial.split_whitespace() {
			let Some((key, value)) = token.split_once(':') else {
				continue;
			};
			match key {
				"CPID" => fields.chip_id = u32::from_str_radix(value, 16).unwrap_or(0),
				"BDID" => fields.board_id = u32::from_str_radix(value, 16).unwrap_or(0),
				"ECID" => fields.ecid = u64::from_str_radix(value, 16).unwrap_or(0),
				"IBFL" => fields.boot_flags = u64::from_str_radix(value, 16).unwrap_or(0),
				"SRNM" => {
					let serial = value.trim_start_matches('[').trim_end_matches(']');
					if !serial.is_empty() {
						fields.serial_number = Some(serial.to_string());
					}
				},
				_ => {},
			}
		}
		fields
	}

	fn to_device_info(&self) -> DeviceInfo
	{
		DeviceInfo {
			chip_id: self.chip_id,
			board_id: self.board_id,
			ecid: self.ecid,
			boot_flags: self.boot_flags,
			serial_number: self.serial_number.clone(),
		}
	}
}

/// Shared plumbing of the boot-chain channels.
struct BootChain
{
	#[allow(dead_code)]
	device: Device,
	interface: Interface,
	fields: SerialFields,
}

impl BootChain
{
	fn open(info: nusb::DeviceInfo) -> Result<Self>
	{
		let fields = SerialFields::parse(info.serial_number().unwrap_or(""));
		trace!("Boot chain serial fields: {fields:?}");
		let device = info
			.open()
			.map_err(|error| Error::Transport(format!("cannot open device: {error}")))?;
		let interface = device
			.claim_interface(0)
			.map_err(|error| Error::Transport(format!("cannot claim interface: {error}")))?;
		Ok(Self { device, interface, fields })
	}

	fn read_nonce(&self, index: u16) -> Result<Vec<u8>>
	{
		let mut buffer = [0u8; 32];
		let control = Control {
			control_type: ControlType::Vendor,
			recipient: Recipient::Device,
			request: REQUEST_GET_NONCE,
			value: 0,
			index,
		};
		let count = self
			.interface
			.control_in_blocking(control, &mut buffer, TRANSFER_TIMEOUT)
			.map_err(|error| Error::Transport(format!("nonce read failed: {error}")))?;
		if count == 0 {
			return Err(Error::Transport("device returned an empty nonce".into()));
		}
		Ok(buffer[..count].to_vec())
	}

	fn query(&mut self) -> QueryImpl<'_>
	{
		QueryImpl { chain: self }
	}
}

/// One DeviceQuery implementation serves every boot-chain mode; the modes
/// differ only in what else they can do.
struct QueryImpl<'a>
{
	chain: &'a BootChain,
}

impl QueryImpl<'_>
{
	fn hardware_model(&self) -> Result<String>
	{
		device::for_chip_and_board(self.chain.fields.chip_id, self.chain.fields.board_id)
			.map(|descriptor| descriptor.hardware_model.to_string())
			.ok_or_else(|| {
				Error::DeviceState(format!(
					"unknown device with chip id {:#06x} board id {:#04x}",
					self.chain.fields.chip_id, self.chain.fields.board_id
				))
			})
	}
}

macro_rules! boot_chain_device_query
{
	($type:ty) => {
		impl DeviceQuery for $type
		{
			fn read_hardware_model(&mut self) -> Result<String>
			{
				self.chain.query().hardware_model()
			}

			fn read_ecid(&mut self) -> Result<u64>
			{
				Ok(self.chain.fields.ecid)
			}

			fn read_ap_nonce(&mut self) -> Result<Vec<u8>>
			{
				self.chain.read_nonce(NONCE_INDEX_AP)
			}

			fn read_sep_nonce(&mut self) -> Result<Vec<u8>>
			{
				self.chain.read_nonce(NONCE_INDEX_SEP)
			}

			fn is_image4_supported(&mut self) -> Result<bool>
			{
				Ok(self.chain.fields.chip_id >= FIRST_IMG4_CHIP_ID)
			}

			fn read_device_info(&mut self) -> Result<DeviceInfo>
			{
				Ok(self.chain.fields.to_device_info())
			}
		}
	};
}

/// DFU/WTF channel.
pub struct BootRomChannel
{
	chain: BootChain,
}

boot_chain_device_query!(BootRomChannel);

impl BootRomChannel
{
	fn open(info: nusb::DeviceInfo) -> Result<Self>
	{
		Ok(Self { chain: BootChain::open(info)? })
	}

	fn dnload(&self, block: u16, data: &[u8]) -> Result<()>
	{
		let control = Control {
			control_type: ControlType::Class,
			recipient: Recipient::Interface,
			request: DfuRequest::Dnload as u8,
			value: block,
			index: 0,
		};
		self.chain
			.interface
			.control_out_blocking(control, data, TRANSFER_TIMEOUT)
			.map_err(|error| Error::Transport(format!("DFU upload failed at block {block}: {error}")))?;
		Ok(())
	}

	fn get_status(&self) -> Result<()>
	{
		let mut status = [0u8; 6];
		let control = Control {
			control_type: ControlType::Class,
			recipient: Recipient::Interface,
			request: DfuRequest::GetStatus as u8,
			value: 0,
			index: 0,
		};
		self.chain
			.interface
			.control_in_blocking(control, &mut status, TRANSFER_TIMEOUT)
			.map_err(|error| Error::Transport(format!("DFU status read failed: {error}")))?;
		trace!("DFU status {:#04x}, state {:#04x}", status[0], status[4]);
		Ok(())
	}
}

impl DfuTransport for BootRomChannel
{
	fn send_image(&mut self, image: &[u8]) -> Result<()>
	{
		debug!("Uploading {} bytes over the boot ROM update protocol", image.len());
		for (block, chunk) in image.chunks(DFU_BLOCK_SIZE).enumerate() {
			self.dnload(block as u16, chunk)?;
		}
		// A zero-length block finishes the transfer; the ROM then expects
		// status polls to run its manifest phase before it executes the
		// image.
		self.dnload(image.chunks(DFU_BLOCK_SIZE).len() as u16, &[])?;
		for _ in 0..3 {
			self.get_status()?;
		}
		Ok(())
	}
}

/// Recovery (iBoot) channel.
pub struct RecoveryChannel
{
	chain: BootChain,
}

boot_chain_device_query!(RecoveryChannel);

/// Endpoint iBoot accepts file uploads on.
const RECOVERY_FILE_ENDPOINT: u8 = 0x04;

impl RecoveryChannel
{
	fn open(info: nusb::DeviceInfo) -> Result<Self>
	{
		let chain = BootChain::open(info)?;
		// File uploads need the bulk alternate; command-only sessions work
		// either way, so a refusal is not fatal here.
		if let Err(error) = chain.interface.set_alt_setting(1) {
			warn!("Could not select the bulk alternate setting: {error}");
		}
		Ok(Self { chain })
	}

	fn send_buffer(&mut self, data: &[u8]) -> Result<()>
	{
		let completion = block_on(
			self.chain
				.interface
				.bulk_out(RECOVERY_FILE_ENDPOINT, data.to_vec()),
		);
		completion
			.into_result()
			.map_err(|error| Error::Transport(format!("bulk upload failed: {error}")))?;
		Ok(())
	}
}

impl RecoveryTransport for RecoveryChannel
{
	fn send_image(&mut self, image: &[u8]) -> Result<()>
	{
		debug!("Uploading {} bytes to the recovery shell", image.len());
		self.send_buffer(image)
	}

	fn send_command(&mut self, command: &str) -> Result<()>
	{
		debug!("Recovery command: {command}");
		let mut data = command.as_bytes().to_vec();
		data.push(0);
		let control = Control {
			control_type: ControlType::Vendor,
			recipient: Recipient::Device,
			request: 0,
			value: 0,
			index: 0,
		};
		self.chain
			.interface
			.control_out_blocking(control, &data, TRANSFER_TIMEOUT)
			.map_err(|error| Error::Transport(format!("command '{command}' failed: {error}")))?;
		Ok(())
	}

	fn send_ticket(&mut self, ticket: &[u8]) -> Result<()>
	{
		self.send_buffer(ticket)?;
		self.send_command("ticket")
	}

	fn set_auto_boot(&mut self, enabled: bool) -> Result<()>
	{
		self.send_command(&format!("setenv auto-boot {enabled}"))?;
		self.send_command("saveenv")
	}

	fn enter_restore(&mut self) -> Result<()>
	{
		self.set_auto_boot(false)?;
		self.send_command("bootx")
	}

	fn reboot(&mut self) -> Result<()>
	{
		self.send_command("reboot")
	}
}

impl Display for Vid
{
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
	{
		write!(f, "{:#06x}", self.0)
	}
}

impl Display for Pid
{
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
	{
		write!(f, "{:#06x}", self.0)
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn serial_fields_parse_the_boot_chain_record()
	{
		let fields = SerialFields::parse(
			"CPID:8950 CPRV:20 CPFM:03 SCEP:01 BDID:02 ECID:0000A1B2C3D4E5F6 IBFL:1A SRTG:[iBoot-1145.3] SRNM:[C39JQZZZDTD2]",
		);
		assert_eq!(fields.chip_id, 0x8950);
		assert_eq!(fields.board_id, 0x02);
		assert_eq!(fields.ecid, 0x0000_A1B2_C3D4_E5F6);
		assert_eq!(fields.boot_flags, 0x1A);
		assert_eq!(fields.serial_number.as_deref(), Some("C39JQZZZDTD2"));
	}

	#[test]
	fn serial_fields_tolerate_partial_records()
	{
		let fields = SerialFields::parse("CPID:8900 SRNM:[]");
		assert_eq!(fields.chip_id, 0x8900);
		assert_eq!(fields.ecid, 0);
		assert!(fields.serial_number.is_none());
	}
}
