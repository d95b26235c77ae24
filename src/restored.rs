// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hand-off to the restore daemon that runs on the device once it boots
//! the restore ramdisk. The daemon drives the session: it asks for the
//! filesystem and for personalized firmware components one message at a
//! time, and reports status until the restore concludes.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use log::{debug, info, warn};
use plist::{Dictionary, Value};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::ipsw::IpswArchive;
use crate::manifest::BuildIdentity;
use crate::personalize;
use crate::plists;
use crate::transport::RestoreTransport;

/// The final phase of a restore: everything after the device has entered
/// restore mode. The orchestrator opens the restore-mode channel and hands
/// it over together with the prepared artifacts.
pub trait RestoreStreamer
{
	fn restore(
		&mut self,
		transport: &mut dyn RestoreTransport,
		client: &Client,
		identity: &BuildIdentity,
		filesystem: &Path,
	) -> Result<()>;
}

/// Filesystem data is streamed to the device in pieces of this size.
const FILESYSTEM_CHUNK: usize = 1 << 20;

/// Streamer speaking the device daemon's property-list message protocol
/// over a restore-mode transport. Components come straight out of the
/// client's firmware archive, personalized on the way through.
#[derive(Default)]
pub struct PlistStreamer;

impl PlistStreamer
{
	pub fn new() -> Self
	{
		Self
	}
}

struct Session<'a>
{
	transport: &'a mut dyn RestoreTransport,
	archive: &'a IpswArchive,
}

impl Session<'_>
{
	fn send(&mut self, message: Dictionary) -> Result<()>
	{
		self.transport.send_message(&Value::Dictionary(message))
	}

	fn receive(&mut self) -> Result<Dictionary>
	{
		match self.transport.receive_message()? {
			Value::Dictionary(message) => Ok(message),
			_ => Err(Error::Restore("device sent a non-dictionary message".into())),
		}
	}

	fn start_session(&mut self, identity: &BuildIdentity) -> Result<()>
	{
		let mut query = Dictionary::new();
		query.insert("Request".into(), Value::String("QueryType".into()));
		self.send(query)?;

		let answer = self.receive()?;
		match plists::str_value(&answer, "Type") {
			Some(service) => debug!("Restore daemon identifies as {service}"),
			None => warn!("Restore daemon did not identify itself, continuing anyway"),
		}

		let mut start = Dictionary::new();
		start.insert("Request".into(), Value::String("StartRestore".into()));
		if let Some(behavior) = identity.restore_behavior() {
			start.insert("RestoreBehavior".into(), Value::String(behavior.into()));
		}
		self.send(start)
	}

	fn send_file_data(&mut self, data: &[u8]) -> Result<()>
	{
		for chunk in data.chunks(FILESYSTEM_CHUNK) {
			let mut message = Dictionary::new();
			message.insert("FileData".into(), Value::Data(chunk.to_vec()));
			self.send(message)?;
		}
		let mut done = Dictionary::new();
		done.insert("FileDataDone".into(), Value::Boolean(true));
		self.send(done)
	}

	fn stream_filesystem(&mut self, filesystem: &Path) -> Result<()>
	{
		info!("Streaming filesystem {}", filesystem.display());
		let mut file = File::open(filesystem)?;
		let mut buffer = vec![0u8; FILESYSTEM_CHUNK];
		loop {
			let count = file.read(&mut buffer)?;
			if count == 0 {
				break;
			}
			let mut message = Dictionary::new();
			message.insert("FileData".into(), Value::Data(buffer[..count].to_vec()));
			self.send(message)?;
		}
		let mut done = Dictionary::new();
		done.insert("FileDataDone".into(), Value::Boolean(true));
		self.send(done)
	}

	/// Serve one personalized component. The restore daemon asks for the
	/// boot-variant names; the restore-variant manifest entry and ticket
	/// entry take precedence when the identity carries them.
	fn send_component(&mut self, client: &Client, identity: &BuildIdentity, name: &str) -> Result<()>
	{
		let restore_name = format!("Restore{name}");
		let component = if identity.has_component(&restore_name) {
			restore_name
		} else {
			name.to_string()
		};

		let path = identity.component_path(&component)?;
		let data = self.archive.read(&path)?;
		let ticket = client
			.tss
			.as_ref()
			.ok_or_else(|| Error::Restore(format!("no ticket to personalize {component} with")))?;
		let image = personalize::personalize_component(&component, &data, ticket, client.keep_personalized)?;
		self.send_file_data(&image)
	}

	fn handle_data_request(
		&mut self,
		client: &Client,
		identity: &BuildIdentity,
		filesystem: &Path,
		request: &Dictionary,
	) -> Result<()>
	{
		match plists::str_value(request, "DataType") {
			Some("SystemImageData") => self.stream_filesystem(filesystem),
			Some("KernelCache") => self.send_component(client, identity, "KernelCache"),
			Some("DeviceTree") => self.send_component(client, identity, "DeviceTree"),
			Some("BasebandData") => {
				let path = client
					.baseband_path
					.as_ref()
					.ok_or_else(|| Error::Restore("device wants baseband data but none was prepared".into()))?;
				let data = std::fs::read(path)?;
				self.send_file_data(&data)
			},
			Some(other) => {
				warn!("Unhandled data request for {other}");
				let mut done = Dictionary::new();
				done.insert("FileDataDone".into(), Value::Boolean(true));
				self.send(done)
			},
			None => Err(Error::Restore("data request without a DataType".into())),
		}
	}
}

impl RestoreStreamer for PlistStreamer
{
	fn restore(
		&mut self,
		transport: &mut dyn RestoreTransport,
		client: &Client,
		identity: &BuildIdentity,
		filesystem: &Path,
	) -> Result<()>
	{
		let archive = IpswArchive::open(client.ipsw_path()?)?;
		let mut session = Session { transport, archive: &archive };
		session.start_session(identity)?;

		loop {
			let message = session.receive()?;
			match plists::str_value(&message, "MsgType") {
				Some("StatusMsg") => {
					let status = plists::uint_value(&message, "Status").unwrap_or(0);
					if status == 0 {
						info!("Restore finished");
						return Ok(());
					}
					return Err(Error::Restore(format!("device reported status {status}")));
				},
				Some("ProgressMsg") => {
					if let Some(progress) = plists::uint_value(&message, "Progress") {
						debug!("Device restore progress: {progress}%");
					}
				},
				Some("DataRequestMsg") => {
					session.handle_data_request(client, identity, filesystem, &message)?;
				},
				Some(other) => debug!("Ignoring message of type {other}"),
				None => debug!("Ignoring message without a type"),
			}
		}
	}
}
