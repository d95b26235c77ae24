// SPDX-License-Identifier: MIT OR Apache-2.0
//! Combine raw firmware components with ticket material to produce images
//! the device's boot chain will accept.

use std::fs;
use std::path::Path;

use log::{debug, info};
use plist::Dictionary;

use crate::error::{Error, Result};
use crate::img3;
use crate::plists;

/// Personalize one component. The ticket decides the strategy: components
/// with a per-entry signature blob get it stitched into their IMG3
/// signature slot; components the ticket does not cover pass through
/// unchanged.
pub fn personalize(name: &str, data: &[u8], ticket: &Dictionary) -> Result<Vec<u8>>
{
	// A whole-ticket Image4 response would call for rebuilding the
	// container instead of patching it. Devices on that format are refused
	// long before personalization, so finding one here means the refusal
	// was bypassed somehow.
	if plists::data_value(ticket, "ApImg4Ticket").is_some() {
		return Err(Error::Ticket(
			"ticket carries an Image4 blob, which this tool cannot stitch".into(),
		));
	}

	match component_blob(ticket, name) {
		Some(blob) => {
			debug!("Stitching {}-byte signature blob into {name}", blob.len());
			let mut image = data.to_vec();
			img3::stitch_signature(&mut image, blob)
				.map_err(|error| Error::Ticket(format!("failed to personalize {name}: {error}")))?;
			Ok(image)
		},
		None => {
			info!("Component {name} is not personalized by this ticket, using it as-is");
			Ok(data.to_vec())
		},
	}
}

/// As [personalize], optionally dumping the stitched artifact into the
/// working directory for inspection.
pub fn personalize_component(
	name: &str,
	data: &[u8],
	ticket: &Dictionary,
	keep_personalized: bool,
) -> Result<Vec<u8>>
{
	let image = personalize(name, data, ticket)?;
	if keep_personalized {
		let file_name = Path::new(name)
			.file_name()
			.map(|base| base.to_string_lossy().into_owned())
			.unwrap_or_else(|| name.to_string());
		fs::write(&file_name, &image)?;
		info!("Kept personalized {name} as {file_name}");
	}
	Ok(image)
}

/// The per-entry signature blob for a component, wherever the signing
/// service put it: directly under the component name, or one level down
/// under `Blob`.
fn component_blob<'a>(ticket: &'a Dictionary, name: &str) -> Option<&'a [u8]>
{
	match ticket.get(name)? {
		plist::Value::Data(blob) => Some(blob.as_slice()),
		plist::Value::Dictionary(entry) => plists::data_value(entry, "Blob"),
		_ => None,
	}
}

#[cfg(test)]
mod tests
{
	use plist::Value;

	use super::*;
	use crate::img3::{MIN_IMAGE_LEN, SIGNATURE_BLOB_LEN, test_image};

	fn ticket_with_blob(name: &str, blob: Vec<u8>) -> Dictionary
	{
		let mut entry = Dictionary::new();
		entry.insert("Blob".into(), Value::Data(blob));
		entry.insert("Trusted".into(), Value::Boolean(true));
		let mut ticket = Dictionary::new();
		ticket.insert(name.into(), Value::Dictionary(entry));
		ticket
	}

	#[test]
	fn stitches_when_the_ticket_covers_the_component()
	{
		let ticket = ticket_with_blob("KernelCache", vec![0xC3; SIGNATURE_BLOB_LEN]);
		let image = test_image(16, &[0x11; 90]);
		let out = personalize("KernelCache", &image, &ticket).unwrap();
		assert_eq!(&out[MIN_IMAGE_LEN + 16..MIN_IMAGE_LEN + 16 + SIGNATURE_BLOB_LEN], &[0xC3; SIGNATURE_BLOB_LEN]);
	}

	#[test]
	fn accepts_a_bare_data_entry()
	{
		let mut ticket = Dictionary::new();
		ticket.insert("DeviceTree".into(), Value::Data(vec![0x5A; SIGNATURE_BLOB_LEN]));
		let image = test_image(16, &[0x11; 90]);
		let out = personalize("DeviceTree", &image, &ticket).unwrap();
		assert_eq!(&out[MIN_IMAGE_LEN + 16..MIN_IMAGE_LEN + 16 + SIGNATURE_BLOB_LEN], &[0x5A; SIGNATURE_BLOB_LEN]);
	}

	#[test]
	fn uncovered_components_pass_through()
	{
		let ticket = ticket_with_blob("KernelCache", vec![0xC3; SIGNATURE_BLOB_LEN]);
		let image = test_image(16, &[0x11; 90]);
		let out = personalize("RestoreLogo", &image, &ticket).unwrap();
		assert_eq!(out, image);
	}

	#[test]
	fn a_bad_blob_is_fatal_for_the_component()
	{
		let ticket = ticket_with_blob("KernelCache", vec![0xC3; 8]);
		let image = test_image(16, &[0x11; 90]);
		assert!(personalize("KernelCache", &image, &ticket).is_err());
	}

	#[test]
	fn image4_tickets_are_refused()
	{
		let mut ticket = Dictionary::new();
		ticket.insert("ApImg4Ticket".into(), Value::Data(vec![0x30, 0x82]));
		let image = test_image(16, &[0x11; 90]);
		assert!(personalize("KernelCache", &image, &ticket).is_err());
	}
}
