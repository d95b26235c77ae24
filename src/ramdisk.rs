// SPDX-License-Identifier: MIT OR Apache-2.0
//! Decide which build identity a previously issued ticket actually
//! authorizes, by locating the restore ramdisk's digest inside the raw
//! ticket bytes.

use log::{debug, info, warn};
use sha1::{Digest, Sha1};

use crate::client::{Client, RestoreFlags};
use crate::error::Result;
use crate::img3;
use crate::manifest::{BuildManifest, BuildIdentity, RestoreBehavior};
use crate::plists;

/// Reads a component out of the firmware archive by its archive-relative
/// path.
pub type ComponentReader<'a> = dyn FnMut(&str) -> Result<Vec<u8>> + 'a;

/// Match the current identity's restore ramdisk against the ticket,
/// flipping between the Erase and Update identities when the first choice
/// does not match, and falling back to a custom restore when neither does.
///
/// The behaviour flags and the returned identity always change together,
/// so the caller can never observe a mismatched pair.
pub fn reconcile(
	client: &mut Client,
	manifest: &BuildManifest,
	current: BuildIdentity,
	read_component: &mut ComponentReader,
) -> Result<BuildIdentity>
{
	let Some(ticket) = client.tss.as_ref() else {
		warn!("No ticket to reconcile the ramdisk against");
		return Ok(current);
	};
	let Some(ticket_bytes) = plists::data_value(ticket, "APTicket").map(<[u8]>::to_vec) else {
		warn!("Ticket carries no raw APTicket data, keeping the selected identity");
		return Ok(current);
	};

	let model = client.device()?.hardware_model;
	let original_behavior = behavior_from_flags(client.flags);
	let mut identity = current;
	let mut flipped = false;

	loop {
		let path = identity.component_path("RestoreRamDisk")?;
		let image = read_component(&path)?;

		if image.len() < img3::MIN_IMAGE_LEN {
			warn!("Restore ramdisk {path} is too short to examine, keeping the selected identity");
			return Ok(identity);
		}
		if img3::is_unsigned(&image) {
			info!("Restore ramdisk {path} is unsigned, treating this as a custom restore");
			client.flags |= RestoreFlags::Custom;
			return Ok(identity);
		}

		let digest = Sha1::digest(&image[img3::SIGNED_REGION_OFFSET..]);
		if ticket_contains(&ticket_bytes, &digest) {
			debug!("Ticket authorizes the {} ramdisk", behavior_from_flags(client.flags));
			return Ok(identity);
		}

		if !flipped {
			// The ticket was issued for the other restore behaviour; see
			// whether the manifest has that identity before committing to
			// the switch.
			flipped = true;
			let other = opposite(behavior_from_flags(client.flags));
			match manifest.identity_for(model, Some(other)) {
				Some(next) => {
					info!("Ticket does not match the {original_behavior} ramdisk, trying {other}");
					set_behavior(client, other);
					identity = next;
					continue;
				},
				None => {
					warn!("Manifest has no {other} identity, keeping {original_behavior}");
					return restore_original(client, manifest, model, original_behavior, identity);
				},
			}
		}

		// Neither ramdisk is covered by the ticket: assume custom firmware
		// and settle on the full-wipe identity.
		info!("Ticket matches neither ramdisk, assuming custom firmware");
		set_behavior(client, RestoreBehavior::Erase);
		client.flags |= RestoreFlags::Custom;
		return match manifest.identity_for(model, Some(RestoreBehavior::Erase)) {
			Some(erase) => Ok(erase),
			None => Ok(identity),
		};
	}
}

fn restore_original(
	client: &mut Client,
	manifest: &BuildManifest,
	model: &str,
	behavior: RestoreBehavior,
	fallback: BuildIdentity,
) -> Result<BuildIdentity>
{
	set_behavior(client, behavior);
	Ok(manifest.identity_for(model, Some(behavior)).unwrap_or(fallback))
}

/// Linear scan of the ticket buffer for a component digest.
fn ticket_contains(ticket: &[u8], digest: &[u8]) -> bool
{
	ticket.windows(digest.len()).any(|window| window == digest)
}

fn behavior_from_flags(flags: RestoreFlags) -> RestoreBehavior
{
	if flags.contains(RestoreFlags::Update) {
		RestoreBehavior::Update
	} else {
		RestoreBehavior::Erase
	}
}

fn opposite(behavior: RestoreBehavior) -> RestoreBehavior
{
	match behavior {
		RestoreBehavior::Erase => RestoreBehavior::Update,
		RestoreBehavior::Update => RestoreBehavior::Erase,
	}
}

fn set_behavior(client: &mut Client, behavior: RestoreBehavior)
{
	client.flags &= !(RestoreFlags::Erase | RestoreFlags::Update);
	client.flags |= match behavior {
		RestoreBehavior::Erase => RestoreFlags::Erase,
		RestoreBehavior::Update => RestoreFlags::Update,
	};
}

#[cfg(test)]
mod tests
{
	use std::collections::HashMap;

	use plist::{Dictionary, Value};

	use super::*;
	use crate::device;
	use crate::img3::test_image;

	const ERASE_RAMDISK: &str = "038-6494-001.dmg";
	const UPDATE_RAMDISK: &str = "038-6496-001.dmg";

	fn identity(behavior: &str, ramdisk: &str) -> Value
	{
		let mut info = Dictionary::new();
		info.insert("DeviceClass".into(), Value::String("n42ap".into()));
		info.insert("RestoreBehavior".into(), Value::String(behavior.into()));
		let mut path_info = Dictionary::new();
		path_info.insert("Path".into(), Value::String(ramdisk.into()));
		let mut component = Dictionary::new();
		component.insert("Info".into(), Value::Dictionary(path_info));
		let mut manifest = Dictionary::new();
		manifest.insert("RestoreRamDisk".into(), Value::Dictionary(component));
		let mut dict = Dictionary::new();
		dict.insert("Info".into(), Value::Dictionary(info));
		dict.insert("Manifest".into(), Value::Dictionary(manifest));
		Value::Dictionary(dict)
	}

	fn manifest(identities: Vec<Value>) -> BuildManifest
	{
		let mut root = Dictionary::new();
		root.insert("BuildIdentities".into(), Value::Array(identities));
		BuildManifest::from_dictionary(root)
	}

	fn client_with_ticket(flags: RestoreFlags, ticket_bytes: Vec<u8>) -> Client
	{
		let mut client = Client::new(flags, Some("a.ipsw".into()), None).unwrap();
		client.device = device::for_product_type("iPhone5,2");
		let mut ticket = Dictionary::new();
		ticket.insert("APTicket".into(), Value::Data(ticket_bytes));
		client.tss = Some(ticket);
		client
	}

	fn ticket_for(images: &[&[u8]]) -> Vec<u8>
	{
		// A plausible ticket: opaque leading bytes, then the digests of the
		// authorized images somewhere inside.
		let mut bytes = vec![0x30, 0x82, 0x01, 0x00];
		for image in images {
			bytes.extend_from_slice(&[0u8; 7]);
			bytes.extend_from_slice(&Sha1::digest(&image[img3::SIGNED_REGION_OFFSET..]));
		}
		bytes.extend_from_slice(&[0xFFu8; 9]);
		bytes
	}

	fn reader<'a>(files: &'a HashMap<String, Vec<u8>>) -> impl FnMut(&str) -> Result<Vec<u8>> + 'a
	{
		move |path: &str| {
			files
				.get(path)
				.cloned()
				.ok_or_else(|| crate::error::Error::Extraction(format!("no entry {path}")))
		}
	}

	fn fixture(erase_body: &[u8], update_body: &[u8]) -> (BuildManifest, HashMap<String, Vec<u8>>)
	{
		let mut files = HashMap::new();
		files.insert(ERASE_RAMDISK.to_string(), erase_body.to_vec());
		files.insert(UPDATE_RAMDISK.to_string(), update_body.to_vec());
		let manifest = manifest(vec![
			identity("Erase", ERASE_RAMDISK),
			identity("Update", UPDATE_RAMDISK),
		]);
		(manifest, files)
	}

	#[test]
	fn matching_erase_identity_is_kept()
	{
		let erase = test_image(16, &[0xE1; 64]);
		let update = test_image(16, &[0x07; 64]);
		let (manifest, files) = fixture(&erase, &update);

		let mut client = client_with_ticket(
			RestoreFlags::Rerestore | RestoreFlags::Erase,
			ticket_for(&[&erase]),
		);
		let current = manifest.identity_for("n42ap", Some(RestoreBehavior::Erase)).unwrap();
		let chosen = reconcile(&mut client, &manifest, current, &mut reader(&files)).unwrap();

		assert_eq!(chosen.restore_behavior(), Some("Erase"));
		assert!(client.flags.contains(RestoreFlags::Erase));
		assert!(!client.flags.contains(RestoreFlags::Custom));
	}

	#[test]
	fn switches_to_update_when_only_that_hash_is_present()
	{
		let erase = test_image(16, &[0xE1; 64]);
		let update = test_image(16, &[0x07; 64]);
		let (manifest, files) = fixture(&erase, &update);

		let mut client = client_with_ticket(
			RestoreFlags::Rerestore | RestoreFlags::Erase,
			ticket_for(&[&update]),
		);
		let current = manifest.identity_for("n42ap", Some(RestoreBehavior::Erase)).unwrap();
		let chosen = reconcile(&mut client, &manifest, current, &mut reader(&files)).unwrap();

		assert_eq!(chosen.restore_behavior(), Some("Update"));
		assert!(client.flags.contains(RestoreFlags::Update));
		assert!(!client.flags.contains(RestoreFlags::Erase));
		assert!(!client.flags.contains(RestoreFlags::Custom));
	}

	#[test]
	fn unsigned_ramdisk_marks_a_custom_restore()
	{
		let erase = test_image(0, &[0xE1; 64]);
		let update = test_image(16, &[0x07; 64]);
		let (manifest, files) = fixture(&erase, &update);

		let mut client = client_with_ticket(
			RestoreFlags::Rerestore | RestoreFlags::Erase,
			ticket_for(&[]),
		);
		let current = manifest.identity_for("n42ap", Some(RestoreBehavior::Erase)).unwrap();
		let chosen = reconcile(&mut client, &manifest, current, &mut reader(&files)).unwrap();

		// No hashing happened; the identity is untouched and Custom is set.
		assert_eq!(chosen.restore_behavior(), Some("Erase"));
		assert!(client.flags.contains(RestoreFlags::Custom));
		assert!(client.flags.contains(RestoreFlags::Erase));
	}

	#[test]
	fn neither_hash_matching_forces_erase_and_custom()
	{
		let erase = test_image(16, &[0xE1; 64]);
		let update = test_image(16, &[0x07; 64]);
		let (manifest, files) = fixture(&erase, &update);

		let unrelated = test_image(16, &[0x5C; 64]);
		let mut client = client_with_ticket(
			RestoreFlags::Rerestore | RestoreFlags::Update,
			ticket_for(&[&unrelated]),
		);
		let current = manifest.identity_for("n42ap", Some(RestoreBehavior::Update)).unwrap();
		let chosen = reconcile(&mut client, &manifest, current, &mut reader(&files)).unwrap();

		assert_eq!(chosen.restore_behavior(), Some("Erase"));
		assert!(client.flags.contains(RestoreFlags::Erase));
		assert!(client.flags.contains(RestoreFlags::Custom));
		assert!(!client.flags.contains(RestoreFlags::Update));
	}

	#[test]
	fn missing_flip_target_restores_the_original_identity()
	{
		let erase = test_image(16, &[0xE1; 64]);
		let mut files = HashMap::new();
		files.insert(ERASE_RAMDISK.to_string(), erase.clone());
		let manifest = manifest(vec![identity("Erase", ERASE_RAMDISK)]);

		let unrelated = test_image(16, &[0x5C; 64]);
		let mut client = client_with_ticket(
			RestoreFlags::Rerestore | RestoreFlags::Erase,
			ticket_for(&[&unrelated]),
		);
		let current = manifest.identity_for("n42ap", Some(RestoreBehavior::Erase)).unwrap();
		let chosen = reconcile(&mut client, &manifest, current, &mut reader(&files)).unwrap();

		assert_eq!(chosen.restore_behavior(), Some("Erase"));
		assert!(client.flags.contains(RestoreFlags::Erase));
		assert!(!client.flags.contains(RestoreFlags::Custom));
	}

	#[test]
	fn short_ramdisk_keeps_the_selected_identity()
	{
		let (manifest, mut files) = fixture(&[0u8; 4], &[0u8; 4]);
		files.insert(ERASE_RAMDISK.to_string(), vec![0u8; 4]);

		let mut client = client_with_ticket(
			RestoreFlags::Rerestore | RestoreFlags::Erase,
			ticket_for(&[]),
		);
		let current = manifest.identity_for("n42ap", Some(RestoreBehavior::Erase)).unwrap();
		let chosen = reconcile(&mut client, &manifest, current, &mut reader(&files)).unwrap();
		assert_eq!(chosen.restore_behavior(), Some("Erase"));
		assert!(!client.flags.contains(RestoreFlags::Custom));
	}

	#[test]
	fn choice_is_deterministic()
	{
		let erase = test_image(16, &[0xE1; 64]);
		let update = test_image(16, &[0x07; 64]);
		let (manifest, files) = fixture(&erase, &update);
		let ticket = ticket_for(&[&update]);

		for _ in 0..3 {
			let mut client = client_with_ticket(
				RestoreFlags::Rerestore | RestoreFlags::Erase,
				ticket.clone(),
			);
			let current = manifest.identity_for("n42ap", Some(RestoreBehavior::Erase)).unwrap();
			let chosen = reconcile(&mut client, &manifest, current, &mut reader(&files)).unwrap();
			assert_eq!(chosen.restore_behavior(), Some("Update"));
		}
	}
}
