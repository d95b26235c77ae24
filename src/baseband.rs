// SPDX-License-Identifier: MIT OR Apache-2.0
//! Baseband firmware reconciliation: decide whether the local archive's
//! baseband matches what the latest firmware ships, and fetch the remote
//! copy only when it does not.

use std::fs;

use log::{debug, info};
use plist::{Dictionary, Value};

use crate::client::{Client, RestoreFlags, decimal_prefix};
use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::ipsw::IpswArchive;
use crate::manifest::{BuildIdentity, BuildManifest};
use crate::partialzip::{HttpRangeSource, PartialZip};
use crate::versions::VersionData;

/// Position of a device's build identity inside the latest firmware's
/// manifest. The layout of those manifests is fixed per device family, so
/// the indices are hardcoded; the `Update` variant sits right behind the
/// `Erase` one.
pub fn remote_identity_index(product_type: &str, update: bool) -> Option<usize>
{
	let base = match product_type {
		"iPhone5,2" | "iPad3,5" => 0,
		"iPhone5,4" | "iPad3,6" => 2,
		"iPhone5,1" | "iPad3,4" => 4,
		"iPhone5,3" => 6,
		_ => return None,
	};
	Some(base + usize::from(update))
}

/// Field-by-field structural comparison of two `BasebandFirmware` manifest
/// entries. The `Info` sub-dictionary is metadata about archive layout and
/// is ignored; any node of an unexpected type forces a download.
pub fn manifests_agree(local: &Dictionary, remote: &Dictionary) -> bool
{
	if local.len() != remote.len() {
		return false;
	}
	for (key, local_value) in local.iter() {
		let Some(remote_value) = remote.get(key) else {
			return false;
		};
		match (local_value, remote_value) {
			(Value::Dictionary(_), Value::Dictionary(_)) if key.as_str() == "Info" => continue,
			(Value::Data(local_data), Value::Data(remote_data)) => {
				if local_data.len() != remote_data.len() || local_data != remote_data {
					return false;
				}
			},
			(Value::Integer(local_int), Value::Integer(remote_int)) => {
				if local_int != remote_int {
					return false;
				}
			},
			_ => return false,
		}
	}
	true
}

/// Reconcile the local archive's baseband against the latest firmware,
/// leaving the blob to flash at `<cache>/bbfw.tmp` and recording both that
/// path and the fetched manifest on the client.
pub fn reconcile(
	client: &mut Client,
	archive: &IpswArchive,
	local_identity: &BuildIdentity,
	version_data: &VersionData,
	http: &dyn HttpClient,
) -> Result<()>
{
	let Some(local_entry) = local_identity.component("BasebandFirmware").cloned() else {
		debug!("Build identity carries no baseband firmware, nothing to reconcile");
		return Ok(());
	};

	let device = client.device()?;
	let (url, remote_version, _) = version_data.latest_firmware(device.product_type)?;
	info!("Latest firmware for {} is {remote_version}", device.product_type);

	let cache = client.cache_path();
	fs::create_dir_all(&cache)?;

	// Pull just the manifest out of the remote archive.
	let source = HttpRangeSource::new(http, &url);
	let remote_zip = PartialZip::open(&source)?;
	let manifest_bytes = remote_zip.fetch("BuildManifest.plist")?;
	let manifest_path = cache.join("BuildManifest_New.plist");
	fs::write(&manifest_path, &manifest_bytes)?;
	client.ota_manifest_path = Some(manifest_path);

	let remote_manifest = BuildManifest::parse(&manifest_bytes)?;
	let (_, remote_build) = remote_manifest.version_info()?;
	let remote_major = decimal_prefix(&remote_build);

	let update = client.flags.contains(RestoreFlags::Update);
	let index = remote_identity_index(device.product_type, update);
	let remote_identity = if remote_major >= 14 {
		let index = index.ok_or_else(|| {
			Error::Reconciliation(format!(
				"no known identity index for {} in the latest firmware",
				device.product_type
			))
		})?;
		remote_manifest
			.identity_at(index)
			.ok_or_else(|| Error::Manifest(format!("latest manifest has no identity {index}")))?
	} else {
		remote_manifest
			.identity_at(0)
			.ok_or_else(|| Error::Manifest("latest manifest lists no identities".into()))?
	};

	let bbfw_path = cache.join("bbfw.tmp");
	let remote_entry = remote_identity.component("BasebandFirmware");
	let reuse_local = remote_entry
		.map(|remote| manifests_agree(&local_entry, remote))
		.unwrap_or(true);

	if reuse_local {
		info!("Local baseband matches the latest firmware, reusing it");
		let local_path = local_identity.component_path("BasebandFirmware")?;
		let data = archive.read(&local_path)?;
		fs::write(&bbfw_path, data)?;
	} else {
		let remote_path = remote_identity.component_path("BasebandFirmware")?;
		info!("Baseband differs from the latest firmware, fetching {remote_path}");
		remote_zip.fetch_to_file(&remote_path, &bbfw_path)?;
	}

	client.baseband_path = Some(bbfw_path);
	Ok(())
}

#[cfg(test)]
mod tests
{
	use super::*;

	fn entry(size: u64, digest: &[u8], info_path: &str) -> Dictionary
	{
		let mut info = Dictionary::new();
		info.insert("Path".into(), Value::String(info_path.into()));
		let mut dict = Dictionary::new();
		dict.insert("Info".into(), Value::Dictionary(info));
		dict.insert("Digest".into(), Value::Data(digest.to_vec()));
		dict.insert("Size".into(), Value::Integer(size.into()));
		dict
	}

	#[test]
	fn entries_differing_only_in_info_agree()
	{
		let local = entry(1024, &[0xAA; 20], "Firmware/Mav5-local.bbfw");
		let remote = entry(1024, &[0xAA; 20], "Firmware/Mav5-remote.bbfw");
		assert!(manifests_agree(&local, &remote));
	}

	#[test]
	fn differing_data_or_uint_forces_download()
	{
		let local = entry(1024, &[0xAA; 20], "a");
		assert!(!manifests_agree(&local, &entry(1024, &[0xBB; 20], "a")));
		assert!(!manifests_agree(&local, &entry(2048, &[0xAA; 20], "a")));
		// Data of different length fails before the byte compare.
		assert!(!manifests_agree(&local, &entry(1024, &[0xAA; 16], "a")));
	}

	#[test]
	fn size_and_type_mismatches_force_download()
	{
		let local = entry(1024, &[0xAA; 20], "a");

		let mut extra = entry(1024, &[0xAA; 20], "a");
		extra.insert("Extra".into(), Value::Boolean(true));
		assert!(!manifests_agree(&local, &extra));

		let mut retyped = entry(1024, &[0xAA; 20], "a");
		retyped.insert("Digest".into(), Value::String("not data".into()));
		assert!(!manifests_agree(&local, &retyped));

		// A key of a tolerated-nowhere type on both sides still forces a
		// download.
		let mut local_string = local.clone();
		local_string.insert("Digest".into(), Value::String("x".into()));
		let mut remote_string = entry(1024, &[0xAA; 20], "a");
		remote_string.insert("Digest".into(), Value::String("x".into()));
		assert!(!manifests_agree(&local_string, &remote_string));
	}

	#[test]
	fn identity_index_table()
	{
		assert_eq!(remote_identity_index("iPhone5,2", false), Some(0));
		assert_eq!(remote_identity_index("iPad3,5", false), Some(0));
		assert_eq!(remote_identity_index("iPhone5,4", false), Some(2));
		assert_eq!(remote_identity_index("iPad3,6", true), Some(3));
		assert_eq!(remote_identity_index("iPhone5,1", false), Some(4));
		assert_eq!(remote_identity_index("iPad3,4", true), Some(5));
		assert_eq!(remote_identity_index("iPhone5,3", false), Some(6));
		assert_eq!(remote_identity_index("iPhone5,3", true), Some(7));
		assert_eq!(remote_identity_index("iPhone4,1", false), None);
	}
}
