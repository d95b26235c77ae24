// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cache of the vendor's version-index document, used to resolve firmware
//! download URLs for a product type.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, info, warn};
use plist::{Dictionary, Value};
use url::Url;

use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::plists;

pub const VERSION_DATA_URL: &str = "http://itunes.apple.com/check/version";

/// How long a cached version index stays usable.
const CACHE_MAX_AGE_SECS: u64 = 86400;

/// Recovery archive served when the version index carries no WTF entry.
/// This points at a 2009-era archive on purpose; nothing newer contains the
/// WTF images the affected devices need.
pub const WTF_FALLBACK_URL: &str =
	"http://appldnld.apple.com/iPhone/061-6618.20090617.Xse7Y/iPhone1,1_3.0_7A341_Restore.ipsw";

/// The parsed version index.
pub struct VersionData
{
	root: Dictionary,
}

impl VersionData
{
	/// Load `version.xml` from the cache directory, refetching it when it
	/// is older than a day. The fresh copy lands in a `.tmp` sibling first
	/// and is renamed over the stale one, so a failed download never
	/// clobbers a usable cache.
	pub fn load(cache_dir: &Path, http: &dyn HttpClient) -> Result<Self>
	{
		let cache_file = cache_dir.join("version.xml");

		if let Some(modified) = file_mtime(&cache_file) {
			if is_fresh(modified, SystemTime::now()) {
				info!("Using cached version data");
				let bytes = fs::read(&cache_file)?;
				return match Self::parse(&bytes) {
					Ok(data) => Ok(data),
					Err(error) => {
						// A corrupt cache would fail the same way on every
						// run, so remove it before reporting the failure.
						warn!("Cached version data is unreadable, removing it: {error}");
						let _ = fs::remove_file(&cache_file);
						Err(error)
					},
				};
			}
			debug!("Cached version data is stale, refetching");
		}

		fs::create_dir_all(cache_dir)?;
		let staging = cache_file.with_extension("xml.tmp");
		http.get_to_file(VERSION_DATA_URL, &staging, &mut |_, _| {})?;
		fs::rename(&staging, &cache_file)?;

		let bytes = fs::read(&cache_file)?;
		Self::parse(&bytes)
	}

	pub fn parse(bytes: &[u8]) -> Result<Self>
	{
		match plists::parse_auto(bytes)? {
			Value::Dictionary(root) => Ok(Self { root }),
			_ => Err(Error::Manifest("version data root is not a dictionary".into())),
		}
	}

	pub fn from_dictionary(root: Dictionary) -> Self
	{
		Self { root }
	}

	/// Latest restore firmware for a product type: `(url, version, build)`.
	///
	/// The index groups software versions under numbered keys; the entry
	/// for the newest generation that knows the product wins.
	pub fn latest_firmware(&self, product_type: &str) -> Result<(String, String, String)>
	{
		let by_version = plists::dict_value(&self.root, "MobileDeviceSoftwareVersionsByVersion")
			.ok_or_else(|| Error::Manifest("version data has no software version index".into()))?;

		let mut found = None;
		for (_, generation) in by_version.iter() {
			let Some(generation) = generation.as_dictionary() else {
				continue;
			};
			let Some(versions) = plists::dict_value(generation, "MobileDeviceSoftwareVersions") else {
				continue;
			};
			let Some(restore) = plists::dict_value(versions, product_type)
				.and_then(|device| plists::dict_value(device, "Unknown"))
				.and_then(|unknown| plists::dict_value(unknown, "Universal"))
				.and_then(|universal| plists::dict_value(universal, "Restore"))
			else {
				continue;
			};
			let url = plists::str_value(restore, "FirmwareURL");
			let version = plists::str_value(restore, "ProductVersion");
			let build = plists::str_value(restore, "BuildVersion");
			if let (Some(url), Some(version), Some(build)) = (url, version, build) {
				found = Some((url.to_string(), version.to_string(), build.to_string()));
			}
		}

		found.ok_or_else(|| {
			Error::Manifest(format!("version data lists no restore firmware for {product_type}"))
		})
	}

	/// URL of an archive carrying WTF images, when the index knows one.
	pub fn wtf_firmware_url(&self) -> Option<String>
	{
		let restore = plists::dict_at_path(
			&self.root,
			&["MobileDeviceSoftwareVersionsByVersion", "5", "RecoverySoftwareVersions", "WTF"],
		)?;
		// The WTF table is keyed by an opaque firmware identifier; any
		// entry with a firmware URL will do.
		for (_, entry) in restore.iter() {
			let Some(entry) = entry.as_dictionary() else {
				continue;
			};
			for (_, build) in entry.iter() {
				if let Some(url) = build
					.as_dictionary()
					.and_then(|build| plists::str_value(build, "FirmwareURL"))
				{
					return Some(url.to_string());
				}
			}
		}
		None
	}
}

fn file_mtime(path: &Path) -> Option<SystemTime>
{
	fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// A cached copy is reusable while it is at most a day old. A modification
/// time in the future counts as fresh rather than triggering a refetch.
pub fn is_fresh(modified: SystemTime, now: SystemTime) -> bool
{
	match now.duration_since(modified) {
		Ok(age) => age.as_secs() <= CACHE_MAX_AGE_SECS,
		Err(_) => true,
	}
}

/// Resolve the cache file name for a firmware archive URL.
pub fn cached_archive_path(cache_dir: &Path, url: &str) -> PathBuf
{
	let name = Url::parse(url)
		.ok()
		.and_then(|parsed| {
			parsed
				.path_segments()
				.and_then(|segments| segments.last().map(str::to_string))
		})
		.filter(|name| !name.is_empty())
		.unwrap_or_else(|| "firmware.ipsw".to_string());
	cache_dir.join(name)
}

#[cfg(test)]
mod tests
{
	use std::time::Duration;

	use super::*;

	fn restore_entry(url: &str, version: &str, build: &str) -> Value
	{
		let mut restore = Dictionary::new();
		restore.insert("FirmwareURL".into(), Value::String(url.into()));
		restore.insert("ProductVersion".into(), Value::String(version.into()));
		restore.insert("BuildVersion".into(), Value::String(build.into()));
		let mut universal = Dictionary::new();
		universal.insert("Restore".into(), Value::Dictionary(restore));
		let mut unknown = Dictionary::new();
		unknown.insert("Universal".into(), Value::Dictionary(universal));
		let mut device = Dictionary::new();
		device.insert("Unknown".into(), Value::Dictionary(unknown));
		Value::Dictionary(device)
	}

	fn version_data() -> VersionData
	{
		let mut versions = Dictionary::new();
		versions.insert(
			"iPhone5,2".into(),
			restore_entry("http://example.invalid/iPhone5,2_10.3.4.ipsw", "10.3.4", "14G61"),
		);
		let mut generation = Dictionary::new();
		generation.insert("MobileDeviceSoftwareVersions".into(), Value::Dictionary(versions));
		let mut by_version = Dictionary::new();
		by_version.insert("1".into(), Value::Dictionary(generation));
		let mut root = Dictionary::new();
		root.insert("MobileDeviceSoftwareVersionsByVersion".into(), Value::Dictionary(by_version));
		VersionData::from_dictionary(root)
	}

	#[test]
	fn latest_firmware_resolves_url_version_and_build()
	{
		let (url, version, build) = version_data().latest_firmware("iPhone5,2").unwrap();
		assert_eq!(url, "http://example.invalid/iPhone5,2_10.3.4.ipsw");
		assert_eq!(version, "10.3.4");
		assert_eq!(build, "14G61");
	}

	#[test]
	fn unknown_product_is_an_error()
	{
		assert!(version_data().latest_firmware("iPhone9,9").is_err());
	}

	#[test]
	fn freshness_boundary_is_one_day()
	{
		let now = SystemTime::now();
		assert!(is_fresh(now - Duration::from_secs(3600), now));
		assert!(is_fresh(now - Duration::from_secs(86400), now));
		assert!(!is_fresh(now - Duration::from_secs(86401), now));
		// Clock skew may put the mtime ahead of us; that is still fresh.
		assert!(is_fresh(now + Duration::from_secs(60), now));
	}

	#[test]
	fn archive_cache_name_comes_from_the_url()
	{
		let path = cached_archive_path(Path::new("/cache"), "http://example.invalid/a/b/Restore.ipsw");
		assert_eq!(path, PathBuf::from("/cache/Restore.ipsw"));
	}
}
