// SPDX-License-Identifier: MIT OR Apache-2.0
//! Access to local firmware archives: reading components, downloading
//! archives into the cache, and the coordinated extraction of the big
//! filesystem image.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fd_lock::RwLock;
use log::{debug, info, warn};
use rc_zip_sync::ReadZip;

use crate::error::{Error, Result};
use crate::http::HttpClient;

/// A firmware archive on the local filesystem.
pub struct IpswArchive
{
	path: PathBuf,
}

impl IpswArchive
{
	pub fn open(path: &Path) -> Result<Self>
	{
		if !path.is_file() {
			return Err(Error::Configuration(format!(
				"firmware archive {} does not exist",
				path.display()
			)));
		}
		Ok(Self { path: path.to_path_buf() })
	}

	pub fn path(&self) -> &Path
	{
		&self.path
	}

	/// Read one entry fully into memory.
	pub fn read(&self, name: &str) -> Result<Vec<u8>>
	{
		let file = File::open(&self.path)?;
		let archive = file
			.read_zip()
			.map_err(|error| Error::Extraction(format!("cannot read {}: {error}", self.path.display())))?;
		let entry = archive
			.by_name(name)
			.ok_or_else(|| Error::Extraction(format!("archive has no entry {name}")))?;
		entry
			.bytes()
			.map_err(|error| Error::Extraction(format!("failed to extract {name}: {error}")))
	}

	pub fn contains(&self, name: &str) -> Result<bool>
	{
		let file = File::open(&self.path)?;
		let archive = file
			.read_zip()
			.map_err(|error| Error::Extraction(format!("cannot read {}: {error}", self.path.display())))?;
		Ok(archive.by_name(name).is_some())
	}

	/// Uncompressed size of an entry, if present.
	pub fn entry_size(&self, name: &str) -> Result<Option<u64>>
	{
		let file = File::open(&self.path)?;
		let archive = file
			.read_zip()
			.map_err(|error| Error::Extraction(format!("cannot read {}: {error}", self.path.display())))?;
		Ok(archive.by_name(name).map(|entry| entry.uncompressed_size))
	}

	/// Stream one entry to a file, reporting `(written, total)` along the
	/// way.
	pub fn extract_to(&self, name: &str, dest: &Path, progress: &mut dyn FnMut(u64, u64)) -> Result<u64>
	{
		let file = File::open(&self.path)?;
		let archive = file
			.read_zip()
			.map_err(|error| Error::Extraction(format!("cannot read {}: {error}", self.path.display())))?;
		let entry = archive
			.by_name(name)
			.ok_or_else(|| Error::Extraction(format!("archive has no entry {name}")))?;
		let total = entry.uncompressed_size;

		if let Some(parent) = dest.parent() {
			fs::create_dir_all(parent)?;
		}
		let mut reader = entry.reader();
		let mut writer = File::create(dest)?;
		let mut written = 0u64;
		let mut buffer = [0u8; 128 * 1024];
		loop {
			let count = reader.read(&mut buffer)?;
			if count == 0 {
				break;
			}
			writer.write_all(&buffer[..count])?;
			written += count as u64;
			progress(written, total);
		}

		if written != total {
			let _ = fs::remove_file(dest);
			return Err(Error::Extraction(format!(
				"{name} extracted to {written} bytes, expected {total}"
			)));
		}
		Ok(written)
	}
}

/// Where a filesystem image ended up and whether it must be cleaned up
/// after the run.
pub struct ExtractedFilesystem
{
	pub path: PathBuf,
	pub temporary: bool,
}

/// Extract the filesystem image into the cache, coordinating with other
/// processes working on the same archive.
///
/// A cached copy of the exact expected size is reused as-is. Otherwise an
/// advisory lock guards the *claim*: under the lock, the `.extract`
/// sentinel is created to mark an extraction in progress. The lock is
/// released before the long extraction itself; the sentinel's existence is
/// what keeps other processes out. Whoever finds the sentinel already taken
/// extracts to a private name instead and deletes it after the run.
pub fn extract_filesystem(
	archive: &IpswArchive,
	fs_entry: &str,
	cache_dir: &Path,
	progress: &mut dyn FnMut(u64, u64),
) -> Result<ExtractedFilesystem>
{
	let archive_name = archive
		.path()
		.file_name()
		.ok_or_else(|| Error::Configuration("firmware archive path has no file name".into()))?;
	let dest = cache_dir.join(archive_name).join(fs_entry);
	if let Some(parent) = dest.parent() {
		fs::create_dir_all(parent)?;
	}

	let expected = archive
		.entry_size(fs_entry)?
		.ok_or_else(|| Error::Extraction(format!("archive has no filesystem entry {fs_entry}")))?;

	if let Ok(meta) = fs::metadata(&dest) {
		if meta.len() == expected {
			info!("Reusing extracted filesystem at {}", dest.display());
			return Ok(ExtractedFilesystem { path: dest, temporary: false });
		}
		warn!(
			"Cached filesystem at {} has {} bytes, expected {expected}; re-extracting",
			dest.display(),
			meta.len()
		);
	}

	let sentinel = sibling_with_suffix(&dest, ".extract");
	let lock_path = sibling_with_suffix(&dest, ".lock");

	// Claim the extraction under the advisory lock, then let the lock go:
	// the sentinel, not the lock, excludes other processes while the
	// long-running extraction happens.
	let claimed = {
		let mut lock = RwLock::new(File::create(&lock_path)?);
		let _guard = lock.write()?;
		if sentinel.exists() {
			false
		} else {
			File::create(&sentinel)?;
			true
		}
	};

	let target = if claimed {
		sentinel.clone()
	} else {
		debug!("Extraction sentinel already taken, using a private target");
		sibling_with_suffix(&dest, &format!(".{}.tmp", std::process::id()))
	};

	info!("Extracting filesystem {fs_entry} from {}", archive.path().display());
	if let Err(error) = archive.extract_to(fs_entry, &target, progress) {
		let _ = fs::remove_file(&target);
		return Err(error);
	}

	if claimed {
		fs::rename(&target, &dest)?;
		Ok(ExtractedFilesystem { path: dest, temporary: false })
	} else {
		Ok(ExtractedFilesystem { path: target, temporary: true })
	}
}

/// Download a firmware archive into the cache, reusing a complete previous
/// download when one is present.
pub fn fetch_archive(
	http: &dyn HttpClient,
	url: &str,
	cache_dir: &Path,
	progress: &mut dyn FnMut(u64, Option<u64>),
) -> Result<PathBuf>
{
	let dest = crate::versions::cached_archive_path(cache_dir, url);
	if let Ok(meta) = fs::metadata(&dest) {
		match http.content_length(url) {
			Ok(expected) if meta.len() == expected => {
				info!("Reusing downloaded archive {}", dest.display());
				return Ok(dest);
			},
			Ok(expected) => {
				warn!(
					"Cached download {} has {} bytes, expected {expected}; refetching",
					dest.display(),
					meta.len()
				);
			},
			// Can't verify; a complete-looking file is better than a
			// guaranteed refetch.
			Err(_) => return Ok(dest),
		}
	}

	fs::create_dir_all(cache_dir)?;
	let staging = sibling_with_suffix(&dest, ".tmp");
	http.get_to_file(url, &staging, progress)?;
	fs::rename(&staging, &dest)?;
	Ok(dest)
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf
{
	let mut name = path.as_os_str().to_os_string();
	name.push(suffix);
	PathBuf::from(name)
}
