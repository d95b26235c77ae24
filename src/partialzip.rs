// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fetch single files out of a remote ZIP archive without downloading the
//! whole thing, by reading the central directory through ranged requests.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::DeflateDecoder;
use log::debug;

use crate::error::{Error, Result};
use crate::http::HttpClient;

const EOCD_SIGNATURE: u32 = 0x0605_4b50;
const CENTRAL_SIGNATURE: u32 = 0x0201_4b50;
const LOCAL_SIGNATURE: u32 = 0x0403_4b50;

/// Maximum distance the end-of-central-directory record can sit from the
/// end of the file (fixed record plus the largest possible comment).
const EOCD_SEARCH_SPAN: u64 = 22 + 65535;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

/// Anything that can serve byte ranges of an archive.
pub trait RangeSource
{
	fn length(&self) -> Result<u64>;
	fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>>;
}

/// Ranged reads of a URL through the HTTP layer.
pub struct HttpRangeSource<'a>
{
	http: &'a dyn HttpClient,
	url: &'a str,
}

impl<'a> HttpRangeSource<'a>
{
	pub fn new(http: &'a dyn HttpClient, url: &'a str) -> Self
	{
		Self { http, url }
	}
}

impl RangeSource for HttpRangeSource<'_>
{
	fn length(&self) -> Result<u64>
	{
		self.http.content_length(self.url)
	}

	fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>>
	{
		self.http.get_range(self.url, offset, length)
	}
}

/// One file in the remote archive, as described by its central directory
/// record.
#[derive(Debug, Clone)]
pub struct RemoteEntry
{
	pub name: String,
	method: u16,
	compressed_size: u64,
	pub uncompressed_size: u64,
	local_header_offset: u64,
}

/// A remote archive whose central directory has been fetched and parsed.
pub struct PartialZip<'a>
{
	source: &'a dyn RangeSource,
	entries: Vec<RemoteEntry>,
}

impl<'a> PartialZip<'a>
{
	pub fn open(source: &'a dyn RangeSource) -> Result<Self>
	{
		let file_length = source.length()?;
		let tail_length = EOCD_SEARCH_SPAN.min(file_length);
		if tail_length < 22 {
			return Err(Error::Extraction("remote archive is too short to be a ZIP".into()));
		}
		let tail = source.read_range(file_length - tail_length, tail_length)?;

		// The end record is the last occurrence of its signature in the
		// file's tail with room for the full fixed-size record behind it.
		let eocd_pos = find_signature_from_end(&tail, EOCD_SIGNATURE, 22)
			.ok_or_else(|| Error::Extraction("remote archive has no end-of-central-directory record".into()))?;
		let eocd = &tail[eocd_pos..];
		let entry_count = read_u16(eocd, 10) as usize;
		let directory_size = read_u32(eocd, 12) as u64;
		let directory_offset = read_u32(eocd, 16) as u64;

		let directory = source.read_range(directory_offset, directory_size)?;
		let entries = parse_central_directory(&directory, entry_count)?;
		debug!("Remote archive lists {} entries", entries.len());

		Ok(Self { source, entries })
	}

	pub fn entries(&self) -> &[RemoteEntry]
	{
		&self.entries
	}

	pub fn entry(&self, name: &str) -> Option<&RemoteEntry>
	{
		self.entries.iter().find(|entry| entry.name == name)
	}

	/// Fetch and decompress a single entry into memory.
	pub fn fetch(&self, name: &str) -> Result<Vec<u8>>
	{
		let entry = self
			.entry(name)
			.ok_or_else(|| Error::Extraction(format!("remote archive has no entry {name}")))?;

		// The central directory does not record how long the local header's
		// extra field is (it may legitimately differ), so read the local
		// header first to find where the data starts.
		let header = self.source.read_range(entry.local_header_offset, 30)?;
		if header.len() < 30 || read_u32(&header, 0) != LOCAL_SIGNATURE {
			return Err(Error::Extraction(format!("bad local header for {name}")));
		}
		let name_length = read_u16(&header, 26) as u64;
		let extra_length = read_u16(&header, 28) as u64;
		let data_offset = entry.local_header_offset + 30 + name_length + extra_length;

		let raw = self.source.read_range(data_offset, entry.compressed_size)?;
		match entry.method {
			METHOD_STORED => Ok(raw),
			METHOD_DEFLATED => {
				let mut data = Vec::with_capacity(entry.uncompressed_size as usize);
				DeflateDecoder::new(raw.as_slice()).read_to_end(&mut data)?;
				Ok(data)
			},
			method => Err(Error::Extraction(format!(
				"entry {name} uses unsupported compression method {method}"
			))),
		}
	}

	pub fn fetch_to_file(&self, name: &str, dest: &Path) -> Result<u64>
	{
		let data = self.fetch(name)?;
		let mut file = File::create(dest)?;
		file.write_all(&data)?;
		Ok(data.len() as u64)
	}
}

fn parse_central_directory(directory: &[u8], entry_count: usize) -> Result<Vec<RemoteEntry>>
{
	let mut entries = Vec::with_capacity(entry_count);
	let mut offset = 0usize;
	while entries.len() < entry_count {
		if directory.len() < offset + 46 || read_u32(directory, offset) != CENTRAL_SIGNATURE {
			return Err(Error::Extraction("remote archive central directory is corrupt".into()));
		}
		let name_length = read_u16(directory, offset + 28) as usize;
		let extra_length = read_u16(directory, offset + 30) as usize;
		let comment_length = read_u16(directory, offset + 32) as usize;
		let name_bytes = directory
			.get(offset + 46..offset + 46 + name_length)
			.ok_or_else(|| Error::Extraction("remote archive central directory is truncated".into()))?;

		entries.push(RemoteEntry {
			name: String::from_utf8_lossy(name_bytes).into_owned(),
			method: read_u16(directory, offset + 10),
			compressed_size: read_u32(directory, offset + 20) as u64,
			uncompressed_size: read_u32(directory, offset + 24) as u64,
			local_header_offset: read_u32(directory, offset + 42) as u64,
		});
		offset += 46 + name_length + extra_length + comment_length;
	}
	Ok(entries)
}

fn find_signature_from_end(buffer: &[u8], signature: u32, record_len: usize) -> Option<usize>
{
	if buffer.len() < record_len {
		return None;
	}
	(0..=buffer.len() - record_len)
		.rev()
		.find(|&pos| read_u32(buffer, pos) == signature)
}

fn read_u16(buffer: &[u8], offset: usize) -> u16
{
	u16::from_le_bytes([buffer[offset], buffer[offset + 1]])
}

fn read_u32(buffer: &[u8], offset: usize) -> u32
{
	u32::from_le_bytes([
		buffer[offset],
		buffer[offset + 1],
		buffer[offset + 2],
		buffer[offset + 3],
	])
}

#[cfg(test)]
mod tests
{
	use std::io::Cursor;

	use zip::write::SimpleFileOptions;
	use zip::{CompressionMethod, ZipWriter};

	use super::*;

	struct MemorySource(Vec<u8>);

	impl RangeSource for MemorySource
	{
		fn length(&self) -> Result<u64>
		{
			Ok(self.0.len() as u64)
		}

		fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>>
		{
			let start = offset as usize;
			let end = (offset + length) as usize;
			Ok(self.0[start..end.min(self.0.len())].to_vec())
		}
	}

	fn archive() -> MemorySource
	{
		let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
		writer
			.start_file(
				"BuildManifest.plist",
				SimpleFileOptions::default().compression_method(CompressionMethod::Stored),
			)
			.unwrap();
		writer.write_all(b"stored manifest bytes").unwrap();
		writer
			.start_file(
				"Firmware/Mav5-8.02.00.Release.bbfw",
				SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
			)
			.unwrap();
		writer.write_all(&vec![0xAB; 4096]).unwrap();
		writer.finish().map(|cursor| MemorySource(cursor.into_inner())).unwrap()
	}

	#[test]
	fn lists_the_central_directory()
	{
		let source = archive();
		let remote = PartialZip::open(&source).unwrap();
		assert_eq!(remote.entries().len(), 2);
		assert!(remote.entry("BuildManifest.plist").is_some());
		assert!(remote.entry("nope").is_none());
	}

	#[test]
	fn fetches_stored_entries()
	{
		let source = archive();
		let remote = PartialZip::open(&source).unwrap();
		assert_eq!(remote.fetch("BuildManifest.plist").unwrap(), b"stored manifest bytes");
	}

	#[test]
	fn fetches_and_inflates_deflated_entries()
	{
		let source = archive();
		let remote = PartialZip::open(&source).unwrap();
		let data = remote.fetch("Firmware/Mav5-8.02.00.Release.bbfw").unwrap();
		assert_eq!(data, vec![0xAB; 4096]);
	}

	#[test]
	fn missing_entry_is_an_extraction_error()
	{
		let source = archive();
		let remote = PartialZip::open(&source).unwrap();
		assert!(matches!(remote.fetch("missing"), Err(Error::Extraction(_))));
	}

	#[test]
	fn rejects_non_zip_data()
	{
		let source = MemorySource(vec![0u8; 64]);
		assert!(PartialZip::open(&source).is_err());
	}
}
