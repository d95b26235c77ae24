// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP access used by the version-data cache, the signing service client
//! and the partial-ZIP fetcher. The transfer layer sits behind a trait so
//! the subsystems above it can be exercised without a network.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use log::debug;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, RANGE, USER_AGENT};

use crate::error::{Error, Result};

const CLIENT_USER_AGENT: &str = concat!("rerestore/", env!("CARGO_PKG_VERSION"));

/// The operations this tool needs from an HTTP stack.
pub trait HttpClient
{
	/// Fetch a complete resource into memory.
	fn get_bytes(&self, url: &str) -> Result<Vec<u8>>;

	/// Stream a resource to a file, reporting `(received, total)` as data
	/// arrives.
	fn get_to_file(&self, url: &str, dest: &Path, progress: &mut dyn FnMut(u64, Option<u64>)) -> Result<()>;

	/// Total size of a resource, from a ranged probe.
	fn content_length(&self, url: &str) -> Result<u64>;

	/// Fetch `length` bytes starting at `offset`.
	fn get_range(&self, url: &str, offset: u64, length: u64) -> Result<Vec<u8>>;

	/// POST a property-list body and return the raw response body.
	fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>>;
}

/// Production implementation over a blocking reqwest client.
pub struct ReqwestClient
{
	client: reqwest::blocking::Client,
}

impl ReqwestClient
{
	pub fn new() -> Result<Self>
	{
		let client = reqwest::blocking::Client::builder()
			.connect_timeout(Duration::from_secs(15))
			.build()?;
		Ok(Self { client })
	}
}

impl HttpClient for ReqwestClient
{
	fn get_bytes(&self, url: &str) -> Result<Vec<u8>>
	{
		let response = self
			.client
			.get(url)
			.header(USER_AGENT, CLIENT_USER_AGENT)
			.send()?
			.error_for_status()?;
		Ok(response.bytes()?.to_vec())
	}

	fn get_to_file(&self, url: &str, dest: &Path, progress: &mut dyn FnMut(u64, Option<u64>)) -> Result<()>
	{
		let mut response = self
			.client
			.get(url)
			.header(USER_AGENT, CLIENT_USER_AGENT)
			.send()?
			.error_for_status()?;
		let total = response.content_length();
		let mut file = File::create(dest)?;

		// Copy through a fixed buffer so progress can be reported without
		// waiting for the whole body.
		let mut received = 0u64;
		let mut buffer = [0u8; 64 * 1024];
		loop {
			let count = response.read(&mut buffer)?;
			if count == 0 {
				break;
			}
			file.write_all(&buffer[..count])?;
			received += count as u64;
			progress(received, total);
		}
		Ok(())
	}

	fn content_length(&self, url: &str) -> Result<u64>
	{
		// A one-byte ranged request gets us a Content-Range header with the
		// total size even from servers that refuse HEAD.
		let response = self
			.client
			.get(url)
			.header(USER_AGENT, CLIENT_USER_AGENT)
			.header(RANGE, "bytes=0-0")
			.send()?;
		if response.status() == StatusCode::PARTIAL_CONTENT {
			let total = response
				.headers()
				.get(reqwest::header::CONTENT_RANGE)
				.and_then(|value| value.to_str().ok())
				.and_then(|value| value.rsplit('/').next())
				.and_then(|total| total.parse().ok());
			if let Some(total) = total {
				return Ok(total);
			}
		}
		// Server ignored the range; fall back to the plain length.
		response
			.error_for_status()?
			.content_length()
			.ok_or_else(|| Error::Extraction(format!("server reports no content length for {url}")))
	}

	fn get_range(&self, url: &str, offset: u64, length: u64) -> Result<Vec<u8>>
	{
		if length == 0 {
			return Ok(Vec::new());
		}
		debug!("Fetching {length} bytes at offset {offset} of {url}");
		let end = offset + length - 1;
		let response = self
			.client
			.get(url)
			.header(USER_AGENT, CLIENT_USER_AGENT)
			.header(RANGE, format!("bytes={offset}-{end}"))
			.send()?
			.error_for_status()?;
		Ok(response.bytes()?.to_vec())
	}

	fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>>
	{
		let response = self
			.client
			.post(url)
			.header(USER_AGENT, CLIENT_USER_AGENT)
			.header(CONTENT_TYPE, "text/xml; charset=\"utf-8\"")
			.body(body)
			.send()?
			.error_for_status()?;
		Ok(response.bytes()?.to_vec())
	}
}
