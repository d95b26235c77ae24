// SPDX-License-Identifier: MIT OR Apache-2.0
//! Client for the ticket signing service: request construction, the local
//! ticket cache consulted during re-restores, and post-issue fixups.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::{debug, info, warn};
use plist::{Dictionary, Value};

use crate::client::{Client, RestoreFlags, TSS_MIRROR_URL, TSS_OFFICIAL_URL};
use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::manifest::BuildIdentity;
use crate::mode::Mode;
use crate::plists;

/// Version string the signing service expects from its clients.
const VERSION_INFO: &str = "libauthinstall-293.1.16";

/// Identity keys merged verbatim into the signing parameters.
const IDENTITY_PARAMETERS: &[&str] = &["ApBoardID", "ApChipID", "ApSecurityDomain", "UniqueBuildID"];

/// Acquire a ticket for the selected build identity.
///
/// In re-restore mode the on-disk cache is consulted first; a miss routes
/// the request through the community mirror, and once a mirror request has
/// succeeded every later request goes to the official endpoint.
pub fn fetch_ticket(
	client: &mut Client,
	identity: &BuildIdentity,
	http: &dyn HttpClient,
	sep_nonce: Option<&[u8]>,
) -> Result<Dictionary>
{
	let rerestore = client.flags.contains(RestoreFlags::Rerestore);

	if rerestore && client.version.is_some() {
		let path = client.shsh_file_path()?;
		if let Some(ticket) = load_cached_ticket(&path)? {
			info!("Using cached ticket from {}", path.display());
			return Ok(ticket);
		}
		// First fetch of a re-restore goes through the mirror; once a
		// ticket has been issued this run, stay on the official endpoint.
		if client.tss.is_none() && client.tss_url == TSS_OFFICIAL_URL {
			debug!("No cached ticket, requesting one from the mirror");
			client.tss_url = TSS_MIRROR_URL.into();
		}
	}

	let request = build_request(client, identity, sep_nonce)?;
	let body = plists::to_xml(&Value::Dictionary(request))?;
	debug!("Sending signing request to {}", client.tss_url);
	let response = http.post(&client.tss_url, body)?;
	let ticket = parse_response(&response)?;

	if rerestore {
		client.tss_url = TSS_OFFICIAL_URL.into();
	}
	Ok(ticket)
}

/// Assemble the signing request for one build identity.
pub fn build_request(
	client: &Client,
	identity: &BuildIdentity,
	sep_nonce: Option<&[u8]>,
) -> Result<Dictionary>
{
	let mut request = Dictionary::new();
	request.insert("@HostPlatformInfo".into(), Value::String("mac".into()));
	request.insert("@VersionInfo".into(), Value::String(VERSION_INFO.into()));
	request.insert("@Locality".into(), Value::String("en_US".into()));
	request.insert("@APTicket".into(), Value::Boolean(true));

	// Device parameters.
	request.insert("ApECID".into(), Value::Integer(client.ecid.into()));
	if let Some(nonce) = &client.nonce {
		request.insert("ApNonce".into(), Value::Data(nonce.clone()));
	}
	if let Some(sep_nonce) = sep_nonce {
		request.insert("ApSepNonce".into(), Value::Data(sep_nonce.to_vec()));
	}
	request.insert("ApProductionMode".into(), Value::Boolean(true));
	request.insert("ApSupportsImg4".into(), Value::Boolean(client.image4_supported));
	if client.image4_supported {
		request.insert("ApSecurityMode".into(), Value::Boolean(true));
		request.insert("@ApImg4Ticket".into(), Value::Boolean(true));
	}

	// Parameters the build identity supplies.
	for key in IDENTITY_PARAMETERS {
		if let Some(value) = identity.as_dictionary().get(*key) {
			request.insert((*key).into(), value.clone());
		}
	}

	// Per-component personalization tags: each manifest entry minus its
	// Info dictionary. The baseband entry only goes in alongside baseband
	// tags below.
	if let Some(manifest) = plists::dict_value(identity.as_dictionary(), "Manifest") {
		for (name, component) in manifest.iter() {
			if name.as_str() == "BasebandFirmware" {
				continue;
			}
			let Some(component) = component.as_dictionary() else {
				continue;
			};
			let mut entry = component.clone();
			entry.remove("Info");
			if !entry.is_empty() {
				request.insert(name.clone(), Value::Dictionary(entry));
			}
		}
	}

	// Baseband tags ride along when the device was seen in normal mode and
	// preflight info was captured there.
	if client.mode == Mode::Normal {
		if let Some(preflight) = &client.preflight_info {
			append_baseband_tags(&mut request, preflight, identity);
		}
	}

	Ok(request)
}

fn append_baseband_tags(request: &mut Dictionary, preflight: &Dictionary, identity: &BuildIdentity)
{
	request.insert("@BBTicket".into(), Value::Boolean(true));

	const MAPPING: &[(&str, &str)] = &[
		("Nonce", "BbNonce"),
		("ChipID", "BbChipID"),
		("CertID", "BbGoldCertId"),
		("ChipSerialNo", "BbSNUM"),
	];
	for (source_key, request_key) in MAPPING {
		if let Some(value) = preflight.get(source_key) {
			request.insert((*request_key).into(), value.clone());
		}
	}

	if let Some(baseband) = identity.component("BasebandFirmware") {
		let mut entry = baseband.clone();
		entry.remove("Info");
		request.insert("BasebandFirmware".into(), Value::Dictionary(entry));
	}
}

/// Split a signing service response into its status fields and the ticket
/// payload.
fn parse_response(body: &[u8]) -> Result<Dictionary>
{
	let text = String::from_utf8_lossy(body);

	let status: i64 = field_value(&text, "STATUS=")
		.and_then(|status| status.parse().ok())
		.ok_or_else(|| Error::Ticket("signing server response carries no status".into()))?;
	if status != 0 {
		let message = field_value(&text, "MESSAGE=").unwrap_or_else(|| "unknown error".into());
		return Err(Error::Ticket(format!(
			"signing server refused the request: {message} (status {status})"
		)));
	}

	// The payload is everything after REQUEST_STRING=; it is XML and may
	// itself contain ampersands, so no field splitting beyond this point.
	let marker = "REQUEST_STRING=";
	let payload_start = text
		.find(marker)
		.ok_or_else(|| Error::Ticket("signing server returned an empty response".into()))?;
	let payload = &body[payload_start + marker.len()..];

	match plists::parse_auto(payload)? {
		Value::Dictionary(ticket) => Ok(ticket),
		_ => Err(Error::Ticket("signing server response is not a dictionary".into())),
	}
}

fn field_value(text: &str, marker: &str) -> Option<String>
{
	let start = text.find(marker)? + marker.len();
	let rest = &text[start..];
	let end = rest.find('&').unwrap_or(rest.len());
	Some(rest[..end].to_string())
}

/// Read a gzip-wrapped ticket back from the cache. Both the binary and XML
/// property list encodings are accepted. A file that cannot be decoded is
/// removed so a later run refetches instead of tripping over it again.
pub fn load_cached_ticket(path: &Path) -> Result<Option<Dictionary>>
{
	if !path.exists() {
		return Ok(None);
	}
	let compressed = fs::read(path)?;

	let mut bytes = Vec::new();
	if let Err(error) = GzDecoder::new(compressed.as_slice()).read_to_end(&mut bytes) {
		warn!("Cached ticket {} is not valid gzip ({error}), removing it", path.display());
		let _ = fs::remove_file(path);
		return Ok(None);
	}

	match plists::parse_auto(&bytes) {
		Ok(Value::Dictionary(ticket)) => Ok(Some(ticket)),
		_ => {
			warn!("Cached ticket {} does not parse, removing it", path.display());
			let _ = fs::remove_file(path);
			Ok(None)
		},
	}
}

/// Write the client's ticket into the cache as a gzip-compressed binary
/// property list, honouring the shared filename template. An existing file
/// is left untouched.
pub fn save_ticket(client: &Client) -> Result<PathBuf>
{
	let ticket = client
		.tss
		.as_ref()
		.ok_or_else(|| Error::Ticket("no ticket to save".into()))?;
	let path = client.shsh_file_path()?;
	if path.exists() {
		info!("Ticket already saved at {}", path.display());
		return Ok(path);
	}
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent)?;
	}

	let bytes = plists::to_binary(&Value::Dictionary(ticket.clone()))?;
	let mut encoder = GzEncoder::new(fs::File::create(&path)?, Compression::default());
	encoder.write_all(&bytes)?;
	encoder.finish()?;
	info!("Saved ticket to {}", path.display());
	Ok(path)
}

/// Some tickets come back with empty restore-variant entries; fill those
/// from their boot-variant siblings so the restore phase finds usable
/// blobs. Applying this twice is a no-op.
pub fn fixup_ticket(ticket: &mut Dictionary)
{
	const PAIRS: &[(&str, &str)] = &[
		("RestoreLogo", "AppleLogo"),
		("RestoreDeviceTree", "DeviceTree"),
		("RestoreKernelCache", "KernelCache"),
	];

	for (restore_key, source_key) in PAIRS {
		let restore_is_empty = plists::dict_value(ticket, restore_key)
			.map(Dictionary::is_empty)
			.unwrap_or(false);
		if !restore_is_empty {
			continue;
		}
		let source = match plists::dict_value(ticket, source_key) {
			Some(source) if !source.is_empty() => source.clone(),
			_ => continue,
		};
		debug!("Replacing empty {restore_key} entry with a copy of {source_key}");
		ticket.insert((*restore_key).into(), Value::Dictionary(source));
	}
}

#[cfg(test)]
mod tests
{
	use super::*;
	use crate::device;

	fn test_client(dir: &Path) -> Client
	{
		let mut client = Client::new(
			RestoreFlags::Rerestore,
			Some("iPhone5,2_8.4.1_12H321_Restore.ipsw".into()),
			Some(dir.to_path_buf()),
		)
		.unwrap();
		client.device = device::for_product_type("iPhone5,2");
		client.ecid = 0x000D_EADB_EEF0_1234;
		client.set_version_info("8.4.1".into(), "12H321".into());
		client
	}

	fn sample_ticket() -> Dictionary
	{
		let mut entry = Dictionary::new();
		entry.insert("Blob".into(), Value::Data(vec![0x42; 64]));
		let mut ticket = Dictionary::new();
		ticket.insert("APTicket".into(), Value::Data(vec![0x13; 256]));
		ticket.insert("KernelCache".into(), Value::Dictionary(entry));
		ticket
	}

	fn identity() -> BuildIdentity
	{
		let mut digest_entry = Dictionary::new();
		digest_entry.insert("Digest".into(), Value::Data(vec![0xAA; 20]));
		let mut info = Dictionary::new();
		info.insert("Path".into(), Value::String("kernelcache".into()));
		let mut component = Dictionary::new();
		component.insert("Digest".into(), Value::Data(vec![0xAA; 20]));
		component.insert("Info".into(), Value::Dictionary(info));
		let mut manifest = Dictionary::new();
		manifest.insert("KernelCache".into(), Value::Dictionary(component));
		let mut dict = Dictionary::new();
		dict.insert("ApBoardID".into(), Value::String("0x02".into()));
		dict.insert("ApChipID".into(), Value::String("0x8950".into()));
		dict.insert("Manifest".into(), Value::Dictionary(manifest));
		BuildIdentity::new(dict)
	}

	#[test]
	fn cached_ticket_round_trips_as_binary()
	{
		let dir = tempfile::tempdir().unwrap();
		let mut client = test_client(dir.path());
		client.tss = Some(sample_ticket());

		let path = save_ticket(&client).unwrap();
		assert!(path.to_string_lossy().ends_with("shsh"));
		let loaded = load_cached_ticket(&path).unwrap().unwrap();
		assert_eq!(loaded, sample_ticket());
	}

	#[test]
	fn cached_ticket_accepts_xml_payloads()
	{
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("ticket.shsh");
		let xml = plists::to_xml(&Value::Dictionary(sample_ticket())).unwrap();
		let mut encoder = GzEncoder::new(fs::File::create(&path).unwrap(), Compression::default());
		encoder.write_all(&xml).unwrap();
		encoder.finish().unwrap();

		let loaded = load_cached_ticket(&path).unwrap().unwrap();
		assert_eq!(loaded, sample_ticket());
	}

	#[test]
	fn corrupt_cached_ticket_is_deleted()
	{
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("ticket.shsh");
		fs::write(&path, b"not gzip at all").unwrap();
		assert!(load_cached_ticket(&path).unwrap().is_none());
		assert!(!path.exists());
	}

	#[test]
	fn save_skips_existing_files()
	{
		let dir = tempfile::tempdir().unwrap();
		let mut client = test_client(dir.path());
		client.tss = Some(sample_ticket());

		let path = save_ticket(&client).unwrap();
		let original = fs::read(&path).unwrap();
		// A second save with different contents must not overwrite.
		client.tss = Some(Dictionary::new());
		save_ticket(&client).unwrap();
		assert_eq!(fs::read(&path).unwrap(), original);
	}

	#[test]
	fn request_carries_device_and_component_parameters()
	{
		let dir = tempfile::tempdir().unwrap();
		let mut client = test_client(dir.path());
		client.nonce = Some(vec![0x99; 20]);

		let request = build_request(&client, &identity(), Some(&[0x77; 20])).unwrap();
		assert_eq!(request.get("ApECID").unwrap().as_unsigned_integer(), Some(0x000D_EADB_EEF0_1234));
		assert_eq!(plists::data_value(&request, "ApNonce"), Some(&[0x99u8; 20][..]));
		assert_eq!(plists::data_value(&request, "ApSepNonce"), Some(&[0x77u8; 20][..]));
		assert_eq!(plists::str_value(&request, "ApBoardID"), Some("0x02"));
		assert_eq!(plists::bool_value(&request, "ApProductionMode"), Some(true));
		assert_eq!(plists::bool_value(&request, "ApSupportsImg4"), Some(false));

		// Component entries lose their Info dictionary.
		let kernel = plists::dict_value(&request, "KernelCache").unwrap();
		assert!(kernel.get("Digest").is_some());
		assert!(kernel.get("Info").is_none());
	}

	#[test]
	fn baseband_tags_require_normal_mode_preflight()
	{
		let dir = tempfile::tempdir().unwrap();
		let mut client = test_client(dir.path());

		let mut preflight = Dictionary::new();
		preflight.insert("Nonce".into(), Value::Data(vec![0x10; 20]));
		preflight.insert("ChipID".into(), Value::Integer(0x60u64.into()));
		preflight.insert("CertID".into(), Value::Integer(3554301762u64.into()));
		preflight.insert("ChipSerialNo".into(), Value::Data(vec![0x31; 4]));
		client.preflight_info = Some(preflight);

		// Not in normal mode: no baseband tags.
		let request = build_request(&client, &identity(), None).unwrap();
		assert!(request.get("@BBTicket").is_none());

		client.mode = Mode::Normal;
		let request = build_request(&client, &identity(), None).unwrap();
		assert_eq!(plists::bool_value(&request, "@BBTicket"), Some(true));
		assert_eq!(plists::data_value(&request, "BbNonce"), Some(&[0x10u8; 20][..]));
		assert_eq!(plists::uint_value(&request, "BbChipID"), Some(0x60));
		assert_eq!(plists::uint_value(&request, "BbGoldCertId"), Some(3554301762));
		assert_eq!(plists::data_value(&request, "BbSNUM"), Some(&[0x31u8; 4][..]));
	}

	#[test]
	fn response_parsing_extracts_the_ticket()
	{
		let ticket = sample_ticket();
		let xml = plists::to_xml(&Value::Dictionary(ticket.clone())).unwrap();
		let mut body = b"STATUS=0&MESSAGE=SUCCESS&REQUEST_STRING=".to_vec();
		body.extend_from_slice(&xml);
		assert_eq!(parse_response(&body).unwrap(), ticket);
	}

	#[test]
	fn response_errors_are_reported()
	{
		let refused = b"STATUS=94&MESSAGE=This device isn't eligible for the requested build.";
		let error = parse_response(refused).unwrap_err();
		assert!(error.to_string().contains("status 94"));

		assert!(parse_response(b"STATUS=0&MESSAGE=SUCCESS").is_err());
		assert!(parse_response(b"complete garbage").is_err());
	}

	#[test]
	fn fixups_fill_empty_restore_entries_and_are_idempotent()
	{
		let mut source = Dictionary::new();
		source.insert("Blob".into(), Value::Data(vec![1, 2, 3]));
		let mut ticket = Dictionary::new();
		ticket.insert("AppleLogo".into(), Value::Dictionary(source.clone()));
		ticket.insert("RestoreLogo".into(), Value::Dictionary(Dictionary::new()));
		ticket.insert("RestoreKernelCache".into(), Value::Dictionary(Dictionary::new()));

		fixup_ticket(&mut ticket);
		assert_eq!(plists::dict_value(&ticket, "RestoreLogo"), Some(&source));
		// No KernelCache source entry: the empty dictionary stays.
		assert!(plists::dict_value(&ticket, "RestoreKernelCache").unwrap().is_empty());

		let once = ticket.clone();
		fixup_ticket(&mut ticket);
		assert_eq!(ticket, once);
	}
}
