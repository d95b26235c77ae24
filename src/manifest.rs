// SPDX-License-Identifier: MIT OR Apache-2.0
//! BuildManifest parsing: build identity enumeration and selection,
//! per-component archive paths, and firmware version extraction.

use std::fmt::{self, Display, Formatter};

use plist::{Dictionary, Value};

use crate::error::{Error, Result};
use crate::plists;

/// The two restore behaviours a build identity can carry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RestoreBehavior
{
	Erase,
	Update,
}

impl RestoreBehavior
{
	pub fn as_str(self) -> &'static str
	{
		match self {
			RestoreBehavior::Erase => "Erase",
			RestoreBehavior::Update => "Update",
		}
	}
}

impl Display for RestoreBehavior
{
	fn fmt(&self, f: &mut Formatter) -> fmt::Result
	{
		write!(f, "{}", self.as_str())
	}
}

/// A parsed BuildManifest document.
pub struct BuildManifest
{
	root: Dictionary,
}

impl BuildManifest
{
	/// Parse a manifest from raw bytes, accepting both the XML and binary
	/// property list encodings.
	pub fn parse(bytes: &[u8]) -> Result<Self>
	{
		let value = plists::parse_auto(bytes)?;
		match value {
			Value::Dictionary(root) => Ok(Self { root }),
			_ => Err(Error::Manifest("BuildManifest root is not a dictionary".into())),
		}
	}

	pub fn from_dictionary(root: Dictionary) -> Self
	{
		Self { root }
	}

	fn identities(&self) -> &[Value]
	{
		plists::array_value(&self.root, "BuildIdentities").unwrap_or(&[])
	}

	pub fn identity_count(&self) -> usize
	{
		self.identities().len()
	}

	/// The identity at the given position, as an owned copy with a lifetime
	/// independent of the manifest.
	pub fn identity_at(&self, index: usize) -> Option<BuildIdentity>
	{
		self.identities()
			.get(index)
			.and_then(Value::as_dictionary)
			.cloned()
			.map(BuildIdentity::new)
	}

	/// Linear scan for the first identity whose `Info.DeviceClass` matches
	/// the hardware model (case-insensitively), optionally also requiring a
	/// matching `Info.RestoreBehavior`.
	pub fn identity_for(&self, model: &str, behavior: Option<RestoreBehavior>) -> Option<BuildIdentity>
	{
		for value in self.identities() {
			let Some(identity) = value.as_dictionary() else {
				continue;
			};
			let Some(info) = plists::dict_value(identity, "Info") else {
				continue;
			};
			let Some(class) = plists::str_value(info, "DeviceClass") else {
				continue;
			};
			if !class.eq_ignore_ascii_case(model) {
				continue;
			}
			if let Some(wanted) = behavior {
				match plists::str_value(info, "RestoreBehavior") {
					Some(found) if found.eq_ignore_ascii_case(wanted.as_str()) => {},
					_ => continue,
				}
			}
			return Some(BuildIdentity::new(identity.clone()));
		}
		None
	}

	/// Verify the manifest claims support for the attached device.
	pub fn check_compatibility(&self, product_type: &str) -> Result<()>
	{
		let supported = plists::array_value(&self.root, "SupportedProductTypes")
			.ok_or_else(|| Error::Manifest("SupportedProductTypes missing from manifest".into()))?;
		let compatible = supported
			.iter()
			.filter_map(Value::as_string)
			.any(|supported_type| supported_type == product_type);
		if compatible {
			Ok(())
		} else {
			Err(Error::Manifest(format!(
				"firmware is not compatible with {product_type}"
			)))
		}
	}

	/// `(ProductVersion, ProductBuildVersion)` of this firmware.
	pub fn version_info(&self) -> Result<(String, String)>
	{
		let version = plists::str_value(&self.root, "ProductVersion")
			.ok_or_else(|| Error::Manifest("ProductVersion missing from manifest".into()))?;
		let build = plists::str_value(&self.root, "ProductBuildVersion")
			.ok_or_else(|| Error::Manifest("ProductBuildVersion missing from manifest".into()))?;
		Ok((version.to_string(), build.to_string()))
	}

	pub fn as_dictionary(&self) -> &Dictionary
	{
		&self.root
	}
}

/// One (device model, restore behaviour) combination inside a manifest,
/// owning its backing dictionary.
#[derive(Clone)]
pub struct BuildIdentity
{
	dict: Dictionary,
}

impl BuildIdentity
{
	pub fn new(dict: Dictionary) -> Self
	{
		Self { dict }
	}

	fn info(&self) -> Option<&Dictionary>
	{
		plists::dict_value(&self.dict, "Info")
	}

	pub fn device_class(&self) -> Option<&str>
	{
		self.info().and_then(|info| plists::str_value(info, "DeviceClass"))
	}

	pub fn restore_behavior(&self) -> Option<&str>
	{
		self.info().and_then(|info| plists::str_value(info, "RestoreBehavior"))
	}

	pub fn variant(&self) -> Option<&str>
	{
		self.info().and_then(|info| plists::str_value(info, "Variant"))
	}

	/// The manifest entry for one firmware component.
	pub fn component(&self, name: &str) -> Option<&Dictionary>
	{
		plists::dict_value(&self.dict, "Manifest")
			.and_then(|manifest| plists::dict_value(manifest, name))
	}

	pub fn has_component(&self, name: &str) -> bool
	{
		self.component(name).is_some()
	}

	/// Archive-relative path of a component. Every missing or mistyped
	/// field on the way down is a hard error, never an empty path.
	pub fn component_path(&self, name: &str) -> Result<String>
	{
		let manifest = plists::dict_value(&self.dict, "Manifest")
			.ok_or_else(|| Error::Manifest("identity has no Manifest dictionary".into()))?;
		let component = plists::dict_value(manifest, name)
			.ok_or_else(|| Error::Manifest(format!("identity has no {name} component")))?;
		let info = plists::dict_value(component, "Info")
			.ok_or_else(|| Error::Manifest(format!("component {name} has no Info dictionary")))?;
		let path = plists::str_value(info, "Path")
			.ok_or_else(|| Error::Manifest(format!("component {name} has no Info.Path")))?;
		Ok(path.to_string())
	}

	pub fn as_dictionary(&self) -> &Dictionary
	{
		&self.dict
	}
}
