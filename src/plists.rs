// SPDX-License-Identifier: MIT OR Apache-2.0
//! Helpers for the property-list documents that cross this tool's I/O
//! boundaries: build manifests, signing requests and responses, and the
//! vendor version index.

use std::io::Cursor;

use plist::{Dictionary, Value};

use crate::error::Result;

/// Magic prefix identifying a binary property list.
pub const BPLIST_MAGIC: &[u8] = b"bplist00";

/// Parse a property list, deciding between the binary and XML encodings by
/// the document's 8-byte prefix.
pub fn parse_auto(bytes: &[u8]) -> Result<Value>
{
	if bytes.starts_with(BPLIST_MAGIC) {
		Ok(Value::from_reader(Cursor::new(bytes))?)
	} else {
		Ok(Value::from_reader_xml(Cursor::new(bytes))?)
	}
}

pub fn to_binary(value: &Value) -> Result<Vec<u8>>
{
	let mut buffer = Vec::new();
	value.to_writer_binary(&mut buffer)?;
	Ok(buffer)
}

pub fn to_xml(value: &Value) -> Result<Vec<u8>>
{
	let mut buffer = Vec::new();
	value.to_writer_xml(&mut buffer)?;
	Ok(buffer)
}

pub fn str_value<'a>(dict: &'a Dictionary, key: &str) -> Option<&'a str>
{
	dict.get(key).and_then(Value::as_string)
}

pub fn dict_value<'a>(dict: &'a Dictionary, key: &str) -> Option<&'a Dictionary>
{
	dict.get(key).and_then(Value::as_dictionary)
}

pub fn data_value<'a>(dict: &'a Dictionary, key: &str) -> Option<&'a [u8]>
{
	dict.get(key).and_then(Value::as_data)
}

pub fn uint_value(dict: &Dictionary, key: &str) -> Option<u64>
{
	dict.get(key).and_then(Value::as_unsigned_integer)
}

pub fn bool_value(dict: &Dictionary, key: &str) -> Option<bool>
{
	dict.get(key).and_then(Value::as_boolean)
}

pub fn array_value<'a>(dict: &'a Dictionary, key: &str) -> Option<&'a [Value]>
{
	dict.get(key).and_then(Value::as_array).map(Vec::as_slice)
}

/// Walk a chain of dictionary keys, returning the dictionary at the end.
pub fn dict_at_path<'a>(dict: &'a Dictionary, path: &[&str]) -> Option<&'a Dictionary>
{
	let mut current = dict;
	for key in path {
		current = dict_value(current, key)?;
	}
	Some(current)
}

#[cfg(test)]
mod tests
{
	use super::*;

	fn sample() -> Dictionary
	{
		let mut info = Dictionary::new();
		info.insert("Path".into(), Value::String("Firmware/dfu/iBEC.img3".into()));
		let mut component = Dictionary::new();
		component.insert("Info".into(), Value::Dictionary(info));
		let mut root = Dictionary::new();
		root.insert("KernelCache".into(), Value::Dictionary(component));
		root
	}

	#[test]
	fn round_trips_both_encodings()
	{
		let value = Value::Dictionary(sample());

		let binary = to_binary(&value).unwrap();
		assert!(binary.starts_with(BPLIST_MAGIC));
		assert_eq!(parse_auto(&binary).unwrap(), value);

		let xml = to_xml(&value).unwrap();
		assert!(!xml.starts_with(BPLIST_MAGIC));
		assert_eq!(parse_auto(&xml).unwrap(), value);
	}

	#[test]
	fn dict_at_path_walks_nested_dictionaries()
	{
		let root = sample();
		let info = dict_at_path(&root, &["KernelCache", "Info"]).unwrap();
		assert_eq!(str_value(info, "Path"), Some("Firmware/dfu/iBEC.img3"));
		assert!(dict_at_path(&root, &["KernelCache", "Nope"]).is_none());
	}
}
