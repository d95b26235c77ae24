// SPDX-License-Identifier: MIT OR Apache-2.0
//! The IMG3 firmware container, to the depth this tool needs: locating the
//! signed region, recognising unsigned (custom) images, and splicing a
//! ticket-supplied signature blob into an image.

use crate::error::{Error, Result};

/// Bytes `[0, 0xC)` are the unsigned header prefix; everything from here on
/// is covered by the signature.
pub const SIGNED_REGION_OFFSET: usize = 0xC;

/// Shortest image that still has a complete header.
pub const MIN_IMAGE_LEN: usize = 0x14;

/// Size of a per-component signature blob issued by the signing service.
pub const SIGNATURE_BLOB_LEN: usize = 64;

/// An image whose signature-check area length reads zero was never signed;
/// such images belong to custom firmware.
pub fn is_unsigned(image: &[u8]) -> bool
{
	image
		.get(SIGNED_REGION_OFFSET..SIGNED_REGION_OFFSET + 4)
		.map(|word| word == [0, 0, 0, 0])
		.unwrap_or(false)
}

/// The portion of the image covered by the signature, absent when the image
/// is shorter than a header.
pub fn signed_region(image: &[u8]) -> Option<&[u8]>
{
	if image.len() < MIN_IMAGE_LEN {
		return None;
	}
	image.get(SIGNED_REGION_OFFSET..)
}

fn signature_check_area(image: &[u8]) -> Option<u32>
{
	image
		.get(SIGNED_REGION_OFFSET..SIGNED_REGION_OFFSET + 4)
		.map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
}

/// Replace the signature slot of `image` with a blob from the ticket. The
/// slot sits directly behind the header and the signature-checked area.
pub fn stitch_signature(image: &mut [u8], blob: &[u8]) -> Result<()>
{
	if blob.len() != SIGNATURE_BLOB_LEN {
		return Err(Error::Ticket(format!(
			"signature blob has {} bytes, expected {SIGNATURE_BLOB_LEN}",
			blob.len()
		)));
	}
	if image.len() < MIN_IMAGE_LEN {
		return Err(Error::Extraction("image too short to carry a signature".into()));
	}
	let checked = signature_check_area(image)
		.ok_or_else(|| Error::Extraction("image too short to carry a signature".into()))?;
	if checked == 0 {
		return Err(Error::Extraction("cannot stitch a signature into an unsigned image".into()));
	}

	let slot = MIN_IMAGE_LEN + checked as usize;
	let end = slot
		.checked_add(SIGNATURE_BLOB_LEN)
		.filter(|&end| end <= image.len())
		.ok_or_else(|| Error::Extraction("image has no room for the signature blob".into()))?;
	image[slot..end].copy_from_slice(blob);
	Ok(())
}

#[cfg(test)]
pub(crate) fn test_image(check_area: u32, body: &[u8]) -> Vec<u8>
{
	// Header: magic, full size, unpacked size, signature-check area, type.
	let mut image = Vec::new();
	image.extend_from_slice(b"3gmI");
	let full = (MIN_IMAGE_LEN + body.len()) as u32;
	image.extend_from_slice(&full.to_le_bytes());
	image.extend_from_slice(&full.to_le_bytes());
	image.extend_from_slice(&check_area.to_le_bytes());
	image.extend_from_slice(b"sdmr");
	image.extend_from_slice(body);
	image
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn zero_check_area_means_unsigned()
	{
		let image = test_image(0, &[0x55; 96]);
		assert!(is_unsigned(&image));
		let image = test_image(32, &[0x55; 96]);
		assert!(!is_unsigned(&image));
	}

	#[test]
	fn signed_region_starts_at_0xc()
	{
		let image = test_image(32, &[0x55; 96]);
		let region = signed_region(&image).unwrap();
		assert_eq!(region.len(), image.len() - SIGNED_REGION_OFFSET);
		assert!(signed_region(&[0u8; 8]).is_none());
	}

	#[test]
	fn stitching_replaces_the_signature_slot()
	{
		let mut image = test_image(32, &[0x55; 96]);
		let blob = [0xA7u8; SIGNATURE_BLOB_LEN];
		stitch_signature(&mut image, &blob).unwrap();
		let slot = MIN_IMAGE_LEN + 32;
		assert_eq!(&image[slot..slot + SIGNATURE_BLOB_LEN], &blob);
		// Bytes before the slot are untouched.
		assert_eq!(&image[slot - 4..slot], &[0x55; 4]);
	}

	#[test]
	fn stitching_rejects_bad_blobs_and_images()
	{
		let mut image = test_image(32, &[0x55; 96]);
		assert!(stitch_signature(&mut image, &[0u8; 10]).is_err());

		let mut unsigned = test_image(0, &[0x55; 96]);
		assert!(stitch_signature(&mut unsigned, &[0u8; SIGNATURE_BLOB_LEN]).is_err());

		// Slot would run past the end of the image.
		let mut tiny = test_image(96, &[0x55; 16]);
		assert!(stitch_signature(&mut tiny, &[0u8; SIGNATURE_BLOB_LEN]).is_err());
	}
}
