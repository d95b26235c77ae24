// SPDX-License-Identifier: MIT OR Apache-2.0
//! Static knowledge about the legacy device families this tool services.

/// One known device: the marketing product type, the board configuration
/// string the boot chain reports, and the chip/board identifiers baked into
/// the SoC.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor
{
	pub product_type: &'static str,
	pub hardware_model: &'static str,
	pub chip_id: u32,
	pub board_id: u32,
}

impl DeviceDescriptor
{
	pub fn is_apple_tv(&self) -> bool
	{
		self.product_type.starts_with("AppleTV")
	}
}

/// Every 32-bit device the restore engine knows how to talk to. Devices
/// newer than these use the Image4 container format and are refused before
/// any restore work begins.
pub const KNOWN_DEVICES: &[DeviceDescriptor] = &[
	DeviceDescriptor { product_type: "iPhone1,1", hardware_model: "m68ap", chip_id: 0x8900, board_id: 0x00 },
	DeviceDescriptor { product_type: "iPhone1,2", hardware_model: "n82ap", chip_id: 0x8900, board_id: 0x04 },
	DeviceDescriptor { product_type: "iPhone2,1", hardware_model: "n88ap", chip_id: 0x8920, board_id: 0x00 },
	DeviceDescriptor { product_type: "iPhone3,1", hardware_model: "n90ap", chip_id: 0x8930, board_id: 0x00 },
	DeviceDescriptor { product_type: "iPhone3,2", hardware_model: "n90bap", chip_id: 0x8930, board_id: 0x04 },
	DeviceDescriptor { product_type: "iPhone3,3", hardware_model: "n92ap", chip_id: 0x8930, board_id: 0x06 },
	DeviceDescriptor { product_type: "iPhone4,1", hardware_model: "n94ap", chip_id: 0x8940, board_id: 0x08 },
	DeviceDescriptor { product_type: "iPhone5,1", hardware_model: "n41ap", chip_id: 0x8950, board_id: 0x00 },
	DeviceDescriptor { product_type: "iPhone5,2", hardware_model: "n42ap", chip_id: 0x8950, board_id: 0x02 },
	DeviceDescriptor { product_type: "iPhone5,3", hardware_model: "n48ap", chip_id: 0x8950, board_id: 0x0a },
	DeviceDescriptor { product_type: "iPhone5,4", hardware_model: "n49ap", chip_id: 0x8950, board_id: 0x0e },
	DeviceDescriptor { product_type: "iPod1,1", hardware_model: "n45ap", chip_id: 0x8900, board_id: 0x02 },
	DeviceDescriptor { product_type: "iPod2,1", hardware_model: "n72ap", chip_id: 0x8720, board_id: 0x00 },
	DeviceDescriptor { product_type: "iPod3,1", hardware_model: "n18ap", chip_id: 0x8922, board_id: 0x02 },
	DeviceDescriptor { product_type: "iPod4,1", hardware_model: "n81ap", chip_id: 0x8930, board_id: 0x08 },
	DeviceDescriptor { product_type: "iPod5,1", hardware_model: "n78ap", chip_id: 0x8942, board_id: 0x00 },
	DeviceDescriptor { product_type: "iPad1,1", hardware_model: "k48ap", chip_id: 0x8930, board_id: 0x02 },
	DeviceDescriptor { product_type: "iPad2,1", hardware_model: "k93ap", chip_id: 0x8940, board_id: 0x04 },
	DeviceDescriptor { product_type: "iPad2,2", hardware_model: "k94ap", chip_id: 0x8940, board_id: 0x06 },
	DeviceDescriptor { product_type: "iPad2,3", hardware_model: "k95ap", chip_id: 0x8940, board_id: 0x02 },
	DeviceDescriptor { product_type: "iPad2,4", hardware_model: "k93aap", chip_id: 0x8942, board_id: 0x06 },
	DeviceDescriptor { product_type: "iPad3,1", hardware_model: "j1ap", chip_id: 0x8945, board_id: 0x00 },
	DeviceDescriptor { product_type: "iPad3,2", hardware_model: "j2ap", chip_id: 0x8945, board_id: 0x02 },
	DeviceDescriptor { product_type: "iPad3,3", hardware_model: "j2aap", chip_id: 0x8945, board_id: 0x04 },
	DeviceDescriptor { product_type: "iPad3,4", hardware_model: "p101ap", chip_id: 0x8955, board_id: 0x00 },
	DeviceDescriptor { product_type: "iPad3,5", hardware_model: "p102ap", chip_id: 0x8955, board_id: 0x02 },
	DeviceDescriptor { product_type: "iPad3,6", hardware_model: "p103ap", chip_id: 0x8955, board_id: 0x04 },
	DeviceDescriptor { product_type: "AppleTV2,1", hardware_model: "k66ap", chip_id: 0x8930, board_id: 0x10 },
	DeviceDescriptor { product_type: "AppleTV3,1", hardware_model: "j33ap", chip_id: 0x8942, board_id: 0x08 },
	DeviceDescriptor { product_type: "AppleTV3,2", hardware_model: "j33iap", chip_id: 0x8947, board_id: 0x00 },
];

pub fn for_product_type(product_type: &str) -> Option<&'static DeviceDescriptor>
{
	KNOWN_DEVICES
		.iter()
		.find(|device| device.product_type.eq_ignore_ascii_case(product_type))
}

pub fn for_hardware_model(hardware_model: &str) -> Option<&'static DeviceDescriptor>
{
	KNOWN_DEVICES
		.iter()
		.find(|device| device.hardware_model.eq_ignore_ascii_case(hardware_model))
}

/// Resolve a device from the chip and board identifiers reported over USB.
pub fn for_chip_and_board(chip_id: u32, board_id: u32) -> Option<&'static DeviceDescriptor>
{
	KNOWN_DEVICES
		.iter()
		.find(|device| device.chip_id == chip_id && device.board_id == board_id)
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn product_type_lookup_is_case_insensitive()
	{
		let device = for_product_type("iphone5,2").expect("iPhone5,2 must be known");
		assert_eq!(device.hardware_model, "n42ap");
		assert_eq!(device.chip_id, 0x8950);
	}

	#[test]
	fn chip_and_board_resolve_uniquely()
	{
		let device = for_chip_and_board(0x8950, 0x02).expect("n42ap must be known");
		assert_eq!(device.product_type, "iPhone5,2");
	}

	#[test]
	fn apple_tv_detection()
	{
		assert!(for_product_type("AppleTV3,1").unwrap().is_apple_tv());
		assert!(!for_product_type("iPhone5,2").unwrap().is_apple_tv());
	}
}
