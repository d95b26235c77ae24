// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::{self, Display, Formatter};

/// The boot/operating modes a device can be found in.
///
/// The numeric indices are stable and part of the tool's external surface
/// (they show up in logs and error reports), so they must not be renumbered.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Mode
{
	Wtf,
	Dfu,
	Recovery,
	Restore,
	Normal,
	Unknown,
}

impl Mode
{
	pub fn index(self) -> i32
	{
		match self {
			Mode::Wtf => 0,
			Mode::Dfu => 1,
			Mode::Recovery => 2,
			Mode::Restore => 3,
			Mode::Normal => 4,
			Mode::Unknown => -1,
		}
	}

	pub fn name(self) -> &'static str
	{
		match self {
			Mode::Wtf => "WTF",
			Mode::Dfu => "DFU",
			Mode::Recovery => "Recovery",
			Mode::Restore => "Restore",
			Mode::Normal => "Normal",
			Mode::Unknown => "Unknown",
		}
	}
}

impl Display for Mode
{
	fn fmt(&self, f: &mut Formatter) -> fmt::Result
	{
		write!(f, "{}", self.name())
	}
}
