// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error handling for restore operations.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type for everything that can go wrong while driving a restore.
///
/// The taxonomy here determines the process exit code: restore-phase
/// failures exit with -2, mode-transition failures with -5, and everything
/// else with -1.
#[derive(Debug, Error)]
pub enum Error
{
	/// Bad flag combination or missing required input.
	#[error("invalid configuration: {0}")]
	Configuration(String),

	/// The device is in a mode that cannot service the requested operation,
	/// or no mode could be detected at all.
	#[error("device in invalid state: {0}")]
	DeviceState(String),

	/// Failure opening, closing or exchanging data on one of the per-mode
	/// USB channels.
	#[error("transport error: {0}")]
	Transport(String),

	/// BuildManifest is missing fields, has fields of the wrong type, or
	/// does not apply to the attached device.
	#[error("manifest error: {0}")]
	Manifest(String),

	/// The signing service returned an unusable response, or a cached
	/// ticket could not be read back.
	#[error("ticket error: {0}")]
	Ticket(String),

	/// Archive entry missing, size mismatch, or I/O failure while pulling
	/// files out of an IPSW.
	#[error("extraction error: {0}")]
	Extraction(String),

	/// Ramdisk/ticket reconciliation could not run to completion.
	#[error("reconciliation error: {0}")]
	Reconciliation(String),

	/// The device reported a boot-flags value that means the iBEC never
	/// came up. Unrecoverable without user intervention.
	#[error("device failed to enter iBEC (IBFL {0:#04x})")]
	Ibec(u64),

	/// Failure inside the final restore streaming phase.
	#[error("restore error: {0}")]
	Restore(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error("HTTP request failed: {0}")]
	Http(#[from] reqwest::Error),

	#[error("property list error: {0}")]
	Plist(#[from] plist::Error),
}

impl Error
{
	/// Map this error onto the exit code contract of the CLI.
	pub fn exit_code(&self) -> i32
	{
		match self {
			Error::Restore(_) => -2,
			Error::Transport(_) | Error::Ibec(_) => -5,
			_ => -1,
		}
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn exit_codes_follow_the_cli_contract()
	{
		assert_eq!(Error::Configuration("x".into()).exit_code(), -1);
		assert_eq!(Error::Restore("x".into()).exit_code(), -2);
		assert_eq!(Error::Transport("x".into()).exit_code(), -5);
		assert_eq!(Error::Ibec(0x03).exit_code(), -5);
		assert_eq!(Error::Manifest("x".into()).exit_code(), -1);
	}
}
