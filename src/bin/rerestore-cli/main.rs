// SPDX-License-Identifier: MIT OR Apache-2.0

use std::path::PathBuf;

use clap::{Parser, crate_description, crate_version};
use directories::ProjectDirs;
use indicatif::{ProgressBar, ProgressStyle};
use log::error;

use rerestore::client::{Client, RestoreFlags};
use rerestore::error::Result;
use rerestore::http::ReqwestClient;
use rerestore::restore::{Restorer, Step};
use rerestore::restored::PlistStreamer;
use rerestore::transport::usb::UsbBackend;

#[derive(Parser)]
#[command(
	version,
	about = format!("{} v{}", crate_description!(), crate_version!()),
	arg_required_else_help(true)
)]
struct CliArguments
{
	/// Firmware archive to restore (not needed with --latest)
	ipsw: Option<PathBuf>,

	#[arg(short = 'd', long = "debug")]
	/// Print communication and state-machine details
	debug: bool,
	#[arg(short = 'r', long = "rerestore")]
	/// Replay a previously issued ticket instead of asking for a new one
	rerestore: bool,
	#[arg(short = 'e', long = "erase", conflicts_with = "update")]
	/// Perform a full restore, wiping user data
	erase: bool,
	#[arg(short = 'u', long = "update")]
	/// Perform an update restore, preserving user data
	update: bool,
	#[arg(short = 'l', long = "latest")]
	/// Download and restore the latest firmware for the attached device
	latest: bool,
	#[arg(short = 'c', long = "custom")]
	/// The archive contains custom (unsigned) firmware
	custom: bool,
	#[arg(short = 't', long = "shsh-only")]
	/// Only fetch the signing ticket and store it in the cache, then stop
	shsh_only: bool,
	#[arg(short = 'n', long = "no-action")]
	/// Stop after resolving the firmware, before touching the device
	no_action: bool,
	#[arg(long = "cache-dir")]
	/// Directory for cached downloads, tickets and extracted filesystems
	cache_dir: Option<PathBuf>,
	#[arg(long = "keep-personalized")]
	/// Keep a copy of every personalized component in the working directory
	keep_personalized: bool,
}

impl CliArguments
{
	fn flags(&self) -> RestoreFlags
	{
		let mut flags = RestoreFlags::none();
		if self.debug {
			flags |= RestoreFlags::Debug;
		}
		if self.rerestore {
			flags |= RestoreFlags::Rerestore;
		}
		if self.erase {
			flags |= RestoreFlags::Erase;
		}
		if self.update {
			flags |= RestoreFlags::Update;
		}
		if self.latest {
			flags |= RestoreFlags::Latest;
		}
		if self.custom {
			flags |= RestoreFlags::Custom;
		}
		if self.shsh_only {
			flags |= RestoreFlags::ShshOnly;
		}
		if self.no_action {
			flags |= RestoreFlags::NoAction;
		}
		flags
	}
}

fn run(args: &CliArguments) -> Result<()>
{
	let cache_dir = args.cache_dir.clone().or_else(|| {
		ProjectDirs::from("org", "", "rerestore").map(|dirs| dirs.cache_dir().to_path_buf())
	});

	let mut client = Client::new(args.flags(), args.ipsw.clone(), cache_dir)?;
	client.keep_personalized = args.keep_personalized;

	let http = ReqwestClient::new()?;
	let mut backend = UsbBackend::new();
	let mut streamer = PlistStreamer::new();

	// One bar across the whole run; the step name tells the user where the
	// state machine currently is.
	let progress_bar = ProgressBar::new(100).with_style(
		ProgressStyle::default_bar()
			.template(" {msg:8} {percent:>3}% |{bar:50}| [{elapsed}]")
			.expect("progress bar template must parse"),
	);
	let bar = progress_bar.clone();

	let mut restorer = Restorer::new(client, &mut backend, &http).with_progress(move |step, fraction| {
		bar.set_message(step.to_string());
		bar.set_position((fraction.clamp(0.0, 1.0) * 100.0) as u64);
		if step == Step::Restore && fraction >= 1.0 {
			bar.finish();
		}
	});
	restorer.run(&mut streamer)
}

fn main()
{
	let args = CliArguments::parse();

	env_logger::Builder::new()
		.filter_level(if args.debug {
			log::LevelFilter::Debug
		} else {
			log::LevelFilter::Info
		})
		.parse_default_env()
		.init();

	if let Err(error) = run(&args) {
		error!("{error}");
		std::process::exit(error.exit_code());
	}
}
