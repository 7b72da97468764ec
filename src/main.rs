//! Sepwire daemon entry point
//!
//! One binary, four process images. Invoked plainly it is the master;
//! the master re-execs it with one of `-E`, `-I`, `-P` or `-M` and an
//! inherited descriptor number to produce the enclave, an interface
//! worker, the proxy or the idle supervisor.

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use sepwire::{enclave, ifn, master, proxy};

/// Privilege-separated WireGuard tunnel daemon
#[derive(Parser, Debug)]
#[command(name = "sepwire")]
#[command(version, about, long_about = None)]
struct Args {
    /// Stay in the foreground
    #[arg(short = 'd')]
    foreground: bool,

    /// Configuration file
    #[arg(short = 'f', value_name = "file")]
    config: Option<PathBuf>,

    /// Test the configuration and exit
    #[arg(short = 'n')]
    configtest: bool,

    /// Decrease verbosity (may repeat)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    quiet: u8,

    /// Increase verbosity (may repeat)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Internal: become the enclave on this descriptor
    #[arg(short = 'E', value_name = "fd", hide = true)]
    enclave: Option<RawFd>,

    /// Internal: become an interface worker on this descriptor
    #[arg(short = 'I', value_name = "fd", hide = true)]
    ifn: Option<RawFd>,

    /// Internal: become the proxy on this descriptor
    #[arg(short = 'P', value_name = "fd", hide = true)]
    proxy: Option<RawFd>,

    /// Internal: become the supervisor on this descriptor
    #[arg(short = 'M', value_name = "fd", hide = true)]
    master: Option<RawFd>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let result = if let Some(fd) = args.enclave {
        enclave::run(fd)
    } else if let Some(fd) = args.ifn {
        ifn::run(fd)
    } else if let Some(fd) = args.proxy {
        proxy::run(fd)
    } else if let Some(fd) = args.master {
        master::supervise(fd)
    } else {
        master::run(master::Options {
            config: args.config,
            foreground: args.foreground,
            configtest: args.configtest,
            verbose: args.verbose as i32 - args.quiet as i32,
        })
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // logging may not be up yet in the master path
            eprintln!("sepwire: {err}");
            tracing::error!(%err, "fatal");
            ExitCode::FAILURE
        }
    }
}
