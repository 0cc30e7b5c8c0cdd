//! Command-line parsing (component C2, `spec.md` §6): `tender [--mem=MiB]
//! [--net:NAME=IFACE] [--net-mac:NAME=HH:..] [--block:NAME=PATH]
//! [--dumpcore=DIR] [--] KERNEL [ARGS...]`.
//!
//! `clap`'s derive macros model ordinary `--flag=value` options well, but
//! have no notion of a flag whose *name* varies per manifest device
//! (`--net:eth0=...`, `--block:disk=...`). Those are pulled out of argv by
//! hand before the rest is handed to clap, mirroring the original tender's
//! own two-pass parse: a fixed set of global options, then one
//! `--MODULE:NAME=VALUE` dispatch per attached device (`spec.md` §6).

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Clap(#[from] clap::Error),
    #[error("malformed device flag {0:?}: expected --MODULE:NAME=VALUE")]
    BadDeviceFlag(String),
}

/// One `--MODULE:NAME=VALUE` device argument, not yet dispatched to a
/// specific `DeviceModule` (`tender-core::main` tries each module in turn).
#[derive(Debug, Clone)]
pub struct DeviceArg {
    pub module: String,
    pub value: String,
}

#[derive(Debug, Parser)]
#[command(name = "tender", about = "Solo5 tender: loads and runs a Solo5 unikernel")]
struct RawCli {
    /// Guest memory size in MiB.
    #[arg(long, default_value_t = 512)]
    mem: u64,

    /// Directory to write a guest core dump to on abnormal exit.
    #[arg(long)]
    dumpcore: Option<PathBuf>,

    /// Guest ELF image, followed by its own argv.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    rest: Vec<String>,
}

pub struct Cli {
    pub mem_mib: u64,
    pub dumpcore_dir: Option<PathBuf>,
    pub device_args: Vec<DeviceArg>,
    pub kernel: PathBuf,
    pub guest_args: Vec<String>,
}

const DEVICE_MODULE_NAMES: [&str; 3] = ["net", "net-mac", "block"];

/// Splits `--MODULE:NAME=VALUE` tokens (net/net-mac/block) out of `argv`,
/// leaving everything else for clap.
pub fn parse<I: IntoIterator<Item = String>>(argv: I) -> Result<Cli, CliError> {
    let mut device_args = Vec::new();
    let mut remaining = vec!["tender".to_string()];

    for arg in argv {
        if let Some(rest) = arg.strip_prefix("--") {
            if let Some((module, value)) = rest.split_once(':') {
                if DEVICE_MODULE_NAMES.contains(&module) {
                    if value.split_once('=').is_none() {
                        return Err(CliError::BadDeviceFlag(arg));
                    }
                    device_args.push(DeviceArg {
                        module: module.to_string(),
                        value: value.to_string(),
                    });
                    continue;
                }
            }
        }
        remaining.push(arg);
    }

    let raw = RawCli::try_parse_from(remaining)?;
    let mut rest = raw.rest.into_iter();
    let kernel = rest.next().map(PathBuf::from).ok_or_else(|| {
        CliError::Clap(clap::Error::raw(
            clap::error::ErrorKind::MissingRequiredArgument,
            "missing KERNEL argument\n",
        ))
    })?;
    let guest_args = rest.collect();

    Ok(Cli {
        mem_mib: raw.mem,
        dumpcore_dir: raw.dumpcore,
        device_args,
        kernel,
        guest_args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn defaults_mem_to_512_mib() {
        let cli = parse(argv("unikernel.hvt")).unwrap();
        assert_eq!(cli.mem_mib, 512);
        assert_eq!(cli.kernel, PathBuf::from("unikernel.hvt"));
        assert!(cli.guest_args.is_empty());
    }

    #[test]
    fn splits_device_flags_from_kernel_and_guest_args() {
        let cli = parse(argv(
            "--mem=1024 --net:eth0=@3 --block:disk=/tmp/disk.img unikernel.hvt guestarg1 guestarg2",
        ))
        .unwrap();
        assert_eq!(cli.mem_mib, 1024);
        assert_eq!(cli.device_args.len(), 2);
        assert_eq!(cli.device_args[0].module, "net");
        assert_eq!(cli.device_args[0].value, "eth0=@3");
        assert_eq!(cli.device_args[1].module, "block");
        assert_eq!(cli.kernel, PathBuf::from("unikernel.hvt"));
        assert_eq!(cli.guest_args, vec!["guestarg1", "guestarg2"]);
    }

    #[test]
    fn rejects_device_flag_without_equals() {
        let err = parse(argv("--net:eth0 unikernel.hvt")).unwrap_err();
        assert!(matches!(err, CliError::BadDeviceFlag(_)));
    }

    #[test]
    fn parses_dumpcore_flag() {
        let cli = parse(argv("--dumpcore=/tmp unikernel.hvt")).unwrap();
        assert_eq!(cli.dumpcore_dir, Some(PathBuf::from("/tmp")));
    }
}
