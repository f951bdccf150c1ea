//! Command-line surface of the dispatcher.
//!
//! The flag syntax is frozen by compatibility with the fleet that invokes
//! the dispatcher from inetd and remote shells, so this is parsed by hand
//! rather than with clap:
//!
//! ```text
//! backhaul-dispatcher [--version] [-auth=<driver>] [-no-exit]
//!                     [-udp=<port>] [-tcp=<port>] [-config=<path>]
//!                     [service ...]
//! ```
//!
//! Positional service names toggle entries of the allow-list on; the
//! pseudo-service `amdump` enables the estimate/backup/check set.

use std::path::PathBuf;

#[derive(Debug, PartialEq, Eq)]
pub enum CliAction {
    /// Print the version and exit 0.
    Version,
    Run(CliOptions),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CliOptions {
    pub auth: Option<String>,
    pub no_exit: bool,
    pub udp_port: Option<u16>,
    pub tcp_port: Option<u16>,
    pub config_file: Option<PathBuf>,
    pub services: Vec<String>,
}

/// Parse everything after argv[0].  `Err` carries the usage complaint.
pub fn parse(args: &[String]) -> Result<CliAction, String> {
    let mut opts = CliOptions::default();
    for arg in args {
        if arg == "--version" {
            return Ok(CliAction::Version);
        } else if let Some(value) = arg.strip_prefix("-auth=") {
            if value.is_empty() {
                return Err("empty -auth= value".into());
            }
            opts.auth = Some(value.to_owned());
        } else if arg == "-no-exit" {
            opts.no_exit = true;
        } else if let Some(value) = arg.strip_prefix("-udp=") {
            opts.udp_port = Some(parse_port(value)?);
        } else if let Some(value) = arg.strip_prefix("-tcp=") {
            opts.tcp_port = Some(parse_port(value)?);
        } else if let Some(value) = arg.strip_prefix("-config=") {
            opts.config_file = Some(PathBuf::from(value));
        } else if arg.starts_with('-') {
            return Err(format!("unknown option {arg}"));
        } else {
            opts.services.push(arg.clone());
        }
    }
    Ok(CliAction::Run(opts))
}

fn parse_port(value: &str) -> Result<u16, String> {
    value
        .parse::<u16>()
        .map_err(|_| format!("bad port number {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_flag_short_circuits() {
        let args = vec!["--version".to_owned(), "-auth=ssl".to_owned()];
        assert_eq!(parse(&args).unwrap(), CliAction::Version);
    }

    #[test]
    fn flags_and_services_parse() {
        let args: Vec<String> = ["-auth=bsdtcp", "-no-exit", "-tcp=10080", "amdump", "amindexd"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        match parse(&args).unwrap() {
            CliAction::Run(opts) => {
                assert_eq!(opts.auth.as_deref(), Some("bsdtcp"));
                assert!(opts.no_exit);
                assert_eq!(opts.tcp_port, Some(10080));
                assert_eq!(opts.services, vec!["amdump", "amindexd"]);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn bad_inputs_rejected() {
        for bad in ["-auth=", "-udp=notaport", "-tcp=99999", "-frobnicate"] {
            let args = vec![bad.to_owned()];
            assert!(parse(&args).is_err(), "accepted {bad}");
        }
    }
}
