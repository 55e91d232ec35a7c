use anyhow::Result;
use brlio::Family;
pub use clap::StructOpt;
use clap::{Parser, Subcommand};
use lazy_static::lazy_static;
use regex::Regex;
use std::ops::Deref;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpeedListError {
    #[error("invalid speed '{0}'")]
    BadSpeed(String),
}

#[derive(Debug, Clone)]
pub struct SpeedList(Vec<u32>);

impl Deref for SpeedList {
    type Target = Vec<u32>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for SpeedList {
    type Err = SpeedListError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref RE: Regex = Regex::new(r"^\s*(\d+)\s*$").unwrap();
        }

        let mut result: Vec<u32> = Vec::new();

        for s in input.split(',') {
            let speed = RE
                .captures(s)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .filter(|&speed| speed > 0)
                .ok_or_else(|| SpeedListError::BadSpeed(s.to_string()))?;
            if !result.contains(&speed) {
                result.push(speed);
            }
        }

        Ok(SpeedList(result))
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// enable debug output
    #[clap(long, short)]
    pub debug: bool,

    /// Display resource: serial:/dev/ttyS0, usb:[serial], bluetooth:XX:XX:XX:XX:XX:XX or hid:/dev/hidrawN
    #[clap(long, short = 'D', default_value = "serial:/dev/ttyUSB0")]
    pub device: String,

    /// Display protocol family
    #[clap(long, short = 'P', default_value = "baum")]
    pub protocol: Family,

    /// Comma-separated line speeds to try instead of the family's
    #[clap(long, short)]
    pub speeds: Option<SpeedList>,

    /// Identification attempts per probe and speed
    #[clap(long, short)]
    pub attempts: Option<usize>,

    /// Use json-formatted output
    #[clap(long, short)]
    pub json: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Identify the display on the device
    Probe,

    /// List known models of a protocol family
    ListModels { family: Family },

    /// List supported protocol families
    ListFamilies,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_lists() {
        let speeds: SpeedList = "19200,38400, 19200".parse().unwrap();
        assert_eq!(*speeds, vec![19200, 38400]);
        assert!("19200,fast".parse::<SpeedList>().is_err());
        assert!("0".parse::<SpeedList>().is_err());
        assert!("".parse::<SpeedList>().is_err());
    }

    #[test]
    fn probe_arguments() {
        let cli = Cli::try_parse_from([
            "brlio-probe",
            "-D",
            "usb:",
            "-P",
            "papenmeier",
            "--speeds",
            "115200,57600",
            "--attempts",
            "1",
            "probe",
        ])
        .unwrap();
        assert_eq!(cli.device, "usb:");
        assert_eq!(cli.protocol, Family::Papenmeier);
        assert_eq!(cli.speeds.as_deref(), Some(&vec![115200, 57600]));
        assert_eq!(cli.attempts, Some(1));
        assert!(matches!(cli.command, Commands::Probe));
    }

    #[test]
    fn list_models_takes_a_family() {
        let cli = Cli::try_parse_from(["brlio-probe", "--json", "list-models", "alva"]).unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::ListModels {
                family: Family::Alva
            }
        ));
        assert!(Cli::try_parse_from(["brlio-probe", "list-models", "braillex"]).is_err());
    }
}
