pub mod cli;

use std::fmt::Display;
use std::io;

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{generate, shells::Bash};
use log::error;

use brlio::protocol::{self, Family};
use brlio::{DetectOptions, Identified};

use cli::{Cli, StructOpt};

enum OutputFormat {
    Plain,
    Json,
}

fn slice_to_column<T>(data: &[T]) -> String
where
    T: Display,
{
    data.iter()
        .map(|id| id.to_string())
        .collect::<Vec<String>>()
        .join("\n")
}

fn identified_to_json(identified: &Identified, resource: &str) -> json::JsonValue {
    let model = &identified.identity.model;
    let mut value = json::JsonValue::new_object();
    value["resource"] = resource.into();
    value["variant"] = identified.variant.to_string().into();
    value["model"] = model.name.into();
    value["identifier"] = model.identifier.into();
    value["text_columns"] = model.text_columns.into();
    value["status_cells"] = model.status_cells.into();
    value["speed"] = identified.speed.into();
    if let Some((major, minor)) = identified.identity.version {
        value["firmware"] = format!("{}.{}", major, minor).into();
    }
    value
}

fn cmd_probe(device: &str, family: Family, options: &DetectOptions, fmt: OutputFormat) -> Result<String> {
    let mut detected = brlio::detect(device, family, options)
        .with_context(|| format!("could not detect display on {}", device))?;
    let resource = detected
        .endpoint
        .resource_name()
        .unwrap_or_else(|_| device.to_string());
    let identified = detected.identified;
    detected.endpoint.disconnect();

    Ok(match fmt {
        OutputFormat::Plain => format!("{}: {}", resource, identified),
        OutputFormat::Json => json::stringify(identified_to_json(&identified, &resource)),
    })
}

fn cmd_list_models(family: Family, fmt: OutputFormat) -> Result<String> {
    let models = protocol::list_models(family);
    Ok(match fmt {
        OutputFormat::Plain => slice_to_column(models.as_slice()),
        OutputFormat::Json => json::stringify(models),
    })
}

fn cmd_list_families(fmt: OutputFormat) -> Result<String> {
    let families: Vec<&str> = Family::ALL.iter().map(|family| family.name()).collect();
    Ok(match fmt {
        OutputFormat::Plain => slice_to_column(families.as_slice()),
        OutputFormat::Json => json::stringify(families),
    })
}

fn do_main() -> Result<String> {
    if std::env::var("GENERATE_COMPLETION").is_ok() {
        generate(
            Bash,
            &mut cli::Cli::command(),
            "brlio-probe",
            &mut io::stdout(),
        );

        return Ok(String::default());
    }

    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if cli.debug {
        "debug"
    } else {
        "info"
    }))
    .format_timestamp(None)
    .format_target(false)
    .init();

    let fmt = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Plain
    };

    match cli.command {
        cli::Commands::Probe => {
            let options = DetectOptions {
                speeds: cli.speeds.map(|speeds| speeds.to_vec()),
                attempts: cli.attempts,
            };
            cmd_probe(&cli.device, cli.protocol, &options, fmt)
        }
        cli::Commands::ListModels { family } => cmd_list_models(family, fmt),
        cli::Commands::ListFamilies => cmd_list_families(fmt),
    }
}

fn main() {
    match do_main() {
        Ok(s) => println!("{}", s),
        Err(e) => error!("{:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undetected_display_is_reported_once() {
        let err = cmd_probe("nowhere:0", Family::Baum, &DetectOptions::default(), OutputFormat::Plain)
            .unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.starts_with("could not detect display on nowhere:0"));
        assert_eq!(message.matches("could not detect").count(), 1);
    }

    #[test]
    fn families_as_json() {
        assert_eq!(
            cmd_list_families(OutputFormat::Json).unwrap(),
            r#"["alva","baum","hims","inceptor","papenmeier"]"#
        );
    }
}
