pub mod alva;
pub mod baum;
pub mod hims;
pub mod papenmeier;

use itertools::Itertools;
use std::{fmt::Display, str::FromStr};
use thiserror::Error;

use crate::gio::{Descriptor, TransportKind};
use crate::identify::Probe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Hims,
    Inceptor,
    Baum,
    Papenmeier,
    Alva,
}

impl Family {
    pub const ALL: [Family; 5] = [
        Family::Alva,
        Family::Baum,
        Family::Hims,
        Family::Inceptor,
        Family::Papenmeier,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Family::Hims => "hims",
            Family::Inceptor => "inceptor",
            Family::Baum => "baum",
            Family::Papenmeier => "papenmeier",
            Family::Alva => "alva",
        }
    }

    pub fn models(self) -> &'static [Model] {
        match self {
            Family::Hims => hims::MODELS,
            Family::Inceptor => hims::INCEPTOR_MODELS,
            Family::Baum => baum::MODELS,
            Family::Papenmeier => papenmeier::MODELS,
            Family::Alva => alva::MODELS,
        }
    }

    /// Transports this family can be reached over, with their defaults.
    pub fn descriptor(self) -> Descriptor {
        match self {
            Family::Hims => hims::descriptor(),
            Family::Inceptor => hims::inceptor_descriptor(),
            Family::Baum => baum::descriptor(),
            Family::Papenmeier => papenmeier::descriptor(),
            Family::Alva => alva::descriptor(),
        }
    }

    /// Candidate line speeds, most likely first.
    pub fn speeds(self, kind: TransportKind) -> Vec<u32> {
        match self {
            Family::Hims | Family::Inceptor => vec![hims::BAUD],
            Family::Baum => vec![baum::BAUD],
            Family::Papenmeier => papenmeier::speeds(kind),
            Family::Alva => vec![alva::BAUD],
        }
    }

    pub fn probes(self, kind: TransportKind) -> Vec<Box<dyn Probe>> {
        match self {
            Family::Hims => vec![Box::new(hims::HimsProbe::new(Variant::Hims))],
            Family::Inceptor => vec![Box::new(hims::HimsProbe::new(Variant::Inceptor))],
            Family::Baum => vec![Box::new(baum::BaumProbe::new())],
            Family::Papenmeier => papenmeier::probes(kind),
            Family::Alva => vec![Box::new(alva::AlvaProbe::new())],
        }
    }
}

impl Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name().fmt(f)
    }
}

#[derive(Error, Debug)]
pub enum FamilyError {
    #[error("invalid protocol family '{0}'")]
    BadFamily(String),
}

impl FromStr for Family {
    type Err = FamilyError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Family::ALL
            .iter()
            .copied()
            .find(|family| family.name().eq_ignore_ascii_case(input))
            .ok_or_else(|| FamilyError::BadFamily(input.to_string()))
    }
}

/// The wire protocol an identified display speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Hims,
    Inceptor,
    Baum,
    Papenmeier1,
    Papenmeier2,
    Alva,
}

impl Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Variant::Hims => "HIMS".fmt(f),
            Variant::Inceptor => "Inceptor".fmt(f),
            Variant::Baum => "Baum".fmt(f),
            Variant::Papenmeier1 => "Papenmeier protocol 1".fmt(f),
            Variant::Papenmeier2 => "Papenmeier protocol 2".fmt(f),
            Variant::Alva => "Alva protocol 1".fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Model {
    pub identifier: u8,
    pub name: &'static str,
    pub text_columns: u8,
    pub status_cells: u8,
    pub protocol_revision: u8,
}

impl Model {
    pub const fn new(
        identifier: u8,
        name: &'static str,
        text_columns: u8,
        status_cells: u8,
        protocol_revision: u8,
    ) -> Self {
        Model {
            identifier,
            name,
            text_columns,
            status_cells,
            protocol_revision,
        }
    }
}

impl Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:3} {:<28} {:2}+{}",
            self.identifier, self.name, self.text_columns, self.status_cells
        )
    }
}

/// What the identification reply said about the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub model: Model,
    /// Firmware (major, minor), when the reply carries it.
    pub version: Option<(u8, u8)>,
}

impl Identity {
    pub fn new(model: Model) -> Self {
        Identity {
            model,
            version: None,
        }
    }

    pub fn with_version(model: Model, major: u8, minor: u8) -> Self {
        Identity {
            model,
            version: Some((major, minor)),
        }
    }
}

pub fn find_model(models: &[Model], identifier: u8) -> Option<Model> {
    models
        .iter()
        .copied()
        .find(|model| model.identifier == identifier)
}

pub fn list_models(family: Family) -> Vec<&'static str> {
    family
        .models()
        .iter()
        .map(|model| model.name)
        .unique()
        .sorted()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_names() {
        assert_eq!("papenmeier".parse::<Family>().unwrap(), Family::Papenmeier);
        assert_eq!("HIMS".parse::<Family>().unwrap(), Family::Hims);
        assert!("braillex".parse::<Family>().is_err());
        for family in Family::ALL {
            assert_eq!(family.to_string().parse::<Family>().unwrap(), family);
        }
    }

    #[test]
    fn model_tables_have_unique_identifiers() {
        for family in Family::ALL {
            let models = family.models();
            assert!(!models.is_empty(), "{}", family);
            assert_eq!(
                models.iter().map(|m| m.identifier).unique().count(),
                models.len(),
                "{}",
                family
            );
        }
    }

    #[test]
    fn sorted_listing() {
        let names = list_models(Family::Alva);
        assert_eq!(names.first(), Some(&"ABT 320"));
        assert!(names.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn every_family_has_a_probe() {
        for family in Family::ALL {
            assert!(!family.probes(TransportKind::Serial).is_empty());
            assert!(!family.speeds(TransportKind::Serial).is_empty());
            assert!(family.descriptor().serial.parameters.is_some());
        }
    }
}
