//! Braille display I/O: transport endpoints, packet framing and display
//! identification.

pub mod error;
pub mod framer;
pub mod gio;
pub mod identify;
pub mod protocol;

pub use error::{Error, Result};
pub use framer::{FrameFormat, Framer};
pub use gio::{connect, Descriptor, Endpoint};
pub use identify::{detect, identify, DetectOptions, Detected, Identified};
pub use protocol::{Family, Identity, Model, Variant};
