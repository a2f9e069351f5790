pub mod attributes;
pub mod event;
pub mod script;
pub mod sequence;

use ron::extensions::Extensions;
use serde::de::DeserializeOwned;

/// Parses a script document. Optional fields may be written without
/// `Some(..)`.
pub fn parse_document<T: DeserializeOwned>(input: &str) -> Result<T, ron::error::SpannedError> {
    ron::Options::default()
        .with_default_extension(Extensions::IMPLICIT_SOME)
        .from_str(input)
}
