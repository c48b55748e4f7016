use thiserror::Error;

///////////
// Types //
///////////

/// Result alias used across the crate
pub type LdaResult<T> = Result<T, LdaError>;

/// Errors that abort a fitting run
///
/// Degenerate coherence scores are not represented here: they are reported
/// via `log::warn!` and surface as `NaN` in the coherence output.
#[derive(Debug, Error)]
pub enum LdaError {
    /// No units or no features survived the count filters.
    #[error("empty corpus after filtering: {n_units} units, {n_features} features retained")]
    EmptyCorpus { n_units: usize, n_features: usize },

    /// A required column is missing from the input header.
    #[error("required column '{column}' not found in header of {path}")]
    Schema { column: String, path: String },

    /// A unit re-appeared within a batch after its records were closed. The
    /// input has to be grouped by unit id.
    #[error("unit '{unit}' is not contiguous in the input stream; records must be grouped by unit")]
    StreamOrderingViolation { unit: String },

    /// Configuration rejected at start-up.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A data line could not be parsed.
    #[error("malformed record at line {line}: {msg}")]
    Parse { line: usize, msg: String },

    /// The summed count of one (unit, feature) pair does not fit in `u32`.
    #[error("count of feature '{feature}' in unit '{unit}' exceeds {}", u32::MAX)]
    CountOverflow { unit: String, feature: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialisation failed: {0}")]
    Serialisation(String),
}

impl From<bincode::error::EncodeError> for LdaError {
    fn from(err: bincode::error::EncodeError) -> Self {
        LdaError::Serialisation(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for LdaError {
    fn from(err: bincode::error::DecodeError) -> Self {
        LdaError::Serialisation(err.to_string())
    }
}
