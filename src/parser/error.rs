use std::num::{ParseFloatError, ParseIntError};

use thiserror;

/// Custom Error Type
#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("Line is not a sequence of key=value pairs: '{raw}'")]
    MalformedRecord { raw: String },
    #[error("A measurement record did not have all necessary fields")]
    MeasurementIncomplete(#[from] super::measurement::MeasurementBuilderError),
    #[error("A consensus relay entry did not have all necessary fields")]
    StatusEntryIncomplete(#[from] super::consensus::StatusEntryBuilderError),
    #[error("Required field '{field}' missing")]
    FieldMissing { field: &'static str },
    #[error("Could not parse integer")]
    InvalidInt(#[from] ParseIntError),
    #[error("Could not parse float")]
    InvalidFloat(#[from] ParseFloatError),
    #[error("Could not decode identity as base64")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("Scan file is missing its two header lines")]
    TruncatedScanFile,
    #[error("Scan file timestamp is not a number")]
    InvalidTimestamp,
    #[error("An item with keyword '{keyword}' was not expected at this position")]
    UnexpectedKeyword { keyword: String },
    #[error("Invalid bandwidth weight entry")]
    InvalidBandwidthWeight,
    #[error("Invalid consensus parameter '{raw}'")]
    InvalidParam { raw: String },
}
