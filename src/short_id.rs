use std::{fmt, sync::Arc};

use rand::{Rng, distr::Alphanumeric};
use rearch::CapsuleHandle;
use thiserror::Error;

/// Number of characters in every issued [`ShortId`].
pub const SHORT_ID_LENGTH: usize = 8;

pub fn short_id_generator_capsule(_: CapsuleHandle) -> Arc<dyn ShortIdGenerator> {
    Arc::new(RandomShortIdGenerator)
}

pub trait ShortIdGenerator: Send + Sync {
    /// Draws `length` characters independently and uniformly from `[A-Za-z0-9]`.
    ///
    /// Calls are independent of each other; there is no sequence to resume.
    fn generate(&self, length: usize) -> String;
}

pub struct RandomShortIdGenerator;

impl ShortIdGenerator for RandomShortIdGenerator {
    fn generate(&self, length: usize) -> String {
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect()
    }
}

/// The immutable public identifier of a QR code, embedded in its redirect URL.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShortId(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShortIdValidationError {
    #[error("short ID must be {expected} characters long, but was {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("short ID contains invalid characters: {invalid_chars}")]
    InvalidCharacters { invalid_chars: String },
}

impl ShortId {
    /// # Errors
    /// Will return [`Err`] if `id` is not exactly [`SHORT_ID_LENGTH`] ASCII alphanumerics.
    pub fn new(id: String) -> Result<Self, ShortIdValidationError> {
        let invalid_chars: String = id.chars().filter(|c| !c.is_ascii_alphanumeric()).collect();
        if !invalid_chars.is_empty() {
            return Err(ShortIdValidationError::InvalidCharacters { invalid_chars });
        }

        // all chars are ASCII at this point, so bytes == chars
        if id.len() != SHORT_ID_LENGTH {
            return Err(ShortIdValidationError::InvalidLength {
                expected: SHORT_ID_LENGTH,
                actual: id.len(),
            });
        }

        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
