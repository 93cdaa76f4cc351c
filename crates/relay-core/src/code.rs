//! Pickup code generation
//!
//! Codes are drawn uniformly from a fixed alphabet. Uniqueness among active
//! sessions is enforced by the registry, which regenerates on collision.

use rand::Rng;

use crate::config::SessionSettings;
use crate::errors::{RelayError, Result};
use crate::types::PickupCode;

/// Digits followed by upper-case letters
pub const DEFAULT_ALPHABET: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Source of candidate pickup codes
pub trait CodeGenerator: Send + Sync {
    fn generate(&self) -> PickupCode;
}

/// Uniform random codes of a fixed length
#[derive(Debug, Clone)]
pub struct RandomCodeGenerator {
    alphabet: Vec<u8>,
    length: usize,
}

impl RandomCodeGenerator {
    pub fn new(length: usize, alphabet: &str) -> Result<Self> {
        if length == 0 {
            return Err(RelayError::config("pickup code length must be at least 1"));
        }
        if alphabet.is_empty() || !alphabet.is_ascii() {
            return Err(RelayError::config(
                "pickup code alphabet must be a non-empty ASCII string",
            ));
        }
        let mut symbols: Vec<u8> = alphabet.to_ascii_uppercase().into_bytes();
        symbols.sort_unstable();
        symbols.dedup();
        Ok(Self {
            alphabet: symbols,
            length,
        })
    }

    pub fn from_settings(settings: &SessionSettings) -> Result<Self> {
        Self::new(settings.code_length, &settings.code_alphabet)
    }

    /// Number of distinct codes this generator can produce
    pub fn code_space(&self) -> u128 {
        (self.alphabet.len() as u128).saturating_pow(self.length as u32)
    }
}

impl Default for RandomCodeGenerator {
    fn default() -> Self {
        Self {
            alphabet: DEFAULT_ALPHABET.as_bytes().to_vec(),
            length: 6,
        }
    }
}

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self) -> PickupCode {
        let mut rng = rand::thread_rng();
        let code: String = (0..self.length)
            .map(|_| self.alphabet[rng.gen_range(0..self.alphabet.len())] as char)
            .collect();
        PickupCode::from(code)
    }
}
