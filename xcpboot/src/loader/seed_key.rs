//! Seed/key unlock support.
//!
//! A target may protect its programming resource. The loader then asks for
//! a seed, hands it to a [`SeedKeyResolver`] and sends back the key.

use crate::error::{Error, Result};
use crate::hex::parse_hex;
use log::debug;
use std::path::PathBuf;
use std::process::Command;

/// Computes the key that unlocks a resource from the seed the target sent.
pub trait SeedKeyResolver: Send + Sync {
    /// Derive the key for `seed`.
    fn compute_key(&self, seed: &[u8]) -> Result<Vec<u8>>;
}

impl<F> SeedKeyResolver for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync,
{
    fn compute_key(&self, seed: &[u8]) -> Result<Vec<u8>> {
        self(seed)
    }
}

/// Resolver that runs an external program.
///
/// The program is called with the seed as a single hex string argument and
/// must print the key as hex on its standard output. Whitespace between
/// hex digits is ignored. The program runs with the privileges of the
/// caller; only configure programs you trust.
#[derive(Debug, Clone)]
pub struct ExternalKeyProgram {
    program: PathBuf,
}

impl ExternalKeyProgram {
    /// Resolver running `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Path of the program.
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

impl SeedKeyResolver for ExternalKeyProgram {
    fn compute_key(&self, seed: &[u8]) -> Result<Vec<u8>> {
        let seed_hex = hex::encode_upper(seed);
        debug!("Running {} {seed_hex}", self.program.display());
        let output = Command::new(&self.program)
            .arg(&seed_hex)
            .output()
            .map_err(|e| {
                Error::SecurityLocked(format!("cannot run {}: {e}", self.program.display()))
            })?;
        if !output.status.success() {
            return Err(Error::SecurityLocked(format!(
                "{} exited with {}",
                self.program.display(),
                output.status
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let key = parse_hex(&stdout)?;
        if key.is_empty() {
            return Err(Error::SecurityLocked(format!(
                "{} printed no key",
                self.program.display()
            )));
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_resolver() {
        let resolver = |seed: &[u8]| -> Result<Vec<u8>> { Ok(seed.iter().map(|b| !b).collect()) };
        assert_eq!(resolver.compute_key(&[0x0F]).unwrap(), vec![0xF0]);
    }

    #[test]
    fn test_missing_program_is_security_error() {
        let resolver = ExternalKeyProgram::new("/nonexistent/xcpboot-seed-key");
        assert!(matches!(
            resolver.compute_key(&[1, 2]),
            Err(Error::SecurityLocked(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_external_program_echoes_key() {
        let resolver = ExternalKeyProgram::new("echo");
        assert_eq!(
            resolver.compute_key(&[0xDE, 0xAD]).unwrap(),
            vec![0xDE, 0xAD]
        );
    }
}
