//! Credential lookup.

use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::config::{SecretProvider, SecretsConfig};

pub trait SecretSource {
    fn get(&self, name: &str) -> Result<String>;
}

/// Reads `openai-key` from `OPENAI_KEY`, and so on.
pub struct EnvSecrets;

impl EnvSecrets {
    pub fn variable_for(name: &str) -> String {
        name.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl SecretSource for EnvSecrets {
    fn get(&self, name: &str) -> Result<String> {
        let var = Self::variable_for(name);
        let value = std::env::var(&var)
            .with_context(|| format!("secret '{name}' not set (expected ${var})"))?;
        if value.trim().is_empty() {
            bail!("secret '{name}' is empty (${var})");
        }
        Ok(value)
    }
}

/// Runs an external command (a vault CLI) with the secret name appended.
pub struct CommandSecrets {
    program: String,
    args: Vec<String>,
}

impl CommandSecrets {
    pub fn new(command: &[String]) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            bail!("secrets.command must name a program when provider = \"command\"");
        };
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl SecretSource for CommandSecrets {
    fn get(&self, name: &str) -> Result<String> {
        debug!(program = %self.program, secret = name, "fetching secret");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(name)
            .output()
            .with_context(|| format!("failed to run secret command '{}'", self.program))?;
        if !output.status.success() {
            bail!(
                "secret command failed for '{}': {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if value.is_empty() {
            bail!("secret command returned nothing for '{name}'");
        }
        Ok(value)
    }
}

pub fn from_config(config: &SecretsConfig) -> Result<Box<dyn SecretSource>> {
    Ok(match config.provider {
        SecretProvider::Env => Box::new(EnvSecrets),
        SecretProvider::Command => Box::new(CommandSecrets::new(&config.command)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn variable_names() {
        assert_eq!(EnvSecrets::variable_for("openai-key"), "OPENAI_KEY");
        assert_eq!(EnvSecrets::variable_for("github.pat"), "GITHUB_PAT");
    }

    #[test]
    #[serial]
    fn env_secrets_read_process_environment() {
        unsafe { std::env::set_var("PATCHWARDEN_TEST_SECRET", "s3cret") };
        assert_eq!(EnvSecrets.get("patchwarden-test-secret").unwrap(), "s3cret");
        unsafe { std::env::remove_var("PATCHWARDEN_TEST_SECRET") };
        let err = EnvSecrets.get("patchwarden-test-secret").unwrap_err().to_string();
        assert!(err.contains("$PATCHWARDEN_TEST_SECRET"));
    }

    #[test]
    fn command_secrets_append_name() {
        let source = CommandSecrets::new(&["echo".to_string(), "value-for".to_string()]).unwrap();
        assert_eq!(source.get("openai-key").unwrap(), "value-for openai-key");
    }

    #[test]
    fn failing_command_is_an_error() {
        let source = CommandSecrets::new(&["false".to_string()]).unwrap();
        assert!(source.get("x").is_err());
    }

    #[test]
    fn command_provider_needs_a_program() {
        let config = SecretsConfig {
            provider: SecretProvider::Command,
            command: vec![],
        };
        assert!(from_config(&config).is_err());
        assert!(from_config(&SecretsConfig::default()).is_ok());
    }
}
