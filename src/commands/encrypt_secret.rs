use crate::secrets::{encrypt_setting_value, SECRETS_KEY_ENV_VAR};
use anyhow::{Context, Result};

/// Prints the `enc:v1:` form of `value` for pasting into settings.
pub fn run(value: &str) -> Result<()> {
    let encrypted = encrypt_setting_value(value)
        .with_context(|| format!("Failed to encrypt value; is {} set?", SECRETS_KEY_ENV_VAR))?;
    println!("{}", encrypted);
    Ok(())
}
