use std::path::PathBuf;

use possync_core::util::is_http_url;

use crate::commands::common::Settings;
use crate::config_profiles::{default_config_path, normalize_profile_name, CliProfilesConfig};
use crate::error::CliError;

/// Fields accepted by `profile set`; `None` leaves the stored value untouched
#[derive(Debug, Default)]
pub struct ProfileUpdate {
    pub db_path: Option<PathBuf>,
    pub tenant: Option<String>,
    pub device: Option<String>,
    pub server_url: Option<String>,
    pub config_path: Option<PathBuf>,
}

pub fn run_profile_show(settings: &Settings, profile: Option<&str>) -> Result<(), CliError> {
    let config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let name = config.resolve_profile_name(profile);

    println!("profile:    {name}");
    println!("file:       {}", default_config_path().display());
    println!("db path:    {}", settings.db_path.display());
    println!("tenant:     {}", settings.tenant.as_deref().unwrap_or("-"));
    println!("device:     {}", settings.device);
    println!("server url: {}", settings.server_url.as_deref().unwrap_or("-"));
    println!(
        "config:     {}",
        settings
            .config_path
            .as_ref()
            .map_or_else(|| "-".to_string(), |path| path.display().to_string())
    );
    Ok(())
}

pub fn run_profile_set(profile: Option<&str>, update: ProfileUpdate) -> Result<(), CliError> {
    if let Some(url) = update.server_url.as_deref() {
        if !is_http_url(url) {
            return Err(CliError::Config(format!(
                "server url must start with http:// or https://, got {url}"
            )));
        }
    }

    let mut config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let name = config.resolve_profile_name(profile);
    apply_update(&mut config, &name, update);
    let path = config.save().map_err(CliError::Config)?;
    println!("Updated profile {name} in {}", path.display());
    Ok(())
}

pub fn run_profile_use(name: &str) -> Result<(), CliError> {
    let name = normalize_profile_name(Some(name))
        .ok_or_else(|| CliError::Config("profile name cannot be empty".to_string()))?;
    let mut config = CliProfilesConfig::load().map_err(CliError::Config)?;
    config.profile_mut_or_default(&name);
    config.active_profile = Some(name.clone());
    config.save().map_err(CliError::Config)?;
    println!("Active profile is now {name}");
    Ok(())
}

pub fn apply_update(config: &mut CliProfilesConfig, name: &str, update: ProfileUpdate) {
    let profile = config.profile_mut_or_default(name);
    if update.db_path.is_some() {
        profile.db_path = update.db_path;
    }
    if update.tenant.is_some() {
        profile.tenant = update.tenant;
    }
    if update.device.is_some() {
        profile.device = update.device;
    }
    if update.server_url.is_some() {
        profile.server_url = update.server_url;
    }
    if update.config_path.is_some() {
        profile.config_path = update.config_path;
    }
}
