use std::path::{Path, PathBuf};
use std::sync::Arc;

use possync_core::util::normalize_text_option;
use possync_core::{
    ActorId, DeltaSyncClient, DeviceId, FieldMap, HttpTransport, ManualReview, Operation,
    Record, RecordKey, SyncConfig, SyncStore, TenantId,
};
use serde_json::Value;

use crate::cli::GlobalArgs;
use crate::config_profiles::{CliProfile, CliProfilesConfig};
use crate::error::CliError;

const DEFAULT_DEVICE: &str = "possync-cli";

/// Settings after merging flags, environment and the selected profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub db_path: PathBuf,
    pub tenant: Option<String>,
    pub device: String,
    pub server_url: Option<String>,
    pub token: Option<String>,
    pub config_path: Option<PathBuf>,
}

impl Settings {
    pub fn resolve(args: &GlobalArgs) -> Result<Self, CliError> {
        let profiles = CliProfilesConfig::load().map_err(CliError::Config)?;
        let name = profiles.resolve_profile_name(args.profile.as_deref());
        Ok(Self::merge(args, profiles.profile(&name)))
    }

    pub fn merge(args: &GlobalArgs, profile: Option<&CliProfile>) -> Self {
        let profile = profile.cloned().unwrap_or_default();
        Self {
            db_path: args
                .db_path
                .clone()
                .or(profile.db_path)
                .unwrap_or_else(default_db_path),
            tenant: normalize_text_option(args.tenant.clone()).or(profile.tenant),
            device: normalize_text_option(args.device.clone())
                .or(profile.device)
                .unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            server_url: normalize_text_option(args.server_url.clone()).or(profile.server_url),
            token: normalize_text_option(args.token.clone()),
            config_path: args.config.clone().or(profile.config_path),
        }
    }

    pub fn tenant(&self) -> Result<TenantId, CliError> {
        let tenant = self.tenant.as_deref().ok_or(CliError::MissingTenant)?;
        Ok(TenantId::new(tenant)?)
    }

    pub fn device(&self) -> Result<DeviceId, CliError> {
        Ok(DeviceId::new(self.device.as_str())?)
    }

    /// Writes made from the CLI are attributed to the device
    pub fn actor(&self) -> Result<ActorId, CliError> {
        Ok(ActorId::new(self.device.as_str())?)
    }

    pub fn sync_config(&self) -> Result<SyncConfig, CliError> {
        match &self.config_path {
            Some(path) => Ok(SyncConfig::load(path)?),
            None => Ok(SyncConfig::default()),
        }
    }

    pub fn open_store(&self) -> Result<SyncStore, CliError> {
        open_store(&self.db_path, self.sync_config()?)
    }

    pub fn record_key(&self, entity_type: &str, entity_id: &str) -> Result<RecordKey, CliError> {
        Ok(RecordKey::new(self.tenant()?, entity_type, entity_id)?)
    }

    /// Sync client talking to the configured HTTP server
    pub fn client(&self) -> Result<DeltaSyncClient, CliError> {
        let server_url = self
            .server_url
            .clone()
            .ok_or(CliError::SyncNotConfigured)?;
        let store = self.open_store()?;
        let transport = HttpTransport::new(
            server_url,
            self.token.clone(),
            store.config().transport_timeout(),
        )?;
        Ok(DeltaSyncClient::new(
            Arc::new(store),
            Arc::new(transport),
            self.device()?,
        ))
    }
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("possync")
        .join("possync.db")
}

pub fn open_store(path: &Path, config: SyncConfig) -> Result<SyncStore, CliError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    SyncStore::open(path, config).map_err(|error| {
        if error.is_corruption() {
            CliError::Config(format!(
                "{error}. The store at {} looks corrupted; \
                 run `possync quarantine` to move it aside.",
                path.display()
            ))
        } else {
            CliError::Core(error)
        }
    })
}

/// Parse `name=value` assignments into a field delta.
///
/// Values are read as JSON when they parse, otherwise kept as plain strings.
pub fn parse_fields(assignments: &[String]) -> Result<FieldMap, CliError> {
    let mut fields = FieldMap::new();
    for assignment in assignments {
        let Some((name, raw)) = assignment.split_once('=') else {
            return Err(CliError::InvalidField(assignment.clone()));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(CliError::InvalidField(assignment.clone()));
        }
        let value =
            serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        fields.insert(name.to_string(), value);
    }
    Ok(fields)
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

fn format_value(value: Option<&Value>) -> String {
    value.map_or_else(|| "-".to_string(), Value::to_string)
}

pub fn format_record_lines(record: &Record) -> Vec<String> {
    let mut flags = Vec::new();
    if record.dirty {
        flags.push("dirty");
    }
    if record.deleted {
        flags.push("deleted");
    }
    if !record.conflict_resolved {
        flags.push("needs review");
    }

    let confirmed = if record.server_version == record.version {
        String::new()
    } else {
        format!(" (server {})", record.server_version)
    };
    let mut lines = vec![format!(
        "{} {}{} by {}{}",
        record.key,
        record.version,
        confirmed,
        record.updated_by,
        if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        }
    )];
    lines.extend(
        record
            .payload
            .iter()
            .map(|(field, value)| format!("  {field} = {value}")),
    );
    lines
}

pub fn format_operation_line(operation: &Operation, now_ms: i64) -> String {
    let fields = operation
        .payload_delta
        .keys()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",");
    let mut line = format!(
        "{}  {:<12} {:<17} {} base {} [{}] {}",
        operation.operation_id,
        operation.status.as_str(),
        operation.kind.as_str(),
        operation.key,
        operation.base_version,
        fields,
        format_relative_time(operation.created_at, now_ms),
    );
    if operation.retry_count > 0 {
        line.push_str(&format!(" retries={}", operation.retry_count));
    }
    if let Some(error) = &operation.last_error {
        line.push_str(&format!(" error={error}"));
    }
    line
}

pub fn format_review_line(review: &ManualReview) -> String {
    let state = review.resolved_at.map_or_else(
        || "open".to_string(),
        |at| format!("resolved {}", format_sync_timestamp(at)),
    );
    format!(
        "#{} {} {}: local {} ({}) vs remote {} ({}) [{}]",
        review.id,
        review.key,
        review.field,
        format_value(review.local_value.as_ref()),
        review.local_version,
        format_value(review.remote_value.as_ref()),
        review.remote_version,
        state,
    )
}
