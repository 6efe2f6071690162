use serde::Deserialize;
use validator::Validate;

use crate::{error::AppError, services::sync_engine::SyncOptions};

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

pub fn clamp_limit_in_range(limit: i64, minimum: i64, maximum: i64) -> i64 {
    limit.clamp(minimum, maximum)
}

fn default_limit_50() -> i64 {
    50
}

fn default_window_day() -> String {
    "day".to_string()
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct LeasePath {
    pub lease_id: String,
}

#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
pub struct SyncLeaseInput {
    #[serde(default)]
    pub skip_validation: bool,
    #[serde(default)]
    pub force_sync: bool,
}

impl From<SyncLeaseInput> for SyncOptions {
    fn from(input: SyncLeaseInput) -> Self {
        Self {
            skip_validation: input.skip_validation,
            force_sync: input.force_sync,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, serde::Serialize, Validate)]
pub struct StartMonitoringInput {
    #[validate(range(min = 1, max = 86400))]
    pub interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct SyncLogsQuery {
    #[validate(length(min = 1, max = 255))]
    pub payment_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct RecentErrorsQuery {
    #[serde(default = "default_limit_50")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct SyncStatsQuery {
    #[serde(default = "default_window_day")]
    pub window: String,
}

#[cfg(test)]
mod tests {
    use super::{validate_input, StartMonitoringInput, SyncLogsQuery};
    use crate::error::AppError;

    #[test]
    fn rejects_out_of_range_interval() {
        let input = StartMonitoringInput {
            interval_seconds: Some(0),
        };
        assert!(matches!(
            validate_input(&input),
            Err(AppError::UnprocessableEntity(_))
        ));
        assert!(validate_input(&StartMonitoringInput::default()).is_ok());
    }

    #[test]
    fn requires_payment_id() {
        let query = SyncLogsQuery {
            payment_id: String::new(),
        };
        assert!(validate_input(&query).is_err());
    }
}
