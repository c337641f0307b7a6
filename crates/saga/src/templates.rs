//! Saga templates: the declarative recipes sagas are materialized from.
//!
//! Three templates are built in:
//! - **Vehicle entry**: verify plate → check subscription → allocate space →
//!   create entry record → notify → update favorites
//! - **Vehicle exit**: verify plate → calculate fee → update history →
//!   update occupancy → notify
//! - **Payment**: calculate fee → process payment → update history → notify
//!
//! Steps that need a `user_id` are skipped when the input carries none.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::Payload;
use resilience::{AlternativeConfig, CacheConfig, LoadBalancerConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::SagaError;
use crate::step::{SagaStep, StrategyConfig};

pub const STEP_VERIFY_LICENSE_PLATE: &str = "verify_license_plate";
pub const STEP_CHECK_USER_SUBSCRIPTION: &str = "check_user_subscription";
pub const STEP_ALLOCATE_PARKING_SPACE: &str = "allocate_parking_space";
pub const STEP_CREATE_ENTRY_RECORD: &str = "create_entry_record";
pub const STEP_SEND_ENTRY_NOTIFICATION: &str = "send_entry_notification";
pub const STEP_UPDATE_FAVORITE_PARKING: &str = "update_favorite_parking";
pub const STEP_CALCULATE_PARKING_FEE: &str = "calculate_parking_fee";
pub const STEP_UPDATE_PARKING_HISTORY: &str = "update_parking_history";
pub const STEP_UPDATE_OCCUPANCY_STATUS: &str = "update_occupancy_status";
pub const STEP_SEND_EXIT_NOTIFICATION: &str = "send_exit_notification";
pub const STEP_PROCESS_PAYMENT: &str = "process_payment";
pub const STEP_SEND_PAYMENT_NOTIFICATION: &str = "send_payment_notification";

pub const VEHICLE_SERVICE: &str = "vehicle_service";
pub const VEHICLE_SERVICE_BACKUP: &str = "vehicle_service_backup";
pub const USER_SERVICE: &str = "user_service";
pub const PARKING_SERVICE: &str = "parking_service";
pub const PARKING_RECORD_SERVICE: &str = "parking_record_service";
pub const NOTIFICATION_SERVICE: &str = "notification_service";
pub const NOTIFICATION_SERVICE_BACKUP: &str = "notification_service_backup";
pub const PAYMENT_SERVICE: &str = "payment_service";

const DEFAULT_PAYMENT_METHOD: &str = "credit_card";

/// The kinds of saga the orchestrator can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaTemplate {
    VehicleEntry,
    VehicleExit,
    Payment,
}

impl SagaTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaTemplate::VehicleEntry => "vehicle_entry",
            SagaTemplate::VehicleExit => "vehicle_exit",
            SagaTemplate::Payment => "payment",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SagaTemplate::VehicleEntry => "Vehicle entry",
            SagaTemplate::VehicleExit => "Vehicle exit",
            SagaTemplate::Payment => "Parking payment",
        }
    }

    /// Builds the steps for one saga of this kind.
    pub fn plan(&self, input: &SagaInput) -> Result<SagaPlan, SagaError> {
        input.validate()?;
        let plan = match self {
            SagaTemplate::VehicleEntry => vehicle_entry(input),
            SagaTemplate::VehicleExit => vehicle_exit(input),
            SagaTemplate::Payment => payment(input),
        };
        Ok(plan)
    }
}

impl std::fmt::Display for SagaTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The domain event a saga is started for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SagaInput {
    pub license_plate: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub entry_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_favorite: Option<bool>,
    #[serde(default)]
    pub payment_method: Option<String>,
}

impl SagaInput {
    pub fn new(license_plate: impl Into<String>) -> Self {
        Self {
            license_plate: license_plate.into(),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), SagaError> {
        if self.license_plate.trim().is_empty() {
            return Err(SagaError::InvalidInput("license_plate must not be empty".into()));
        }
        if self.user_id.as_deref().is_some_and(|u| u.trim().is_empty()) {
            return Err(SagaError::InvalidInput("user_id must not be blank".into()));
        }
        Ok(())
    }
}

/// Copies `response_field` of one step's response into `request_field` of
/// a later step's request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationRule {
    pub from_step: String,
    pub response_field: String,
    pub to_step: String,
    pub request_field: String,
}

impl PropagationRule {
    pub fn new(
        from_step: impl Into<String>,
        response_field: impl Into<String>,
        to_step: impl Into<String>,
        request_field: impl Into<String>,
    ) -> Self {
        Self {
            from_step: from_step.into(),
            response_field: response_field.into(),
            to_step: to_step.into(),
            request_field: request_field.into(),
        }
    }

    /// A rule that keeps the field name.
    pub fn same_field(from_step: &str, field: &str, to_step: &str) -> Self {
        Self::new(from_step, field, to_step, field)
    }
}

/// A materialized template: steps plus data propagation rules.
#[derive(Debug, Clone)]
pub struct SagaPlan {
    pub description: String,
    pub license_plate: String,
    pub steps: Vec<SagaStep>,
    pub propagation: Vec<PropagationRule>,
}

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

fn write_retry() -> RetryConfig {
    RetryConfig::new(3, Duration::from_millis(100)).with_backoff_factor(2.0)
}

/// Plate lookups: backup vehicle service, then a five-minute cache.
fn plate_lookup_strategies() -> StrategyConfig {
    StrategyConfig::none()
        .with_alternative(AlternativeConfig::new([VEHICLE_SERVICE_BACKUP]))
        .with_cache(CacheConfig::with_ttl(Duration::from_secs(300)))
}

fn guarded_write_strategies() -> StrategyConfig {
    StrategyConfig::none()
        .with_retry(write_retry())
        .with_circuit_breaker()
}

fn notification_strategies() -> StrategyConfig {
    StrategyConfig::none().with_load_balancer(LoadBalancerConfig::new([
        NOTIFICATION_SERVICE,
        NOTIFICATION_SERVICE_BACKUP,
    ]))
}

fn verify_step(plate: &str) -> SagaStep {
    SagaStep::new(
        STEP_VERIFY_LICENSE_PLATE,
        VEHICLE_SERVICE,
        "verify_license_plate",
        payload(json!({ "license_plate": plate })),
    )
    .with_strategies(plate_lookup_strategies())
}

fn vehicle_entry(input: &SagaInput) -> SagaPlan {
    let plate = input.license_plate.as_str();
    let user_id = &input.user_id;
    let entry_timestamp = input.entry_timestamp.unwrap_or_else(Utc::now).to_rfc3339();

    let steps = vec![
        verify_step(plate),
        SagaStep::new(
            STEP_CHECK_USER_SUBSCRIPTION,
            USER_SERVICE,
            "check_user_subscription",
            payload(json!({ "license_plate": plate, "user_id": user_id })),
        )
        .requires("user_id")
        .with_strategies(StrategyConfig::none().with_retry(RetryConfig::default())),
        SagaStep::new(
            STEP_ALLOCATE_PARKING_SPACE,
            PARKING_SERVICE,
            "allocate_parking_space",
            payload(json!({
                "license_plate": plate,
                "user_id": user_id,
                "entry_timestamp": entry_timestamp,
            })),
        )
        .compensated_by(None)
        .with_strategies(guarded_write_strategies()),
        SagaStep::new(
            STEP_CREATE_ENTRY_RECORD,
            PARKING_RECORD_SERVICE,
            "create_entry_record",
            payload(json!({
                "license_plate": plate,
                "user_id": user_id,
                "entry_timestamp": entry_timestamp,
            })),
        )
        .compensated_by(None)
        .with_strategies(guarded_write_strategies()),
        SagaStep::new(
            STEP_SEND_ENTRY_NOTIFICATION,
            NOTIFICATION_SERVICE,
            "send_entry_notification",
            payload(json!({
                "license_plate": plate,
                "user_id": user_id,
                "entry_timestamp": entry_timestamp,
            })),
        )
        .with_strategies(notification_strategies()),
        SagaStep::new(
            STEP_UPDATE_FAVORITE_PARKING,
            USER_SERVICE,
            "update_favorite_parking",
            payload(json!({
                "license_plate": plate,
                "user_id": user_id,
                "is_favorite": input.is_favorite.unwrap_or(false),
            })),
        )
        .requires("user_id")
        .compensated_by(None),
    ];

    SagaPlan {
        description: format!("Vehicle entry for {plate}"),
        license_plate: plate.to_string(),
        steps,
        propagation: vec![PropagationRule::same_field(
            STEP_ALLOCATE_PARKING_SPACE,
            "space_id",
            STEP_CREATE_ENTRY_RECORD,
        )],
    }
}

fn vehicle_exit(input: &SagaInput) -> SagaPlan {
    let plate = input.license_plate.as_str();
    let user_id = &input.user_id;
    let exit_timestamp = Utc::now().to_rfc3339();

    let steps = vec![
        verify_step(plate),
        SagaStep::new(
            STEP_CALCULATE_PARKING_FEE,
            PAYMENT_SERVICE,
            "calculate_parking_fee",
            payload(json!({
                "license_plate": plate,
                "user_id": user_id,
                "exit_timestamp": exit_timestamp,
            })),
        )
        .with_strategies(StrategyConfig::none().with_retry(RetryConfig::default())),
        SagaStep::new(
            STEP_UPDATE_PARKING_HISTORY,
            PARKING_RECORD_SERVICE,
            "update_parking_history",
            payload(json!({
                "license_plate": plate,
                "user_id": user_id,
                "exit_timestamp": exit_timestamp,
            })),
        )
        .requires("user_id")
        .compensated_by(None),
        SagaStep::new(
            STEP_UPDATE_OCCUPANCY_STATUS,
            PARKING_SERVICE,
            "update_occupancy_status",
            payload(json!({
                "license_plate": plate,
                "status": "vacant",
                "exit_timestamp": exit_timestamp,
            })),
        )
        .compensated_by(None)
        .with_strategies(guarded_write_strategies()),
        SagaStep::new(
            STEP_SEND_EXIT_NOTIFICATION,
            NOTIFICATION_SERVICE,
            "send_exit_notification",
            payload(json!({ "license_plate": plate, "user_id": user_id })),
        )
        .with_strategies(notification_strategies()),
    ];

    SagaPlan {
        description: format!("Vehicle exit for {plate}"),
        license_plate: plate.to_string(),
        steps,
        propagation: vec![
            PropagationRule::same_field(
                STEP_CALCULATE_PARKING_FEE,
                "fee_amount",
                STEP_SEND_EXIT_NOTIFICATION,
            ),
            PropagationRule::same_field(
                STEP_CALCULATE_PARKING_FEE,
                "duration_hours",
                STEP_SEND_EXIT_NOTIFICATION,
            ),
        ],
    }
}

fn payment(input: &SagaInput) -> SagaPlan {
    let plate = input.license_plate.as_str();
    let user_id = &input.user_id;
    let method = input
        .payment_method
        .as_deref()
        .unwrap_or(DEFAULT_PAYMENT_METHOD);

    let steps = vec![
        SagaStep::new(
            STEP_CALCULATE_PARKING_FEE,
            PAYMENT_SERVICE,
            "calculate_parking_fee",
            payload(json!({ "license_plate": plate, "user_id": user_id })),
        )
        .with_strategies(StrategyConfig::none().with_retry(RetryConfig::default())),
        SagaStep::new(
            STEP_PROCESS_PAYMENT,
            PAYMENT_SERVICE,
            "process_payment",
            payload(json!({
                "license_plate": plate,
                "user_id": user_id,
                "payment_method": method,
            })),
        )
        .compensated_by(Some("refund_payment"))
        .with_strategies(guarded_write_strategies()),
        SagaStep::new(
            STEP_UPDATE_PARKING_HISTORY,
            PARKING_RECORD_SERVICE,
            "update_parking_history",
            payload(json!({ "license_plate": plate, "user_id": user_id, "paid": true })),
        )
        .compensated_by(None),
        SagaStep::new(
            STEP_SEND_PAYMENT_NOTIFICATION,
            NOTIFICATION_SERVICE,
            "send_payment_notification",
            payload(json!({ "license_plate": plate, "user_id": user_id })),
        )
        .with_strategies(notification_strategies()),
    ];

    let propagation = [
        STEP_PROCESS_PAYMENT,
        STEP_UPDATE_PARKING_HISTORY,
        STEP_SEND_PAYMENT_NOTIFICATION,
    ]
    .into_iter()
    .map(|to| PropagationRule::same_field(STEP_CALCULATE_PARKING_FEE, "fee_amount", to))
    .collect();

    SagaPlan {
        description: format!("Parking payment for {plate}"),
        license_plate: plate.to_string(),
        steps,
        propagation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_ids(plan: &SagaPlan) -> Vec<&str> {
        plan.steps.iter().map(|s| s.step_id.as_str()).collect()
    }

    #[test]
    fn test_entry_template_order() {
        let plan = SagaTemplate::VehicleEntry
            .plan(&SagaInput::new("34ABC123").with_user("u-1"))
            .unwrap();
        assert_eq!(
            step_ids(&plan),
            vec![
                STEP_VERIFY_LICENSE_PLATE,
                STEP_CHECK_USER_SUBSCRIPTION,
                STEP_ALLOCATE_PARKING_SPACE,
                STEP_CREATE_ENTRY_RECORD,
                STEP_SEND_ENTRY_NOTIFICATION,
                STEP_UPDATE_FAVORITE_PARKING,
            ]
        );
        assert_eq!(plan.description, "Vehicle entry for 34ABC123");
    }

    #[test]
    fn test_reads_are_not_compensable() {
        let plan = SagaTemplate::VehicleEntry
            .plan(&SagaInput::new("34ABC123"))
            .unwrap();
        let compensable: Vec<&str> = plan
            .steps
            .iter()
            .filter(|s| s.compensation_required)
            .map(|s| s.step_id.as_str())
            .collect();
        assert_eq!(
            compensable,
            vec![
                STEP_ALLOCATE_PARKING_SPACE,
                STEP_CREATE_ENTRY_RECORD,
                STEP_UPDATE_FAVORITE_PARKING
            ]
        );
    }

    #[test]
    fn test_user_steps_skip_without_user() {
        let plan = SagaTemplate::VehicleEntry
            .plan(&SagaInput::new("34ABC123"))
            .unwrap();
        let skipping: Vec<&str> = plan
            .steps
            .iter()
            .filter(|s| s.missing_input().is_some())
            .map(|s| s.step_id.as_str())
            .collect();
        assert_eq!(skipping, vec![STEP_CHECK_USER_SUBSCRIPTION, STEP_UPDATE_FAVORITE_PARKING]);
    }

    #[test]
    fn test_exit_propagates_fee_to_notification() {
        let plan = SagaTemplate::VehicleExit
            .plan(&SagaInput::new("34ABC123"))
            .unwrap();
        assert_eq!(plan.steps.len(), 5);
        assert!(plan.propagation.contains(&PropagationRule::same_field(
            STEP_CALCULATE_PARKING_FEE,
            "fee_amount",
            STEP_SEND_EXIT_NOTIFICATION
        )));
        assert!(plan.propagation.contains(&PropagationRule::same_field(
            STEP_CALCULATE_PARKING_FEE,
            "duration_hours",
            STEP_SEND_EXIT_NOTIFICATION
        )));
    }

    #[test]
    fn test_payment_declares_refund() {
        let plan = SagaTemplate::Payment
            .plan(&SagaInput::new("34ABC123"))
            .unwrap();
        let process = plan
            .steps
            .iter()
            .find(|s| s.step_id == STEP_PROCESS_PAYMENT)
            .unwrap();
        assert_eq!(process.compensation_operation.as_deref(), Some("refund_payment"));
        assert_eq!(process.request_data["payment_method"], DEFAULT_PAYMENT_METHOD);
        assert_eq!(plan.propagation.len(), 3);
    }

    #[test]
    fn test_empty_plate_is_rejected() {
        let err = SagaTemplate::VehicleEntry
            .plan(&SagaInput::new("   "))
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidInput(_)));
    }

    #[test]
    fn test_template_serde_names() {
        assert_eq!(
            serde_json::to_string(&SagaTemplate::VehicleEntry).unwrap(),
            "\"vehicle_entry\""
        );
        let input: SagaInput =
            serde_json::from_str(r#"{ "license_plate": "34ABC123", "is_favorite": true }"#).unwrap();
        assert_eq!(input.user_id, None);
        assert_eq!(input.is_favorite, Some(true));
    }
}
