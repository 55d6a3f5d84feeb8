//! Domain model and pure decision logic for personnel record mutations.
//!
//! Everything in this crate is free of I/O. The store seam is expressed by the
//! [`TransactionalSession`], [`SessionFactory`] and [`PersonLookup`] traits;
//! orchestration over those traits lives in `personnel-mutation-engine`.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MutationError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("person not found: {0}")]
    PersonNotFound(String),
    #[error("business rule rejection: {0}")]
    BusinessRuleRejection(String),
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
    #[error("transient store error: {0}")]
    TransientStore(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Caller-facing outcome class of a failed mutation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Rejected,
    NotFound,
    Retryable,
    Internal,
}

impl MutationError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) | Self::BusinessRuleRejection(_) => ErrorClass::Rejected,
            Self::PersonNotFound(_) => ErrorClass::NotFound,
            Self::TransientStore(_) => ErrorClass::Retryable,
            Self::IntegrityViolation(_) | Self::Store(_) | Self::Configuration(_) => {
                ErrorClass::Internal
            }
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::PersonNotFound(_) => "person_not_found",
            Self::BusinessRuleRejection(_) => "business_rule_rejection",
            Self::IntegrityViolation(_) => "integrity_violation",
            Self::TransientStore(_) => "transient_store_error",
            Self::Store(_) => "store_error",
            Self::Configuration(_) => "configuration_error",
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Message safe to show to the caller. Server-class failures never carry
    /// store internals.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(message)
            | Self::BusinessRuleRejection(message)
            | Self::PersonNotFound(message) => message.clone(),
            Self::TransientStore(_) => {
                "the data store is temporarily unavailable; retry the request".to_string()
            }
            Self::IntegrityViolation(_) | Self::Store(_) | Self::Configuration(_) => {
                "internal error while applying the mutation".to_string()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EmploymentType {
    Student,
    Graduate,
}

impl EmploymentType {
    pub const ALL: [Self; 2] = [Self::Student, Self::Graduate];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Graduate => "graduate",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "student" => Some(Self::Student),
            "graduate" => Some(Self::Graduate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MutationIntent {
    Create,
    Update,
}

impl MutationIntent {
    pub const ALL: [Self; 2] = [Self::Create, Self::Update];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReasonCategory {
    Termination,
    LaborOnly,
    EmploymentTypeChange,
    Standard,
}

impl ChangeReasonCategory {
    pub const ALL: [Self; 4] = [
        Self::Termination,
        Self::LaborOnly,
        Self::EmploymentTypeChange,
        Self::Standard,
    ];
}

/// Named, scenario-specific write operations exposed by the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperation {
    Terminate,
    UpdateLaborDistribution,
    StandardUpdate,
    StudentUpdate,
    GraduateUpdate,
    StudentCreate,
    GraduateCreate,
}

impl WriteOperation {
    pub const ALL: [Self; 7] = [
        Self::Terminate,
        Self::UpdateLaborDistribution,
        Self::StandardUpdate,
        Self::StudentUpdate,
        Self::GraduateUpdate,
        Self::StudentCreate,
        Self::GraduateCreate,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminate => "terminate_job",
            Self::UpdateLaborDistribution => "update_labor_change_job",
            Self::StandardUpdate => "update_job",
            Self::StudentUpdate => "student_update_job",
            Self::GraduateUpdate => "graduate_update_job",
            Self::StudentCreate => "student_create_job",
            Self::GraduateCreate => "graduate_create_job",
        }
    }

    /// Parameter names (beyond [`ALWAYS_RETAINED_FIELDS`]) this write accepts.
    #[must_use]
    pub fn allowed_fields(self) -> &'static [&'static str] {
        match self {
            Self::Terminate => &TERMINATE_FIELDS,
            Self::UpdateLaborDistribution => &LABOR_CHANGE_FIELDS,
            Self::StandardUpdate => &STANDARD_UPDATE_FIELDS,
            Self::StudentUpdate | Self::StudentCreate => &STUDENT_FIELDS,
            Self::GraduateUpdate | Self::GraduateCreate => &GRADUATE_FIELDS,
        }
    }

    /// Employment type a write stamps onto the job, if it is type specific.
    #[must_use]
    pub fn employment_type(self) -> Option<EmploymentType> {
        match self {
            Self::StudentUpdate | Self::StudentCreate => Some(EmploymentType::Student),
            Self::GraduateUpdate | Self::GraduateCreate => Some(EmploymentType::Graduate),
            Self::Terminate | Self::UpdateLaborDistribution | Self::StandardUpdate => None,
        }
    }

    #[must_use]
    pub fn is_create(self) -> bool {
        matches!(self, Self::StudentCreate | Self::GraduateCreate)
    }
}

impl Display for WriteOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const ALWAYS_RETAINED_FIELDS: [&str; 4] = [
    "positionNumber",
    "suffix",
    "effectiveDate",
    "changeReason_code",
];

pub const TERMINATE_FIELDS: [&str; 1] = ["changeReason_code"];

pub const LABOR_CHANGE_FIELDS: [&str; 1] = ["laborDistribution"];

pub const STANDARD_UPDATE_FIELDS: [&str; 7] = [
    "hourlyRate",
    "appointmentPercent",
    "personnelChangeDate",
    "hoursPerPay",
    "fullTimeEquivalency",
    "changeReason_code",
    "salary_annual",
];

pub const STUDENT_FIELDS: [&str; 33] = [
    "changeReason_code",
    "employeeClassification_code",
    "status_code",
    "hourlyRate",
    "timesheet_current_code",
    "appointmentPercent",
    "jobDescription",
    "campus_code",
    "personnelChangeDate",
    "hoursPerPay",
    "salary_paysPerYear",
    "salary_annual",
    "strsAssignment_code",
    "fullTimeEquivalency",
    "earningCode_effectiveDate",
    "earningCode_code",
    "earningCode_hours",
    "supervisor_positionNumber",
    "supervisor_suffix",
    "supervisor_personId",
    "beginDate",
    "accruesLeaveInd",
    "contractBeginDate",
    "contractEndDate",
    "useTemporarySsnInd",
    "employeeInformationReleaseInd",
    "retirement_code",
    "i9Form_code",
    "i9Form_date",
    "i9Form_expirationDate",
    "laborDistribution",
    "homeOrganization_current_code",
    "employeeGroup_code",
];

pub const GRADUATE_FIELDS: [&str; 34] = [
    "changeReason_code",
    "employeeClassification_code",
    "personnelChangeDate",
    "status_code",
    "hourlyRate",
    "timesheet_current_code",
    "appointmentPercent",
    "jobDescription",
    "campus_code",
    "hoursPerPay",
    "salary_paysPerYear",
    "salary_annual",
    "strsAssignment_code",
    "fullTimeEquivalency",
    "earningCode_effectiveDate",
    "earningCode_code",
    "earningCode_hours",
    "supervisor_positionNumber",
    "supervisor_suffix",
    "supervisor_personId",
    "beginDate",
    "accruesLeaveInd",
    "contractBeginDate",
    "contractEndDate",
    "useTemporarySsnInd",
    "employeeInformationReleaseInd",
    "salaryInformationReleaseInd",
    "salaryInformationReleaseDate",
    "i9Form_code",
    "i9Form_date",
    "i9Form_expirationDate",
    "laborDistribution",
    "homeOrganization_current_code",
    "employeeGroup_code",
];

/// `(parameter, line attribute)` pairs for the parallel labor encoding.
pub const LABOR_PARAMETERS: [(&str, &str); 9] = [
    ("laborEffectiveDates", "effectiveDate"),
    ("laborAccountIndexCodes", "accountIndex"),
    ("laborFundCodes", "fund"),
    ("laborOrganizationCodes", "organization"),
    ("laborAccountCodes", "account"),
    ("laborProgramCodes", "program"),
    ("laborActivityCodes", "activity"),
    ("laborLocationCodes", "location"),
    ("laborDistributionPercentages", "distributionPercent"),
];

pub const LABOR_COUNT_PARAMETER: &str = "laborCount";
pub const LABOR_SEPARATOR: char = '|';

const BOOLEAN_INDICATORS: [&str; 4] = [
    "accruesLeaveInd",
    "useTemporarySsnInd",
    "employeeInformationReleaseInd",
    "salaryInformationReleaseInd",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Active,
    Terminated,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Terminated => "terminated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }
}

/// Dependent per-person record families governed by type exclusivity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Address,
    Phone,
}

impl RecordKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Address => "address",
            Self::Phone => "phone",
        }
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub person_id: String,
    pub internal_id: i64,
}

/// Composite job key, rendered as `positionNumber-suffix`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub struct JobKey {
    pub position_number: String,
    pub suffix: String,
}

impl JobKey {
    /// Parses a `positionNumber-suffix` job identifier.
    ///
    /// # Errors
    /// Returns [`MutationError::Validation`] when the identifier does not have
    /// exactly two non-empty parts.
    pub fn parse(raw: &str) -> Result<Self, MutationError> {
        let mut parts = raw.split('-');
        let (Some(position_number), Some(suffix), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(MutationError::Validation(format!(
                "job ID {raw} must be in <positionNumber>-<suffix> format"
            )));
        };

        if position_number.trim().is_empty() || suffix.trim().is_empty() {
            return Err(MutationError::Validation(format!(
                "job ID {raw} must be in <positionNumber>-<suffix> format"
            )));
        }

        Ok(Self {
            position_number: position_number.to_string(),
            suffix: suffix.to_string(),
        })
    }
}

impl Display for JobKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.position_number, self.suffix)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct CodeRef {
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct CurrentCode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<CodeRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Salary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annual: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pays_per_year: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EarningCode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct I9Form {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LaborDistributionLine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fund: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_percent: Option<f64>,
}

impl LaborDistributionLine {
    /// Encoded value of one labor attribute; absent values encode as empty.
    #[must_use]
    pub fn attribute(&self, attribute: &str) -> String {
        let text = |value: &Option<String>| value.clone().unwrap_or_default();
        match attribute {
            "effectiveDate" => text(&self.effective_date),
            "accountIndex" => text(&self.account_index),
            "fund" => text(&self.fund),
            "organization" => text(&self.organization),
            "account" => text(&self.account),
            "program" => text(&self.program),
            "activity" => text(&self.activity),
            "location" => text(&self.location),
            "distributionPercent" => self
                .distribution_percent
                .map(|value| value.to_string())
                .unwrap_or_default(),
            _ => String::new(),
        }
    }
}

/// Nested job mutation payload as supplied by the route layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub position_number: String,
    pub suffix: String,
    pub employment_type: EmploymentType,
    pub change_reason: CodeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_classification: Option<CodeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CodeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timesheet: Option<CurrentCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appointment_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campus: Option<CodeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personnel_change_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours_per_pay: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salary: Option<Salary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strs_assignment: Option<CodeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_time_equivalency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub earning_code: Option<EarningCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor: Option<SupervisorRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accrues_leave_ind: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_begin_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_end_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_temporary_ssn_ind: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_information_release_ind: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salary_information_release_ind: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salary_information_release_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retirement: Option<CodeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i9_form: Option<I9Form>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labor_distribution: Option<Vec<LaborDistributionLine>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_organization: Option<CurrentCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_group: Option<CodeRef>,
}

impl JobPayload {
    #[must_use]
    pub fn key(&self) -> JobKey {
        JobKey {
            position_number: self.position_number.clone(),
            suffix: self.suffix.clone(),
        }
    }

    #[must_use]
    pub fn change_reason_code(&self) -> &str {
        &self.change_reason.code
    }

    /// Validates payload shape before any store round trip.
    ///
    /// # Errors
    /// Returns [`MutationError::Validation`] for blank key fields, malformed
    /// dates, or labor values that would corrupt the delimited encoding.
    pub fn validate(&self) -> Result<(), MutationError> {
        if self.position_number.trim().is_empty() {
            return Err(MutationError::Validation(
                "positionNumber MUST be provided".to_string(),
            ));
        }
        if self.suffix.trim().is_empty() {
            return Err(MutationError::Validation(
                "suffix MUST be provided".to_string(),
            ));
        }
        if self.position_number.contains('-') || self.suffix.contains('-') {
            return Err(MutationError::Validation(
                "positionNumber and suffix cannot contain '-'".to_string(),
            ));
        }
        if self.change_reason.code.trim().is_empty() {
            return Err(MutationError::Validation(
                "changeReason.code MUST be provided".to_string(),
            ));
        }

        for (name, value) in [
            ("effectiveDate", self.effective_date.as_deref()),
            ("personnelChangeDate", self.personnel_change_date.as_deref()),
            ("beginDate", self.begin_date.as_deref()),
            ("contractBeginDate", self.contract_begin_date.as_deref()),
            ("contractEndDate", self.contract_end_date.as_deref()),
            (
                "salaryInformationReleaseDate",
                self.salary_information_release_date.as_deref(),
            ),
            (
                "earningCode.effectiveDate",
                self.earning_code
                    .as_ref()
                    .and_then(|item| item.effective_date.as_deref()),
            ),
            (
                "i9Form.date",
                self.i9_form.as_ref().and_then(|item| item.date.as_deref()),
            ),
            (
                "i9Form.expirationDate",
                self.i9_form
                    .as_ref()
                    .and_then(|item| item.expiration_date.as_deref()),
            ),
        ] {
            if let Some(raw) = value {
                parse_iso_date(raw)
                    .map_err(|err| MutationError::Validation(format!("{name}: {err}")))?;
            }
        }

        if let Some(lines) = &self.labor_distribution {
            for (index, line) in lines.iter().enumerate() {
                for (_, attribute) in LABOR_PARAMETERS {
                    if line.attribute(attribute).contains(LABOR_SEPARATOR) {
                        return Err(MutationError::Validation(format!(
                            "laborDistribution[{index}].{attribute} cannot contain '{LABOR_SEPARATOR}'"
                        )));
                    }
                }
                if let Some(raw) = line.effective_date.as_deref() {
                    parse_iso_date(raw).map_err(|err| {
                        MutationError::Validation(format!(
                            "laborDistribution[{index}].effectiveDate: {err}"
                        ))
                    })?;
                }
                if let Some(percent) = line.distribution_percent {
                    if !(0.0..=100.0).contains(&percent) {
                        return Err(MutationError::Validation(format!(
                            "laborDistribution[{index}].distributionPercent MUST be in [0, 100]"
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobCreateRequest {
    pub job: JobPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdateRequest {
    pub job_id: JobKey,
    pub job: JobPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum JobMutation {
    Create(JobCreateRequest),
    Update(JobUpdateRequest),
}

impl JobMutation {
    #[must_use]
    pub fn intent(&self) -> MutationIntent {
        match self {
            Self::Create(_) => MutationIntent::Create,
            Self::Update(_) => MutationIntent::Update,
        }
    }

    #[must_use]
    pub fn payload(&self) -> &JobPayload {
        match self {
            Self::Create(request) => &request.job,
            Self::Update(request) => &request.job,
        }
    }

    /// Validates the payload and, for updates, that the key is preserved.
    ///
    /// # Errors
    /// Returns [`MutationError::Validation`] on invalid payloads or when an
    /// update targets a different job than its payload describes.
    pub fn validate(&self) -> Result<(), MutationError> {
        self.payload().validate()?;
        if let Self::Update(request) = self {
            let payload_key = request.job.key();
            if payload_key != request.job_id {
                return Err(MutationError::Validation(format!(
                    "job ID {} does not match payload key {payload_key}",
                    request.job_id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddressCreateRequest {
    pub address_type: String,
    pub street_line1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street_line2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street_line3: Option<String>,
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nation_code: Option<String>,
}

impl AddressCreateRequest {
    /// # Errors
    /// Returns [`MutationError::Validation`] when the type code or required
    /// address lines are missing or malformed.
    pub fn validate(&self) -> Result<(), MutationError> {
        validate_type_code("addressType", &self.address_type)?;
        if self.street_line1.trim().is_empty() {
            return Err(MutationError::Validation(
                "streetLine1 MUST be provided".to_string(),
            ));
        }
        if self.city.trim().is_empty() {
            return Err(MutationError::Validation(
                "city MUST be provided".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PhoneCreateRequest {
    pub phone_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_code: Option<String>,
    pub phone_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_extension: Option<String>,
    #[serde(default)]
    pub primary_ind: bool,
}

impl PhoneCreateRequest {
    /// # Errors
    /// Returns [`MutationError::Validation`] when the type code is malformed or
    /// number parts contain non-digits.
    pub fn validate(&self) -> Result<(), MutationError> {
        validate_type_code("phoneType", &self.phone_type)?;
        if self.phone_number.is_empty() || !is_digits(&self.phone_number) {
            return Err(MutationError::Validation(
                "phoneNumber MUST be a non-empty string of digits".to_string(),
            ));
        }
        for (name, value) in [
            ("areaCode", self.area_code.as_deref()),
            ("phoneExtension", self.phone_extension.as_deref()),
        ] {
            if let Some(raw) = value {
                if raw.is_empty() || !is_digits(raw) {
                    return Err(MutationError::Validation(format!(
                        "{name} MUST contain digits only"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub internal_id: i64,
    pub position_number: String,
    pub suffix: String,
    pub employment_type: EmploymentType,
    pub status: JobStatus,
    pub change_reason_code: String,
    pub effective_date: Option<String>,
    pub fields: BTreeMap<String, Value>,
    pub labor_distribution: Vec<LaborDistributionLine>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
    pub internal_id: i64,
    pub address_type: String,
    pub sequence_number: i64,
    pub active: bool,
    pub street_line1: String,
    pub street_line2: Option<String>,
    pub street_line3: Option<String>,
    pub city: String,
    pub state_code: Option<String>,
    pub postal_code: Option<String>,
    pub nation_code: Option<String>,
    pub activity_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PhoneRecord {
    pub internal_id: i64,
    pub phone_type: String,
    pub sequence_number: i64,
    pub active: bool,
    pub area_code: Option<String>,
    pub phone_number: String,
    pub phone_extension: Option<String>,
    pub primary_ind: bool,
    pub address_sequence_number: i64,
    pub activity_date: String,
}

/// Identity of a currently active dependent record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRecord {
    pub kind: RecordKind,
    pub internal_id: i64,
    pub type_code: String,
    pub sequence_number: i64,
    /// Address sequence a phone points at; always `None` for addresses.
    pub linked_sequence_number: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Real(f64),
    Text(String),
}

impl ParamValue {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(Self::Text(text.clone())),
            Value::Bool(flag) => Some(Self::Text(flag.to_string())),
            Value::Number(number) => number
                .as_i64()
                .map(Self::Integer)
                .or_else(|| number.as_f64().map(Self::Real)),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Integer(value) => Value::from(*value),
            Self::Real(value) => Value::from(*value),
            Self::Text(value) => Value::from(value.clone()),
        }
    }
}

/// Flat, scalar-only parameter set accepted by a write operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ParameterSet {
    values: BTreeMap<String, ParamValue>,
}

impl ParameterSet {
    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        self.values.insert(name.into(), value);
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    #[must_use]
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(ParamValue::Text(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(ParamValue::Integer(value)) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn real(&self, name: &str) -> Option<f64> {
        match self.values.get(name) {
            Some(ParamValue::Real(value)) => Some(*value),
            Some(ParamValue::Integer(value)) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// Business policy for position numbers and change-reason categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationPolicy {
    pub policy_version: u32,
    pub student_position_prefixes: Vec<String>,
    pub termination_position_prefixes: Vec<String>,
    pub check_prefix_on_termination: bool,
    pub termination_codes: Vec<String>,
    pub labor_only_codes: Vec<String>,
    pub employment_type_change_codes: Vec<String>,
}

impl MutationPolicy {
    #[must_use]
    pub fn v1() -> Self {
        let owned = |items: &[&str]| items.iter().map(|item| (*item).to_string()).collect();
        Self {
            policy_version: 1,
            student_position_prefixes: owned(&["C50", "C51", "C52"]),
            termination_position_prefixes: owned(&["C50", "C51", "C52", "C53"]),
            check_prefix_on_termination: true,
            termination_codes: owned(&["TERME", "TERMJ"]),
            labor_only_codes: owned(&["NONE", "LCHNG"]),
            employment_type_change_codes: owned(&["BREAP"]),
        }
    }

    /// Validates prefix lists and that code categories do not overlap.
    ///
    /// # Errors
    /// Returns [`MutationError::Configuration`] when a list is empty, contains
    /// blank entries, or a code appears in more than one category.
    pub fn validate(&self) -> Result<(), MutationError> {
        if self.policy_version == 0 {
            return Err(MutationError::Configuration(
                "policy_version MUST be >= 1".to_string(),
            ));
        }

        for (name, values) in [
            ("student_position_prefixes", &self.student_position_prefixes),
            (
                "termination_position_prefixes",
                &self.termination_position_prefixes,
            ),
            ("termination_codes", &self.termination_codes),
            ("labor_only_codes", &self.labor_only_codes),
            (
                "employment_type_change_codes",
                &self.employment_type_change_codes,
            ),
        ] {
            if values.is_empty() {
                return Err(MutationError::Configuration(format!(
                    "{name} MUST contain at least one entry"
                )));
            }
            if values.iter().any(|value| value.trim().is_empty()) {
                return Err(MutationError::Configuration(format!(
                    "{name} cannot contain blank entries"
                )));
            }
        }

        let mut seen = BTreeMap::new();
        for (category, codes) in [
            ("termination_codes", &self.termination_codes),
            ("labor_only_codes", &self.labor_only_codes),
            (
                "employment_type_change_codes",
                &self.employment_type_change_codes,
            ),
        ] {
            for code in codes {
                if let Some(previous) = seen.insert(code.as_str(), category) {
                    if previous != category {
                        return Err(MutationError::Configuration(format!(
                            "change reason code {code} appears in both {previous} and {category}"
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Decodes and validates a policy from JSON.
    ///
    /// # Errors
    /// Returns [`MutationError::Configuration`] when decoding fails or the
    /// decoded policy is invalid.
    pub fn from_json(value: &Value) -> Result<Self, MutationError> {
        let policy: Self = serde_json::from_value(value.clone()).map_err(|err| {
            MutationError::Configuration(format!("invalid policy JSON payload: {err}"))
        })?;
        policy.validate()?;
        Ok(policy)
    }

    #[must_use]
    pub fn category(&self, code: &str) -> ChangeReasonCategory {
        let contains = |codes: &[String]| codes.iter().any(|item| item == code);
        if contains(&self.termination_codes) {
            ChangeReasonCategory::Termination
        } else if contains(&self.labor_only_codes) {
            ChangeReasonCategory::LaborOnly
        } else if contains(&self.employment_type_change_codes) {
            ChangeReasonCategory::EmploymentTypeChange
        } else {
            ChangeReasonCategory::Standard
        }
    }

    /// Checks a position number against the prefix policy for its scenario.
    ///
    /// # Errors
    /// Returns [`MutationError::Validation`] when a student position number
    /// does not start with an accepted prefix.
    pub fn check_position_number(
        &self,
        employment_type: EmploymentType,
        category: ChangeReasonCategory,
        position_number: &str,
    ) -> Result<(), MutationError> {
        if employment_type != EmploymentType::Student {
            return Ok(());
        }

        let (prefixes, scenario) = if category == ChangeReasonCategory::Termination {
            if !self.check_prefix_on_termination {
                return Ok(());
            }
            (&self.termination_position_prefixes, "student terminations")
        } else {
            (&self.student_position_prefixes, "students")
        };

        if prefixes
            .iter()
            .any(|prefix| position_number.starts_with(prefix.as_str()))
        {
            return Ok(());
        }

        Err(MutationError::Validation(format!(
            "Position number for {scenario} must start with {}",
            describe_alternatives(prefixes)
        )))
    }
}

/// Maps a request scenario onto its write operation.
#[must_use]
pub fn route(
    intent: MutationIntent,
    employment_type: EmploymentType,
    category: ChangeReasonCategory,
) -> WriteOperation {
    use ChangeReasonCategory as C;
    use EmploymentType as E;
    use MutationIntent as I;

    match (category, intent, employment_type) {
        (C::Termination, _, _) => WriteOperation::Terminate,
        (C::LaborOnly, I::Update, _) => WriteOperation::UpdateLaborDistribution,
        (C::EmploymentTypeChange, I::Update, E::Student) => WriteOperation::StudentUpdate,
        (C::EmploymentTypeChange, I::Update, E::Graduate) => WriteOperation::GraduateUpdate,
        (C::Standard, I::Update, _) => WriteOperation::StandardUpdate,
        (C::LaborOnly | C::EmploymentTypeChange | C::Standard, I::Create, E::Student) => {
            WriteOperation::StudentCreate
        }
        (C::LaborOnly | C::EmploymentTypeChange | C::Standard, I::Create, E::Graduate) => {
            WriteOperation::GraduateCreate
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct DecisionRow {
    pub intent: MutationIntent,
    pub employment_type: EmploymentType,
    pub category: ChangeReasonCategory,
    pub operation: WriteOperation,
}

/// Every `(intent, employment type, category)` combination and its route.
#[must_use]
pub fn decision_table() -> Vec<DecisionRow> {
    let mut rows = Vec::new();
    for intent in MutationIntent::ALL {
        for employment_type in EmploymentType::ALL {
            for category in ChangeReasonCategory::ALL {
                rows.push(DecisionRow {
                    intent,
                    employment_type,
                    category,
                    operation: route(intent, employment_type, category),
                });
            }
        }
    }
    rows
}

/// Selects the single write operation for a job mutation.
///
/// Position policy is checked first, termination codes bypass the reference
/// lookup, and every other code must satisfy `is_valid_code`.
///
/// # Errors
/// Returns [`MutationError::Validation`] for an illegal position number or an
/// unknown change-reason code; lookup failures from `is_valid_code` propagate
/// unchanged.
pub fn dispatch_job_change<F>(
    intent: MutationIntent,
    payload: &JobPayload,
    policy: &MutationPolicy,
    mut is_valid_code: F,
) -> Result<WriteOperation, MutationError>
where
    F: FnMut(&str) -> Result<bool, MutationError>,
{
    let code = payload.change_reason_code();
    let category = policy.category(code);

    policy.check_position_number(payload.employment_type, category, &payload.position_number)?;

    if category == ChangeReasonCategory::Termination {
        return Ok(WriteOperation::Terminate);
    }

    if !is_valid_code(code)? {
        return Err(MutationError::Validation(format!(
            "Invalid change reason code {code}"
        )));
    }

    Ok(route(intent, payload.employment_type, category))
}

/// Flattens a job payload into the parameter set a write accepts.
///
/// # Errors
/// Returns [`MutationError::Validation`] when the payload cannot be encoded.
pub fn transform(
    person: &Person,
    payload: &JobPayload,
    allowed_fields: &[&str],
) -> Result<ParameterSet, MutationError> {
    let mut params = ParameterSet::default();
    params.insert("personId", ParamValue::Text(person.person_id.clone()));
    params.insert("internalId", ParamValue::Integer(person.internal_id));

    if allowed_fields.contains(&"laborDistribution") {
        if let Some(lines) = &payload.labor_distribution {
            encode_labor_distribution(lines, &mut params)?;
        }
    }

    let value = serde_json::to_value(payload)
        .map_err(|err| MutationError::Validation(format!("failed to encode payload: {err}")))?;
    let mut flat = BTreeMap::new();
    flatten_value(None, &value, &mut flat);

    for name in BOOLEAN_INDICATORS {
        if !allowed_fields.contains(&name) {
            continue;
        }
        if let Some(Value::Bool(flag)) = flat.get(name).cloned() {
            let encoded = if name == "accruesLeaveInd" {
                if flag { "Y" } else { "N" }.to_string()
            } else {
                flag.to_string()
            };
            flat.insert(name.to_string(), Value::String(encoded));
        }
    }

    for (name, value) in flat {
        let retained = ALWAYS_RETAINED_FIELDS.contains(&name.as_str())
            || allowed_fields.contains(&name.as_str());
        if !retained {
            continue;
        }
        if let Some(param) = ParamValue::from_json(&value) {
            params.insert(name, param);
        }
    }

    Ok(params)
}

/// Parameters for `operation`, using its own allow-list.
///
/// # Errors
/// Propagates [`transform`] failures.
pub fn build_write_parameters(
    person: &Person,
    operation: WriteOperation,
    payload: &JobPayload,
) -> Result<ParameterSet, MutationError> {
    transform(person, payload, operation.allowed_fields())
}

fn encode_labor_distribution(
    lines: &[LaborDistributionLine],
    params: &mut ParameterSet,
) -> Result<(), MutationError> {
    let count = i64::try_from(lines.len()).map_err(|_| {
        MutationError::Validation("laborDistribution has too many entries".to_string())
    })?;
    params.insert(LABOR_COUNT_PARAMETER, ParamValue::Integer(count));

    let separator = LABOR_SEPARATOR.to_string();
    for (param, attribute) in LABOR_PARAMETERS {
        let joined = lines
            .iter()
            .map(|line| line.attribute(attribute))
            .collect::<Vec<_>>()
            .join(&separator);
        params.insert(param, ParamValue::Text(joined));
    }
    Ok(())
}

fn flatten_value(prefix: Option<&str>, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let name = match prefix {
                    Some(parent) => format!("{parent}_{key}"),
                    None => key.clone(),
                };
                flatten_value(Some(&name), nested, out);
            }
        }
        // Sub-lists are encoded separately; nulls mean "not supplied".
        Value::Array(_) | Value::Null => {}
        scalar => {
            if let Some(name) = prefix {
                out.insert(name.to_string(), scalar.clone());
            }
        }
    }
}

fn validate_type_code(name: &str, value: &str) -> Result<(), MutationError> {
    if value.is_empty()
        || value.len() > 4
        || !value
            .chars()
            .all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit())
    {
        return Err(MutationError::Validation(format!(
            "{name} MUST be 1-4 uppercase letters or digits"
        )));
    }
    Ok(())
}

fn is_digits(value: &str) -> bool {
    value.chars().all(|ch| ch.is_ascii_digit())
}

fn describe_alternatives(values: &[String]) -> String {
    match values {
        [] => String::new(),
        [only] => only.clone(),
        [first, second] => format!("{first} or {second}"),
        [head @ .., last] => format!("{}, or {last}", head.join(", ")),
    }
}

/// Parses a `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [`MutationError::Validation`] when the value is not a valid date.
pub fn parse_iso_date(value: &str) -> Result<Date, MutationError> {
    Date::parse(value, format_description!("[year]-[month]-[day]"))
        .map_err(|err| MutationError::Validation(format!("invalid date {value}: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`MutationError::Store`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, MutationError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| MutationError::Store(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// One transactional unit of work against the personnel store.
///
/// A session that is dropped without [`commit`](Self::commit) rolls back.
pub trait TransactionalSession {
    /// Runs a named job write. `Ok(Some(message))` is a store-reported
    /// business failure; `Ok(None)` is success.
    #[allow(clippy::missing_errors_doc)]
    fn execute(
        &mut self,
        operation: WriteOperation,
        params: &ParameterSet,
    ) -> Result<Option<String>, MutationError>;

    #[allow(clippy::missing_errors_doc)]
    fn change_reason_code_exists(&mut self, code: &str) -> Result<bool, MutationError>;

    #[allow(clippy::missing_errors_doc)]
    fn find_job(&mut self, internal_id: i64, key: &JobKey)
        -> Result<Option<JobRecord>, MutationError>;

    #[allow(clippy::missing_errors_doc)]
    fn active_records(
        &mut self,
        internal_id: i64,
        kind: RecordKind,
        type_code: &str,
    ) -> Result<Vec<ActiveRecord>, MutationError>;

    #[allow(clippy::missing_errors_doc)]
    fn deactivate_record(&mut self, record: &ActiveRecord) -> Result<(), MutationError>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_address(
        &mut self,
        internal_id: i64,
        request: &AddressCreateRequest,
    ) -> Result<AddressRecord, MutationError>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_phone(
        &mut self,
        internal_id: i64,
        request: &PhoneCreateRequest,
        address_sequence_number: i64,
    ) -> Result<PhoneRecord, MutationError>;

    #[allow(clippy::missing_errors_doc)]
    fn relink_phone_address(
        &mut self,
        phone: &ActiveRecord,
        address_sequence_number: i64,
    ) -> Result<(), MutationError>;

    #[allow(clippy::missing_errors_doc)]
    fn commit(self) -> Result<(), MutationError>
    where
        Self: Sized;

    #[allow(clippy::missing_errors_doc)]
    fn rollback(self) -> Result<(), MutationError>
    where
        Self: Sized;
}

pub trait SessionFactory {
    type Session: TransactionalSession;

    #[allow(clippy::missing_errors_doc)]
    fn open_session(&self) -> Result<Self::Session, MutationError>;
}

/// Resolves an external person identifier. Absence is `Ok(None)`.
pub trait PersonLookup {
    #[allow(clippy::missing_errors_doc)]
    fn resolve(&self, person_id: &str) -> Result<Option<Person>, MutationError>;
}
