//! Named job writes. Each returns `Ok(Some(message))` for a business failure
//! and `Ok(None)` once the write has been applied.

use std::collections::BTreeMap;

use personnel_mutation_core::{
    format_rfc3339, now_utc, EmploymentType, JobKey, JobStatus, LaborDistributionLine,
    MutationError, ParameterSet, WriteOperation, LABOR_COUNT_PARAMETER, LABOR_PARAMETERS,
    LABOR_SEPARATOR,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::map_sqlite_error;

const RESERVED_PARAMETERS: [&str; 6] = [
    "personId",
    "internalId",
    "positionNumber",
    "suffix",
    "effectiveDate",
    "changeReason_code",
];

const PERCENT_TOLERANCE: f64 = 0.001;

struct ExistingJob {
    status: JobStatus,
    fields: BTreeMap<String, Value>,
}

pub(crate) fn execute(
    conn: &Connection,
    operation: WriteOperation,
    params: &ParameterSet,
) -> Result<Option<String>, MutationError> {
    let (Some(internal_id), Some(position_number), Some(suffix)) = (
        params.integer("internalId"),
        params.text("positionNumber"),
        params.text("suffix"),
    ) else {
        return Ok(Some(
            "internalId, positionNumber and suffix are required".to_string(),
        ));
    };
    let key = JobKey {
        position_number: position_number.to_string(),
        suffix: suffix.to_string(),
    };

    if let Some(percent) = params.real("appointmentPercent") {
        if !(0.0..=100.0).contains(&percent) {
            return Ok(Some(format!(
                "Appointment percent must be between 0 and 100, got {percent}"
            )));
        }
    }

    let labor = match decode_labor(params) {
        Ok(labor) => labor,
        Err(message) => return Ok(Some(message)),
    };
    let existing = load_existing(conn, internal_id, &key)?;
    let change_reason = params.text("changeReason_code");
    let effective_date = params.text("effectiveDate");
    let now = format_rfc3339(now_utc())?;

    if operation.is_create() {
        if existing.is_some() {
            return Ok(Some(format!("Job {key} already exists")));
        }
        let Some(change_reason) = change_reason else {
            return Ok(Some("changeReason_code is required".to_string()));
        };
        let employment_type = operation
            .employment_type()
            .unwrap_or(EmploymentType::Student);
        let fields = encode_fields(&merge_fields(params, BTreeMap::new()))?;

        conn.execute(
            "INSERT INTO jobs(
                internal_id, position_number, suffix, employment_type, status,
                change_reason_code, effective_date, fields_json, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                internal_id,
                key.position_number,
                key.suffix,
                employment_type.as_str(),
                JobStatus::Active.as_str(),
                change_reason,
                effective_date,
                fields,
                now
            ],
        )
        .map_err(map_sqlite_error)?;

        if let Some(lines) = labor {
            replace_labor(conn, internal_id, &key, &lines)?;
        }
        return Ok(None);
    }

    let Some(existing) = existing else {
        return Ok(Some(format!("Job {key} not found")));
    };

    if operation == WriteOperation::Terminate {
        if existing.status == JobStatus::Terminated {
            return Ok(Some(format!("Job {key} is already terminated")));
        }
        conn.execute(
            "UPDATE jobs SET
                status = ?4,
                change_reason_code = COALESCE(?5, change_reason_code),
                effective_date = COALESCE(?6, effective_date),
                updated_at = ?7
             WHERE internal_id = ?1 AND position_number = ?2 AND suffix = ?3",
            params![
                internal_id,
                key.position_number,
                key.suffix,
                JobStatus::Terminated.as_str(),
                change_reason,
                effective_date,
                now
            ],
        )
        .map_err(map_sqlite_error)?;
        return Ok(None);
    }

    if existing.status == JobStatus::Terminated {
        return Ok(Some(format!("Job {key} is terminated")));
    }

    if operation == WriteOperation::UpdateLaborDistribution {
        let Some(lines) = labor.filter(|lines| !lines.is_empty()) else {
            return Ok(Some(
                "Labor distribution is required for a labor change".to_string(),
            ));
        };
        replace_labor(conn, internal_id, &key, &lines)?;
        conn.execute(
            "UPDATE jobs SET
                change_reason_code = COALESCE(?4, change_reason_code),
                effective_date = COALESCE(?5, effective_date),
                updated_at = ?6
             WHERE internal_id = ?1 AND position_number = ?2 AND suffix = ?3",
            params![
                internal_id,
                key.position_number,
                key.suffix,
                change_reason,
                effective_date,
                now
            ],
        )
        .map_err(map_sqlite_error)?;
        return Ok(None);
    }

    let fields = encode_fields(&merge_fields(params, existing.fields))?;
    conn.execute(
        "UPDATE jobs SET
            employment_type = COALESCE(?4, employment_type),
            change_reason_code = COALESCE(?5, change_reason_code),
            effective_date = COALESCE(?6, effective_date),
            fields_json = ?7,
            updated_at = ?8
         WHERE internal_id = ?1 AND position_number = ?2 AND suffix = ?3",
        params![
            internal_id,
            key.position_number,
            key.suffix,
            operation.employment_type().map(EmploymentType::as_str),
            change_reason,
            effective_date,
            fields,
            now
        ],
    )
    .map_err(map_sqlite_error)?;

    if let Some(lines) = labor {
        replace_labor(conn, internal_id, &key, &lines)?;
    }
    Ok(None)
}

fn load_existing(
    conn: &Connection,
    internal_id: i64,
    key: &JobKey,
) -> Result<Option<ExistingJob>, MutationError> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT status, fields_json FROM jobs
             WHERE internal_id = ?1 AND position_number = ?2 AND suffix = ?3",
            params![internal_id, key.position_number, key.suffix],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(map_sqlite_error)?;

    let Some((status_raw, fields_json)) = row else {
        return Ok(None);
    };
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| MutationError::Store(format!("invalid stored job status: {status_raw}")))?;
    let fields = serde_json::from_str(&fields_json)
        .map_err(|err| MutationError::Store(format!("invalid stored fields_json: {err}")))?;

    Ok(Some(ExistingJob { status, fields }))
}

fn merge_fields(
    params: &ParameterSet,
    mut fields: BTreeMap<String, Value>,
) -> BTreeMap<String, Value> {
    for (name, value) in params.iter() {
        let reserved = RESERVED_PARAMETERS.contains(&name)
            || name == LABOR_COUNT_PARAMETER
            || LABOR_PARAMETERS.iter().any(|(param, _)| *param == name);
        if !reserved {
            fields.insert(name.to_string(), value.to_json());
        }
    }
    fields
}

fn encode_fields(fields: &BTreeMap<String, Value>) -> Result<String, MutationError> {
    serde_json::to_string(fields)
        .map_err(|err| MutationError::Store(format!("failed to serialize job fields: {err}")))
}

/// Decodes the parallel labor strings. `Err` carries the business message.
fn decode_labor(params: &ParameterSet) -> Result<Option<Vec<LaborDistributionLine>>, String> {
    let Some(count) = params.integer(LABOR_COUNT_PARAMETER) else {
        return Ok(None);
    };
    let count = usize::try_from(count).map_err(|_| format!("invalid laborCount {count}"))?;

    let mut columns = Vec::with_capacity(LABOR_PARAMETERS.len());
    for (param, attribute) in LABOR_PARAMETERS {
        let encoded = params.text(param).unwrap_or_default();
        let segments: Vec<&str> = if encoded.is_empty() {
            Vec::new()
        } else {
            encoded.split(LABOR_SEPARATOR).collect()
        };
        let segments = if count == 1 && segments.is_empty() {
            vec![""]
        } else {
            segments
        };
        if segments.len() != count {
            return Err(format!(
                "{param} has {} segments, expected {count}",
                segments.len()
            ));
        }
        columns.push((attribute, segments));
    }

    // Each column holds exactly `count` segments here.
    let mut lines = vec![LaborDistributionLine::default(); count];
    for (attribute, segments) in columns {
        for (line, segment) in lines.iter_mut().zip(segments) {
            assign_labor_attribute(line, attribute, segment)?;
        }
    }

    if !lines.is_empty() {
        let total: f64 = lines
            .iter()
            .map(|line| line.distribution_percent.unwrap_or_default())
            .sum();
        if (total - 100.0).abs() > PERCENT_TOLERANCE {
            return Err(format!(
                "Labor distribution percentages must total 100, got {total}"
            ));
        }
    }

    Ok(Some(lines))
}

fn assign_labor_attribute(
    line: &mut LaborDistributionLine,
    attribute: &str,
    segment: &str,
) -> Result<(), String> {
    let value = (!segment.is_empty()).then(|| segment.to_string());
    match attribute {
        "effectiveDate" => line.effective_date = value,
        "accountIndex" => line.account_index = value,
        "fund" => line.fund = value,
        "organization" => line.organization = value,
        "account" => line.account = value,
        "program" => line.program = value,
        "activity" => line.activity = value,
        "location" => line.location = value,
        "distributionPercent" => {
            line.distribution_percent = match value {
                Some(raw) => Some(
                    raw.parse::<f64>()
                        .map_err(|_| format!("invalid labor distribution percentage {raw}"))?,
                ),
                None => None,
            };
        }
        _ => {}
    }
    Ok(())
}

fn replace_labor(
    conn: &Connection,
    internal_id: i64,
    key: &JobKey,
    lines: &[LaborDistributionLine],
) -> Result<(), MutationError> {
    conn.execute(
        "DELETE FROM labor_distributions
         WHERE internal_id = ?1 AND position_number = ?2 AND suffix = ?3",
        params![internal_id, key.position_number, key.suffix],
    )
    .map_err(map_sqlite_error)?;

    for (line_number, line) in (1_i64..).zip(lines) {
        conn.execute(
            "INSERT INTO labor_distributions(
                internal_id, position_number, suffix, line_number, effective_date,
                account_index, fund, organization, account, program, activity, location,
                distribution_percent
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                internal_id,
                key.position_number,
                key.suffix,
                line_number,
                line.effective_date,
                line.account_index,
                line.fund,
                line.organization,
                line.account,
                line.program,
                line.activity,
                line.location,
                line.distribution_percent
            ],
        )
        .map_err(map_sqlite_error)?;
    }
    Ok(())
}
