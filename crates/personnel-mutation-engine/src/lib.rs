//! Transactional orchestration of personnel mutations.
//!
//! [`MutationEngine`] opens one session per request, runs the pure decision
//! logic from `personnel-mutation-core` against it, and commits only after the
//! written state has been re-read and verified.

use personnel_mutation_core::{
    build_write_parameters, dispatch_job_change, ActiveRecord, AddressCreateRequest,
    AddressRecord, ErrorClass, JobMutation, JobRecord, JobStatus, MutationError, MutationPolicy,
    Person, PersonLookup, PhoneCreateRequest, PhoneRecord, RecordKind, SessionFactory,
    TransactionalSession, WriteOperation,
};
use ulid::Ulid;

/// Returns whether `code` exists in the change-reason reference table.
///
/// # Errors
/// Store failures propagate; they are never reported as `false`.
pub fn is_valid_change_reason_code<S: TransactionalSession>(
    session: &mut S,
    code: &str,
) -> Result<bool, MutationError> {
    session.change_reason_code_exists(code)
}

/// Deactivates the current active record of `(internal_id, kind, type_code)`.
///
/// Returns the record that was deactivated, or `None` when nothing was active.
///
/// # Errors
/// Returns [`MutationError::IntegrityViolation`] when more than one record is
/// already active.
pub fn enforce_exclusivity<S: TransactionalSession>(
    session: &mut S,
    internal_id: i64,
    kind: RecordKind,
    type_code: &str,
) -> Result<Option<ActiveRecord>, MutationError> {
    let mut active = session.active_records(internal_id, kind, type_code)?;
    match active.len() {
        0 => Ok(None),
        1 => {
            let record = active.remove(0);
            session.deactivate_record(&record)?;
            tracing::debug!(
                kind = kind.as_str(),
                type_code,
                sequence_number = record.sequence_number,
                "deactivated previous record"
            );
            Ok(Some(record))
        }
        count => Err(MutationError::IntegrityViolation(format!(
            "found {count} active {kind} records of type {type_code} for person {internal_id}"
        ))),
    }
}

/// Re-reads the active set and requires exactly one record.
///
/// # Errors
/// Returns [`MutationError::IntegrityViolation`] for any other count.
pub fn verify_single_active<S: TransactionalSession>(
    session: &mut S,
    internal_id: i64,
    kind: RecordKind,
    type_code: &str,
) -> Result<ActiveRecord, MutationError> {
    let mut active = session.active_records(internal_id, kind, type_code)?;
    if active.len() != 1 {
        return Err(MutationError::IntegrityViolation(format!(
            "expected exactly one active {kind} record of type {type_code} for person {internal_id}, found {}",
            active.len()
        )));
    }
    Ok(active.remove(0))
}

pub struct MutationEngine<F, L> {
    factory: F,
    lookup: L,
    policy: MutationPolicy,
}

impl<F, L> MutationEngine<F, L>
where
    F: SessionFactory,
    L: PersonLookup,
{
    /// # Errors
    /// Returns [`MutationError::Configuration`] when `policy` is invalid.
    pub fn new(factory: F, lookup: L, policy: MutationPolicy) -> Result<Self, MutationError> {
        policy.validate()?;
        Ok(Self {
            factory,
            lookup,
            policy,
        })
    }

    /// Creates or updates one job record and returns its persisted state.
    ///
    /// # Errors
    /// Returns a [`MutationError`] classed by [`MutationError::class`]; the
    /// session is rolled back on every error path.
    pub fn create_or_update_job(
        &self,
        person_id: &str,
        mutation: &JobMutation,
    ) -> Result<JobRecord, MutationError> {
        let request_id = Ulid::new();
        let span = tracing::info_span!(
            "create_or_update_job",
            %request_id,
            person_id,
            intent = mutation.intent().as_str()
        );
        let _guard = span.enter();

        let result = self.apply_job_mutation(person_id, mutation);
        record_outcome(&result);
        result
    }

    /// Creates an address, replacing the active address of the same type.
    ///
    /// # Errors
    /// Returns a [`MutationError`]; nothing is committed on failure.
    pub fn create_address(
        &self,
        person_id: &str,
        request: &AddressCreateRequest,
    ) -> Result<AddressRecord, MutationError> {
        let request_id = Ulid::new();
        let span = tracing::info_span!(
            "create_address",
            %request_id,
            person_id,
            address_type = request.address_type.as_str()
        );
        let _guard = span.enter();

        let result = self.apply_address(person_id, request);
        record_outcome(&result);
        result
    }

    /// Creates a phone anchored to the active address of the same type.
    ///
    /// # Errors
    /// Returns [`MutationError::Validation`] when no such address is active,
    /// and other [`MutationError`]s as classified.
    pub fn create_phone(
        &self,
        person_id: &str,
        request: &PhoneCreateRequest,
    ) -> Result<PhoneRecord, MutationError> {
        let request_id = Ulid::new();
        let span = tracing::info_span!(
            "create_phone",
            %request_id,
            person_id,
            phone_type = request.phone_type.as_str()
        );
        let _guard = span.enter();

        let result = self.apply_phone(person_id, request);
        record_outcome(&result);
        result
    }

    fn resolve_person(&self, person_id: &str) -> Result<Person, MutationError> {
        self.lookup
            .resolve(person_id)?
            .ok_or_else(|| MutationError::PersonNotFound(format!("person {person_id} not found")))
    }

    fn within_session<T>(
        &self,
        work: impl FnOnce(&mut F::Session) -> Result<T, MutationError>,
    ) -> Result<T, MutationError> {
        let mut session = self.factory.open_session()?;
        match work(&mut session) {
            Ok(value) => {
                session.commit()?;
                Ok(value)
            }
            Err(err) => {
                tracing::debug!(error = %err, "rolling back mutation session");
                if let Err(rollback_err) = session.rollback() {
                    tracing::warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    fn apply_job_mutation(
        &self,
        person_id: &str,
        mutation: &JobMutation,
    ) -> Result<JobRecord, MutationError> {
        mutation.validate()?;
        let person = self.resolve_person(person_id)?;
        let payload = mutation.payload();

        self.within_session(|session| {
            let operation =
                dispatch_job_change(mutation.intent(), payload, &self.policy, |code| {
                    is_valid_change_reason_code(session, code)
                })?;
            tracing::info!(
                operation = operation.as_str(),
                change_reason = payload.change_reason_code(),
                job = %payload.key(),
                "dispatched job mutation"
            );

            let params = build_write_parameters(&person, operation, payload)?;
            if let Some(message) = session
                .execute(operation, &params)?
                .filter(|message| !message.trim().is_empty())
            {
                return Err(MutationError::BusinessRuleRejection(message));
            }

            let key = payload.key();
            let record = session
                .find_job(person.internal_id, &key)?
                .ok_or_else(|| {
                    MutationError::IntegrityViolation(format!(
                        "job {key} is missing after {operation}"
                    ))
                })?;
            if operation == WriteOperation::Terminate && record.status != JobStatus::Terminated {
                return Err(MutationError::IntegrityViolation(format!(
                    "job {key} is still {} after {operation}",
                    record.status.as_str()
                )));
            }
            Ok(record)
        })
    }

    fn apply_address(
        &self,
        person_id: &str,
        request: &AddressCreateRequest,
    ) -> Result<AddressRecord, MutationError> {
        request.validate()?;
        let person = self.resolve_person(person_id)?;
        let internal_id = person.internal_id;
        let address_type = request.address_type.as_str();

        self.within_session(|session| {
            let replaced =
                enforce_exclusivity(session, internal_id, RecordKind::Address, address_type)?;
            let record = session.insert_address(internal_id, request)?;

            let active =
                verify_single_active(session, internal_id, RecordKind::Address, address_type)?;
            if active.sequence_number != record.sequence_number {
                return Err(MutationError::IntegrityViolation(format!(
                    "active {address_type} address is {} but {} was just written",
                    active.sequence_number, record.sequence_number
                )));
            }

            let phones = session.active_records(internal_id, RecordKind::Phone, address_type)?;
            match phones.as_slice() {
                [] => {}
                [phone] => {
                    session.relink_phone_address(phone, record.sequence_number)?;
                    let relinked =
                        verify_single_active(session, internal_id, RecordKind::Phone, address_type)?;
                    if relinked.linked_sequence_number != Some(record.sequence_number) {
                        return Err(MutationError::IntegrityViolation(format!(
                            "{address_type} phone still points at address {:?}",
                            relinked.linked_sequence_number
                        )));
                    }
                }
                many => {
                    return Err(MutationError::IntegrityViolation(format!(
                        "found {} active phone records of type {address_type} for person {internal_id}",
                        many.len()
                    )));
                }
            }

            tracing::info!(
                sequence_number = record.sequence_number,
                replaced = replaced.as_ref().map(|item| item.sequence_number),
                "address created"
            );
            Ok(record)
        })
    }

    fn apply_phone(
        &self,
        person_id: &str,
        request: &PhoneCreateRequest,
    ) -> Result<PhoneRecord, MutationError> {
        request.validate()?;
        let person = self.resolve_person(person_id)?;
        let internal_id = person.internal_id;
        let phone_type = request.phone_type.as_str();

        self.within_session(|session| {
            let anchors = session.active_records(internal_id, RecordKind::Address, phone_type)?;
            let anchor = match anchors.as_slice() {
                [] => {
                    return Err(MutationError::Validation(format!(
                        "A {phone_type} phone requires an active {phone_type} address"
                    )));
                }
                [address] => address.sequence_number,
                many => {
                    return Err(MutationError::IntegrityViolation(format!(
                        "found {} active address records of type {phone_type} for person {internal_id}",
                        many.len()
                    )));
                }
            };

            let replaced = enforce_exclusivity(session, internal_id, RecordKind::Phone, phone_type)?;
            let record = session.insert_phone(internal_id, request, anchor)?;

            let active = verify_single_active(session, internal_id, RecordKind::Phone, phone_type)?;
            if active.sequence_number != record.sequence_number
                || active.linked_sequence_number != Some(anchor)
            {
                return Err(MutationError::IntegrityViolation(format!(
                    "active {phone_type} phone {} does not match the record just written",
                    active.sequence_number
                )));
            }

            tracing::info!(
                sequence_number = record.sequence_number,
                address_sequence_number = anchor,
                replaced = replaced.as_ref().map(|item| item.sequence_number),
                "phone created"
            );
            Ok(record)
        })
    }
}

fn record_outcome<T>(result: &Result<T, MutationError>) {
    let Err(err) = result else {
        return;
    };
    match err.class() {
        ErrorClass::Rejected | ErrorClass::NotFound => {
            tracing::warn!(code = err.code(), error = %err, "mutation rejected");
        }
        ErrorClass::Retryable => {
            tracing::warn!(code = err.code(), error = %err, "mutation hit a busy store");
        }
        ErrorClass::Internal => {
            tracing::error!(code = err.code(), error = %err, "mutation failed");
        }
    }
}
