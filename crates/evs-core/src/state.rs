use crate::SubmissionStatus;

/// Inputs that move a submission through its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmissionEvent {
    ValidateRequested,
    ValidationPassed,
    ValidationFailed,
    SubmitRequested { bypass: bool },
    RemoteAcknowledged,
    SubmitFailed,
    RemoteAccepted,
    RemoteRejected,
    EvidenceEdited,
    /// A previous process died mid-operation and left an in-flight status behind.
    Interrupted,
}

impl SubmissionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionEvent::ValidateRequested => "validate",
            SubmissionEvent::ValidationPassed => "pass validation",
            SubmissionEvent::ValidationFailed => "fail validation",
            SubmissionEvent::SubmitRequested { bypass: false } => "submit",
            SubmissionEvent::SubmitRequested { bypass: true } => "submit with bypass",
            SubmissionEvent::RemoteAcknowledged => "acknowledge",
            SubmissionEvent::SubmitFailed => "fail submission",
            SubmissionEvent::RemoteAccepted => "accept",
            SubmissionEvent::RemoteRejected => "reject",
            SubmissionEvent::EvidenceEdited => "edit evidence",
            SubmissionEvent::Interrupted => "recover",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot {event} a submission in status {from}")]
    Invalid {
        from: SubmissionStatus,
        event: &'static str,
    },
    #[error("submission requires a validated outcome, current status is {0}")]
    NotValidated(SubmissionStatus),
}

/// Pure transition function. The controller owns side effects.
pub fn next_status(
    current: SubmissionStatus,
    event: SubmissionEvent,
) -> Result<SubmissionStatus, TransitionError> {
    use SubmissionEvent as E;
    use SubmissionStatus as S;

    let next = match (current, event) {
        (_, E::EvidenceEdited) => S::Draft,

        (S::Draft | S::Validated | S::ValidationFailed | S::SubmissionFailed, E::ValidateRequested) => {
            S::Validating
        }
        (S::Validating, E::ValidationPassed) => S::Validated,
        (S::Validating, E::ValidationFailed) => S::ValidationFailed,

        (S::Validated, E::SubmitRequested { .. }) => S::Submitting,
        (
            S::Draft | S::ValidationFailed | S::SubmissionFailed,
            E::SubmitRequested { bypass: true },
        ) => S::Submitting,
        (
            S::Draft | S::ValidationFailed | S::SubmissionFailed,
            E::SubmitRequested { bypass: false },
        ) => return Err(TransitionError::NotValidated(current)),

        (S::Submitting, E::RemoteAcknowledged) => S::Submitted,
        (S::Submitting, E::SubmitFailed) => S::SubmissionFailed,
        (S::Submitted, E::RemoteAccepted) => S::Accepted,
        (S::Submitted, E::RemoteRejected) => S::Rejected,

        (S::Validating, E::Interrupted) => S::Draft,
        (S::Submitting, E::Interrupted) => S::SubmissionFailed,

        (from, event) => {
            return Err(TransitionError::Invalid {
                from,
                event: event.as_str(),
            })
        }
    };
    Ok(next)
}

/// Statuses a record only has while some operation holds its task/window lease.
pub fn is_in_flight(status: SubmissionStatus) -> bool {
    matches!(status, SubmissionStatus::Validating | SubmissionStatus::Submitting)
}
