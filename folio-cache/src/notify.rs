//! Notification emitter.
//!
//! Turns a mutation outcome into exactly one user-facing notification.

use std::sync::Arc;

use folio_core::{
    EntityTag, FailureClass, FolioError, MutationKind, MutationOutcome, MutationRequest,
    Notification, NotificationSink, ServiceErrorCode,
};
use tracing::trace;

/// Sends mutation notifications to the UI sink.
#[derive(Clone)]
pub struct NotificationEmitter {
    sink: Arc<dyn NotificationSink>,
}

impl NotificationEmitter {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Build and send the notification for one outcome.
    pub fn notify(&self, request: &MutationRequest, outcome: &MutationOutcome) -> Notification {
        let notification = describe(request, outcome);
        self.emit(notification.clone());
        notification
    }

    /// Send a notification that is not tied to a mutation.
    pub fn emit(&self, notification: Notification) {
        trace!(
            title = %notification.title,
            severity = ?notification.severity,
            "Emitting notification"
        );
        self.sink.notify(notification);
    }
}

impl std::fmt::Debug for NotificationEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationEmitter").finish_non_exhaustive()
    }
}

/// The notification an outcome produces, without sending it.
pub fn describe(request: &MutationRequest, outcome: &MutationOutcome) -> Notification {
    match outcome {
        MutationOutcome::Succeeded(_) => {
            let (title, message) = success_text(request.entity, request.kind);
            Notification::success(title, message)
        }
        MutationOutcome::Failed(err) => {
            let message = err
                .service_message()
                .map(str::to_string)
                .unwrap_or_else(|| generic_failure(request.entity, request.kind));
            Notification::error(failure_title(err), message)
        }
    }
}

fn success_text(entity: EntityTag, kind: MutationKind) -> (&'static str, &'static str) {
    use EntityTag::*;
    use MutationKind::*;

    match (entity, kind) {
        (BorrowRecord, Create) => ("Request sent", "Borrow request submitted"),
        (BorrowRecord, Update) => ("Request updated", "Borrow request updated"),
        (BorrowRecord, Delete) => ("Request cancelled", "Borrow request cancelled"),
        (Book, Create) => ("Book added", "The book was added to the catalogue"),
        (Book, Update) => ("Book updated", "Book details saved"),
        (Book, Delete) => ("Book removed", "The book was removed from the catalogue"),
        (User, Update) => ("Account updated", "Account changes saved"),
        (User, Delete) => ("Account deleted", "The account was deleted"),
        (Review, Create) => ("Review posted", "Thanks for your review"),
        (Review, Update) => ("Review updated", "Your review was updated"),
        (Review, Delete) => ("Review deleted", "Your review was deleted"),
        (Fine, Update) => ("Fine updated", "Fine status saved"),
        _ => ("Saved", "Your changes were saved"),
    }
}

fn failure_title(err: &FolioError) -> &'static str {
    match err.class() {
        FailureClass::Validation | FailureClass::Config => "Invalid request",
        FailureClass::Network => "Connection problem",
        FailureClass::Service => match err.code().unwrap_or(ServiceErrorCode::Other) {
            ServiceErrorCode::AlreadyProcessed => "Request already processed",
            ServiceErrorCode::NoLongerAvailable => "Book unavailable",
            ServiceErrorCode::ActiveBorrows => "Active borrows",
            ServiceErrorCode::AlreadyAdmin => "Already an admin",
            ServiceErrorCode::NotFound => "Not found",
            ServiceErrorCode::Conflict => "Conflict",
            ServiceErrorCode::Other => "Something went wrong",
        },
    }
}

fn generic_failure(entity: EntityTag, kind: MutationKind) -> String {
    let what = match entity {
        EntityTag::BorrowRecord => "borrow request",
        EntityTag::Book => "book",
        EntityTag::User => "account",
        EntityTag::Review => "review",
        EntityTag::Fine => "fine",
        other => other.as_str(),
    };
    let verb = match kind {
        MutationKind::Create => "create",
        MutationKind::Update => "update",
        MutationKind::Delete => "delete",
    };
    format!("Could not {verb} the {what}. Please try again.")
}
