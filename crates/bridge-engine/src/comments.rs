//! Ticket comment templates.
//!
//! Every user-visible comment the bridge posts is built here, so wording stays uniform and the
//! scenario tests can assert on it.

pub fn contest_created(url: &str) -> String {
    format!("Contest {url} has been created for this ticket.")
}

pub fn contest_assigned(url: &str, handle: &str) -> String {
    format!("Contest {url} has been assigned to {handle}.")
}

pub fn contest_unassigned(url: &str, handle: &str) -> String {
    format!("Contest {url} has been unassigned from {handle}.")
}

pub fn signup_request(username: &str) -> String {
    format!(
        "@{username}, please sign up on the contest platform and link your account, \
         then pick up this ticket again."
    )
}

pub fn single_assignee_only() -> String {
    "Paid tickets support only a single assignee; extra assignees were ignored.".to_string()
}

pub fn wait_for_pickup(username: &str, pickup_label: &str) -> String {
    format!(
        "@{username}, this ticket is not ready to be picked up yet. \
         Wait until it carries the {pickup_label} label."
    )
}

pub fn missing_label_unassign(username: &str, pickup_label: &str) -> String {
    format!("@{username} was unassigned because the ticket is missing the {pickup_label} label.")
}

pub fn payment_skipped() -> String {
    "This ticket was closed without an accepted fix and will not be processed for payment."
        .to_string()
}

pub fn paid(url: &str, handle: &str) -> String {
    format!("Payment task {url} has been completed and paid out to {handle}.")
}
