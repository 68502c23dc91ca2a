//! End-to-end issue lifecycle scenarios, driven through the real engine against recording fakes.

mod support;

use bridge_core::model::IssueStatus;
use bridge_core::{ChallengeStatus, Error};
use support::*;

const PICKUP: &str = "tcx_OpenForPickup";
const ASSIGNED: &str = "tcx_Assigned";
const NOT_READY: &str = "tcx_NotReady";
const FIX_ACCEPTED: &str = "tcx_FixAccepted";
const PAID: &str = "tcx_Paid";

#[tokio::test]
async fn created_ticket_gets_a_challenge_and_a_comment() {
    let h = harness();
    let mut event = issue_event("issue.created", 1, "[$100] Fix bug", &[PICKUP], &[]);

    h.engine.handle(&mut event).await.unwrap();

    let issue = h.stored_issue(1).expect("issue stored");
    assert_eq!(issue.prizes, vec![100]);
    assert_eq!(issue.status, IssueStatus::ChallengeCreationSuccessful);
    assert_eq!(issue.challenge_id.as_deref(), Some("ch-1"));
    assert_eq!(issue.title, "Fix bug");
    assert!(issue.assignee.is_none());

    let calls = h.contest.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![ContestCall::Create {
            name: "Fix bug".to_string(),
            prizes: vec![100],
            copilot: false,
        }]
    );

    let comments = h.source.comments.lock().unwrap().clone();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].contains("/challenges/ch-1"));
}

#[tokio::test]
async fn unpaid_tickets_are_dropped_silently() {
    let h = harness();
    let mut event = issue_event("issue.created", 1, "Fix bug for free", &[PICKUP], &[]);

    h.engine.handle(&mut event).await.unwrap();

    assert!(h.stored_issue(1).is_none());
    assert_eq!(h.contest.creates(), 0);
}

#[tokio::test]
async fn tickets_without_readiness_labels_are_skipped() {
    let h = harness();
    let mut event = issue_event("issue.created", 1, "[$100] Fix bug", &["bug"], &[]);

    h.engine.handle(&mut event).await.unwrap();

    assert!(h.stored_issue(1).is_none());
    assert_eq!(h.contest.creates(), 0);
}

#[tokio::test]
async fn assignment_binds_a_submitter_and_swaps_labels() {
    let h = harness();
    let mut created = issue_event("issue.created", 1, "[$100] Fix bug", &[PICKUP], &[]);
    h.engine.handle(&mut created).await.unwrap();

    let mut assigned = issue_event("issue.assigned", 1, "[$100] Fix bug", &[PICKUP], &[7]);
    h.engine.handle(&mut assigned).await.unwrap();

    let issue = h.stored_issue(1).unwrap();
    assert_eq!(issue.assignee.as_deref(), Some("dev1"));
    assert!(issue.assigned_at.is_some());

    let calls = h.contest.calls.lock().unwrap().clone();
    assert!(calls.contains(&ContestCall::AddResource {
        id: "ch-1".to_string(),
        handle: "dev1".to_string(),
        role: 1,
    }));

    let labels = h.source.ticket_labels(1);
    assert!(labels.contains(&ASSIGNED.to_string()));
    assert!(!labels.contains(&PICKUP.to_string()));
}

#[tokio::test]
async fn assignment_without_a_mapping_asks_the_user_to_sign_up() {
    let h = harness();
    let mut created = issue_event("issue.created", 1, "[$100] Fix bug", &[PICKUP], &[]);
    h.engine.handle(&mut created).await.unwrap();

    // user 8 has no contest mapping
    let mut assigned = issue_event("issue.assigned", 1, "[$100] Fix bug", &[PICKUP], &[8]);
    h.engine.handle(&mut assigned).await.unwrap();

    let comments = h.source.comments.lock().unwrap().clone();
    assert!(comments.iter().any(|c| c.contains("sign up")));
    assert!(h
        .source
        .unassigned
        .lock()
        .unwrap()
        .contains(&"octo-two".to_string()));

    // no Submitter resource was added
    let calls = h.contest.calls.lock().unwrap().clone();
    assert!(!calls
        .iter()
        .any(|c| matches!(c, ContestCall::AddResource { .. })));
}

#[tokio::test]
async fn assignment_before_pickup_label_is_rolled_back() {
    let h = harness();
    let mut created = issue_event("issue.created", 1, "[$100] Fix bug", &[PICKUP], &[]);
    h.engine.handle(&mut created).await.unwrap();

    // the ticket lost its pickup label before the assignment landed
    let mut assigned = issue_event("issue.assigned", 1, "[$100] Fix bug", &["tcx_Custom"], &[7]);
    h.engine.handle(&mut assigned).await.unwrap();

    assert!(h.source.ticket_labels(1).contains(&NOT_READY.to_string()));
    let comments = h.source.comments.lock().unwrap().clone();
    assert!(comments.iter().any(|c| c.contains(PICKUP)));
    assert!(h
        .source
        .unassigned
        .lock()
        .unwrap()
        .contains(&"octo-dev".to_string()));

    let issue = h.stored_issue(1).unwrap();
    assert!(issue.assignee.is_none());
}

#[tokio::test]
async fn unassignment_releases_the_submitter_and_restores_the_pickup_label() {
    let h = harness();
    let mut created = issue_event("issue.created", 1, "[$100] Fix bug", &[PICKUP], &[]);
    h.engine.handle(&mut created).await.unwrap();
    let mut assigned = issue_event("issue.assigned", 1, "[$100] Fix bug", &[PICKUP], &[7]);
    h.engine.handle(&mut assigned).await.unwrap();

    let mut unassigned = issue_event("issue.unassigned", 1, "[$100] Fix bug", &[ASSIGNED], &[]);
    h.engine.handle(&mut unassigned).await.unwrap();

    let calls = h.contest.calls.lock().unwrap().clone();
    assert!(calls.contains(&ContestCall::RemoveResource {
        id: "ch-1".to_string(),
        handle: "dev1".to_string(),
        role: 1,
    }));

    let labels = h.source.ticket_labels(1);
    assert!(labels.contains(&PICKUP.to_string()));
    assert!(!labels.contains(&ASSIGNED.to_string()));

    let issue = h.stored_issue(1).unwrap();
    assert!(issue.assignee.is_none());
    assert!(issue.assigned_at.is_none());
}

#[tokio::test]
async fn close_without_accepted_fix_is_acknowledged_with_a_comment() {
    let h = harness();
    let mut created = issue_event("issue.created", 1, "[$100] Fix bug", &[PICKUP], &[]);
    h.engine.handle(&mut created).await.unwrap();
    let mut assigned = issue_event("issue.assigned", 1, "[$100] Fix bug", &[PICKUP], &[7]);
    h.engine.handle(&mut assigned).await.unwrap();

    let mut closed = issue_event("issue.closed", 1, "[$100] Fix bug", &[ASSIGNED], &[7]);
    h.engine.handle(&mut closed).await.unwrap();

    let comments = h.source.comments.lock().unwrap().clone();
    assert!(comments.iter().any(|c| c.contains("not be processed")));
    assert_eq!(h.contest.updates(), 0);
    assert_eq!(h.contest.closes(), 0);

    let issue = h.stored_issue(1).unwrap();
    assert_eq!(issue.status, IssueStatus::ChallengeCreationSuccessful);

    // replaying the same event changes nothing remotely
    let mut replay = issue_event("issue.closed", 1, "[$100] Fix bug", &[ASSIGNED], &[7]);
    h.engine.handle(&mut replay).await.unwrap();
    assert_eq!(h.contest.updates(), 0);
    assert_eq!(h.contest.closes(), 0);
}

#[tokio::test]
async fn close_with_accepted_fix_pays_the_winner() {
    let h = harness();
    let mut created = issue_event("issue.created", 1, "[$100] Fix bug", &[PICKUP], &[]);
    h.engine.handle(&mut created).await.unwrap();
    let mut assigned = issue_event("issue.assigned", 1, "[$100] Fix bug", &[PICKUP], &[7]);
    h.engine.handle(&mut assigned).await.unwrap();

    let mut closed = issue_event(
        "issue.closed",
        1,
        "[$100] Fix bug",
        &[ASSIGNED, FIX_ACCEPTED],
        &[7],
    );
    h.engine.handle(&mut closed).await.unwrap();

    let calls = h.contest.calls.lock().unwrap().clone();
    assert!(calls.contains(&ContestCall::Update {
        id: "ch-1".to_string(),
        prizes: Some(vec![100]),
        billing_account_id: Some(80001),
    }));
    assert!(calls.contains(&ContestCall::AddResource {
        id: "ch-1".to_string(),
        handle: "cp1".to_string(),
        role: 14,
    }));
    assert!(calls.contains(&ContestCall::Activate("ch-1".to_string())));
    assert!(calls.contains(&ContestCall::Close {
        id: "ch-1".to_string(),
        winner: "dev1".to_string(),
    }));
    assert_eq!(
        h.contest.challenges.lock().unwrap()["ch-1"],
        ChallengeStatus::Completed
    );

    let issue = h.stored_issue(1).unwrap();
    assert_eq!(issue.status, IssueStatus::ChallengePaymentSuccessful);

    let labels = h.source.ticket_labels(1);
    assert!(labels.contains(&PAID.to_string()));
    assert!(labels.contains(&ASSIGNED.to_string()));
    assert!(!labels.contains(&PICKUP.to_string()));

    assert_eq!(
        h.source.paid_markers.lock().unwrap().clone(),
        vec![(1, "dev1".to_string())]
    );
}

#[tokio::test]
async fn replayed_close_never_pays_twice() {
    let h = harness();
    let mut created = issue_event("issue.created", 1, "[$100] Fix bug", &[PICKUP], &[]);
    h.engine.handle(&mut created).await.unwrap();
    let mut assigned = issue_event("issue.assigned", 1, "[$100] Fix bug", &[PICKUP], &[7]);
    h.engine.handle(&mut assigned).await.unwrap();
    let mut closed = issue_event(
        "issue.closed",
        1,
        "[$100] Fix bug",
        &[ASSIGNED, FIX_ACCEPTED],
        &[7],
    );
    h.engine.handle(&mut closed).await.unwrap();
    assert_eq!(h.contest.closes(), 1);

    for _ in 0..3 {
        let mut replay = issue_event(
            "issue.closed",
            1,
            "[$100] Fix bug",
            &[ASSIGNED, FIX_ACCEPTED],
            &[7],
        );
        h.engine.handle(&mut replay).await.unwrap();
    }
    assert_eq!(h.contest.closes(), 1);
}

#[tokio::test]
async fn failed_close_stamps_the_failure_and_retries_cleanly() {
    let h = harness();
    let mut created = issue_event("issue.created", 1, "[$100] Fix bug", &[PICKUP], &[]);
    h.engine.handle(&mut created).await.unwrap();
    let mut assigned = issue_event("issue.assigned", 1, "[$100] Fix bug", &[PICKUP], &[7]);
    h.engine.handle(&mut assigned).await.unwrap();

    h.contest
        .fail_close
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let mut closed = issue_event(
        "issue.closed",
        1,
        "[$100] Fix bug",
        &[ASSIGNED, FIX_ACCEPTED],
        &[7],
    );
    let err = h.engine.handle(&mut closed).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(
        h.stored_issue(1).unwrap().status,
        IssueStatus::ChallengePaymentFailed
    );

    // the redelivered event starts the pipeline over and completes
    h.contest
        .fail_close
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let mut retry = issue_event(
        "issue.closed",
        1,
        "[$100] Fix bug",
        &[ASSIGNED, FIX_ACCEPTED],
        &[7],
    );
    h.engine.handle(&mut retry).await.unwrap();
    assert_eq!(h.contest.closes(), 1);
    assert_eq!(
        h.stored_issue(1).unwrap().status,
        IssueStatus::ChallengePaymentSuccessful
    );
}

#[tokio::test]
async fn sticky_payment_flag_reenters_only_the_bookkeeping_steps() {
    let h = harness();
    let mut created = issue_event("issue.created", 1, "[$100] Fix bug", &[PICKUP], &[]);
    h.engine.handle(&mut created).await.unwrap();
    let mut assigned = issue_event("issue.assigned", 1, "[$100] Fix bug", &[PICKUP], &[7]);
    h.engine.handle(&mut assigned).await.unwrap();

    // simulate a crash after the remote close went through but before the bookkeeping did
    let mut record = h.stored_issue(1).unwrap();
    record.status = IssueStatus::ChallengePaymentPending;
    h.store
        .issues
        .lock()
        .unwrap()
        .insert(record.id, record.clone());

    let mut replay = issue_event(
        "issue.closed",
        1,
        "[$100] Fix bug",
        &[ASSIGNED, FIX_ACCEPTED],
        &[7],
    );
    if let bridge_core::event::Event::IssueClosed(e) = &mut replay {
        e.payment_successful = true;
    }
    h.engine.handle(&mut replay).await.unwrap();

    // no remote close happened on this attempt; only labels and status were fixed up
    assert_eq!(h.contest.closes(), 0);
    let issue = h.stored_issue(1).unwrap();
    assert_eq!(issue.status, IssueStatus::ChallengePaymentSuccessful);
    assert!(h.source.ticket_labels(1).contains(&PAID.to_string()));
    assert_eq!(h.source.paid_markers.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn identical_update_makes_exactly_one_remote_patch() {
    let h = harness();
    let mut created = issue_event("issue.created", 1, "[$100] Fix bug", &[PICKUP], &[]);
    h.engine.handle(&mut created).await.unwrap();

    let mut update = issue_event("issue.updated", 1, "[$100] Fix bug v2", &[PICKUP], &[]);
    h.engine.handle(&mut update).await.unwrap();
    assert_eq!(h.contest.updates(), 1);

    let mut identical = issue_event("issue.updated", 1, "[$100] Fix bug v2", &[PICKUP], &[]);
    h.engine.handle(&mut identical).await.unwrap();
    assert_eq!(h.contest.updates(), 1);

    let issue = h.stored_issue(1).unwrap();
    assert_eq!(issue.title, "Fix bug v2");
}

#[tokio::test]
async fn concurrent_creates_produce_exactly_one_challenge() {
    let h = harness_with(
        FakeContest {
            create_delay: Some(std::time::Duration::from_millis(50)),
            ..FakeContest::default()
        },
        project(),
    );

    let mut first = issue_event("issue.created", 1, "[$100] Fix bug", &[PICKUP], &[]);
    let mut second = issue_event("issue.created", 1, "[$100] Fix bug", &[PICKUP], &[]);

    let (a, b) = tokio::join!(h.engine.handle(&mut first), h.engine.handle(&mut second));

    let (winner, loser) = if a.is_ok() { (a, b) } else { (b, a) };
    winner.unwrap();
    let err = loser.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "loser gets CreationInProgress");
    assert!(err.is_retryable());

    assert_eq!(h.contest.creates(), 1);

    // the rescheduled loser short-circuits: the record exists now
    let mut rescheduled = issue_event("issue.created", 1, "[$100] Fix bug", &[PICKUP], &[]);
    let err = h.engine.handle(&mut rescheduled).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(h.contest.creates(), 1);
}

#[tokio::test]
async fn failed_create_leaks_no_pending_state() {
    let h = harness();
    h.contest
        .fail_create
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let mut event = issue_event("issue.created", 1, "[$100] Fix bug", &[PICKUP], &[]);
    let err = h.engine.handle(&mut event).await.unwrap_err();
    assert!(err.is_retryable());

    // no record left behind, guard released
    assert!(h.stored_issue(1).is_none());

    // the retry starts clean and succeeds
    h.contest
        .fail_create
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let mut retry = issue_event("issue.created", 1, "[$100] Fix bug", &[PICKUP], &[]);
    h.engine.handle(&mut retry).await.unwrap();
    assert_eq!(h.contest.creates(), 1);
    assert_eq!(
        h.stored_issue(1).unwrap().status,
        IssueStatus::ChallengeCreationSuccessful
    );
}

#[tokio::test]
async fn labels_never_contradict_after_any_handler() {
    let h = harness();
    let events: Vec<(&str, Vec<&str>, Vec<i64>)> = vec![
        ("issue.created", vec![PICKUP], vec![]),
        ("issue.assigned", vec![PICKUP], vec![7]),
        ("issue.closed", vec![ASSIGNED, FIX_ACCEPTED], vec![7]),
    ];

    for (kind, labels, assignees) in events {
        let mut event = issue_event(kind, 1, "[$100] Fix bug", &labels, &assignees);
        h.engine.handle(&mut event).await.unwrap();

        let current = h.source.ticket_labels(1);
        let pickup = current.iter().any(|l| l == PICKUP);
        let assigned = current.iter().any(|l| l == ASSIGNED);
        let paid = current.iter().any(|l| l == PAID);
        assert!(!(pickup && assigned), "pickup and assigned are exclusive");
        if paid {
            assert!(assigned && !pickup, "paid implies assigned, excludes pickup");
        }
    }
}

#[tokio::test]
async fn recreate_rebuilds_the_binding_and_reassigns() {
    let h = harness();
    let mut created = issue_event("issue.created", 1, "[$100] Fix bug", &[PICKUP], &[]);
    h.engine.handle(&mut created).await.unwrap();
    let mut assigned = issue_event("issue.assigned", 1, "[$100] Fix bug", &[PICKUP], &[7]);
    h.engine.handle(&mut assigned).await.unwrap();

    let mut recreated = issue_event("issue.recreated", 1, "[$100] Fix bug", &[ASSIGNED], &[7]);
    h.engine.handle(&mut recreated).await.unwrap();

    assert_eq!(h.contest.creates(), 2);
    let issue = h.stored_issue(1).unwrap();
    assert_eq!(issue.challenge_id.as_deref(), Some("ch-2"));
    assert_eq!(issue.assignee.as_deref(), Some("dev1"));
}

#[tokio::test]
async fn accept_bid_comment_prices_and_assigns_the_ticket() {
    let h = harness();

    let mut comment = comment_event(5, "Fix widget", "/accept_bid @dev1 $250");
    h.engine.handle(&mut comment).await.unwrap();

    let titles = h.source.titles.lock().unwrap().clone();
    assert_eq!(titles, vec!["[$250] Fix widget".to_string()]);
    assert!(h.source.assigned.lock().unwrap().contains(&"dev1".to_string()));

    let mut malformed = comment_event(5, "Fix widget", "/accept_bid dev1 250");
    let err = h.engine.handle(&mut malformed).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn bid_comments_only_log() {
    let h = harness();
    let mut comment = comment_event(5, "Fix widget", "/bid $100");
    h.engine.handle(&mut comment).await.unwrap();

    assert!(h.source.titles.lock().unwrap().is_empty());
    assert!(h.source.assigned.lock().unwrap().is_empty());
}
