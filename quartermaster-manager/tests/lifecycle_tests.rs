//! Request lifecycle tests for the standard request manager
//!
//! Covers creation, prerequisite chains, external state updates, terminal
//! removal, cascading cancellation, requester removal and followups.

use proptest::prelude::*;
use quartermaster_core::{RequestState, Token};
use quartermaster_manager::RequestManager;
use quartermaster_test_utils::assertions::{
    assert_illegal_transition, assert_not_found, assert_unknown_requester,
};
use quartermaster_test_utils::generators::arb_text_content;
use quartermaster_test_utils::{
    EventLog, RecordingRequester, Requester, TestProvider, TextRequestable, TextResolver,
};
use std::collections::HashSet;

#[path = "support/harness.rs"]
mod harness;
use harness::{state_of, test_manager, token_for};

// ============================================================================
// RESOLUTION THROUGH PREREQUISITES
// ============================================================================

#[test]
fn test_two_character_request_completes_through_child() {
    let log = EventLog::new();
    let mut manager = test_manager();
    let requester = RecordingRequester::shared(&log);
    manager.register_requester(requester.clone());

    let provider = TestProvider::single(TextResolver::new(&log));
    let resolver = provider.first_resolver().expect("provider has a resolver");
    manager.on_provider_added(&provider).expect("provider added");

    let token = manager
        .create_and_assign_request(requester.requester_id(), TextRequestable::boxed("Hi"))
        .expect("request created");

    assert_eq!(log.completions(), 2);
    assert_eq!(log.completed_for(requester.requester_id()), vec![token]);
    assert_eq!(log.completed_for(resolver).len(), 1);
    assert_eq!(manager.live_request_count(), 0);
    assert_not_found(&manager.get_request(token).map(|_| ()), token);

    // The child is resolved before its parent.
    let resolved = log.resolved_by(resolver);
    assert_eq!(resolved.len(), 2);
    assert_eq!(resolved[1], token);
}

#[test]
fn test_parent_waits_reported_until_child_is_terminal() {
    let log = EventLog::new();
    let mut manager = test_manager();
    let requester = RecordingRequester::shared(&log);
    manager.register_requester(requester.clone());

    let provider = TestProvider::single(TextResolver::new(&log).deferred());
    let resolver = provider.first_resolver().expect("provider has a resolver");
    manager.on_provider_added(&provider).expect("provider added");

    let parent = manager
        .create_and_assign_request(requester.requester_id(), TextRequestable::boxed("Hi"))
        .expect("request created");
    let child = token_for(&manager, "i").expect("child request exists");

    assert_eq!(state_of(&manager, parent), Some(RequestState::Reported));
    assert_eq!(state_of(&manager, child), Some(RequestState::Assigned));
    {
        let parent_request = manager.get_request(parent).expect("parent live");
        assert_eq!(parent_request.children(), &[child]);
        assert_eq!(parent_request.resolver(), Some(resolver));
        let child_request = manager.get_request(child).expect("child live");
        assert_eq!(child_request.parent(), Some(parent));
        assert_eq!(child_request.requester(), resolver);
    }

    manager
        .update_request_state(child, RequestState::Completed)
        .expect("child completes");

    // The reporting resolver is asked to resolve the parent directly.
    assert_eq!(state_of(&manager, parent), Some(RequestState::Assigned));
    assert_eq!(log.resolved_by(resolver), vec![child, parent]);
    assert!(log.completed_for(requester.requester_id()).is_empty());

    manager
        .update_request_state(parent, RequestState::Completed)
        .expect("parent completes");
    assert_eq!(log.completed_for(requester.requester_id()), vec![parent]);
    assert_eq!(manager.live_request_count(), 0);
}

#[test]
fn test_in_progress_passes_through_to_completion() {
    let log = EventLog::new();
    let mut manager = test_manager();
    let requester = RecordingRequester::shared(&log);
    manager.register_requester(requester.clone());
    let provider = TestProvider::single(TextResolver::new(&log).deferred());
    manager.on_provider_added(&provider).expect("provider added");

    let token = manager
        .create_and_assign_request(requester.requester_id(), TextRequestable::boxed("x"))
        .expect("request created");
    manager
        .update_request_state(token, RequestState::InProgress)
        .expect("assigned -> in progress");
    assert_eq!(state_of(&manager, token), Some(RequestState::InProgress));

    manager
        .update_request_state(token, RequestState::Completed)
        .expect("in progress -> completed");
    assert_eq!(log.completed_for(requester.requester_id()), vec![token]);
}

// ============================================================================
// UNRESOLVABLE REQUESTS
// ============================================================================

#[test]
fn test_request_without_resolver_stays_created() {
    let log = EventLog::new();
    let mut manager = test_manager();
    let requester = RecordingRequester::shared(&log);
    manager.register_requester(requester.clone());

    let token = manager
        .create_request(requester.requester_id(), TextRequestable::boxed("planks"))
        .expect("request created");
    let before = manager.get_request(token).expect("live").clone();

    for _ in 0..3 {
        manager.resolve_request(token).expect("resolution pass");
        manager.on_tick();
    }

    let after = manager.get_request(token).expect("still live");
    assert_eq!(after, &before);
    assert_eq!(after.state(), RequestState::Created);
    assert_eq!(after.resolver(), None);
    assert!(log.is_empty());
}

#[test]
fn test_create_and_assign_without_resolver_returns_created_token() {
    let log = EventLog::new();
    let mut manager = test_manager();
    let requester = RecordingRequester::shared(&log);
    manager.register_requester(requester.clone());

    let token = manager
        .create_and_assign_request(requester.requester_id(), TextRequestable::boxed("xyz"))
        .expect("request created");
    assert_eq!(state_of(&manager, token), Some(RequestState::Created));
    assert_eq!(manager.resolver_for_request(token), None);
}

// ============================================================================
// EXTERNAL STATE UPDATES
// ============================================================================

#[test]
fn test_received_removes_request_and_notifies_once() {
    let log = EventLog::new();
    let mut manager = test_manager();
    let requester = RecordingRequester::shared(&log);
    manager.register_requester(requester.clone());
    let provider = TestProvider::single(TextResolver::new(&log).deferred());
    manager.on_provider_added(&provider).expect("provider added");

    let token = manager
        .create_and_assign_request(requester.requester_id(), TextRequestable::boxed("x"))
        .expect("request created");
    assert_eq!(state_of(&manager, token), Some(RequestState::Assigned));

    manager
        .update_request_state(token, RequestState::Received)
        .expect("received");
    assert_eq!(log.completed_for(requester.requester_id()), vec![token]);
    assert_eq!(manager.live_request_count(), 0);

    let second = manager.update_request_state(token, RequestState::Received);
    assert_not_found(&second, token);
    assert_eq!(log.completed_for(requester.requester_id()), vec![token]);
}

#[test]
fn test_received_cancels_outstanding_children() {
    let log = EventLog::new();
    let mut manager = test_manager();
    let requester = RecordingRequester::shared(&log);
    manager.register_requester(requester.clone());
    let provider = TestProvider::single(TextResolver::new(&log).deferred());
    let resolver = provider.first_resolver().expect("provider has a resolver");
    manager.on_provider_added(&provider).expect("provider added");

    let parent = manager
        .create_and_assign_request(requester.requester_id(), TextRequestable::boxed("ab"))
        .expect("request created");
    let child = token_for(&manager, "b").expect("child exists");

    manager
        .update_request_state(parent, RequestState::Received)
        .expect("received");

    assert_eq!(manager.live_request_count(), 0);
    assert_eq!(log.cancelled(), vec![child]);
    assert_eq!(log.completed_for(requester.requester_id()), vec![parent]);
    assert!(log.completed_for(resolver).is_empty());
}

#[test]
fn test_states_reserved_for_resolution_are_rejected() {
    let log = EventLog::new();
    let mut manager = test_manager();
    let requester = RecordingRequester::shared(&log);
    manager.register_requester(requester.clone());

    let token = manager
        .create_request(requester.requester_id(), TextRequestable::boxed("x"))
        .expect("request created");

    let result = manager.update_request_state(token, RequestState::Assigned);
    assert_illegal_transition(&result, RequestState::Created, RequestState::Assigned);
    let result = manager.update_request_state(token, RequestState::Reported);
    assert_illegal_transition(&result, RequestState::Created, RequestState::Reported);
    let result = manager.update_request_state(token, RequestState::InProgress);
    assert_illegal_transition(&result, RequestState::Created, RequestState::InProgress);
    let result = manager.update_request_state(token, RequestState::Overruled);
    assert_illegal_transition(&result, RequestState::Created, RequestState::Overruled);

    assert_eq!(state_of(&manager, token), Some(RequestState::Created));
    assert!(log.is_empty());
}

#[test]
fn test_assigned_request_cannot_be_reassigned_externally() {
    let log = EventLog::new();
    let mut manager = test_manager();
    let requester = RecordingRequester::shared(&log);
    manager.register_requester(requester.clone());
    let provider = TestProvider::single(TextResolver::new(&log).deferred());
    manager.on_provider_added(&provider).expect("provider added");

    let token = manager
        .create_and_assign_request(requester.requester_id(), TextRequestable::boxed("x"))
        .expect("request created");

    let result = manager.update_request_state(token, RequestState::Assigned);
    assert_illegal_transition(&result, RequestState::Assigned, RequestState::Assigned);
    let result = manager.update_request_state(token, RequestState::Created);
    assert_illegal_transition(&result, RequestState::Assigned, RequestState::Created);
    assert_eq!(state_of(&manager, token), Some(RequestState::Assigned));
}

#[test]
fn test_completed_request_is_gone() {
    let log = EventLog::new();
    let mut manager = test_manager();
    let requester = RecordingRequester::shared(&log);
    manager.register_requester(requester.clone());
    let provider = TestProvider::single(TextResolver::new(&log));
    manager.on_provider_added(&provider).expect("provider added");

    let token = manager
        .create_and_assign_request(requester.requester_id(), TextRequestable::boxed("x"))
        .expect("request created");

    let result = manager.update_request_state(token, RequestState::Assigned);
    assert_not_found(&result, token);
    assert_not_found(&manager.resolve_request(token), token);
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[test]
fn test_cancel_cascades_children_first() {
    let log = EventLog::new();
    let mut manager = test_manager();
    let requester = RecordingRequester::shared(&log);
    manager.register_requester(requester.clone());
    let provider = TestProvider::single(TextResolver::new(&log).deferred());
    let resolver = provider.first_resolver().expect("provider has a resolver");
    manager.on_provider_added(&provider).expect("provider added");

    let root = manager
        .create_and_assign_request(requester.requester_id(), TextRequestable::boxed("abc"))
        .expect("request created");
    let middle = token_for(&manager, "bc").expect("middle exists");
    let leaf = token_for(&manager, "c").expect("leaf exists");
    assert_eq!(manager.live_request_count(), 3);

    manager
        .update_request_state(root, RequestState::Cancelled)
        .expect("cancelled");

    // Two descendants plus the root: three notifications, leaf first.
    assert_eq!(log.cancelled(), vec![leaf, middle, root]);
    assert_eq!(manager.live_request_count(), 0);

    let released: Vec<Token> = log
        .released_by(resolver)
        .into_iter()
        .map(|(token, state)| {
            assert_eq!(state, RequestState::Cancelled);
            token
        })
        .collect();
    assert_eq!(released, vec![leaf, middle, root]);

    for token in [root, middle, leaf] {
        assert_not_found(&manager.get_request(token).map(|_| ()), token);
    }
}

#[test]
fn test_cancelling_child_retries_parent() {
    let log = EventLog::new();
    let mut manager = test_manager();
    let requester = RecordingRequester::shared(&log);
    manager.register_requester(requester.clone());
    let provider = TestProvider::single(TextResolver::new(&log).deferred());
    manager.on_provider_added(&provider).expect("provider added");

    let parent = manager
        .create_and_assign_request(requester.requester_id(), TextRequestable::boxed("ab"))
        .expect("request created");
    let child = token_for(&manager, "b").expect("child exists");

    manager
        .update_request_state(child, RequestState::Cancelled)
        .expect("child cancelled");

    // A cancelled prerequisite is terminal, so the parent moves on.
    assert_eq!(state_of(&manager, parent), Some(RequestState::Assigned));
    assert!(manager
        .get_request(parent)
        .expect("parent live")
        .children()
        .is_empty());
}

// ============================================================================
// REQUESTERS
// ============================================================================

#[test]
fn test_unknown_requester_cannot_create_requests() {
    let mut manager = test_manager();
    let stranger = Token::new();
    let result = manager.create_request(stranger, TextRequestable::boxed("x"));
    assert_unknown_requester(&result, stranger);
    assert_eq!(manager.live_request_count(), 0);
}

#[test]
fn test_requester_removal_cancels_its_requests() {
    let log = EventLog::new();
    let mut manager = test_manager();
    let leaving = RecordingRequester::shared(&log);
    let staying = RecordingRequester::shared(&log);
    manager.register_requester(leaving.clone());
    manager.register_requester(staying.clone());

    let first = manager
        .create_request(leaving.requester_id(), TextRequestable::boxed("a"))
        .expect("created");
    let second = manager
        .create_request(leaving.requester_id(), TextRequestable::boxed("b"))
        .expect("created");
    let kept = manager
        .create_request(staying.requester_id(), TextRequestable::boxed("c"))
        .expect("created");

    let cancelled = manager
        .on_requester_removed(leaving.requester_id())
        .expect("requester removed");
    assert_eq!(cancelled, 2);
    assert_eq!(log.cancelled(), vec![first, second]);
    assert!(!manager.is_requester_known(leaving.requester_id()));
    assert_eq!(manager.requests_for_requester(staying.requester_id()), vec![kept]);

    let again = manager.on_requester_removed(leaving.requester_id());
    assert_unknown_requester(&again, leaving.requester_id());
}

#[test]
fn test_requests_for_requester_lists_open_requests() {
    let log = EventLog::new();
    let mut manager = test_manager();
    let requester = RecordingRequester::shared(&log);
    manager.register_requester(requester.clone());

    let tokens: Vec<Token> = ["a", "b", "c"]
        .into_iter()
        .map(|content| {
            manager
                .create_request(requester.requester_id(), TextRequestable::boxed(content))
                .expect("created")
        })
        .collect();

    assert_eq!(manager.requests_for_requester(requester.requester_id()), tokens);
    assert!(manager.requests_for_requester(Token::new()).is_empty());
}

// ============================================================================
// FOLLOWUPS
// ============================================================================

#[test]
fn test_followup_is_requested_on_behalf_of_requester() {
    let log = EventLog::new();
    let mut manager = test_manager();
    let requester = RecordingRequester::shared(&log);
    manager.register_requester(requester.clone());
    let provider = TestProvider::single(TextResolver::new(&log).with_followup("ok"));
    manager.on_provider_added(&provider).expect("provider added");

    let token = manager
        .create_and_assign_request(requester.requester_id(), TextRequestable::boxed("x"))
        .expect("request created");

    let completed = log.completed_for(requester.requester_id());
    assert_eq!(completed.len(), 2);
    assert_eq!(completed[0], token);
    assert_ne!(completed[1], token);
    assert_eq!(manager.live_request_count(), 0);
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: every issued token is distinct from every live token.
    #[test]
    fn prop_created_tokens_are_unique(
        contents in proptest::collection::vec(arb_text_content(6), 1..24)
    ) {
        let log = EventLog::new();
        let mut manager = test_manager();
        let requester = RecordingRequester::shared(&log);
        manager.register_requester(requester.clone());

        let mut seen = HashSet::new();
        for content in &contents {
            let token = manager
                .create_request(requester.requester_id(), TextRequestable::boxed(content.clone()))
                .expect("created");
            prop_assert!(seen.insert(token));
        }
        prop_assert_eq!(manager.live_request_count(), contents.len());
    }

    /// Property: with a synchronous resolver every request finishes, the
    /// requester hears about each exactly once, and nothing stays live.
    #[test]
    fn prop_synchronous_resolution_leaves_nothing_live(
        contents in proptest::collection::vec(arb_text_content(6), 1..6)
    ) {
        let log = EventLog::new();
        let mut manager = test_manager();
        let requester = RecordingRequester::shared(&log);
        manager.register_requester(requester.clone());
        let provider = TestProvider::single(TextResolver::new(&log));
        manager.on_provider_added(&provider).expect("provider added");

        let mut tokens = Vec::new();
        for content in &contents {
            tokens.push(
                manager
                    .create_and_assign_request(
                        requester.requester_id(),
                        TextRequestable::boxed(content.clone()),
                    )
                    .expect("created"),
            );
        }

        prop_assert_eq!(log.completed_for(requester.requester_id()), tokens);
        prop_assert_eq!(manager.live_request_count(), 0);
    }

    /// Property: cancelling a chain of N prerequisites yields N + 1
    /// cancellation callbacks, deepest first.
    #[test]
    fn prop_cancellation_reaches_every_descendant(content in arb_text_content(8)) {
        let log = EventLog::new();
        let mut manager = test_manager();
        let requester = RecordingRequester::shared(&log);
        manager.register_requester(requester.clone());
        let provider = TestProvider::single(TextResolver::new(&log).deferred());
        manager.on_provider_added(&provider).expect("provider added");

        let root = manager
            .create_and_assign_request(requester.requester_id(), TextRequestable::boxed(content.clone()))
            .expect("created");
        let live = manager.live_request_count();
        prop_assert_eq!(live, content.chars().count());

        manager
            .update_request_state(root, RequestState::Cancelled)
            .expect("cancelled");

        let cancelled = log.cancelled();
        prop_assert_eq!(cancelled.len(), live);
        prop_assert_eq!(cancelled.last().copied(), Some(root));
        prop_assert_eq!(manager.live_request_count(), 0);
    }
}
