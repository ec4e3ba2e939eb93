#![allow(dead_code)]

use quartermaster_core::{ManagerConfig, RequestState, Token};
use quartermaster_manager::{RequestManager, StandardRequestManager};
use quartermaster_test_utils::fixtures::{fixture_registry, init_test_tracing};
use quartermaster_test_utils::TextRequestable;
use std::sync::Arc;

pub fn test_manager() -> StandardRequestManager {
    test_manager_with(ManagerConfig::default())
}

pub fn test_manager_with(config: ManagerConfig) -> StandardRequestManager {
    init_test_tracing();
    let registry = fixture_registry().expect("Failed to build fixture registry");
    StandardRequestManager::with_registry(Arc::new(registry), config)
        .expect("Failed to create request manager")
}

pub fn state_of(manager: &StandardRequestManager, token: Token) -> Option<RequestState> {
    manager.get_request(token).ok().map(|request| request.state())
}

/// Token of the live text request with exactly this content.
pub fn token_for(manager: &StandardRequestManager, content: &str) -> Option<Token> {
    manager
        .requests()
        .find(|request| {
            request
                .payload_as::<TextRequestable>()
                .is_some_and(|text| text.content == content)
        })
        .map(|request| request.token())
}
