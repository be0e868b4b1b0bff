//! 端到端流程测试：从搜索 provider 到报名完成，以及失败时的恢复响应

mod common;

use serde_json::json;

use common::{acme, harness, FakeTool, Provider};
use signup_pilot::core::RecoveryAction;
use signup_pilot::flow::{route, FlowAction, Step, Turn};
use signup_pilot::session::{ProgramRef, SessionContext};
use signup_pilot::tools::{Operation, TransportError};

const SESSION: &str = "sess-42";
const USER: Option<&str> = Some("parent-1");

fn say(message: &str) -> Turn {
    Turn::message(SESSION, USER, message)
}

fn press(action: FlowAction) -> Turn {
    Turn::action(SESSION, USER, action)
}

fn ski_level_1() -> ProgramRef {
    ProgramRef {
        id: "p1".into(),
        title: "Ski Level 1".into(),
        price_cents: Some(15000),
    }
}

#[tokio::test]
async fn provider_search_returns_candidate_cards() {
    let provider = Provider::default();
    let h = harness(&provider).await;

    let env = h.engine.machine.handle(say("Acme Club")).await;
    assert_eq!(env.step, Step::ProviderSearch);
    assert_eq!(env.cards.len(), 2);
    assert_eq!(env.cards[0].title, "Acme Club");
    assert_eq!(env.cards[0].subtitle.as_deref(), Some("Denver"));
    assert!(matches!(
        &env.cards[0].buttons[0].action,
        FlowAction::SelectProvider(p) if p.id == "acme"
    ));
    assert_eq!(provider.search.last_args().unwrap()["query"], "Acme Club");
}

#[tokio::test]
async fn full_signup_reaches_completed() {
    let provider = Provider::default();
    let h = harness(&provider).await;
    let m = &h.engine.machine;

    m.handle(say("Acme Club")).await;

    let env = m.handle(press(FlowAction::SelectProvider(acme()))).await;
    assert_eq!(env.step, Step::Login);
    assert_eq!(env.cta[0].action, FlowAction::ConnectAccount);

    let env = m
        .handle(press(FlowAction::CredentialsSaved {
            credential_ref: "cred-1".into(),
        }))
        .await;
    assert_eq!(env.step, Step::IntentCapture, "login succeeds and advances");
    assert_eq!(provider.login.calls(), 1);
    assert_eq!(env.context_updates["login_confirmed"], true);

    let env = m.handle(say("Ski lessons for my 8 year old")).await;
    assert_eq!(env.step, Step::ProgramSelection);
    assert_eq!(env.cards.len(), 2);
    assert_eq!(h.forms.opened(), vec!["https://forms.test/acme-ski/register".to_string()]);
    let args = provider.programs.last_args().unwrap();
    assert_eq!(args["category"], "ski");
    assert_eq!(args["child_age"], 8);
    assert_eq!(args["session_token"], "sess-1");
    assert!(args["mandate"]["signature"].is_string());

    let env = m.handle(press(FlowAction::SelectProgram(ski_level_1()))).await;
    assert_eq!(env.step, Step::FormFill);
    assert!(env.message.contains("email"));
    assert_eq!(env.context_updates["form_answers.age"], "8");

    let env = m.handle(say("parent@example.com")).await;
    assert_eq!(env.step, Step::Confirmation);
    assert!(env.message.contains("Ski Level 1"));
    assert!(env.message.contains("$150.00"));
    assert_eq!(env.cta[0].action, FlowAction::ConfirmRegistration);

    let env = m.handle(press(FlowAction::ConfirmRegistration)).await;
    assert!(env.message.contains("R-100"));
    assert_eq!(env.context_updates["registration"], "R-100");
    assert_eq!(provider.availability.calls(), 1);
    assert_eq!(provider.register.calls(), 1);

    let register_args = provider.register.last_args().unwrap();
    assert_eq!(register_args["answers"]["email"], "parent@example.com");
    assert_eq!(register_args["mandate"]["claims"]["max_amount"], 15000);
    let scope = register_args["mandate"]["claims"]["scope"].as_array().unwrap().clone();
    assert!(scope.contains(&json!("register")));
    assert!(scope.contains(&json!("pay")));

    let env = m.handle(say("thanks!")).await;
    assert_eq!(env.step, Step::Completed);

    let saved = h.engine.store.get(SESSION).await.unwrap().unwrap();
    assert_eq!(saved.registration_ref.as_deref(), Some("R-100"));
    assert_eq!(route("anything", &saved), Step::Completed);
}

/// 推进到确认步骤
async fn reach_confirmation(h: &common::Harness) {
    let m = &h.engine.machine;
    m.handle(press(FlowAction::SelectProvider(acme()))).await;
    m.handle(press(FlowAction::CredentialsSaved {
        credential_ref: "cred-1".into(),
    }))
    .await;
    m.handle(say("ski, she is 8")).await;
    m.handle(press(FlowAction::SelectProgram(ski_level_1()))).await;
    let env = m.handle(say("parent@example.com")).await;
    assert_eq!(env.step, Step::Confirmation);
}

#[tokio::test]
async fn full_program_offers_another_program() {
    let provider = Provider {
        availability: FakeTool::ok(Operation::CheckAvailability, json!({"available": false})),
        ..Provider::default()
    };
    let h = harness(&provider).await;
    reach_confirmation(&h).await;

    let m = &h.engine.machine;
    let env = m.handle(press(FlowAction::ConfirmRegistration)).await;
    assert_eq!(env.recovery, Some(RecoveryAction::ChooseAnotherProgram));
    assert_eq!(env.cta[0].action, FlowAction::ChooseAnotherProgram);
    assert_eq!(provider.register.calls(), 0);

    let env = m.handle(press(FlowAction::ChooseAnotherProgram)).await;
    assert_eq!(env.step, Step::ProgramSelection);
    assert_eq!(env.cards.len(), 2);
}

#[tokio::test]
async fn declined_payment_is_not_retried() {
    let provider = Provider {
        register: FakeTool::ok(
            Operation::Register,
            json!({"success": false, "error": "Card was declined by the issuer"}),
        ),
        ..Provider::default()
    };
    let h = harness(&provider).await;
    reach_confirmation(&h).await;

    let env = h.engine.machine.handle(press(FlowAction::ConfirmRegistration)).await;
    assert_eq!(env.recovery, Some(RecoveryAction::UpdatePayment));
    assert_eq!(provider.register.calls(), 1);
    assert!(!env.message.contains("issuer"));

    let saved = h.engine.store.get(SESSION).await.unwrap().unwrap();
    assert!(saved.registration_ref.is_none());
    assert_eq!(saved.retry_counts.get("confirmation"), Some(&1));
}

#[tokio::test]
async fn repeated_authorization_failure_asks_to_reconnect() {
    let provider = Provider {
        register: FakeTool::op(
            Operation::Register,
            vec![Err(TransportError::Status {
                status: 401,
                body: "mandate rejected".into(),
            })],
        ),
        ..Provider::default()
    };
    let h = harness(&provider).await;
    reach_confirmation(&h).await;

    let before = h.engine.gateway.authority().issued_count();
    let env = h.engine.machine.handle(press(FlowAction::ConfirmRegistration)).await;
    assert_eq!(env.recovery, Some(RecoveryAction::Reconnect));
    assert_eq!(provider.register.calls(), 2, "one refresh-and-retry only");
    assert!(h.engine.gateway.authority().issued_count() > before);
    assert!(!env.message.contains("mandate rejected"));

    let env = h.engine.machine.handle(press(FlowAction::Reconnect)).await;
    assert_eq!(env.step, Step::Confirmation, "reconnect logs in again and resumes where it left off");
    assert_eq!(provider.login.calls(), 2);
}

#[tokio::test]
async fn transient_failures_surface_as_retry_and_keep_state() {
    let provider = Provider {
        programs: FakeTool::op(
            Operation::FindPrograms,
            vec![
                Err(TransportError::Timeout),
                Err(TransportError::Timeout),
                Err(TransportError::Timeout),
                Ok(json!({"programs": [{"id": "p1", "title": "Ski Level 1"}]})),
            ],
        ),
        ..Provider::default()
    };
    let h = harness(&provider).await;
    let m = &h.engine.machine;
    m.handle(press(FlowAction::SelectProvider(acme()))).await;
    m.handle(press(FlowAction::CredentialsSaved {
        credential_ref: "cred-1".into(),
    }))
    .await;

    let env = m.handle(say("swimming for my 6 year old")).await;
    assert_eq!(env.step, Step::ProgramSelection);
    assert_eq!(env.recovery, Some(RecoveryAction::Retry));
    assert_eq!(provider.programs.calls(), 3);

    let saved: SessionContext = h.engine.store.get(SESSION).await.unwrap().unwrap();
    assert_eq!(saved.intent.category.as_deref(), Some("swim"), "earlier steps in the turn are kept");
    assert!(saved.discovered_fields.is_some());
    assert!(saved.mandate.is_some());

    let env = m.handle(press(FlowAction::Retry)).await;
    assert_eq!(env.step, Step::ProgramSelection);
    assert!(env.recovery.is_none());
    assert_eq!(env.cards.len(), 1);
}

#[tokio::test]
async fn unmet_prerequisites_do_not_advance() {
    let provider = Provider {
        prerequisites: FakeTool::op(
            Operation::CheckPrerequisites,
            vec![
                Ok(json!({"membership": false, "waiver": true})),
                Ok(json!({"membership": true, "waiver": true})),
            ],
        ),
        ..Provider::default()
    };
    let h = harness(&provider).await;
    let m = &h.engine.machine;
    m.handle(press(FlowAction::SelectProvider(acme()))).await;
    m.handle(press(FlowAction::CredentialsSaved {
        credential_ref: "cred-1".into(),
    }))
    .await;
    m.handle(say("ski for my 9 year old")).await;

    let env = m.handle(press(FlowAction::SelectProgram(ski_level_1()))).await;
    assert_eq!(env.step, Step::PrerequisiteCheck);
    assert!(env.message.contains("membership"));
    assert_eq!(env.cta[0].action, FlowAction::Retry);

    let env = m.handle(press(FlowAction::Retry)).await;
    assert_eq!(env.step, Step::FormFill);
}

#[tokio::test]
async fn change_provider_message_returns_to_search() {
    let provider = Provider::default();
    let h = harness(&provider).await;
    let m = &h.engine.machine;
    m.handle(press(FlowAction::SelectProvider(acme()))).await;

    let env = m.handle(say("actually I want a different club")).await;
    assert_eq!(env.step, Step::ProviderSearch);
    let saved = h.engine.store.get(SESSION).await.unwrap().unwrap();
    assert!(saved.provider.is_none());
}
