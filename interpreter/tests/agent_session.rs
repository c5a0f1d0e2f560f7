//! Whole-task scenarios through the public agent API with a scripted model.

use std::sync::Arc;

use interpreter::agent::InterpreterAgent;
use interpreter::core::followup::FollowUp;
use interpreter::core::types::Role;
use interpreter::io::backend::ChatReply;
use interpreter::io::config::Settings;
use interpreter::io::registry::RUN_CANCELLED;
use interpreter::task::{TaskOutcome, TaskStop};
use interpreter::test_support::{ScriptedBackend, ScriptedHost, WordCounter, execute_reply, text_reply};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn python_available() -> bool {
    which::which("python3").is_ok() || which::which("python").is_ok()
}

macro_rules! require_python {
    () => {
        if !python_available() {
            eprintln!("skipping: python not found on PATH");
            return;
        }
    };
}

fn agent(
    function_calling: bool,
    auto_execution: bool,
    replies: Vec<ChatReply>,
) -> (InterpreterAgent, Arc<ScriptedBackend>) {
    let backend = Arc::new(ScriptedBackend::new(replies));
    let settings = Settings {
        function_calling: Some(function_calling),
        auto_execution,
        ..Settings::default()
    };
    let agent = InterpreterAgent::from_settings(settings, backend.clone(), Arc::new(WordCounter))
        .expect("agent");
    (agent, backend)
}

/// Verifies a successful run feeds its output back, and a repeated block is
/// answered with the same-error prompt instead of a second run.
#[tokio::test]
async fn repeated_code_gets_same_error_prompt() {
    require_python!();
    let block = "```python\nprint(6 * 7)\n```";
    let (mut agent, backend) = agent(
        false,
        true,
        vec![
            text_reply(block),
            text_reply(block),
            text_reply("The task is done."),
        ],
    );
    let host = ScriptedHost::new(Vec::new());

    let outcome = agent
        .chat("what is six times seven", &host, &CancellationToken::new())
        .await
        .expect("chat");
    agent.shutdown().await;

    assert_eq!(
        outcome,
        TaskOutcome {
            turns: 3,
            stop: TaskStop::NoCode
        }
    );
    let requests = backend.requests();
    let last_content = |index: usize| {
        requests[index]
            .messages
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default()
    };
    assert_eq!(last_content(1), FollowUp::OutputTextBased.render("42\n"));
    assert_eq!(last_content(2), FollowUp::SameError.template());
    assert_eq!(host.rendered().matches("python output:").count(), 1);
}

#[tokio::test]
async fn function_call_output_goes_to_tool_message() {
    require_python!();
    let (mut agent, backend) = agent(
        true,
        true,
        vec![
            execute_reply("call_a", "python", "print('done')"),
            text_reply("The task is done."),
        ],
    );
    let host = ScriptedHost::new(Vec::new());

    let outcome = agent
        .chat("say done", &host, &CancellationToken::new())
        .await
        .expect("chat");
    agent.shutdown().await;

    assert_eq!(outcome.turns, 2);
    let requests = backend.requests();
    let messages = &requests[1].messages;
    let tool = &messages[messages.len() - 2];
    assert_eq!(tool.role, Role::Tool);
    assert_eq!(tool.tool_call_id.as_deref(), Some("call_a"));
    assert_eq!(tool.content, "done\n");
    assert_eq!(
        messages[messages.len() - 1].content,
        FollowUp::OutputFunctionBased.template()
    );
}

/// Verifies that declining the first proposal ends the task after one turn
/// without starting any interpreter.
#[tokio::test]
async fn declined_proposal_ends_task() {
    let (mut agent, backend) = agent(
        false,
        false,
        vec![text_reply("```python\nimport shutil\nshutil.rmtree('build')\n```")],
    );
    let host = ScriptedHost::new(vec![false]);

    let outcome = agent
        .chat("clean the build directory", &host, &CancellationToken::new())
        .await
        .expect("chat");

    assert_eq!(
        outcome,
        TaskOutcome {
            turns: 1,
            stop: TaskStop::Declined
        }
    );
    assert_eq!(backend.requests().len(), 1);
    assert!(!host.rendered().contains("python output:"));
}

/// Verifies an interrupted run stops the task like a cancel and tells the
/// model the run was cancelled.
#[tokio::test]
async fn interrupted_run_stops_the_task() {
    require_python!();
    let (mut agent, backend) = agent(
        false,
        true,
        vec![
            text_reply("```python\nraise KeyboardInterrupt\n```"),
            text_reply("unused"),
        ],
    );
    let host = ScriptedHost::new(Vec::new());

    let outcome = agent
        .chat("wait for a while", &host, &CancellationToken::new())
        .await
        .expect("chat");
    agent.shutdown().await;

    assert_eq!(
        outcome,
        TaskOutcome {
            turns: 1,
            stop: TaskStop::Cancelled
        }
    );
    assert_eq!(backend.requests().len(), 1);
    let last = agent.history().last().expect("history");
    assert_eq!(last.role, Role::User);
    assert_eq!(last.content, RUN_CANCELLED);
    assert!(host.rendered().contains(RUN_CANCELLED));
}

/// Verifies an interrupted first call stops the task and every call id still
/// gets its tool message.
#[tokio::test]
async fn interrupted_call_answers_every_tool_call() {
    require_python!();
    let mut reply = execute_reply("call_1", "python", "raise KeyboardInterrupt");
    reply
        .tool_calls
        .extend(execute_reply("call_2", "python", "print(2)").tool_calls);
    let (mut agent, backend) = agent(true, true, vec![reply, text_reply("unused")]);
    let host = ScriptedHost::new(Vec::new());

    let outcome = agent
        .chat("run both", &host, &CancellationToken::new())
        .await
        .expect("chat");
    agent.shutdown().await;

    assert_eq!(outcome.stop, TaskStop::Cancelled);
    assert_eq!(outcome.turns, 1);
    assert_eq!(backend.requests().len(), 1);
    let tools: Vec<(Option<&str>, &str)> = agent
        .history()
        .iter()
        .filter(|message| message.role == Role::Tool)
        .map(|message| (message.tool_call_id.as_deref(), message.content.as_str()))
        .collect();
    assert_eq!(
        tools,
        vec![
            (Some("call_1"), RUN_CANCELLED),
            (Some("call_2"), RUN_CANCELLED),
        ]
    );
    assert!(!host.rendered().contains("python output:"));
}

#[tokio::test]
async fn history_starts_with_three_system_messages() {
    let (mut agent, _backend) = agent(true, false, vec![text_reply("Hello!")]);
    let host = ScriptedHost::new(Vec::new());

    agent
        .chat("hi", &host, &CancellationToken::new())
        .await
        .expect("chat");

    let system = agent
        .history()
        .iter()
        .take_while(|message| message.role == Role::System)
        .count();
    assert_eq!(system, 3);
    assert!(agent.history()[0].content.contains("- **python**: "));
}
