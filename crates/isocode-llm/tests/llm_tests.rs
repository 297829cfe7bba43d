//! Tests for isocode-llm: the scripted mock and call-option plumbing.

use futures::StreamExt;
use isocode_llm::{CallOptions, ChatMessage, LlmError, LlmProvider, MockProvider};

#[tokio::test]
async fn mock_replays_scripted_replies_in_order() {
    let mock = MockProvider::new();
    mock.push_text("first");
    mock.push_text("second");

    let messages = [ChatMessage::new("user", "hi")];
    let options = CallOptions::default();
    assert_eq!(mock.call("m", &messages, &options).await.unwrap().content, "first");
    assert_eq!(mock.call("m", &messages, &options).await.unwrap().content, "second");
    // Exhausted queue yields an empty reply, not an error.
    assert_eq!(mock.call("m", &messages, &options).await.unwrap().content, "");
    assert_eq!(mock.call_count(), 3);
}

#[tokio::test]
async fn mock_fails_configured_models() {
    let mock = MockProvider::new();
    mock.push_text("should not be consumed by the failing model");
    mock.fail_model("broken", "connection refused");

    let messages = [ChatMessage::new("user", "hi")];
    let options = CallOptions::default();
    let err = mock.call("broken", &messages, &options).await.unwrap_err();
    assert!(matches!(err, LlmError::RequestFailed(_)));

    // The queue is intact for healthy models.
    let reply = mock.call("healthy", &messages, &options).await.unwrap();
    assert_eq!(reply.content, "should not be consumed by the failing model");
    assert_eq!(mock.called_models(), vec!["broken", "healthy"]);
}

#[tokio::test]
async fn mock_answers_summaries_out_of_band() {
    let mock = MockProvider::new();
    mock.set_summary_text("the digest");
    mock.push_text("scripted turn");

    let options = CallOptions::default();
    let summary_request = [ChatMessage::new(
        "user",
        "Summarise this agent conversation in 2-4 bullets covering: ...",
    )];
    let reply = mock.call("m", &summary_request, &options).await.unwrap();
    assert_eq!(reply.content, "the digest");

    // The scripted queue was not consumed by the summary call.
    let turn = [ChatMessage::new("user", "next")];
    assert_eq!(mock.call("m", &turn, &options).await.unwrap().content, "scripted turn");
}

#[tokio::test]
async fn mock_stream_yields_one_delta_then_ends() {
    let mock = MockProvider::new();
    mock.push_text("hello world");

    let messages = [ChatMessage::new("user", "hi")];
    let mut stream = mock
        .stream("m", &messages, &CallOptions::default())
        .await
        .unwrap();
    let mut collected = String::new();
    while let Some(delta) = stream.next().await {
        collected.push_str(&delta.unwrap());
    }
    assert_eq!(collected, "hello world");
}

#[tokio::test]
async fn empty_reply_streams_no_chunks() {
    let mock = MockProvider::new();
    mock.push_text("");
    let messages = [ChatMessage::new("user", "hi")];
    let mut stream = mock
        .stream("m", &messages, &CallOptions::default())
        .await
        .unwrap();
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn mock_lists_configured_models() {
    let mock = MockProvider::new();
    mock.set_models(&["alpha", "beta"]);
    let models = mock.list_models().await.unwrap();
    let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["alpha", "beta"]);
    assert!(mock.health().await.ok);
}

#[test]
fn default_call_options() {
    let options = CallOptions::default();
    assert_eq!(options.max_tokens, Some(4_096));
    assert!(!options.expect_json);
    assert!(options.tools.is_none());
}
