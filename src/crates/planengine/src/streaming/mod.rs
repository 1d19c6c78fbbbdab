//! Streaming protocol: newline-framed typed events sent from the request
//! handler to the client while a task executes (spec.md §4.11).
//!
//! Grounded on `original_source/app/controller/streaming_protocol.py`: a
//! fixed set of single-character event codes, each event a `"<code>:<json
//! body>\n"` line, encoded with `serde_json`'s compact separators to match
//! `json.dumps(..., separators=(",", ":"))`. The producer/consumer pairing
//! below is grounded on the orchestrator's `ExecutionStreamHandler`
//! (`execution/streaming.rs`): an mpsc channel carries events from a worker
//! running the VM step to whatever is draining the HTTP response, with an
//! atomic flag marking the stream closed once a terminal event ships.

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// The fixed set of wire event codes (spec.md §4.11 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    TextPart,
    DataPart,
    ErrorPart,
    MessageAnnotation,
    ToolCall,
    ToolResult,
    StepFinish,
    FinishMessage,
}

impl EventType {
    fn code(self) -> &'static str {
        match self {
            EventType::TextPart => "0",
            EventType::DataPart => "2",
            EventType::ErrorPart => "3",
            EventType::MessageAnnotation => "8",
            EventType::ToolCall => "9",
            EventType::ToolResult => "a",
            EventType::StepFinish => "e",
            EventType::FinishMessage => "d",
        }
    }
}

/// Token usage reported on `step finish` and `finish message` events.
/// Neither the VM nor any tool meters tokens today, so both fields are
/// always zero; the shape is kept so a future usage source can populate it.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    #[serde(rename = "promptTokens")]
    pub prompt_tokens: u64,
    #[serde(rename = "completionTokens")]
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
struct ToolCallPayload<'a> {
    #[serde(rename = "toolCallId")]
    tool_call_id: &'a str,
    #[serde(rename = "toolName")]
    tool_name: &'a str,
    args: &'a Value,
}

#[derive(Debug, Clone, Serialize)]
struct ToolResultPayload<'a> {
    #[serde(rename = "toolCallId")]
    tool_call_id: &'a str,
    result: &'a Value,
}

#[derive(Debug, Clone, Serialize)]
struct StepFinishPayload {
    step: i64,
    #[serde(rename = "finishReason")]
    finish_reason: String,
    usage: Usage,
}

#[derive(Debug, Clone, Serialize)]
struct FinishMessagePayload {
    #[serde(rename = "finishReason")]
    finish_reason: String,
    usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<Value>,
}

/// One `{task_id, branch, seq_no, state}` entry of a message-annotation
/// event's payload array.
#[derive(Debug, Clone, Serialize)]
pub struct StateAnnotation {
    pub task_id: String,
    pub branch: String,
    pub seq_no: i64,
    pub state: Value,
}

/// One encoded wire event: `"<code>:<json>\n"`, matching
/// `ExecutionEvent.encode()` in the original controller.
#[derive(Debug, Clone)]
pub struct WireEvent {
    event_type: EventType,
    body: String,
}

impl WireEvent {
    fn new(event_type: EventType, payload: &impl Serialize) -> Self {
        let body = serde_json::to_string(payload).unwrap_or_else(|_| "null".to_string());
        Self { event_type, body }
    }

    /// Renders the line as it goes on the wire, newline included.
    pub fn to_line(&self) -> String {
        format!("{}:{}\n", self.event_type.code(), self.body)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.to_line().into_bytes()
    }
}

/// Builds [`WireEvent`]s for each of the eight event kinds. Stateless: every
/// method is a pure encoder, kept separate from the channel plumbing in
/// [`StreamHandle`] so the encoding can be unit tested without an executor.
pub struct StreamingProtocol;

impl StreamingProtocol {
    pub fn text_part(text: &str) -> WireEvent {
        WireEvent::new(EventType::TextPart, &text)
    }

    pub fn data_part(data: &Value) -> WireEvent {
        WireEvent::new(EventType::DataPart, data)
    }

    pub fn error_part(message: &str) -> WireEvent {
        WireEvent::new(EventType::ErrorPart, &message)
    }

    pub fn annotation(states: &[StateAnnotation]) -> WireEvent {
        WireEvent::new(EventType::MessageAnnotation, &states)
    }

    pub fn tool_call(tool_call_id: &str, tool_name: &str, args: &Value) -> WireEvent {
        WireEvent::new(EventType::ToolCall, &ToolCallPayload { tool_call_id, tool_name, args })
    }

    pub fn tool_result(tool_call_id: &str, result: &Value) -> WireEvent {
        WireEvent::new(EventType::ToolResult, &ToolResultPayload { tool_call_id, result })
    }

    pub fn step_finish(step: i64, finish_reason: impl Into<String>) -> WireEvent {
        WireEvent::new(
            EventType::StepFinish,
            &StepFinishPayload { step, finish_reason: finish_reason.into(), usage: Usage::default() },
        )
    }

    pub fn finish_message(finish_reason: impl Into<String>, response: Option<Value>) -> WireEvent {
        WireEvent::new(
            EventType::FinishMessage,
            &FinishMessagePayload { finish_reason: finish_reason.into(), usage: Usage::default(), response },
        )
    }
}

/// How long the consumer side waits on an empty queue before checking
/// whether the producer has finished (spec.md §4.11: "drains the queue
/// with a 1-second poll").
pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// The producer side of the stream_queue pairing: owned by the worker
/// running the one VM step whose output contributes to `final_answer`. The
/// LLM-generation tool forwards each text chunk here as it is produced.
#[derive(Clone)]
pub struct StreamProducer {
    sender: mpsc::UnboundedSender<String>,
}

impl StreamProducer {
    pub fn send_chunk(&self, chunk: impl Into<String>) {
        // The only failure mode is the consumer having already dropped the
        // queue (client disconnected or the poll loop gave up); there is no
        // useful recovery, so the chunk is silently dropped.
        let _ = self.sender.send(chunk.into());
    }
}

/// The consumer side: held by the request handler, which polls it at
/// [`POLL_INTERVAL`] while the producer's worker thread runs, emitting a
/// text-part event for every chunk received.
pub struct StreamConsumer {
    receiver: mpsc::UnboundedReceiver<String>,
    producer_done: std::sync::Arc<AtomicBool>,
}

impl StreamConsumer {
    /// Polls for the next chunk, waking at most every [`POLL_INTERVAL`] to
    /// re-check whether the producer has finished. Returns `None` once the
    /// producer is done and the queue is drained.
    pub async fn poll_next(&mut self) -> Option<String> {
        loop {
            match tokio::time::timeout(POLL_INTERVAL, self.receiver.recv()).await {
                Ok(Some(chunk)) => return Some(chunk),
                Ok(None) => return None,
                Err(_elapsed) => {
                    if self.producer_done.load(Ordering::Acquire) {
                        // Drain whatever arrived in the same instant the
                        // producer finished before giving up.
                        return self.receiver.try_recv().ok();
                    }
                }
            }
        }
    }

    pub fn is_producer_done(&self) -> bool {
        self.producer_done.load(Ordering::Acquire)
    }
}

/// Marks the producer side done; dropped automatically once the worker
/// task that created it goes out of scope, but callers finish explicitly so
/// the consumer does not have to wait out a full poll interval to notice.
pub struct ProducerDoneGuard(std::sync::Arc<AtomicBool>);

impl ProducerDoneGuard {
    pub fn mark_done(self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Creates a paired producer/consumer for one step's streamed output.
pub fn stream_queue() -> (StreamProducer, StreamConsumer, ProducerDoneGuard) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let producer_done = std::sync::Arc::new(AtomicBool::new(false));
    (
        StreamProducer { sender },
        StreamConsumer { receiver, producer_done: producer_done.clone() },
        ProducerDoneGuard(producer_done),
    )
}

/// Splits `text` into sentence-terminated chunks, used when `final_answer`
/// was never streamed chunk-by-chunk and has to be emitted as text-parts
/// after the fact (spec.md §4.11).
pub fn split_into_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            sentences.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        sentences.push(current);
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_part_encodes_as_code_zero() {
        let event = StreamingProtocol::text_part("hello");
        assert_eq!(event.to_line(), "0:\"hello\"\n");
    }

    #[test]
    fn data_part_encodes_arbitrary_json() {
        let event = StreamingProtocol::data_part(&json!({"foo": "bar"}));
        assert_eq!(event.to_line(), "2:{\"foo\":\"bar\"}\n");
    }

    #[test]
    fn error_part_encodes_as_code_three() {
        let event = StreamingProtocol::error_part("boom");
        assert_eq!(event.to_line(), "3:\"boom\"\n");
    }

    #[test]
    fn annotation_wraps_state_entries_in_an_array() {
        let event = StreamingProtocol::annotation(&[StateAnnotation {
            task_id: "t1".into(),
            branch: "main".into(),
            seq_no: 2,
            state: json!({"x": 1}),
        }]);
        assert_eq!(
            event.to_line(),
            "8:[{\"task_id\":\"t1\",\"branch\":\"main\",\"seq_no\":2,\"state\":{\"x\":1}}]\n"
        );
    }

    #[test]
    fn tool_call_encodes_expected_shape() {
        let event = StreamingProtocol::tool_call("call-1", "search", &json!({"q": "rust"}));
        assert_eq!(
            event.to_line(),
            "9:{\"toolCallId\":\"call-1\",\"toolName\":\"search\",\"args\":{\"q\":\"rust\"}}\n"
        );
    }

    #[test]
    fn tool_result_encodes_expected_shape() {
        let event = StreamingProtocol::tool_result("call-1", &json!({"ok": true}));
        assert_eq!(event.to_line(), "a:{\"toolCallId\":\"call-1\",\"result\":{\"ok\":true}}\n");
    }

    #[test]
    fn step_finish_carries_zeroed_usage() {
        let event = StreamingProtocol::step_finish(3, "stop");
        assert_eq!(
            event.to_line(),
            "e:{\"step\":3,\"finishReason\":\"stop\",\"usage\":{\"promptTokens\":0,\"completionTokens\":0}}\n"
        );
    }

    #[test]
    fn finish_message_omits_response_when_absent() {
        let event = StreamingProtocol::finish_message("stop", None);
        assert_eq!(
            event.to_line(),
            "d:{\"finishReason\":\"stop\",\"usage\":{\"promptTokens\":0,\"completionTokens\":0}}\n"
        );
    }

    #[test]
    fn finish_message_includes_response_when_present() {
        let event = StreamingProtocol::finish_message("stop", Some(json!("the answer")));
        assert!(event.to_line().contains("\"response\":\"the answer\""));
    }

    #[tokio::test]
    async fn consumer_receives_chunks_sent_by_the_producer() {
        let (producer, mut consumer, done) = stream_queue();
        producer.send_chunk("hello ");
        producer.send_chunk("world");
        done.mark_done();

        assert_eq!(consumer.poll_next().await, Some("hello ".to_string()));
        assert_eq!(consumer.poll_next().await, Some("world".to_string()));
        assert_eq!(consumer.poll_next().await, None);
    }

    #[tokio::test]
    async fn consumer_stops_once_producer_marks_done_and_queue_drains() {
        let (_producer, mut consumer, done) = stream_queue();
        done.mark_done();
        assert_eq!(consumer.poll_next().await, None);
        assert!(consumer.is_producer_done());
    }

    #[test]
    fn split_into_sentences_keeps_terminators_attached() {
        let sentences = split_into_sentences("First sentence. Second one! Third?");
        assert_eq!(sentences, vec!["First sentence.", " Second one!", " Third?"]);
    }

    #[test]
    fn split_into_sentences_keeps_trailing_fragment() {
        let sentences = split_into_sentences("No terminator here");
        assert_eq!(sentences, vec!["No terminator here".to_string()]);
    }
}
