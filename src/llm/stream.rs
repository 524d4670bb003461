//! Streaming model and the accumulator that turns vendor events into
//! [`StreamChunk`]s.
//!
//! Adapters never mutate response state from callbacks. A reader thread decodes
//! vendor lines into [`StreamEvent`]s and sends them over a channel; a single
//! [`StreamAccumulator`] on the caller's thread consumes them in order.

use super::{ToolArguments, ToolCall, Usage};
use crate::error::ProviderError;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io::BufRead;
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::{debug, warn};

/// Client-facing chunk callback. Cheap to clone; shared across stages.
#[derive(Clone)]
pub struct StreamCallback(Arc<dyn Fn(&StreamChunk) + Send + Sync>);

impl StreamCallback {
    pub fn new(f: impl Fn(&StreamChunk) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, chunk: &StreamChunk) {
        (self.0)(chunk)
    }
}

impl fmt::Debug for StreamCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamCallback")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPhase {
    Start,
    Update,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolExecutionInfo {
    pub phase: ToolPhase,
    pub tool: ToolInvocation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolExecutionInfo {
    fn new(phase: ToolPhase, name: &str, arguments: Value) -> Self {
        Self {
            phase,
            tool: ToolInvocation {
                name: name.to_string(),
                arguments,
            },
            result: None,
            error: None,
        }
    }

    pub fn start(name: &str, arguments: Value) -> Self {
        Self::new(ToolPhase::Start, name, arguments)
    }

    pub fn update(name: &str, arguments: Value) -> Self {
        Self::new(ToolPhase::Update, name, arguments)
    }

    pub fn complete(name: &str, arguments: Value, result: Option<Value>) -> Self {
        Self {
            result,
            ..Self::new(ToolPhase::Complete, name, arguments)
        }
    }

    pub fn error(name: &str, error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(ToolPhase::Error, name, Value::Object(Default::default()))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamChunk {
    pub text: String,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_execution: Option<ToolExecutionInfo>,
}

impl StreamChunk {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn final_text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            done: true,
            ..Default::default()
        }
    }

    pub fn status(info: ToolExecutionInfo) -> Self {
        Self {
            tool_execution: Some(info),
            ..Default::default()
        }
    }
}

/// One decoded vendor event. Tool-call fragments are keyed by the vendor's
/// identifier for the call (or its index when that is all the vendor repeats).
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ThinkingDelta(String),
    ToolCallStart {
        key: String,
        id: Option<String>,
        name: Option<String>,
    },
    ToolCallDelta {
        key: String,
        arguments: String,
    },
    ToolCallEnd {
        key: String,
    },
    /// The vendor's authoritative full message text.
    FinalMessage(String),
    Usage(Usage),
    Error(String),
    Done,
}

#[derive(Debug)]
struct PartialToolCall {
    key: String,
    id: Option<String>,
    name: String,
    arguments: String,
    completed: bool,
}

impl PartialToolCall {
    fn to_tool_call(&self) -> ToolCall {
        let id = self.id.clone().unwrap_or_else(|| self.key.clone());
        let arguments = if self.arguments.trim().is_empty() {
            ToolArguments::empty()
        } else {
            ToolArguments::Raw(self.arguments.clone())
        };
        ToolCall::new(&id, &self.name, arguments)
    }

    fn arguments_value(&self) -> Value {
        serde_json::from_str(&self.arguments)
            .unwrap_or_else(|_| Value::String(self.arguments.clone()))
    }
}

/// Everything a finished stream produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutcome {
    pub text: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    final_text: Option<String>,
    thinking: String,
    calls: Vec<PartialToolCall>,
    index: HashMap<String, usize>,
    usage: Option<Usage>,
    finished: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Full text so far. The vendor's final message wins over deltas.
    pub fn text(&self) -> &str {
        match &self.final_text {
            Some(text) if !text.is_empty() => text,
            _ => &self.text,
        }
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.calls
            .iter()
            .filter(|c| !c.name.trim().is_empty())
            .map(PartialToolCall::to_tool_call)
            .collect()
    }

    fn slot(&mut self, key: &str) -> &mut PartialToolCall {
        let pos = match self.index.get(key) {
            Some(&pos) => pos,
            None => {
                self.calls.push(PartialToolCall {
                    key: key.to_string(),
                    id: None,
                    name: String::new(),
                    arguments: String::new(),
                    completed: false,
                });
                let pos = self.calls.len() - 1;
                self.index.insert(key.to_string(), pos);
                pos
            }
        };
        &mut self.calls[pos]
    }

    /// Applies one event and returns the chunks it produces, in order.
    pub fn apply(&mut self, event: StreamEvent) -> Result<Vec<StreamChunk>, ProviderError> {
        if self.finished {
            return Ok(vec![]);
        }

        match event {
            StreamEvent::TextDelta(delta) => {
                if delta.is_empty() {
                    return Ok(vec![]);
                }
                self.text.push_str(&delta);
                Ok(vec![StreamChunk::text(&delta)])
            }
            StreamEvent::ThinkingDelta(delta) => {
                self.thinking.push_str(&delta);
                Ok(vec![StreamChunk {
                    thinking: Some(delta),
                    ..Default::default()
                }])
            }
            StreamEvent::ToolCallStart { key, id, name } => {
                let slot = self.slot(&key);
                if id.is_some() {
                    slot.id = id;
                }
                if let Some(name) = name {
                    slot.name = name;
                }
                if slot.name.is_empty() {
                    return Ok(vec![]);
                }
                let info = ToolExecutionInfo::start(&slot.name, Value::Object(Default::default()));
                Ok(vec![StreamChunk::status(info)])
            }
            StreamEvent::ToolCallDelta { key, arguments } => {
                let slot = self.slot(&key);
                slot.arguments.push_str(&arguments);
                let info =
                    ToolExecutionInfo::update(&slot.name, Value::String(slot.arguments.clone()));
                Ok(vec![StreamChunk::status(info)])
            }
            StreamEvent::ToolCallEnd { key } => Ok(self.complete_call(&key).into_iter().collect()),
            StreamEvent::FinalMessage(text) => {
                self.final_text = Some(text);
                Ok(vec![])
            }
            StreamEvent::Usage(usage) => {
                self.usage = Some(usage);
                Ok(vec![])
            }
            StreamEvent::Error(message) => {
                self.finished = true;
                Err(ProviderError::Stream(message))
            }
            StreamEvent::Done => Ok(self.finish()),
        }
    }

    fn complete_call(&mut self, key: &str) -> Option<StreamChunk> {
        let pos = *self.index.get(key)?;
        let call = &mut self.calls[pos];
        if call.completed || call.name.trim().is_empty() {
            return None;
        }
        call.completed = true;
        let info = ToolExecutionInfo::complete(&call.name, call.arguments_value(), None);
        let snapshot = self.tool_calls();
        Some(StreamChunk {
            tool_calls: Some(snapshot),
            ..StreamChunk::status(info)
        })
    }

    /// Completes any open tool calls and emits the terminal chunk. Calling it
    /// again yields nothing.
    pub fn finish(&mut self) -> Vec<StreamChunk> {
        if self.finished {
            return vec![];
        }
        let open: Vec<String> = self
            .calls
            .iter()
            .filter(|c| !c.completed)
            .map(|c| c.key.clone())
            .collect();
        let mut chunks: Vec<StreamChunk> =
            open.iter().filter_map(|key| self.complete_call(key)).collect();

        self.finished = true;
        let tool_calls = self.tool_calls();
        chunks.push(StreamChunk {
            done: true,
            usage: self.usage,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            ..Default::default()
        });
        chunks
    }

    pub fn into_outcome(self) -> StreamOutcome {
        StreamOutcome {
            text: self.text().to_string(),
            thinking: if self.thinking.is_empty() {
                None
            } else {
                Some(self.thinking.clone())
            },
            tool_calls: self.tool_calls(),
            usage: self.usage,
        }
    }
}

/// Turns vendor wire lines into events. Stateful per stream.
pub trait LineDecoder: Send {
    fn decode(&mut self, line: &str) -> Vec<StreamEvent>;

    /// Called once at end of input.
    fn finish(&mut self) -> Vec<StreamEvent> {
        vec![]
    }
}

type Producer = Box<dyn FnOnce(mpsc::Sender<StreamEvent>) + Send>;

/// A response body that has not been read yet.
pub struct PendingStream {
    producer: Producer,
}

impl fmt::Debug for PendingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PendingStream { .. }")
    }
}

impl PendingStream {
    /// Replays a fixed event sequence. Used to synthesize a client-facing stream
    /// from a complete response.
    pub fn from_events(events: Vec<StreamEvent>) -> Self {
        Self {
            producer: Box::new(move |tx| {
                for event in events {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }),
        }
    }

    pub fn from_lines<R, D>(reader: R, mut decoder: D) -> Self
    where
        R: BufRead + Send + 'static,
        D: LineDecoder + 'static,
    {
        Self {
            producer: Box::new(move |tx| {
                for line in reader.lines() {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            let _ = tx.send(StreamEvent::Error(format!(
                                "Failed to read stream: {}",
                                e
                            )));
                            return;
                        }
                    };
                    for event in decoder.decode(&line) {
                        if tx.send(event).is_err() {
                            debug!("stream consumer went away; stopping reader");
                            return;
                        }
                    }
                }
                for event in decoder.finish() {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }),
        }
    }

    /// Reads the stream to its terminal event, handing each chunk to `on_chunk`
    /// in emission order. The final chunk passed to `on_chunk` has `done = true`.
    pub fn drive(
        self,
        on_chunk: &mut dyn FnMut(&StreamChunk),
    ) -> Result<StreamOutcome, ProviderError> {
        let (tx, rx) = mpsc::channel();
        let producer = self.producer;
        thread::Builder::new()
            .name("chatloom-stream".to_string())
            .spawn(move || producer(tx))
            .map_err(|e| ProviderError::Stream(format!("Failed to start stream reader: {}", e)))?;

        let mut acc = StreamAccumulator::new();
        for event in rx.iter() {
            for chunk in acc.apply(event)? {
                on_chunk(&chunk);
            }
            if acc.is_finished() {
                break;
            }
        }

        if !acc.is_finished() {
            warn!("stream ended without a terminal event");
            for chunk in acc.finish() {
                on_chunk(&chunk);
            }
        }

        Ok(acc.into_outcome())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn collect(stream: PendingStream) -> (Vec<StreamChunk>, StreamOutcome) {
        let mut chunks = Vec::new();
        let outcome = stream.drive(&mut |c| chunks.push(c.clone())).unwrap();
        (chunks, outcome)
    }

    #[test]
    fn test_text_deltas_in_order() {
        let stream = PendingStream::from_events(vec![
            StreamEvent::TextDelta("Hel".to_string()),
            StreamEvent::TextDelta("lo".to_string()),
            StreamEvent::Done,
        ]);
        let (chunks, outcome) = collect(stream);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "Hel");
        assert_eq!(chunks[1].text, "lo");
        assert!(chunks[2].done);
        assert_eq!(outcome.text, "Hello");
        assert!(outcome.tool_calls.is_empty());
    }

    #[test]
    fn test_final_message_preferred_over_deltas() {
        let stream = PendingStream::from_events(vec![
            StreamEvent::TextDelta("partial".to_string()),
            StreamEvent::FinalMessage("the full answer".to_string()),
            StreamEvent::Done,
        ]);
        let (_, outcome) = collect(stream);
        assert_eq!(outcome.text, "the full answer");
    }

    #[test]
    fn test_empty_final_message_falls_back_to_deltas() {
        let mut acc = StreamAccumulator::new();
        acc.apply(StreamEvent::TextDelta("abc".to_string())).unwrap();
        acc.apply(StreamEvent::FinalMessage(String::new())).unwrap();
        assert_eq!(acc.text(), "abc");
    }

    #[test]
    fn test_tool_call_lifecycle_events() {
        let mut acc = StreamAccumulator::new();
        let start = acc
            .apply(StreamEvent::ToolCallStart {
                key: "call_1".to_string(),
                id: Some("call_1".to_string()),
                name: Some("read_note".to_string()),
            })
            .unwrap();
        assert_eq!(start.len(), 1);
        assert_eq!(
            start[0].tool_execution.as_ref().unwrap().phase,
            ToolPhase::Start
        );

        let update = acc
            .apply(StreamEvent::ToolCallDelta {
                key: "call_1".to_string(),
                arguments: "{\"id\":".to_string(),
            })
            .unwrap();
        assert_eq!(
            update[0].tool_execution.as_ref().unwrap().phase,
            ToolPhase::Update
        );
        acc.apply(StreamEvent::ToolCallDelta {
            key: "call_1".to_string(),
            arguments: "\"n1\"}".to_string(),
        })
        .unwrap();

        let complete = acc
            .apply(StreamEvent::ToolCallEnd {
                key: "call_1".to_string(),
            })
            .unwrap();
        assert_eq!(complete.len(), 1);
        let info = complete[0].tool_execution.as_ref().unwrap();
        assert_eq!(info.phase, ToolPhase::Complete);
        assert_eq!(info.tool.arguments, json!({"id": "n1"}));
        assert_eq!(complete[0].tool_calls.as_ref().unwrap().len(), 1);

        // A second end for the same key is ignored.
        let again = acc
            .apply(StreamEvent::ToolCallEnd {
                key: "call_1".to_string(),
            })
            .unwrap();
        assert!(again.is_empty());

        let calls = acc.tool_calls();
        assert_eq!(calls[0].id(), "call_1");
        assert_eq!(calls[0].name(), "read_note");
        assert_eq!(
            calls[0].arguments(),
            Some(&ToolArguments::Raw("{\"id\":\"n1\"}".to_string()))
        );
    }

    #[test]
    fn test_interleaved_tool_calls_keyed_separately() {
        let stream = PendingStream::from_events(vec![
            StreamEvent::ToolCallStart {
                key: "0".to_string(),
                id: Some("a".to_string()),
                name: Some("list_notes".to_string()),
            },
            StreamEvent::ToolCallStart {
                key: "1".to_string(),
                id: Some("b".to_string()),
                name: Some("search_notes".to_string()),
            },
            StreamEvent::ToolCallDelta {
                key: "1".to_string(),
                arguments: "{\"query\":\"x\"}".to_string(),
            },
            StreamEvent::Done,
        ]);
        let (chunks, outcome) = collect(stream);
        assert_eq!(outcome.tool_calls.len(), 2);
        assert_eq!(outcome.tool_calls[0].id(), "a");
        assert_eq!(outcome.tool_calls[0].arguments(), Some(&ToolArguments::empty()));
        assert_eq!(outcome.tool_calls[1].id(), "b");

        // Open calls are completed before the terminal chunk.
        let completes = chunks
            .iter()
            .filter(|c| {
                c.tool_execution
                    .as_ref()
                    .is_some_and(|t| t.phase == ToolPhase::Complete)
            })
            .count();
        assert_eq!(completes, 2);
        let last = chunks.last().unwrap();
        assert!(last.done);
        assert_eq!(last.tool_calls.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_error_event_aborts() {
        let stream = PendingStream::from_events(vec![
            StreamEvent::TextDelta("a".to_string()),
            StreamEvent::Error("overloaded".to_string()),
        ]);
        let mut seen = 0;
        let err = stream.drive(&mut |_| seen += 1).unwrap_err();
        assert!(matches!(err, ProviderError::Stream(ref m) if m == "overloaded"));
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_missing_terminal_event_still_finishes() {
        let stream = PendingStream::from_events(vec![StreamEvent::TextDelta("x".to_string())]);
        let (chunks, outcome) = collect(stream);
        assert!(chunks.last().unwrap().done);
        assert_eq!(outcome.text, "x");
    }

    #[test]
    fn test_events_after_done_are_ignored() {
        let mut acc = StreamAccumulator::new();
        acc.apply(StreamEvent::Done).unwrap();
        let chunks = acc.apply(StreamEvent::TextDelta("late".to_string())).unwrap();
        assert!(chunks.is_empty());
        assert!(acc.finish().is_empty());
        assert_eq!(acc.text(), "");
    }

    struct WordDecoder;

    impl LineDecoder for WordDecoder {
        fn decode(&mut self, line: &str) -> Vec<StreamEvent> {
            if line == "END" {
                vec![StreamEvent::Done]
            } else {
                vec![StreamEvent::TextDelta(line.to_string())]
            }
        }
    }

    #[test]
    fn test_from_lines_uses_decoder() {
        let reader = Cursor::new("a\nb\nEND\nignored\n");
        let (chunks, outcome) = collect(PendingStream::from_lines(reader, WordDecoder));
        assert_eq!(outcome.text, "ab");
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn test_usage_reported_on_terminal_chunk() {
        let stream = PendingStream::from_events(vec![
            StreamEvent::Usage(Usage::new(3, 4)),
            StreamEvent::Done,
        ]);
        let (chunks, outcome) = collect(stream);
        assert_eq!(chunks.last().unwrap().usage, Some(Usage::new(3, 4)));
        assert_eq!(outcome.usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn test_callback_invocation() {
        use std::sync::Mutex;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb = StreamCallback::new(move |c| sink.lock().unwrap().push(c.text.clone()));
        cb.call(&StreamChunk::text("one"));
        cb.clone().call(&StreamChunk::final_text("two"));
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
        assert_eq!(format!("{:?}", cb), "StreamCallback");
    }
}
