//! Incremental extraction of tool calls from streaming model output.
//!
//! The model answers with `{"toolCalls":[{"name":..,"arguments":{..}}, ..]}`
//! text that arrives in arbitrary chunks and may be cut off. The parser scans
//! every byte exactly once and reports each call the moment its closing brace
//! is seen, plus partial values of selected string arguments while they are
//! still being written.

mod glob;
pub mod repair;
mod stream;
mod unescape;

#[cfg(test)]
mod tests;

pub use glob::compile_glob;
pub use stream::parse_tool_call_stream;

use crate::llm::ToolCall;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use unescape::{decode_json_string, Unescaper};

/// Keys naming the tool inside a call object.
const NAME_KEYS: [&str; 3] = ["name", "function", "tool"];
/// Keys holding the tool's arguments.
const ARG_KEYS: [&str; 4] = ["arguments", "parameters", "params", "args"];
/// Keys of the array that holds the calls.
const ARRAY_KEYS: [&str; 2] = ["toolCalls", "tool_calls"];
/// Argument always accumulated, whatever is tracked.
pub const ENTITY_KEY_ARGUMENT: &str = "entityKey";

/// `(tool, argument)` glob pair whose string values are streamed as deltas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedArgument {
    pub tool: String,
    pub argument: String,
}

impl TrackedArgument {
    pub fn new(tool: impl Into<String>, argument: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            argument: argument.into(),
        }
    }
}

struct CompiledTrack {
    tool: Regex,
    argument: Regex,
}

/// A fully received tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    /// Ordinal of the call in the stream.
    pub index: usize,
    /// Source text of the call object, exactly as received (or as repaired
    /// by [`ToolCallParser::finalize`]).
    pub raw: String,
    pub call: ToolCall,
}

/// New text of a tracked string argument.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub tool_name: String,
    pub argument_key: String,
    /// Decoded value received so far.
    pub value: String,
    /// Decoded text added since the previous delta.
    pub new_text: String,
    /// `entityKey` argument of the same call, if seen yet.
    pub entity_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    Delta(ToolCallDelta),
    Completed(ParsedToolCall),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Object,
    Array,
}

/// What the string currently being scanned is.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StringRole {
    Key,
    Value(String),
    Element,
}

/// The call object currently being received.
#[derive(Debug)]
struct OpenCall {
    index: usize,
    start: usize,
    /// Nesting depth outside the call's opening brace.
    depth: usize,
    name: Option<String>,
    /// Nesting depth inside the arguments object, while inside it.
    args_depth: Option<usize>,
    /// Nesting depth inside a `function` object, while inside it.
    function_depth: Option<usize>,
    entity_key: Option<String>,
}

/// A string argument value being accumulated as it arrives.
#[derive(Debug)]
struct StreamingValue {
    key: String,
    emit: bool,
    is_entity_key: bool,
    segment_start: usize,
    decoder: Unescaper,
}

pub struct ToolCallParser {
    tracked: Vec<CompiledTrack>,
    buffer: String,
    pos: usize,
    stack: Vec<Container>,
    in_string: bool,
    escaped: bool,
    string_start: usize,
    string_role: StringRole,
    /// Last key string, until its `:` is seen.
    pending_key: Option<String>,
    /// Key whose value is being scanned.
    key: Option<String>,
    /// Depth inside the armed call array.
    array_depth: Option<usize>,
    seen_structure: bool,
    current: Option<OpenCall>,
    streaming: Option<StreamingValue>,
    completed: usize,
}

impl ToolCallParser {
    /// Create a parser streaming the given arguments.
    ///
    /// # Arguments
    /// * `tracked` - `(tool, argument)` glob pairs; `*` matches any run of
    ///   characters and everything else is literal
    pub fn new(tracked: &[TrackedArgument]) -> Result<Self, regex::Error> {
        let tracked = tracked
            .iter()
            .map(|t| {
                Ok(CompiledTrack {
                    tool: compile_glob(&t.tool)?,
                    argument: compile_glob(&t.argument)?,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;

        Ok(Self {
            tracked,
            buffer: String::new(),
            pos: 0,
            stack: Vec::new(),
            in_string: false,
            escaped: false,
            string_start: 0,
            string_role: StringRole::Element,
            pending_key: None,
            key: None,
            array_depth: None,
            seen_structure: false,
            current: None,
            streaming: None,
            completed: 0,
        })
    }

    /// Number of calls completed so far.
    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Feed the next chunk of model output.
    pub fn feed(&mut self, chunk: &str) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        self.buffer.push_str(chunk);

        while self.pos < self.buffer.len() {
            let i = self.pos;
            let b = self.buffer.as_bytes()[i];
            self.pos += 1;

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.end_string(i, &mut events);
                }
                continue;
            }

            match b {
                b'"' => self.begin_string(i),
                b':' => self.key = self.pending_key.take(),
                b',' => {
                    self.key = None;
                    self.pending_key = None;
                }
                b'{' => self.open(Container::Object, i),
                b'[' => self.open(Container::Array, i),
                b'}' | b']' => self.close(b, i, &mut events),
                _ => {}
            }
        }

        if self.in_string {
            self.flush_segment(self.buffer.len(), false, &mut events);
        }
        events
    }

    /// Salvage a call left open at end of stream.
    ///
    /// The unfinished object is repaired and reported if it parses; otherwise
    /// it is dropped. Never fails.
    pub fn finalize(&mut self) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        self.streaming = None;
        self.array_depth = None;

        let Some(open) = self.current.take() else {
            return events;
        };

        let tail = &self.buffer[open.start..];
        let salvaged = repair::repair_json(tail).and_then(|raw| {
            let value: Value = serde_json::from_str(&raw).ok()?;
            normalize_tool_call(&value).map(|call| (raw, call))
        });

        match salvaged {
            Some((raw, call)) => {
                debug!(index = open.index, "Recovered truncated tool call");
                events.push(ParserEvent::Completed(ParsedToolCall {
                    index: open.index,
                    raw,
                    call,
                }));
                self.completed += 1;
            }
            None => debug!(index = open.index, "Dropping unrepairable tool call fragment"),
        }
        events
    }

    fn depth(&self) -> usize {
        self.stack.len()
    }

    fn begin_string(&mut self, i: usize) {
        self.in_string = true;
        self.string_start = i + 1;

        self.string_role = match (self.stack.last(), self.key.take()) {
            (Some(Container::Object), Some(key)) => StringRole::Value(key),
            (Some(Container::Object), None) => StringRole::Key,
            _ => StringRole::Element,
        };

        let StringRole::Value(key) = &self.string_role else {
            return;
        };
        let Some(open) = &self.current else {
            return;
        };
        if open.args_depth != Some(self.depth()) {
            return;
        }

        let name = open.name.as_deref().unwrap_or("");
        let emit = self
            .tracked
            .iter()
            .any(|t| t.tool.is_match(name) && t.argument.is_match(key));
        let is_entity_key = key == ENTITY_KEY_ARGUMENT;
        if emit || is_entity_key {
            self.streaming = Some(StreamingValue {
                key: key.clone(),
                emit,
                is_entity_key,
                segment_start: i + 1,
                decoder: Unescaper::default(),
            });
        }
    }

    fn end_string(&mut self, i: usize, events: &mut Vec<ParserEvent>) {
        self.in_string = false;
        if self.streaming.is_some() {
            self.flush_segment(i, true, events);
            self.streaming = None;
        }

        let role = std::mem::replace(&mut self.string_role, StringRole::Element);
        match role {
            StringRole::Key => {
                self.pending_key = Some(decode_json_string(&self.buffer[self.string_start..i]));
            }
            StringRole::Value(key) => {
                let depth = self.depth();
                let Some(open) = self.current.as_mut() else {
                    return;
                };
                let at_call_level = depth == open.depth + 1;
                let in_function = open.function_depth == Some(depth);
                let names_tool = (at_call_level && NAME_KEYS.contains(&key.as_str()))
                    || (in_function && key == "name");
                if names_tool && open.name.is_none() {
                    open.name = Some(decode_json_string(&self.buffer[self.string_start..i]));
                }
            }
            StringRole::Element => {}
        }
    }

    /// Decode the open value's text up to `end` and report it.
    fn flush_segment(&mut self, end: usize, closing: bool, events: &mut Vec<ParserEvent>) {
        let (Some(streaming), Some(open)) = (self.streaming.as_mut(), self.current.as_mut()) else {
            return;
        };

        let mut new_text = streaming.decoder.push(&self.buffer[streaming.segment_start..end]);
        if closing {
            new_text.push_str(&streaming.decoder.finish());
        }
        streaming.segment_start = end;
        if new_text.is_empty() {
            return;
        }

        if streaming.is_entity_key {
            open.entity_key = Some(streaming.decoder.value().to_string());
        }
        if streaming.emit {
            events.push(ParserEvent::Delta(ToolCallDelta {
                index: open.index,
                tool_name: open.name.clone().unwrap_or_default(),
                argument_key: streaming.key.clone(),
                value: streaming.decoder.value().to_string(),
                new_text,
                entity_key: open.entity_key.clone(),
            }));
        }
    }

    fn open(&mut self, container: Container, i: usize) {
        let key = self.key.take();
        self.pending_key = None;
        let depth = self.depth();
        let first = !self.seen_structure;
        self.seen_structure = true;

        match container {
            Container::Array => {
                let names_array = key.as_deref().is_some_and(|k| ARRAY_KEYS.contains(&k));
                if self.array_depth.is_none() && self.current.is_none() && (names_array || (first && depth == 0)) {
                    self.array_depth = Some(depth + 1);
                }
            }
            Container::Object => {
                if self.current.is_none() && self.array_depth == Some(depth) {
                    self.current = Some(OpenCall {
                        index: self.completed,
                        start: i,
                        depth,
                        name: None,
                        args_depth: None,
                        function_depth: None,
                        entity_key: None,
                    });
                } else if let (Some(open), Some(key)) = (self.current.as_mut(), key.as_deref()) {
                    let at_call_level = depth == open.depth + 1;
                    let in_function = open.function_depth == Some(depth);
                    if ARG_KEYS.contains(&key) && (at_call_level || in_function) {
                        open.args_depth = Some(depth + 1);
                    } else if key == "function" && at_call_level {
                        open.function_depth = Some(depth + 1);
                    }
                }
            }
        }

        self.stack.push(container);
    }

    fn close(&mut self, b: u8, i: usize, events: &mut Vec<ParserEvent>) {
        self.key = None;
        self.pending_key = None;
        if self.stack.pop().is_none() {
            return;
        }
        let depth = self.depth();

        if let Some(open) = self.current.as_mut() {
            if open.args_depth.is_some_and(|d| depth < d) {
                open.args_depth = None;
            }
            if open.function_depth.is_some_and(|d| depth < d) {
                open.function_depth = None;
            }
            if b == b'}' && depth == open.depth {
                self.complete(i, events);
                return;
            }
        }

        if self.array_depth.is_some_and(|d| depth < d) {
            self.array_depth = None;
        }
    }

    fn complete(&mut self, end: usize, events: &mut Vec<ParserEvent>) {
        let Some(open) = self.current.take() else {
            return;
        };
        self.streaming = None;
        self.completed += 1;

        let raw = &self.buffer[open.start..=end];
        let call = serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|value| normalize_tool_call(&value));
        match call {
            Some(call) => events.push(ParserEvent::Completed(ParsedToolCall {
                index: open.index,
                raw: raw.to_string(),
                call,
            })),
            None => warn!(index = open.index, "Dropping malformed tool call object"),
        }
    }
}

/// Normalize the call shapes models produce into a [`ToolCall`].
///
/// Accepts `name`, `function` or `tool` for the name (also
/// `{"function":{"name":..,"arguments":..}}`) and `arguments`, `parameters`,
/// `params` or `args` for the arguments, which may be an object or a string
/// holding one.
pub fn normalize_tool_call(value: &Value) -> Option<ToolCall> {
    let obj = value.as_object()?;
    let function = obj.get("function").and_then(Value::as_object);

    let name = NAME_KEYS
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .or_else(|| function.and_then(|f| f.get("name")).and_then(Value::as_str))?;

    let arguments = ARG_KEYS
        .iter()
        .find_map(|k| obj.get(*k))
        .or_else(|| function.and_then(|f| ARG_KEYS.iter().find_map(|k| f.get(*k))));

    let arguments = match arguments {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(text)) => serde_json::from_str::<Map<String, Value>>(text).unwrap_or_default(),
        _ => Map::new(),
    };

    Some(ToolCall {
        name: name.to_string(),
        arguments,
    })
}
