use super::{ParserEvent, ToolCallParser};
use crate::error::LlmError;
use futures::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;

struct StreamState<S> {
    chunks: S,
    parser: ToolCallParser,
    pending: VecDeque<ParserEvent>,
    done: bool,
}

/// Lazily parse a stream of model output chunks.
///
/// Events are yielded as soon as the chunk completing them arrives. The
/// parser is finalized when the chunk stream ends; an upstream error is
/// passed through and ends the stream.
pub fn parse_tool_call_stream<S>(
    chunks: S,
    parser: ToolCallParser,
) -> impl Stream<Item = Result<ParserEvent, LlmError>>
where
    S: Stream<Item = Result<String, LlmError>> + Unpin,
{
    let state = StreamState {
        chunks,
        parser,
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }

            match state.chunks.next().await {
                Some(Ok(chunk)) => {
                    let events = state.parser.feed(&chunk);
                    state.pending.extend(events);
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.done = true;
                    let events = state.parser.finalize();
                    state.pending.extend(events);
                }
            }
        }
    })
}
