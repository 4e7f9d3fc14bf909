//! Outbound lifecycle signals.

/// A tagged event from the outbound message sequence of a request/response
/// or streaming exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundSignal {
    /// The response head (status and headers) is going out.
    ResponseStarted { status: u16 },
    /// A chunk of the response body is going out.
    ResponseChunk,
    /// The peer went away before the exchange completed.
    ClientDisconnected,
    /// An outbound message on a long-lived stream.
    StreamMessage,
    /// The peer disconnected from a long-lived stream.
    StreamDisconnected,
    /// A long-lived stream was closed from this side.
    StreamClosed,
}

impl OutboundSignal {
    /// Whether this signal ends the scope's need for its leased connection.
    ///
    /// The terminus set is fixed: the response head going out, either side
    /// disconnecting, or the stream closing. Body chunks and stream
    /// messages are not terminal.
    pub fn is_terminus(&self) -> bool {
        matches!(
            self,
            OutboundSignal::ResponseStarted { .. }
                | OutboundSignal::ClientDisconnected
                | OutboundSignal::StreamDisconnected
                | OutboundSignal::StreamClosed
        )
    }
}
