//! A small Server-Sent Events (SSE) frame builder.
//!
//! Frames are rendered to strings before they enter the reply channel, so
//! the builder controls the exact wire format, including the space after
//! the `data:` field name that some clients insist on.

use std::fmt;

/// One SSE frame. Build with the fluent setters, render with `to_string()`.
///
/// # Example
///
/// ```
/// # use xcproxy::proxy::helper::sse::Event;
/// let event = Event::default()
///     .event("message_start")
///     .data("{}")
///     .to_string();
/// assert_eq!(event, "event: message_start\ndata: {}\n\n");
/// ```
#[derive(Debug, Default, Clone)]
pub struct Event {
    event: Option<String>,
    data: Option<String>,
}

impl Event {
    /// Sets the `event` field (the event type).
    pub fn event<T: Into<String>>(mut self, event: T) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Sets the `data` field. Embedded newlines split into multiple
    /// `data:` lines per the SSE spec.
    pub fn data<T: Into<String>>(mut self, data: T) -> Self {
        self.data = Some(data.into());
        self
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(event) = &self.event {
            write!(f, "event: {}\n", event)?;
        }
        if let Some(data) = &self.data {
            if data.is_empty() {
                // The spec still wants a data line when the payload is empty.
                f.write_str("data: \n")?;
            } else {
                for line in data.lines() {
                    write!(f, "data: {}\n", line)?;
                }
            }
        }
        // A frame is terminated by a blank line.
        f.write_str("\n")
    }
}
