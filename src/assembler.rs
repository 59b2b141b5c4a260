//! Reassembly of policy requests from the attribute lines of one connection.
//!
//! Every request is a run of `name=value` lines closed by a blank line. The
//! assembler collects the lines, recognises the closing blank line and decides
//! whether the finished request describes a new delegation call, or repeats the
//! one that was emitted last on this connection.

use serde::Deserialize;

use crate::{attributes::Attributes, traits::FiniteStateMachine};

/// What to do with an attribute line that carries no `=`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MalformedLinePolicy {
    /// Discard the line
    #[default]
    Drop,
    /// Keep the whole line as an attribute name with an empty value
    StoreAsKey,
    /// Keep the whole line as the value of the empty attribute name
    StoreAsValue,
}

/// One line of input, stripped of its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Blank,
    Attribute { key: String, value: String },
    Malformed(String),
}

impl Line {
    /// Split on the first `=`; anything after it, further `=` included, is the value.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            return Self::Blank;
        }

        match raw.split_once('=') {
            Some((key, value)) => Self::Attribute {
                key: key.to_string(),
                value: value.to_string(),
            },
            None => Self::Malformed(raw.to_string()),
        }
    }
}

/// Outcome of a blank line closing a non-empty request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Boundary {
    /// A new delegation call; these attributes must be forwarded.
    Emit(Attributes),
    /// Same instance as the last forwarded request on this connection.
    Duplicate,
    /// Every line of the request was dropped; there is nothing to forward.
    Discarded,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum State {
    #[default]
    Accumulating,
    /// Transient: the request just closed. The client must be acknowledged.
    Boundary(Boundary),
    /// The request grew past the configured number of attributes.
    Overflow(usize),
}

#[derive(Debug, Default)]
pub struct Context {
    attributes: Attributes,
    /// `None` until something was emitted, then the instance of that request
    /// (itself `None` when the client did not send one).
    last_instance: Option<Option<String>>,
    malformed: MalformedLinePolicy,
    max_attributes: Option<usize>,
    /// Lines were dropped since the last boundary
    dropped: bool,
}

impl Context {
    fn store(&mut self, key: String, value: String) -> State {
        if let Some(limit) = self.max_attributes {
            if self.attributes.len() >= limit && !self.attributes.contains_key(&key) {
                return State::Overflow(limit);
            }
        }

        self.attributes.insert(key, value);
        State::Accumulating
    }

    fn close(&mut self) -> State {
        let dropped = std::mem::take(&mut self.dropped);

        if self.attributes.is_empty() {
            // The client still waits for an answer to a request of dropped lines
            if dropped {
                return State::Boundary(Boundary::Discarded);
            }

            // Clients send a lone blank line on teardown; that is not a request
            return State::Accumulating;
        }

        let attributes = std::mem::take(&mut self.attributes);
        let instance = attributes.instance();

        if self.last_instance.as_ref().is_some_and(|last| last.as_deref() == instance) {
            tracing::debug!(?instance, "Repeated instance, not forwarding");
            return State::Boundary(Boundary::Duplicate);
        }

        self.last_instance = Some(instance.map(str::to_string));
        State::Boundary(Boundary::Emit(attributes))
    }
}

impl FiniteStateMachine for State {
    type Input = Line;
    type Context = Context;

    fn transition(self, input: Self::Input, context: &mut Self::Context) -> Self {
        if let Self::Overflow(limit) = self {
            return Self::Overflow(limit);
        }

        match input {
            Line::Blank => context.close(),
            Line::Attribute { key, value } => context.store(key, value),
            Line::Malformed(line) => match context.malformed {
                MalformedLinePolicy::Drop => {
                    tracing::debug!(%line, "Dropping attribute line without '='");
                    context.dropped = true;
                    Self::Accumulating
                }
                MalformedLinePolicy::StoreAsKey => context.store(line, String::new()),
                MalformedLinePolicy::StoreAsValue => context.store(String::new(), line),
            },
        }
    }
}

/// Per connection request assembler
#[derive(Debug, Default)]
pub struct Assembler {
    state: State,
    context: Context,
}

impl Assembler {
    #[must_use]
    pub fn new(malformed: MalformedLinePolicy, max_attributes: Option<usize>) -> Self {
        Self {
            state: State::Accumulating,
            context: Context {
                malformed,
                max_attributes,
                ..Context::default()
            },
        }
    }

    /// Feed one line, without its terminator, and return the state it led to.
    pub fn feed(&mut self, raw: &str) -> &State {
        let state = std::mem::take(&mut self.state);
        self.state = state.transition(Line::parse(raw), &mut self.context);
        &self.state
    }
}
