//! Undo/redo transactions
//!
//! Each top-level operation processed by the dispatcher becomes one
//! [`Transaction`]. Retained publishes contribute a `(topic, previous)`
//! undo step and a `(topic, next)` redo step. Commands contribute the
//! reversal returned by their handler and re-issue themselves on redo.
//!
//! Undo replays the undo steps newest first; redo replays the redo steps
//! in recording order.

use crate::subscription::Reversal;
use crate::value::Value;
use std::collections::VecDeque;

/// One replayable publish. `None` clears the retained value.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub topic: String,
    pub value: Option<Value>,
}

impl Step {
    fn new(topic: &str, value: Option<Value>) -> Self {
        Self {
            topic: topic.to_string(),
            value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    /// Topic of the operation that opened the transaction, for logging.
    pub origin: String,
    pub undo: Vec<Step>,
    pub redo: Vec<Step>,
}

impl Transaction {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.undo.is_empty() && self.redo.is_empty()
    }

    pub fn record_publish(&mut self, topic: &str, previous: Option<Value>, next: Value) {
        self.undo.push(Step::new(topic, previous));
        self.redo.push(Step::new(topic, Some(next)));
    }

    /// Record a command. The reversal publishes are undone as a group, in
    /// the order the handler listed them.
    pub fn record_command(&mut self, topic: &str, value: Value, reversal: Reversal) {
        for (t, v) in reversal.into_iter().rev() {
            self.undo.push(Step::new(&t, Some(v)));
        }
        self.redo.push(Step::new(topic, Some(value)));
    }

    /// Steps to replay for undo, newest first.
    pub fn undo_steps(&self) -> impl Iterator<Item = &Step> {
        self.undo.iter().rev()
    }

    pub fn redo_steps(&self) -> impl Iterator<Item = &Step> {
        self.redo.iter()
    }
}

/// Bounded undo stack with its redo stack.
#[derive(Debug)]
pub struct UndoStack {
    undos: VecDeque<Transaction>,
    redos: Vec<Transaction>,
    capacity: usize,
}

impl UndoStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            undos: VecDeque::new(),
            redos: Vec::new(),
            capacity,
        }
    }

    /// Push a new transaction. Invalidates the redo stack.
    pub fn push(&mut self, tx: Transaction) {
        if tx.is_empty() {
            return;
        }
        self.redos.clear();
        self.undos.push_back(tx);
        while self.undos.len() > self.capacity {
            self.undos.pop_front();
        }
    }

    pub fn pop_undo(&mut self) -> Option<Transaction> {
        self.undos.pop_back()
    }

    pub fn pop_redo(&mut self) -> Option<Transaction> {
        self.redos.pop()
    }

    /// Move an undone transaction to the redo stack.
    pub fn push_redo(&mut self, tx: Transaction) {
        self.redos.push(tx);
    }

    /// Return a redone transaction to the undo stack, keeping redos.
    pub fn push_undone(&mut self, tx: Transaction) {
        self.undos.push_back(tx);
        while self.undos.len() > self.capacity {
            self.undos.pop_front();
        }
    }

    pub fn undo_len(&self) -> usize {
        self.undos.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redos.len()
    }

    pub fn clear(&mut self) {
        self.undos.clear();
        self.redos.clear();
    }
}
