use std::collections::BTreeMap;

use crate::command::{Command, Priority};

/// A queued command together with whatever its submitter is waiting on.
#[derive(Debug)]
pub struct Entry<T> {
    pub command: Command,
    pub responder: T,
}

/// Pending commands ordered by `(priority, sequence)`.
///
/// The head that the dispatcher has put on the wire is pinned as the
/// in-flight entry: later arrivals, however urgent, queue behind it until
/// it reaches a terminal outcome. The pending set never holds two
/// `Emergency` commands.
#[derive(Debug)]
pub struct PriorityCommandQueue<T> {
    pending: BTreeMap<(Priority, u64), Entry<T>>,
    in_flight: Option<Entry<T>>,
}

impl<T> Default for PriorityCommandQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityCommandQueue<T> {
    pub fn new() -> Self {
        Self { pending: BTreeMap::new(), in_flight: None }
    }

    /// Inserts a command. An `Emergency` command first evicts any pending
    /// `Emergency` command, which is returned so its submitter can be told.
    pub fn enqueue(&mut self, command: Command, responder: T) -> Vec<Entry<T>> {
        let superseded = if command.priority == Priority::Emergency {
            self.cancel_superseded(Priority::Emergency)
        } else {
            Vec::new()
        };

        self.pending.insert((command.priority, command.sequence), Entry { command, responder });
        superseded
    }

    /// Removes every pending (not in-flight) command of `priority`.
    pub fn cancel_superseded(&mut self, priority: Priority) -> Vec<Entry<T>> {
        let keys: Vec<_> = self.pending.range((priority, 0)..=(priority, u64::MAX)).map(|(k, _)| *k).collect();
        keys.into_iter().filter_map(|k| self.pending.remove(&k)).collect()
    }

    /// The in-flight command if there is one, otherwise the next to send.
    pub fn peek(&self) -> Option<&Command> {
        match &self.in_flight {
            Some(entry) => Some(&entry.command),
            None => self.pending.values().next().map(|e| &e.command),
        }
    }

    /// Pins the head as in flight and returns it. Returns the already
    /// pinned entry if there is one.
    pub fn start_head(&mut self) -> Option<&mut Entry<T>> {
        if self.in_flight.is_none() {
            self.in_flight = self.pending.pop_first().map(|(_, e)| e);
        }
        self.in_flight.as_mut()
    }

    pub fn in_flight(&self) -> Option<&Entry<T>> {
        self.in_flight.as_ref()
    }

    /// Removes the head once it has a terminal outcome.
    pub fn pop_on_ack(&mut self) -> Option<Entry<T>> {
        self.in_flight
            .take()
            .or_else(|| self.pending.pop_first().map(|(_, e)| e))
    }

    /// Empties the queue, in-flight entry first, then in dispatch order.
    pub fn drain(&mut self) -> Vec<Entry<T>> {
        let mut all: Vec<_> = self.in_flight.take().into_iter().collect();
        all.extend(std::mem::take(&mut self.pending).into_values());
        all
    }

    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
