//! Per-peer secure-conversation status machine.
//!
//! {idle → pending → ready, any → failed, failed → idle on explicit reset}.
//! Subscribers run synchronously, in registration order, on every accepted
//! transition; a panicking listener is isolated and the rest still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureStatus {
    Idle,
    Pending,
    Ready,
    Failed,
}

type Listener = Box<dyn Fn(&str, SecureStatus, SecureStatus) + Send + Sync>;

pub struct StatusBoard {
    states: Mutex<HashMap<String, SecureStatus>>,
    listeners: Mutex<Vec<Listener>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, peer_key: &str) -> SecureStatus {
        *self
            .states
            .lock()
            .expect("status lock")
            .get(peer_key)
            .unwrap_or(&SecureStatus::Idle)
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&str, SecureStatus, SecureStatus) + Send + Sync + 'static,
    {
        self.listeners.lock().expect("listener lock").push(Box::new(listener));
    }

    fn allowed(from: SecureStatus, to: SecureStatus) -> bool {
        use SecureStatus::*;
        match (from, to) {
            (Idle, Pending) => true,
            // A hydrated vault can show a peer ready with no local attempt.
            (Idle, Ready) => true,
            (Pending, Ready) => true,
            // Any live state may fail; failed is sticky until reset.
            (Idle, Failed) | (Pending, Failed) | (Ready, Failed) => true,
            // Losing readiness (e.g. DR state dropped) re-enters pending.
            (Ready, Pending) => true,
            _ => false,
        }
    }

    /// Apply a transition; returns whether it was accepted. `failed` never
    /// leaves except through `reset`.
    pub fn transition(&self, peer_key: &str, to: SecureStatus) -> bool {
        let from = {
            let mut states = self.states.lock().expect("status lock");
            let from = *states.get(peer_key).unwrap_or(&SecureStatus::Idle);
            if from == to || !Self::allowed(from, to) {
                return false;
            }
            states.insert(peer_key.to_string(), to);
            from
        };
        self.notify(peer_key, from, to);
        true
    }

    /// The only way out of `failed`.
    pub fn reset(&self, peer_key: &str) {
        let from = {
            let mut states = self.states.lock().expect("status lock");
            let from = *states.get(peer_key).unwrap_or(&SecureStatus::Idle);
            states.insert(peer_key.to_string(), SecureStatus::Idle);
            from
        };
        if from != SecureStatus::Idle {
            self.notify(peer_key, from, SecureStatus::Idle);
        }
    }

    fn notify(&self, peer_key: &str, from: SecureStatus, to: SecureStatus) {
        let listeners = self.listeners.lock().expect("listener lock");
        for listener in listeners.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| listener(peer_key, from, to)));
            if result.is_err() {
                tracing::error!(
                    target: "sentry_engine",
                    event = "status_listener_panicked",
                    peer_key = %peer_key
                );
            }
        }
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}
