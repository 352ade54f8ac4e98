use std::sync::Arc;

use dashmap::DashMap;

use crate::control::Control;
use crate::reporting::{ClientReport, TunnelReport};

/// Live control sessions keyed by client id
///
/// The single source of truth for "is this client connected". At most one control
/// per id; a newer session replaces and closes the older one.
#[derive(Default)]
pub struct ControlRegistry {
    controls: DashMap<String, Arc<Control>>,
}

impl ControlRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a control, returning the session it superseded
    pub fn add(&self, control: Arc<Control>) -> Option<Arc<Control>> {
        let previous = self
            .controls
            .insert(control.client_id().to_string(), control.clone());

        match previous {
            Some(old) if !Arc::ptr_eq(&old, &control) => {
                tracing::info!(
                    client_id = %control.client_id(),
                    old = old.id(),
                    new = control.id(),
                    "Replacing existing control session"
                );
                old.shutdown("superseded by a new session");
                Some(old)
            }
            _ => None,
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Control>> {
        self.controls.get(client_id).map(|entry| entry.value().clone())
    }

    /// Deregister `control`, but only if it is still the registered instance
    pub fn remove(&self, control: &Arc<Control>) -> bool {
        self.controls
            .remove_if(control.client_id(), |_, current| Arc::ptr_eq(current, control))
            .is_some()
    }

    /// Point-in-time view of connected clients and their tunnels
    pub fn snapshot(&self) -> Vec<ClientReport> {
        // Copy handles out first so no shard lock is held while reading controls
        let controls: Vec<Arc<Control>> = self
            .controls
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut reports: Vec<ClientReport> = controls
            .iter()
            .filter(|control| control.is_active())
            .map(|control| ClientReport {
                client_id: control.client_id().to_string(),
                version: control.version().to_string(),
                connected_at: control.connected_at(),
                tunnels: control
                    .tunnels()
                    .iter()
                    .map(|tunnel| TunnelReport {
                        url: tunnel.url().to_string(),
                        protocol: tunnel.protocol(),
                        remote_port: tunnel.remote_port(),
                        local_addr: tunnel.local_addr().to_string(),
                    })
                    .collect(),
            })
            .collect();
        reports.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        reports
    }

    /// Close every session (server shutdown)
    pub fn close_all(&self) {
        let controls: Vec<Arc<Control>> = self
            .controls
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for control in controls {
            control.shutdown("server shutting down");
        }
    }

    pub fn len(&self) -> usize {
        self.controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }
}
