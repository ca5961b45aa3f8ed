//! Comm management.
//!
//! Comms are named side channels between the front-end and handlers
//! registered in the kernel. Handlers run on the execution worker, so they
//! are ordered with cell executions and can be interrupted like them.

use std::sync::{Arc, PoisonError, RwLock};

use ember_core::Fault;
use rustc_hash::FxHashMap;
use serde_json::Value;

/// Kind of the fault raised when a comm cannot be opened.
pub const COMM_OPEN_FAULT_KIND: &str = "CommOpenError";

/// An open comm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommInfo {
    pub comm_id: String,
    pub target_name: String,
}

/// Handler for comms opened against one target name.
pub trait CommTarget: Send + Sync {
    fn on_open(&self, _comm_id: &str, _data: &Value) -> Result<(), Fault> {
        Ok(())
    }

    /// Handle a message. Returned data is sent back on the same comm.
    fn on_message(&self, comm_id: &str, data: &Value) -> Result<Option<Value>, Fault>;

    fn on_close(&self, _comm_id: &str, _data: &Value) -> Result<(), Fault> {
        Ok(())
    }
}

/// The kernel's view of comm bookkeeping.
pub trait CommManager: Send + Sync {
    /// Open `comm_id` against `target_name`. Fails when the target is
    /// unknown or its handler refuses.
    fn open(&self, comm_id: &str, target_name: &str, data: &Value) -> Result<(), Fault>;

    fn message(&self, comm_id: &str, data: &Value) -> Result<Option<Value>, Fault>;

    fn close(&self, comm_id: &str, data: &Value) -> Result<(), Fault>;

    /// Open comms, optionally restricted to one target.
    fn comms(&self, target_name: Option<&str>) -> Vec<CommInfo>;
}

/// Comm manager keeping targets and open comms in memory.
#[derive(Default)]
pub struct InMemoryCommManager {
    targets: RwLock<FxHashMap<String, Arc<dyn CommTarget>>>,
    open: RwLock<FxHashMap<String, String>>,
}

impl InMemoryCommManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `target_name`, replacing any previous one.
    pub fn register_target(&self, target_name: impl Into<String>, target: Arc<dyn CommTarget>) {
        self.targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target_name.into(), target);
    }

    fn target_of(&self, comm_id: &str) -> Option<Arc<dyn CommTarget>> {
        let target_name = self
            .open
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(comm_id)
            .cloned()?;
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&target_name)
            .cloned()
    }
}

impl CommManager for InMemoryCommManager {
    fn open(&self, comm_id: &str, target_name: &str, data: &Value) -> Result<(), Fault> {
        let target = self
            .targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target_name)
            .cloned();
        let Some(target) = target else {
            return Err(Fault::new(
                COMM_OPEN_FAULT_KIND,
                format!("Cannot open comm for {} of target {}", comm_id, target_name),
            ));
        };

        target.on_open(comm_id, data)?;
        self.open
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(comm_id.to_string(), target_name.to_string());
        tracing::debug!(comm_id, target_name, "comm opened");
        Ok(())
    }

    fn message(&self, comm_id: &str, data: &Value) -> Result<Option<Value>, Fault> {
        match self.target_of(comm_id) {
            Some(target) => target.on_message(comm_id, data),
            None => {
                tracing::debug!(comm_id, "message for unknown comm ignored");
                Ok(None)
            }
        }
    }

    fn close(&self, comm_id: &str, data: &Value) -> Result<(), Fault> {
        let target = self.target_of(comm_id);
        self.open
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(comm_id);
        match target {
            Some(target) => target.on_close(comm_id, data),
            None => Ok(()),
        }
    }

    fn comms(&self, target_name: Option<&str>) -> Vec<CommInfo> {
        let open = self.open.read().unwrap_or_else(PoisonError::into_inner);
        let mut comms: Vec<CommInfo> = open
            .iter()
            .filter(|(_, target)| target_name.is_none_or(|wanted| wanted == target.as_str()))
            .map(|(comm_id, target)| CommInfo {
                comm_id: comm_id.clone(),
                target_name: target.clone(),
            })
            .collect();
        comms.sort_by(|a, b| a.comm_id.cmp(&b.comm_id));
        comms
    }
}

/// Target that sends every message straight back.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoComm;

impl CommTarget for EchoComm {
    fn on_message(&self, _comm_id: &str, data: &Value) -> Result<Option<Value>, Fault> {
        Ok(Some(data.clone()))
    }
}
