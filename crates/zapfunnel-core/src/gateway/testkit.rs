//! In-memory gateway fake shared by the dispatcher/engine/event tests.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    domain::{InstanceName, Jid},
    errors::Error,
    gateway::{port::GatewayPort, types::Presence, types::SendIntent},
    Result,
};

#[derive(Clone, Debug)]
pub struct SendRecord {
    pub instance: InstanceName,
    pub recipient: Jid,
    pub intent: SendIntent,
}

/// Records every call; instances can be programmed to fail.
#[derive(Default)]
pub struct FakeGateway {
    sends: Mutex<Vec<SendRecord>>,
    presences: Mutex<Vec<(InstanceName, Jid, Presence)>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_instance(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn restore_instance(&self, name: &str) {
        self.failing.lock().unwrap().remove(name);
    }

    pub fn sends(&self) -> Vec<SendRecord> {
        self.sends.lock().unwrap().clone()
    }

    pub fn send_count(&self) -> usize {
        self.sends.lock().unwrap().len()
    }

    pub fn instances_used(&self) -> Vec<String> {
        self.sends
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.instance.0.clone())
            .collect()
    }

    pub fn presences(&self) -> Vec<(InstanceName, Jid, Presence)> {
        self.presences.lock().unwrap().clone()
    }
}

#[async_trait]
impl GatewayPort for FakeGateway {
    async fn send(
        &self,
        instance: &InstanceName,
        recipient: &Jid,
        intent: &SendIntent,
    ) -> Result<()> {
        if self.failing.lock().unwrap().contains(&instance.0) {
            return Err(Error::Gateway {
                message: format!("instance {instance} unreachable"),
                status: Some(503),
            });
        }
        self.sends.lock().unwrap().push(SendRecord {
            instance: instance.clone(),
            recipient: recipient.clone(),
            intent: intent.clone(),
        });
        Ok(())
    }

    async fn set_presence(
        &self,
        instance: &InstanceName,
        recipient: &Jid,
        presence: Presence,
    ) -> Result<()> {
        if self.failing.lock().unwrap().contains(&instance.0) {
            return Err(Error::Gateway {
                message: format!("instance {instance} unreachable"),
                status: Some(503),
            });
        }
        self.presences
            .lock()
            .unwrap()
            .push((instance.clone(), recipient.clone(), presence));
        Ok(())
    }
}
