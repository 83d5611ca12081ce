// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The agent's method table as seen by the controller.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use labwerk_core::error::{LabwerkError, Result};
use labwerk_core::types::NodeInfo;
use labwerk_core::{NodeIdentity, SharedRegistry};
use labwerk_print::PrintPipeline;
use labwerk_session::{Call, MethodHandler, Method, Payload};

pub struct AgentMethods {
    identity: NodeIdentity,
    registry: SharedRegistry,
    printer: PrintPipeline,
}

impl AgentMethods {
    pub fn new(identity: NodeIdentity, registry: SharedRegistry, printer: PrintPipeline) -> Self {
        Self {
            identity,
            registry,
            printer,
        }
    }

    async fn identify(&self) -> NodeInfo {
        NodeInfo {
            id: self.identity.id.clone(),
            name: self.identity.name.clone(),
            devices: self.registry.read().await.summaries(),
        }
    }
}

#[async_trait]
impl MethodHandler for AgentMethods {
    fn methods(&self) -> Vec<Method> {
        vec![Method::Identify, Method::Print]
    }

    async fn handle(&self, call: Call, payload: Payload) -> Result<Value> {
        match call {
            Call::Identify => {
                debug!("identify requested");
                Ok(serde_json::to_value(self.identify().await)?)
            }
            Call::Print { selector, copies } => {
                let report = self.printer.print(&selector, payload, &copies).await?;
                Ok(serde_json::to_value(report)?)
            }
            Call::ReportScan { .. } => Err(LabwerkError::UnknownMethod(
                Method::ReportScan.to_string(),
            )),
        }
    }
}
