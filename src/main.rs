// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context, Result};
use svcctl_client::{
    aggregator::{
        AllocateQuotaRequest, AllocateQuotaResponse, CheckRequest, CheckResponse, ReportRequest,
    },
    cfg::{cli::resolve_config_path, config::Configuration, logger::init_logger},
    client::Client,
    model::{Importance, Operation, Timestamp},
    thread_factory::StdThreadFactory,
    ticker::SystemTicker,
    transport::Transport,
};
use tracing::info;

/// A toy in-memory `Transport` that always grants/allows, standing in
/// for a real RPC client to the control plane.
struct DemoTransport;

impl Transport for DemoTransport {
    fn check(&self, _service_name: &str, req: &CheckRequest) -> Result<CheckResponse, svcctl_client::Error> {
        Ok(CheckResponse {
            operation_id: req.operation.operation_id.clone(),
            attributes: Default::default(),
        })
    }

    fn allocate_quota(
        &self,
        _service_name: &str,
        req: &AllocateQuotaRequest,
    ) -> Result<AllocateQuotaResponse, svcctl_client::Error> {
        let mut granted_amounts = BTreeMap::new();
        for (metric, _) in req.operation.requested_amounts() {
            granted_amounts.insert(metric.to_string(), 100);
        }
        Ok(AllocateQuotaResponse {
            operation_id: req.operation.operation_id.clone(),
            granted_amounts,
        })
    }

    fn report(&self, service_name: &str, req: &ReportRequest) -> Result<(), svcctl_client::Error> {
        info!(service_name, operations = req.operations.len(), "reported");
        Ok(())
    }
}

fn operation(name: &str) -> Operation {
    Operation {
        operation_id: format!("{name}-1"),
        operation_name: name.to_string(),
        consumer_id: "demo-consumer".to_string(),
        start_time: Timestamp::new(0, 0),
        end_time: Timestamp::new(1, 0),
        labels: BTreeMap::new(),
        metric_value_sets: vec![],
        importance: Importance::Low,
    }
}

fn main() -> Result<()> {
    let _init_logger = init_logger("logger.yaml")?;

    let config = resolve_config_path("config.yaml")
        .and_then(Configuration::load_from_file)
        .unwrap_or_default();

    let client = Client::new(
        config.clone(),
        Arc::new(DemoTransport),
        Arc::new(StdThreadFactory),
        SystemTicker::shared(),
    );
    client.start().context("failed to start client")?;

    let check_req = CheckRequest {
        service_name: config.facade.service_name.clone(),
        operation: operation("DemoCheck"),
    };
    let check_resp = client.check(check_req).context("check failed")?;
    info!(?check_resp, "check result");

    let quota_req = AllocateQuotaRequest {
        service_name: config.facade.service_name.clone(),
        operation: operation("DemoQuota"),
    };
    let quota_resp = client.allocate_quota(quota_req).context("quota failed")?;
    info!(?quota_resp, "quota result");

    let report_req = ReportRequest {
        service_name: config.facade.service_name.clone(),
        operations: vec![operation("DemoReport")],
    };
    client.report(report_req).context("report failed")?;

    info!(stats = ?client.stats(), "final statistics");
    client.stop().context("failed to stop client")?;
    Ok(())
}
