// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::{
    aggregator::{
        AllocateQuotaRequest, AllocateQuotaResponse, CheckRequest, CheckResponse, ReportRequest,
    },
    error::Result,
};

/// The upstream service-control plane, consumed synchronously and
/// blocking (spec §6 "Transport"). Wire encoding and the connection to
/// a concrete backend are out of scope; implementors bring their own.
pub trait Transport: Send + Sync {
    fn check(&self, service_name: &str, req: &CheckRequest) -> Result<CheckResponse>;

    fn allocate_quota(
        &self,
        service_name: &str,
        req: &AllocateQuotaRequest,
    ) -> Result<AllocateQuotaResponse>;

    fn report(&self, service_name: &str, req: &ReportRequest) -> Result<()>;
}
