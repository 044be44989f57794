//! Flavor metadata.

use super::assert::{ensure_eq, expect_status};
use super::{ResourceLedger, ScenarioFuture, SuiteContext, SuiteTransport};
use crate::compute::{ApiRequest, ComputeApi, Flavor};

/// Fetches flavor 1 and checks its advertised size.
pub fn flavor_details<'a, A, T>(
    ctx: &'a SuiteContext<A, T>,
    _ledger: &'a mut ResourceLedger,
) -> ScenarioFuture<'a>
where
    A: ComputeApi + 'static,
    T: SuiteTransport,
{
    Box::pin(async move {
        let response = ctx.api().send(ApiRequest::get("/flavors/1")).await?;
        expect_status("get flavor 1", &response, 200)?;
        let flavor = Flavor::from_envelope("get flavor 1", &response.body)?;
        ensure_eq("flavor ram", &512, &flavor.ram)?;
        ensure_eq("flavor disk", &0, &flavor.disk)
    })
}
