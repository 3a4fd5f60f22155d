//! Illustrative built-in handlers for the four job kinds. The
//! trading/analytics math itself is out of scope —
//! each handler validates its `parameters` shape and produces a
//! deterministic placeholder `result`, just enough to drive a worker
//! process end to end and exercise the dispatch/retry/progress machinery
//! in `fintask_core`.

mod data_import;
mod portfolio_analysis;
mod price_update;
mod technical_analysis;

use std::sync::Arc;

use fintask_core::HandlerRegistry;

/// Registers the four built-in kinds. Called once at worker startup;
/// the registry is closed to further registration after this.
pub fn register_builtin_handlers(registry: &mut HandlerRegistry) {
    registry.register("technical_analysis", || {
        Arc::new(technical_analysis::TechnicalAnalysisHandler)
    });
    registry.register("price_update", || Arc::new(price_update::PriceUpdateHandler));
    registry.register("data_import", || Arc::new(data_import::DataImportHandler));
    registry.register("portfolio_analysis", || {
        Arc::new(portfolio_analysis::PortfolioAnalysisHandler)
    });
}

/// Shared helper: pull a required string field out of `parameters`,
/// failing with a descriptive error rather than panicking on malformed
/// input.
fn require_str<'a>(parameters: &'a serde_json::Value, field: &str) -> anyhow::Result<&'a str> {
    parameters
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("parameters.{field} must be a string"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_all_four_builtin_kinds() {
        let mut registry = HandlerRegistry::new();
        register_builtin_handlers(&mut registry);
        for kind in [
            "technical_analysis",
            "price_update",
            "data_import",
            "portfolio_analysis",
        ] {
            assert!(registry.contains(kind), "missing handler for {kind}");
        }
    }
}
