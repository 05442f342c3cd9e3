//! Platform strategies - how targets are discovered, selected by name

use super::{NoDiscovery, ServiceRef, StaticDiscovery, TargetProvider};
use crate::error::{Error, Result};
use std::sync::Arc;

/// Names accepted by [`platform_from_name`]
pub const PLATFORM_STRATEGIES: [&str; 2] = ["none", "static"];

/// Construct the discovery strategy registered under `name`.
///
/// Without a name the strategy is detected: `static` when services are
/// configured, else `none`.
pub fn platform_from_name(
    name: Option<&str>,
    services: Vec<ServiceRef>,
) -> Result<Arc<dyn TargetProvider>> {
    let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => name,
        None if services.is_empty() => "none",
        None => "static",
    };
    match name {
        "none" => {
            if !services.is_empty() {
                tracing::warn!(
                    "Platform strategy \"none\" ignores {} configured service(s)",
                    services.len()
                );
            }
            Ok(Arc::new(NoDiscovery))
        }
        "static" => {
            tracing::info!("Discovering {} static service(s)", services.len());
            Ok(Arc::new(StaticDiscovery::new(services)))
        }
        other => Err(Error::Internal(format!(
            "Selected platform strategy \"{}\" is not available (known: {})",
            other,
            PLATFORM_STRATEGIES.join(", ")
        ))),
    }
}
