// Provisioner bindings
// Decision: The server picks one implementation at startup; the engine only sees Provisioners

pub mod http;
pub mod simulated;

use std::sync::Arc;

use anyhow::Result;
use graduation_core::Provisioners;

use crate::config::{ProvisionerKind, ServerConfig};

pub use http::HttpProvisioner;
pub use simulated::SimulatedProvisioner;

/// Build the provisioners selected by the configuration
pub fn build(config: &ServerConfig) -> Result<Provisioners> {
    let provisioners = match config.provisioners {
        ProvisionerKind::Simulated => {
            Provisioners::from_single(Arc::new(SimulatedProvisioner::new()))
        }
        ProvisionerKind::Http => {
            Provisioners::from_single(Arc::new(HttpProvisioner::new(&config.provisioner)?))
        }
    };
    tracing::info!(kind = %config.provisioners, "provisioners configured");
    Ok(provisioners)
}
