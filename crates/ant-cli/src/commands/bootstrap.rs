//! Bootstrap command: obtain a signed certificate if none is present.

use ant_agent::{AgentSettings, AntClient, BootstrapOutcome};
use tracing::info;

use super::cancel_on_interrupt;
use crate::Result;

pub async fn run(settings: AgentSettings) -> Result<()> {
    let crt = settings.tls.crt.clone();
    let cancel = cancel_on_interrupt();
    match AntClient::new(settings).bootstrap(&cancel).await? {
        BootstrapOutcome::Skipped => {
            println!("Certificate already present: {}", crt.display());
        }
        BootstrapOutcome::Enrolled { identity } => {
            info!(identity = %identity, "Bootstrap complete");
            println!("Certificate for {} stored in {}", identity, crt.display());
        }
        BootstrapOutcome::Cancelled => {
            println!("Bootstrap interrupted, no certificate stored");
        }
    }
    Ok(())
}
