//! Start command: bootstrap if needed, then stream to marabunta until
//! interrupted.

use ant_agent::{AgentSettings, AntClient, BootstrapOutcome};
use tokio_util::sync::CancellationToken;

use super::cancel_on_interrupt;
use crate::Result;

pub async fn run(settings: AgentSettings) -> Result<()> {
    serve(AntClient::new(settings), cancel_on_interrupt()).await
}

async fn serve(ant: AntClient, cancel: CancellationToken) -> Result<()> {
    if ant.bootstrap(&cancel).await? == BootstrapOutcome::Cancelled {
        return Ok(());
    }
    ant.run(cancel).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::time::Duration;

    #[tokio::test]
    async fn unusable_credentials_stop_before_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AgentSettings::new(dir.path());
        std::fs::write(&settings.tls.crt, "not a certificate").unwrap();
        std::fs::write(&settings.tls.key, "not a key").unwrap();

        let err = serve(AntClient::new(settings), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Agent(_)));
        assert!(err.to_string().contains("ant.crt"));
    }

    #[tokio::test]
    async fn interrupt_during_enrollment_is_a_clean_shutdown() {
        ant_agent::install_crypto_provider();
        let dir = tempfile::tempdir().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let held = tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let mut settings = AgentSettings::new(dir.path());
        settings.enrollment.url = format!("https://{}/", addr);
        settings.enrollment.insecure = true;
        settings.bootstrap_attempts = 2;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            serve(AntClient::new(settings), cancel),
        )
        .await
        .expect("serve ignored the interrupt");

        assert!(result.is_ok());
        held.abort();
    }
}
