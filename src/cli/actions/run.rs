use super::Action;
use crate::tls::probe_server;
use chrono::{SecondsFormat, Utc};

/// Execute the action's business logic by delegating to the appropriate module
pub async fn execute(action: Action) -> anyhow::Result<()> {
    match action {
        Action::Serve(args) => crate::serve::start(args).await,
        Action::Probe(args) => {
            let report =
                probe_server(&args.host, args.port, args.client_auth.as_ref(), &args.message)
                    .await?;

            println!(
                "{} - {}",
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                serde_json::to_string(&report)?
            );

            if report.echoed != report.sent {
                anyhow::bail!(
                    "echo mismatch: sent {:?}, received {:?}",
                    report.sent,
                    report.echoed
                );
            }
            Ok(())
        }
    }
}
